//! Declarative permission rules and their compiled, content-hashed form.

pub mod compiler;
pub mod plan;
pub mod types;

pub use compiler::{compile_column_rule, compile_rules, owner_rule};
pub use plan::{DispatchEntry, RelationSchema, ResourceSchema, SchemaPlan, TableRef};
pub use types::{
    ColumnRuleConfig, GroupNameConfig, GroupNamer, GroupPropagationConfig, IndirectTarget, Rule,
    RuleConfig, RuleKind,
};

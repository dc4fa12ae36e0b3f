pub mod builders;
pub mod db;

pub use builders::{docs_plan, Audit, ColumnRuleBuilder, PropagationRuleBuilder};
pub use db::{grant_snapshot, TestDb};

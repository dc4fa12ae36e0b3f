use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::audit::Row;
use crate::rules::plan::{DispatchEntry, TableRef};

/// Name and version hash of the built-in owner rule.
pub const OWNER_RULE_NAME: &str = "owner";
pub const OWNER_RULE_HASH: &str = "v1";

/// Source tag carried by grants created for a resource's creator.
pub const OWNER_TAG: &str = "owner";

/// Permissions granted to the creator of a resource instance.
pub const OWNER_PERMISSIONS: [&str; 3] = ["view", "update", "delete"];

pub fn generated_tag(name: &str, hash: &str) -> String {
    format!("generated:{name}:{hash}")
}

// ---------- Configuration ----------

/// A rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleConfig {
    Column(ColumnRuleConfig),
    GroupPropagation(GroupPropagationConfig),
}

impl RuleConfig {
    pub fn name(&self) -> &str {
        match self {
            RuleConfig::Column(c) => &c.name,
            RuleConfig::GroupPropagation(c) => &c.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnRuleConfig {
    pub name: String,
    /// group -> types whose rows this rule watches
    pub targets: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub group_name: Option<GroupNameConfig>,
    pub target_permissions: Vec<String>,
    /// Also make the row's member (see `member_column`) part of the group
    #[serde(default)]
    pub assign_group: bool,
    #[serde(default)]
    pub member_column: Option<String>,
    /// Grant on a referenced resource instead of the row itself
    #[serde(default)]
    pub target_type: Option<IndirectTarget>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupPropagationConfig {
    pub name: String,
    pub source_groups: Vec<String>,
    pub target_groups: Vec<String>,
    pub target_permissions: Vec<String>,
}

/// Declarative group naming: the first matching case wins; without cases
/// the group is `prefix` followed by the column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupNameConfig {
    pub column: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub cases: Vec<GroupCase>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupCase {
    pub equals: String,
    pub group: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndirectTarget {
    pub group: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Row column holding the referenced instance key
    pub column: String,
}

// ---------- Compiled rules ----------

pub type GroupNameFn = dyn Fn(&Row) -> Option<String> + Send + Sync;

/// Maps a row to the name of the group it should feed, if any.
#[derive(Clone)]
pub enum GroupNamer {
    Declarative(GroupNameConfig),
    Custom(Arc<GroupNameFn>),
}

impl GroupNamer {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Row) -> Option<String> + Send + Sync + 'static,
    {
        GroupNamer::Custom(Arc::new(f))
    }

    pub fn group_for(&self, row: &Row) -> Option<String> {
        match self {
            GroupNamer::Declarative(cfg) => {
                let value = value_as_key(row.get(&cfg.column)?)?;
                if cfg.cases.is_empty() {
                    Some(format!("{}{}", cfg.prefix, value))
                } else {
                    cfg.cases
                        .iter()
                        .find(|c| c.equals == value)
                        .map(|c| c.group.clone())
                }
            }
            GroupNamer::Custom(f) => f(row),
        }
    }
}

impl std::fmt::Debug for GroupNamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupNamer::Declarative(cfg) => f.debug_tuple("Declarative").field(cfg).finish(),
            GroupNamer::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Render a scalar JSON value as a key. Null, arrays and objects have no
/// key representation.
pub fn value_as_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub hash: String,
    pub kind: RuleKind,
}

#[derive(Debug, Clone)]
pub enum RuleKind {
    Column(ColumnRule),
    GroupPropagation(GroupPropagationRule),
    Owner(OwnerRule),
}

#[derive(Debug, Clone)]
pub struct ColumnRule {
    /// group -> type -> physical table
    pub targets: BTreeMap<String, BTreeMap<String, String>>,
    /// audited table -> logical type, covering relation tables
    pub dispatch: BTreeMap<TableRef, DispatchEntry>,
    pub group_name: GroupNamer,
    pub target_permissions: Vec<String>,
    pub assign_group: bool,
    pub member_column: Option<String>,
    pub target_type: Option<IndirectTarget>,
}

#[derive(Debug, Clone)]
pub struct GroupPropagationRule {
    pub source_groups: Vec<String>,
    pub target_groups: Vec<String>,
    pub target_permissions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct OwnerRule {
    pub dispatch: BTreeMap<TableRef, DispatchEntry>,
}

impl Rule {
    pub fn source_tag(&self) -> String {
        match self.kind {
            RuleKind::Owner(_) => OWNER_TAG.to_string(),
            _ => generated_tag(&self.name, &self.hash),
        }
    }

    /// Audited tables whose events this rule replays.
    pub fn watched_tables(&self) -> Vec<TableRef> {
        match &self.kind {
            RuleKind::Column(c) => c.dispatch.keys().cloned().collect(),
            RuleKind::GroupPropagation(_) => vec![crate::grants::membership_table()],
            RuleKind::Owner(o) => o.dispatch.keys().cloned().collect(),
        }
    }
}

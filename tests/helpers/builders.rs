use permsync::audit::{self, AuditAction};
use permsync::rules::types::{GroupCase, IndirectTarget};
use permsync::rules::{
    ColumnRuleConfig, GroupNameConfig, GroupPropagationConfig, RelationSchema, ResourceSchema,
    RuleConfig, SchemaPlan, TableRef,
};
use sea_orm::DatabaseConnection;
use serde_json::Value;
use std::collections::BTreeMap;

/// `docs.document` stored in `documents` with reviews in
/// `document_reviews`, plus `docs.folder` in `folders`.
pub fn docs_plan() -> SchemaPlan {
    let mut plan = SchemaPlan::default();
    plan.insert(
        "docs",
        "document",
        ResourceSchema {
            table: "documents".to_string(),
            key_column: "id".to_string(),
            relations: vec![RelationSchema {
                table: "document_reviews".to_string(),
                column: "document_id".to_string(),
            }],
        },
    );
    plan.insert(
        "docs",
        "folder",
        ResourceSchema {
            table: "folders".to_string(),
            key_column: "id".to_string(),
            relations: vec![],
        },
    );
    plan
}

/// Builder for column rules targeting `docs.document`
pub struct ColumnRuleBuilder {
    cfg: ColumnRuleConfig,
}

impl ColumnRuleBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            cfg: ColumnRuleConfig {
                name: name.to_string(),
                targets: BTreeMap::from([("docs".to_string(), vec!["document".to_string()])]),
                group_name: None,
                target_permissions: vec!["view".to_string()],
                assign_group: false,
                member_column: None,
                target_type: None,
            },
        }
    }

    pub fn targets(mut self, group: &str, types: &[&str]) -> Self {
        self.cfg.targets = BTreeMap::from([(
            group.to_string(),
            types.iter().map(|t| t.to_string()).collect(),
        )]);
        self
    }

    /// Rows whose `column` equals `equals` feed `group`
    pub fn when(mut self, column: &str, equals: &str, group: &str) -> Self {
        let naming = self.cfg.group_name.get_or_insert_with(|| GroupNameConfig {
            column: column.to_string(),
            prefix: String::new(),
            cases: vec![],
        });
        naming.cases.push(GroupCase {
            equals: equals.to_string(),
            group: group.to_string(),
        });
        self
    }

    /// Rows feed the group `prefix` + value of `column`
    pub fn prefixed(mut self, column: &str, prefix: &str) -> Self {
        self.cfg.group_name = Some(GroupNameConfig {
            column: column.to_string(),
            prefix: prefix.to_string(),
            cases: vec![],
        });
        self
    }

    pub fn permissions(mut self, permissions: &[&str]) -> Self {
        self.cfg.target_permissions = permissions.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn assign_group(mut self, member_column: &str) -> Self {
        self.cfg.assign_group = true;
        self.cfg.member_column = Some(member_column.to_string());
        self
    }

    pub fn indirect(mut self, group: &str, resource_type: &str, column: &str) -> Self {
        self.cfg.target_type = Some(IndirectTarget {
            group: group.to_string(),
            resource_type: resource_type.to_string(),
            column: column.to_string(),
        });
        self
    }

    pub fn build(self) -> RuleConfig {
        RuleConfig::Column(self.cfg)
    }
}

/// Builder for group-propagation rules
pub struct PropagationRuleBuilder {
    cfg: GroupPropagationConfig,
}

impl PropagationRuleBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            cfg: GroupPropagationConfig {
                name: name.to_string(),
                source_groups: vec![],
                target_groups: vec![],
                target_permissions: vec!["view".to_string()],
            },
        }
    }

    pub fn source(mut self, group: &str) -> Self {
        self.cfg.source_groups.push(group.to_string());
        self
    }

    pub fn target(mut self, group: &str) -> Self {
        self.cfg.target_groups.push(group.to_string());
        self
    }

    pub fn permissions(mut self, permissions: &[&str]) -> Self {
        self.cfg.target_permissions = permissions.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn build(self) -> RuleConfig {
        RuleConfig::GroupPropagation(self.cfg)
    }
}

/// Emulates the storage layer's audit trigger for one table
pub struct Audit<'a> {
    db: &'a DatabaseConnection,
    table: TableRef,
}

impl<'a> Audit<'a> {
    pub fn new(db: &'a DatabaseConnection, schema: &str, table: &str) -> Self {
        Self {
            db,
            table: TableRef::new(schema, table),
        }
    }

    pub async fn insert(&self, row: Value) -> i64 {
        self.record(AuditAction::Insert, row, None).await
    }

    pub async fn update(&self, old: Value, changed: Value) -> i64 {
        self.record(AuditAction::Update, old, Some(changed)).await
    }

    pub async fn delete(&self, row: Value) -> i64 {
        self.record(AuditAction::Delete, row, None).await
    }

    pub async fn truncate(&self) -> i64 {
        self.record(AuditAction::Truncate, Value::Object(Default::default()), None)
            .await
    }

    async fn record(&self, action: AuditAction, row: Value, changed: Option<Value>) -> i64 {
        audit::record_event(self.db, &self.table, action, &row, changed.as_ref())
            .await
            .expect("Failed to record audit event")
    }
}

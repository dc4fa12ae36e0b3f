use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Physical location of an audited table. The audit trail's `schema_name`
/// is the resource group the table belongs to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Resolved schema of the resources this engine derives permissions for:
/// `group -> type -> ResourceSchema`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaPlan {
    pub groups: BTreeMap<String, BTreeMap<String, ResourceSchema>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSchema {
    /// Physical table holding the instances of this type
    pub table: String,
    /// Column of `table` holding the instance key
    #[serde(default = "default_key_column")]
    pub key_column: String,
    /// Dependent tables whose rows belong to an instance of this type
    #[serde(default)]
    pub relations: Vec<RelationSchema>,
}

fn default_key_column() -> String {
    "id".to_string()
}

/// A dependent table referencing its parent instance through `column`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationSchema {
    pub table: String,
    pub column: String,
}

/// Where an audit row of a given table lands: the logical resource type
/// and the row column carrying the instance key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchEntry {
    pub resource_group: String,
    pub resource_type: String,
    pub key_column: String,
}

impl SchemaPlan {
    pub fn resource(&self, group: &str, resource_type: &str) -> Option<&ResourceSchema> {
        self.groups.get(group)?.get(resource_type)
    }

    pub fn insert(&mut self, group: &str, resource_type: &str, schema: ResourceSchema) {
        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(resource_type.to_string(), schema);
    }

    /// Dispatch entries for one type: its own table plus every relation
    /// table, the latter keyed by the column pointing at the parent.
    pub fn dispatch_for(
        &self,
        group: &str,
        resource_type: &str,
    ) -> Option<Vec<(TableRef, DispatchEntry)>> {
        let schema = self.resource(group, resource_type)?;
        let mut entries = vec![(
            TableRef::new(group, &schema.table),
            DispatchEntry {
                resource_group: group.to_string(),
                resource_type: resource_type.to_string(),
                key_column: schema.key_column.clone(),
            },
        )];
        for relation in &schema.relations {
            entries.push((
                TableRef::new(group, &relation.table),
                DispatchEntry {
                    resource_group: group.to_string(),
                    resource_type: resource_type.to_string(),
                    key_column: relation.column.clone(),
                },
            ));
        }
        Some(entries)
    }

    /// Own tables of every type, without relation tables.
    pub fn primary_tables(&self) -> BTreeMap<TableRef, DispatchEntry> {
        let mut out = BTreeMap::new();
        for (group, types) in &self.groups {
            for (resource_type, schema) in types {
                out.insert(
                    TableRef::new(group, &schema.table),
                    DispatchEntry {
                        resource_group: group.clone(),
                        resource_type: resource_type.clone(),
                        key_column: schema.key_column.clone(),
                    },
                );
            }
        }
        out
    }
}

//! Read access to the audit trail, plus the append helper used for tables
//! this crate owns.
use crate::entities;
use crate::errors::SyncError;
use crate::rules::TableRef;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde_json::{Map, Value};

pub type Row = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    Insert,
    Update,
    Delete,
    Truncate,
}

impl AuditAction {
    pub fn code(&self) -> &'static str {
        match self {
            AuditAction::Insert => "I",
            AuditAction::Update => "U",
            AuditAction::Delete => "D",
            AuditAction::Truncate => "T",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "I" => Some(AuditAction::Insert),
            "U" => Some(AuditAction::Update),
            "D" => Some(AuditAction::Delete),
            "T" => Some(AuditAction::Truncate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub event_id: i64,
    pub schema_name: String,
    pub table_name: String,
    pub action: AuditAction,
    /// New row for inserts, old row for updates and deletes
    pub row_data: Row,
    /// New values of the changed columns, updates only
    pub changed_fields: Option<Row>,
}

impl AuditEvent {
    pub fn table(&self) -> TableRef {
        TableRef::new(&self.schema_name, &self.table_name)
    }

    pub fn old_row(&self) -> &Row {
        &self.row_data
    }

    /// Row after the change: `row_data` overlaid with `changed_fields`.
    pub fn new_row(&self) -> Row {
        let mut row = self.row_data.clone();
        if let Some(changed) = &self.changed_fields {
            for (k, v) in changed {
                row.insert(k.clone(), v.clone());
            }
        }
        row
    }

    fn from_model(model: entities::audit_event::Model) -> Result<Self, SyncError> {
        let event_id = model.event_id;
        let malformed = |reason: String| SyncError::MalformedEvent { event_id, reason };

        let action = AuditAction::from_code(&model.action)
            .ok_or_else(|| malformed(format!("unknown action `{}`", model.action)))?;
        let row_data = parse_row(&model.row_data).map_err(malformed)?;
        let changed_fields = match model.changed_fields.as_deref() {
            Some(raw) => Some(parse_row(raw).map_err(malformed)?),
            None => None,
        };

        Ok(Self {
            event_id,
            schema_name: model.schema_name,
            table_name: model.table_name,
            action,
            row_data,
            changed_fields,
        })
    }
}

fn parse_row(raw: &str) -> Result<Row, String> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(Value::Null) => Ok(Row::new()),
        Ok(other) => Err(format!("expected a JSON object, got `{other}`")),
        Err(e) => Err(e.to_string()),
    }
}

/// One page of events on `tables` with `event_id > after`, in event order.
pub async fn page_events<C: ConnectionTrait>(
    db: &C,
    tables: &[TableRef],
    after: i64,
    offset: u64,
    limit: u64,
) -> Result<Vec<AuditEvent>, SyncError> {
    use entities::audit_event::{Column, Entity};

    if tables.is_empty() {
        return Ok(Vec::new());
    }

    let mut any_table = Condition::any();
    for t in tables {
        any_table = any_table.add(
            Condition::all()
                .add(Column::SchemaName.eq(t.schema.as_str()))
                .add(Column::TableName.eq(t.table.as_str())),
        );
    }

    let models = Entity::find()
        .filter(Column::EventId.gt(after))
        .filter(any_table)
        .order_by_asc(Column::EventId)
        .offset(offset)
        .limit(limit)
        .all(db)
        .await?;

    models.into_iter().map(AuditEvent::from_model).collect()
}

/// Highest event id in the trail, `0` when empty.
pub async fn latest_event_id<C: ConnectionTrait>(db: &C) -> Result<i64, SyncError> {
    use entities::audit_event::{Column, Entity};

    let max: Option<Option<i64>> = Entity::find()
        .select_only()
        .column_as(Column::EventId.max(), "max_event_id")
        .into_tuple()
        .one(db)
        .await?;

    Ok(max.flatten().unwrap_or(0))
}

/// Append an event. `row` is the new row for inserts and the old row for
/// updates and deletes; `changed` carries the new values of an update.
pub async fn record_event<C: ConnectionTrait>(
    db: &C,
    table: &TableRef,
    action: AuditAction,
    row: &Value,
    changed: Option<&Value>,
) -> Result<i64, SyncError> {
    let event = entities::audit_event::ActiveModel {
        schema_name: Set(table.schema.clone()),
        table_name: Set(table.table.clone()),
        action: Set(action.code().to_string()),
        row_data: Set(serde_json::to_string(row)?),
        changed_fields: Set(changed.map(serde_json::to_string).transpose()?),
        created_at: Set(Utc::now().timestamp()),
        ..Default::default()
    };

    let model = event.insert(db).await?;
    Ok(model.event_id)
}

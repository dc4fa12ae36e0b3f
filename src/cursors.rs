//! Per-rule progress through the audit trail.
//!
//! One row per `(name, config_hash)`. Registering a rule activates its
//! current hash and marks rows of older hashes stale; stale rows stay
//! until the sweep has retracted their grants.
use crate::entities;
use crate::errors::SyncError;
use crate::rules::Rule;
use chrono::Utc;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set};
use std::collections::HashSet;

pub use entities::permission_cursor::Model as Cursor;

pub async fn register_rules<C: ConnectionTrait>(db: &C, rules: &[Rule]) -> Result<(), SyncError> {
    use entities::permission_cursor::{ActiveModel, Column, Entity};

    let now = Utc::now().timestamp();
    for rule in rules {
        let cursor = ActiveModel {
            name: Set(rule.name.clone()),
            config_hash: Set(rule.hash.clone()),
            last_event: Set(0),
            active: Set(true),
            updated_at: Set(now),
            ..Default::default()
        };

        // A concurrent registration of the same (name, hash) reactivates
        // the existing row instead of adding another one.
        Entity::insert(cursor)
            .on_conflict(
                OnConflict::columns([Column::Name, Column::ConfigHash])
                    .update_columns([Column::Active, Column::UpdatedAt])
                    .to_owned(),
            )
            .exec_without_returning(db)
            .await?;

        let staled = Entity::update_many()
            .col_expr(Column::Active, Expr::value(false))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Name.eq(rule.name.as_str()))
            .filter(Column::ConfigHash.ne(rule.hash.as_str()))
            .filter(Column::Active.eq(true))
            .exec(db)
            .await?;

        if staled.rows_affected > 0 {
            tracing::info!(
                rule = %rule.name,
                hash = %rule.hash,
                stale = staled.rows_affected,
                "Rule configuration changed, replaying from the start"
            );
        }
    }
    Ok(())
}

/// Last applied event of the active cursor for `name`; `0` when there is
/// none, so a new rule replays the whole trail.
pub async fn cursor_for<C: ConnectionTrait>(db: &C, name: &str) -> Result<i64, SyncError> {
    use entities::permission_cursor::{Column, Entity};

    let cursor = Entity::find()
        .filter(Column::Name.eq(name))
        .filter(Column::Active.eq(true))
        .one(db)
        .await?;

    Ok(cursor.map(|c| c.last_event).unwrap_or(0))
}

/// Move the active cursor for `name` forward to `event_id`. Never moves a
/// cursor backwards.
pub async fn advance<C: ConnectionTrait>(
    db: &C,
    name: &str,
    event_id: i64,
) -> Result<(), SyncError> {
    use entities::permission_cursor::{Column, Entity};

    Entity::update_many()
        .col_expr(Column::LastEvent, Expr::value(event_id))
        .col_expr(Column::UpdatedAt, Expr::value(Utc::now().timestamp()))
        .filter(Column::Name.eq(name))
        .filter(Column::Active.eq(true))
        .filter(Column::LastEvent.lt(event_id))
        .exec(db)
        .await?;
    Ok(())
}

/// Mark stale every active cursor whose `(name, hash)` is not in `rules`,
/// including rules removed from configuration altogether.
pub async fn deactivate_unknown<C: ConnectionTrait>(
    db: &C,
    rules: &[Rule],
) -> Result<u64, SyncError> {
    use entities::permission_cursor::{Column, Entity};

    let current: HashSet<(&str, &str)> = rules
        .iter()
        .map(|r| (r.name.as_str(), r.hash.as_str()))
        .collect();

    let active = Entity::find()
        .filter(Column::Active.eq(true))
        .all(db)
        .await?;

    let stale_ids: Vec<i64> = active
        .iter()
        .filter(|c| !current.contains(&(c.name.as_str(), c.config_hash.as_str())))
        .map(|c| c.id)
        .collect();

    if stale_ids.is_empty() {
        return Ok(0);
    }

    let result = Entity::update_many()
        .col_expr(Column::Active, Expr::value(false))
        .col_expr(Column::UpdatedAt, Expr::value(Utc::now().timestamp()))
        .filter(Column::Id.is_in(stale_ids))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

pub async fn inactive_cursors<C: ConnectionTrait>(db: &C) -> Result<Vec<Cursor>, SyncError> {
    use entities::permission_cursor::{Column, Entity};

    Ok(Entity::find()
        .filter(Column::Active.eq(false))
        .order_by_asc(Column::Id)
        .all(db)
        .await?)
}

pub async fn delete_inactive<C: ConnectionTrait>(db: &C) -> Result<u64, SyncError> {
    use entities::permission_cursor::{Column, Entity};

    let result = Entity::delete_many()
        .filter(Column::Active.eq(false))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

pub async fn list_cursors<C: ConnectionTrait>(db: &C) -> Result<Vec<Cursor>, SyncError> {
    use entities::permission_cursor::{Column, Entity};

    Ok(Entity::find()
        .order_by_asc(Column::Name)
        .order_by_asc(Column::Id)
        .all(db)
        .await?)
}

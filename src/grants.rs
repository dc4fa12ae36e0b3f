//! Grant Store: permissions, groups, memberships and the source-tagged
//! assignments joining subjects to permissions.
//!
//! Every upsert is idempotent. Tagging adds a source tag to an assignment
//! at most once; untagging removes exactly one tag and leaves the row in
//! place, empty rows are removed by [`purge_untagged`] during the sweep.
//! Rows without tags never count as grants.
use crate::audit::{self, AuditAction};
use crate::entities;
use crate::errors::SyncError;
use crate::rules::TableRef;
use sea_orm::sea_query::{LikeExpr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, IntoActiveModel, QueryFilter,
    QuerySelect, Set,
};
use serde_json::json;
use std::collections::BTreeSet;

/// Schema holding the engine's own tables in the audit trail.
pub const AUTHZ_SCHEMA: &str = "authz";
pub const MEMBERSHIP_TABLE: &str = "group_memberships";

/// Resource type of permissions granted on users by group-propagation rules.
pub const USER_RESOURCE_TYPE: &str = "user";

/// Serialized form of an empty source set.
pub const NO_SOURCES: &str = "[]";

pub fn membership_table() -> TableRef {
    TableRef::new(AUTHZ_SCHEMA, MEMBERSHIP_TABLE)
}

/// Resource a permission applies to. `resource_key: None` covers every
/// instance of the type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PermissionTarget {
    pub resource_group: String,
    pub resource_type: String,
    pub resource_key: Option<String>,
}

impl PermissionTarget {
    pub fn instance(group: &str, resource_type: &str, key: impl Into<String>) -> Self {
        Self {
            resource_group: group.to_string(),
            resource_type: resource_type.to_string(),
            resource_key: Some(key.into()),
        }
    }

    pub fn type_wide(group: &str, resource_type: &str) -> Self {
        Self {
            resource_group: group.to_string(),
            resource_type: resource_type.to_string(),
            resource_key: None,
        }
    }
}

impl std::fmt::Display for PermissionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.resource_group, self.resource_type)?;
        match &self.resource_key {
            Some(key) => write!(f, "/{key}"),
            None => write!(f, "/*"),
        }
    }
}

// ---------- Source sets ----------

fn parse_sources(raw: &str) -> Result<BTreeSet<String>, SyncError> {
    Ok(serde_json::from_str(raw)?)
}

fn encode_sources(sources: &BTreeSet<String>) -> Result<String, SyncError> {
    Ok(serde_json::to_string(sources)?)
}

/// LIKE pattern for source sets holding `tag` as an element.
fn holding(tag: &str) -> Result<LikeExpr, SyncError> {
    Ok(like_stored(&serde_json::to_string(tag)?))
}

/// LIKE pattern for source sets holding an element that starts with
/// `prefix`.
fn holding_prefix(prefix: &str) -> Result<LikeExpr, SyncError> {
    let quoted = serde_json::to_string(prefix)?;
    Ok(like_stored(quoted.strip_suffix('"').unwrap_or(quoted.as_str())))
}

/// Match `encoded` literally anywhere in the stored JSON text.
fn like_stored(encoded: &str) -> LikeExpr {
    let mut pattern = String::from("%");
    for c in encoded.chars() {
        if matches!(c, '%' | '_' | '!') {
            pattern.push('!');
        }
        pattern.push(c);
    }
    pattern.push('%');
    LikeExpr::new(pattern).escape('!')
}

// ---------- Groups ----------

pub async fn ensure_group<C: ConnectionTrait>(db: &C, name: &str) -> Result<i64, SyncError> {
    use entities::group::{ActiveModel, Column, Entity};

    if let Some(id) = find_group(db, name).await? {
        return Ok(id);
    }

    // Concurrent creators race on the unique name, the loser re-reads
    let inserted = Entity::insert(ActiveModel {
        name: Set(name.to_string()),
        ..Default::default()
    })
    .on_conflict(OnConflict::column(Column::Name).do_nothing().to_owned())
    .exec_without_returning(db)
    .await?;

    let id = find_group(db, name)
        .await?
        .ok_or_else(|| SyncError::Other(format!("group `{name}` missing after upsert")))?;
    if inserted > 0 {
        tracing::debug!(group = %name, id, "Created group");
    }
    Ok(id)
}

pub async fn find_group<C: ConnectionTrait>(db: &C, name: &str) -> Result<Option<i64>, SyncError> {
    use entities::group::{Column, Entity};

    Ok(Entity::find()
        .filter(Column::Name.eq(name))
        .one(db)
        .await?
        .map(|g| g.id))
}

/// Ids of the groups among `names` that exist.
pub async fn find_group_ids<C: ConnectionTrait>(
    db: &C,
    names: &[String],
) -> Result<Vec<i64>, SyncError> {
    use entities::group::{Column, Entity};

    if names.is_empty() {
        return Ok(Vec::new());
    }

    Ok(Entity::find()
        .filter(Column::Name.is_in(names.iter().map(String::as_str)))
        .all(db)
        .await?
        .into_iter()
        .map(|g| g.id)
        .collect())
}

// ---------- Permissions ----------

pub async fn find_permission<C: ConnectionTrait>(
    db: &C,
    target: &PermissionTarget,
    permission: &str,
) -> Result<Option<i64>, SyncError> {
    use entities::permission::{Column, Entity};

    let key_filter = match &target.resource_key {
        Some(key) => Column::ResourceKey.eq(key.as_str()),
        None => Column::ResourceKey.is_null(),
    };

    Ok(Entity::find()
        .filter(Column::ResourceGroup.eq(target.resource_group.as_str()))
        .filter(Column::ResourceType.eq(target.resource_type.as_str()))
        .filter(Column::Permission.eq(permission))
        .filter(key_filter)
        .one(db)
        .await?
        .map(|p| p.id))
}

pub async fn ensure_permission<C: ConnectionTrait>(
    db: &C,
    target: &PermissionTarget,
    permission: &str,
) -> Result<i64, SyncError> {
    use entities::permission::{ActiveModel, Entity};

    if let Some(id) = find_permission(db, target, permission).await? {
        return Ok(id);
    }

    // No conflict target: the natural key is covered by two partial unique
    // indexes, one for instance keys and one for type-wide rows
    Entity::insert(ActiveModel {
        resource_group: Set(target.resource_group.clone()),
        resource_type: Set(target.resource_type.clone()),
        resource_key: Set(target.resource_key.clone()),
        permission: Set(permission.to_string()),
        ..Default::default()
    })
    .on_conflict(OnConflict::new().do_nothing().to_owned())
    .exec_without_returning(db)
    .await?;

    find_permission(db, target, permission)
        .await?
        .ok_or_else(|| {
            SyncError::Other(format!("permission {target}:{permission} missing after upsert"))
        })
}

/// Delete the listed permissions of one resource together with every
/// assignment referencing them. Returns the number of permissions removed.
pub async fn delete_permissions<C: ConnectionTrait>(
    db: &C,
    target: &PermissionTarget,
    permissions: &[&str],
) -> Result<u64, SyncError> {
    let mut ids = Vec::new();
    for permission in permissions {
        if let Some(id) = find_permission(db, target, permission).await? {
            ids.push(id);
        }
    }
    if ids.is_empty() {
        return Ok(0);
    }

    entities::UserPermission::delete_many()
        .filter(entities::user_permission::Column::PermissionId.is_in(ids.clone()))
        .exec(db)
        .await?;
    entities::GroupPermission::delete_many()
        .filter(entities::group_permission::Column::PermissionId.is_in(ids.clone()))
        .exec(db)
        .await?;
    let result = entities::Permission::delete_many()
        .filter(entities::permission::Column::Id.is_in(ids))
        .exec(db)
        .await?;

    Ok(result.rows_affected)
}

// ---------- Source-tagged assignments ----------

pub async fn tag_group_permission<C: ConnectionTrait>(
    db: &C,
    group_id: i64,
    permission_id: i64,
    tag: &str,
) -> Result<bool, SyncError> {
    use entities::group_permission::{ActiveModel, Column, Entity};

    loop {
        if let Some(row) = Entity::find_by_id((group_id, permission_id)).one(db).await? {
            let mut sources = parse_sources(&row.sources)?;
            if !sources.insert(tag.to_string()) {
                return Ok(false);
            }
            let mut active = row.into_active_model();
            active.sources = Set(encode_sources(&sources)?);
            active.update(db).await?;
            return Ok(true);
        }

        let inserted = Entity::insert(ActiveModel {
            group_id: Set(group_id),
            permission_id: Set(permission_id),
            sources: Set(encode_sources(&BTreeSet::from([tag.to_string()]))?),
        })
        .on_conflict(
            OnConflict::columns([Column::GroupId, Column::PermissionId])
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(db)
        .await?;
        if inserted > 0 {
            return Ok(true);
        }
        // Another writer created the row first; tag that one
    }
}

pub async fn untag_group_permission<C: ConnectionTrait>(
    db: &C,
    group_id: i64,
    permission_id: i64,
    tag: &str,
) -> Result<bool, SyncError> {
    use entities::group_permission::Entity;

    let Some(row) = Entity::find_by_id((group_id, permission_id)).one(db).await? else {
        return Ok(false);
    };
    strip_group_row(db, row, tag).await
}

pub async fn tag_user_permission<C: ConnectionTrait>(
    db: &C,
    user_key: &str,
    permission_id: i64,
    tag: &str,
) -> Result<bool, SyncError> {
    use entities::user_permission::{ActiveModel, Column, Entity};

    loop {
        if let Some(row) = Entity::find_by_id((user_key.to_string(), permission_id))
            .one(db)
            .await?
        {
            let mut sources = parse_sources(&row.sources)?;
            if !sources.insert(tag.to_string()) {
                return Ok(false);
            }
            let mut active = row.into_active_model();
            active.sources = Set(encode_sources(&sources)?);
            active.update(db).await?;
            return Ok(true);
        }

        let inserted = Entity::insert(ActiveModel {
            user_key: Set(user_key.to_string()),
            permission_id: Set(permission_id),
            sources: Set(encode_sources(&BTreeSet::from([tag.to_string()]))?),
        })
        .on_conflict(
            OnConflict::columns([Column::UserKey, Column::PermissionId])
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(db)
        .await?;
        if inserted > 0 {
            return Ok(true);
        }
    }
}

pub async fn untag_user_permission<C: ConnectionTrait>(
    db: &C,
    user_key: &str,
    permission_id: i64,
    tag: &str,
) -> Result<bool, SyncError> {
    use entities::user_permission::Entity;

    let Some(row) = Entity::find_by_id((user_key.to_string(), permission_id))
        .one(db)
        .await?
    else {
        return Ok(false);
    };
    strip_user_row(db, row, tag).await
}

async fn strip_group_row<C: ConnectionTrait>(
    db: &C,
    row: entities::group_permission::Model,
    tag: &str,
) -> Result<bool, SyncError> {
    let mut sources = parse_sources(&row.sources)?;
    if !sources.remove(tag) {
        return Ok(false);
    }
    let mut active = row.into_active_model();
    active.sources = Set(encode_sources(&sources)?);
    active.update(db).await?;
    Ok(true)
}

async fn strip_user_row<C: ConnectionTrait>(
    db: &C,
    row: entities::user_permission::Model,
    tag: &str,
) -> Result<bool, SyncError> {
    let mut sources = parse_sources(&row.sources)?;
    if !sources.remove(tag) {
        return Ok(false);
    }
    let mut active = row.into_active_model();
    active.sources = Set(encode_sources(&sources)?);
    active.update(db).await?;
    Ok(true)
}

/// Remove `tag` from every user and group assignment carrying it.
pub async fn untag_everywhere<C: ConnectionTrait>(db: &C, tag: &str) -> Result<u64, SyncError> {
    let mut stripped = 0;
    let pattern = holding(tag)?;

    // LIKE narrows the scan, the parsed set decides
    let group_rows = entities::GroupPermission::find()
        .filter(entities::group_permission::Column::Sources.like(pattern.clone()))
        .all(db)
        .await?;
    for row in group_rows {
        if strip_group_row(db, row, tag).await? {
            stripped += 1;
        }
    }

    let user_rows = entities::UserPermission::find()
        .filter(entities::user_permission::Column::Sources.like(pattern))
        .all(db)
        .await?;
    for row in user_rows {
        if strip_user_row(db, row, tag).await? {
            stripped += 1;
        }
    }

    Ok(stripped)
}

/// Remove `tag` from group assignments on any permission of one resource
/// type.
pub async fn untag_group_permissions_for_type<C: ConnectionTrait>(
    db: &C,
    resource_group: &str,
    resource_type: &str,
    tag: &str,
) -> Result<u64, SyncError> {
    use entities::permission::Column;

    let permission_ids: Vec<i64> = entities::Permission::find()
        .select_only()
        .column(Column::Id)
        .filter(Column::ResourceGroup.eq(resource_group))
        .filter(Column::ResourceType.eq(resource_type))
        .into_tuple()
        .all(db)
        .await?;
    if permission_ids.is_empty() {
        return Ok(0);
    }

    let rows = entities::GroupPermission::find()
        .filter(entities::group_permission::Column::PermissionId.is_in(permission_ids))
        .filter(entities::group_permission::Column::Sources.like(holding(tag)?))
        .all(db)
        .await?;

    let mut stripped = 0;
    for row in rows {
        if strip_group_row(db, row, tag).await? {
            stripped += 1;
        }
    }
    Ok(stripped)
}

/// Delete assignments left without any source tag.
pub async fn purge_untagged<C: ConnectionTrait>(db: &C) -> Result<u64, SyncError> {
    let groups = entities::GroupPermission::delete_many()
        .filter(entities::group_permission::Column::Sources.eq(NO_SOURCES))
        .exec(db)
        .await?;
    let users = entities::UserPermission::delete_many()
        .filter(entities::user_permission::Column::Sources.eq(NO_SOURCES))
        .exec(db)
        .await?;
    Ok(groups.rows_affected + users.rows_affected)
}

pub async fn group_permission_sources<C: ConnectionTrait>(
    db: &C,
    group_id: i64,
    permission_id: i64,
) -> Result<Option<BTreeSet<String>>, SyncError> {
    match entities::GroupPermission::find_by_id((group_id, permission_id))
        .one(db)
        .await?
    {
        Some(row) => Ok(Some(parse_sources(&row.sources)?)),
        None => Ok(None),
    }
}

pub async fn user_permission_sources<C: ConnectionTrait>(
    db: &C,
    user_key: &str,
    permission_id: i64,
) -> Result<Option<BTreeSet<String>>, SyncError> {
    match entities::UserPermission::find_by_id((user_key.to_string(), permission_id))
        .one(db)
        .await?
    {
        Some(row) => Ok(Some(parse_sources(&row.sources)?)),
        None => Ok(None),
    }
}

// ---------- Memberships ----------
//
// A membership edge carries the set of reasons it exists: `manual` for
// edges managed outside the rules, or `<rule tag>#<row>` for each audited
// row that put the member in the group. The edge is dropped with its last
// reason.

/// Justification of memberships added through [`add_membership`].
pub const MANUAL_SOURCE: &str = "manual";

/// Justification contributed by one audited row of a rule.
pub fn row_source(tag: &str, row: &str) -> String {
    format!("{tag}#{row}")
}

/// Add `user_key` to a group by hand. New edges are appended to the audit
/// trail in the same transaction so group-propagation rules can replay
/// them.
pub async fn add_membership<C: ConnectionTrait>(
    db: &C,
    user_key: &str,
    group_id: i64,
) -> Result<bool, SyncError> {
    justify_membership(db, user_key, group_id, MANUAL_SOURCE).await
}

/// Record `source` as a reason for the edge, creating it when missing.
/// Returns whether the edge is new.
pub async fn justify_membership<C: ConnectionTrait>(
    db: &C,
    user_key: &str,
    group_id: i64,
    source: &str,
) -> Result<bool, SyncError> {
    use entities::group_membership::{ActiveModel, Column, Entity};

    loop {
        if let Some(row) = Entity::find_by_id((user_key.to_string(), group_id))
            .one(db)
            .await?
        {
            let mut sources = parse_sources(&row.sources)?;
            if sources.insert(source.to_string()) {
                let mut active = row.into_active_model();
                active.sources = Set(encode_sources(&sources)?);
                active.update(db).await?;
            }
            return Ok(false);
        }

        let inserted = Entity::insert(ActiveModel {
            user_key: Set(user_key.to_string()),
            group_id: Set(group_id),
            sources: Set(encode_sources(&BTreeSet::from([source.to_string()]))?),
        })
        .on_conflict(
            OnConflict::columns([Column::UserKey, Column::GroupId])
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(db)
        .await?;

        if inserted > 0 {
            audit::record_event(
                db,
                &membership_table(),
                AuditAction::Insert,
                &json!({ "user_key": user_key, "group_id": group_id }),
                None,
            )
            .await?;
            return Ok(true);
        }
    }
}

/// Withdraw one reason for the edge. Returns whether the edge went away
/// with it.
pub async fn unjustify_membership<C: ConnectionTrait>(
    db: &C,
    user_key: &str,
    group_id: i64,
    source: &str,
) -> Result<bool, SyncError> {
    use entities::group_membership::Entity;

    let Some(row) = Entity::find_by_id((user_key.to_string(), group_id))
        .one(db)
        .await?
    else {
        return Ok(false);
    };
    let mut sources = parse_sources(&row.sources)?;
    if !sources.remove(source) {
        return Ok(false);
    }
    if sources.is_empty() {
        return remove_membership(db, user_key, group_id).await;
    }

    let mut active = row.into_active_model();
    active.sources = Set(encode_sources(&sources)?);
    active.update(db).await?;
    Ok(false)
}

/// Withdraw every reason a rule version contributed, dropping the edges
/// left without one. Returns the number of edges dropped.
pub async fn release_memberships<C: ConnectionTrait>(db: &C, tag: &str) -> Result<u64, SyncError> {
    use entities::group_membership::{Column, Entity};

    let prefix = row_source(tag, "");
    let rows = Entity::find()
        .filter(Column::Sources.like(holding_prefix(&prefix)?))
        .all(db)
        .await?;

    let mut dropped = 0;
    for row in rows {
        let mut sources = parse_sources(&row.sources)?;
        let before = sources.len();
        sources.retain(|s| !s.starts_with(&prefix));
        if sources.len() == before {
            continue;
        }
        if sources.is_empty() {
            if remove_membership(db, &row.user_key, row.group_id).await? {
                dropped += 1;
            }
            continue;
        }
        let mut active = row.into_active_model();
        active.sources = Set(encode_sources(&sources)?);
        active.update(db).await?;
    }
    Ok(dropped)
}

/// Remove the edge whatever justifies it.
pub async fn remove_membership<C: ConnectionTrait>(
    db: &C,
    user_key: &str,
    group_id: i64,
) -> Result<bool, SyncError> {
    use entities::group_membership::{Column, Entity};

    let deleted = Entity::delete_many()
        .filter(Column::UserKey.eq(user_key))
        .filter(Column::GroupId.eq(group_id))
        .exec(db)
        .await?;

    if deleted.rows_affected == 0 {
        return Ok(false);
    }

    audit::record_event(
        db,
        &membership_table(),
        AuditAction::Delete,
        &json!({ "user_key": user_key, "group_id": group_id }),
        None,
    )
    .await?;
    Ok(true)
}

pub async fn membership_sources<C: ConnectionTrait>(
    db: &C,
    user_key: &str,
    group_id: i64,
) -> Result<Option<BTreeSet<String>>, SyncError> {
    match entities::GroupMembership::find_by_id((user_key.to_string(), group_id))
        .one(db)
        .await?
    {
        Some(row) => Ok(Some(parse_sources(&row.sources)?)),
        None => Ok(None),
    }
}

pub async fn group_ids_for_user<C: ConnectionTrait>(
    db: &C,
    user_key: &str,
) -> Result<Vec<i64>, SyncError> {
    use entities::group_membership::{Column, Entity};

    Ok(Entity::find()
        .filter(Column::UserKey.eq(user_key))
        .all(db)
        .await?
        .into_iter()
        .map(|m| m.group_id)
        .collect())
}

pub async fn is_member_of_any<C: ConnectionTrait>(
    db: &C,
    user_key: &str,
    group_ids: &[i64],
) -> Result<bool, SyncError> {
    use entities::group_membership::{Column, Entity};

    if group_ids.is_empty() {
        return Ok(false);
    }

    let found = Entity::find()
        .filter(Column::UserKey.eq(user_key))
        .filter(Column::GroupId.is_in(group_ids.iter().copied()))
        .one(db)
        .await?;
    Ok(found.is_some())
}

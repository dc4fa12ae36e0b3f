//! Group-propagation rules: membership in a target group grants every
//! source group the rule's permissions on the member.
use sea_orm::ConnectionTrait;
use serde_json::Value;

use crate::audit::{AuditAction, AuditEvent, Row};
use crate::errors::SyncError;
use crate::grants::{self, PermissionTarget, AUTHZ_SCHEMA, USER_RESOURCE_TYPE};
use crate::rules::types::{value_as_key, GroupPropagationRule};

/// Group ids resolved once per pass.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedGroups {
    pub source_ids: Vec<i64>,
    pub target_ids: Vec<i64>,
}

/// `None` when either side has no existing group; the rule then has
/// nothing to do this pass and keeps its cursor.
pub(crate) async fn resolve<C: ConnectionTrait>(
    db: &C,
    rule: &GroupPropagationRule,
) -> Result<Option<ResolvedGroups>, SyncError> {
    let source_ids = grants::find_group_ids(db, &rule.source_groups).await?;
    let target_ids = grants::find_group_ids(db, &rule.target_groups).await?;
    if source_ids.is_empty() || target_ids.is_empty() {
        return Ok(None);
    }
    Ok(Some(ResolvedGroups {
        source_ids,
        target_ids,
    }))
}

pub(crate) async fn apply<C: ConnectionTrait>(
    db: &C,
    tag: &str,
    rule: &GroupPropagationRule,
    groups: &ResolvedGroups,
    event: &AuditEvent,
) -> Result<(), SyncError> {
    match event.action {
        AuditAction::Insert => joined(db, tag, rule, groups, &event.row_data).await,
        AuditAction::Delete => left(db, tag, rule, groups, &event.row_data).await,
        AuditAction::Update => {
            left(db, tag, rule, groups, event.old_row()).await?;
            joined(db, tag, rule, groups, &event.new_row()).await
        }
        AuditAction::Truncate => {
            let stripped = grants::untag_everywhere(db, tag).await?;
            tracing::debug!(%tag, stripped, "Memberships truncated");
            Ok(())
        }
    }
}

fn membership(row: &Row) -> Option<(String, i64)> {
    let user_key = value_as_key(row.get("user_key")?)?;
    let group_id = match row.get("group_id")? {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.parse().ok()?,
        _ => return None,
    };
    Some((user_key, group_id))
}

async fn joined<C: ConnectionTrait>(
    db: &C,
    tag: &str,
    rule: &GroupPropagationRule,
    groups: &ResolvedGroups,
    row: &Row,
) -> Result<(), SyncError> {
    let Some((user_key, group_id)) = membership(row) else {
        return Ok(());
    };
    if !groups.target_ids.contains(&group_id) {
        return Ok(());
    }

    let target = PermissionTarget::instance(AUTHZ_SCHEMA, USER_RESOURCE_TYPE, user_key);
    for permission in &rule.target_permissions {
        let permission_id = grants::ensure_permission(db, &target, permission).await?;
        for source in &groups.source_ids {
            grants::tag_group_permission(db, *source, permission_id, tag).await?;
        }
    }
    Ok(())
}

async fn left<C: ConnectionTrait>(
    db: &C,
    tag: &str,
    rule: &GroupPropagationRule,
    groups: &ResolvedGroups,
    row: &Row,
) -> Result<(), SyncError> {
    let Some((user_key, group_id)) = membership(row) else {
        return Ok(());
    };
    if !groups.target_ids.contains(&group_id) {
        return Ok(());
    }

    // Still justified by another target-group membership as of now
    if grants::is_member_of_any(db, &user_key, &groups.target_ids).await? {
        return Ok(());
    }

    let target = PermissionTarget::instance(AUTHZ_SCHEMA, USER_RESOURCE_TYPE, user_key);
    for permission in &rule.target_permissions {
        let Some(permission_id) = grants::find_permission(db, &target, permission).await? else {
            continue;
        };
        for source in &groups.source_ids {
            grants::untag_group_permission(db, *source, permission_id, tag).await?;
        }
    }
    Ok(())
}

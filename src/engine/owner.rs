//! Ownership grants. Creation grants are written synchronously by the
//! write path through [`ensure_owner_permissions`]; replay only handles
//! deletion of the owned row.
use sea_orm::ConnectionTrait;

use crate::audit::{AuditAction, AuditEvent};
use crate::errors::SyncError;
use crate::grants::{self, PermissionTarget};
use crate::rules::types::{value_as_key, OwnerRule, OWNER_PERMISSIONS, OWNER_TAG};

/// Grant `owner_key` view/update/delete on each of `keys`. Call it in the
/// transaction that creates the instances.
pub async fn ensure_owner_permissions<C: ConnectionTrait>(
    db: &C,
    resource_group: &str,
    resource_type: &str,
    owner_key: &str,
    keys: &[String],
) -> Result<(), SyncError> {
    for key in keys {
        let target = PermissionTarget::instance(resource_group, resource_type, key.as_str());
        for permission in OWNER_PERMISSIONS {
            let permission_id = grants::ensure_permission(db, &target, permission).await?;
            grants::tag_user_permission(db, owner_key, permission_id, OWNER_TAG).await?;
        }
    }
    tracing::debug!(
        %resource_group,
        %resource_type,
        owner = %owner_key,
        count = keys.len(),
        "Granted owner permissions"
    );
    Ok(())
}

pub(crate) async fn apply<C: ConnectionTrait>(
    db: &C,
    rule: &OwnerRule,
    event: &AuditEvent,
) -> Result<(), SyncError> {
    if event.action != AuditAction::Delete {
        return Ok(());
    }
    let Some(entry) = rule.dispatch.get(&event.table()) else {
        return Ok(());
    };
    let Some(key) = event
        .row_data
        .get(&entry.key_column)
        .and_then(value_as_key)
    else {
        return Ok(());
    };

    let target = PermissionTarget::instance(&entry.resource_group, &entry.resource_type, key);
    let removed = grants::delete_permissions(db, &target, &OWNER_PERMISSIONS).await?;
    if removed > 0 {
        tracing::debug!(%target, removed, "Removed permissions of deleted instance");
    }
    Ok(())
}

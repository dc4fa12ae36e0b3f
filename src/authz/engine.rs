use std::collections::{HashMap, HashSet};

use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};

use crate::authz::types::RequiredPermission;
use crate::entities;
use crate::errors::SyncError;
use crate::grants::{self, NO_SOURCES};

/// True iff `subject` holds every requirement, directly or through a group.
///
/// A requirement is met by a type-wide grant, or by a grant on each of its
/// keys. A missing grant is `Ok(false)`, never an error.
pub async fn user_has_all_permissions<C: ConnectionTrait>(
    db: &C,
    subject: &str,
    required: &[RequiredPermission],
) -> Result<bool, SyncError> {
    let group_ids = grants::group_ids_for_user(db, subject).await?;

    for req in required {
        if !satisfies(db, subject, &group_ids, req).await? {
            tracing::debug!(%subject, requirement = %req, "Permission check denied");
            return Ok(false);
        }
    }
    Ok(true)
}

async fn satisfies<C: ConnectionTrait>(
    db: &C,
    subject: &str,
    group_ids: &[i64],
    req: &RequiredPermission,
) -> Result<bool, SyncError> {
    use entities::permission::Column;

    let keys = req.keys();

    // Candidate permissions: the type-wide one plus one per required key
    let candidates = entities::Permission::find()
        .filter(Column::ResourceGroup.eq(req.resource_group.as_str()))
        .filter(Column::ResourceType.eq(req.resource_type.as_str()))
        .filter(Column::Permission.eq(req.permission.as_str()))
        .filter(
            Column::ResourceKey
                .is_null()
                .or(Column::ResourceKey.is_in(keys.iter().map(String::as_str))),
        )
        .all(db)
        .await?;
    if candidates.is_empty() {
        return Ok(false);
    }

    let key_by_id: HashMap<i64, Option<String>> = candidates
        .into_iter()
        .map(|p| (p.id, p.resource_key))
        .collect();
    let ids: Vec<i64> = key_by_id.keys().copied().collect();

    let mut granted: HashSet<i64> = entities::UserPermission::find()
        .filter(entities::user_permission::Column::UserKey.eq(subject))
        .filter(entities::user_permission::Column::PermissionId.is_in(ids.clone()))
        .filter(entities::user_permission::Column::Sources.ne(NO_SOURCES))
        .all(db)
        .await?
        .into_iter()
        .map(|row| row.permission_id)
        .collect();

    if !group_ids.is_empty() {
        let via_groups = entities::GroupPermission::find()
            .filter(entities::group_permission::Column::GroupId.is_in(group_ids.iter().copied()))
            .filter(entities::group_permission::Column::PermissionId.is_in(ids))
            .filter(entities::group_permission::Column::Sources.ne(NO_SOURCES))
            .all(db)
            .await?;
        granted.extend(via_groups.into_iter().map(|row| row.permission_id));
    }

    let granted_keys: Vec<&Option<String>> =
        granted.iter().filter_map(|id| key_by_id.get(id)).collect();

    if granted_keys.iter().any(|key| key.is_none()) {
        return Ok(true);
    }
    if keys.is_empty() {
        return Ok(false);
    }

    let covered: HashSet<&str> = granted_keys
        .iter()
        .filter_map(|key| key.as_deref())
        .collect();
    Ok(keys.iter().all(|key| covered.contains(key.as_str())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::types::ResourceKeys;
    use crate::grants::PermissionTarget;
    use crate::storage::test_support::TestDb;

    fn require(keys: Option<ResourceKeys>) -> RequiredPermission {
        RequiredPermission {
            resource_group: "docs".into(),
            resource_type: "document".into(),
            permission: "view".into(),
            resource_key: keys,
        }
    }

    #[tokio::test]
    async fn test_missing_grant_is_false() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();

        let ok = user_has_all_permissions(db, "alice", &[require(Some(ResourceKeys::One("1".into())))])
            .await
            .unwrap();
        assert!(!ok);
        assert!(user_has_all_permissions(db, "alice", &[]).await.unwrap());
    }

    #[tokio::test]
    async fn test_every_key_must_be_covered() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();

        let p1 = grants::ensure_permission(db, &PermissionTarget::instance("docs", "document", "1"), "view")
            .await
            .unwrap();
        grants::tag_user_permission(db, "alice", p1, "owner").await.unwrap();

        let one = require(Some(ResourceKeys::One("1".into())));
        let both = require(Some(ResourceKeys::Many(vec!["1".into(), "2".into()])));
        assert!(user_has_all_permissions(db, "alice", &[one]).await.unwrap());
        assert!(!user_has_all_permissions(db, "alice", &[both.clone()]).await.unwrap());

        let p2 = grants::ensure_permission(db, &PermissionTarget::instance("docs", "document", "2"), "view")
            .await
            .unwrap();
        let group = grants::ensure_group(db, "readers").await.unwrap();
        grants::add_membership(db, "alice", group).await.unwrap();
        grants::tag_group_permission(db, group, p2, "generated:R:h").await.unwrap();
        assert!(user_has_all_permissions(db, "alice", &[both]).await.unwrap());
    }

    #[tokio::test]
    async fn test_type_wide_grant_covers_all_keys() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();

        let wide = grants::ensure_permission(db, &PermissionTarget::type_wide("docs", "document"), "view")
            .await
            .unwrap();
        grants::tag_user_permission(db, "bob", wide, "generated:R:h").await.unwrap();

        let many = require(Some(ResourceKeys::Many(vec!["5".into(), "6".into()])));
        assert!(user_has_all_permissions(db, "bob", &[many]).await.unwrap());
        assert!(user_has_all_permissions(db, "bob", &[require(None)]).await.unwrap());
        assert!(user_has_all_permissions(db, "bob", &[require(Some(ResourceKeys::Many(vec![])))])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_untagged_rows_do_not_grant() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();

        let p = grants::ensure_permission(db, &PermissionTarget::instance("docs", "document", "1"), "view")
            .await
            .unwrap();
        grants::tag_user_permission(db, "carol", p, "generated:R:h").await.unwrap();
        grants::untag_user_permission(db, "carol", p, "generated:R:h").await.unwrap();

        let ok = user_has_all_permissions(db, "carol", &[require(Some(ResourceKeys::One("1".into())))])
            .await
            .unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_instance_grant_does_not_satisfy_type_wide() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();

        let p = grants::ensure_permission(db, &PermissionTarget::instance("docs", "document", "1"), "view")
            .await
            .unwrap();
        grants::tag_user_permission(db, "dave", p, "owner").await.unwrap();

        assert!(!user_has_all_permissions(db, "dave", &[require(None)]).await.unwrap());
    }
}

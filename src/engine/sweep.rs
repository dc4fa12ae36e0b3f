//! Retraction of grants whose rule configuration is gone.
use sea_orm::ConnectionTrait;

use crate::cursors;
use crate::errors::SyncError;
use crate::grants;
use crate::rules::types::{generated_tag, OWNER_RULE_NAME};
use crate::rules::Rule;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Cursors marked stale in this sweep
    pub deactivated: u64,
    /// Source tags removed from assignments
    pub untagged: u64,
    /// Assignments deleted for having no source left
    pub purged: u64,
    /// Memberships dropped with the last rule row justifying them
    pub memberships_released: u64,
    pub cursors_deleted: u64,
}

/// Stale every cursor `rules` no longer describes, strip the tags of all
/// stale cursors from assignments and memberships, then delete empty
/// assignments and the stale cursors.
pub async fn sweep<C: ConnectionTrait>(db: &C, rules: &[Rule]) -> Result<SweepReport, SyncError> {
    let mut report = SweepReport {
        deactivated: cursors::deactivate_unknown(db, rules).await?,
        ..Default::default()
    };

    for cursor in cursors::inactive_cursors(db).await? {
        // Ownership grants do not depend on a rule version
        if cursor.name == OWNER_RULE_NAME {
            continue;
        }
        let tag = generated_tag(&cursor.name, &cursor.config_hash);
        let untagged = grants::untag_everywhere(db, &tag).await?;
        if untagged > 0 {
            tracing::info!(rule = %cursor.name, hash = %cursor.config_hash, untagged, "Retracted grants of stale rule");
        }
        report.untagged += untagged;

        let released = grants::release_memberships(db, &tag).await?;
        if released > 0 {
            tracing::info!(rule = %cursor.name, hash = %cursor.config_hash, released, "Released memberships of stale rule");
        }
        report.memberships_released += released;
    }

    report.purged = grants::purge_untagged(db).await?;
    report.cursors_deleted = cursors::delete_inactive(db).await?;
    Ok(report)
}

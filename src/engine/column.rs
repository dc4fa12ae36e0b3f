//! Column rules: a row's column value names the group that receives the
//! rule's permissions on the row's resource.
use sea_orm::ConnectionTrait;

use crate::audit::{AuditAction, AuditEvent, Row};
use crate::errors::SyncError;
use crate::grants::{self, PermissionTarget};
use crate::rules::types::{value_as_key, ColumnRule};
use crate::rules::{DispatchEntry, TableRef};

/// What one row contributes: a group, the resource it is granted on and,
/// with `assign_group`, the member joining the group. `row` identifies the
/// contributing row in membership sources.
#[derive(Debug, Clone, PartialEq)]
struct Derived {
    group: String,
    target: PermissionTarget,
    member: Option<String>,
    row: String,
}

pub(crate) async fn apply<C: ConnectionTrait>(
    db: &C,
    rule_name: &str,
    tag: &str,
    rule: &ColumnRule,
    event: &AuditEvent,
) -> Result<(), SyncError> {
    let table = event.table();
    let Some(entry) = rule.dispatch.get(&table) else {
        return Ok(());
    };

    match event.action {
        AuditAction::Insert => {
            let Some(derived) = derive(rule, entry, &table, &event.row_data) else {
                tracing::debug!(rule = %rule_name, event_id = event.event_id, "Rule does not apply to inserted row");
                return Ok(());
            };
            grant(db, tag, rule, &derived).await
        }
        AuditAction::Update => {
            let old = event.old_row();
            let new = event.new_row();
            let old_group = rule.group_name.group_for(old);
            let new_group = rule.group_name.group_for(&new);
            if old_group == new_group {
                return Ok(());
            }

            let new_target =
                resolve_target(rule, entry, &new).ok_or_else(|| SyncError::UnresolvableTarget {
                    rule: rule_name.to_string(),
                    event_id: event.event_id,
                })?;

            if let Some(previous) = derive(rule, entry, &table, old) {
                revoke(db, tag, rule, &previous).await?;
            }
            if let Some(group) = new_group {
                let derived = Derived {
                    group,
                    row: row_ref(&table, &new_target),
                    target: new_target,
                    member: member_of(rule, &new),
                };
                grant(db, tag, rule, &derived).await?;
            }
            Ok(())
        }
        AuditAction::Delete => match derive(rule, entry, &table, &event.row_data) {
            Some(previous) => revoke(db, tag, rule, &previous).await,
            None => Ok(()),
        },
        AuditAction::Truncate => {
            let (group, resource_type) = match &rule.target_type {
                Some(indirect) => (indirect.group.as_str(), indirect.resource_type.as_str()),
                None => (entry.resource_group.as_str(), entry.resource_type.as_str()),
            };
            let stripped =
                grants::untag_group_permissions_for_type(db, group, resource_type, tag).await?;
            tracing::debug!(rule = %rule_name, %group, %resource_type, stripped, "Applied truncate");
            Ok(())
        }
    }
}

fn derive(
    rule: &ColumnRule,
    entry: &DispatchEntry,
    table: &TableRef,
    row: &Row,
) -> Option<Derived> {
    let group = rule.group_name.group_for(row)?;
    let target = resolve_target(rule, entry, row)?;
    Some(Derived {
        group,
        row: row_ref(table, &target),
        target,
        member: member_of(rule, row),
    })
}

fn row_ref(table: &TableRef, target: &PermissionTarget) -> String {
    format!("{table}:{target}")
}

/// The row's own instance, or the instance it references when the rule
/// declares an indirect target.
fn resolve_target(rule: &ColumnRule, entry: &DispatchEntry, row: &Row) -> Option<PermissionTarget> {
    match &rule.target_type {
        Some(indirect) => {
            let key = value_as_key(row.get(&indirect.column)?)?;
            Some(PermissionTarget::instance(
                &indirect.group,
                &indirect.resource_type,
                key,
            ))
        }
        None => {
            let key = value_as_key(row.get(&entry.key_column)?)?;
            Some(PermissionTarget::instance(
                &entry.resource_group,
                &entry.resource_type,
                key,
            ))
        }
    }
}

fn member_of(rule: &ColumnRule, row: &Row) -> Option<String> {
    if !rule.assign_group {
        return None;
    }
    let column = rule.member_column.as_deref()?;
    value_as_key(row.get(column)?)
}

async fn grant<C: ConnectionTrait>(
    db: &C,
    tag: &str,
    rule: &ColumnRule,
    derived: &Derived,
) -> Result<(), SyncError> {
    let group_id = grants::ensure_group(db, &derived.group).await?;
    for permission in &rule.target_permissions {
        let permission_id = grants::ensure_permission(db, &derived.target, permission).await?;
        grants::tag_group_permission(db, group_id, permission_id, tag).await?;
    }
    if let Some(member) = &derived.member {
        let source = grants::row_source(tag, &derived.row);
        grants::justify_membership(db, member, group_id, &source).await?;
    }
    Ok(())
}

async fn revoke<C: ConnectionTrait>(
    db: &C,
    tag: &str,
    rule: &ColumnRule,
    derived: &Derived,
) -> Result<(), SyncError> {
    let Some(group_id) = grants::find_group(db, &derived.group).await? else {
        return Ok(());
    };
    for permission in &rule.target_permissions {
        if let Some(permission_id) =
            grants::find_permission(db, &derived.target, permission).await?
        {
            grants::untag_group_permission(db, group_id, permission_id, tag).await?;
        }
    }
    if let Some(member) = &derived.member {
        let source = grants::row_source(tag, &derived.row);
        grants::unjustify_membership(db, member, group_id, &source).await?;
    }
    Ok(())
}

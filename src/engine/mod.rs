//! Propagation Engine: replays the audit trail into the Grant Store.
//!
//! A pass registers the rule set, replays each rule from its cursor in its
//! own transaction, then sweeps grants of stale rules. Passes run under
//! the cluster lock.

mod column;
mod owner;
mod propagation;
mod sweep;

pub use owner::ensure_owner_permissions;
pub use sweep::{sweep, SweepReport};

use sea_orm::{ConnectionTrait, DatabaseConnection, TransactionTrait};

use crate::audit;
use crate::cursors;
use crate::errors::SyncError;
use crate::jobs;
use crate::lock::ClusterLock;
use crate::rules::{Rule, RuleKind};

#[derive(Debug, Clone, PartialEq)]
pub enum RuleOutcome {
    Applied { events: u64, cursor: i64 },
    /// Nothing to replay against, e.g. none of the rule's groups exist yet
    Skipped,
    /// Rolled back; retried from the committed cursor on the next pass
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleReport {
    pub rule: String,
    pub outcome: RuleOutcome,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub events_applied: u64,
    pub rules: Vec<RuleReport>,
    pub sweep: SweepReport,
}

impl RunReport {
    pub fn failed_rules(&self) -> impl Iterator<Item = &RuleReport> {
        self.rules
            .iter()
            .filter(|r| matches!(r.outcome, RuleOutcome::Failed { .. }))
    }
}

/// One locked pass, recorded in `propagation_runs`.
pub async fn run_once(
    db: &DatabaseConnection,
    lock: &ClusterLock,
    rules: &[Rule],
    page_size: u64,
    trigger: &str,
) -> Result<RunReport, SyncError> {
    lock.run_exclusive(move || async move {
        let run_id = jobs::start_run(db, trigger).await?;
        match run_pass(db, rules, page_size).await {
            Ok(report) => {
                let failed = report.failed_rules().count();
                let error = (failed > 0).then(|| format!("{failed} rule(s) failed"));
                jobs::complete_run(
                    db,
                    run_id,
                    failed == 0,
                    error,
                    Some(report.events_applied as i64),
                )
                .await?;
                Ok(report)
            }
            Err(e) => {
                tracing::error!(error = %e, %trigger, "Propagation pass aborted");
                jobs::complete_run(db, run_id, false, Some(e.to_string()), None).await?;
                Err(e)
            }
        }
    })
    .await
}

/// One pass without the lock. Callers serialize passes themselves.
pub async fn run_pass(
    db: &DatabaseConnection,
    rules: &[Rule],
    page_size: u64,
) -> Result<RunReport, SyncError> {
    let page_size = page_size.max(1);
    cursors::register_rules(db, rules).await?;

    let mut report = RunReport::default();
    for rule in rules {
        let outcome = match replay_rule(db, rule, page_size).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_rule_local() => {
                tracing::warn!(rule = %rule.name, error = %e, "Rule replay failed, rolled back");
                RuleOutcome::Failed {
                    error: e.to_string(),
                }
            }
            Err(e) => return Err(e),
        };
        if let RuleOutcome::Applied { events, .. } = outcome {
            report.events_applied += events;
        }
        report.rules.push(RuleReport {
            rule: rule.name.clone(),
            outcome,
        });
    }

    let txn = db.begin().await?;
    report.sweep = sweep(&txn, rules).await?;
    txn.commit().await?;

    tracing::info!(
        events = report.events_applied,
        rules = report.rules.len(),
        failed = report.failed_rules().count(),
        untagged = report.sweep.untagged,
        purged = report.sweep.purged,
        memberships_released = report.sweep.memberships_released,
        "Propagation pass finished"
    );
    Ok(report)
}

/// Replay one rule inside its own transaction.
async fn replay_rule(
    db: &DatabaseConnection,
    rule: &Rule,
    page_size: u64,
) -> Result<RuleOutcome, SyncError> {
    let txn = db.begin().await?;
    match replay(&txn, rule, page_size).await {
        Ok(outcome) => {
            txn.commit().await?;
            Ok(outcome)
        }
        Err(e) => {
            txn.rollback().await?;
            Err(e)
        }
    }
}

async fn replay<C: ConnectionTrait>(
    db: &C,
    rule: &Rule,
    page_size: u64,
) -> Result<RuleOutcome, SyncError> {
    let groups = match &rule.kind {
        RuleKind::GroupPropagation(p) => match propagation::resolve(db, p).await? {
            Some(groups) => Some(groups),
            None => {
                tracing::debug!(rule = %rule.name, "Source or target groups missing, skipping");
                return Ok(RuleOutcome::Skipped);
            }
        },
        _ => None,
    };

    let tag = rule.source_tag();
    let tables = rule.watched_tables();
    let after = cursors::cursor_for(db, &rule.name).await?;
    let mut cursor = after;
    let mut offset = 0;
    let mut events = 0;

    loop {
        let page = audit::page_events(db, &tables, after, offset, page_size).await?;
        for event in &page {
            match (&rule.kind, &groups) {
                (RuleKind::Column(c), _) => column::apply(db, &rule.name, &tag, c, event).await?,
                (RuleKind::GroupPropagation(p), Some(groups)) => {
                    propagation::apply(db, &tag, p, groups, event).await?
                }
                (RuleKind::GroupPropagation(_), None) => {}
                (RuleKind::Owner(o), _) => owner::apply(db, o, event).await?,
            }
            cursors::advance(db, &rule.name, event.event_id).await?;
            cursor = event.event_id;
            events += 1;
        }
        if (page.len() as u64) < page_size {
            break;
        }
        offset += page_size;
    }

    if events > 0 {
        tracing::debug!(rule = %rule.name, events, cursor, "Replayed rule");
    }
    Ok(RuleOutcome::Applied { events, cursor })
}

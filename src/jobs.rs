use crate::entities;
use crate::errors::SyncError;
use crate::scheduler::ChangeSignal;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use tokio::sync::mpsc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info};

/// Start the cron safety net: every tick asks the propagator for a pass,
/// covering missed change notifications.
pub async fn init_scheduler(
    cron: &str,
    signals: mpsc::Sender<ChangeSignal>,
) -> Result<JobScheduler, SyncError> {
    let sched = JobScheduler::new().await?;

    let safety_net = Job::new_async(cron, move |_uuid, _l| {
        let signals = signals.clone();
        Box::pin(async move {
            // A full channel already holds a pending pass
            match signals.try_send(ChangeSignal::SafetyNet) {
                Ok(()) => debug!("Safety net requested a propagation pass"),
                Err(mpsc::error::TrySendError::Full(_)) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Propagator stopped, safety net signal dropped")
                }
            }
        })
    })?;

    sched.add(safety_net).await?;
    sched.start().await?;

    info!(%cron, "Safety net scheduler started");
    Ok(sched)
}

/// Record the start of a propagation pass
pub async fn start_run<C: ConnectionTrait>(db: &C, trigger: &str) -> Result<i64, SyncError> {
    use entities::propagation_run;

    let run = propagation_run::ActiveModel {
        trigger: Set(trigger.to_string()),
        started_at: Set(Utc::now().timestamp()),
        completed_at: Set(None),
        success: Set(None),
        error_message: Set(None),
        events_applied: Set(None),
        ..Default::default()
    };

    let result = run.insert(db).await?;
    Ok(result.id)
}

/// Record the outcome of a propagation pass
pub async fn complete_run<C: ConnectionTrait>(
    db: &C,
    run_id: i64,
    success: bool,
    error_message: Option<String>,
    events_applied: Option<i64>,
) -> Result<(), SyncError> {
    use entities::propagation_run::{Column, Entity};

    if let Some(run) = Entity::find()
        .filter(Column::Id.eq(run_id))
        .one(db)
        .await?
    {
        let mut active = run.into_active_model();
        active.completed_at = Set(Some(Utc::now().timestamp()));
        active.success = Set(Some(success));
        active.error_message = Set(error_message);
        active.events_applied = Set(events_applied);
        active.update(db).await?;
    }

    Ok(())
}

/// Most recent passes, newest first
pub async fn recent_runs<C: ConnectionTrait>(
    db: &C,
    limit: u64,
) -> Result<Vec<entities::propagation_run::Model>, SyncError> {
    use entities::propagation_run::{Column, Entity};

    Ok(Entity::find()
        .order_by_desc(Column::Id)
        .limit(limit)
        .all(db)
        .await?)
}

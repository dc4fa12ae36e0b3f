//! Continuous propagation: coalesces change signals into single-flight
//! passes.
use std::sync::Arc;
use std::time::Duration;

use sea_orm::DatabaseConnection;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};

use crate::audit;
use crate::engine::{self, RunReport};
use crate::errors::SyncError;
use crate::lock::ClusterLock;
use crate::rules::Rule;

/// Why a pass was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeSignal {
    Startup,
    /// The audit trail grew past `watermark`
    AuditAdvanced { watermark: i64 },
    SafetyNet,
    Manual,
}

impl ChangeSignal {
    pub fn trigger(&self) -> &'static str {
        match self {
            ChangeSignal::Startup => "startup",
            ChangeSignal::AuditAdvanced { .. } => "audit",
            ChangeSignal::SafetyNet => "safety_net",
            ChangeSignal::Manual => "manual",
        }
    }
}

#[derive(Debug)]
enum DebounceState<S> {
    Idle,
    Running,
    RunningWithPending(S),
}

/// Single-slot debouncer. While a run is in flight only the latest offered
/// signal is kept; it starts one follow-up run when the current one ends.
#[derive(Debug)]
pub struct Debouncer<S> {
    state: DebounceState<S>,
}

impl<S> Default for Debouncer<S> {
    fn default() -> Self {
        Self {
            state: DebounceState::Idle,
        }
    }
}

impl<S> Debouncer<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the signal to start a run with now, or `None` if a run is
    /// in flight and the signal was parked.
    pub fn offer(&mut self, signal: S) -> Option<S> {
        match std::mem::replace(&mut self.state, DebounceState::Running) {
            DebounceState::Idle => Some(signal),
            DebounceState::Running | DebounceState::RunningWithPending(_) => {
                self.state = DebounceState::RunningWithPending(signal);
                None
            }
        }
    }

    /// Mark the in-flight run finished. Returns the parked signal, if any,
    /// which the caller must start a run with.
    pub fn finish(&mut self) -> Option<S> {
        match std::mem::replace(&mut self.state, DebounceState::Idle) {
            DebounceState::RunningWithPending(signal) => {
                self.state = DebounceState::Running;
                Some(signal)
            }
            DebounceState::Idle | DebounceState::Running => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, DebounceState::Idle)
    }
}

/// Owns what a pass needs. Cheap to clone.
#[derive(Clone)]
pub struct Propagator {
    db: DatabaseConnection,
    lock: Arc<ClusterLock>,
    rules: Arc<Vec<Rule>>,
    page_size: u64,
}

impl Propagator {
    pub fn new(db: DatabaseConnection, lock: ClusterLock, rules: Vec<Rule>, page_size: u64) -> Self {
        Self {
            db,
            lock: Arc::new(lock),
            rules: Arc::new(rules),
            page_size,
        }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Process everything pending and return.
    pub async fn run_once(&self, signal: &ChangeSignal) -> Result<RunReport, SyncError> {
        engine::run_once(
            &self.db,
            &self.lock,
            &self.rules,
            self.page_size,
            signal.trigger(),
        )
        .await
    }

    /// Run once, then once more per burst of signals until `signals`
    /// closes. Failed passes are logged and retried on the next signal.
    pub async fn run(&self, mut signals: mpsc::Receiver<ChangeSignal>) -> Result<(), SyncError> {
        let mut debouncer = Debouncer::new();
        let mut in_flight = debouncer
            .offer(ChangeSignal::Startup)
            .map(|signal| self.spawn_pass(signal));
        let mut open = true;

        while open || in_flight.is_some() {
            tokio::select! {
                signal = signals.recv(), if open => match signal {
                    Some(signal) => {
                        if let Some(signal) = debouncer.offer(signal) {
                            in_flight = Some(self.spawn_pass(signal));
                        }
                    }
                    None => open = false,
                },
                joined = wait_for(&mut in_flight), if in_flight.is_some() => {
                    in_flight = None;
                    match joined {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => tracing::warn!(error = %e, "Propagation pass failed, waiting for the next signal"),
                        Err(e) => return Err(SyncError::Other(format!("propagation task failed: {e}"))),
                    }
                    in_flight = debouncer.finish().map(|signal| self.spawn_pass(signal));
                }
            }
        }

        tracing::info!("Change signal channel closed, propagator stopped");
        Ok(())
    }

    fn spawn_pass(&self, signal: ChangeSignal) -> JoinHandle<Result<RunReport, SyncError>> {
        let this = self.clone();
        tokio::spawn(async move {
            tracing::debug!(?signal, "Starting propagation pass");
            this.run_once(&signal).await
        })
    }
}

async fn wait_for(
    handle: &mut Option<JoinHandle<Result<RunReport, SyncError>>>,
) -> Result<Result<RunReport, SyncError>, JoinError> {
    match handle {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

/// Poll the audit watermark and signal whenever it moves. Stops when the
/// receiving side is gone.
pub fn spawn_audit_poller(
    db: DatabaseConnection,
    every: Duration,
    signals: mpsc::Sender<ChangeSignal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut seen = None;

        loop {
            ticker.tick().await;
            let watermark = match audit::latest_event_id(&db).await {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read audit watermark");
                    continue;
                }
            };
            let moved = seen.is_some_and(|previous| watermark > previous);
            seen = Some(watermark);
            if !moved {
                continue;
            }
            if signals
                .send(ChangeSignal::AuditAdvanced { watermark })
                .await
                .is_err()
            {
                break;
            }
        }
    })
}

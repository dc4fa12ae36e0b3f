use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SyncError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(permsync::io))]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    #[diagnostic(code(permsync::config))]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(permsync::serde))]
    Serde(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    #[diagnostic(code(permsync::db))]
    Db(#[from] sea_orm::DbErr),

    #[error("Invalid rule `{rule}`: {reason}")]
    #[diagnostic(
        code(permsync::invalid_rule),
        help("Check the rule's `targets`, `target_type` and `group_name` against the schema plan")
    )]
    InvalidRule { rule: String, reason: String },

    #[error("Rule `{rule}` cannot resolve the permission target of audit event {event_id} after a group change")]
    #[diagnostic(
        code(permsync::unresolvable_target),
        help("Removing a row's permission target through an update is unsupported; fix the row or the rule, the event is retried on the next pass")
    )]
    UnresolvableTarget { rule: String, event_id: i64 },

    #[error("Malformed audit event {event_id}: {reason}")]
    #[diagnostic(code(permsync::malformed_event))]
    MalformedEvent { event_id: i64, reason: String },

    #[error("Lock error: {0}")]
    #[diagnostic(code(permsync::lock))]
    Lock(String),

    #[error("Scheduler error: {0}")]
    #[diagnostic(code(permsync::scheduler))]
    Scheduler(String),

    #[error("{0}")]
    #[diagnostic(code(permsync::other))]
    Other(String),
}

impl SyncError {
    /// Errors that abort only the rule being replayed. Anything else
    /// aborts the whole pass.
    pub fn is_rule_local(&self) -> bool {
        matches!(
            self,
            SyncError::UnresolvableTarget { .. } | SyncError::MalformedEvent { .. }
        )
    }
}

impl From<tokio_cron_scheduler::JobSchedulerError> for SyncError {
    fn from(value: tokio_cron_scheduler::JobSchedulerError) -> Self {
        SyncError::Scheduler(value.to_string())
    }
}

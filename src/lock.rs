//! Cluster-wide mutual exclusion for propagation passes.
//!
//! PostgreSQL holds a session advisory lock on a dedicated connection.
//! Other backends hold a lease row in `engine_locks`. Acquisition waits
//! without timeout.
use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection,
    EntityTrait, QueryFilter, Set, Statement,
};

use crate::entities;
use crate::errors::SyncError;

#[derive(Debug)]
enum Backend {
    /// Single-connection pool, so lock and unlock share a session
    Advisory(DatabaseConnection),
    Lease(DatabaseConnection),
}

#[derive(Debug)]
pub struct ClusterLock {
    name: String,
    holder: String,
    poll: Duration,
    backend: Backend,
}

impl ClusterLock {
    /// Pick the lock flavour for `db`. `url` opens the dedicated advisory
    /// connection on PostgreSQL.
    pub async fn connect(
        db: &DatabaseConnection,
        url: &str,
        name: &str,
        poll: Duration,
    ) -> Result<Self, SyncError> {
        let backend = match db.get_database_backend() {
            DatabaseBackend::Postgres => {
                let mut opts = ConnectOptions::new(url.to_string());
                opts.max_connections(1)
                    .min_connections(1)
                    .sqlx_logging(false);
                Backend::Advisory(Database::connect(opts).await?)
            }
            _ => Backend::Lease(db.clone()),
        };
        Ok(Self::with_backend(name, poll, backend))
    }

    /// Lease lock on `db` regardless of backend.
    pub fn lease(db: &DatabaseConnection, name: &str, poll: Duration) -> Self {
        Self::with_backend(name, poll, Backend::Lease(db.clone()))
    }

    fn with_backend(name: &str, poll: Duration, backend: Backend) -> Self {
        let holder = format!("{}-{:016x}", std::process::id(), rand::thread_rng().gen::<u64>());
        Self {
            name: name.to_string(),
            holder,
            poll,
            backend,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` while holding the lock. The lock is released whether `f`
    /// succeeds or not.
    pub async fn run_exclusive<F, Fut, T>(&self, f: F) -> Result<T, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        self.acquire().await?;
        let result = f().await;
        let released = self.release().await;

        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_err)) => {
                tracing::error!(lock = %self.name, error = %release_err, "Failed to release lock");
                Err(e)
            }
        }
    }

    async fn acquire(&self) -> Result<(), SyncError> {
        match &self.backend {
            Backend::Advisory(conn) => {
                conn.execute(Statement::from_sql_and_values(
                    DatabaseBackend::Postgres,
                    "SELECT pg_advisory_lock(hashtext($1))",
                    [self.name.clone().into()],
                ))
                .await?;
            }
            Backend::Lease(db) => {
                let mut waited = false;
                while !self.try_lease(db).await? {
                    if !waited {
                        tracing::info!(lock = %self.name, "Waiting for lock held by another process");
                        waited = true;
                    }
                    tokio::time::sleep(self.poll).await;
                }
            }
        }
        tracing::debug!(lock = %self.name, holder = %self.holder, "Lock acquired");
        Ok(())
    }

    async fn try_lease(&self, db: &DatabaseConnection) -> Result<bool, SyncError> {
        use entities::engine_lock::{ActiveModel, Column, Entity};

        let inserted = Entity::insert(ActiveModel {
            name: Set(self.name.clone()),
            holder: Set(self.holder.clone()),
            acquired_at: Set(Utc::now().timestamp()),
        })
        .on_conflict(OnConflict::column(Column::Name).do_nothing().to_owned())
        .exec_without_returning(db)
        .await?;
        Ok(inserted > 0)
    }

    async fn release(&self) -> Result<(), SyncError> {
        match &self.backend {
            Backend::Advisory(conn) => {
                conn.execute(Statement::from_sql_and_values(
                    DatabaseBackend::Postgres,
                    "SELECT pg_advisory_unlock(hashtext($1))",
                    [self.name.clone().into()],
                ))
                .await?;
            }
            Backend::Lease(db) => {
                use entities::engine_lock::{Column, Entity};

                let deleted = Entity::delete_many()
                    .filter(Column::Name.eq(self.name.as_str()))
                    .filter(Column::Holder.eq(self.holder.as_str()))
                    .exec(db)
                    .await?;
                if deleted.rows_affected == 0 {
                    return Err(SyncError::Lock(format!(
                        "lease `{}` was not held by {}",
                        self.name, self.holder
                    )));
                }
            }
        }
        tracing::debug!(lock = %self.name, "Lock released");
        Ok(())
    }
}

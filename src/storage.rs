use crate::errors::SyncError;
use crate::settings::Database as DbCfg;
use sea_orm::{Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;

pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection, SyncError> {
    let db = Database::connect(&cfg.url).await?;
    Ok(db)
}

/// Bring the schema up to date. Safe to call on every start.
pub async fn migrate(db: &DatabaseConnection) -> Result<(), SyncError> {
    migration::Migrator::up(db, None).await?;
    Ok(())
}

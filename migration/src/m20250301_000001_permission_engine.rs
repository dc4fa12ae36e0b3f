use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

/// Auto-increment primary key: BIGINT on Postgres, INTEGER on SQLite
/// (SQLite only allows AUTOINCREMENT on `INTEGER PRIMARY KEY`).
fn id_col<T: IntoIden + 'static>(manager: &SchemaManager, col: T) -> ColumnDef {
    match manager.get_database_backend() {
        sea_orm::DatabaseBackend::Postgres => ColumnDef::new(col)
            .big_integer()
            .not_null()
            .auto_increment()
            .primary_key()
            .to_owned(),
        _ => ColumnDef::new(col)
            .integer()
            .not_null()
            .auto_increment()
            .primary_key()
            .to_owned(),
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Audit trail (written by the storage layer, read by the engine)
        manager
            .create_table(
                Table::create()
                    .table(AuditLog::Table)
                    .if_not_exists()
                    .col(id_col(manager, AuditLog::EventId))
                    .col(string(AuditLog::SchemaName))
                    .col(string(AuditLog::TableName))
                    .col(string(AuditLog::Action))
                    .col(text(AuditLog::RowData))
                    .col(text_null(AuditLog::ChangedFields))
                    .col(big_integer(AuditLog::CreatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_audit_log_table_event")
                    .table(AuditLog::Table)
                    .col(AuditLog::SchemaName)
                    .col(AuditLog::TableName)
                    .col(AuditLog::EventId)
                    .to_owned(),
            )
            .await?;

        // Per-rule progress
        manager
            .create_table(
                Table::create()
                    .table(GeneratedPermissionCursors::Table)
                    .if_not_exists()
                    .col(id_col(manager, GeneratedPermissionCursors::Id))
                    .col(string(GeneratedPermissionCursors::Name))
                    .col(string(GeneratedPermissionCursors::ConfigHash))
                    .col(
                        ColumnDef::new(GeneratedPermissionCursors::LastEvent)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(GeneratedPermissionCursors::Active)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(big_integer(GeneratedPermissionCursors::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_cursors_name_hash")
                    .table(GeneratedPermissionCursors::Table)
                    .col(GeneratedPermissionCursors::Name)
                    .col(GeneratedPermissionCursors::ConfigHash)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Permissions::Table)
                    .if_not_exists()
                    .col(id_col(manager, Permissions::Id))
                    .col(string(Permissions::ResourceGroup))
                    .col(string(Permissions::ResourceType))
                    .col(string_null(Permissions::ResourceKey))
                    .col(string(Permissions::Permission))
                    .to_owned(),
            )
            .await?;

        // NULL keys never collide in a plain unique index: instance and
        // type-wide permissions each get a partial one
        let db = manager.get_connection();
        db.execute_unprepared(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_permissions_instance_key \
             ON permissions (resource_group, resource_type, resource_key, permission) \
             WHERE resource_key IS NOT NULL",
        )
        .await?;
        db.execute_unprepared(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_permissions_type_key \
             ON permissions (resource_group, resource_type, permission) \
             WHERE resource_key IS NULL",
        )
        .await?;

        manager
            .create_table(
                Table::create()
                    .table(Groups::Table)
                    .if_not_exists()
                    .col(id_col(manager, Groups::Id))
                    .col(
                        ColumnDef::new(Groups::Name)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(GroupMemberships::Table)
                    .if_not_exists()
                    .col(string(GroupMemberships::UserKey))
                    .col(big_integer(GroupMemberships::GroupId))
                    .col(
                        ColumnDef::new(GroupMemberships::Sources)
                            .text()
                            .not_null()
                            .default("[]"),
                    )
                    .primary_key(
                        Index::create()
                            .col(GroupMemberships::UserKey)
                            .col(GroupMemberships::GroupId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(UserPermissions::Table)
                    .if_not_exists()
                    .col(string(UserPermissions::UserKey))
                    .col(big_integer(UserPermissions::PermissionId))
                    .col(
                        ColumnDef::new(UserPermissions::Sources)
                            .text()
                            .not_null()
                            .default("[]"),
                    )
                    .primary_key(
                        Index::create()
                            .col(UserPermissions::UserKey)
                            .col(UserPermissions::PermissionId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(GroupPermissions::Table)
                    .if_not_exists()
                    .col(big_integer(GroupPermissions::GroupId))
                    .col(big_integer(GroupPermissions::PermissionId))
                    .col(
                        ColumnDef::new(GroupPermissions::Sources)
                            .text()
                            .not_null()
                            .default("[]"),
                    )
                    .primary_key(
                        Index::create()
                            .col(GroupPermissions::GroupId)
                            .col(GroupPermissions::PermissionId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_group_permissions_permission")
                    .table(GroupPermissions::Table)
                    .col(GroupPermissions::PermissionId)
                    .to_owned(),
            )
            .await?;

        // Lease lock for backends without advisory locks
        manager
            .create_table(
                Table::create()
                    .table(EngineLocks::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(EngineLocks::Name)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(EngineLocks::Holder))
                    .col(big_integer(EngineLocks::AcquiredAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(PropagationRuns::Table)
                    .if_not_exists()
                    .col(id_col(manager, PropagationRuns::Id))
                    .col(string(PropagationRuns::Trigger))
                    .col(big_integer(PropagationRuns::StartedAt))
                    .col(big_integer_null(PropagationRuns::CompletedAt))
                    .col(boolean_null(PropagationRuns::Success))
                    .col(string_null(PropagationRuns::ErrorMessage))
                    .col(big_integer_null(PropagationRuns::EventsApplied))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_propagation_runs_started")
                    .table(PropagationRuns::Table)
                    .col(PropagationRuns::StartedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(PropagationRuns::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(EngineLocks::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(GroupPermissions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(UserPermissions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(GroupMemberships::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Groups::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Permissions::Table).to_owned())
            .await?;
        manager
            .drop_table(
                Table::drop()
                    .table(GeneratedPermissionCursors::Table)
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(AuditLog::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum AuditLog {
    Table,
    EventId,
    SchemaName,
    TableName,
    Action,
    RowData,
    ChangedFields,
    CreatedAt,
}

#[derive(DeriveIden)]
enum GeneratedPermissionCursors {
    Table,
    Id,
    Name,
    ConfigHash,
    LastEvent,
    Active,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Permissions {
    Table,
    Id,
    ResourceGroup,
    ResourceType,
    ResourceKey,
    Permission,
}

#[derive(DeriveIden)]
enum Groups {
    Table,
    Id,
    Name,
}

#[derive(DeriveIden)]
enum GroupMemberships {
    Table,
    UserKey,
    GroupId,
    Sources,
}

#[derive(DeriveIden)]
enum UserPermissions {
    Table,
    UserKey,
    PermissionId,
    Sources,
}

#[derive(DeriveIden)]
enum GroupPermissions {
    Table,
    GroupId,
    PermissionId,
    Sources,
}

#[derive(DeriveIden)]
enum EngineLocks {
    Table,
    Name,
    Holder,
    AcquiredAt,
}

#[derive(DeriveIden)]
enum PropagationRuns {
    Table,
    Id,
    Trigger,
    StartedAt,
    CompletedAt,
    Success,
    ErrorMessage,
    EventsApplied,
}

use permsync::entities;
use sea_orm::{Database, DatabaseConnection, EntityTrait};
use sea_orm_migration::MigratorTrait;
use tempfile::NamedTempFile;

/// Test database with automatic cleanup
pub struct TestDb {
    connection: DatabaseConnection,
    _temp_file: NamedTempFile,
}

impl TestDb {
    /// Create a new test database with migrations applied
    pub async fn new() -> Self {
        // Create temporary SQLite database file
        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        let db_path = temp_file.path().to_str().expect("Invalid temp file path");
        let db_url = format!("sqlite://{}?mode=rwc", db_path);

        // Connect to database
        let connection = Database::connect(&db_url)
            .await
            .expect("Failed to connect to test database");

        // Run migrations
        migration::Migrator::up(&connection, None)
            .await
            .expect("Failed to run migrations");

        Self {
            connection,
            _temp_file: temp_file,
        }
    }

    /// Get database connection
    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }
}

/// Every assignment and membership, rendered and sorted so two states of
/// the Grant Store compare with `assert_eq!`.
pub async fn grant_snapshot(db: &DatabaseConnection) -> Vec<String> {
    let permissions = entities::Permission::find()
        .all(db)
        .await
        .expect("Failed to load permissions");
    let describe = |id: i64| {
        permissions
            .iter()
            .find(|p| p.id == id)
            .map(|p| {
                format!(
                    "{}.{}/{}:{}",
                    p.resource_group,
                    p.resource_type,
                    p.resource_key.as_deref().unwrap_or("*"),
                    p.permission
                )
            })
            .unwrap_or_else(|| format!("#{id}"))
    };

    let mut out = Vec::new();
    for row in entities::GroupPermission::find()
        .all(db)
        .await
        .expect("Failed to load group permissions")
    {
        out.push(format!("group {} {} {}", row.group_id, describe(row.permission_id), row.sources));
    }
    for row in entities::UserPermission::find()
        .all(db)
        .await
        .expect("Failed to load user permissions")
    {
        out.push(format!("user {} {} {}", row.user_key, describe(row.permission_id), row.sources));
    }
    for row in entities::GroupMembership::find()
        .all(db)
        .await
        .expect("Failed to load memberships")
    {
        out.push(format!("member {} {} {}", row.user_key, row.group_id, row.sources));
    }
    out.sort();
    out
}

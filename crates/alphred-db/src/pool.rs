use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::config::DbConfig;

/// Open the embedded store: connect to the database file and bring its
/// schema up to date.
///
/// An embedded database has no separate provisioning step, so schema
/// setup rides along with opening the pool: the first open of a fresh
/// file leaves a fully usable store behind, and reopening an existing
/// one applies whatever migrations it is missing.
pub async fn open(config: &DbConfig) -> Result<SqlitePool> {
    let pool = create_pool(config).await?;
    apply_migrations(&pool).await?;
    Ok(pool)
}

/// Create a connection pool against the configured database file,
/// without touching the schema.
///
/// The database file (and its parent directory) are created on first
/// use. WAL journal mode allows one writer alongside concurrent
/// readers; foreign keys are enforced so run deletion cascades; the
/// busy timeout absorbs short write contention instead of surfacing
/// `SQLITE_BUSY`.
pub async fn create_pool(config: &DbConfig) -> Result<SqlitePool> {
    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("failed to create database directory {}", parent.display())
        })?;
    }

    let options = SqliteConnectOptions::new()
        .filename(&config.database_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
        .with_context(|| {
            format!(
                "failed to open database at {}",
                config.database_path.display()
            )
        })?;

    Ok(pool)
}

/// Apply any pending migrations from the scripts bundled with this
/// crate. Safe to call repeatedly; already-applied scripts are skipped.
///
/// Scripts are loaded from disk at runtime rather than embedded with
/// `sqlx::migrate!()`, so the schema evolves without recompiling every
/// caller and the tests exercise exactly the scripts that ship in
/// `migrations/`. `CARGO_MANIFEST_DIR` is fixed when this crate is
/// compiled, so the lookup works from any working directory as long as
/// the source tree is present; embedders that deploy without it should
/// embed the scripts on their side instead.
pub async fn apply_migrations(pool: &SqlitePool) -> Result<()> {
    let migrations_dir = Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"));

    let migrator = sqlx::migrate::Migrator::new(migrations_dir)
        .await
        .with_context(|| {
            format!(
                "failed to load migration scripts from {}",
                migrations_dir.display()
            )
        })?;

    migrator
        .run(pool)
        .await
        .context("failed to bring database schema up to date")?;

    info!("database schema up to date");
    Ok(())
}

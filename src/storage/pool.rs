//! Database connection pool management.

use std::path::Path;
use std::sync::Arc;

use log::info;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::config::{DB_PATH, DB_PATH_ENV};
use crate::error_handling::DatabaseError;

/// Initializes the connection pool at the default location, honouring the
/// `STARTTLS_AUDIT_DB_PATH` environment variable when set.
pub async fn init_db_pool() -> Result<Arc<SqlitePool>, DatabaseError> {
    let db_path = std::env::var(DB_PATH_ENV).unwrap_or_else(|_| DB_PATH.to_string());
    init_db_pool_with_path(Path::new(&db_path)).await
}

/// Initializes a connection pool at an explicit path.
///
/// The database file is created on first connect, and WAL journaling is
/// enabled so reads can proceed while a bulk scan writes.
pub async fn init_db_pool_with_path(db_path: &Path) -> Result<Arc<SqlitePool>, DatabaseError> {
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    info!("database ready at {}", db_path.display());
    Ok(Arc::new(pool))
}

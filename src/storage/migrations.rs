//! Database migration management.

use sqlx::migrate::Migrator;
use sqlx::SqlitePool;

// Compiled into the binary, so deployed copies never need the migrations
// directory alongside the executable.
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Applies any pending schema migrations to `pool`.
///
/// Already-applied migrations are skipped, so calling this at every startup
/// is safe.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), anyhow::Error> {
    MIGRATOR.run(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_apply_to_a_fresh_database() {
        // One connection only: each pooled :memory: connection would open
        // its own database.
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("pool");
        run_migrations(&pool).await.expect("migrations");
        // Applying twice must be a no-op.
        run_migrations(&pool).await.expect("rerun");

        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .expect("tables");
        let names: Vec<&str> = tables.iter().map(|(name,)| name.as_str()).collect();
        for expected in [
            "aggregated_scans",
            "blacklisted_emails",
            "hostname_scans",
            "pending_policies",
            "policies",
            "scans",
            "tokens",
        ] {
            assert!(names.contains(&expected), "missing table {expected}");
        }
    }
}

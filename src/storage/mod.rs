//! Persistence contracts and adapters.
//!
//! Every store is a capability trait so collaborators depend on behaviour,
//! not on SQL: the checker's cache takes any [`HostnameScanStore`], the
//! submission workflow any [`ScanStore`]/[`PolicyStore`]/[`TokenStore`].
//! [`SqlDatabase`] implements the lot over SQLite; [`memory`] provides
//! in-process equivalents used as the default cache backing and as test
//! fakes.

pub mod memory;
mod migrations;
mod pool;
mod sql;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::checker::{AggregatedScan, HostnameResult};
use crate::error_handling::DatabaseError;
use crate::models::{PolicySubmission, Scan, Token};
use crate::stats::Series;

pub use memory::MemoryStore;
pub use migrations::run_migrations;
pub use pool::{init_db_pool, init_db_pool_with_path};
pub use sql::{PolicyDb, SqlDatabase};

/// Read/write access to cached hostname scans.
#[async_trait]
pub trait HostnameScanStore: Send + Sync {
    /// The most recent stored scan of `hostname`, with the instant it was
    /// stored. `None` when the hostname was never scanned.
    async fn get_hostname(
        &self,
        hostname: &str,
    ) -> Result<Option<(HostnameResult, DateTime<Utc>)>, DatabaseError>;

    /// Records a fresh scan of `hostname`.
    async fn put_hostname(
        &self,
        hostname: &str,
        result: &HostnameResult,
    ) -> Result<(), DatabaseError>;
}

/// Persisted whole-domain scans.
#[async_trait]
pub trait ScanStore: Send + Sync {
    /// The most recent scan of `domain`.
    async fn get_latest_scan(&self, domain: &str) -> Result<Scan, DatabaseError>;

    /// Appends a scan row.
    async fn put_scan(&self, scan: &Scan) -> Result<(), DatabaseError>;

    /// Every scan recorded for `domain`.
    async fn get_all_scans(&self, domain: &str) -> Result<Vec<Scan>, DatabaseError>;
}

/// One of the two policy submission stores (pending or active).
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Inserts the submission, replacing any existing row for its domain.
    async fn put_or_update(&self, submission: &PolicySubmission) -> Result<(), DatabaseError>;

    /// The stored submission for `domain`.
    async fn get(&self, domain: &str) -> Result<PolicySubmission, DatabaseError>;

    /// Removes and returns the stored submission for `domain`.
    async fn remove(&self, domain: &str) -> Result<PolicySubmission, DatabaseError>;

    /// All submissions with the given MTA-STS flag.
    async fn list(&self, mta_sts: bool) -> Result<Vec<PolicySubmission>, DatabaseError>;
}

/// Email validation tokens.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Mints a fresh token for `domain`, invalidating any previous one.
    async fn put_token(&self, domain: &str) -> Result<Token, DatabaseError>;

    /// Atomically redeems `token`, returning its domain. Fails when the
    /// token is unknown, already used, or expired.
    async fn use_token(&self, token: &str) -> Result<String, DatabaseError>;

    /// The current token for `domain`.
    async fn get_token_by_domain(&self, domain: &str) -> Result<Token, DatabaseError>;
}

/// Aggregated sweep statistics.
#[async_trait]
pub trait StatsStore: Send + Sync {
    /// Records one aggregated sweep; duplicate `(time, source)` rows are
    /// ignored, so the operation is idempotent.
    async fn put_aggregated_scan(&self, scan: &AggregatedScan) -> Result<(), DatabaseError>;

    /// The time series recorded for `source`.
    async fn get_stats(&self, source: &str) -> Result<Series, DatabaseError>;
}

/// Addresses we must not send validation mail to.
#[async_trait]
pub trait EmailBlacklistStore: Send + Sync {
    /// Records a bounce or complaint for `email`.
    async fn put_blacklisted_email(
        &self,
        email: &str,
        reason: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Whether `email` has bounced or complained before.
    async fn is_blacklisted_email(&self, email: &str) -> Result<bool, DatabaseError>;
}

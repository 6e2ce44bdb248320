//! Timeouts, limits, and other tunables.

use std::time::Duration;

/// Deadline for a full per-domain scan. Probes still in flight when it
/// fires are finalized as errors.
pub const SCAN_TIMEOUT: Duration = Duration::from_secs(10);

/// Budget for the TCP dial to an SMTP server.
pub const SMTP_DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Budget for a single SMTP command round-trip after connecting.
pub const SMTP_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Budget for DNS lookups.
pub const DNS_TIMEOUT: Duration = Duration::from_secs(5);

/// Budget for the MTA-STS policy file fetch.
pub const POLICY_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a cached hostname scan stays fresh.
pub const CACHE_EXPIRE_TIME: Duration = Duration::from_secs(10 * 60);

/// Fixed size of the bulk scanning worker pool.
pub const POOL_SIZE: usize = 16;

/// Pause between rows handed to the bulk worker pool.
pub const CSV_FEED_INTERVAL: Duration = Duration::from_millis(100);

/// Concurrent MX probes per domain.
pub const MX_CONCURRENCY: usize = 4;

/// Upper bound of MX hostnames probed per domain.
pub const MAX_MX_PROBES: usize = 8;

/// Most MX patterns allowed in one submitted policy.
pub const MAX_HOSTNAMES: usize = 8;

/// Validation token lifetime.
pub const TOKEN_TTL: Duration = Duration::from_secs(72 * 60 * 60);

/// How recent a scan must be to back a policy submission.
pub const SCAN_FRESHNESS: Duration = Duration::from_secs(10 * 60);

/// How often the remote policy list is refreshed.
pub const LIST_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// How often remote aggregated stats are imported.
pub const STATS_IMPORT_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Bulk progress logging cadence, in processed domains.
pub const PROGRESS_LOG_INTERVAL: i64 = 1000;

/// Highest acceptable MTA-STS max_age, one year in seconds.
pub const MTA_STS_MAX_AGE_CAP: i64 = 31_557_600;

/// Default SQLite database location.
pub const DB_PATH: &str = "./starttls_audit.db";

/// Environment variable overriding [`DB_PATH`].
pub const DB_PATH_ENV: &str = "STARTTLS_AUDIT_DB_PATH";

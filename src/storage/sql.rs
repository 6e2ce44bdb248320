//! SQLite-backed store implementations.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use sqlx::{Row, SqlitePool};

use crate::checker::{AggregatedScan, HostnameResult};
use crate::config::TOKEN_TTL;
use crate::error_handling::DatabaseError;
use crate::models::{PolicySubmission, Scan, Token};
use crate::policy::TlsPolicy;
use crate::stats::{Series, LOCAL_SOURCE};
use crate::storage::{
    EmailBlacklistStore, HostnameScanStore, PolicyStore, ScanStore, StatsStore, TokenStore,
};

/// The SQLite database, carrying the two policy submission stores.
pub struct SqlDatabase {
    pool: Arc<SqlitePool>,
    /// Active submissions; updates are gated by the submission rules.
    pub policies: PolicyDb,
    /// Submissions awaiting email validation; freely overwritten.
    pub pending_policies: PolicyDb,
}

impl SqlDatabase {
    /// Wraps an initialized pool. Run
    /// [`crate::storage::run_migrations`] before first use.
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        SqlDatabase {
            policies: PolicyDb {
                pool: Arc::clone(&pool),
                table: "policies",
            },
            pending_policies: PolicyDb {
                pool: Arc::clone(&pool),
                table: "pending_policies",
            },
            pool,
        }
    }

    /// Rolls the 14 days of scans preceding `date` into one aggregated row
    /// under the local source, and stores it.
    pub async fn put_local_stats(
        &self,
        date: DateTime<Utc>,
    ) -> Result<AggregatedScan, DatabaseError> {
        let start = date - Duration::days(14);
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(domain) AS total,
                COALESCE(SUM(CASE WHEN mta_sts_mode = 'testing' THEN 1 ELSE 0 END), 0) AS testing,
                COALESCE(SUM(CASE WHEN mta_sts_mode = 'enforce' THEN 1 ELSE 0 END), 0) AS enforce
            FROM (
                SELECT domain, mta_sts_mode, MAX(timestamp) AS timestamp
                FROM scans
                WHERE timestamp BETWEEN ? AND ?
                GROUP BY domain
            )
            "#,
        )
        .bind(start)
        .bind(date)
        .fetch_one(self.pool.as_ref())
        .await?;

        let scan = AggregatedScan {
            time: date,
            source: LOCAL_SOURCE.to_string(),
            attempted: 0,
            with_mxs: row.try_get("total")?,
            mta_sts_testing: row.try_get("testing")?,
            mta_sts_enforce: row.try_get("enforce")?,
        };
        self.put_aggregated_scan(&scan).await?;
        Ok(scan)
    }
}

// 8 random bytes from the OS give 64 bits of entropy per token.
fn rand_token() -> String {
    let mut bytes = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[async_trait]
impl ScanStore for SqlDatabase {
    async fn get_latest_scan(&self, domain: &str) -> Result<Scan, DatabaseError> {
        let row = sqlx::query(
            "SELECT domain, scandata, timestamp, version FROM scans
             WHERE domain = ?1 AND timestamp = (SELECT MAX(timestamp) FROM scans WHERE domain = ?1)",
        )
        .bind(domain)
        .fetch_one(self.pool.as_ref())
        .await?;
        scan_from_row(&row)
    }

    async fn put_scan(&self, scan: &Scan) -> Result<(), DatabaseError> {
        let scandata = serde_json::to_string(&scan.data)?;
        let mta_sts_mode = scan
            .data
            .mta_sts_result
            .as_ref()
            .map(|sts| sts.mode.as_str())
            .unwrap_or("");
        sqlx::query(
            "INSERT INTO scans (domain, scandata, timestamp, version, mta_sts_mode)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&scan.domain)
        .bind(scandata)
        .bind(scan.timestamp)
        .bind(scan.version)
        .bind(mta_sts_mode)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn get_all_scans(&self, domain: &str) -> Result<Vec<Scan>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT domain, scandata, timestamp, version FROM scans WHERE domain = ? ORDER BY timestamp",
        )
        .bind(domain)
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.iter().map(scan_from_row).collect()
    }
}

fn scan_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Scan, DatabaseError> {
    let scandata: String = row.try_get("scandata")?;
    Ok(Scan {
        domain: row.try_get("domain")?,
        data: serde_json::from_str(&scandata)?,
        timestamp: row.try_get("timestamp")?,
        version: row.try_get("version")?,
    })
}

#[async_trait]
impl TokenStore for SqlDatabase {
    async fn put_token(&self, domain: &str) -> Result<Token, DatabaseError> {
        let token = Token {
            domain: domain.to_string(),
            token: rand_token(),
            expires: Utc::now() + Duration::from_std(TOKEN_TTL).unwrap_or_else(|_| Duration::hours(72)),
            used: false,
        };
        sqlx::query(
            "INSERT INTO tokens (domain, token, expires, used) VALUES (?, ?, ?, 0)
             ON CONFLICT (domain) DO UPDATE SET token = excluded.token, expires = excluded.expires, used = 0",
        )
        .bind(&token.domain)
        .bind(&token.token)
        .bind(token.expires)
        .execute(self.pool.as_ref())
        .await?;
        Ok(token)
    }

    async fn use_token(&self, token: &str) -> Result<String, DatabaseError> {
        let row = sqlx::query(
            "UPDATE tokens SET used = 1 WHERE token = ? AND used = 0 AND expires > ? RETURNING domain",
        )
        .bind(token)
        .bind(Utc::now())
        .fetch_one(self.pool.as_ref())
        .await?;
        Ok(row.try_get("domain")?)
    }

    async fn get_token_by_domain(&self, domain: &str) -> Result<Token, DatabaseError> {
        let row = sqlx::query("SELECT domain, token, expires, used FROM tokens WHERE domain = ?")
            .bind(domain)
            .fetch_one(self.pool.as_ref())
            .await?;
        Ok(Token {
            domain: row.try_get("domain")?,
            token: row.try_get("token")?,
            expires: row.try_get("expires")?,
            used: row.try_get("used")?,
        })
    }
}

#[async_trait]
impl HostnameScanStore for SqlDatabase {
    async fn get_hostname(
        &self,
        hostname: &str,
    ) -> Result<Option<(HostnameResult, DateTime<Utc>)>, DatabaseError> {
        let row = sqlx::query(
            "SELECT scandata, timestamp FROM hostname_scans
             WHERE hostname = ?1 AND timestamp = (SELECT MAX(timestamp) FROM hostname_scans WHERE hostname = ?1)",
        )
        .bind(hostname)
        .fetch_optional(self.pool.as_ref())
        .await?;
        match row {
            Some(row) => {
                let scandata: String = row.try_get("scandata")?;
                let result: HostnameResult = serde_json::from_str(&scandata)?;
                let stored_at: DateTime<Utc> = row.try_get("timestamp")?;
                Ok(Some((result, stored_at)))
            }
            None => Ok(None),
        }
    }

    async fn put_hostname(
        &self,
        hostname: &str,
        result: &HostnameResult,
    ) -> Result<(), DatabaseError> {
        let scandata = serde_json::to_string(result)?;
        sqlx::query(
            "INSERT INTO hostname_scans (hostname, status, scandata, timestamp) VALUES (?, ?, ?, ?)",
        )
        .bind(hostname)
        .bind(result.status.as_u8() as i64)
        .bind(scandata)
        .bind(Utc::now())
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }
}

#[async_trait]
impl StatsStore for SqlDatabase {
    async fn put_aggregated_scan(&self, scan: &AggregatedScan) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO aggregated_scans (time, source, attempted, with_mxs, mta_sts_testing, mta_sts_enforce)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (time, source) DO NOTHING",
        )
        .bind(scan.time)
        .bind(&scan.source)
        .bind(scan.attempted)
        .bind(scan.with_mxs)
        .bind(scan.mta_sts_testing)
        .bind(scan.mta_sts_enforce)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn get_stats(&self, source: &str) -> Result<Series, DatabaseError> {
        let rows = sqlx::query(
            "SELECT time, source, attempted, with_mxs, mta_sts_testing, mta_sts_enforce
             FROM aggregated_scans WHERE source = ? ORDER BY time",
        )
        .bind(source)
        .fetch_all(self.pool.as_ref())
        .await?;
        let mut series = Series::default();
        for row in rows {
            series.insert(AggregatedScan {
                time: row.try_get("time")?,
                source: row.try_get("source")?,
                attempted: row.try_get("attempted")?,
                with_mxs: row.try_get("with_mxs")?,
                mta_sts_testing: row.try_get("mta_sts_testing")?,
                mta_sts_enforce: row.try_get("mta_sts_enforce")?,
            });
        }
        Ok(series)
    }
}

#[async_trait]
impl EmailBlacklistStore for SqlDatabase {
    async fn put_blacklisted_email(
        &self,
        email: &str,
        reason: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        sqlx::query("INSERT INTO blacklisted_emails (email, reason, timestamp) VALUES (?, ?, ?)")
            .bind(email)
            .bind(reason)
            .bind(timestamp)
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }

    async fn is_blacklisted_email(&self, email: &str) -> Result<bool, DatabaseError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM blacklisted_emails WHERE email = ?")
                .bind(email)
                .fetch_one(self.pool.as_ref())
                .await?;
        Ok(count > 0)
    }
}

/// One policy submission table. The active and pending stores share this
/// implementation and differ only in the rules their callers apply.
pub struct PolicyDb {
    pool: Arc<SqlitePool>,
    table: &'static str,
}

#[async_trait]
impl PolicyStore for PolicyDb {
    async fn put_or_update(&self, submission: &PolicySubmission) -> Result<(), DatabaseError> {
        let (mode, mxs) = match &submission.policy {
            Some(policy) => (policy.mode.clone(), serde_json::to_string(&policy.mxs)?),
            None => (String::new(), "[]".to_string()),
        };
        let query = format!(
            "INSERT INTO {} (domain, email, mta_sts, mode, mxs) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (domain) DO UPDATE SET
                email = excluded.email, mta_sts = excluded.mta_sts,
                mode = excluded.mode, mxs = excluded.mxs",
            self.table
        );
        sqlx::query(&query)
            .bind(&submission.domain)
            .bind(&submission.contact_email)
            .bind(submission.mta_sts)
            .bind(mode)
            .bind(mxs)
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }

    async fn get(&self, domain: &str) -> Result<PolicySubmission, DatabaseError> {
        let query = format!(
            "SELECT domain, email, mta_sts, mode, mxs FROM {} WHERE domain = ?",
            self.table
        );
        let row = sqlx::query(&query)
            .bind(domain)
            .fetch_one(self.pool.as_ref())
            .await?;
        submission_from_row(&row)
    }

    async fn remove(&self, domain: &str) -> Result<PolicySubmission, DatabaseError> {
        let query = format!(
            "DELETE FROM {} WHERE domain = ? RETURNING domain, email, mta_sts, mode, mxs",
            self.table
        );
        let row = sqlx::query(&query)
            .bind(domain)
            .fetch_one(self.pool.as_ref())
            .await?;
        submission_from_row(&row)
    }

    async fn list(&self, mta_sts: bool) -> Result<Vec<PolicySubmission>, DatabaseError> {
        let query = format!(
            "SELECT domain, email, mta_sts, mode, mxs FROM {} WHERE mta_sts = ? ORDER BY domain",
            self.table
        );
        let rows = sqlx::query(&query)
            .bind(mta_sts)
            .fetch_all(self.pool.as_ref())
            .await?;
        rows.iter().map(submission_from_row).collect()
    }
}

fn submission_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<PolicySubmission, DatabaseError> {
    let mta_sts: bool = row.try_get("mta_sts")?;
    let policy = if mta_sts {
        None
    } else {
        let mxs: String = row.try_get("mxs")?;
        Some(TlsPolicy {
            mode: row.try_get("mode")?,
            mxs: serde_json::from_str(&mxs)?,
            ..TlsPolicy::default()
        })
    };
    Ok(PolicySubmission {
        domain: row.try_get("domain")?,
        contact_email: row.try_get("email")?,
        mta_sts,
        policy,
    })
}

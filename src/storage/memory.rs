//! In-memory store implementations.
//!
//! [`MemoryStore`] backs the default hostname scan cache. The remaining
//! types mirror the SQL stores over hash maps and exist so the submission
//! workflow can be exercised without a database; tests inject them through
//! the store traits.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;

use crate::checker::HostnameResult;
use crate::config::TOKEN_TTL;
use crate::error_handling::DatabaseError;
use crate::models::{PolicySubmission, Scan, Token};
use crate::storage::{HostnameScanStore, PolicyStore, ScanStore, TokenStore};

fn not_found() -> DatabaseError {
    DatabaseError::Sql(sqlx::Error::RowNotFound)
}

/// In-memory hostname scan store; the default cache backing.
#[derive(Default)]
pub struct MemoryStore {
    hostnames: Mutex<HashMap<String, (HostnameResult, DateTime<Utc>)>>,
}

#[async_trait]
impl HostnameScanStore for MemoryStore {
    async fn get_hostname(
        &self,
        hostname: &str,
    ) -> Result<Option<(HostnameResult, DateTime<Utc>)>, DatabaseError> {
        Ok(self
            .hostnames
            .lock()
            .expect("store lock poisoned")
            .get(hostname)
            .cloned())
    }

    async fn put_hostname(
        &self,
        hostname: &str,
        result: &HostnameResult,
    ) -> Result<(), DatabaseError> {
        self.hostnames
            .lock()
            .expect("store lock poisoned")
            .insert(hostname.to_string(), (result.clone(), Utc::now()));
        Ok(())
    }
}

/// In-memory policy submission store.
#[derive(Default)]
pub struct MemPolicyStore {
    submissions: Mutex<HashMap<String, PolicySubmission>>,
}

#[async_trait]
impl PolicyStore for MemPolicyStore {
    async fn put_or_update(&self, submission: &PolicySubmission) -> Result<(), DatabaseError> {
        self.submissions
            .lock()
            .expect("store lock poisoned")
            .insert(submission.domain.clone(), submission.clone());
        Ok(())
    }

    async fn get(&self, domain: &str) -> Result<PolicySubmission, DatabaseError> {
        self.submissions
            .lock()
            .expect("store lock poisoned")
            .get(domain)
            .cloned()
            .ok_or_else(not_found)
    }

    async fn remove(&self, domain: &str) -> Result<PolicySubmission, DatabaseError> {
        self.submissions
            .lock()
            .expect("store lock poisoned")
            .remove(domain)
            .ok_or_else(not_found)
    }

    async fn list(&self, mta_sts: bool) -> Result<Vec<PolicySubmission>, DatabaseError> {
        let mut submissions: Vec<PolicySubmission> = self
            .submissions
            .lock()
            .expect("store lock poisoned")
            .values()
            .filter(|submission| submission.mta_sts == mta_sts)
            .cloned()
            .collect();
        submissions.sort_by(|a, b| a.domain.cmp(&b.domain));
        Ok(submissions)
    }
}

/// In-memory scan store.
#[derive(Default)]
pub struct MemScanStore {
    scans: Mutex<HashMap<String, Vec<Scan>>>,
}

#[async_trait]
impl ScanStore for MemScanStore {
    async fn get_latest_scan(&self, domain: &str) -> Result<Scan, DatabaseError> {
        self.scans
            .lock()
            .expect("store lock poisoned")
            .get(domain)
            .and_then(|scans| scans.iter().max_by_key(|scan| scan.timestamp))
            .cloned()
            .ok_or_else(not_found)
    }

    async fn put_scan(&self, scan: &Scan) -> Result<(), DatabaseError> {
        self.scans
            .lock()
            .expect("store lock poisoned")
            .entry(scan.domain.clone())
            .or_default()
            .push(scan.clone());
        Ok(())
    }

    async fn get_all_scans(&self, domain: &str) -> Result<Vec<Scan>, DatabaseError> {
        Ok(self
            .scans
            .lock()
            .expect("store lock poisoned")
            .get(domain)
            .cloned()
            .unwrap_or_default())
    }
}

/// In-memory token store with the same single-use semantics as the SQL one.
#[derive(Default)]
pub struct MemTokenStore {
    tokens: Mutex<HashMap<String, Token>>,
}

#[async_trait]
impl TokenStore for MemTokenStore {
    async fn put_token(&self, domain: &str) -> Result<Token, DatabaseError> {
        let mut bytes = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let token = Token {
            domain: domain.to_string(),
            token: bytes.iter().map(|byte| format!("{byte:02x}")).collect(),
            expires: Utc::now()
                + Duration::from_std(TOKEN_TTL).unwrap_or_else(|_| Duration::hours(72)),
            used: false,
        };
        self.tokens
            .lock()
            .expect("store lock poisoned")
            .insert(domain.to_string(), token.clone());
        Ok(token)
    }

    async fn use_token(&self, token: &str) -> Result<String, DatabaseError> {
        let mut tokens = self.tokens.lock().expect("store lock poisoned");
        let entry = tokens
            .values_mut()
            .find(|entry| entry.token == token && !entry.used && entry.expires > Utc::now())
            .ok_or_else(not_found)?;
        entry.used = true;
        Ok(entry.domain.clone())
    }

    async fn get_token_by_domain(&self, domain: &str) -> Result<Token, DatabaseError> {
        self.tokens
            .lock()
            .expect("store lock poisoned")
            .get(domain)
            .cloned()
            .ok_or_else(not_found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_store_is_single_use() {
        let store = MemTokenStore::default();
        let token = store.put_token("example.com").await.unwrap();
        assert_eq!(store.use_token(&token.token).await.unwrap(), "example.com");
        assert!(store.use_token(&token.token).await.is_err());
    }

    #[tokio::test]
    async fn policy_store_round_trip() {
        let store = MemPolicyStore::default();
        let submission = PolicySubmission {
            domain: "example.com".into(),
            contact_email: "postmaster@example.com".into(),
            mta_sts: true,
            policy: None,
        };
        store.put_or_update(&submission).await.unwrap();
        assert_eq!(store.get("example.com").await.unwrap(), submission);
        assert_eq!(store.list(true).await.unwrap().len(), 1);
        assert!(store.list(false).await.unwrap().is_empty());
        store.remove("example.com").await.unwrap();
        assert!(store.get("example.com").await.is_err());
    }
}

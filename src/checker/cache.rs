//! Hostname scan cache.
//!
//! Probing a hostname costs several round-trips, and bulk scans hit the same
//! MX from many domains, so recent results are reused. Population is
//! single-flight: concurrent misses on one key run exactly one probe, and
//! every waiter receives the value it produced.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use log::warn;
use tokio::sync::OnceCell;

use crate::checker::hostname::HostnameResult;
use crate::config::CACHE_EXPIRE_TIME;
use crate::storage::{HostnameScanStore, MemoryStore};

/// TTL cache of hostname scans over a pluggable store.
pub struct ScanCache {
    store: Arc<dyn HostnameScanStore>,
    expire_time: Duration,
    in_flight: Mutex<HashMap<String, Arc<OnceCell<HostnameResult>>>>,
}

impl ScanCache {
    /// Cache over an arbitrary store, a persistence adapter included.
    pub fn new(store: Arc<dyn HostnameScanStore>, expire_time: Duration) -> Self {
        ScanCache {
            store,
            expire_time,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// In-memory cache with the given TTL.
    pub fn simple(expire_time: Duration) -> Self {
        ScanCache::new(Arc::new(MemoryStore::default()), expire_time)
    }

    /// Returns the cached result for `hostname` when it is younger than the
    /// TTL, otherwise runs `probe` and stores what it produced. Concurrent
    /// misses on the same hostname share one probe invocation.
    pub async fn get_or_probe<F, Fut>(&self, hostname: &str, probe: F) -> HostnameResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = HostnameResult>,
    {
        match self.store.get_hostname(hostname).await {
            Ok(Some((result, stored_at))) => {
                let age = Utc::now().signed_duration_since(stored_at);
                if age.to_std().map(|age| age < self.expire_time).unwrap_or(false) {
                    return result;
                }
            }
            Ok(None) => {}
            Err(e) => warn!("hostname cache read failed for {hostname}: {e}"),
        }

        let cell = {
            let mut in_flight = self.in_flight.lock().expect("cache lock poisoned");
            Arc::clone(in_flight.entry(hostname.to_string()).or_default())
        };
        let store = Arc::clone(&self.store);
        let key = hostname.to_string();
        let result = cell
            .get_or_init(|| async move {
                let result = probe().await;
                if let Err(e) = store.put_hostname(&key, &result).await {
                    warn!("hostname cache write failed for {key}: {e}");
                }
                result
            })
            .await
            .clone();

        // Retire the flight so later misses probe again once the TTL lapses.
        let mut in_flight = self.in_flight.lock().expect("cache lock poisoned");
        if let Some(existing) = in_flight.get(hostname) {
            if Arc::ptr_eq(existing, &cell) {
                in_flight.remove(hostname);
            }
        }
        result
    }
}

impl Default for ScanCache {
    fn default() -> Self {
        ScanCache::simple(CACHE_EXPIRE_TIME)
    }
}

//! Domain and hostname security checks.
//!
//! The [`Checker`] is the entry point: it discovers a domain's mail
//! exchangers, probes each one over SMTP/STARTTLS, validates MTA-STS
//! advertisement, and aggregates everything into a [`DomainResult`].
//! Hostname probes go through a TTL [`cache::ScanCache`] so bulk scans do
//! not hammer shared MX infrastructure.

pub mod cache;
mod domain;
mod hostname;
mod mta_sts;
pub mod result;
mod totals;

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use hickory_resolver::TokioAsyncResolver;

use crate::config::{CACHE_EXPIRE_TIME, MX_CONCURRENCY, SCAN_TIMEOUT};
use cache::ScanCache;

pub use domain::{DomainResult, SCAN_VERSION};
pub use hostname::{check_hostname, policy_matches, HostnameResult};
pub use mta_sts::{MtaStsResult, StsFetch};
pub use result::{CheckResult, Status};
pub use totals::{AggregatedScan, DomainTotals, ResultHandler};

type MxLookupHook =
    Arc<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<Vec<(u16, String)>>> + Send + Sync>;
type HostnameProbeHook = Arc<
    dyn Fn(String, String, Option<Vec<String>>) -> BoxFuture<'static, HostnameResult>
        + Send
        + Sync,
>;
type StsFetchHook = Arc<dyn Fn(String) -> BoxFuture<'static, StsFetch> + Send + Sync>;

/// Runs security checks against SMTP domains and hostnames.
///
/// Cloning is cheap; clones share the cache, the resolver, and the HTTP
/// client, so one `Checker` can fan out across a worker pool.
#[derive(Clone)]
pub struct Checker {
    pub(crate) timeout: Duration,
    pub(crate) cache: Arc<ScanCache>,
    pub(crate) resolver: Arc<TokioAsyncResolver>,
    pub(crate) policy_client: Arc<reqwest::Client>,
    pub(crate) mx_concurrency: usize,
    pub(crate) mx_lookup: Option<MxLookupHook>,
    pub(crate) hostname_probe: Option<HostnameProbeHook>,
    pub(crate) sts_fetch: Option<StsFetchHook>,
}

impl Checker {
    /// A checker with the default deadline and a 10-minute in-memory cache.
    ///
    /// `policy_client` must have redirects disabled; see
    /// [`crate::initialization::init_policy_client`].
    pub fn new(resolver: Arc<TokioAsyncResolver>, policy_client: Arc<reqwest::Client>) -> Self {
        Checker {
            timeout: SCAN_TIMEOUT,
            cache: Arc::new(ScanCache::simple(CACHE_EXPIRE_TIME)),
            resolver,
            policy_client,
            mx_concurrency: MX_CONCURRENCY,
            mx_lookup: None,
            hostname_probe: None,
            sts_fetch: None,
        }
    }

    /// Overrides the whole-scan deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replaces the hostname scan cache, for example with one backed by the
    /// persistence layer.
    pub fn with_cache(mut self, cache: ScanCache) -> Self {
        self.cache = Arc::new(cache);
        self
    }

    /// Replaces MX discovery. Used to pin DNS answers in tests.
    pub fn with_mx_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(String) -> BoxFuture<'static, anyhow::Result<Vec<(u16, String)>>>
            + Send
            + Sync
            + 'static,
    {
        self.mx_lookup = Some(Arc::new(lookup));
        self
    }

    /// Replaces the per-hostname probe. Used to pin SMTP behaviour in tests.
    pub fn with_hostname_probe<F>(mut self, probe: F) -> Self
    where
        F: Fn(String, String, Option<Vec<String>>) -> BoxFuture<'static, HostnameResult>
            + Send
            + Sync
            + 'static,
    {
        self.hostname_probe = Some(Arc::new(probe));
        self
    }

    /// Replaces the MTA-STS record and policy retrieval. Used to pin
    /// advertisement state in tests.
    pub fn with_sts_fetch<F>(mut self, fetch: F) -> Self
    where
        F: Fn(String) -> BoxFuture<'static, StsFetch> + Send + Sync + 'static,
    {
        self.sts_fetch = Some(Arc::new(fetch));
        self
    }
}

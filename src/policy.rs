//! Remote policy list client.
//!
//! The published policy list is process-wide, read-mostly state: a refresher
//! task replaces it wholesale on a timer, and readers share a lock that is
//! only taken exclusively for the swap. A failed refresh keeps the previous
//! list.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::checker::result::{CheckResult, POLICY_LIST};
use crate::storage::PolicyStore;

/// Default URL the policy list is fetched from.
pub const POLICY_URL: &str = "https://dl.eff.org/starttls-everywhere/policy.json";

/// A set of pinned public keys for a domain's certificates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pinset {
    /// SPKI hashes pinned for the domain.
    #[serde(rename = "static-spki-hashes", default)]
    pub static_spki_hashes: Vec<String>,
}

/// The TLS policy for one email domain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsPolicy {
    /// Name of a shared policy this entry delegates to.
    #[serde(rename = "policy-alias", default, skip_serializing_if = "String::is_empty")]
    pub policy_alias: String,
    /// Minimum TLS version the domain commits to.
    #[serde(rename = "min-tls-version", default, skip_serializing_if = "String::is_empty")]
    pub min_tls_version: String,
    /// Policy mode: `testing` or `enforce`.
    #[serde(default)]
    pub mode: String,
    /// MX patterns the domain's certificates must cover.
    #[serde(default)]
    pub mxs: Vec<String>,
    /// Pinset name, when the domain pins keys.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pin: String,
    /// Endpoint for TLSRPT-style failure reports.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub report: String,
}

fn unix_epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Raw shape of the published policy list.
#[derive(Debug, Clone, Deserialize)]
struct List {
    #[serde(default = "unix_epoch")]
    #[allow(dead_code)]
    timestamp: DateTime<Utc>,
    #[serde(default = "unix_epoch")]
    #[allow(dead_code)]
    expires: DateTime<Utc>,
    #[serde(default)]
    #[allow(dead_code)]
    version: String,
    #[serde(default)]
    #[allow(dead_code)]
    author: String,
    #[serde(default)]
    #[allow(dead_code)]
    pinsets: HashMap<String, Pinset>,
    #[serde(rename = "policy-aliases", default)]
    policy_aliases: HashMap<String, TlsPolicy>,
    #[serde(default)]
    policies: HashMap<String, TlsPolicy>,
}

impl Default for List {
    fn default() -> Self {
        List {
            timestamp: unix_epoch(),
            expires: unix_epoch(),
            version: String::new(),
            author: String::new(),
            pinsets: HashMap::new(),
            policy_aliases: HashMap::new(),
            policies: HashMap::new(),
        }
    }
}

impl List {
    // An alias indirects exactly once; chains do not resolve.
    fn get(&self, domain: &str) -> Option<TlsPolicy> {
        let policy = self.policies.get(domain)?;
        if !policy.policy_alias.is_empty() {
            return self.policy_aliases.get(&policy.policy_alias).cloned();
        }
        Some(policy.clone())
    }
}

/// Policy list kept current from a remote URL. Safe for concurrent readers.
#[derive(Default)]
pub struct UpdatedList {
    inner: RwLock<List>,
}

impl UpdatedList {
    /// An empty list; populate with [`UpdatedList::fetch`] or
    /// [`UpdatedList::load`].
    pub fn new() -> Self {
        UpdatedList::default()
    }

    /// The policy for `domain`, with a single alias hop resolved. `None`
    /// when the domain is absent or its alias dangles.
    pub fn get(&self, domain: &str) -> Option<TlsPolicy> {
        self.inner.read().expect("list lock poisoned").get(domain)
    }

    /// Whether `domain` has an entry on the list.
    pub fn has_domain(&self, domain: &str) -> bool {
        self.inner
            .read()
            .expect("list lock poisoned")
            .policies
            .contains_key(domain)
    }

    /// Replaces the list from raw JSON. Used at startup and in tests.
    pub fn load(&self, raw: &str) -> anyhow::Result<()> {
        let list: List = serde_json::from_str(raw)?;
        *self.inner.write().expect("list lock poisoned") = list;
        Ok(())
    }

    /// Fetches and swaps in a fresh list. On failure the previous list is
    /// retained and the error logged.
    pub async fn fetch(&self, client: &reqwest::Client, url: &str) {
        match fetch_list(client, url).await {
            Ok(list) => {
                *self.inner.write().expect("list lock poisoned") = list;
            }
            Err(e) => warn!("policy list refresh from {url} failed: {e}"),
        }
    }
}

async fn fetch_list(client: &reqwest::Client, url: &str) -> anyhow::Result<List> {
    let list = client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .json::<List>()
        .await?;
    Ok(list)
}

/// Spawns the refresher task that keeps `list` current. Deployments
/// normally pass [`crate::config::LIST_REFRESH_INTERVAL`].
pub fn spawn_refresher(
    list: Arc<UpdatedList>,
    client: reqwest::Client,
    url: String,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            list.fetch(&client, &url).await;
        }
    })
}

/// Where a domain stands with respect to the published policy list.
///
/// Success when the list carries it; a warning when it is queued (an active
/// submission not yet published); failures when it is still waiting on email
/// validation or entirely unknown.
pub async fn policy_list_check(
    domain: &str,
    list: &UpdatedList,
    active: &dyn PolicyStore,
    pending: &dyn PolicyStore,
) -> CheckResult {
    let check = CheckResult::new(POLICY_LIST);
    if list.has_domain(domain) {
        return check.success();
    }
    if let Ok(submission) = active.get(domain).await {
        let queued = submission.mta_sts
            || submission
                .policy
                .as_ref()
                .map(|policy| policy.mode == "testing")
                .unwrap_or(false);
        if queued {
            return check.warning(format!(
                "Domain {domain} is queued to be added to the policy list."
            ));
        }
        // Active in enforce mode but the published list lags behind.
        warn!("domain {domain} is active in the store but absent from the policy list");
        return check.success();
    }
    if pending.get(domain).await.is_ok() {
        return check.failure(format!(
            "The policy addition request for {domain} is waiting on email validation"
        ));
    }
    check.failure(format!("Domain {domain} is not on the policy list."))
}

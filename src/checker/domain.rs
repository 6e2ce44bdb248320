//! Whole-domain scans: MX discovery, fan-out, and aggregation.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::{timeout_at, Instant};

use crate::checker::hostname::{check_hostname, HostnameResult};
use crate::checker::mta_sts::{self, MtaStsResult, StsFetch};
use crate::checker::result::{CheckResult, Status};
use crate::checker::Checker;
use crate::config::MAX_MX_PROBES;

/// Bump when the scan output schema changes; persisted scans from other
/// versions are never treated as fresh.
pub const SCAN_VERSION: i64 = 1;

/// Aggregated outcome of scanning every mail exchanger of one domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainResult {
    /// The mail domain that was scanned.
    pub domain: String,
    /// Aggregate severity: the worst hostname status, softened to a warning
    /// for MXs other than a fully-passing one.
    pub status: Status,
    /// MXs that completed the TCP and STARTTLS dialogue, in preference order.
    #[serde(default)]
    pub preferred_hostnames: Vec<String>,
    /// Per-hostname check batteries, keyed by MX hostname.
    #[serde(default)]
    pub hostname_results: BTreeMap<String, HostnameResult>,
    /// Outcome of the MTA-STS checks, when they ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mta_sts_result: Option<MtaStsResult>,
    /// Auxiliary checks attached by collaborators, keyed by tag.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, CheckResult>,
    /// Explanation when the scan could not run at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the scan ran.
    pub timestamp: DateTime<Utc>,
    /// Scanner schema version that produced this result.
    pub version: i64,
}

impl DomainResult {
    fn new(domain: &str) -> Self {
        DomainResult {
            domain: domain.to_string(),
            status: Status::Success,
            preferred_hostnames: Vec::new(),
            hostname_results: BTreeMap::new(),
            mta_sts_result: None,
            extra: BTreeMap::new(),
            message: None,
            timestamp: Utc::now(),
            version: SCAN_VERSION,
        }
    }

    fn report_error(mut self, message: String) -> Self {
        self.status = Status::Error;
        self.message = Some(message);
        self
    }

    /// Attaches an auxiliary check (policy list membership and the like).
    /// Auxiliary checks are informational and do not move the status.
    pub fn add_extra(&mut self, check: CheckResult) {
        self.extra.insert(check.name.clone(), check);
    }

    /// Derives `status` and `preferred_hostnames` from the per-hostname
    /// outcomes.
    ///
    /// The aggregate is the worst hostname status, with one softening: when
    /// any MX passed its whole battery, failures on the other MXs count only
    /// as warnings, because mail can still reach the domain over a secure
    /// path.
    fn aggregate(&mut self, ordered_hostnames: &[String]) {
        self.preferred_hostnames = ordered_hostnames
            .iter()
            .filter(|hostname| {
                self.hostname_results
                    .get(*hostname)
                    .map(|result| result.could_starttls())
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        let any_clean = self
            .hostname_results
            .values()
            .any(|result| result.status == Status::Success);
        let mut status = Status::Success;
        for result in self.hostname_results.values() {
            let mut hostname_status = result.status;
            if any_clean && hostname_status > Status::Warning {
                hostname_status = Status::Warning;
            }
            status = Status::combine(status, hostname_status);
        }
        self.status = status;
    }
}

impl Checker {
    /// Runs the full check battery for a mail domain.
    ///
    /// `mx_patterns` lists the MX patterns the servers' certificates may be
    /// valid for; `None` accepts the mail domain and each MX hostname.
    ///
    /// Peer misbehaviour never surfaces as an error: unreachable or broken
    /// servers are recorded in the result. The whole scan observes the
    /// configured deadline; probes still outstanding when it fires are
    /// finalized as errors.
    pub async fn check_domain(&self, domain: &str, mx_patterns: Option<Vec<String>>) -> DomainResult {
        let deadline = Instant::now() + self.timeout;
        let result = DomainResult::new(domain);

        let mxs = match timeout_at(deadline, self.lookup_mx(domain)).await {
            Ok(Ok(mxs)) => mxs,
            Ok(Err(e)) => return result.report_error(format!("Error looking up MX records: {e}")),
            Err(_) => return result.report_error("MX lookup timed out".to_string()),
        };
        if mxs.is_empty() {
            return result.report_error(format!("No MX records found for {domain}"));
        }

        // The MTA-STS record and policy fetch proceed alongside the probes;
        // the MX cross-check happens at join time below.
        let sts_task = self.spawn_sts_fetch(domain);

        // Preference order, de-duplicated by hostname, bounded.
        let mut hostnames: Vec<String> = Vec::new();
        for (_, exchange) in &mxs {
            let hostname = exchange.trim_end_matches('.').to_lowercase();
            if !hostname.is_empty() && !hostnames.contains(&hostname) {
                hostnames.push(hostname);
            }
        }
        hostnames.truncate(MAX_MX_PROBES);

        let semaphore = Arc::new(Semaphore::new(self.mx_concurrency));
        let mut probes = FuturesUnordered::new();
        for hostname in hostnames.clone() {
            let semaphore = Arc::clone(&semaphore);
            let patterns = mx_patterns.clone();
            let checker = self.clone();
            let domain = domain.to_string();
            probes.push(async move {
                let _permit = semaphore.acquire_owned().await;
                let probe_result = timeout_at(
                    deadline,
                    checker.probe_hostname(&domain, &hostname, patterns.clone()),
                )
                .await
                .unwrap_or_else(|_| HostnameResult::timed_out(&domain, &hostname, patterns));
                (hostname, probe_result)
            });
        }

        let mut result = result;
        while let Some((hostname, hostname_result)) = probes.next().await {
            result.hostname_results.insert(hostname, hostname_result);
        }

        let mut sts_task = sts_task;
        let fetch = match timeout_at(deadline, &mut sts_task).await {
            Ok(Ok(fetch)) => Some(fetch),
            Ok(Err(_)) => None,
            Err(_) => {
                sts_task.abort();
                None
            }
        };
        result.mta_sts_result = Some(match fetch {
            Some(mut fetch) => {
                mta_sts::validate_mta_sts_mxs(
                    &fetch.mx_patterns,
                    &result.hostname_results,
                    &mut fetch.policy_check,
                );
                MtaStsResult::from_fetch(fetch)
            }
            None => MtaStsResult::errored("MTA-STS check did not complete before the scan deadline"),
        });

        result.aggregate(&hostnames);
        result
    }

    async fn lookup_mx(&self, domain: &str) -> anyhow::Result<Vec<(u16, String)>> {
        if let Some(lookup) = &self.mx_lookup {
            return lookup(domain.to_string()).await;
        }
        crate::dns::lookup_mx_records(&self.resolver, domain).await
    }

    async fn probe_hostname(
        &self,
        domain: &str,
        hostname: &str,
        patterns: Option<Vec<String>>,
    ) -> HostnameResult {
        let hook = self.hostname_probe.clone();
        let domain = domain.to_string();
        let hostname_owned = hostname.to_string();
        self.cache
            .get_or_probe(hostname, move || -> BoxFuture<'static, HostnameResult> {
                match hook {
                    Some(probe) => probe(domain, hostname_owned, patterns),
                    None => Box::pin(async move {
                        check_hostname(&domain, &hostname_owned, patterns).await
                    }),
                }
            })
            .await
    }

    fn spawn_sts_fetch(&self, domain: &str) -> tokio::task::JoinHandle<StsFetch> {
        if let Some(fetch) = &self.sts_fetch {
            return tokio::spawn(fetch(domain.to_string()));
        }
        let resolver = Arc::clone(&self.resolver);
        let client = Arc::clone(&self.policy_client);
        let domain = domain.to_string();
        tokio::spawn(async move { mta_sts::fetch(resolver, client, domain).await })
    }
}

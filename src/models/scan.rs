//! Persisted whole-domain scans.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::checker::{DomainResult, Status, SCAN_VERSION};

/// One persisted scan of a domain. One row per `(domain, timestamp)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scan {
    /// The scanned mail domain.
    pub domain: String,
    /// The full scan result.
    pub data: DomainResult,
    /// When the scan ran.
    pub timestamp: DateTime<Utc>,
    /// Scanner schema version that produced `data`.
    pub version: i64,
}

impl Scan {
    /// Wraps a fresh result, stamped now and at the current scanner version.
    pub fn new(domain: String, data: DomainResult) -> Self {
        Scan {
            domain,
            data,
            timestamp: Utc::now(),
            version: SCAN_VERSION,
        }
    }

    /// Whether the scan is recent enough to reuse.
    ///
    /// A scan from another scanner version is never fresh, whatever its age;
    /// the stored result may not mean what the current code thinks it means.
    pub fn is_fresh(&self, max_age: Duration) -> bool {
        if self.version != SCAN_VERSION {
            return false;
        }
        let max_age = TimeDelta::from_std(max_age).unwrap_or(TimeDelta::MAX);
        Utc::now().signed_duration_since(self.timestamp) <= max_age
    }

    /// Whether the scan shows working MTA-STS in testing or enforce mode.
    pub fn supports_mta_sts(&self) -> bool {
        self.data
            .mta_sts_result
            .as_ref()
            .map(|sts| {
                sts.result.status == Status::Success
                    && matches!(sts.mode.as_str(), "testing" | "enforce")
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::{CheckResult, MtaStsResult};
    use std::collections::BTreeMap;

    fn scan() -> Scan {
        Scan::new(
            "example.com".into(),
            DomainResult {
                domain: "example.com".into(),
                status: Status::Success,
                preferred_hostnames: Vec::new(),
                hostname_results: BTreeMap::new(),
                mta_sts_result: None,
                extra: BTreeMap::new(),
                message: None,
                timestamp: Utc::now(),
                version: SCAN_VERSION,
            },
        )
    }

    #[test]
    fn freshness_boundary_at_max_age() {
        let max_age = Duration::from_secs(600);

        let mut at_boundary = scan();
        at_boundary.timestamp = Utc::now() - TimeDelta::seconds(599);
        assert!(at_boundary.is_fresh(max_age));

        let mut beyond = scan();
        beyond.timestamp = Utc::now() - TimeDelta::seconds(601);
        assert!(!beyond.is_fresh(max_age));
    }

    #[test]
    fn other_versions_are_never_fresh() {
        let mut stale_version = scan();
        stale_version.version = SCAN_VERSION + 1;
        assert!(!stale_version.is_fresh(Duration::from_secs(600)));
        stale_version.version = SCAN_VERSION - 1;
        assert!(!stale_version.is_fresh(Duration::from_secs(600)));
    }

    #[test]
    fn mta_sts_support_requires_success_and_live_mode() {
        let mut with_sts = scan();
        with_sts.data.mta_sts_result = Some(MtaStsResult {
            result: CheckResult::new("mta-sts"),
            mode: "enforce".into(),
            mx_patterns: Vec::new(),
            policy: String::new(),
        });
        assert!(with_sts.supports_mta_sts());

        let sts = with_sts.data.mta_sts_result.as_mut().unwrap();
        sts.mode = "none".into();
        assert!(!with_sts.supports_mta_sts());

        let sts = with_sts.data.mta_sts_result.as_mut().unwrap();
        sts.mode = "testing".into();
        sts.result = CheckResult::new("mta-sts").failure("bad record");
        assert!(!with_sts.supports_mta_sts());

        assert!(!scan().supports_mta_sts());
    }
}

//! Check result primitives.
//!
//! Every probe records its outcome as a [`CheckResult`] with a severity
//! [`Status`]. Statuses form a lattice combined by taking the worst value,
//! so an aggregate's status is always the maximum over its parts.

use std::collections::BTreeMap;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

/// Name of the TCP/EHLO connectivity check.
pub const CONNECTIVITY: &str = "connectivity";
/// Name of the STARTTLS advertisement and handshake check.
pub const STARTTLS: &str = "starttls";
/// Name of the certificate name and chain check.
pub const CERTIFICATE: &str = "certificate";
/// Name of the TLS version check.
pub const VERSION: &str = "version";
/// Name of the combined MTA-STS check.
pub const MTASTS: &str = "mta-sts";
/// Name of the MTA-STS DNS record sub-check.
pub const MTASTS_TEXT: &str = "mta-sts-text";
/// Name of the MTA-STS policy file sub-check.
pub const MTASTS_POLICY_FILE: &str = "mta-sts-policy-file";
/// Name of the policy list membership check.
pub const POLICY_LIST: &str = "policylist";

/// Severity of a check outcome.
///
/// `Error` means the check could not be performed at all (the network failed
/// us); `Failure` means it ran and the server failed it. Combined severities
/// take the maximum, with `Success` as the identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Status {
    /// The check passed.
    #[default]
    Success,
    /// The check passed with reservations.
    Warning,
    /// The server failed the check.
    Failure,
    /// The check could not be performed.
    Error,
}

impl Status {
    /// Numeric wire value, matching the persisted JSON encoding.
    pub fn as_u8(self) -> u8 {
        match self {
            Status::Success => 0,
            Status::Warning => 1,
            Status::Failure => 2,
            Status::Error => 3,
        }
    }

    /// The worse of two statuses.
    pub fn combine(a: Status, b: Status) -> Status {
        a.max(b)
    }
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(Status::Success),
            1 => Ok(Status::Warning),
            2 => Ok(Status::Failure),
            3 => Ok(Status::Error),
            other => Err(de::Error::custom(format!("invalid status value {other}"))),
        }
    }
}

/// Outcome of one named check.
///
/// Compound checks nest their parts under `checks`; the status invariant
/// (`status == max` over messages recorded and nested checks) is maintained
/// by the reporting methods and [`CheckResult::add_check`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Well-known check name, one of the constants in this module.
    pub name: String,
    /// Combined severity of everything recorded on this check.
    pub status: Status,
    /// Human-readable findings, in the order they were recorded.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<String>,
    /// Nested sub-checks for compound checks.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub checks: BTreeMap<String, CheckResult>,
}

impl CheckResult {
    /// A fresh check in the `Success` state with no findings.
    pub fn new(name: &str) -> Self {
        CheckResult {
            name: name.to_string(),
            status: Status::Success,
            messages: Vec::new(),
            checks: BTreeMap::new(),
        }
    }

    /// Marks the check successful. Never downgrades an existing severity.
    pub fn success(self) -> Self {
        self
    }

    /// Records a warning finding.
    pub fn warning(mut self, message: impl Into<String>) -> Self {
        self.push(Status::Warning, message.into());
        self
    }

    /// Records a failure finding.
    pub fn failure(mut self, message: impl Into<String>) -> Self {
        self.push(Status::Failure, message.into());
        self
    }

    /// Records that the check could not be performed.
    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.push(Status::Error, message.into());
        self
    }

    pub(crate) fn push(&mut self, status: Status, message: String) {
        self.status = Status::combine(self.status, status);
        self.messages.push(message);
    }

    /// Folds a sub-check in, escalating this check's status to cover it.
    pub fn add_check(&mut self, check: CheckResult) {
        self.status = Status::combine(self.status, check.status);
        self.checks.insert(check.name.clone(), check);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_is_max() {
        use Status::*;
        assert_eq!(Status::combine(Success, Warning), Warning);
        assert_eq!(Status::combine(Warning, Failure), Failure);
        assert_eq!(Status::combine(Failure, Error), Error);
        assert_eq!(Status::combine(Error, Success), Error);
    }

    #[test]
    fn combine_laws() {
        let all = [Status::Success, Status::Warning, Status::Failure, Status::Error];
        for a in all {
            // Success is the identity; combine is idempotent.
            assert_eq!(Status::combine(a, Status::Success), a);
            assert_eq!(Status::combine(Status::Success, a), a);
            assert_eq!(Status::combine(a, a), a);
            for b in all {
                assert_eq!(Status::combine(a, b), Status::combine(b, a));
                for c in all {
                    assert_eq!(
                        Status::combine(Status::combine(a, b), c),
                        Status::combine(a, Status::combine(b, c))
                    );
                }
            }
        }
    }

    #[test]
    fn status_serializes_as_integer() {
        assert_eq!(serde_json::to_string(&Status::Success).unwrap(), "0");
        assert_eq!(serde_json::to_string(&Status::Error).unwrap(), "3");
        let parsed: Status = serde_json::from_str("2").unwrap();
        assert_eq!(parsed, Status::Failure);
        assert!(serde_json::from_str::<Status>("7").is_err());
    }

    #[test]
    fn reporting_escalates_but_never_downgrades() {
        let check = CheckResult::new(CONNECTIVITY)
            .failure("broken pipe")
            .success();
        assert_eq!(check.status, Status::Failure);
        assert_eq!(check.messages, vec!["broken pipe".to_string()]);

        let check = CheckResult::new(VERSION).warning("old protocol").failure("sslv3");
        assert_eq!(check.status, Status::Failure);
        assert_eq!(check.messages.len(), 2);
    }

    #[test]
    fn add_check_maintains_status_invariant() {
        let mut parent = CheckResult::new(MTASTS);
        parent.add_check(CheckResult::new(MTASTS_TEXT).success());
        assert_eq!(parent.status, Status::Success);
        parent.add_check(CheckResult::new(MTASTS_POLICY_FILE).failure("404"));
        assert_eq!(parent.status, Status::Failure);
        let max = parent.checks.values().map(|c| c.status).max().unwrap();
        assert_eq!(parent.status, max);
    }

    #[test]
    fn empty_collections_are_omitted_from_json() {
        let json = serde_json::to_value(CheckResult::new(STARTTLS)).unwrap();
        assert_eq!(json["name"], "starttls");
        assert_eq!(json["status"], 0);
        assert!(json.get("messages").is_none());
        assert!(json.get("checks").is_none());
    }
}

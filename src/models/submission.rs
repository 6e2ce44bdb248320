//! Policy submissions and their validation rules.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::checker::policy_matches;
use crate::config::{MAX_HOSTNAMES, SCAN_FRESHNESS};
use crate::email::validation_address;
use crate::error_handling::SubmissionError;
use crate::models::Token;
use crate::policy::TlsPolicy;
use crate::storage::{PolicyStore, ScanStore, TokenStore};

/// A request to put a domain on the policy list.
///
/// Either the domain commits to MTA-STS (`mta_sts` set, no manual policy),
/// or it supplies a manual policy naming 1 to 8 MX patterns. A pattern with
/// a leading `.` matches any hostname under that suffix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySubmission {
    /// The mail domain being submitted.
    pub domain: String,
    /// Address validation mail goes to.
    pub contact_email: String,
    /// Whether the domain relies on MTA-STS instead of a manual policy.
    pub mta_sts: bool,
    /// The manual policy; present exactly when `mta_sts` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<TlsPolicy>,
}

fn domain_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?i)([a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z]{2,}$").expect("valid pattern")
    })
}

fn valid_domain_name(name: &str) -> bool {
    domain_pattern().is_match(name)
}

impl PolicySubmission {
    /// Builds and validates a submission from request parameters.
    ///
    /// With `mta_sts` set, `hostnames` is ignored and no manual policy is
    /// attached. Otherwise every non-empty hostname must be a syntactically
    /// valid domain name (an optional leading `.` marks a suffix pattern),
    /// and between 1 and [`MAX_HOSTNAMES`] of them must remain.
    pub fn new(
        domain: &str,
        contact_email: Option<String>,
        mta_sts: bool,
        hostnames: Vec<String>,
    ) -> Result<Self, SubmissionError> {
        let domain = domain.trim().to_lowercase();
        if !valid_domain_name(&domain) {
            return Err(SubmissionError::UserInput(format!(
                "Domain {domain} is invalid"
            )));
        }
        let contact_email = contact_email.unwrap_or_else(|| validation_address(&domain));
        if mta_sts {
            return Ok(PolicySubmission {
                domain,
                contact_email,
                mta_sts,
                policy: None,
            });
        }

        let mut mxs = Vec::new();
        for hostname in hostnames {
            if hostname.is_empty() {
                continue;
            }
            if !valid_domain_name(hostname.trim_start_matches('.')) {
                return Err(SubmissionError::UserInput(format!(
                    "Hostname {hostname} is invalid"
                )));
            }
            mxs.push(hostname);
        }
        if mxs.is_empty() {
            return Err(SubmissionError::UserInput(format!(
                "No MX hostnames supplied for domain {domain}"
            )));
        }
        if mxs.len() > MAX_HOSTNAMES {
            return Err(SubmissionError::UserInput(
                "No more than 8 MX hostnames are permitted".to_string(),
            ));
        }
        Ok(PolicySubmission {
            domain,
            contact_email,
            mta_sts,
            policy: Some(TlsPolicy {
                mode: "testing".into(),
                mxs,
                ..TlsPolicy::default()
            }),
        })
    }

    /// Whether this submission may replace what the active store holds.
    ///
    /// Replacement is allowed when no prior submission exists; when the
    /// hostname set is unchanged and only the contact email differs (the
    /// email-correction case); or when both sides are manual policies and
    /// the old one is still in testing.
    pub async fn can_update(&self, policies: &dyn PolicyStore) -> bool {
        let old = match policies.get(&self.domain).await {
            Ok(old) => old,
            Err(_) => return true,
        };
        let hostnames_unchanged = (old.mta_sts && self.mta_sts)
            || match (&old.policy, &self.policy) {
                (Some(old_policy), Some(new_policy)) => old_policy.hostnames_equal(new_policy),
                _ => false,
            };
        if hostnames_unchanged {
            return old.contact_email != self.contact_email;
        }
        if !self.mta_sts && !old.mta_sts {
            return old
                .policy
                .as_ref()
                .map(|policy| policy.mode == "testing")
                .unwrap_or(false);
        }
        false
    }

    /// Checks the submission against the latest recorded scan.
    ///
    /// Not meant to be bullet-proof — state can change between submission
    /// and list addition — but catches detectable failures early. Requires
    /// a passing scan younger than the freshness window, and either working
    /// MTA-STS or a manual policy covering every preferred hostname.
    pub async fn has_valid_scan(&self, scans: &dyn ScanStore) -> Result<(), SubmissionError> {
        let scan = match scans.get_latest_scan(&self.domain).await {
            Ok(scan) => scan,
            Err(_) => {
                return Err(SubmissionError::UserInput(
                    "We haven't scanned this domain yet. Please use the STARTTLS checker \
                     to scan your domain's STARTTLS configuration so we can validate your \
                     submission"
                        .to_string(),
                ))
            }
        };
        if !scan.is_fresh(SCAN_FRESHNESS) {
            return Err(SubmissionError::UserInput(
                "We haven't scanned this domain recently. Please use the STARTTLS checker \
                 to scan your domain's STARTTLS configuration so we can validate your \
                 submission"
                    .to_string(),
            ));
        }
        if scan.data.status != crate::checker::Status::Success {
            return Err(SubmissionError::UserInput(
                "Domain hasn't passed our STARTTLS security checks".to_string(),
            ));
        }
        if self.mta_sts {
            if !scan.supports_mta_sts() {
                return Err(SubmissionError::UserInput(
                    "Domain does not correctly implement MTA-STS.".to_string(),
                ));
            }
            return Ok(());
        }
        let policy = self.policy.as_ref().ok_or_else(|| {
            SubmissionError::UserInput(format!(
                "No MX hostnames supplied for domain {}",
                self.domain
            ))
        })?;
        for hostname in &scan.data.preferred_hostnames {
            if !policy_matches(hostname, &policy.mxs) {
                return Err(SubmissionError::UserInput(format!(
                    "Hostnames {:?} do not match policy {:?}",
                    scan.data.preferred_hostnames, policy.mxs
                )));
            }
        }
        Ok(())
    }

    /// Writes the submission to the pending store and mints its validation
    /// token. Re-submitting reissues the token, invalidating the old one.
    pub async fn initialize_with_token(
        &self,
        pending: &dyn PolicyStore,
        tokens: &dyn TokenStore,
    ) -> Result<Token, SubmissionError> {
        pending.put_or_update(self).await?;
        let token = tokens.put_token(&self.domain).await?;
        Ok(token)
    }
}

/// Set equality for MX pattern lists, ignoring order and duplicates.
impl TlsPolicy {
    pub(crate) fn hostnames_equal(&self, other: &TlsPolicy) -> bool {
        let ours: HashSet<&str> = self.mxs.iter().map(String::as_str).collect();
        let theirs: HashSet<&str> = other.mxs.iter().map(String::as_str).collect();
        ours == theirs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hostnames(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("mx{i}.example.com")).collect()
    }

    #[test]
    fn hostname_count_bounds() {
        assert!(matches!(
            PolicySubmission::new("example.com", None, false, hostnames(0)),
            Err(SubmissionError::UserInput(message)) if message.contains("No MX hostnames supplied")
        ));
        assert!(PolicySubmission::new("example.com", None, false, hostnames(1)).is_ok());
        assert!(PolicySubmission::new("example.com", None, false, hostnames(8)).is_ok());
        assert!(matches!(
            PolicySubmission::new("example.com", None, false, hostnames(9)),
            Err(SubmissionError::UserInput(message)) if message.contains("No more than 8")
        ));
    }

    #[test]
    fn empty_hostname_entries_are_skipped() {
        let submission = PolicySubmission::new(
            "example.com",
            None,
            false,
            vec!["".into(), "mx.example.com".into(), "".into()],
        )
        .expect("submission");
        assert_eq!(submission.policy.unwrap().mxs, vec!["mx.example.com"]);
    }

    #[test]
    fn wildcard_prefix_hostnames_are_accepted() {
        let submission =
            PolicySubmission::new("example.com", None, false, vec![".example.com".into()])
                .expect("submission");
        assert_eq!(submission.policy.unwrap().mxs, vec![".example.com"]);
    }

    #[test]
    fn invalid_names_are_rejected() {
        assert!(PolicySubmission::new("not a domain", None, true, Vec::new()).is_err());
        assert!(PolicySubmission::new("example.com", None, false, vec!["bad host".into()]).is_err());
        assert!(PolicySubmission::new("example.com", None, false, vec!["-bad.example".into()]).is_err());
    }

    #[test]
    fn mta_sts_submissions_carry_no_policy() {
        let submission = PolicySubmission::new("example.com", None, true, hostnames(3))
            .expect("submission");
        assert!(submission.mta_sts);
        assert!(submission.policy.is_none());
        assert_eq!(submission.contact_email, "postmaster@example.com");
    }

    #[test]
    fn contact_email_defaults_to_postmaster() {
        let submission = PolicySubmission::new(
            "Example.COM",
            Some("hostmaster@example.com".into()),
            true,
            Vec::new(),
        )
        .expect("submission");
        assert_eq!(submission.domain, "example.com");
        assert_eq!(submission.contact_email, "hostmaster@example.com");
    }

    #[test]
    fn hostname_sets_compare_unordered() {
        let a = TlsPolicy {
            mode: "testing".into(),
            mxs: vec!["mx1.example.com".into(), "mx2.example.com".into()],
            ..TlsPolicy::default()
        };
        let b = TlsPolicy {
            mode: "enforce".into(),
            mxs: vec!["mx2.example.com".into(), "mx1.example.com".into()],
            ..TlsPolicy::default()
        };
        let c = TlsPolicy {
            mode: "testing".into(),
            mxs: vec!["mx1.example.com".into()],
            ..TlsPolicy::default()
        };
        assert!(a.hostnames_equal(&b));
        assert!(!a.hostnames_equal(&c));
    }
}

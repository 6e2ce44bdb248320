//! MTA-STS validation: DNS record, policy file, and MX cross-check.
//!
//! The record lookup and policy fetch run without knowledge of the per-MX
//! probes; the cross-check against discovered MXs is applied when the domain
//! scan joins both halves.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};

use hickory_resolver::TokioAsyncResolver;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::checker::hostname::{policy_matches, HostnameResult};
use crate::checker::result::{CheckResult, MTASTS, MTASTS_POLICY_FILE, MTASTS_TEXT};
use crate::config::MTA_STS_MAX_AGE_CAP;

/// Combined outcome of the MTA-STS checks for one domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MtaStsResult {
    /// The compound check, with the record and policy file sub-checks nested.
    #[serde(flatten)]
    pub result: CheckResult,
    /// Declared policy mode, or empty when no policy was retrieved.
    pub mode: String,
    /// MX patterns listed in the policy file.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mx_patterns: Vec<String>,
    /// Raw text of the policy file.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub policy: String,
}

impl MtaStsResult {
    pub(crate) fn from_fetch(fetch: StsFetch) -> Self {
        let mut result = CheckResult::new(MTASTS);
        result.add_check(fetch.record_check);
        result.add_check(fetch.policy_check);
        MtaStsResult {
            result,
            mode: fetch.mode,
            mx_patterns: fetch.mx_patterns,
            policy: fetch.policy,
        }
    }

    pub(crate) fn errored(message: &str) -> Self {
        MtaStsResult {
            result: CheckResult::new(MTASTS).error(message),
            mode: String::new(),
            mx_patterns: Vec::new(),
            policy: String::new(),
        }
    }
}

/// Raw outcome of the record lookup and policy retrieval, before the MX
/// cross-check has been applied.
#[derive(Debug, Clone)]
pub struct StsFetch {
    /// Outcome of the `_mta-sts` TXT record check.
    pub record_check: CheckResult,
    /// Outcome of the policy file check.
    pub policy_check: CheckResult,
    /// Raw policy file text.
    pub policy: String,
    /// Declared policy mode.
    pub mode: String,
    /// MX patterns from the policy file.
    pub mx_patterns: Vec<String>,
}

pub(crate) async fn fetch(
    resolver: Arc<TokioAsyncResolver>,
    client: Arc<reqwest::Client>,
    domain: String,
) -> StsFetch {
    let record_check = check_mta_sts_record(&resolver, &domain).await;
    let (policy_check, policy, pairs) = check_policy_file(&client, &domain).await;
    let mode = pairs.get("mode").cloned().unwrap_or_default();
    let mx_patterns: Vec<String> = pairs
        .get("mx")
        .map(|list| list.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();
    StsFetch {
        record_check,
        policy_check,
        policy,
        mode,
        mx_patterns,
    }
}

async fn check_mta_sts_record(resolver: &TokioAsyncResolver, domain: &str) -> CheckResult {
    let check = CheckResult::new(MTASTS_TEXT);
    match crate::dns::lookup_txt_records(resolver, &format!("_mta-sts.{domain}")).await {
        Ok(records) => validate_mta_sts_record(&records, check),
        Err(e) => check.failure(format!("Couldn't find an MTA-STS TXT record: {e}")),
    }
}

fn id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("^[a-zA-Z0-9]+$").expect("valid pattern"))
}

fn validate_mta_sts_record(records: &[String], check: CheckResult) -> CheckResult {
    let matching: Vec<&String> = records
        .iter()
        .filter(|record| record.starts_with("v=STSv1"))
        .collect();
    if matching.len() != 1 {
        return check.failure(format!(
            "Exactly 1 MTA-STS TXT record required, found {}",
            matching.len()
        ));
    }
    let record = key_value_pairs(matching[0], ";", "=");
    let id = record.get("id").map(String::as_str).unwrap_or("");
    if !id_pattern().is_match(id) {
        return check.failure(format!("Invalid id {id}"));
    }
    check.success()
}

async fn check_policy_file(
    client: &reqwest::Client,
    domain: &str,
) -> (CheckResult, String, HashMap<String, String>) {
    let mut check = CheckResult::new(MTASTS_POLICY_FILE);
    let url = format!("https://mta-sts.{domain}/.well-known/mta-sts.txt");
    let resp = match client.get(&url).send().await {
        Ok(resp) => resp,
        Err(e) => {
            return (
                check.failure(format!("Couldn't find policy file at {url}: {e}")),
                String::new(),
                HashMap::new(),
            )
        }
    };
    if resp.status() != reqwest::StatusCode::OK {
        return (
            check.failure(format!(
                "Couldn't get policy file: {url} returned {}",
                resp.status()
            )),
            String::new(),
            HashMap::new(),
        );
    }
    // The media type must be text/plain; other Content-Type parameters are
    // allowed after it.
    let text_plain = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_ascii_lowercase().starts_with("text/plain"))
        .unwrap_or(false);
    if !text_plain {
        check = check.warning("Media type must be text/plain");
    }
    let body = match resp.text().await {
        Ok(body) => body,
        Err(e) => {
            return (
                check.error(format!("Couldn't read policy file: {e}")),
                String::new(),
                HashMap::new(),
            )
        }
    };
    let (check, pairs) = validate_policy_file(&body, check);
    (check, body, pairs)
}

fn validate_policy_file(
    body: &str,
    mut check: CheckResult,
) -> (CheckResult, HashMap<String, String>) {
    let policy = key_value_pairs(body, "\n", ":");

    if policy.get("version").map(String::as_str) != Some("STSv1") {
        check = check.failure("Policy version must be STSv1");
    }

    let mode = policy.get("mode").map(String::as_str).unwrap_or("");
    if mode.is_empty() {
        check = check.failure("Policy file must specify mode");
    }
    if !matches!(mode, "enforce" | "testing" | "none") {
        check = check.failure(format!(
            "Mode must be one of 'enforce', 'testing', or 'none', got {mode}"
        ));
    }

    let max_age = policy.get("max_age").map(String::as_str).unwrap_or("");
    if max_age.is_empty() {
        check = check.failure("Policy file must specify max_age");
    }
    match max_age.parse::<i64>() {
        Ok(age) if age > 0 && age <= MTA_STS_MAX_AGE_CAP => {}
        _ => {
            check = check.failure("max_age must be a positive integer <= 31557600");
        }
    }

    (check, policy)
}

/// Warns about MXs seen in DNS that the policy file does not cover, and
/// about covered MXs that could not STARTTLS. Hostnames we never reached are
/// ignored; they may be spam traps.
pub(crate) fn validate_mta_sts_mxs(
    policy_mxs: &[String],
    hostname_results: &BTreeMap<String, HostnameResult>,
    check: &mut CheckResult,
) {
    for (mx, result) in hostname_results {
        if !result.could_connect() {
            continue;
        }
        if !policy_matches(mx, policy_mxs) {
            check.push(
                crate::checker::result::Status::Warning,
                format!("{mx} appears in the DNS record but not the MTA-STS policy file"),
            );
        } else if !result.could_starttls() {
            check.push(
                crate::checker::result::Status::Warning,
                format!(
                    "{mx} appears in the DNS record and MTA-STS policy file, but doesn't support STARTTLS"
                ),
            );
        }
    }
}

fn key_value_pairs(
    record: &str,
    line_delimiter: &str,
    pair_delimiter: &str,
) -> HashMap<String, String> {
    let mut parsed: HashMap<String, String> = HashMap::new();
    for line in record.split(line_delimiter) {
        let parts: Vec<&str> = line.trim().split(pair_delimiter).collect();
        if parts.len() != 2 {
            continue;
        }
        let key = parts[0].trim().to_string();
        let value = parts[1].trim().to_string();
        match parsed.get_mut(&key) {
            // Duplicate mx entries accumulate space-separated.
            Some(existing) if !existing.is_empty() => {
                existing.push(' ');
                existing.push_str(&value);
            }
            _ => {
                parsed.insert(key, value);
            }
        }
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::result::{Status, CONNECTIVITY, STARTTLS};

    #[test]
    fn key_value_pairs_parses_txt_records() {
        let parsed = key_value_pairs("", ";", "=");
        assert!(parsed.is_empty());

        let parsed = key_value_pairs("v=STSv1; foo;", ";", "=");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed["v"], "STSv1");

        let parsed = key_value_pairs("v=STSv1; id=20171114T070707;", ";", "=");
        assert_eq!(parsed["v"], "STSv1");
        assert_eq!(parsed["id"], "20171114T070707");
    }

    #[test]
    fn duplicate_mx_keys_accumulate() {
        let body = "version: STSv1\nmode: enforce\nmx: mx1.example.com\nmx: mx2.example.com\nmax_age: 86400\n";
        let parsed = key_value_pairs(body, "\n", ":");
        assert_eq!(parsed["mx"], "mx1.example.com mx2.example.com");
    }

    #[test]
    fn record_validation_requires_exactly_one_sts_record() {
        let cases: Vec<(Vec<&str>, Status)> = vec![
            (vec!["v=STSv1; id=1234", "v=STSv1; id=5678"], Status::Failure),
            (vec!["v=STSv1; id=20171114T070707;"], Status::Success),
            (vec!["v=STSv1; id=;"], Status::Failure),
            (vec!["v=STSv1; id=###;"], Status::Failure),
            (vec!["v=spf1 a -all"], Status::Failure),
        ];
        for (records, want) in cases {
            let records: Vec<String> = records.into_iter().map(String::from).collect();
            let result = validate_mta_sts_record(&records, CheckResult::new(MTASTS_TEXT));
            assert_eq!(result.status, want, "records {records:?}");
        }
    }

    fn policy_body(mode: &str, max_age: &str) -> String {
        format!("version: STSv1\nmode: {mode}\nmx: mx.example.com\nmax_age: {max_age}\n")
    }

    #[test]
    fn policy_file_accepts_valid_bodies() {
        for mode in ["enforce", "testing", "none"] {
            let (check, pairs) =
                validate_policy_file(&policy_body(mode, "86400"), CheckResult::new(MTASTS_POLICY_FILE));
            assert_eq!(check.status, Status::Success, "mode {mode}");
            assert_eq!(pairs["mode"], mode);
        }
    }

    #[test]
    fn policy_file_max_age_boundaries() {
        let cases = [
            ("0", Status::Failure),
            ("1", Status::Success),
            ("31557600", Status::Success),
            ("31557601", Status::Failure),
            ("-1", Status::Failure),
            ("not-a-number", Status::Failure),
        ];
        for (max_age, want) in cases {
            let (check, _) = validate_policy_file(
                &policy_body("enforce", max_age),
                CheckResult::new(MTASTS_POLICY_FILE),
            );
            assert_eq!(check.status, want, "max_age {max_age}");
        }
    }

    #[test]
    fn policy_file_rejects_bad_version_and_mode() {
        let (check, _) = validate_policy_file(
            "version: STSv2\nmode: enforce\nmax_age: 86400\n",
            CheckResult::new(MTASTS_POLICY_FILE),
        );
        assert_eq!(check.status, Status::Failure);

        let (check, _) = validate_policy_file(
            "version: STSv1\nmode: enforced\nmax_age: 86400\n",
            CheckResult::new(MTASTS_POLICY_FILE),
        );
        assert_eq!(check.status, Status::Failure);

        // A missing mode fails both the presence and the value check.
        let (check, _) = validate_policy_file(
            "version: STSv1\nmax_age: 86400\n",
            CheckResult::new(MTASTS_POLICY_FILE),
        );
        assert_eq!(check.status, Status::Failure);
        assert!(check.messages.len() >= 2);
    }

    fn hostname_result(hostname: &str, connect: bool, starttls: bool) -> HostnameResult {
        let mut result = HostnameResult::new("example.com", hostname, None);
        let conn = CheckResult::new(CONNECTIVITY);
        result.add_check(if connect {
            conn.success()
        } else {
            conn.error("no route")
        });
        let tls = CheckResult::new(STARTTLS);
        result.add_check(if starttls {
            tls.success()
        } else {
            tls.failure("refused")
        });
        result
    }

    #[test]
    fn mx_cross_check_warns_on_uncovered_and_non_tls_hosts() {
        let mut results = BTreeMap::new();
        results.insert("mx1.example.com".into(), hostname_result("mx1.example.com", true, true));
        results.insert("mx2.example.com".into(), hostname_result("mx2.example.com", true, false));
        results.insert("mx3.example.com".into(), hostname_result("mx3.example.com", false, false));

        let policy_mxs = vec!["mx1.example.com".to_string(), "mx2.example.com".to_string()];
        let mut check = CheckResult::new(MTASTS_POLICY_FILE);
        validate_mta_sts_mxs(&policy_mxs, &results, &mut check);

        // mx2 is covered but cannot STARTTLS; mx3 was unreachable and is
        // ignored entirely.
        assert_eq!(check.status, Status::Warning);
        assert_eq!(check.messages.len(), 1);
        assert!(check.messages[0].contains("mx2.example.com"));

        let mut check = CheckResult::new(MTASTS_POLICY_FILE);
        validate_mta_sts_mxs(&["other.example.net".to_string()], &results, &mut check);
        assert_eq!(check.messages.len(), 2);
    }

    #[test]
    fn errored_result_carries_no_policy() {
        let result = MtaStsResult::errored("deadline exceeded");
        assert_eq!(result.result.status, Status::Error);
        assert!(result.mode.is_empty());
        assert!(result.mx_patterns.is_empty());
    }
}

//! End-to-end domain checks with pinned DNS and SMTP behaviour.

use starttls_audit::checker::result::{
    CheckResult, CERTIFICATE, CONNECTIVITY, MTASTS_POLICY_FILE, MTASTS_TEXT, STARTTLS, VERSION,
};
use starttls_audit::checker::{Checker, HostnameResult, Status, StsFetch};
use starttls_audit::initialization::{init_policy_client, init_resolver};

fn base_checker() -> Checker {
    Checker::new(init_resolver(), init_policy_client().expect("client"))
}

fn passing_hostname(domain: &str, hostname: &str) -> HostnameResult {
    let mut result = HostnameResult::new(domain, hostname, None);
    result.add_check(CheckResult::new(CONNECTIVITY).success());
    result.add_check(CheckResult::new(STARTTLS).success());
    result.add_check(CheckResult::new(CERTIFICATE).success());
    result.add_check(CheckResult::new(VERSION).success());
    result
}

fn self_signed_hostname(domain: &str, hostname: &str) -> HostnameResult {
    let mut result = HostnameResult::new(domain, hostname, None);
    result.add_check(CheckResult::new(CONNECTIVITY).success());
    result.add_check(CheckResult::new(STARTTLS).success());
    result.add_check(
        CheckResult::new(CERTIFICATE).failure("Certificate root is not trusted: unknown issuer"),
    );
    result.add_check(CheckResult::new(VERSION).success());
    result
}

fn enforcing_sts() -> StsFetch {
    StsFetch {
        record_check: CheckResult::new(MTASTS_TEXT).success(),
        policy_check: CheckResult::new(MTASTS_POLICY_FILE).success(),
        policy: "version: STSv1\nmode: enforce\nmx: .eff.org\nmax_age: 86400\n".into(),
        mode: "enforce".into(),
        mx_patterns: vec![".eff.org".into()],
    }
}

#[tokio::test]
async fn healthy_domain_passes_every_check() {
    let checker = base_checker()
        .with_mx_lookup(|_| {
            Box::pin(async { Ok(vec![(10, "mx1.eff.org.".into()), (20, "mx2.eff.org.".into())]) })
        })
        .with_hostname_probe(|domain, hostname, _| {
            Box::pin(async move { passing_hostname(&domain, &hostname) })
        })
        .with_sts_fetch(|_| Box::pin(async { enforcing_sts() }));

    let result = checker.check_domain("eff.org", None).await;

    assert_eq!(result.status, Status::Success);
    assert_eq!(result.preferred_hostnames, vec!["mx1.eff.org", "mx2.eff.org"]);
    let sts = result.mta_sts_result.as_ref().expect("sts result");
    assert_eq!(sts.mode, "enforce");
    assert_eq!(sts.result.status, Status::Success);
    for hostname_result in result.hostname_results.values() {
        assert_eq!(hostname_result.status, Status::Success);
    }
}

#[tokio::test]
async fn self_signed_certificate_fails_the_domain() {
    let checker = base_checker()
        .with_mx_lookup(|_| Box::pin(async { Ok(vec![(10, "mx.failmail.com".into())]) }))
        .with_hostname_probe(|domain, hostname, _| {
            Box::pin(async move { self_signed_hostname(&domain, &hostname) })
        })
        .with_sts_fetch(|_| {
            Box::pin(async {
                StsFetch {
                    record_check: CheckResult::new(MTASTS_TEXT).failure("no record"),
                    policy_check: CheckResult::new(MTASTS_POLICY_FILE).failure("404"),
                    policy: String::new(),
                    mode: String::new(),
                    mx_patterns: Vec::new(),
                }
            })
        });

    let result = checker.check_domain("failmail.com", None).await;

    assert_eq!(result.status, Status::Failure);
    let hostname_result = &result.hostname_results["mx.failmail.com"];
    assert_eq!(hostname_result.checks[CERTIFICATE].status, Status::Failure);
    // STARTTLS worked, so the hostname still counts as preferred.
    assert_eq!(result.preferred_hostnames, vec!["mx.failmail.com"]);
}

#[tokio::test]
async fn every_status_in_a_result_is_covered_by_its_aggregate() {
    // The per-hostname invariant: status is the max over that hostname's
    // checks; and with no fully-clean MX, the domain carries the worst
    // hostname status undampened.
    let checker = base_checker()
        .with_mx_lookup(|_| {
            Box::pin(async { Ok(vec![(10, "a.example.com".into()), (20, "b.example.com".into())]) })
        })
        .with_hostname_probe(|domain, hostname, _| {
            Box::pin(async move {
                let mut result = HostnameResult::new(&domain, &hostname, None);
                if hostname.starts_with('a') {
                    result.add_check(CheckResult::new(CONNECTIVITY).success());
                    result.add_check(CheckResult::new(STARTTLS).success());
                    result.add_check(CheckResult::new(VERSION).warning("old protocol"));
                } else {
                    result.add_check(CheckResult::new(CONNECTIVITY).error("no route"));
                }
                result
            })
        })
        .with_sts_fetch(|_| Box::pin(async { enforcing_sts() }));

    let result = checker.check_domain("example.com", None).await;

    for hostname_result in result.hostname_results.values() {
        let max = hostname_result
            .checks
            .values()
            .map(|check| check.status)
            .max()
            .expect("checks present");
        assert_eq!(hostname_result.status, max);
    }
    assert_eq!(result.status, Status::Error);
    assert_eq!(result.preferred_hostnames, vec!["a.example.com"]);
}

#[tokio::test]
async fn scan_deadline_finalizes_probes_as_errors() {
    let checker = base_checker()
        .with_timeout(std::time::Duration::from_millis(200))
        .with_mx_lookup(|_| Box::pin(async { Ok(vec![(10, "slow.example.com".into())]) }))
        .with_hostname_probe(|domain, hostname, _| {
            Box::pin(async move {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                passing_hostname(&domain, &hostname)
            })
        })
        .with_sts_fetch(|_| {
            Box::pin(async {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                enforcing_sts()
            })
        });

    let started = std::time::Instant::now();
    let result = checker.check_domain("example.com", None).await;

    assert!(started.elapsed() < std::time::Duration::from_secs(2));
    assert_eq!(result.status, Status::Error);
    let hostname_result = &result.hostname_results["slow.example.com"];
    assert_eq!(hostname_result.checks[CONNECTIVITY].status, Status::Error);
    let sts = result.mta_sts_result.as_ref().expect("sts result");
    assert_eq!(sts.result.status, Status::Error);
    assert!(result.preferred_hostnames.is_empty());
}

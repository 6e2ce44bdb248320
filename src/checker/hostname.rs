//! Per-hostname SMTP and STARTTLS checks.
//!
//! One probe is one SMTP conversation: connect and EHLO, upgrade with
//! STARTTLS, then inspect the live TLS state for certificate validity and
//! protocol version. The TLS handshake deliberately accepts any certificate
//! so broken deployments can still be inspected and reported on.

use std::collections::BTreeMap;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::ClientConfig;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use x509_parser::prelude::*;

use crate::checker::result::{
    CheckResult, Status, CERTIFICATE, CONNECTIVITY, STARTTLS, VERSION,
};
use crate::smtp::SmtpSession;

/// Results of the check battery run against one MX hostname.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostnameResult {
    /// The mail domain this server receives mail for.
    pub domain: String,
    /// The MX hostname that was probed.
    pub hostname: String,
    /// MX patterns the certificate was allowed to match, when supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mx_hostnames: Option<Vec<String>>,
    /// Worst status over all checks.
    pub status: Status,
    /// Individual check outcomes, keyed by check name.
    pub checks: BTreeMap<String, CheckResult>,
}

impl HostnameResult {
    /// An empty result in the `Success` state, ready for checks.
    pub fn new(domain: &str, hostname: &str, mx_hostnames: Option<Vec<String>>) -> Self {
        HostnameResult {
            domain: domain.to_string(),
            hostname: hostname.to_string(),
            mx_hostnames,
            status: Status::Success,
            checks: BTreeMap::new(),
        }
    }

    /// A result for a probe that never ran because the scan deadline fired.
    pub(crate) fn timed_out(
        domain: &str,
        hostname: &str,
        mx_hostnames: Option<Vec<String>>,
    ) -> Self {
        let mut result = HostnameResult::new(domain, hostname, mx_hostnames);
        result.add_check(
            CheckResult::new(CONNECTIVITY).error("Scan deadline exceeded before probing"),
        );
        result
    }

    /// Folds a check in, keeping `status` the maximum over all checks.
    pub fn add_check(&mut self, check: CheckResult) {
        self.status = Status::combine(self.status, check.status);
        self.checks.insert(check.name.clone(), check);
    }

    fn check_succeeded(&self, name: &str) -> bool {
        self.checks
            .get(name)
            .map(|check| check.status == Status::Success)
            .unwrap_or(false)
    }

    /// Whether the TCP/EHLO dialogue completed.
    pub(crate) fn could_connect(&self) -> bool {
        self.check_succeeded(CONNECTIVITY)
    }

    /// Whether the STARTTLS upgrade completed.
    pub(crate) fn could_starttls(&self) -> bool {
        self.check_succeeded(STARTTLS)
    }
}

/// Matches a `.suffix` pattern against a hostname, label-suffix style:
/// one or more labels must precede the dot.
fn wildcard_match(hostname: &str, pattern: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix('.') {
        if let Some((_, rest)) = hostname.split_once('.') {
            return rest == suffix;
        }
    }
    false
}

/// Compares a certificate name against an MX pattern per the MTA-STS
/// matching rules: exact equality, a wildcard certificate against a plain
/// pattern, or a plain certificate against a wildcard pattern.
fn policy_match(cert_name: &str, policy_mx: &str) -> bool {
    let cert_name = cert_name.to_lowercase();
    let policy_mx = policy_mx.to_lowercase();
    let cert_name = match cert_name.strip_prefix('*') {
        Some(stripped) => {
            if !stripped.starts_with('.') {
                // A wildcard without a following dot is not a valid name.
                return false;
            }
            stripped.to_string()
        }
        None => cert_name,
    };
    cert_name == policy_mx
        || wildcard_match(&cert_name, &policy_mx)
        || wildcard_match(&policy_mx, &cert_name)
}

/// True when `hostname` is covered by at least one MX pattern.
pub fn policy_matches(hostname: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| policy_match(hostname, pattern))
}

fn has_valid_name(cert_names: &[String], mxs: &[String]) -> bool {
    mxs.iter()
        .any(|mx| cert_names.iter().any(|name| policy_match(name, mx)))
}

/// Valid names from a certificate: the SAN list if present, else the CN.
fn names_from_cert(cert: &X509Certificate) -> Vec<String> {
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        let names: Vec<String> = san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_string()),
                _ => None,
            })
            .collect();
        if !names.is_empty() {
            return names;
        }
    }
    cert.subject()
        .iter_common_name()
        .filter_map(|cn| cn.as_str().ok())
        .map(str::to_string)
        .collect()
}

/// With no MX patterns supplied, accept matches against the mail domain and
/// the MX hostname itself.
fn default_valid_mx(domain: &str, hostname: &str) -> Vec<String> {
    vec![
        domain.to_string(),
        hostname.trim_end_matches('.').to_string(),
    ]
}

/// The scanner's EHLO identity: `HOSTNAME` from the environment, or
/// "localhost" when unset.
fn scanner_identity() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|hostname| !hostname.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Accepts any certificate so the battery can inspect broken deployments.
/// Trust decisions are made separately against the bundled roots.
#[derive(Debug)]
struct AcceptAllVerifier;

impl ServerCertVerifier for AcceptAllVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}

fn insecure_tls_config() -> Arc<ClientConfig> {
    Arc::new(
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAllVerifier))
            .with_no_client_auth(),
    )
}

/// Verifies the presented leaf against the bundled trust anchors plus any
/// intermediates the server sent. Hostname coverage is checked separately
/// with the MTA-STS matching rules, so only chain trust is validated here.
fn verify_cert_chain(certs: &[CertificateDer<'_>]) -> Result<(), webpki::Error> {
    let end_entity = webpki::EndEntityCert::try_from(&certs[0])?;
    end_entity.verify_for_usage(
        webpki::ALL_VERIFICATION_ALGS,
        webpki_roots::TLS_SERVER_ROOTS,
        &certs[1..],
        UnixTime::now(),
        webpki::KeyUsage::server_auth(),
        None,
        None,
    )?;
    Ok(())
}

async fn check_starttls(
    session: SmtpSession,
    hostname: &str,
) -> (CheckResult, Option<TlsStream<TcpStream>>) {
    let check = CheckResult::new(STARTTLS);
    if !session.has_extension("STARTTLS") {
        return (
            check.failure("Server does not advertise support for STARTTLS."),
            None,
        );
    }
    match session.starttls(insecure_tls_config(), hostname).await {
        Ok(tls) => (check.success(), Some(tls)),
        Err(_) => (check.failure("Could not complete a TLS handshake."), None),
    }
}

/// Checks that the presented certificate covers one of the accepted MX
/// patterns and chains to a trusted root. A chain trust failure dominates a
/// name mismatch.
fn check_cert(
    tls: &TlsStream<TcpStream>,
    domain: &str,
    hostname: &str,
    mx_patterns: Option<&[String]>,
) -> CheckResult {
    let mut check = CheckResult::new(CERTIFICATE);
    let (_, conn) = tls.get_ref();
    let certs = match conn.peer_certificates() {
        Some(certs) if !certs.is_empty() => certs,
        _ => return check.error("TLS not initiated properly."),
    };
    let leaf = match parse_x509_certificate(certs[0].as_ref()) {
        Ok((_, cert)) => cert,
        Err(e) => return check.error(format!("Could not parse certificate: {e}")),
    };
    let default;
    let patterns: &[String] = match mx_patterns {
        Some(patterns) if !patterns.is_empty() => patterns,
        _ => {
            default = default_valid_mx(domain, hostname);
            &default
        }
    };
    if !has_valid_name(&names_from_cert(&leaf), patterns) {
        check = check.failure("Name in cert doesn't match any MX hostnames.");
    }
    if let Err(e) = verify_cert_chain(certs) {
        return check.failure(format!("Certificate root is not trusted: {e}"));
    }
    check.success()
}

/// Records the negotiated TLS version, then opens a second connection to see
/// whether the server still accepts an SSLv3 handshake. STARTTLS cannot be
/// issued twice on one session, hence the fresh dial.
async fn check_version(
    tls: &TlsStream<TcpStream>,
    hostname: &str,
    ehlo_identity: &str,
) -> CheckResult {
    let mut check = CheckResult::new(VERSION);
    let (_, conn) = tls.get_ref();
    if let Some(version) = conn.protocol_version() {
        use rustls::ProtocolVersion::*;
        if matches!(version, SSLv2 | SSLv3 | TLSv1_0 | TLSv1_1) {
            check = check.warning("Server should support TLSv1.2, but doesn't.");
        }
    }
    match SmtpSession::connect(hostname, ehlo_identity).await {
        Ok(session) => match session.probe_sslv3().await {
            Ok(true) => check.failure("Server should NOT support SSLv2/3, but does."),
            Ok(false) => check.success(),
            Err(e) => check.error(format!("Could not complete SSLv3 probe: {e}")),
        },
        Err(e) => check.error(format!("Could not establish connection: {e}")),
    }
}

/// Runs the ordered check battery against one MX hostname.
///
/// `domain` is the mail domain this server receives email for; `hostname`
/// is the MX being probed. `mx_hostnames` lists the MX patterns the server's
/// certificate may be valid for; when `None`, matches against the mail
/// domain and the hostname itself are accepted.
///
/// A connectivity failure short-circuits the battery; so does a failed
/// STARTTLS upgrade, since the remaining checks need the TLS state.
pub async fn check_hostname(
    domain: &str,
    hostname: &str,
    mx_hostnames: Option<Vec<String>>,
) -> HostnameResult {
    let mut result = HostnameResult::new(domain, hostname, mx_hostnames);
    let identity = scanner_identity();

    let connectivity = CheckResult::new(CONNECTIVITY);
    let session = match SmtpSession::connect(hostname, &identity).await {
        Ok(session) => {
            result.add_check(connectivity.success());
            session
        }
        Err(e) => {
            result.add_check(connectivity.error(format!("Could not establish connection: {e}")));
            return result;
        }
    };

    let (starttls_check, tls) = check_starttls(session, hostname).await;
    result.add_check(starttls_check);
    let Some(tls) = tls else {
        return result;
    };

    let cert_check = check_cert(&tls, domain, hostname, result.mx_hostnames.as_deref());
    result.add_check(cert_check);

    let version_check = check_version(&tls, hostname, &identity).await;
    result.add_check(version_check);

    result
}

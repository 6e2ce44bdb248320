//! DNS record queries.
//!
//! Async MX and TXT lookups over `hickory-resolver`. Domains with no
//! matching records resolve to empty sets; real failures (timeouts, servfail)
//! propagate so callers can record them.

use anyhow::{Error, Result};
use hickory_resolver::proto::rr::{RData, RecordType};
use hickory_resolver::TokioAsyncResolver;

/// Queries MX records for a domain.
///
/// Returns `(preference, exchange)` pairs sorted by preference, lower first.
/// Domains without mail servers yield an empty vector.
pub(crate) async fn lookup_mx_records(
    resolver: &TokioAsyncResolver,
    domain: &str,
) -> Result<Vec<(u16, String)>, Error> {
    match resolver.lookup(domain, RecordType::MX).await {
        Ok(lookup) => {
            let mut mx_records: Vec<(u16, String)> = lookup
                .iter()
                .filter_map(|rdata| {
                    if let RData::MX(mx) = rdata {
                        Some((mx.preference(), mx.exchange().to_utf8()))
                    } else {
                        None
                    }
                })
                .collect();
            mx_records.sort_by_key(|(preference, _)| *preference);
            Ok(mx_records)
        }
        Err(e) => {
            if is_no_records(&e.to_string()) {
                Ok(Vec::new())
            } else {
                log::warn!("MX lookup failed for {domain}: {e}");
                Err(e.into())
            }
        }
    }
}

/// Queries TXT records for a name.
///
/// Multi-string TXT records are joined per RFC 7208 conventions.
pub(crate) async fn lookup_txt_records(
    resolver: &TokioAsyncResolver,
    name: &str,
) -> Result<Vec<String>, Error> {
    match resolver.lookup(name, RecordType::TXT).await {
        Ok(lookup) => {
            let txt_records: Vec<String> = lookup
                .iter()
                .filter_map(|rdata| {
                    if let RData::TXT(txt) = rdata {
                        Some(
                            txt.iter()
                                .map(|bytes| String::from_utf8_lossy(bytes).to_string())
                                .collect::<Vec<String>>()
                                .join(""),
                        )
                    } else {
                        None
                    }
                })
                .collect();
            Ok(txt_records)
        }
        Err(e) => {
            log::warn!("TXT lookup failed for {name}: {e}");
            Err(e.into())
        }
    }
}

// NXDomain and empty answers are expected outcomes, not failures.
fn is_no_records(error_msg: &str) -> bool {
    error_msg.contains("no records found") || error_msg.contains("NXDomain")
}

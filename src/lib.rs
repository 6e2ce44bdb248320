//! starttls_audit library: inbound email security auditing
//!
//! This library scans the mail exchangers of a domain and reports on their
//! STARTTLS posture: certificate validity, negotiated TLS version, legacy
//! protocol acceptance, and MTA-STS advertisement consistency. Results are
//! aggregated per domain, cached, and persisted, and feed a token-gated
//! policy submission workflow.
//!
//! # Example
//!
//! ```no_run
//! use starttls_audit::checker::Checker;
//! use starttls_audit::initialization::{init_crypto_provider, init_policy_client, init_resolver};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! init_crypto_provider();
//! let checker = Checker::new(init_resolver(), init_policy_client()?);
//! let result = checker.check_domain("example.com", None).await;
//! println!("{}", serde_json::to_string_pretty(&result)?);
//! # Ok(())
//! # }
//! ```
//!
//! # Requirements
//!
//! This library requires a Tokio runtime. Use `#[tokio::main]` in your
//! application or ensure you're calling library functions within an async
//! context. Call [`initialization::init_crypto_provider`] once at startup
//! before any TLS probing.

#![warn(missing_docs)]

pub mod checker;
pub mod config;
mod dns;
pub mod email;
pub mod error_handling;
pub mod initialization;
pub mod models;
pub mod policy;
mod smtp;
pub mod stats;
pub mod storage;

// Re-export the types most callers need.
pub use checker::{CheckResult, Checker, DomainResult, HostnameResult, MtaStsResult, Status};
pub use models::{PolicySubmission, Scan, Token};

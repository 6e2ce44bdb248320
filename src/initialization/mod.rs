//! Application initialization and resource setup.
//!
//! Functions here build the shared resources the checker and its
//! collaborators expect: HTTP clients, the DNS resolver, the logger, and
//! the process-wide TLS crypto provider.

mod client;
mod logger;
mod resolver;

use rustls::crypto::{ring::default_provider, CryptoProvider};

pub use client::{init_http_client, init_policy_client};
pub use logger::init_logger_with;
pub use resolver::init_resolver;

/// Installs the process-wide crypto provider for TLS operations.
///
/// Must be called before any TLS connection is attempted. Reinstalling is
/// harmless, so the return value is ignored.
pub fn init_crypto_provider() {
    let _ = CryptoProvider::install_default(default_provider());
}

//! DNS resolver initialization.

use std::sync::Arc;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::system_conf::read_system_conf;
use hickory_resolver::TokioAsyncResolver;
use log::warn;

use crate::config::DNS_TIMEOUT;

/// Initializes the shared DNS resolver.
///
/// Prefers the host's resolver configuration and falls back to the library
/// defaults when none can be read. Whatever the source, queries are bounded
/// by [`DNS_TIMEOUT`] with a single retry, and search-domain expansion is
/// disabled: the names we were asked about are the names we look up.
pub fn init_resolver() -> Arc<TokioAsyncResolver> {
    let config = match read_system_conf() {
        Ok((config, _)) => config,
        Err(e) => {
            warn!("could not read system resolver configuration ({e}), using defaults");
            ResolverConfig::default()
        }
    };
    let mut opts = ResolverOpts::default();
    opts.timeout = DNS_TIMEOUT;
    opts.attempts = 2;
    opts.ndots = 0;

    Arc::new(TokioAsyncResolver::tokio(config, opts))
}

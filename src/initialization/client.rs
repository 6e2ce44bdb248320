//! HTTP client initialization.

use std::sync::Arc;
use std::time::Duration;

use reqwest::ClientBuilder;

use crate::config::POLICY_FETCH_TIMEOUT;
use crate::error_handling::InitializationError;

/// Initializes the general-purpose HTTP client.
///
/// Used for policy list refreshes, remote stats imports, and fetching CSVs
/// of domains by URL. Redirects are followed; only the connect phase is
/// bounded, since some downloads are large.
pub fn init_http_client() -> Result<Arc<reqwest::Client>, InitializationError> {
    let client = ClientBuilder::new()
        .connect_timeout(Duration::from_secs(10))
        .build()?;
    Ok(Arc::new(client))
}

/// Initializes the HTTP client used for MTA-STS policy file fetches.
///
/// RFC 8461 forbids following redirects when retrieving the policy file, so
/// this client has redirects disabled and a short overall timeout.
pub fn init_policy_client() -> Result<Arc<reqwest::Client>, InitializationError> {
    let client = ClientBuilder::new()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(POLICY_FETCH_TIMEOUT)
        .build()?;
    Ok(Arc::new(client))
}

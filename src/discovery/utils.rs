use crate::error::AppError;
use reqwest::Client;
use std::time::Duration;

/// Create an HTTP client for talking to the discovery feed and the push API
pub fn create_http_client(timeout: Duration) -> Result<Client, AppError> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("relayrank/", env!("CARGO_PKG_VERSION")))
        // Connection timeout separate from request timeout
        .connect_timeout(Duration::from_secs(10))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(5)
        .redirect(reqwest::redirect::Policy::limited(5))
        .build()
        .map_err(|e| AppError::RequestError(format!("Failed to create HTTP client: {}", e)))?;

    Ok(client)
}

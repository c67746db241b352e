//! HTTP clients for the third-party services steps consult. Every client sits
//! behind an async trait so steps can be exercised with in-process fakes.

pub(crate) mod geocoder;
pub(crate) mod grammar;
pub(crate) mod llm;
pub(crate) mod places;
pub(crate) mod registry;

use crate::config::Config;
use crate::error::{AppError, Result};
use reqwest::{Client, Response};
use std::time::Duration;

/// Builds a client with the configured user agent and `timeout`.
pub(crate) fn http_client(config: &Config, timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(&config.user_agent)
        .timeout(timeout)
        .build()
        .map_err(|e| AppError::Generic(anyhow::anyhow!("Failed to build HTTP client: {}", e)))
}

/// Turns a non-success status into an `ExternalApi` error carrying the body.
pub(crate) async fn expect_success(service: &'static str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let snippet: String = body.chars().take(200).collect();
    Err(AppError::ExternalApi {
        service,
        message: format!("HTTP {}: {}", status, snippet),
    })
}

//! Chat-completion client with exponential backoff on rate limiting.

use super::http_client;
use crate::config::Config;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

const SERVICE: &str = "llm";

#[async_trait]
pub(crate) trait ChatModel: Send + Sync {
    /// Sends one system + user exchange and returns the assistant text.
    async fn complete(&self, system: &str, user: &str) -> Result<String>;
}

/// Outcome of a single attempt, before retry policy is applied.
#[derive(Debug)]
pub(crate) enum CallFailure {
    RateLimited,
    Failed(AppError),
}

impl From<AppError> for CallFailure {
    fn from(e: AppError) -> Self {
        CallFailure::Failed(e)
    }
}

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`.
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << (attempt.saturating_sub(1)).min(16))
}

/// Runs `call` until it succeeds, fails with anything but a rate limit, or
/// `max_attempts` rate-limited attempts were made.
pub(crate) async fn retry_rate_limited<F, Fut, T>(
    max_attempts: u32,
    base: Duration,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, CallFailure>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(CallFailure::Failed(e)) => return Err(e),
            Err(CallFailure::RateLimited) if attempt < max_attempts => {
                let delay = backoff_delay(base, attempt);
                tracing::warn!(target: SERVICE, attempt, "Rate limited; retrying after {:?}", delay);
                sleep(delay).await;
            }
            Err(CallFailure::RateLimited) => {
                tracing::error!(target: SERVICE, "Rate limited after {} attempts", attempt);
                return Err(AppError::RateLimited { attempts: attempt });
            }
        }
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

pub(crate) struct OpenAiChat {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_attempts: u32,
    backoff_base: Duration,
}

impl OpenAiChat {
    pub(crate) fn from_config(config: &Config) -> Result<Self> {
        let api_key = config
            .openai_api_key
            .clone()
            .ok_or_else(|| AppError::Config("OPENAI_API_KEY is not set".to_string()))?;
        Ok(Self {
            http: http_client(config, config.llm_timeout)?,
            base_url: config.llm_base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.llm_model.clone(),
            max_attempts: config.llm_max_attempts,
            backoff_base: config.llm_backoff_base,
        })
    }

    async fn attempt(&self, system: &str, user: &str) -> std::result::Result<String, CallFailure> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage { role: "system", content: system },
                ChatMessage { role: "user", content: user },
            ],
            temperature: 0.0,
        };
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    tracing::warn!(target: SERVICE, "LLM request timed out: {}", e);
                } else if e.is_connect() {
                    tracing::warn!(target: SERVICE, "LLM connection failed: {}", e);
                } else {
                    tracing::error!(target: SERVICE, "Unexpected LLM transport error: {}", e);
                }
                AppError::Request(e)
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(CallFailure::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let kind = match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => "authentication",
                StatusCode::BAD_REQUEST => "bad request",
                s if s.is_server_error() => "server",
                _ => "unexpected status",
            };
            tracing::warn!(target: SERVICE, "LLM {} error ({}): {}", kind, status, body);
            return Err(AppError::ExternalApi {
                service: SERVICE,
                message: format!("{} error ({})", kind, status),
            }
            .into());
        }

        let parsed: ChatResponse = response.json().await.map_err(AppError::Request)?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| {
                CallFailure::Failed(AppError::ExternalApi {
                    service: SERVICE,
                    message: "response without message content".to_string(),
                })
            })
    }
}

#[async_trait]
impl ChatModel for OpenAiChat {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        retry_rate_limited(self.max_attempts, self.backoff_base, || self.attempt(system, user)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_schedule_doubles() {
        let base = Duration::from_secs(5);
        let delays: Vec<u64> = (1..=4).map(|a| backoff_delay(base, a).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40]);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_rate_limited(5, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CallFailure::RateLimited) }
        })
        .await;
        assert!(matches!(result, Err(AppError::RateLimited { attempts: 5 })));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_retry_recovers_after_rate_limit() {
        let calls = AtomicU32::new(0);
        let result = retry_rate_limited(5, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 { Err(CallFailure::RateLimited) } else { Ok("0.5".to_string()) }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "0.5");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_other_failures_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_rate_limited(5, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CallFailure::Failed(AppError::Parse("bad".into()))) }
        })
        .await;
        assert!(matches!(result, Err(AppError::Parse(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

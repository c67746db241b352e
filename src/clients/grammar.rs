//! LanguageTool-compatible grammar checking.

use super::{expect_success, http_client};
use crate::config::Config;
use crate::error::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

const SERVICE: &str = "grammar";

#[async_trait]
pub(crate) trait GrammarChecker: Send + Sync {
    /// Number of grammar and spelling issues found in `text`.
    async fn count_errors(&self, text: &str, language: Option<&str>) -> Result<usize>;
}

#[derive(Deserialize)]
struct CheckResponse {
    #[serde(default)]
    matches: Vec<serde_json::Value>,
}

pub(crate) struct LanguageToolClient {
    http: Client,
    base_url: String,
}

impl LanguageToolClient {
    pub(crate) fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            http: http_client(config, config.request_timeout)?,
            base_url: config.grammar_base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl GrammarChecker for LanguageToolClient {
    async fn count_errors(&self, text: &str, language: Option<&str>) -> Result<usize> {
        let language = language.filter(|l| !l.is_empty()).unwrap_or("auto");
        let response = self
            .http
            .post(format!("{}/check", self.base_url))
            .form(&[("text", text), ("language", language)])
            .send()
            .await?;
        let parsed: CheckResponse = expect_success(SERVICE, response).await?.json().await?;
        Ok(parsed.matches.len())
    }
}

/// Share of words without issues, in `[0, 1]`.
pub(crate) fn grammar_score(errors: usize, words: usize) -> Option<f64> {
    if words == 0 {
        return None;
    }
    Some(1.0 - (errors as f64 / words as f64).min(1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grammar_score_bounds() {
        assert_eq!(grammar_score(0, 10), Some(1.0));
        assert_eq!(grammar_score(5, 10), Some(0.5));
        assert_eq!(grammar_score(30, 10), Some(0.0));
        assert_eq!(grammar_score(0, 0), None);
    }

    #[test]
    fn test_check_response_counts_matches() {
        let parsed: CheckResponse =
            serde_json::from_str(r#"{"software": {}, "matches": [{"offset": 1}, {"offset": 9}]}"#).unwrap();
        assert_eq!(parsed.matches.len(), 2);
    }
}

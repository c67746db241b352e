//! Company registry search by officer name.

use super::{expect_success, http_client};
use crate::config::Config;
use crate::error::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

const SERVICE: &str = "registry";

/// A company in which the searched person holds an office.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub(crate) struct RegistryCompany {
    #[serde(alias = "company_name")]
    pub name: Option<String>,
    #[serde(alias = "purpose")]
    pub objective: Option<String>,
    #[serde(alias = "share_capital")]
    pub capital: Option<f64>,
    #[serde(alias = "capital_currency")]
    pub currency: Option<String>,
    #[serde(alias = "registered_address")]
    pub address: Option<String>,
}

#[async_trait]
pub(crate) trait RegistryApi: Send + Sync {
    /// Companies linked to a person, best match first.
    async fn search_officer(&self, first_name: &str, last_name: &str) -> Result<Vec<RegistryCompany>>;
}

#[derive(Deserialize, Default)]
struct SearchResponse {
    #[serde(default, alias = "rows")]
    results: Vec<RegistryCompany>,
}

pub(crate) struct RegistryClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl RegistryClient {
    pub(crate) fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            http: http_client(config, config.request_timeout)?,
            base_url: config.registry_base_url.trim_end_matches('/').to_string(),
            api_key: config.registry_api_key.clone(),
        })
    }
}

#[async_trait]
impl RegistryApi for RegistryClient {
    async fn search_officer(&self, first_name: &str, last_name: &str) -> Result<Vec<RegistryCompany>> {
        let mut request = self
            .http
            .get(format!("{}/companies_by_officer.json", self.base_url))
            .query(&[
                ("first_name", first_name),
                ("last_name", last_name),
                ("_shape", "objects"),
            ]);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = expect_success(SERVICE, request.send().await?).await?;
        let parsed: SearchResponse = response.json().await?;
        tracing::debug!(target: "registry", "{} {}: {} companies", first_name, last_name, parsed.results.len());
        Ok(parsed.results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_response_accepts_aliases() {
        let raw = r#"{"rows": [{"company_name": "Acme GmbH", "purpose": "Baking",
            "share_capital": 25000, "capital_currency": "EUR",
            "registered_address": "Hauptstr. 1, 10115 Berlin"}]}"#;
        let parsed: SearchResponse = serde_json::from_str(raw).unwrap();
        let company = &parsed.results[0];
        assert_eq!(company.name.as_deref(), Some("Acme GmbH"));
        assert_eq!(company.capital, Some(25000.0));
        assert_eq!(company.currency.as_deref(), Some("EUR"));
    }

    #[test]
    fn test_empty_response() {
        let parsed: SearchResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.results.is_empty());
    }
}

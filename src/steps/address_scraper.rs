//! Scrapes a postal address from the lead's business website.

use super::email_analyzer::DOMAIN;
use crate::dataset::{Dataset, RowView};
use crate::domain::normalize_url;
use crate::error::{AppError, Result};
use crate::models::{ColumnSpec, Value};
use crate::scraper::{HttpPageFetcher, PageFetcher, body_text, json_ld_blocks};
use crate::step::{RowEnricher, RowValues, Step, StepContext, StepState, run_row_step};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as Json;
use std::sync::Arc;

pub(crate) const SCRAPED_ADDRESS: &str = "scraped_address";

const ADDED: &[ColumnSpec] = &[ColumnSpec::text(SCRAPED_ADDRESS)];

/// Street (up to three words), optional house number, 5-digit postcode, city.
static GERMAN_ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?P<street>[A-ZÄÖÜ][\w.\-]*(?: [\w.\-]+){0,2})\s+(?P<number>\d{1,4}\s?[a-zA-Z]?(?:\s?-\s?\d{1,4})?)?\s*,?\s*(?P<postcode>\d{5})\s+(?P<city>[A-ZÄÖÜ][a-zäöüß]+(?:[ \-][A-ZÄÖÜ][a-zäöüß]+)*)",
    )
    .unwrap()
});

pub(crate) fn find_german_address(text: &str) -> Option<String> {
    let caps = GERMAN_ADDRESS.captures(text)?;
    let street = caps.name("street")?.as_str().trim();
    let postcode = caps.name("postcode")?.as_str();
    let city = caps.name("city")?.as_str();
    let address = match caps.name("number") {
        Some(number) => format!("{} {}, {} {}", street, number.as_str().trim(), postcode, city),
        None => format!("{}, {} {}", street, postcode, city),
    };
    Some(address)
}

fn postal_address(node: &Json) -> Option<String> {
    let street = node.get("streetAddress")?.as_str()?.trim();
    let locality = node.get("addressLocality")?.as_str()?.trim();
    if street.is_empty() || locality.is_empty() {
        return None;
    }
    let postcode = node.get("postalCode").and_then(Json::as_str).map(str::trim);
    Some(match postcode {
        Some(code) if !code.is_empty() => format!("{}, {} {}", street, code, locality),
        _ => format!("{}, {}", street, locality),
    })
}

/// Depth-first search for a street + locality pair in structured data.
pub(crate) fn find_structured_address(node: &Json) -> Option<String> {
    match node {
        Json::Object(map) => postal_address(node)
            .or_else(|| map.values().find_map(find_structured_address)),
        Json::Array(items) => items.iter().find_map(find_structured_address),
        _ => None,
    }
}

pub(crate) fn extract_address(html: &str) -> Option<String> {
    find_german_address(&body_text(html)).or_else(|| {
        json_ld_blocks(html)
            .iter()
            .find_map(find_structured_address)
    })
}

#[derive(Default)]
pub(crate) struct AddressScraper {
    state: StepState,
    fetcher: Option<Arc<dyn PageFetcher>>,
}

impl AddressScraper {
    #[cfg(test)]
    pub(crate) fn with_fetcher(fetcher: Arc<dyn PageFetcher>) -> Self {
        Self {
            fetcher: Some(fetcher),
            ..Self::default()
        }
    }
}

#[async_trait]
impl RowEnricher for AddressScraper {
    fn step_name(&self) -> &'static str {
        "address_scraper"
    }

    fn output_columns(&self) -> &'static [ColumnSpec] {
        ADDED
    }

    fn applies_to(&self, row: RowView<'_>) -> bool {
        row.text(DOMAIN).is_some()
    }

    async fn enrich_row(&self, row: RowView<'_>, _ctx: &StepContext) -> Result<RowValues> {
        let fetcher = self
            .fetcher
            .as_ref()
            .ok_or_else(|| AppError::step(self.step_name(), "fetcher not loaded"))?;
        let url = normalize_url(row.text(DOMAIN).unwrap_or_default())?;
        let address = match fetcher.fetch(&url).await? {
            Some(html) => extract_address(&html),
            None => None,
        };
        Ok(vec![(SCRAPED_ADDRESS, Value::from(address))])
    }
}

#[async_trait]
impl Step for AddressScraper {
    fn name(&self) -> &'static str {
        "address_scraper"
    }

    fn required_cols(&self) -> &'static [&'static str] {
        &[DOMAIN]
    }

    fn added_cols(&self) -> &'static [ColumnSpec] {
        ADDED
    }

    fn state(&self) -> &StepState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut StepState {
        &mut self.state
    }

    async fn load_data(&mut self, ctx: &StepContext) -> Result<()> {
        if self.fetcher.is_none() {
            self.fetcher = Some(Arc::new(HttpPageFetcher::new(
                ctx.http.clone(),
                ctx.config.scrape_timeout,
            )));
        }
        Ok(())
    }

    async fn run(&mut self, ctx: &StepContext) -> Result<Dataset> {
        run_row_step(self, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::test_support::{context, run_step};
    use std::collections::HashMap;
    use url::Url;

    struct FakePages(HashMap<String, String>);

    #[async_trait]
    impl PageFetcher for FakePages {
        async fn fetch(&self, url: &Url) -> Result<Option<String>> {
            match self.0.get(url.as_str()) {
                Some(html) => Ok(Some(html.clone())),
                None => Err(AppError::Parse(format!("HTTP 404 for {}", url))),
            }
        }
    }

    #[test]
    fn test_german_address_in_text() {
        assert_eq!(
            find_german_address("Besuchen Sie uns: Hauptstraße 12a, 10115 Berlin. Telefon 030"),
            Some("Hauptstraße 12a, 10115 Berlin".to_string())
        );
        assert_eq!(
            find_german_address("Impressum: Am Alten Markt 3 14467 Potsdam"),
            Some("Am Alten Markt 3, 14467 Potsdam".to_string())
        );
        assert_eq!(find_german_address("No address here, call 0301234"), None);
    }

    #[test]
    fn test_structured_data_fallback() {
        let html = r#"<html><head><script type="application/ld+json">
            {"@context": "https://schema.org", "@graph": [{"@type": "LocalBusiness",
             "address": {"@type": "PostalAddress", "streetAddress": "Marienplatz 1",
                         "postalCode": "80331", "addressLocality": "München"}}]}
            </script></head><body><p>Willkommen</p></body></html>"#;
        assert_eq!(extract_address(html), Some("Marienplatz 1, 80331 München".to_string()));
        assert_eq!(extract_address("<html><body>nothing</body></html>"), None);
    }

    #[tokio::test]
    async fn test_failures_leave_row_absent() {
        let ctx = context();
        let mut pages = HashMap::new();
        pages.insert(
            "https://acme.example/".to_string(),
            "<html><body><p>Acme, Hauptstraße 1, 10115 Berlin</p></body></html>".to_string(),
        );
        let mut ds = Dataset::with_columns(&["Email", DOMAIN]);
        ds.push_row(vec![("Email", "a@acme.example".into()), (DOMAIN, "acme.example".into())])
            .unwrap();
        ds.push_row(vec![("Email", "b@down.example".into()), (DOMAIN, "down.example".into())])
            .unwrap();
        ds.push_row(vec![("Email", "c@gmail.com".into())]).unwrap();

        let mut step = AddressScraper::with_fetcher(Arc::new(FakePages(pages)));
        let out = run_step(&mut step, ds, &ctx).await;
        assert_eq!(out.get(0, SCRAPED_ADDRESS), &Value::from("Hauptstraße 1, 10115 Berlin"));
        assert_eq!(out.get(1, SCRAPED_ADDRESS), &Value::Absent);
        assert_eq!(out.get(2, SCRAPED_ADDRESS), &Value::Absent);
        assert_eq!(step.state.stats.failed, 1);
        assert_eq!(step.state.stats.not_applicable, 1);
    }
}

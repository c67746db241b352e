//! Fetching lead websites and pulling readable text and structured data
//! out of the returned HTML.

use crate::error::{AppError, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::Client;
use scraper::{Html, Selector};
use std::time::{Duration, Instant};
use url::Url;

/// Source of website HTML.
#[async_trait]
pub(crate) trait PageFetcher: Send + Sync {
    /// Returns the body of an HTML page, `None` for non-HTML content.
    async fn fetch(&self, url: &Url) -> Result<Option<String>>;
}

pub(crate) struct HttpPageFetcher {
    http: Client,
    timeout: Duration,
}

impl HttpPageFetcher {
    pub(crate) fn new(http: Client, timeout: Duration) -> Self {
        Self { http, timeout }
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, url: &Url) -> Result<Option<String>> {
        let start_time = Instant::now();
        tracing::debug!(target: "scrape_task", "Attempting to GET: {}", url);

        let response = self
            .http
            .get(url.clone())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    tracing::warn!(target: "scrape_task", "Timeout scraping {}: {}", url, e);
                } else if e.is_connect() || e.is_request() {
                    tracing::warn!(target: "scrape_task", "Request/Connection error scraping {}: {}", url, e);
                } else {
                    tracing::warn!(target: "scrape_task", "Unexpected error scraping {}: {}", url, e);
                }
                AppError::Request(e)
            })?;

        let status = response.status();
        tracing::debug!(target: "scrape_task", "GET {} status: {}", url, status);
        if !status.is_success() {
            return Err(AppError::Parse(format!("HTTP {} for {}", status, url)));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|val| val.to_str().ok())
            .unwrap_or("")
            .to_lowercase();
        if !content_type.is_empty() && !content_type.contains("html") {
            tracing::debug!(target: "scrape_task", "Skipping non-HTML content at {} ({})", url, content_type);
            return Ok(None);
        }

        // Decoded as UTF-8 regardless of the declared charset.
        let bytes = response.bytes().await?;
        let html = String::from_utf8_lossy(&bytes).into_owned();
        tracing::debug!(target: "scrape_task", "Fetched {} in {:.2?} ({} bytes)", url, start_time.elapsed(), html.len());
        Ok(Some(html))
    }
}

static BODY_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("body").unwrap());
static CONTENT_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("h1, h2, h3, h4, h5, h6, p, li").unwrap());
static JSON_LD_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("script[type='application/ld+json']").unwrap());

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Visible body text, whitespace-collapsed.
pub(crate) fn body_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut text_content = String::new();
    let root = document.select(&BODY_SELECTOR).next();
    let fragments: Box<dyn Iterator<Item = &str>> = match root {
        Some(body) => Box::new(body.text()),
        None => Box::new(document.root_element().text()),
    };
    for fragment in fragments {
        text_content.push_str(fragment.trim());
        text_content.push(' ');
    }
    collapse_whitespace(&text_content)
}

/// Text of heading, paragraph and list elements, one element per line.
pub(crate) fn content_text(html: &str) -> String {
    let document = Html::parse_document(html);
    document
        .select(&CONTENT_SELECTOR)
        .map(|element| collapse_whitespace(&element.text().collect::<String>()))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parsed bodies of all JSON-LD script tags. Malformed blocks are skipped.
pub(crate) fn json_ld_blocks(html: &str) -> Vec<serde_json::Value> {
    let document = Html::parse_document(html);
    document
        .select(&JSON_LD_SELECTOR)
        .filter_map(|script| {
            let raw = script.text().collect::<String>();
            match serde_json::from_str(raw.trim()) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::debug!(target: "scrape_task", "Skipping malformed JSON-LD block: {}", e);
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><head><title>Acme</title>
        <script type="application/ld+json">{"@type": "Organization", "name": "Acme"}</script>
        <script type="application/ld+json">{ not json</script>
        </head><body>
        <h1>Acme   Bakery</h1>
        <p>Fresh bread
           every day.</p>
        <ul><li>Rolls</li><li></li></ul>
        <div>Footer</div>
        </body></html>"#;

    #[test]
    fn test_content_text_keeps_headings_paragraphs_and_lists() {
        assert_eq!(content_text(PAGE), "Acme Bakery\nFresh bread every day.\nRolls");
    }

    #[test]
    fn test_body_text_collapses_whitespace() {
        assert_eq!(body_text(PAGE), "Acme Bakery Fresh bread every day. Rolls Footer");
    }

    #[test]
    fn test_json_ld_blocks_skip_malformed() {
        let blocks = json_ld_blocks(PAGE);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0]["name"], "Acme");
    }
}

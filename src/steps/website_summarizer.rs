//! Summarizes the lead's website for sales calls with an LLM.

use super::places_details::WEBSITE;
use super::places_search::PLACE_ID;
use crate::clients::llm::{ChatModel, OpenAiChat};
use crate::config::Config;
use crate::dataset::{Dataset, RowView};
use crate::domain::normalize_url;
use crate::error::{AppError, Result};
use crate::models::{ColumnSpec, Value};
use crate::scraper::{HttpPageFetcher, PageFetcher, content_text};
use crate::step::{RowEnricher, RowValues, Step, StepContext, StepState, run_row_step};
use async_trait::async_trait;
use std::sync::Arc;

pub(crate) const SALES_PERSON_SUMMARY: &str = "sales_person_summary";
const OPERATION: &str = "sales_person_summary";

const ADDED: &[ColumnSpec] = &[ColumnSpec::text(SALES_PERSON_SUMMARY)];

/// Characters of page text sent to the model.
const MAX_PAGE_CHARS: usize = 12_000;

const SYSTEM_PROMPT: &str = "You are a helpful assistant that prepares sales people for calls \
    with small and medium sized businesses.";
const USER_PROMPT: &str = "Summarize the following website text in 3 to 5 sentences for a sales \
    person. Describe what the business does, who its customers are and anything that hints at \
    its size.\n\nWebsite text:\n";

/// Writes a short salesperson briefing from the lead's website. Answers are
/// cached per place id so a lost cell does not cost another LLM call.
#[derive(Default)]
pub(crate) struct WebsiteSummarizer {
    state: StepState,
    llm: Option<Arc<dyn ChatModel>>,
    fetcher: Option<Arc<dyn PageFetcher>>,
}

impl WebsiteSummarizer {
    #[cfg(test)]
    pub(crate) fn with_clients(llm: Arc<dyn ChatModel>, fetcher: Arc<dyn PageFetcher>) -> Self {
        Self {
            llm: Some(llm),
            fetcher: Some(fetcher),
            ..Self::default()
        }
    }

    async fn summarize(&self, website: &str) -> Result<Option<String>> {
        let (Some(llm), Some(fetcher)) = (&self.llm, &self.fetcher) else {
            return Err(AppError::step("website_summarizer", "clients not loaded"));
        };
        let url = normalize_url(website)?;
        let Some(html) = fetcher.fetch(&url).await? else {
            return Ok(None);
        };
        let text: String = content_text(&html).chars().take(MAX_PAGE_CHARS).collect();
        if text.trim().is_empty() {
            return Ok(None);
        }
        let answer = llm
            .complete(SYSTEM_PROMPT, &format!("{}{}", USER_PROMPT, text))
            .await?;
        let answer = answer.trim();
        Ok((!answer.is_empty()).then(|| answer.to_string()))
    }
}

#[async_trait]
impl RowEnricher for WebsiteSummarizer {
    fn step_name(&self) -> &'static str {
        "website_summarizer"
    }

    fn output_columns(&self) -> &'static [ColumnSpec] {
        ADDED
    }

    fn applies_to(&self, row: RowView<'_>) -> bool {
        row.text(WEBSITE).is_some() && row.text(PLACE_ID).is_some()
    }

    async fn enrich_row(&self, row: RowView<'_>, ctx: &StepContext) -> Result<RowValues> {
        let place_id = row.text(PLACE_ID).unwrap_or_default();
        let force = self.state.force_refresh;
        if !force {
            if let Some(cached) = ctx.storage.fetch_gpt(place_id, OPERATION).await? {
                if let Some(summary) = cached.result.as_str() {
                    tracing::debug!(target: "website_summarizer", "Using cached summary for {}", place_id);
                    return Ok(vec![(SALES_PERSON_SUMMARY, Value::from(summary))]);
                }
            }
        }

        let summary = self.summarize(row.text(WEBSITE).unwrap_or_default()).await?;
        if let Some(summary) = &summary {
            ctx.storage
                .save_gpt(place_id, OPERATION, serde_json::Value::from(summary.as_str()), force)
                .await?;
        }
        Ok(vec![(SALES_PERSON_SUMMARY, Value::from(summary))])
    }
}

#[async_trait]
impl Step for WebsiteSummarizer {
    fn name(&self) -> &'static str {
        "website_summarizer"
    }

    fn required_cols(&self) -> &'static [&'static str] {
        &[WEBSITE, PLACE_ID]
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

    fn missing_credential(&self, config: &Config) -> Option<&'static str> {
        (self.llm.is_none() && config.openai_api_key.is_none()).then_some("OPENAI_API_KEY")
    }

    async fn load_data(&mut self, ctx: &StepContext) -> Result<()> {
        if self.llm.is_none() && ctx.config.openai_api_key.is_some() {
            self.llm = Some(Arc::new(OpenAiChat::from_config(&ctx.config)?));
        }
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

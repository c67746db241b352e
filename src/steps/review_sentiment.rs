//! Scores review sentiment with an LLM.

use super::places_search::PLACE_ID;
use crate::clients::llm::{ChatModel, OpenAiChat};
use crate::config::Config;
use crate::dataset::{Dataset, RowView};
use crate::error::{AppError, Result};
use crate::models::{ColumnKind, ColumnSpec, Value};
use crate::step::{RowEnricher, RowValues, Step, StepContext, StepState, run_row_step};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tiktoken_rs::CoreBPE;

pub(crate) const REVIEWS_SENTIMENT_SCORE: &str = "reviews_sentiment_score";

const ADDED: &[ColumnSpec] = &[ColumnSpec::new(REVIEWS_SENTIMENT_SCORE, ColumnKind::Float)];

/// Operation name under which scores live in the per-place LLM cache.
const OPERATION: &str = "reviews_sentiment";

const SYSTEM_PROMPT: &str = "You are an expert in sentiment analysis of customer reviews.";
const USER_PROMPT: &str = "Rate the overall sentiment of the following customer reviews on a \
    scale from -1 (very negative) to 1 (very positive). Answer with a single number and nothing \
    else.\n\nReviews:\n";

static NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"[-+]?\d+(?:\.\d+)?").unwrap());

/// First number in an LLM answer, clamped to `[-1, 1]`.
pub(crate) fn parse_score(answer: &str) -> Option<f64> {
    let number: f64 = NUMBER.find(answer)?.as_str().parse().ok()?;
    number.is_finite().then(|| number.clamp(-1.0, 1.0))
}

/// Greedily packs reviews into batches whose token total stays within
/// `max_tokens`. A review larger than the limit forms its own batch.
pub(crate) fn batch_reviews<F>(reviews: &[String], max_tokens: usize, count_tokens: F) -> Vec<Vec<String>>
where
    F: Fn(&str) -> usize,
{
    let mut batches = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_tokens = 0;
    for review in reviews {
        let tokens = count_tokens(review);
        if !current.is_empty() && current_tokens + tokens > max_tokens {
            batches.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current.push(review.clone());
        current_tokens += tokens;
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Scores the persisted reviews of a place with an LLM, batch by batch,
/// and stores the mean. Means are cached per place id.
#[derive(Default)]
pub(crate) struct ReviewSentiment {
    state: StepState,
    llm: Option<Arc<dyn ChatModel>>,
    encoding: Option<Arc<CoreBPE>>,
}

impl ReviewSentiment {
    #[cfg(test)]
    pub(crate) fn with_llm(llm: Arc<dyn ChatModel>) -> Self {
        Self {
            llm: Some(llm),
            ..Self::default()
        }
    }

    fn count_tokens(&self, text: &str) -> usize {
        match &self.encoding {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            None => text.split_whitespace().count(),
        }
    }
}

#[async_trait]
impl RowEnricher for ReviewSentiment {
    fn step_name(&self) -> &'static str {
        "review_sentiment"
    }

    fn output_columns(&self) -> &'static [ColumnSpec] {
        ADDED
    }

    fn applies_to(&self, row: RowView<'_>) -> bool {
        row.text(PLACE_ID).is_some()
    }

    async fn enrich_row(&self, row: RowView<'_>, ctx: &StepContext) -> Result<RowValues> {
        let place_id = row.text(PLACE_ID).unwrap_or_default();
        let force = self.state.force_refresh;
        if !force {
            if let Some(cached) = ctx.storage.fetch_gpt(place_id, OPERATION).await? {
                if let Some(score) = cached.result.as_f64() {
                    tracing::debug!(target: "review_sentiment", "Using cached score for {}", place_id);
                    return Ok(vec![(REVIEWS_SENTIMENT_SCORE, Value::Float(score.clamp(-1.0, 1.0)))]);
                }
            }
        }

        let llm = self
            .llm
            .as_ref()
            .ok_or_else(|| AppError::step(self.step_name(), "LLM client not loaded"))?;
        let texts: Vec<String> = ctx
            .storage
            .fetch_reviews(place_id)
            .await?
            .unwrap_or_default()
            .into_iter()
            .filter_map(|review| review.text)
            .map(|text| text.replace(['\n', '\r'], " ").trim().to_string())
            .filter(|text| !text.is_empty())
            .collect();
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let batches = batch_reviews(&texts, ctx.config.llm_max_batch_tokens, |t| self.count_tokens(t));
        let mut scores = Vec::with_capacity(batches.len());
        for batch in &batches {
            let prompt = format!("{}{}", USER_PROMPT, batch.join("\n"));
            let answer = llm.complete(SYSTEM_PROMPT, &prompt).await?;
            match parse_score(&answer) {
                Some(score) => scores.push(score),
                None => {
                    tracing::warn!(target: "review_sentiment", "Unparsable score for {}: {:?}", place_id, answer)
                }
            }
        }
        if scores.is_empty() {
            return Ok(Vec::new());
        }
        let mean = (scores.iter().sum::<f64>() / scores.len() as f64).clamp(-1.0, 1.0);
        ctx.storage
            .save_gpt(place_id, OPERATION, serde_json::Value::from(mean), force)
            .await?;
        Ok(vec![(REVIEWS_SENTIMENT_SCORE, Value::Float(mean))])
    }
}

#[async_trait]
impl Step for ReviewSentiment {
    fn name(&self) -> &'static str {
        "review_sentiment"
    }

    fn required_cols(&self) -> &'static [&'static str] {
        &[PLACE_ID]
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
        if self.encoding.is_none() {
            let bpe = tiktoken_rs::cl100k_base()
                .map_err(|e| AppError::step(self.name(), format!("cannot load token encoding: {}", e)))?;
            self.encoding = Some(Arc::new(bpe));
        }
        Ok(())
    }

    async fn run(&mut self, ctx: &StepContext) -> Result<Dataset> {
        run_row_step(self, ctx).await
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use crate::clients::llm::ChatModel;
    use crate::error::{AppError, Result};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Answers prompts with fixed text and remembers them.
    #[derive(Default)]
    pub(crate) struct FakeChat {
        pub answer: String,
        pub prompts: Mutex<Vec<String>>,
        pub rate_limited: bool,
    }

    impl FakeChat {
        pub(crate) fn answering(answer: &str) -> Self {
            Self {
                answer: answer.to_string(),
                ..Self::default()
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.prompts.lock().len()
        }
    }

    #[async_trait]
    impl ChatModel for FakeChat {
        async fn complete(&self, _system: &str, user: &str) -> Result<String> {
            self.prompts.lock().push(user.to_string());
            if self.rate_limited {
                return Err(AppError::RateLimited { attempts: 5 });
            }
            Ok(self.answer.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::FakeChat;
    use super::*;
    use crate::models::Review;
    use crate::step::test_support::{context, run_step};

    #[test]
    fn test_parse_score_clamps() {
        assert_eq!(parse_score("0.75"), Some(0.75));
        assert_eq!(parse_score("Score: -0.4."), Some(-0.4));
        assert_eq!(parse_score("3"), Some(1.0));
        assert_eq!(parse_score("-12.5"), Some(-1.0));
        assert_eq!(parse_score("positive"), None);
    }

    #[test]
    fn test_batches_respect_token_limit() {
        let reviews: Vec<String> = ["a b c", "d e", "f g h i", "j"].iter().map(|s| s.to_string()).collect();
        let words = |t: &str| t.split_whitespace().count();
        let batches = batch_reviews(&reviews, 5, words);
        assert_eq!(
            batches,
            vec![
                vec!["a b c".to_string(), "d e".to_string()],
                vec!["f g h i".to_string(), "j".to_string()],
            ]
        );
        let oversized = batch_reviews(&reviews, 2, words);
        assert_eq!(oversized.len(), 4);
        assert!(batch_reviews(&[], 10, words).is_empty());
    }

    #[test]
    fn test_real_encoding_counts_tokens() {
        let bpe = tiktoken_rs::cl100k_base().unwrap();
        assert!(bpe.encode_with_special_tokens("Great service").len() >= 2);
    }

    async fn with_reviews(ctx: &crate::step::StepContext) -> Dataset {
        let reviews = vec![
            Review { text: Some("Great\nbread".into()), rating: Some(5.0), ..Review::default() },
            Review { text: Some("Friendly staff".into()), rating: Some(4.0), ..Review::default() },
        ];
        ctx.storage.save_reviews("pid-a", &reviews, false).await.unwrap();
        let mut ds = Dataset::with_columns(&["Email", PLACE_ID]);
        ds.push_row(vec![("Email", "a@x.example".into()), (PLACE_ID, "pid-a".into())]).unwrap();
        ds.push_row(vec![("Email", "b@x.example".into()), (PLACE_ID, "pid-none".into())]).unwrap();
        ds
    }

    #[tokio::test]
    async fn test_score_is_written_and_bounded() {
        let ctx = context();
        let ds = with_reviews(&ctx).await;
        let llm = Arc::new(FakeChat::answering("1.7"));
        let out = run_step(&mut ReviewSentiment::with_llm(llm.clone()), ds, &ctx).await;
        assert_eq!(out.get(0, REVIEWS_SENTIMENT_SCORE), &Value::Float(1.0));
        assert_eq!(out.get(1, REVIEWS_SENTIMENT_SCORE), &Value::Absent);
        assert_eq!(llm.calls(), 1);
        let prompt = &llm.prompts.lock()[0];
        assert!(prompt.contains("Great bread\nFriendly staff"));
    }

    #[tokio::test]
    async fn test_exhausted_rate_limit_leaves_row_absent() {
        let ctx = context();
        let ds = with_reviews(&ctx).await;
        let llm = Arc::new(FakeChat {
            rate_limited: true,
            ..FakeChat::default()
        });
        let mut step = ReviewSentiment::with_llm(llm);
        let out = run_step(&mut step, ds, &ctx).await;
        assert_eq!(out.get(0, REVIEWS_SENTIMENT_SCORE), &Value::Absent);
        assert_eq!(step.state.stats.failed, 1);
    }

    #[tokio::test]
    async fn test_scores_are_served_from_llm_cache() {
        let ctx = context();
        let llm = Arc::new(FakeChat::answering("0.5"));
        let out = run_step(&mut ReviewSentiment::with_llm(llm.clone()), with_reviews(&ctx).await, &ctx).await;
        assert_eq!(out.get(0, REVIEWS_SENTIMENT_SCORE), &Value::Float(0.5));
        let cached = ctx.storage.fetch_gpt("pid-a", OPERATION).await.unwrap().unwrap();
        assert_eq!(cached.result, serde_json::json!(0.5));

        // A fresh dataset misses the row cache but not the LLM cache.
        let mut fresh = ReviewSentiment::with_llm(llm.clone());
        let again = run_step(&mut fresh, with_reviews(&ctx).await, &ctx).await;
        assert_eq!(again.get(0, REVIEWS_SENTIMENT_SCORE), &Value::Float(0.5));
        assert_eq!(llm.calls(), 1);

        let mut forced = ReviewSentiment::with_llm(llm.clone());
        forced.set_force_refresh(true);
        run_step(&mut forced, with_reviews(&ctx).await, &ctx).await;
        assert_eq!(llm.calls(), 2);
    }
}

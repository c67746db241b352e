//! Derives grammar, polarization and trend figures from stored reviews.

use super::places_search::PLACE_ID;
use crate::clients::grammar::{GrammarChecker, LanguageToolClient, grammar_score};
use crate::dataset::{Dataset, RowView};
use crate::error::Result;
use crate::models::{ColumnKind, ColumnSpec, Review, Value};
use crate::step::{RowEnricher, RowValues, Step, StepContext, StepState, run_row_step};
use async_trait::async_trait;
use std::sync::Arc;

pub(crate) const AVG_GRAMMATICAL_SCORE: &str = "review_avg_grammatical_score";
pub(crate) const POLARIZATION_TYPE: &str = "review_polarization_type";
pub(crate) const POLARIZATION_SCORE: &str = "review_polarization_score";
pub(crate) const HIGHEST_RATING_RATIO: &str = "review_highest_rating_ratio";
pub(crate) const LOWEST_RATING_RATIO: &str = "review_lowest_rating_ratio";
pub(crate) const RATING_TREND: &str = "review_rating_trend";

const ADDED: &[ColumnSpec] = &[
    ColumnSpec::new(AVG_GRAMMATICAL_SCORE, ColumnKind::Float),
    ColumnSpec::text(POLARIZATION_TYPE),
    ColumnSpec::new(POLARIZATION_SCORE, ColumnKind::Float),
    ColumnSpec::new(HIGHEST_RATING_RATIO, ColumnKind::Float),
    ColumnSpec::new(LOWEST_RATING_RATIO, ColumnKind::Float),
    ColumnSpec::new(RATING_TREND, ColumnKind::Float),
];

const SECONDS_PER_YEAR: f64 = 365.25 * 24.0 * 3600.0;

/// Shares of top and bottom ratings among rated reviews.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Polarization {
    pub highest_ratio: f64,
    pub lowest_ratio: f64,
    pub score: f64,
}

impl Polarization {
    pub(crate) fn kind(&self) -> &'static str {
        if self.score.abs() < 0.1 {
            "Balanced"
        } else if self.score > 0.0 {
            "High-Rated"
        } else {
            "Low-Rated"
        }
    }
}

pub(crate) fn polarization(reviews: &[Review]) -> Option<Polarization> {
    let ratings: Vec<f64> = reviews.iter().filter_map(|r| r.rating).collect();
    if ratings.is_empty() {
        return None;
    }
    let n = ratings.len() as f64;
    let highest = ratings.iter().filter(|r| r.round() >= 5.0).count() as f64 / n;
    let lowest = ratings.iter().filter(|r| r.round() <= 1.0).count() as f64 / n;
    Some(Polarization {
        highest_ratio: highest,
        lowest_ratio: lowest,
        score: highest - lowest,
    })
}

/// Least-squares slope of rating over review time, in stars per year.
pub(crate) fn rating_trend(reviews: &[Review]) -> Option<f64> {
    let points: Vec<(f64, f64)> = reviews
        .iter()
        .filter_map(|r| Some((r.time? as f64 / SECONDS_PER_YEAR, r.rating?)))
        .collect();
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
    let covariance: f64 = points.iter().map(|(x, y)| (x - mean_x) * (y - mean_y)).sum();
    let variance: f64 = points.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
    (variance > 0.0).then(|| covariance / variance)
}

/// Grammar quality, rating polarisation and rating trend of the persisted
/// reviews of a place.
#[derive(Default)]
pub(crate) struct ReviewInsights {
    state: StepState,
    grammar: Option<Arc<dyn GrammarChecker>>,
}

impl ReviewInsights {
    #[cfg(test)]
    pub(crate) fn with_checker(grammar: Arc<dyn GrammarChecker>) -> Self {
        Self {
            grammar: Some(grammar),
            ..Self::default()
        }
    }

    /// Mean grammar score over reviews with text. A checker failure fails
    /// the whole row so it is retried on the next run.
    async fn average_grammar_score(&self, reviews: &[Review]) -> Result<Option<f64>> {
        let Some(grammar) = self.grammar.as_ref() else {
            return Ok(None);
        };
        let mut scores = Vec::new();
        for review in reviews {
            let Some(text) = review.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) else {
                continue;
            };
            let errors = grammar.count_errors(text, review.language.as_deref()).await?;
            scores.extend(grammar_score(errors, text.split_whitespace().count()));
        }
        Ok((!scores.is_empty()).then(|| scores.iter().sum::<f64>() / scores.len() as f64))
    }
}

#[async_trait]
impl RowEnricher for ReviewInsights {
    fn step_name(&self) -> &'static str {
        "review_insights"
    }

    fn output_columns(&self) -> &'static [ColumnSpec] {
        ADDED
    }

    fn applies_to(&self, row: RowView<'_>) -> bool {
        row.text(PLACE_ID).is_some()
    }

    async fn enrich_row(&self, row: RowView<'_>, ctx: &StepContext) -> Result<RowValues> {
        let place_id = row.text(PLACE_ID).unwrap_or_default();
        let reviews = ctx.storage.fetch_reviews(place_id).await?.unwrap_or_default();
        if reviews.is_empty() {
            return Ok(Vec::new());
        }

        let mut values = vec![
            (AVG_GRAMMATICAL_SCORE, Value::from(self.average_grammar_score(&reviews).await?)),
            (RATING_TREND, Value::from(rating_trend(&reviews))),
        ];
        if let Some(p) = polarization(&reviews) {
            values.extend([
                (POLARIZATION_TYPE, Value::from(p.kind())),
                (POLARIZATION_SCORE, Value::Float(p.score)),
                (HIGHEST_RATING_RATIO, Value::Float(p.highest_ratio)),
                (LOWEST_RATING_RATIO, Value::Float(p.lowest_ratio)),
            ]);
        }
        Ok(values)
    }
}

#[async_trait]
impl Step for ReviewInsights {
    fn name(&self) -> &'static str {
        "review_insights"
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

    async fn load_data(&mut self, ctx: &StepContext) -> Result<()> {
        if self.grammar.is_none() {
            self.grammar = Some(Arc::new(LanguageToolClient::from_config(&ctx.config)?));
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
    use crate::error::AppError;
    use crate::step::test_support::{context, run_step};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountsWordsStartingWithX;

    #[async_trait]
    impl GrammarChecker for CountsWordsStartingWithX {
        async fn count_errors(&self, text: &str, _language: Option<&str>) -> Result<usize> {
            Ok(text.split_whitespace().filter(|w| w.starts_with('x')).count())
        }
    }

    /// Fails its first call like an overloaded server, then counts nothing.
    #[derive(Default)]
    struct FailsOnce {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl GrammarChecker for FailsOnce {
        async fn count_errors(&self, _text: &str, _language: Option<&str>) -> Result<usize> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(AppError::ExternalApi {
                    service: "grammar",
                    message: "HTTP 503".into(),
                });
            }
            Ok(0)
        }
    }

    fn review(rating: f64, text: &str, time: i64) -> Review {
        Review {
            rating: Some(rating),
            text: Some(text.to_string()),
            time: Some(time),
            ..Review::default()
        }
    }

    #[test]
    fn test_polarization() {
        let reviews = [review(5.0, "a", 0), review(5.0, "b", 0), review(1.0, "c", 0), review(3.0, "d", 0)];
        let p = polarization(&reviews).unwrap();
        assert_eq!(p.highest_ratio, 0.5);
        assert_eq!(p.lowest_ratio, 0.25);
        assert_eq!(p.score, 0.25);
        assert_eq!(p.kind(), "High-Rated");
        let balanced = polarization(&[review(5.0, "a", 0), review(1.0, "b", 0)]).unwrap();
        assert_eq!(balanced.kind(), "Balanced");
        assert_eq!(polarization(&[review(1.0, "a", 0)]).unwrap().kind(), "Low-Rated");
        assert!(polarization(&[]).is_none());
    }

    #[test]
    fn test_rating_trend_in_stars_per_year() {
        let year = SECONDS_PER_YEAR as i64;
        let rising = [review(2.0, "a", 0), review(3.0, "b", year), review(4.0, "c", 2 * year)];
        let slope = rating_trend(&rising).unwrap();
        assert!((slope - 1.0).abs() < 1e-9);
        assert!(rating_trend(&[review(2.0, "a", 0)]).is_none());
        assert!(rating_trend(&[review(2.0, "a", 5), review(4.0, "b", 5)]).is_none());
    }

    #[tokio::test]
    async fn test_insights_row() {
        let ctx = context();
        let year = SECONDS_PER_YEAR as i64;
        let reviews = vec![
            review(5.0, "good bread here", 0),
            review(1.0, "xbad xservice", year),
        ];
        ctx.storage.save_reviews("pid-a", &reviews, false).await.unwrap();
        let mut ds = Dataset::with_columns(&["Email", PLACE_ID]);
        ds.push_row(vec![("Email", "a@x.example".into()), (PLACE_ID, "pid-a".into())]).unwrap();

        let mut step = ReviewInsights::with_checker(Arc::new(CountsWordsStartingWithX));
        let out = run_step(&mut step, ds, &ctx).await;
        assert_eq!(out.get(0, AVG_GRAMMATICAL_SCORE), &Value::Float(0.5));
        assert_eq!(out.get(0, POLARIZATION_TYPE), &Value::from("Balanced"));
        assert_eq!(out.get(0, HIGHEST_RATING_RATIO), &Value::Float(0.5));
        assert_eq!(out.get(0, RATING_TREND).as_f64().map(|t| t.round()), Some(-4.0));
    }

    #[tokio::test]
    async fn test_grammar_failure_is_retried_next_run() {
        let ctx = context();
        ctx.storage
            .save_reviews("pid-a", &[review(4.0, "solid place", 0)], false)
            .await
            .unwrap();
        let mut ds = Dataset::with_columns(&["Email", PLACE_ID]);
        ds.push_row(vec![("Email", "a@x.example".into()), (PLACE_ID, "pid-a".into())]).unwrap();
        let checker = Arc::new(FailsOnce::default());

        let mut first = ReviewInsights::with_checker(checker.clone());
        let out = run_step(&mut first, ds, &ctx).await;
        assert_eq!(first.state.stats.failed, 1);
        assert!(out.get(0, AVG_GRAMMATICAL_SCORE).is_absent());
        assert!(out.get(0, POLARIZATION_TYPE).is_absent());

        let mut second = ReviewInsights::with_checker(checker.clone());
        let out = run_step(&mut second, out, &ctx).await;
        assert_eq!(second.state.stats.cache_hits, 0);
        assert_eq!(second.state.stats.computed, 1);
        assert_eq!(out.get(0, AVG_GRAMMATICAL_SCORE), &Value::Float(1.0));
        assert_eq!(checker.calls.load(Ordering::SeqCst), 2);
    }
}

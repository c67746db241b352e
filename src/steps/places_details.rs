//! Fetches place details and persists the place's reviews.

use super::places_search::PLACE_ID;
use crate::clients::places::{GooglePlacesClient, PlacesApi};
use crate::config::{Config, get_random_sleep_duration};
use crate::dataset::{Dataset, RowView};
use crate::error::{AppError, Result};
use crate::models::{ColumnSpec, Value};
use crate::step::{RowEnricher, RowValues, Step, StepContext, StepState, run_row_step};
use async_trait::async_trait;
use std::sync::Arc;

pub(crate) const WEBSITE: &str = "website";
pub(crate) const TYPE: &str = "type";
pub(crate) const REVIEWS_PATH: &str = "reviews_path";

const ADDED: &[ColumnSpec] = &[
    ColumnSpec::text(WEBSITE),
    ColumnSpec::text(TYPE),
    ColumnSpec::text(REVIEWS_PATH),
];

/// Fetches website, primary type and reviews of a place. Reviews are stored
/// as a side artifact keyed by place id before the row is written.
#[derive(Default)]
pub(crate) struct PlacesDetails {
    state: StepState,
    api: Option<Arc<dyn PlacesApi>>,
}

impl PlacesDetails {
    #[cfg(test)]
    pub(crate) fn with_api(api: Arc<dyn PlacesApi>) -> Self {
        Self {
            api: Some(api),
            ..Self::default()
        }
    }
}

#[async_trait]
impl RowEnricher for PlacesDetails {
    fn step_name(&self) -> &'static str {
        "places_details"
    }

    fn output_columns(&self) -> &'static [ColumnSpec] {
        ADDED
    }

    fn applies_to(&self, row: RowView<'_>) -> bool {
        row.text(PLACE_ID).is_some()
    }

    async fn enrich_row(&self, row: RowView<'_>, ctx: &StepContext) -> Result<RowValues> {
        let api = self
            .api
            .as_ref()
            .ok_or_else(|| AppError::step(self.step_name(), "places client not loaded"))?;
        let place_id = row.text(PLACE_ID).unwrap_or_default();
        tokio::time::sleep(get_random_sleep_duration(&ctx.config)).await;
        let Some(details) = api.place_details(place_id).await? else {
            return Ok(Vec::new());
        };

        let reviews_path = match &details.reviews {
            Some(reviews) => Some(
                ctx.storage
                    .save_reviews(place_id, reviews, self.state.force_refresh)
                    .await?,
            ),
            None => None,
        };
        Ok(vec![
            (WEBSITE, Value::from(details.website)),
            (TYPE, Value::from(details.types.into_iter().next())),
            (REVIEWS_PATH, Value::from(reviews_path)),
        ])
    }
}

#[async_trait]
impl Step for PlacesDetails {
    fn name(&self) -> &'static str {
        "places_details"
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
        (self.api.is_none() && config.google_places_api_key.is_none())
            .then_some("GOOGLE_PLACES_API_KEY")
    }

    async fn load_data(&mut self, ctx: &StepContext) -> Result<()> {
        if self.api.is_none() && ctx.config.google_places_api_key.is_some() {
            self.api = Some(Arc::new(GooglePlacesClient::from_config(&ctx.config)?));
        }
        Ok(())
    }

    async fn run(&mut self, ctx: &StepContext) -> Result<Dataset> {
        run_row_step(self, ctx).await
    }
}

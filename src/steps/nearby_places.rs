//! Counts similar businesses around the lead's location.

use super::places_search::{LATITUDE, LONGITUDE, PLACE_ID};
use crate::clients::places::{GooglePlacesClient, PlacesApi};
use crate::config::{Config, get_random_sleep_duration};
use crate::dataset::{Dataset, RowView};
use crate::error::{AppError, Result};
use crate::models::{ArtifactKind, ColumnKind, ColumnSpec, Value};
use crate::step::{RowEnricher, RowValues, Step, StepContext, StepState, run_row_step};
use async_trait::async_trait;
use std::sync::Arc;

pub(crate) const NO_SIMILAR_BUSINESSES: &str = "no_similar_businesses";

const ADDED: &[ColumnSpec] = &[ColumnSpec::new(NO_SIMILAR_BUSINESSES, ColumnKind::Int)];

/// Counts establishments around the lead's coordinates. The raw result list
/// is kept as a side artifact when the row has a place id.
#[derive(Default)]
pub(crate) struct NearbyPlaces {
    state: StepState,
    api: Option<Arc<dyn PlacesApi>>,
}

impl NearbyPlaces {
    #[cfg(test)]
    pub(crate) fn with_api(api: Arc<dyn PlacesApi>) -> Self {
        Self {
            api: Some(api),
            ..Self::default()
        }
    }
}

#[async_trait]
impl RowEnricher for NearbyPlaces {
    fn step_name(&self) -> &'static str {
        "nearby_places"
    }

    fn output_columns(&self) -> &'static [ColumnSpec] {
        ADDED
    }

    fn applies_to(&self, row: RowView<'_>) -> bool {
        row.float(LATITUDE).is_some() && row.float(LONGITUDE).is_some()
    }

    async fn enrich_row(&self, row: RowView<'_>, ctx: &StepContext) -> Result<RowValues> {
        let api = self
            .api
            .as_ref()
            .ok_or_else(|| AppError::step(self.step_name(), "places client not loaded"))?;
        let (Some(lat), Some(lng)) = (row.float(LATITUDE), row.float(LONGITUDE)) else {
            return Ok(Vec::new());
        };
        tokio::time::sleep(get_random_sleep_duration(&ctx.config)).await;
        let results = api.nearby(lat, lng, ctx.config.nearby_radius_m).await?;
        if let Some(place_id) = row.text(PLACE_ID) {
            let json = serde_json::Value::Array(results.clone());
            ctx.storage
                .save_artifact(ArtifactKind::Nearby, place_id, &json, self.state.force_refresh)
                .await?;
        }
        Ok(vec![(NO_SIMILAR_BUSINESSES, Value::from(results.len()))])
    }
}

#[async_trait]
impl Step for NearbyPlaces {
    fn name(&self) -> &'static str {
        "nearby_places"
    }

    fn required_cols(&self) -> &'static [&'static str] {
        &[LATITUDE, LONGITUDE]
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::test_support::{context, run_step};
    use crate::steps::places_search::fakes::FakePlaces;

    #[tokio::test]
    async fn test_count_and_artifact() {
        let ctx = context();
        let api = Arc::new(FakePlaces::default());
        let mut ds = Dataset::with_columns(&["Email", PLACE_ID, LATITUDE, LONGITUDE]);
        ds.push_row(vec![
            ("Email", "a@x.example".into()),
            (PLACE_ID, "pid-a".into()),
            (LATITUDE, "52.53".into()),
            (LONGITUDE, "13.38".into()),
        ])
        .unwrap();
        ds.push_row(vec![("Email", "b@x.example".into()), (LATITUDE, "52.53".into())])
            .unwrap();

        let out = run_step(&mut NearbyPlaces::with_api(api.clone()), ds, &ctx).await;
        assert_eq!(out.get(0, NO_SIMILAR_BUSINESSES), &Value::Int(2));
        assert_eq!(out.get(1, NO_SIMILAR_BUSINESSES), &Value::Absent);
        assert_eq!(api.calls(), 1);
        let artifact = ctx
            .storage
            .fetch_artifact(ArtifactKind::Nearby, "pid-a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(artifact.as_array().map(Vec::len), Some(2));
    }
}

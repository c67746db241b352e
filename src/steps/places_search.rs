//! Finds the lead's business with a places text search.

use super::email_analyzer::{DOMAIN, FIRST_NAME_IN_ACCOUNT, LAST_NAME_IN_ACCOUNT};
use crate::clients::places::{GooglePlacesClient, PlacesApi};
use crate::config::{Config, get_random_sleep_duration};
use crate::dataset::{Dataset, RowView};
use crate::domain::split_email;
use crate::error::{AppError, Result};
use crate::models::{ColumnKind, ColumnSpec, EMAIL, Value};
use crate::step::{RowEnricher, RowValues, Step, StepContext, StepState, run_row_step};
use async_trait::async_trait;
use std::sync::Arc;

pub(crate) const BUSINESS_STATUS: &str = "business_status";
pub(crate) const FORMATTED_ADDRESS: &str = "formatted_address";
pub(crate) const NAME: &str = "name";
pub(crate) const USER_RATINGS_TOTAL: &str = "user_ratings_total";
pub(crate) const NO_CANDIDATES: &str = "no_candidates";
pub(crate) const PLACE_ID: &str = "place_id";
pub(crate) const LATITUDE: &str = "latitude";
pub(crate) const LONGITUDE: &str = "longitude";

const ADDED: &[ColumnSpec] = &[
    ColumnSpec::text(BUSINESS_STATUS),
    ColumnSpec::text(FORMATTED_ADDRESS),
    ColumnSpec::text(NAME),
    ColumnSpec::new(USER_RATINGS_TOTAL, ColumnKind::Int),
    ColumnSpec::new(NO_CANDIDATES, ColumnKind::Int),
    ColumnSpec::text(PLACE_ID),
    ColumnSpec::new(LATITUDE, ColumnKind::Float),
    ColumnSpec::new(LONGITUDE, ColumnKind::Float),
];

/// Search text for a lead: the business domain, or else the e-mail local
/// part when it is not just the person's name.
pub(crate) fn search_query(row: RowView<'_>) -> Option<String> {
    if let Some(domain) = row.text(DOMAIN) {
        return Some(domain.to_string());
    }
    let (local, _) = split_email(row.text(EMAIL)?)?;
    let is_personal = row.flag(FIRST_NAME_IN_ACCOUNT).unwrap_or(false)
        && row.flag(LAST_NAME_IN_ACCOUNT).unwrap_or(false);
    if is_personal {
        return None;
    }
    let query: String = local
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let query = query.split_whitespace().collect::<Vec<_>>().join(" ");
    (!query.is_empty()).then_some(query)
}

#[derive(Default)]
pub(crate) struct PlacesSearch {
    state: StepState,
    api: Option<Arc<dyn PlacesApi>>,
}

impl PlacesSearch {
    #[cfg(test)]
    pub(crate) fn with_api(api: Arc<dyn PlacesApi>) -> Self {
        Self {
            api: Some(api),
            ..Self::default()
        }
    }
}

#[async_trait]
impl RowEnricher for PlacesSearch {
    fn step_name(&self) -> &'static str {
        "places_search"
    }

    fn output_columns(&self) -> &'static [ColumnSpec] {
        ADDED
    }

    fn applies_to(&self, row: RowView<'_>) -> bool {
        search_query(row).is_some()
    }

    async fn enrich_row(&self, row: RowView<'_>, ctx: &StepContext) -> Result<RowValues> {
        let api = self
            .api
            .as_ref()
            .ok_or_else(|| AppError::step(self.step_name(), "places client not loaded"))?;
        let Some(query) = search_query(row) else {
            return Ok(Vec::new());
        };
        tokio::time::sleep(get_random_sleep_duration(&ctx.config)).await;
        let candidates = api.find_place(&query).await?;
        let mut values = vec![(NO_CANDIDATES, Value::from(candidates.len()))];
        if let Some(top) = candidates.into_iter().next() {
            let location = top.geometry.map(|g| g.location);
            values.extend([
                (BUSINESS_STATUS, Value::from(top.business_status)),
                (FORMATTED_ADDRESS, Value::from(top.formatted_address)),
                (NAME, Value::from(top.name)),
                (USER_RATINGS_TOTAL, Value::from(top.user_ratings_total)),
                (PLACE_ID, Value::from(top.place_id)),
                (LATITUDE, Value::from(location.as_ref().map(|l| l.lat))),
                (LONGITUDE, Value::from(location.as_ref().map(|l| l.lng))),
            ]);
        }
        Ok(values)
    }
}

#[async_trait]
impl Step for PlacesSearch {
    fn name(&self) -> &'static str {
        "places_search"
    }

    fn required_cols(&self) -> &'static [&'static str] {
        &[EMAIL, DOMAIN, FIRST_NAME_IN_ACCOUNT, LAST_NAME_IN_ACCOUNT]
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

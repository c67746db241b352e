//! Looks up the contact person in the business registry.

use crate::clients::registry::{RegistryApi, RegistryClient};
use crate::config::get_random_sleep_duration;
use crate::dataset::{Dataset, RowView};
use crate::error::{AppError, Result};
use crate::models::{ColumnKind, ColumnSpec, FIRST_NAME, LAST_NAME, Value};
use crate::step::{RowEnricher, RowValues, Step, StepContext, StepState, run_row_step};
use async_trait::async_trait;
use std::sync::Arc;

pub(crate) const COMPANY_NAME: &str = "company_name";
pub(crate) const COMPANY_OBJECTIVE: &str = "company_objective";
pub(crate) const COMPANY_CAPITAL: &str = "company_capital";
pub(crate) const COMPANY_CAPITAL_CURRENCY: &str = "company_capital_currency";
pub(crate) const COMPANY_ADDRESS: &str = "company_address";

const ADDED: &[ColumnSpec] = &[
    ColumnSpec::text(COMPANY_NAME),
    ColumnSpec::text(COMPANY_OBJECTIVE),
    ColumnSpec::new(COMPANY_CAPITAL, ColumnKind::Float),
    ColumnSpec::text(COMPANY_CAPITAL_CURRENCY),
    ColumnSpec::text(COMPANY_ADDRESS),
];

/// Looks the contact person up in the company registry and records the
/// first company they are an officer of.
#[derive(Default)]
pub(crate) struct RegistryLookup {
    state: StepState,
    api: Option<Arc<dyn RegistryApi>>,
}

impl RegistryLookup {
    #[cfg(test)]
    pub(crate) fn with_api(api: Arc<dyn RegistryApi>) -> Self {
        Self {
            api: Some(api),
            ..Self::default()
        }
    }
}

#[async_trait]
impl RowEnricher for RegistryLookup {
    fn step_name(&self) -> &'static str {
        "registry_lookup"
    }

    fn output_columns(&self) -> &'static [ColumnSpec] {
        ADDED
    }

    fn applies_to(&self, row: RowView<'_>) -> bool {
        row.text(FIRST_NAME).is_some() && row.text(LAST_NAME).is_some()
    }

    async fn enrich_row(&self, row: RowView<'_>, ctx: &StepContext) -> Result<RowValues> {
        let api = self
            .api
            .as_ref()
            .ok_or_else(|| AppError::step(self.step_name(), "registry client not loaded"))?;
        let first = row.text(FIRST_NAME).unwrap_or_default();
        let last = row.text(LAST_NAME).unwrap_or_default();
        tokio::time::sleep(get_random_sleep_duration(&ctx.config)).await;
        let Some(company) = api.search_officer(first, last).await?.into_iter().next() else {
            return Ok(Vec::new());
        };
        Ok(vec![
            (COMPANY_NAME, Value::from(company.name)),
            (COMPANY_OBJECTIVE, Value::from(company.objective)),
            (COMPANY_CAPITAL, Value::from(company.capital)),
            (COMPANY_CAPITAL_CURRENCY, Value::from(company.currency)),
            (COMPANY_ADDRESS, Value::from(company.address)),
        ])
    }
}

#[async_trait]
impl Step for RegistryLookup {
    fn name(&self) -> &'static str {
        "registry_lookup"
    }

    fn required_cols(&self) -> &'static [&'static str] {
        &[FIRST_NAME, LAST_NAME]
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
        if self.api.is_none() {
            self.api = Some(Arc::new(RegistryClient::from_config(&ctx.config)?));
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
    use crate::clients::registry::RegistryCompany;
    use crate::step::test_support::{context, run_step, seed};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeRegistry {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RegistryApi for FakeRegistry {
        async fn search_officer(&self, first: &str, last: &str) -> Result<Vec<RegistryCompany>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if (first, last) != ("John", "Doe") {
                return Ok(Vec::new());
            }
            Ok(vec![
                RegistryCompany {
                    name: Some("Acme GmbH".into()),
                    objective: Some("Baking bread".into()),
                    capital: Some(25000.0),
                    currency: Some("EUR".into()),
                    address: Some("Hauptstraße 1, 10115 Berlin".into()),
                },
                RegistryCompany {
                    name: Some("Other GmbH".into()),
                    ..RegistryCompany::default()
                },
            ])
        }
    }

    #[tokio::test]
    async fn test_first_match_is_recorded() {
        let ctx = context();
        let api = Arc::new(FakeRegistry::default());
        let out = run_step(&mut RegistryLookup::with_api(api.clone()), seed(), &ctx).await;
        assert_eq!(out.get(0, COMPANY_NAME), &Value::from("Acme GmbH"));
        assert_eq!(out.get(0, COMPANY_CAPITAL), &Value::Float(25000.0));
        assert_eq!(out.get(1, COMPANY_NAME), &Value::Absent);
        assert_eq!(api.calls.load(Ordering::SeqCst), 3);

        // Empty results are remembered too.
        run_step(&mut RegistryLookup::with_api(api.clone()), out, &ctx).await;
        assert_eq!(api.calls.load(Ordering::SeqCst), 3);
    }
}

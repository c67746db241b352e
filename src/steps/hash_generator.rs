//! Adds the lead fingerprint as a column.

use crate::cache::fingerprint;
use crate::dataset::Dataset;
use crate::error::{AppError, Result};
use crate::models::{ColumnSpec, IDENTITY_COLUMNS, Value};
use crate::step::{Step, StepContext, StepState, StepStats};
use async_trait::async_trait;

pub(crate) const LEAD_HASH: &str = "lead_hash";

const ADDED: &[ColumnSpec] = &[ColumnSpec::text(LEAD_HASH)];

/// Writes the fingerprint of every row. The fingerprint is the lead cache
/// key, so this step never consults the cache itself.
#[derive(Default)]
pub(crate) struct HashGenerator {
    state: StepState,
}

#[async_trait]
impl Step for HashGenerator {
    fn name(&self) -> &'static str {
        "hash_generator"
    }

    fn required_cols(&self) -> &'static [&'static str] {
        &IDENTITY_COLUMNS
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

    async fn run(&mut self, _ctx: &StepContext) -> Result<Dataset> {
        let mut dataset = self
            .state
            .dataset
            .take()
            .ok_or_else(|| AppError::step(self.name(), "no dataset assigned"))?;
        dataset.declare_column(LEAD_HASH, ADDED[0].kind)?;
        for index in 0..dataset.len() {
            let hash = fingerprint(&dataset.identity(index));
            dataset.set(index, LEAD_HASH, Value::Text(hash))?;
        }
        self.state.stats = StepStats {
            rows: dataset.len(),
            computed: dataset.len(),
            ..StepStats::default()
        };
        self.state.dataset = Some(dataset.clone());
        Ok(dataset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::test_support::{context, run_step, seed};

    #[tokio::test]
    async fn test_identical_leads_share_a_hash() {
        let ctx = context();
        let mut ds = seed();
        ds.push_row(vec![
            ("Last Name", "Doe".into()),
            ("First Name", "John".into()),
            ("Company / Account", "Acme".into()),
            ("Phone", "4930183992170".into()),
            ("Email", "john.doe@acme.example".into()),
        ])
        .unwrap();
        ds.push_row(vec![
            ("Last Name", "Doe".into()),
            ("First Name", "John".into()),
            ("Company / Account", "Acme".into()),
            ("Phone", "4930183992170".into()),
            ("Email", "john.doe@acme.com".into()),
        ])
        .unwrap();

        let out = run_step(&mut HashGenerator::default(), ds, &ctx).await;
        let hash = |i: usize| out.get(i, LEAD_HASH).as_str().unwrap().to_string();
        assert_eq!(hash(0).len(), 64);
        assert!(hash(0).chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash(0), hash(3));
        assert_ne!(hash(0), hash(4));
        assert_eq!(out.len(), 5);
    }

    #[tokio::test]
    async fn test_absent_fields_hash_consistently() {
        let ctx = context();
        let mut ds = crate::dataset::Dataset::with_columns(&IDENTITY_COLUMNS);
        for _ in 0..2 {
            ds.push_row(vec![("First Name", "Ann".into()), ("Email", "ann@x.example".into())])
                .unwrap();
        }
        let out = run_step(&mut HashGenerator::default(), ds, &ctx).await;
        assert_eq!(out.get(0, LEAD_HASH), out.get(1, LEAD_HASH));
    }
}

//! The step contract shared by every enrichment unit, and the per-row
//! driver that applies lead-cache memoization.

use crate::cache::{LeadCache, fingerprint};
use crate::config::Config;
use crate::dataset::{Dataset, RowView};
use crate::error::{AppError, Result};
use crate::models::{ColumnSpec, Value};
use crate::storage::StorageBackend;
use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;
use std::sync::Arc;

/// Handles shared by all steps of a run.
#[derive(Clone)]
pub(crate) struct StepContext {
    pub config: Arc<Config>,
    pub storage: Arc<dyn StorageBackend>,
    pub cache: Arc<LeadCache>,
    /// Shared client for website scraping; API clients build their own.
    pub http: Client,
}

impl StepContext {
    pub(crate) fn new(
        config: Arc<Config>,
        storage: Arc<dyn StorageBackend>,
        cache: Arc<LeadCache>,
    ) -> Result<Self> {
        let http = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.scrape_timeout)
            .build()
            .map_err(|e| AppError::Generic(anyhow::anyhow!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            config,
            storage,
            cache,
            http,
        })
    }
}

/// Counters reported by `finish()`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct StepStats {
    pub rows: usize,
    pub computed: usize,
    pub cache_hits: usize,
    pub not_applicable: usize,
    pub failed: usize,
}

/// Mutable state every step carries between lifecycle phases.
#[derive(Debug, Default)]
pub(crate) struct StepState {
    pub dataset: Option<Dataset>,
    pub force_refresh: bool,
    pub stats: StepStats,
}

/// Output cells of one row.
pub(crate) type RowValues = Vec<(&'static str, Value)>;

/// One enrichment unit with a load → verify → run → finish lifecycle.
#[async_trait]
pub(crate) trait Step: Send + Sync {
    /// Identifier used in logs, lookup tables and snapshot names.
    fn name(&self) -> &'static str;

    /// Columns that must exist before the step runs.
    fn required_cols(&self) -> &'static [&'static str];

    /// Columns the step appends, with their types.
    fn added_cols(&self) -> &'static [ColumnSpec];

    fn state(&self) -> &StepState;

    fn state_mut(&mut self) -> &mut StepState;

    fn force_refresh(&self) -> bool {
        self.state().force_refresh
    }

    fn set_force_refresh(&mut self, force: bool) {
        self.state_mut().force_refresh = force;
    }

    fn has_dataset(&self) -> bool {
        self.state().dataset.is_some()
    }

    fn set_dataset(&mut self, dataset: Dataset) {
        self.state_mut().dataset = Some(dataset);
    }

    /// Name of a missing credential, if the step needs one that is not set.
    fn missing_credential(&self, _config: &Config) -> Option<&'static str> {
        None
    }

    /// Acquires API clients and other handles.
    async fn load_data(&mut self, _ctx: &StepContext) -> Result<()> {
        Ok(())
    }

    /// True iff every required column is present and credentials are set.
    fn verify(&self, config: &Config) -> bool {
        let Some(dataset) = self.state().dataset.as_ref() else {
            tracing::warn!(target: "pipeline", "[{}] No dataset assigned", self.name());
            return false;
        };
        let missing: Vec<&str> = self
            .required_cols()
            .iter()
            .copied()
            .filter(|c| !dataset.has_column(c))
            .collect();
        if !missing.is_empty() {
            tracing::warn!(target: "pipeline", "[{}] Missing required columns: {}", self.name(), missing.join(", "));
            return false;
        }
        if let Some(credential) = self.missing_credential(config) {
            tracing::warn!(target: "pipeline", "[{}] Missing credential {}", self.name(), credential);
            return false;
        }
        true
    }

    /// True iff every added column exists and is filled for every row.
    fn check_data_presence(&self) -> bool {
        let Some(dataset) = self.state().dataset.as_ref() else {
            return false;
        };
        !dataset.is_empty()
            && self
                .added_cols()
                .iter()
                .all(|c| dataset.has_column(c.name) && dataset.coverage(c.name) >= 100.0)
    }

    /// Produces the enriched dataset, equal in length to the input.
    async fn run(&mut self, ctx: &StepContext) -> Result<Dataset>;

    /// Logs coverage of the added columns and the row counters.
    fn finish(&self) {
        let stats = &self.state().stats;
        tracing::info!(target: "pipeline",
            "[{}] rows={} computed={} cache_hits={} not_applicable={} failed={}",
            self.name(), stats.rows, stats.computed, stats.cache_hits, stats.not_applicable, stats.failed
        );
        if let Some(dataset) = self.state().dataset.as_ref() {
            for column in self.added_cols() {
                tracing::info!(target: "pipeline",
                    "[{}] {}: {:.2}% coverage",
                    self.name(), column.name, dataset.coverage(column.name)
                );
            }
        }
    }
}

/// Per-row computation of a step.
#[async_trait]
pub(crate) trait RowEnricher: Send + Sync {
    fn step_name(&self) -> &'static str;

    fn output_columns(&self) -> &'static [ColumnSpec];

    /// Rows for which this is false are left untouched and cost no call.
    fn applies_to(&self, _row: RowView<'_>) -> bool {
        true
    }

    /// Computes the output cells of one row. Errors are row-local unless fatal.
    async fn enrich_row(&self, row: RowView<'_>, ctx: &StepContext) -> Result<RowValues>;
}

fn progress_bar(len: usize, step: &str) -> ProgressBar {
    let bar = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
    {
        bar.set_style(style.progress_chars("##-"));
    }
    bar.set_message(step.to_string());
    bar
}

/// Applies `enricher` to every row in insertion order.
///
/// Rows whose fingerprint is recorded for the step are skipped unless
/// `force_refresh` is set or a cell the recorded computation filled is now
/// absent on the row. Computed rows are written and recorded in the lookup
/// table together with the columns they filled. Failed rows get absent
/// outputs and stay unrecorded; only fatal errors abort.
pub(crate) async fn enrich_rows<E>(
    enricher: &E,
    dataset: &mut Dataset,
    ctx: &StepContext,
    force_refresh: bool,
) -> Result<StepStats>
where
    E: RowEnricher + ?Sized,
{
    let step = enricher.step_name();
    let outputs = enricher.output_columns();
    for column in outputs {
        dataset.declare_column(column.name, column.kind)?;
    }

    let mut stats = StepStats {
        rows: dataset.len(),
        ..StepStats::default()
    };
    let bar = progress_bar(dataset.len(), step);

    for index in 0..dataset.len() {
        bar.inc(1);
        let row = dataset.row(index);
        if !enricher.applies_to(row) {
            stats.not_applicable += 1;
            continue;
        }

        let identity = row.identity();
        let fp = fingerprint(&identity);
        if !force_refresh && ctx.cache.is_hit(step, &fp, row).await? {
            stats.cache_hits += 1;
            continue;
        }

        match enricher.enrich_row(row, ctx).await {
            Ok(values) => {
                for column in outputs {
                    dataset.set(index, column.name, Value::Absent)?;
                }
                for (column, value) in values {
                    dataset.set(index, column, value)?;
                }
                let filled = outputs
                    .iter()
                    .filter(|c| !dataset.get(index, c.name).is_absent())
                    .map(|c| c.name.to_string())
                    .collect();
                ctx.cache.record(step, &fp, identity, filled).await?;
                stats.computed += 1;
            }
            Err(e) if e.is_fatal() => {
                bar.abandon();
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(target: "pipeline", "[{}] Row {} failed: {}", step, index, e);
                for column in outputs {
                    dataset.set(index, column.name, Value::Absent)?;
                }
                stats.failed += 1;
            }
        }
    }

    bar.finish_and_clear();
    Ok(stats)
}

/// Takes the step's dataset, runs `enrich_rows` over it and hands it back.
pub(crate) async fn run_row_step<S>(step: &mut S, ctx: &StepContext) -> Result<Dataset>
where
    S: Step + RowEnricher,
{
    let mut dataset = step
        .state_mut()
        .dataset
        .take()
        .ok_or_else(|| AppError::step(Step::name(step), "no dataset assigned"))?;
    let force = step.state().force_refresh;
    let result = enrich_rows(&*step, &mut dataset, ctx, force).await;
    let stats = match result {
        Ok(stats) => stats,
        Err(e) => {
            step.state_mut().dataset = Some(dataset);
            return Err(e);
        }
    };
    step.state_mut().stats = stats;
    step.state_mut().dataset = Some(dataset.clone());
    Ok(dataset)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::cache::LeadCache;
    use crate::storage::memory_backend;

    pub(crate) const SEED: &str = "Last Name,First Name,Company / Account,Phone,Email\n\
        Doe,John,Acme,4930183992170,john.doe@acme.example\n\
        Roe,Jane,Beta GmbH,+49 89 1234567,jane@gmail.com\n\
        Poe,Edgar,,invalid_phone,invalid_email\n";

    pub(crate) fn seed() -> Dataset {
        Dataset::from_csv_bytes(SEED.as_bytes()).unwrap()
    }

    pub(crate) fn context() -> StepContext {
        context_with(Config {
            sleep_between_requests: (0.0, 0.0),
            ..Config::default()
        })
    }

    pub(crate) fn context_with(config: Config) -> StepContext {
        let storage = memory_backend();
        let cache = Arc::new(LeadCache::new(Arc::clone(&storage)));
        StepContext::new(Arc::new(config), storage, cache).unwrap()
    }

    /// Runs a step through its lifecycle the way the pipeline does.
    pub(crate) async fn run_step<S: Step + ?Sized>(
        step: &mut S,
        dataset: Dataset,
        ctx: &StepContext,
    ) -> Dataset {
        step.set_dataset(dataset);
        step.load_data(ctx).await.unwrap();
        assert!(step.verify(&ctx.config), "verify failed for {}", step.name());
        let out = step.run(ctx).await.unwrap();
        step.finish();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::models::ColumnKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const OUT: &[ColumnSpec] = &[ColumnSpec::new("name_length", ColumnKind::Int)];

    #[derive(Default)]
    struct NameLength {
        state: StepState,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RowEnricher for NameLength {
        fn step_name(&self) -> &'static str {
            "name_length"
        }

        fn output_columns(&self) -> &'static [ColumnSpec] {
            OUT
        }

        fn applies_to(&self, row: RowView<'_>) -> bool {
            row.text("Company / Account").is_some()
        }

        async fn enrich_row(&self, row: RowView<'_>, _ctx: &StepContext) -> Result<RowValues> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let name = row.text("First Name").unwrap_or_default();
            if name == "Jane" {
                return Err(AppError::Parse("simulated".into()));
            }
            Ok(vec![("name_length", Value::from(name.len()))])
        }
    }

    #[async_trait]
    impl Step for NameLength {
        fn name(&self) -> &'static str {
            "name_length"
        }
        fn required_cols(&self) -> &'static [&'static str] {
            &["First Name"]
        }
        fn added_cols(&self) -> &'static [ColumnSpec] {
            OUT
        }
        fn state(&self) -> &StepState {
            &self.state
        }
        fn state_mut(&mut self) -> &mut StepState {
            &mut self.state
        }
        async fn run(&mut self, ctx: &StepContext) -> Result<Dataset> {
            run_row_step(self, ctx).await
        }
    }

    #[tokio::test]
    async fn test_rows_are_memoized_across_runs() {
        let ctx = context();
        let mut step = NameLength::default();
        let first = run_step(&mut step, seed(), &ctx).await;
        assert_eq!(first.len(), 3);
        assert_eq!(first.get(0, "name_length"), &Value::Int(4));
        assert_eq!(first.get(1, "name_length"), &Value::Absent);
        assert_eq!(first.get(2, "name_length"), &Value::Absent);
        assert_eq!(step.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            step.state.stats,
            StepStats { rows: 3, computed: 1, cache_hits: 0, not_applicable: 1, failed: 1 }
        );

        let mut again = NameLength::default();
        let second = run_step(&mut again, first.clone(), &ctx).await;
        assert_eq!(second, first);
        // Only the failed row is retried.
        assert_eq!(again.calls.load(Ordering::SeqCst), 1);
        assert_eq!(again.state.stats.cache_hits, 1);
    }

    #[tokio::test]
    async fn test_force_refresh_bypasses_cache() {
        let ctx = context();
        let mut step = NameLength::default();
        let first = run_step(&mut step, seed(), &ctx).await;

        let mut forced = NameLength::default();
        forced.set_force_refresh(true);
        run_step(&mut forced, first, &ctx).await;
        assert_eq!(forced.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dropped_columns_are_recomputed() {
        let ctx = context();
        let mut step = NameLength::default();
        run_step(&mut step, seed(), &ctx).await;

        let mut fresh = NameLength::default();
        run_step(&mut fresh, seed(), &ctx).await;
        assert_eq!(fresh.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_row_with_lost_cells_is_recomputed() {
        let ctx = context();
        let mut step = NameLength::default();
        let mut drifted = run_step(&mut step, seed(), &ctx).await;
        drifted.set(0, "name_length", Value::Absent).unwrap();

        let mut again = NameLength::default();
        let out = run_step(&mut again, drifted, &ctx).await;
        assert_eq!(out.get(0, "name_length"), &Value::Int(4));
        assert_eq!(again.state.stats.computed, 1);
        assert_eq!(again.state.stats.cache_hits, 0);
    }

    #[test]
    fn test_verify_and_presence() {
        let mut step = NameLength::default();
        assert!(!step.verify(&Config::default()));
        step.set_dataset(Dataset::with_columns(&["Email"]));
        assert!(!step.verify(&Config::default()));
        step.set_dataset(seed());
        assert!(step.verify(&Config::default()));
        assert!(!step.check_data_presence());

        let mut filled = seed();
        filled.declare_column("name_length", ColumnKind::Int).unwrap();
        for i in 0..filled.len() {
            filled.set(i, "name_length", Value::Int(1)).unwrap();
        }
        step.set_dataset(filled);
        assert!(step.check_data_presence());
    }
}

//! Runs an ordered list of steps over the lead dataset, snapshotting after
//! every step and committing the result once at the end.

use crate::cache::fingerprint;
use crate::dataset::Dataset;
use crate::error::{AppError, Result};
use crate::models::{ColumnKind, IDENTITY_COLUMNS};
use crate::step::{Step, StepContext, StepState};
use chrono::Utc;
use std::collections::HashMap;

/// Snapshot directory name of a run: `YYYY/MM/DD/HHMMSS`.
pub(crate) fn new_run_id() -> String {
    Utc::now().format("%Y/%m/%d/%H%M%S").to_string()
}

/// Rejects step lists that would re-type a column or overwrite identity.
pub(crate) fn validate_columns(steps: &[Box<dyn Step>]) -> Result<()> {
    let mut declared: HashMap<&str, (ColumnKind, &str)> = HashMap::new();
    for step in steps {
        for column in step.added_cols() {
            if IDENTITY_COLUMNS.contains(&column.name) {
                return Err(AppError::Config(format!(
                    "Step '{}' declares identity column '{}'",
                    step.name(),
                    column.name
                )));
            }
            if let Some((kind, owner)) = declared.get(column.name) {
                if *kind != column.kind {
                    return Err(AppError::Config(format!(
                        "Column '{}' is declared as {:?} by '{}' and as {:?} by '{}'",
                        column.name,
                        kind,
                        owner,
                        column.kind,
                        step.name()
                    )));
                }
            } else {
                declared.insert(column.name, (column.kind, step.name()));
            }
        }
    }
    Ok(())
}

/// Copies the enriched columns of `previous` into `seed` for rows whose
/// fingerprints match. Seed rows keep their identity and order.
pub(crate) fn hydrate(seed: &mut Dataset, previous: &Dataset) -> Result<usize> {
    let mut by_fingerprint: HashMap<String, usize> = HashMap::new();
    for index in 0..previous.len() {
        by_fingerprint
            .entry(fingerprint(&previous.identity(index)))
            .or_insert(index);
    }
    let extra: Vec<String> = previous
        .columns()
        .filter(|c| !seed.has_column(c))
        .map(str::to_string)
        .collect();
    for column in &extra {
        let kind = previous.kind(column).unwrap_or(ColumnKind::Text);
        seed.declare_column(column, kind)?;
    }

    let mut matched = 0;
    for row in 0..seed.len() {
        let Some(&source) = by_fingerprint.get(&fingerprint(&seed.identity(row))) else {
            continue;
        };
        for column in &extra {
            seed.set(row, column, previous.get(source, column).clone())?;
        }
        matched += 1;
    }
    Ok(matched)
}

/// Declares the columns of a step that did not produce output, so the
/// committed schema still carries them.
fn declare_added(dataset: &mut Dataset, step: &dyn Step) {
    for column in step.added_cols() {
        if let Err(e) = dataset.declare_column(column.name, column.kind) {
            tracing::warn!(target: "pipeline", "[{}] {}", step.name(), e);
        }
    }
}

/// An ordered run of steps over one dataset.
pub(crate) struct Pipeline {
    steps: Vec<Box<dyn Step>>,
    limit: Option<usize>,
    run_id: String,
    ctx: StepContext,
    errored: bool,
}

impl Pipeline {
    pub(crate) fn new(steps: Vec<Box<dyn Step>>, limit: Option<usize>, ctx: StepContext) -> Result<Self> {
        validate_columns(&steps)?;
        Ok(Self {
            steps,
            limit,
            run_id: new_run_id(),
            ctx,
            errored: false,
        })
    }

    pub(crate) fn run_id(&self) -> &str {
        &self.run_id
    }

    /// True if any step failed during the last run.
    pub(crate) fn errored(&self) -> bool {
        self.errored
    }

    async fn initial_dataset(&self) -> Result<Dataset> {
        let storage = &self.ctx.storage;
        let mut dataset = storage.load_dataset().await?;
        if let Some(limit) = self.limit {
            dataset.truncate(limit);
        }
        if let Some(previous) = storage.load_enriched().await? {
            let matched = hydrate(&mut dataset, &previous)?;
            tracing::info!(target: "pipeline",
                "Resumed {} of {} rows from {}", matched, dataset.len(), storage.output_key()
            );
        }
        dataset.normalize_missing();
        Ok(dataset)
    }

    /// Executes every step in order. Step failures mark the run errored and
    /// keep its snapshots; only configuration and storage errors are returned.
    pub(crate) async fn run(&mut self) -> Result<()> {
        let ctx = self.ctx.clone();
        let mut dataset = self.initial_dataset().await?;
        self.errored = false;
        tracing::info!(target: "pipeline",
            "Starting run {} with {} steps over {} rows", self.run_id, self.steps.len(), dataset.len()
        );

        for step in self.steps.iter_mut() {
            let force_refresh = step.force_refresh();
            *step.state_mut() = StepState {
                force_refresh,
                ..StepState::default()
            };
        }

        for step in self.steps.iter_mut() {
            let name = step.name();
            if !step.has_dataset() {
                step.set_dataset(dataset.clone());
            }

            match step.load_data(&ctx).await {
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::error!(target: "pipeline", "[{}] Failed to load data: {}", name, e);
                    self.errored = true;
                    declare_added(&mut dataset, &**step);
                }
                Ok(()) => {
                    let verified = step.verify(&ctx.config);
                    tracing::info!(target: "pipeline", "[{}] Verification {}", name, if verified { "passed" } else { "failed" });
                    if !verified {
                        let reason = AppError::StepPrecondition {
                            step: name.to_string(),
                            reason: "required columns or credentials missing".to_string(),
                        };
                        tracing::warn!(target: "pipeline", "{}, skipping", reason);
                    } else if step.check_data_presence() && !step.force_refresh() {
                        tracing::info!(target: "pipeline", "[{}] Data already present, skipping", name);
                    } else {
                        match step.run(&ctx).await {
                            Ok(output) if output.len() != dataset.len() => {
                                let e = AppError::StepExecution {
                                    step: name.to_string(),
                                    message: format!("returned {} rows, expected {}", output.len(), dataset.len()),
                                };
                                tracing::error!(target: "pipeline", "{}", e);
                                self.errored = true;
                            }
                            Ok(output) => {
                                dataset = output;
                                step.finish();
                            }
                            Err(e) if e.is_fatal() => return Err(e),
                            Err(e) => {
                                tracing::error!(target: "pipeline", "[{}] Step failed: {}", name, e);
                                self.errored = true;
                                declare_added(&mut dataset, &**step);
                            }
                        }
                    }
                }
            }

            ctx.storage.create_snapshot(&dataset, &self.run_id, name).await;
            dataset.normalize_missing();
        }

        ctx.storage.save_dataset(&dataset).await?;
        if self.errored {
            tracing::warn!(target: "pipeline", "Run {} had failing steps, keeping snapshots", self.run_id);
        } else {
            ctx.storage.clean_snapshots(&self.run_id).await?;
        }
        tracing::info!(target: "pipeline", "Finished run {}", self.run_id);
        Ok(())
    }
}

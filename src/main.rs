use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;

mod cache;
mod clients;
mod config;
mod dataset;
mod domain;
mod error;
mod logging;
mod models;
mod pipeline;
mod predict;
mod preprocess;
mod scraper;
mod step;
mod steps;
mod storage;

use config::AppArgs;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    args: AppArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the enrichment pipeline over the seed leads
    Enrich {
        /// Comma-separated step names; defaults to every step in order
        #[arg(long, value_delimiter = ',')]
        steps: Vec<String>,

        /// Only process the first N leads
        #[arg(long)]
        limit: Option<usize>,

        /// Comma-separated step names to recompute, or "all"
        #[arg(long, value_delimiter = ',')]
        force_refresh: Vec<String>,
    },
    /// Derive model features from the enriched leads
    Preprocess {
        #[arg(long, value_enum, default_value_t = preprocess::Mode::Train)]
        mode: preprocess::Mode,
    },
    /// Predict merchant sizes with a stored model
    Predict {
        /// Model file name under models/
        #[arg(long)]
        model: String,
    },
    /// List available steps with their required and added columns
    Steps,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Credentials may come from a .env file in the working directory.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    if let Commands::Steps = cli.command {
        for line in steps::describe_steps() {
            println!("{}", line);
        }
        return Ok(());
    }

    let config = config::build_config(&cli.args)?;
    let _log_guard = logging::init(&config)?;
    info!("Using {} database", config.database_type);

    let database = storage::database(&config)?;
    let result = match cli.command {
        Commands::Enrich {
            steps,
            limit,
            force_refresh,
        } => enrich(config, Arc::clone(&database), &steps, limit, &force_refresh).await,
        Commands::Preprocess { mode } => preprocess::Preprocessor::new(mode, &config)
            .run(database.as_ref())
            .await
            .map(|dataset| info!("Preprocessed {} leads", dataset.len())),
        Commands::Predict { model } => predict::run_prediction(database.as_ref(), &config, &model)
            .await
            .map(|predictions| info!("Predicted merchant size for {} leads", predictions.len())),
        Commands::Steps => Ok(()),
    };

    cache::teardown();
    storage::teardown();
    result?;
    Ok(())
}

async fn enrich(
    config: config::Config,
    database: Arc<dyn storage::StorageBackend>,
    step_names: &[String],
    limit: Option<usize>,
    force_refresh: &[String],
) -> error::Result<()> {
    let steps = steps::build_steps(step_names, force_refresh)?;
    info!("Running {} steps", steps.len());
    let cache = cache::lead_cache(&database);
    let ctx = step::StepContext::new(Arc::new(config), database, cache)?;
    let mut pipeline = pipeline::Pipeline::new(steps, limit, ctx)?;
    pipeline.run().await?;
    if pipeline.errored() {
        info!(
            "Run {} finished with failing steps; snapshots kept for inspection",
            pipeline.run_id()
        );
    }
    Ok(())
}

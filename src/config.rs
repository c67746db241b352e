//! Defines the configuration settings for the lead-enricher application.

use crate::error::{AppError, Result};
use anyhow::Context;
use clap::Args;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Options shared by every subcommand. Credentials are only ever taken from
/// the environment (or a `.env` file) and are never printed.
#[derive(Args, Debug, Clone, Default)]
pub(crate) struct AppArgs {
    /// Path to configuration file (TOML format)
    #[arg(long, global = true, env = "LEAD_ENRICHER_CONFIG")]
    pub config_file: Option<String>,

    /// Root directory of the local database
    #[arg(long, global = true, env = "LEAD_ENRICHER_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Storage backend: "S3" or "Local"
    #[arg(long, global = true, env = "DATABASE_TYPE")]
    pub database_type: Option<String>,

    /// Bucket holding the remote database
    #[arg(long, global = true, env = "LEADS_BUCKET")]
    pub bucket: Option<String>,

    /// Key of the seed leads file, relative to the database root
    #[arg(long, global = true, env = "LEAD_ENRICHER_INPUT_KEY")]
    pub input_key: Option<String>,

    /// Key of the enriched leads file, relative to the database root
    #[arg(long, global = true, env = "LEAD_ENRICHER_OUTPUT_KEY")]
    pub output_key: Option<String>,

    /// Directory for rotated log files
    #[arg(long, global = true, env = "LEAD_ENRICHER_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Default log level when RUST_LOG is not set
    #[arg(long, global = true, env = "LEAD_ENRICHER_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// HTTP request timeout for API calls in seconds
    #[arg(long, global = true, env = "LEAD_ENRICHER_REQUEST_TIMEOUT")]
    pub request_timeout: Option<u64>,

    /// HTTP request timeout for website scraping in seconds
    #[arg(long, global = true, env = "LEAD_ENRICHER_SCRAPE_TIMEOUT")]
    pub scrape_timeout: Option<u64>,

    /// Chat model used for LLM steps
    #[arg(long, global = true, env = "LEAD_ENRICHER_LLM_MODEL")]
    pub llm_model: Option<String>,

    #[arg(long, global = true, env = "GOOGLE_PLACES_API_KEY", hide_env_values = true)]
    pub google_places_api_key: Option<String>,

    #[arg(long, global = true, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    #[arg(long, global = true, env = "REGISTRY_API_KEY", hide_env_values = true)]
    pub registry_api_key: Option<String>,
}

/// Which storage backend serves the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DatabaseType {
    Local,
    S3,
}

impl FromStr for DatabaseType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(DatabaseType::Local),
            "s3" => Ok(DatabaseType::S3),
            other => Err(AppError::Config(format!(
                "Unknown DATABASE_TYPE '{}', expected 'S3' or 'Local'",
                other
            ))),
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseType::Local => write!(f, "Local"),
            DatabaseType::S3 => write!(f, "S3"),
        }
    }
}

/// TOML Configuration file structure
#[derive(Deserialize, Debug, Default)]
struct ConfigFile {
    storage: Option<StorageConfig>,
    network: Option<NetworkConfig>,
    llm: Option<LlmConfig>,
    pipeline: Option<PipelineConfig>,
    preprocess: Option<PreprocessConfig>,
    logging: Option<LoggingConfig>,
}

#[derive(Deserialize, Debug, Default)]
struct StorageConfig {
    database_type: Option<String>,
    data_dir: Option<PathBuf>,
    bucket: Option<String>,
    input_key: Option<String>,
    output_key: Option<String>,
    predictions_key: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct NetworkConfig {
    request_timeout: Option<u64>,
    scrape_timeout: Option<u64>,
    min_sleep: Option<f32>,
    max_sleep: Option<f32>,
    user_agent: Option<String>,
    places_base_url: Option<String>,
    registry_base_url: Option<String>,
    geocoder_base_url: Option<String>,
    grammar_base_url: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct LlmConfig {
    base_url: Option<String>,
    model: Option<String>,
    timeout: Option<u64>,
    max_batch_tokens: Option<usize>,
    max_attempts: Option<u32>,
    backoff_base_secs: Option<u64>,
}

#[derive(Deserialize, Debug, Default)]
struct PipelineConfig {
    nearby_radius_m: Option<u32>,
    regional_statistics_path: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Default)]
struct PreprocessConfig {
    drop_rows_without_place_id: Option<bool>,
}

#[derive(Deserialize, Debug, Default)]
struct LoggingConfig {
    log_dir: Option<PathBuf>,
    log_level: Option<String>,
}

/// Application configuration settings.
#[derive(Clone)]
pub(crate) struct Config {
    /// Backend serving the dataset, lookup tables and artifacts.
    pub database_type: DatabaseType,
    /// Root directory of the local backend.
    pub data_dir: PathBuf,
    /// Bucket of the remote backend.
    pub bucket: Option<String>,
    /// Seed leads file.
    pub input_key: String,
    /// Canonical enriched leads file.
    pub output_key: String,
    /// File receiving model predictions.
    pub predictions_key: String,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub google_places_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub registry_api_key: Option<String>,
    /// Timeout for third-party API calls.
    pub request_timeout: Duration,
    /// Timeout for fetching lead websites.
    pub scrape_timeout: Duration,
    /// Minimum and maximum sleep duration between rate-limited API calls (seconds).
    pub sleep_between_requests: (f32, f32),
    /// User agent string to use for HTTP requests.
    pub user_agent: String,
    pub places_base_url: String,
    pub registry_base_url: String,
    pub geocoder_base_url: String,
    pub grammar_base_url: String,
    pub llm_base_url: String,
    pub llm_model: String,
    pub llm_timeout: Duration,
    /// Upper bound of tokens per review batch sent to the LLM.
    pub llm_max_batch_tokens: usize,
    pub llm_max_attempts: u32,
    pub llm_backoff_base: Duration,
    /// Search radius of the nearby places step, in metres.
    pub nearby_radius_m: u32,
    /// GeoJSON file with administrative regions and their indicators.
    pub regional_statistics_path: PathBuf,
    /// Drop rows without a place id when building training data.
    pub drop_rows_without_place_id: bool,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |key: &Option<String>| if key.is_some() { "<set>" } else { "<unset>" };
        f.debug_struct("Config")
            .field("database_type", &self.database_type)
            .field("data_dir", &self.data_dir)
            .field("bucket", &self.bucket)
            .field("input_key", &self.input_key)
            .field("output_key", &self.output_key)
            .field("predictions_key", &self.predictions_key)
            .field("log_dir", &self.log_dir)
            .field("log_level", &self.log_level)
            .field("google_places_api_key", &redact(&self.google_places_api_key))
            .field("openai_api_key", &redact(&self.openai_api_key))
            .field("registry_api_key", &redact(&self.registry_api_key))
            .field("request_timeout", &self.request_timeout)
            .field("scrape_timeout", &self.scrape_timeout)
            .field("llm_model", &self.llm_model)
            .field("llm_timeout", &self.llm_timeout)
            .field("llm_max_batch_tokens", &self.llm_max_batch_tokens)
            .field("nearby_radius_m", &self.nearby_radius_m)
            .field("regional_statistics_path", &self.regional_statistics_path)
            .finish_non_exhaustive()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_type: DatabaseType::Local,
            data_dir: PathBuf::from("data"),
            bucket: None,
            input_key: "leads_raw.csv".to_string(),
            output_key: "leads_enriched.csv".to_string(),
            predictions_key: "leads_predicted_size.csv".to_string(),
            log_dir: PathBuf::from("logs"),
            log_level: "info".to_string(),
            google_places_api_key: None,
            openai_api_key: None,
            registry_api_key: None,
            request_timeout: Duration::from_secs(20),
            scrape_timeout: Duration::from_secs(5),
            sleep_between_requests: (0.0, 0.2),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/118.0.0.0 Safari/537.36".to_string(),
            places_base_url: "https://maps.googleapis.com/maps/api/place".to_string(),
            registry_base_url: "https://db.offeneregister.de/openregister".to_string(),
            geocoder_base_url: "https://nominatim.openstreetmap.org".to_string(),
            grammar_base_url: "https://api.languagetool.org/v2".to_string(),
            llm_base_url: "https://api.openai.com/v1".to_string(),
            llm_model: "gpt-4o-mini".to_string(),
            llm_timeout: Duration::from_secs(60),
            llm_max_batch_tokens: 4096,
            llm_max_attempts: 5,
            llm_backoff_base: Duration::from_secs(5),
            nearby_radius_m: 100,
            regional_statistics_path: PathBuf::from("data/regional_statistics.geojson"),
            drop_rows_without_place_id: false,
        }
    }
}

/// Load configuration from a TOML file
fn load_config_file(file_path: &str) -> anyhow::Result<ConfigFile> {
    let path = Path::new(file_path);
    if !path.exists() {
        tracing::warn!("Configuration file {} not found, using defaults", file_path);
        return Ok(ConfigFile::default());
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration file: {}", file_path))?;

    let config: ConfigFile = toml::from_str(&content)
        .with_context(|| format!("Failed to parse TOML configuration from {}", file_path))?;

    tracing::info!("Loaded configuration from {}", file_path);
    Ok(config)
}

fn apply_file_config(config: &mut Config, file_config: &ConfigFile) -> Result<()> {
    if let Some(storage) = &file_config.storage {
        if let Some(db) = &storage.database_type {
            config.database_type = db.parse()?;
        }
        if let Some(dir) = &storage.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(bucket) = &storage.bucket {
            config.bucket = Some(bucket.clone());
        }
        if let Some(key) = &storage.input_key {
            config.input_key = key.clone();
        }
        if let Some(key) = &storage.output_key {
            config.output_key = key.clone();
        }
        if let Some(key) = &storage.predictions_key {
            config.predictions_key = key.clone();
        }
    }

    if let Some(network) = &file_config.network {
        if let Some(timeout) = network.request_timeout {
            config.request_timeout = Duration::from_secs(timeout);
        }
        if let Some(timeout) = network.scrape_timeout {
            config.scrape_timeout = Duration::from_secs(timeout);
        }
        if let Some(min_sleep) = network.min_sleep {
            config.sleep_between_requests.0 = min_sleep;
        }
        if let Some(max_sleep) = network.max_sleep {
            config.sleep_between_requests.1 = max_sleep;
        }
        if let Some(user_agent) = &network.user_agent {
            config.user_agent = user_agent.clone();
        }
        if let Some(url) = &network.places_base_url {
            config.places_base_url = url.clone();
        }
        if let Some(url) = &network.registry_base_url {
            config.registry_base_url = url.clone();
        }
        if let Some(url) = &network.geocoder_base_url {
            config.geocoder_base_url = url.clone();
        }
        if let Some(url) = &network.grammar_base_url {
            config.grammar_base_url = url.clone();
        }
    }

    if let Some(llm) = &file_config.llm {
        if let Some(url) = &llm.base_url {
            config.llm_base_url = url.clone();
        }
        if let Some(model) = &llm.model {
            config.llm_model = model.clone();
        }
        if let Some(timeout) = llm.timeout {
            config.llm_timeout = Duration::from_secs(timeout);
        }
        if let Some(tokens) = llm.max_batch_tokens {
            config.llm_max_batch_tokens = tokens;
        }
        if let Some(attempts) = llm.max_attempts {
            config.llm_max_attempts = attempts;
        }
        if let Some(base) = llm.backoff_base_secs {
            config.llm_backoff_base = Duration::from_secs(base);
        }
    }

    if let Some(pipeline) = &file_config.pipeline {
        if let Some(radius) = pipeline.nearby_radius_m {
            config.nearby_radius_m = radius;
        }
        if let Some(path) = &pipeline.regional_statistics_path {
            config.regional_statistics_path = path.clone();
        }
    }

    if let Some(preprocess) = &file_config.preprocess {
        if let Some(drop) = preprocess.drop_rows_without_place_id {
            config.drop_rows_without_place_id = drop;
        }
    }

    if let Some(logging) = &file_config.logging {
        if let Some(dir) = &logging.log_dir {
            config.log_dir = dir.clone();
        }
        if let Some(level) = &logging.log_level {
            config.log_level = level.clone();
        }
    }

    Ok(())
}

/// Apply command line arguments (and their env fallbacks) to the Config instance
fn apply_cli_args(config: &mut Config, args: &AppArgs) -> Result<()> {
    if let Some(ref db) = args.database_type {
        config.database_type = db.parse()?;
    }
    if let Some(ref dir) = args.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(ref bucket) = args.bucket {
        config.bucket = Some(bucket.clone());
    }
    if let Some(ref key) = args.input_key {
        config.input_key = key.clone();
    }
    if let Some(ref key) = args.output_key {
        config.output_key = key.clone();
    }
    if let Some(ref dir) = args.log_dir {
        config.log_dir = dir.clone();
    }
    if let Some(ref level) = args.log_level {
        config.log_level = level.clone();
    }
    if let Some(timeout) = args.request_timeout {
        config.request_timeout = Duration::from_secs(timeout);
    }
    if let Some(timeout) = args.scrape_timeout {
        config.scrape_timeout = Duration::from_secs(timeout);
    }
    if let Some(ref model) = args.llm_model {
        config.llm_model = model.clone();
    }

    config.google_places_api_key = non_empty(&args.google_places_api_key);
    config.openai_api_key = non_empty(&args.openai_api_key);
    config.registry_api_key = non_empty(&args.registry_api_key);

    Ok(())
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn validate_config(config: &mut Config) -> Result<()> {
    if config.sleep_between_requests.0 > config.sleep_between_requests.1 {
        config.sleep_between_requests.1 = config.sleep_between_requests.0;
        tracing::warn!(
            "Min sleep was greater than max sleep. Setting both to {}",
            config.sleep_between_requests.0
        );
    }

    if config.llm_max_attempts == 0 {
        config.llm_max_attempts = 1;
        tracing::warn!("LLM max attempts was set to 0. Setting to 1.");
    }

    if config.llm_max_batch_tokens < 256 {
        config.llm_max_batch_tokens = 256;
        tracing::warn!("LLM batch token limit below 256. Setting to 256.");
    }

    if config.nearby_radius_m == 0 {
        config.nearby_radius_m = 100;
        tracing::warn!("Nearby radius was set to 0. Setting to 100 metres.");
    }

    if config.database_type == DatabaseType::S3 && config.bucket.is_none() {
        return Err(AppError::Config(
            "DATABASE_TYPE is S3 but no bucket is configured (LEADS_BUCKET)".to_string(),
        ));
    }

    if config.input_key == config.output_key {
        return Err(AppError::Config(format!(
            "Input and output keys must differ (both are '{}')",
            config.input_key
        )));
    }

    Ok(())
}

pub(crate) fn build_config(args: &AppArgs) -> Result<Config> {
    let mut config = Config::default();

    if let Some(ref file_path) = args.config_file {
        let file_config = load_config_file(file_path).map_err(|e| {
            AppError::Config(format!("Failed to load configuration file: {:#}", e))
        })?;
        apply_file_config(&mut config, &file_config)?;
    } else {
        for path in ["./lead-enricher.toml", "./config.toml"].iter() {
            if Path::new(path).exists() {
                match load_config_file(path) {
                    Ok(file_config) => {
                        apply_file_config(&mut config, &file_config)?;
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load configuration from {}: {}", path, e);
                    }
                }
            }
        }
    }

    apply_cli_args(&mut config, args)?;

    validate_config(&mut config)?;

    tracing::debug!("Final configuration: {:?}", config);

    Ok(config)
}

pub(crate) fn get_random_sleep_duration(config: &Config) -> Duration {
    use rand::Rng;
    let (min, max) = config.sleep_between_requests;
    if min >= max {
        return Duration::from_secs_f32(min.max(0.0));
    }
    let duration_secs = rand::thread_rng().gen_range(min..max);
    Duration::from_secs_f32(duration_secs.max(0.0))
}

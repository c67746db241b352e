//! Storage backends for the lead database: the enriched dataset, lookup
//! tables, per-place artifacts, snapshots, models and predictions.
//!
//! Both backends are key/blob stores. Backends implement the blob
//! primitives; every higher-level operation is provided on top of them so
//! that local and remote layouts stay identical.

mod local;
mod remote;

pub(crate) use local::LocalBackend;
pub(crate) use remote::{ObjectStoreBackend, split_object_url};

use crate::config::{Config, DatabaseType};
use crate::dataset::Dataset;
use crate::error::{AppError, Result};
use crate::models::{ArtifactKind, ColumnKind, GptResult, IDENTITY_COLUMNS, LeadIdentity, LookupEntry, Review, Value};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Fingerprint to identity snapshot, in insertion order.
pub(crate) type LookupTable = IndexMap<String, LookupEntry>;

pub(crate) const SNAPSHOTS_DIR: &str = "snapshots";
pub(crate) const LOOKUP_DIR: &str = "lookup_tables";
pub(crate) const MODELS_DIR: &str = "models";
pub(crate) const BACKUP_DIR: &str = "backup";
pub(crate) const PREPROCESSED_DIR: &str = "preprocessed_data_files";

const HASH_COLUMN: &str = "HashedData";
const LAST_UPDATE_COLUMN: &str = "last_update";
const LAST_UPDATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const FILLED_COLUMN: &str = "filled_columns";
const FILLED_SEPARATOR: char = '|';

/// Preprocessed feature files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PreprocessedKind {
    /// Output of the latest preprocessing run.
    Current,
    /// Training-time schema that inference inputs are aligned to.
    Historical,
}

impl PreprocessedKind {
    pub(crate) fn key(self) -> String {
        match self {
            PreprocessedKind::Current => format!("{}/preprocessed_data.csv", PREPROCESSED_DIR),
            PreprocessedKind::Historical => {
                format!("{}/historical_preprocessed_data.csv", PREPROCESSED_DIR)
            }
        }
    }
}

pub(crate) fn snapshot_prefix(run_id: &str) -> String {
    format!("{}/{}", SNAPSHOTS_DIR, run_id.trim_matches('/'))
}

pub(crate) fn snapshot_key(run_id: &str, step: &str) -> String {
    format!("{}/{}_snapshot.csv", snapshot_prefix(run_id), step)
}

pub(crate) fn lookup_key(step: &str) -> String {
    format!("{}/{}.csv", LOOKUP_DIR, step)
}

pub(crate) fn model_key(name: &str) -> String {
    format!("{}/{}", MODELS_DIR, name)
}

/// `backup/YYYY/MM/DD/HHMMSS_<md5>.csv` for the given content.
pub(crate) fn backup_key(now: DateTime<Utc>, content: &[u8]) -> String {
    use md5::{Digest, Md5};
    let digest = hex::encode(Md5::digest(content));
    format!("{}/{}_{}.csv", BACKUP_DIR, now.format("%Y/%m/%d/%H%M%S"), digest)
}

/// Uniform access to persistent artifacts.
#[async_trait]
pub(crate) trait StorageBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Key of the seed dataset.
    fn input_key(&self) -> &str;

    /// Key of the canonical enriched dataset.
    fn output_key(&self) -> &str;

    /// Key receiving predictions.
    fn predictions_key(&self) -> &str;

    /// Reads a blob; `None` when it does not exist.
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Writes a blob, replacing any previous content atomically.
    async fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Keys below `prefix`, sorted.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Removes everything below `prefix`. No-op when nothing exists.
    async fn delete_prefix(&self, prefix: &str) -> Result<()>;

    /// Called with the current canonical content before it is overwritten.
    async fn backup_before_overwrite(&self, _current: &[u8]) -> Result<()> {
        Ok(())
    }

    /// Loads the seed dataset.
    async fn load_dataset(&self) -> Result<Dataset> {
        let key = self.input_key().to_string();
        match self.get_bytes(&key).await? {
            Some(bytes) => Dataset::from_csv_bytes(&bytes),
            None => Err(AppError::InputMissing(format!(
                "Seed dataset '{}' not found in {} database",
                key,
                self.name()
            ))),
        }
    }

    /// Loads the canonical enriched dataset of a previous run, if any.
    async fn load_enriched(&self) -> Result<Option<Dataset>> {
        let key = self.output_key().to_string();
        match self.get_bytes(&key).await? {
            Some(bytes) => Ok(Some(Dataset::from_csv_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Replaces the canonical enriched dataset.
    async fn save_dataset(&self, dataset: &Dataset) -> Result<()> {
        let key = self.output_key().to_string();
        if let Some(current) = self.get_bytes(&key).await? {
            self.backup_before_overwrite(&current).await?;
        }
        let bytes = dataset.to_csv_bytes()?;
        self.put_bytes(&key, bytes).await?;
        tracing::info!(target: "storage", "Saved {} rows to {} ({})", dataset.len(), key, self.name());
        Ok(())
    }

    /// Writes a step snapshot. Failures are logged, never returned.
    async fn create_snapshot(&self, dataset: &Dataset, run_id: &str, step: &str) {
        let key = snapshot_key(run_id, step);
        let result = match dataset.to_csv_bytes() {
            Ok(bytes) => self.put_bytes(&key, bytes).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => tracing::debug!(target: "storage", "Snapshot written to {}", key),
            Err(e) => tracing::warn!(target: "storage", "Failed to write snapshot {}: {}", key, e),
        }
    }

    async fn list_snapshots(&self, run_id: &str) -> Result<Vec<String>> {
        self.list_prefix(&snapshot_prefix(run_id)).await
    }

    /// Removes all snapshots of a run.
    async fn clean_snapshots(&self, run_id: &str) -> Result<()> {
        let prefix = snapshot_prefix(run_id);
        self.delete_prefix(&prefix).await?;
        tracing::info!(target: "storage", "Removed snapshots under {}", prefix);
        Ok(())
    }

    async fn load_lookup(&self, step: &str) -> Result<LookupTable> {
        match self.get_bytes(&lookup_key(step)).await? {
            Some(bytes) => decode_lookup(&bytes),
            None => Ok(LookupTable::new()),
        }
    }

    async fn save_lookup(&self, step: &str, table: &LookupTable) -> Result<()> {
        let bytes = encode_lookup(table)?;
        self.put_bytes(&lookup_key(step), bytes).await
    }

    /// Persists a side artifact. Existing keys are kept unless `force_refresh`.
    async fn save_artifact(
        &self,
        kind: ArtifactKind,
        key: &str,
        json: &serde_json::Value,
        force_refresh: bool,
    ) -> Result<()> {
        let path = kind.relative_key(key);
        if !force_refresh && self.exists(&path).await? {
            tracing::debug!(target: "storage", "Artifact {} exists, not overwriting", path);
            return Ok(());
        }
        let bytes = serde_json::to_vec(json)?;
        self.put_bytes(&path, bytes).await
    }

    async fn fetch_artifact(&self, kind: ArtifactKind, key: &str) -> Result<Option<serde_json::Value>> {
        let path = kind.relative_key(key);
        match self.get_bytes(&path).await? {
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(json) => Ok(Some(json)),
                Err(e) => {
                    tracing::warn!(target: "storage", "Ignoring unreadable artifact {}: {}", path, e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Persists the reviews of a place and returns the artifact's relative key.
    async fn save_reviews(&self, place_id: &str, reviews: &[Review], force_refresh: bool) -> Result<String> {
        let json = serde_json::to_value(reviews)?;
        self.save_artifact(ArtifactKind::Reviews, place_id, &json, force_refresh)
            .await?;
        Ok(ArtifactKind::Reviews.relative_key(place_id))
    }

    /// Reviews persisted for a place. Unreadable artifacts count as missing.
    async fn fetch_reviews(&self, place_id: &str) -> Result<Option<Vec<Review>>> {
        let Some(json) = self.fetch_artifact(ArtifactKind::Reviews, place_id).await? else {
            return Ok(None);
        };
        match serde_json::from_value(json) {
            Ok(reviews) => Ok(Some(reviews)),
            Err(e) => {
                tracing::warn!(target: "storage", "Ignoring malformed reviews of {}: {}", place_id, e);
                Ok(None)
            }
        }
    }

    async fn fetch_gpt(&self, key: &str, operation: &str) -> Result<Option<GptResult>> {
        let Some(json) = self.fetch_artifact(ArtifactKind::Gpt, key).await? else {
            return Ok(None);
        };
        let entries: BTreeMap<String, GptResult> = match serde_json::from_value(json) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(target: "storage", "Ignoring malformed LLM cache for {}: {}", key, e);
                return Ok(None);
            }
        };
        Ok(entries.get(operation).cloned())
    }

    async fn save_gpt(
        &self,
        key: &str,
        operation: &str,
        result: serde_json::Value,
        force_refresh: bool,
    ) -> Result<()> {
        let mut entries: BTreeMap<String, GptResult> = self
            .fetch_artifact(ArtifactKind::Gpt, key)
            .await?
            .and_then(|json| serde_json::from_value(json).ok())
            .unwrap_or_default();
        if entries.contains_key(operation) && !force_refresh {
            return Ok(());
        }
        entries.insert(
            operation.to_string(),
            GptResult {
                result,
                last_update: Utc::now(),
            },
        );
        let json = serde_json::to_value(&entries)?;
        self.save_artifact(ArtifactKind::Gpt, key, &json, true).await
    }

    async fn load_model(&self, name: &str) -> Result<Vec<u8>> {
        let key = model_key(name);
        self.get_bytes(&key)
            .await?
            .ok_or_else(|| AppError::InputMissing(format!("Model artifact '{}' not found", key)))
    }

    async fn save_prediction(&self, table: &Dataset) -> Result<()> {
        let key = self.predictions_key().to_string();
        self.put_bytes(&key, table.to_csv_bytes()?).await?;
        tracing::info!(target: "storage", "Saved {} predictions to {}", table.len(), key);
        Ok(())
    }

    async fn load_preprocessed(&self, kind: PreprocessedKind) -> Result<Option<Dataset>> {
        match self.get_bytes(&kind.key()).await? {
            Some(bytes) => Ok(Some(Dataset::from_csv_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn save_preprocessed(&self, kind: PreprocessedKind, dataset: &Dataset) -> Result<()> {
        self.put_bytes(&kind.key(), dataset.to_csv_bytes()?).await
    }
}

fn lookup_columns() -> Vec<&'static str> {
    let mut columns = vec![HASH_COLUMN];
    columns.extend(IDENTITY_COLUMNS);
    columns.push(LAST_UPDATE_COLUMN);
    columns.push(FILLED_COLUMN);
    columns
}

pub(crate) fn encode_lookup(table: &LookupTable) -> Result<Vec<u8>> {
    let mut dataset = Dataset::with_columns(&lookup_columns());
    for (hash, entry) in table {
        let mut cells = vec![(HASH_COLUMN, Value::from(hash.as_str()))];
        for (column, value) in IDENTITY_COLUMNS.iter().zip(entry.identity.fields.iter()) {
            cells.push((*column, value.clone().coerce(ColumnKind::Text)));
        }
        cells.push((
            LAST_UPDATE_COLUMN,
            Value::from(entry.last_update.format(LAST_UPDATE_FORMAT).to_string()),
        ));
        let filled = entry.filled.join(&FILLED_SEPARATOR.to_string());
        cells.push((FILLED_COLUMN, Value::from(filled.as_str())));
        dataset.push_row(cells)?;
    }
    dataset.to_csv_bytes()
}

pub(crate) fn decode_lookup(bytes: &[u8]) -> Result<LookupTable> {
    let dataset = Dataset::from_csv_bytes(bytes)?;
    let mut table = LookupTable::new();
    for row in 0..dataset.len() {
        let Some(hash) = dataset.get(row, HASH_COLUMN).as_trimmed_str() else {
            continue;
        };
        let identity = LeadIdentity::new(IDENTITY_COLUMNS.map(|c| dataset.get(row, c).clone()));
        let last_update = dataset
            .get(row, LAST_UPDATE_COLUMN)
            .as_trimmed_str()
            .and_then(|s| NaiveDateTime::parse_from_str(s, LAST_UPDATE_FORMAT).ok())
            .map(|naive| naive.and_utc())
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let filled = dataset
            .get(row, FILLED_COLUMN)
            .as_trimmed_str()
            .map(|s| s.split(FILLED_SEPARATOR).map(str::to_string).collect())
            .unwrap_or_default();
        table.insert(
            hash.to_string(),
            LookupEntry {
                identity,
                last_update,
                filled,
            },
        );
    }
    Ok(table)
}

/// Builds the backend selected by the configuration.
pub(crate) fn create_backend(config: &Config) -> Result<Arc<dyn StorageBackend>> {
    let backend: Arc<dyn StorageBackend> = match config.database_type {
        DatabaseType::Local => Arc::new(LocalBackend::new(config)),
        DatabaseType::S3 => Arc::new(ObjectStoreBackend::from_config(config)?),
    };
    tracing::info!(target: "storage", "Using {} database", backend.name());
    Ok(backend)
}

static DATABASE: Lazy<Mutex<Option<Arc<dyn StorageBackend>>>> = Lazy::new(|| Mutex::new(None));

/// Process-wide backend, created on first use.
pub(crate) fn database(config: &Config) -> Result<Arc<dyn StorageBackend>> {
    let mut guard = DATABASE.lock();
    if let Some(existing) = guard.as_ref() {
        return Ok(Arc::clone(existing));
    }
    let backend = create_backend(config)?;
    *guard = Some(Arc::clone(&backend));
    Ok(backend)
}

/// Replaces the process-wide backend, e.g. with an in-memory store.
#[cfg(test)]
pub(crate) fn install(backend: Arc<dyn StorageBackend>) {
    *DATABASE.lock() = Some(backend);
}

/// Drops the process-wide backend.
pub(crate) fn teardown() {
    DATABASE.lock().take();
}

/// Remote backend over an in-memory object store.
#[cfg(test)]
pub(crate) fn memory_backend() -> Arc<dyn StorageBackend> {
    Arc::new(ObjectStoreBackend::in_memory())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_path_conventions() {
        assert_eq!(
            snapshot_key("2024/01/31/120000", "email_analyzer"),
            "snapshots/2024/01/31/120000/email_analyzer_snapshot.csv"
        );
        assert_eq!(lookup_key("places_search"), "lookup_tables/places_search.csv");
        assert_eq!(model_key("xgb_5_classes.json"), "models/xgb_5_classes.json");
    }

    #[test]
    fn test_backup_key_format() {
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        let key = backup_key(now, b"hello");
        assert_eq!(key, "backup/2024/03/05/070809_5d41402abc4b2a76b9719d911017c592.csv");
    }

    #[test]
    fn test_lookup_csv_shape() {
        let mut table = LookupTable::new();
        table.insert(
            "abc".to_string(),
            LookupEntry {
                identity: LeadIdentity::new([
                    Value::from("John"),
                    Value::from("Doe"),
                    Value::Absent,
                    Value::from("123"),
                    Value::from("j@x.example"),
                ]),
                last_update: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
                filled: vec!["domain".to_string(), "email_valid".to_string()],
            },
        );
        let bytes = encode_lookup(&table).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert_eq!(
            text.lines().next().unwrap(),
            "HashedData,First Name,Last Name,Company / Account,Phone,Email,last_update,filled_columns"
        );
        assert_eq!(text.lines().nth(1).unwrap(), "abc,John,Doe,,123,j@x.example,2024-01-02 03:04:05,domain|email_valid");
        assert_eq!(decode_lookup(&bytes).unwrap(), table);
    }

    #[tokio::test]
    async fn test_gpt_cache_nests_operations() {
        let storage = memory_backend();
        assert!(storage.fetch_gpt("place1", "summary").await.unwrap().is_none());
        storage
            .save_gpt("place1", "summary", serde_json::json!("first"), false)
            .await
            .unwrap();
        storage
            .save_gpt("place1", "sentiment", serde_json::json!(0.5), false)
            .await
            .unwrap();
        storage
            .save_gpt("place1", "summary", serde_json::json!("ignored"), false)
            .await
            .unwrap();

        let summary = storage.fetch_gpt("place1", "summary").await.unwrap().unwrap();
        assert_eq!(summary.result, serde_json::json!("first"));
        let sentiment = storage.fetch_gpt("place1", "sentiment").await.unwrap().unwrap();
        assert_eq!(sentiment.result, serde_json::json!(0.5));

        storage
            .save_gpt("place1", "summary", serde_json::json!("forced"), true)
            .await
            .unwrap();
        let summary = storage.fetch_gpt("place1", "summary").await.unwrap().unwrap();
        assert_eq!(summary.result, serde_json::json!("forced"));
    }

    #[tokio::test]
    async fn test_artifacts_are_idempotent_unless_forced() {
        let storage = memory_backend();
        let first = serde_json::json!([{"rating": 5}]);
        let second = serde_json::json!([]);
        storage.save_artifact(ArtifactKind::Reviews, "p", &first, false).await.unwrap();
        storage.save_artifact(ArtifactKind::Reviews, "p", &second, false).await.unwrap();
        assert_eq!(
            storage.fetch_artifact(ArtifactKind::Reviews, "p").await.unwrap(),
            Some(first)
        );
        storage.save_artifact(ArtifactKind::Reviews, "p", &second, true).await.unwrap();
        assert_eq!(
            storage.fetch_artifact(ArtifactKind::Reviews, "p").await.unwrap(),
            Some(second)
        );
        assert_eq!(storage.fetch_artifact(ArtifactKind::Nearby, "p").await.unwrap(), None);
    }

    #[test]
    fn test_singleton_install_and_teardown() {
        let backend = memory_backend();
        install(Arc::clone(&backend));
        let fetched = database(&Config::default()).unwrap();
        assert_eq!(fetched.name(), "S3");
        teardown();
        let recreated = database(&Config::default()).unwrap();
        assert_eq!(recreated.name(), "Local");
        teardown();
    }
}

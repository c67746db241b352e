//! Lead fingerprints and the per-step lookup tables that let steps skip
//! rows they already enriched.

use crate::dataset::RowView;
use crate::error::Result;
use crate::models::{LeadIdentity, LookupEntry};
use crate::storage::{LookupTable, StorageBackend};
use chrono::Utc;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Separates identity fields inside the hashed text so that shifting
/// characters between neighbouring fields changes the fingerprint.
const FIELD_SEPARATOR: char = '\u{1f}';

/// Hex SHA-256 over the canonical rendering of the five identity fields.
pub(crate) fn fingerprint(identity: &LeadIdentity) -> String {
    let mut joined = String::new();
    for (i, field) in identity.fields.iter().enumerate() {
        if i > 0 {
            joined.push(FIELD_SEPARATOR);
        }
        joined.push_str(&field.canonical());
    }
    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    hex::encode(hasher.finalize())
}

struct ResidentTable {
    step: String,
    table: LookupTable,
}

/// Memoization state for per-row step work. Exactly one step's lookup table
/// is resident at a time; asking about another step swaps it.
pub(crate) struct LeadCache {
    storage: Arc<dyn StorageBackend>,
    resident: Mutex<Option<ResidentTable>>,
}

impl LeadCache {
    pub(crate) fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            resident: Mutex::new(None),
        }
    }

    async fn ensure_resident(&self, step: &str) -> Result<()> {
        let loaded = self
            .resident
            .lock()
            .as_ref()
            .is_some_and(|r| r.step == step);
        if loaded {
            return Ok(());
        }

        let table = self.storage.load_lookup(step).await?;
        tracing::debug!(target: "lead_cache", "Loaded lookup table for '{}' ({} entries)", step, table.len());
        *self.resident.lock() = Some(ResidentTable {
            step: step.to_string(),
            table,
        });
        Ok(())
    }

    /// Whether `fingerprint` was recorded for `step`.
    #[cfg(test)]
    pub(crate) async fn contains(&self, step: &str, fingerprint: &str) -> Result<bool> {
        self.ensure_resident(step).await?;
        Ok(self
            .resident
            .lock()
            .as_ref()
            .is_some_and(|r| r.table.contains_key(fingerprint)))
    }

    /// Cache hit predicate: the fingerprint is recorded for the step and
    /// every cell the recorded computation filled still holds a value on
    /// `row`. Rows whose cells were lost since (a limited run overwriting the
    /// output, a dropped column) are recomputed.
    pub(crate) async fn is_hit(&self, step: &str, fingerprint: &str, row: RowView<'_>) -> Result<bool> {
        self.ensure_resident(step).await?;
        let guard = self.resident.lock();
        let Some(entry) = guard.as_ref().and_then(|r| r.table.get(fingerprint)) else {
            return Ok(false);
        };
        Ok(entry.filled.iter().all(|column| !row.get(column).is_absent()))
    }

    /// Records a computed row and persists the step's lookup table.
    pub(crate) async fn record(
        &self,
        step: &str,
        fingerprint: &str,
        identity: LeadIdentity,
        filled: Vec<String>,
    ) -> Result<()> {
        self.ensure_resident(step).await?;
        let snapshot = {
            let mut guard = self.resident.lock();
            let Some(resident) = guard.as_mut() else {
                return Ok(());
            };
            resident.table.insert(
                fingerprint.to_string(),
                LookupEntry {
                    identity,
                    last_update: Utc::now(),
                    filled,
                },
            );
            resident.table.clone()
        };
        self.storage.save_lookup(step, &snapshot).await
    }

    /// Name of the step whose table is resident, if any.
    #[cfg(test)]
    pub(crate) fn resident_step(&self) -> Option<String> {
        self.resident.lock().as_ref().map(|r| r.step.clone())
    }
}

static LEAD_CACHE: Lazy<Mutex<Option<Arc<LeadCache>>>> = Lazy::new(|| Mutex::new(None));

/// Process-wide cache, created on first use over `storage`.
pub(crate) fn lead_cache(storage: &Arc<dyn StorageBackend>) -> Arc<LeadCache> {
    let mut guard = LEAD_CACHE.lock();
    guard
        .get_or_insert_with(|| Arc::new(LeadCache::new(Arc::clone(storage))))
        .clone()
}

/// Drops the process-wide cache.
pub(crate) fn teardown() {
    LEAD_CACHE.lock().take();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Dataset;
    use crate::models::Value;
    use crate::storage::memory_backend;

    fn identity(fields: [&str; 5]) -> LeadIdentity {
        LeadIdentity::new(fields.map(Value::from_csv))
    }

    #[test]
    fn test_fingerprint_is_stable_hex() {
        let a = identity(["John", "Doe", "Acme", "4930183992170", "john.doe@acme.example"]);
        let b = identity(["John", "Doe", "Acme", "4930183992170", "john.doe@acme.example"]);
        let fp = fingerprint(&a);
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fp, fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_changes_with_any_field() {
        let base = ["John", "Doe", "Acme", "123", "j@acme.example"];
        let reference = fingerprint(&identity(base));
        for i in 0..5 {
            let mut changed = base;
            changed[i] = "other";
            assert_ne!(reference, fingerprint(&identity(changed)), "field {}", i);
        }
    }

    #[test]
    fn test_fingerprint_absent_differs_from_empty_neighbour_shift() {
        let with_absent = identity(["John", "", "Acme", "1", "e"]);
        let same_absent = identity(["John", "", "Acme", "1", "e"]);
        assert_eq!(fingerprint(&with_absent), fingerprint(&same_absent));

        let shifted_a = identity(["Jo", "hn", "Acme", "1", "e"]);
        let shifted_b = identity(["Joh", "n", "Acme", "1", "e"]);
        assert_ne!(fingerprint(&shifted_a), fingerprint(&shifted_b));
    }

    #[tokio::test]
    async fn test_record_and_hit_predicate() {
        let storage = memory_backend();
        let cache = LeadCache::new(storage.clone());
        let id = identity(["John", "Doe", "Acme", "1", "e"]);
        let fp = fingerprint(&id);

        let mut ds = Dataset::with_columns(&["domain", "email_valid"]);
        ds.push_row(vec![("domain", "acme.example".into()), ("email_valid", "True".into())]).unwrap();
        ds.push_row(vec![("email_valid", "True".into())]).unwrap();

        assert!(!cache.is_hit("email_analyzer", &fp, ds.row(0)).await.unwrap());
        cache
            .record("email_analyzer", &fp, id.clone(), vec!["domain".to_string()])
            .await
            .unwrap();
        assert!(cache.is_hit("email_analyzer", &fp, ds.row(0)).await.unwrap());
        // The recorded domain cell is gone from the second row.
        assert!(!cache.is_hit("email_analyzer", &fp, ds.row(1)).await.unwrap());
        assert!(!cache.is_hit("phone_normalizer", &fp, ds.row(0)).await.unwrap());
        assert_eq!(cache.resident_step().as_deref(), Some("phone_normalizer"));

        let persisted = storage.load_lookup("email_analyzer").await.unwrap();
        assert_eq!(persisted.get(&fp).map(|e| &e.identity), Some(&id));

        let fresh = LeadCache::new(storage);
        assert!(fresh.contains("email_analyzer", &fp).await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_result_stays_a_hit() {
        let cache = LeadCache::new(memory_backend());
        let id = identity(["Jane", "Roe", "", "", "jane@gmail.com"]);
        let fp = fingerprint(&id);
        let mut ds = Dataset::with_columns(&["domain"]);
        ds.push_row(vec![]).unwrap();

        cache.record("email_analyzer", &fp, id, Vec::new()).await.unwrap();
        assert!(cache.is_hit("email_analyzer", &fp, ds.row(0)).await.unwrap());
    }
}

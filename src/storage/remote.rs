//! Object-store backend (S3 in production, in-memory in tests).

use super::{StorageBackend, backup_key};
use crate::config::Config;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use object_store::ObjectStore;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use std::sync::Arc;

/// Splits `scheme://bucket/key` into `(bucket, key)`: once on `//`, then on
/// the first `/`. A bare bucket name yields an empty key.
pub(crate) fn split_object_url(url: &str) -> Result<(String, String)> {
    let rest = match url.split_once("//") {
        Some((_, rest)) => rest,
        None => url,
    };
    let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        return Err(AppError::Config(format!("No bucket in object store URL '{}'", url)));
    }
    Ok((bucket.to_string(), key.trim_matches('/').to_string()))
}

pub(crate) struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
    input_key: String,
    output_key: String,
    predictions_key: String,
}

impl ObjectStoreBackend {
    /// Builds an S3 client from the standard `AWS_*` environment variables.
    pub(crate) fn from_config(config: &Config) -> Result<Self> {
        let url = config
            .bucket
            .as_deref()
            .ok_or_else(|| AppError::Config("No bucket configured for S3 database".to_string()))?;
        let (bucket, prefix) = split_object_url(url)?;
        let store = AmazonS3Builder::from_env()
            .with_bucket_name(&bucket)
            .build()
            .map_err(|e| AppError::Config(format!("Cannot create S3 client: {}", e)))?;
        Ok(Self::with_store(Arc::new(store), bucket, prefix, config))
    }

    pub(crate) fn with_store(
        store: Arc<dyn ObjectStore>,
        bucket: String,
        prefix: String,
        config: &Config,
    ) -> Self {
        Self {
            store,
            bucket,
            prefix,
            input_key: config.input_key.clone(),
            output_key: config.output_key.clone(),
            predictions_key: config.predictions_key.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn in_memory() -> Self {
        Self::with_store(
            Arc::new(object_store::memory::InMemory::new()),
            "memory".to_string(),
            String::new(),
            &Config::default(),
        )
    }

    fn location(&self, key: &str) -> ObjectPath {
        if self.prefix.is_empty() {
            ObjectPath::from(key)
        } else {
            ObjectPath::from(format!("{}/{}", self.prefix, key))
        }
    }

    fn key_for(&self, location: &ObjectPath) -> String {
        let full = location.as_ref();
        if self.prefix.is_empty() {
            full.to_string()
        } else {
            full.strip_prefix(&format!("{}/", self.prefix))
                .unwrap_or(full)
                .to_string()
        }
    }

    fn transport_error(&self, action: &str, key: &str, e: object_store::Error) -> AppError {
        tracing::error!(target: "storage", "S3 {} of s3://{}/{} failed: {}", action, self.bucket, key, e);
        AppError::storage(format!("{} of {} failed: {}", action, key, e))
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    fn name(&self) -> &'static str {
        "S3"
    }

    fn input_key(&self) -> &str {
        &self.input_key
    }

    fn output_key(&self) -> &str {
        &self.output_key
    }

    fn predictions_key(&self) -> &str {
        &self.predictions_key
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.store.get(&self.location(key)).await {
            Ok(result) => {
                let bytes = result
                    .bytes()
                    .await
                    .map_err(|e| self.transport_error("read", key, e))?;
                Ok(Some(bytes.to_vec()))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(self.transport_error("read", key, e)),
        }
    }

    async fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.store
            .put(&self.location(key), bytes.into())
            .await
            .map_err(|e| self.transport_error("write", key, e))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self.store.head(&self.location(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(self.transport_error("head", key, e)),
        }
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let location = self.location(prefix.trim_end_matches('/'));
        let objects: Vec<_> = self
            .store
            .list(Some(&location))
            .try_collect()
            .await
            .map_err(|e| self.transport_error("list", prefix, e))?;
        let mut keys: Vec<String> = objects.iter().map(|o| self.key_for(&o.location)).collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        for key in self.list_prefix(prefix).await? {
            match self.store.delete(&self.location(&key)).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(self.transport_error("delete", &key, e)),
            }
        }
        Ok(())
    }

    /// Copies the current canonical dataset to a timestamped, content-hashed
    /// backup key. Backups are never removed here.
    async fn backup_before_overwrite(&self, current: &[u8]) -> Result<()> {
        let backup = backup_key(Utc::now(), current);
        self.store
            .copy(&self.location(&self.output_key), &self.location(&backup))
            .await
            .map_err(|e| self.transport_error("backup copy", &backup, e))?;
        tracing::info!(target: "storage", "Backed up {} to {}", self.output_key, backup);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Dataset;

    #[test]
    fn test_split_object_url() {
        assert_eq!(
            split_object_url("s3://leads-bucket/data/leads.csv").unwrap(),
            ("leads-bucket".to_string(), "data/leads.csv".to_string())
        );
        assert_eq!(
            split_object_url("s3://leads-bucket").unwrap(),
            ("leads-bucket".to_string(), String::new())
        );
        assert_eq!(
            split_object_url("leads-bucket/prefix/").unwrap(),
            ("leads-bucket".to_string(), "prefix".to_string())
        );
        assert!(split_object_url("s3:///key").is_err());
    }

    #[tokio::test]
    async fn test_save_dataset_backs_up_previous_version() {
        let db = ObjectStoreBackend::in_memory();
        let mut ds = Dataset::with_columns(&["Email"]);
        ds.push_row(vec![("Email", "a@b.example".into())]).unwrap();
        db.save_dataset(&ds).await.unwrap();
        assert!(db.list_prefix("backup").await.unwrap().is_empty());

        let first_version = db.get_bytes("leads_enriched.csv").await.unwrap().unwrap();
        ds.push_row(vec![("Email", "c@d.example".into())]).unwrap();
        db.save_dataset(&ds).await.unwrap();

        let backups = db.list_prefix("backup").await.unwrap();
        assert_eq!(backups.len(), 1);
        use md5::{Digest, Md5};
        let digest = hex::encode(Md5::digest(&first_version));
        assert!(backups[0].starts_with("backup/"));
        assert!(backups[0].ends_with(&format!("_{}.csv", digest)));
        assert_eq!(db.get_bytes(&backups[0]).await.unwrap().unwrap(), first_version);
        assert_eq!(db.load_enriched().await.unwrap().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_prefix_is_applied_and_stripped() {
        let store: Arc<dyn ObjectStore> = Arc::new(object_store::memory::InMemory::new());
        let db = ObjectStoreBackend::with_store(
            Arc::clone(&store),
            "bucket".to_string(),
            "team/leads".to_string(),
            &Config::default(),
        );
        db.put_bytes("snapshots/r/a_snapshot.csv", b"x".to_vec()).await.unwrap();
        assert!(store
            .head(&ObjectPath::from("team/leads/snapshots/r/a_snapshot.csv"))
            .await
            .is_ok());
        assert_eq!(
            db.list_prefix("snapshots/r").await.unwrap(),
            vec!["snapshots/r/a_snapshot.csv".to_string()]
        );
        db.delete_prefix("snapshots/r").await.unwrap();
        assert!(db.list_prefix("snapshots/r").await.unwrap().is_empty());
        assert!(!db.exists("snapshots/r/a_snapshot.csv").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_objects_are_absent() {
        let db = ObjectStoreBackend::in_memory();
        assert!(db.get_bytes("nope").await.unwrap().is_none());
        assert!(matches!(db.load_dataset().await, Err(AppError::InputMissing(_))));
        assert!(matches!(db.load_model("m.json").await, Err(AppError::InputMissing(_))));
    }
}

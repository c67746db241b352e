//! Filesystem backend rooted at the configured data directory.

use super::StorageBackend;
use crate::config::Config;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

pub(crate) struct LocalBackend {
    root: PathBuf,
    input_key: String,
    output_key: String,
    predictions_key: String,
}

impl LocalBackend {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            root: config.data_dir.clone(),
            input_key: config.input_key.clone(),
            output_key: config.output_key.clone(),
            predictions_key: config.predictions_key.clone(),
        }
    }

    fn path(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key.split('/').filter(|s| !s.is_empty() && *s != "..") {
            path.push(segment);
        }
        path
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let segments: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(segments.join("/"))
    }
}

fn write_error(path: &Path, e: std::io::Error) -> AppError {
    tracing::error!(target: "storage", "Local write to {} failed: {}", path.display(), e);
    AppError::storage(format!("write to {} failed: {}", path.display(), e))
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "Local"
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
        let path = self.path(key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Io(e)),
        }
    }

    async fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| write_error(parent, e))?;
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!(".{}.tmp-{}", file_name, std::process::id()));
        fs::write(&tmp, &bytes).await.map_err(|e| write_error(&tmp, e))?;
        fs::rename(&tmp, &path).await.map_err(|e| write_error(&path, e))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(fs::try_exists(self.path(key)).await?)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.path(prefix)];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(AppError::Io(e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Some(key) = self.key_for(&path) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let path = self.path(prefix);
        match fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotADirectory => match fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) => Err(write_error(&path, e)),
            },
            Err(e) => Err(write_error(&path, e)),
        }
    }
}

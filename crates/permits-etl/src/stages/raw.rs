//! Raw zone: immutable source snapshots in object storage

use permits_common::{checksum, PipelineError, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

use crate::retry::with_timeout;
use crate::stores::{ObjectRef, ObjectStore};

/// Snapshot uploads keyed by dataset identity. Re-uploading a key replaces
/// the previous snapshot wholesale; nothing here edits content.
#[derive(Clone)]
pub struct RawStore {
    objects: Arc<dyn ObjectStore>,
    prefix: String,
    call_timeout: Duration,
}

impl RawStore {
    pub fn new(objects: Arc<dyn ObjectStore>, prefix: impl Into<String>, call_timeout: Duration) -> Self {
        Self {
            objects,
            prefix: prefix.into(),
            call_timeout,
        }
    }

    pub fn object_key(&self, dataset_key: &str) -> String {
        format!("{}/{}.json", self.prefix.trim_end_matches('/'), dataset_key)
    }

    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub async fn put(&self, dataset_key: &str, bytes: Vec<u8>) -> Result<ObjectRef> {
        if bytes.is_empty() {
            return Err(PipelineError::validation(format!(
                "refusing to store an empty snapshot for '{}'",
                dataset_key
            )));
        }

        let key = self.object_key(dataset_key);
        let object = with_timeout("object storage", self.call_timeout, self.objects.put(&key, bytes)).await?;
        info!(key = %object.key, checksum = %object.checksum, size = object.size, "Raw snapshot stored");
        Ok(object)
    }

    pub async fn get(&self, object: &ObjectRef) -> Result<Vec<u8>> {
        self.get_key(&object.key).await
    }

    pub async fn get_key(&self, key: &str) -> Result<Vec<u8>> {
        with_timeout("object storage", self.call_timeout, self.objects.get(key)).await
    }

    pub async fn exists(&self, dataset_key: &str) -> Result<bool> {
        let key = self.object_key(dataset_key);
        with_timeout("object storage", self.call_timeout, self.objects.exists(&key)).await
    }

    /// Upload a local file as the dataset's snapshot and confirm it landed
    #[instrument(skip(self), fields(path = %path.as_ref().display()))]
    pub async fn upload_file(&self, dataset_key: &str, path: impl AsRef<Path>) -> Result<ObjectRef> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            PipelineError::not_found(format!("raw source file {}: {}", path.display(), e))
        })?;
        let expected = checksum::sha256_hex(&bytes);

        let object = self.put(dataset_key, bytes).await?;
        if object.checksum != expected || !self.exists(dataset_key).await? {
            return Err(PipelineError::consistency(format!(
                "raw snapshot {} not readable after upload",
                object.key
            )));
        }

        Ok(object)
    }

    /// Objects currently held in the raw zone
    pub async fn count(&self) -> Result<u64> {
        with_timeout("object storage", self.call_timeout, self.objects.count(&self.prefix)).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::stores::MemoryObjectStore;
    use std::io::Write;

    fn raw_store() -> RawStore {
        RawStore::new(
            Arc::new(MemoryObjectStore::new("ottawa-raw")),
            "raw",
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_put_is_idempotent_per_dataset() {
        let raw = raw_store();
        let first = raw.put("ottawa-permits", b"[]".to_vec()).await.unwrap();
        let second = raw.put("ottawa-permits", b"[]".to_vec()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(raw.count().await.unwrap(), 1);
        assert_eq!(raw.get(&first).await.unwrap(), b"[]");
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_not_found() {
        let raw = raw_store();
        let err = raw.get_key("raw/nothing.json").await.unwrap_err();
        assert_eq!(err.kind(), permits_common::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_upload_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"[{"PERMIT":"1"}]"#).unwrap();

        let raw = raw_store();
        let object = raw.upload_file("ottawa-permits", file.path()).await.unwrap();
        assert_eq!(object.key, "raw/ottawa-permits.json");
        assert!(raw.exists("ottawa-permits").await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_snapshot_rejected() {
        let raw = raw_store();
        let err = raw.put("ottawa-permits", Vec::new()).await.unwrap_err();
        assert_eq!(err.kind(), permits_common::ErrorKind::Validation);
    }
}

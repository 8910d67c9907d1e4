/*!
Local filesystem object store implementation.
*/

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use super::{BackupObject, BucketProbe, ObjectStore};
use crate::{BackupError, Result};

/// Local filesystem object store
///
/// The bucket is a directory under a base path and every object is a plain
/// file in it. An object's last-modified time is the file's mtime. Uploads are
/// written next to their destination and renamed into place, so a listing
/// never sees a half-written object.
///
/// # Example
/// ```rust,no_run
/// use worldvault_core::storage::{LocalObjectStore, ObjectStore};
///
/// let store = LocalObjectStore::new("/var/backups", "minecraft");
/// // objects end up in /var/backups/minecraft/
/// assert_eq!(store.bucket(), "minecraft");
/// ```
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    bucket: String,
    bucket_dir: PathBuf,
}

impl LocalObjectStore {
    /// Create a store keeping the bucket `bucket` under `base_dir`
    pub fn new<P: AsRef<Path>, B: Into<String>>(base_dir: P, bucket: B) -> Self {
        let bucket = bucket.into();
        let bucket_dir = base_dir.as_ref().join(&bucket);
        Self { bucket, bucket_dir }
    }

    /// Directory holding the bucket's objects
    pub fn bucket_dir(&self) -> &Path {
        &self.bucket_dir
    }

    /// Resolve the file path for a key, refusing keys that would escape the bucket
    fn resolve_key(&self, key: &str) -> std::result::Result<PathBuf, String> {
        if key.is_empty()
            || key.starts_with('.')
            || key.contains('/')
            || key.contains('\\')
        {
            return Err(format!("unsupported key '{key}' for local storage"));
        }
        Ok(self.bucket_dir.join(key))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn probe_bucket(&self) -> BucketProbe {
        match fs::metadata(&self.bucket_dir).await {
            Ok(meta) if meta.is_dir() => BucketProbe::Present,
            Ok(_) => BucketProbe::Failed(format!(
                "{} exists but is not a directory",
                self.bucket_dir.display()
            )),
            Err(e) if e.kind() == ErrorKind::NotFound => BucketProbe::Absent,
            Err(e) => BucketProbe::Failed(e.to_string()),
        }
    }

    async fn create_bucket(&self) -> Result<()> {
        fs::create_dir_all(&self.bucket_dir).await.map_err(|e| {
            BackupError::bucket(
                &self.bucket,
                format!("Failed to create directory {}: {e}", self.bucket_dir.display()),
            )
        })
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<BackupObject>> {
        let list_err = |e: std::io::Error| {
            BackupError::list(
                prefix,
                format!("Failed to read {}: {e}", self.bucket_dir.display()),
            )
        };

        let mut entries = fs::read_dir(&self.bucket_dir).await.map_err(list_err)?;
        let mut objects = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(list_err)? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !name.starts_with(prefix) {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                // Removed between read_dir and stat.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(list_err(e)),
            };
            if !meta.is_file() {
                continue;
            }
            let last_modified: DateTime<Utc> = meta.modified().map_err(list_err)?.into();
            objects.push(BackupObject::new(name, meta.len(), last_modified));
        }

        debug!(
            dir = %self.bucket_dir.display(),
            prefix = %prefix,
            count = objects.len(),
            "Listed local objects"
        );
        Ok(objects)
    }

    async fn put_object(&self, key: &str, path: &Path) -> Result<()> {
        let target = self
            .resolve_key(key)
            .map_err(|e| BackupError::upload(key, e))?;
        let partial = self.bucket_dir.join(format!(".{key}.partial"));

        let copy = async {
            fs::copy(path, &partial).await?;
            fs::rename(&partial, &target).await
        };
        if let Err(e) = copy.await {
            let _ = fs::remove_file(&partial).await;
            return Err(BackupError::upload(
                key,
                format!("Failed to copy {} into {}: {e}", path.display(), target.display()),
            ));
        }
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let target = self
            .resolve_key(key)
            .map_err(|e| BackupError::delete(key, e))?;
        match fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackupError::delete(
                key,
                format!("Failed to remove {}: {e}", target.display()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ensure_bucket;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_store_basic_operations() {
        let base = TempDir::new().unwrap();
        let store = LocalObjectStore::new(base.path(), "backups");
        ensure_bucket(&store).await.unwrap();

        let source = base.path().join("archive.tar.gz");
        std::fs::write(&source, b"test archive data").unwrap();

        store
            .put_object("world_2024-01-01_00-00-00.tar.gz", &source)
            .await
            .unwrap();
        std::fs::write(store.bucket_dir().join("notes.txt"), b"ignored").unwrap();

        let listed = store.list_objects("world_").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "world_2024-01-01_00-00-00.tar.gz");
        assert_eq!(listed[0].size_bytes, 17);

        store
            .delete_object("world_2024-01-01_00-00-00.tar.gz")
            .await
            .unwrap();
        store
            .delete_object("world_2024-01-01_00-00-00.tar.gz")
            .await
            .unwrap();
        assert!(store.list_objects("world_").await.unwrap().is_empty());
        // The source file belongs to the caller.
        assert!(source.exists());
    }

    #[tokio::test]
    async fn test_probe_and_idempotent_creation() {
        let base = TempDir::new().unwrap();
        let store = LocalObjectStore::new(base.path(), "backups");
        assert_eq!(store.probe_bucket().await, BucketProbe::Absent);

        ensure_bucket(&store).await.unwrap();
        ensure_bucket(&store).await.unwrap();
        store.create_bucket().await.unwrap();
        assert_eq!(store.probe_bucket().await, BucketProbe::Present);
    }

    #[tokio::test]
    async fn test_list_missing_bucket_is_error() {
        let base = TempDir::new().unwrap();
        let store = LocalObjectStore::new(base.path(), "backups");
        let result = store.list_objects("world_").await;
        assert!(matches!(result, Err(BackupError::List { .. })));
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let base = TempDir::new().unwrap();
        let store = LocalObjectStore::new(base.path(), "backups");
        store.create_bucket().await.unwrap();
        let source = base.path().join("a");
        std::fs::write(&source, b"x").unwrap();

        for key in ["../evil", "nested/key", ".hidden", ""] {
            assert!(matches!(
                store.put_object(key, &source).await,
                Err(BackupError::Upload { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_failed_upload_leaves_no_object() {
        let base = TempDir::new().unwrap();
        let store = LocalObjectStore::new(base.path(), "backups");
        store.create_bucket().await.unwrap();

        let result = store
            .put_object("world_x.tar.gz", &base.path().join("missing"))
            .await;
        assert!(matches!(result, Err(BackupError::Upload { .. })));
        assert!(store.list_objects("").await.unwrap().is_empty());
    }
}

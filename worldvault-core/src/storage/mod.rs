/*!
Object store adapters for backup persistence.

This module defines the storage abstraction (port) the backup cycle talks to,
and concrete implementations (adapters): S3-compatible stores, a local
directory, and an in-memory store used in tests. The cycle itself never knows
which one it is talking to.
*/

pub mod local;
pub mod memory;
#[cfg(feature = "s3")]
pub mod s3;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

use crate::Result;

/// One archive stored in the object store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupObject {
    pub key: String,
    pub size_bytes: u64,
    pub last_modified: DateTime<Utc>,
}

impl BackupObject {
    pub fn new<K: Into<String>>(key: K, size_bytes: u64, last_modified: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            size_bytes,
            last_modified,
        }
    }
}

/// Outcome of a bucket existence check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketProbe {
    /// The store confirmed the bucket exists
    Present,
    /// The store confirmed the bucket does not exist
    Absent,
    /// The probe failed and says nothing reliable (auth, network, ...)
    Failed(String),
}

/// Object store abstraction for backup archives
///
/// Every method is awaited to completion by the caller before the next one is
/// issued; implementations need not guard against concurrent cycles.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Name of the bucket this store writes to
    fn bucket(&self) -> &str;

    /// Check whether the bucket exists
    async fn probe_bucket(&self) -> BucketProbe;

    /// Create the bucket
    ///
    /// Creating a bucket that already exists is not an error.
    async fn create_bucket(&self) -> Result<()>;

    /// List every object whose key starts with `prefix`
    ///
    /// An empty listing is a valid answer, distinct from an error.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<BackupObject>>;

    /// Upload the file at `path` under `key`, replacing any object with that key
    async fn put_object(&self, key: &str, path: &Path) -> Result<()>;

    /// Delete the object at `key`
    ///
    /// Deleting a key that does not exist is not an error.
    async fn delete_object(&self, key: &str) -> Result<()>;
}

/// Make sure the store's bucket exists, creating it when needed.
///
/// A failed probe is treated like an absent bucket: creation is attempted, and
/// an "already exists" answer from the store counts as success.
pub async fn ensure_bucket(store: &dyn ObjectStore) -> Result<()> {
    match store.probe_bucket().await {
        BucketProbe::Present => {
            return Ok(());
        }
        BucketProbe::Absent => {
            info!(bucket = %store.bucket(), "Bucket does not exist, creating it");
        }
        BucketProbe::Failed(reason) => {
            warn!(
                bucket = %store.bucket(),
                reason = %reason,
                "Bucket probe failed, attempting to create it anyway"
            );
        }
    }
    store.create_bucket().await
}

// Re-export types for convenience
pub use local::LocalObjectStore;
pub use memory::{MemoryObjectStore, StoreOperation};
#[cfg(feature = "s3")]
pub use s3::S3ObjectStore;

/*!
In-memory object store.

Keeps objects in a map behind a mutex. Useful for exercising the backup cycle
without a network or a filesystem-backed bucket, including injected failures.
*/

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::{BackupObject, BucketProbe, ObjectStore};
use crate::{BackupError, Result};

/// Operations that can be made to fail on a [`MemoryObjectStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    Probe,
    CreateBucket,
    List,
    Put,
    Delete,
}

#[derive(Debug, Clone)]
struct StoredObject {
    size_bytes: u64,
    last_modified: DateTime<Utc>,
    body: Option<Bytes>,
}

#[derive(Debug, Default)]
struct State {
    bucket_exists: bool,
    buckets_created: usize,
    objects: BTreeMap<String, StoredObject>,
    failing: HashSet<StoreOperation>,
    // Deletes allowed before `Delete` failures kick in
    deletes_before_failure: Option<usize>,
}

/// Memory-based object store
///
/// Objects uploaded with `put_object` keep their bytes; objects seeded with
/// [`MemoryObjectStore::insert`] only carry a size and a timestamp, so very
/// large backups can be simulated cheaply.
#[derive(Debug)]
pub struct MemoryObjectStore {
    bucket: String,
    state: Mutex<State>,
}

impl MemoryObjectStore {
    /// A store whose bucket already exists
    pub fn new<B: Into<String>>(bucket: B) -> Self {
        let store = Self::without_bucket(bucket);
        store.state().bucket_exists = true;
        store
    }

    /// A store whose bucket has not been created yet
    pub fn without_bucket<B: Into<String>>(bucket: B) -> Self {
        Self {
            bucket: bucket.into(),
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means another test thread panicked mid-update.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed an object without a body
    pub fn insert<K: Into<String>>(&self, key: K, size_bytes: u64, last_modified: DateTime<Utc>) {
        self.state().objects.insert(
            key.into(),
            StoredObject {
                size_bytes,
                last_modified,
                body: None,
            },
        );
    }

    /// Make every call of `operation` fail until [`MemoryObjectStore::heal`] is called
    pub fn fail(&self, operation: StoreOperation) {
        self.state().failing.insert(operation);
    }

    /// Let `allowed` deletes succeed, then fail every following delete
    pub fn fail_deletes_after(&self, allowed: usize) {
        self.state().deletes_before_failure = Some(allowed);
    }

    /// Clear all injected failures
    pub fn heal(&self) {
        let mut state = self.state();
        state.failing.clear();
        state.deletes_before_failure = None;
    }

    /// Number of times the bucket was actually created
    pub fn buckets_created(&self) -> usize {
        self.state().buckets_created
    }

    /// Keys currently stored, in ascending order
    pub fn keys(&self) -> Vec<String> {
        self.state().objects.keys().cloned().collect()
    }

    /// Body of an uploaded object
    pub fn body(&self, key: &str) -> Option<Bytes> {
        self.state().objects.get(key).and_then(|o| o.body.clone())
    }

    fn check(&self, state: &State, operation: StoreOperation) -> std::result::Result<(), String> {
        if state.failing.contains(&operation) {
            return Err(format!("injected {operation:?} failure"));
        }
        if !state.bucket_exists && operation != StoreOperation::CreateBucket {
            return Err(format!("NoSuchBucket: {}", self.bucket));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn probe_bucket(&self) -> BucketProbe {
        let state = self.state();
        if state.failing.contains(&StoreOperation::Probe) {
            return BucketProbe::Failed("injected Probe failure".to_string());
        }
        if state.bucket_exists {
            BucketProbe::Present
        } else {
            BucketProbe::Absent
        }
    }

    async fn create_bucket(&self) -> Result<()> {
        let mut state = self.state();
        self.check(&state, StoreOperation::CreateBucket)
            .map_err(|e| BackupError::bucket(&self.bucket, e))?;
        if !state.bucket_exists {
            state.bucket_exists = true;
            state.buckets_created += 1;
        }
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<BackupObject>> {
        let state = self.state();
        self.check(&state, StoreOperation::List)
            .map_err(|e| BackupError::list(prefix, e))?;
        Ok(state
            .objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, o)| BackupObject::new(key.clone(), o.size_bytes, o.last_modified))
            .collect())
    }

    async fn put_object(&self, key: &str, path: &Path) -> Result<()> {
        {
            let state = self.state();
            self.check(&state, StoreOperation::Put)
                .map_err(|e| BackupError::upload(key, e))?;
        }
        let body = tokio::fs::read(path)
            .await
            .map_err(|e| BackupError::upload(key, format!("Failed to read {}: {e}", path.display())))?;

        self.state().objects.insert(
            key.to_string(),
            StoredObject {
                size_bytes: body.len() as u64,
                last_modified: Utc::now(),
                body: Some(Bytes::from(body)),
            },
        );
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let mut state = self.state();
        self.check(&state, StoreOperation::Delete)
            .map_err(|e| BackupError::delete(key, e))?;
        if let Some(left) = state.deletes_before_failure.as_mut() {
            if *left == 0 {
                return Err(BackupError::delete(key, "injected Delete failure"));
            }
            *left -= 1;
        }
        state.objects.remove(key);
        Ok(())
    }
}

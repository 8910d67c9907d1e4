/*!
Retention enforcement over the stored backup set.

The policy bounds both the number of backups and their combined size. When
either bound is exceeded the oldest backups are deleted, one at a time, until
both hold again or nothing is left. There is no floor: a policy with
`max_count = 0`, or a single backup larger than the size budget, drains the
set completely.
*/

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::{error, info};

use crate::config::{DEFAULT_MAX_BACKUPS, DEFAULT_MAX_TOTAL_SIZE_GB};
use crate::storage::{BackupObject, ObjectStore};
use crate::{BackupError, Result};

/// Bytes in one gigabyte as the size budget counts them (1024³)
pub const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

/// Thresholds bounding the backup set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub max_count: u32,
    pub max_total_size_bytes: u64,
}

impl RetentionPolicy {
    pub fn new(max_count: u32, max_total_size_bytes: u64) -> Self {
        Self {
            max_count,
            max_total_size_bytes,
        }
    }

    /// Build a policy from a size budget expressed in (possibly fractional) gigabytes
    pub fn from_gigabytes(max_count: u32, max_total_size_gb: f64) -> Result<Self> {
        if !max_total_size_gb.is_finite() || max_total_size_gb < 0.0 {
            return Err(BackupError::configuration(format!(
                "max total size must be a non-negative number of GB, got {max_total_size_gb}"
            )));
        }
        let bytes = (max_total_size_gb * BYTES_PER_GB as f64) as u64;
        Ok(Self::new(max_count, bytes))
    }

    /// True when both thresholds hold for `objects`
    pub fn is_satisfied_by(&self, objects: &[BackupObject]) -> bool {
        objects.len() <= self.max_count as usize && total_size(objects) <= self.max_total_size_bytes
    }

    /// True when the policy can only ever be satisfied by an empty set
    pub fn drains_everything(&self) -> bool {
        self.max_count == 0 || self.max_total_size_bytes == 0
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_BACKUPS,
            (DEFAULT_MAX_TOTAL_SIZE_GB * BYTES_PER_GB as f64) as u64,
        )
    }
}

/// Combined size of `objects`
pub fn total_size(objects: &[BackupObject]) -> u64 {
    objects
        .iter()
        .fold(0u64, |acc, o| acc.saturating_add(o.size_bytes))
}

/// Newest-first ordering; among equal timestamps the smaller key sorts last.
fn newest_first(a: &BackupObject, b: &BackupObject) -> Ordering {
    b.last_modified
        .cmp(&a.last_modified)
        .then_with(|| b.key.cmp(&a.key))
}

/// Sort a listing newest first, so the tail is always the next deletion candidate
pub fn sort_newest_first(objects: &mut [BackupObject]) {
    objects.sort_by(newest_first);
}

/// Deletion decisions for one backup set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPlan {
    /// Survivors, newest first
    pub keep: Vec<BackupObject>,
    /// Objects to delete, in deletion order (oldest first)
    pub delete: Vec<BackupObject>,
}

/// Result of an enforcement pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionOutcome {
    /// Keys deleted, in the order they were deleted
    pub deleted_keys: Vec<String>,
    /// Survivors, newest first
    pub remaining: Vec<BackupObject>,
}

/// Applies a [`RetentionPolicy`] to the objects in a store
#[derive(Debug, Clone)]
pub struct RetentionEnforcer {
    policy: RetentionPolicy,
}

impl RetentionEnforcer {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Decide which objects to delete without touching the store
    ///
    /// The listing order is not trusted; the set is re-sorted first.
    pub fn plan(&self, mut backup_set: Vec<BackupObject>) -> RetentionPlan {
        sort_newest_first(&mut backup_set);

        let mut total = total_size(&backup_set);
        let mut delete = Vec::new();
        while backup_set.len() > self.policy.max_count as usize
            || total > self.policy.max_total_size_bytes
        {
            let Some(oldest) = backup_set.pop() else {
                break;
            };
            total = total.saturating_sub(oldest.size_bytes);
            delete.push(oldest);
        }

        RetentionPlan {
            keep: backup_set,
            delete,
        }
    }

    /// Delete the objects the policy rejects
    ///
    /// Stops at the first failed delete and returns that error. Deletions made
    /// before the failure stay applied.
    pub async fn enforce(
        &self,
        store: &dyn ObjectStore,
        backup_set: Vec<BackupObject>,
    ) -> Result<RetentionOutcome> {
        let plan = self.plan(backup_set);
        let mut deleted_keys = Vec::with_capacity(plan.delete.len());

        for object in &plan.delete {
            if let Err(e) = store.delete_object(&object.key).await {
                error!(
                    key = %object.key,
                    deleted = deleted_keys.len(),
                    pending = plan.delete.len() - deleted_keys.len(),
                    error = %e,
                    "Retention pass aborted"
                );
                return Err(e);
            }
            info!(
                key = %object.key,
                size_bytes = object.size_bytes,
                last_modified = %object.last_modified,
                "Removed old backup"
            );
            deleted_keys.push(object.key.clone());
        }

        Ok(RetentionOutcome {
            deleted_keys,
            remaining: plan.keep,
        })
    }

    /// List everything under `prefix` and enforce the policy on it
    pub async fn enforce_prefix(
        &self,
        store: &dyn ObjectStore,
        prefix: &str,
    ) -> Result<RetentionOutcome> {
        let backup_set = store.list_objects(prefix).await?;
        self.enforce(store, backup_set).await
    }
}

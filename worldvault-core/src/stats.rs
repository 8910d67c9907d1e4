/*!
Post-enforcement summary of the stored backup set.
*/

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

use crate::retention::{total_size, BYTES_PER_GB};
use crate::storage::{BackupObject, ObjectStore};

/// Count and combined size of the backups in the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupStats {
    pub count: u32,
    pub total_size_bytes: u64,
}

impl BackupStats {
    pub fn from_objects(objects: &[BackupObject]) -> Self {
        Self {
            count: u32::try_from(objects.len()).unwrap_or(u32::MAX),
            total_size_bytes: total_size(objects),
        }
    }

    /// Total size in gigabytes (1024³ bytes)
    pub fn total_size_gb(&self) -> f64 {
        self.total_size_bytes as f64 / BYTES_PER_GB as f64
    }
}

impl fmt::Display for BackupStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} backups, {:.2} GB", self.count, self.total_size_gb())
    }
}

/// Summarise what is stored under `prefix`
///
/// Never fails: a listing error is logged and reported as an empty summary.
pub async fn report(store: &dyn ObjectStore, prefix: &str) -> BackupStats {
    let stats = match store.list_objects(prefix).await {
        Ok(objects) => BackupStats::from_objects(&objects),
        Err(e) => {
            warn!(
                bucket = %store.bucket(),
                prefix = %prefix,
                error = %e,
                "Could not list backups for the summary"
            );
            return BackupStats::default();
        }
    };

    info!(
        count = stats.count,
        total_size_bytes = stats.total_size_bytes,
        total_size_gb = %format_args!("{:.2}", stats.total_size_gb()),
        "Backup summary"
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryObjectStore, StoreOperation};
    use chrono::Utc;

    #[test]
    fn test_display() {
        let stats = BackupStats {
            count: 3,
            total_size_bytes: 3 * BYTES_PER_GB / 2,
        };
        assert_eq!(stats.to_string(), "3 backups, 1.50 GB");
        assert_eq!(BackupStats::default().to_string(), "0 backups, 0.00 GB");
    }

    #[tokio::test]
    async fn test_report_counts_prefixed_objects() {
        let store = MemoryObjectStore::new("backups");
        store.insert("world_a.tar.gz", 100, Utc::now());
        store.insert("world_b.tar.gz", 50, Utc::now());
        store.insert("readme.txt", 7, Utc::now());

        let stats = report(&store, "world_").await;
        assert_eq!(
            stats,
            BackupStats {
                count: 2,
                total_size_bytes: 150
            }
        );
    }

    #[tokio::test]
    async fn test_report_degrades_on_listing_failure() {
        let store = MemoryObjectStore::new("backups");
        store.insert("world_a.tar.gz", 100, Utc::now());
        store.fail(StoreOperation::List);

        assert_eq!(report(&store, "world_").await, BackupStats::default());
    }

    #[test]
    fn test_serializes_for_json_output() {
        let json = serde_json::to_value(BackupStats {
            count: 1,
            total_size_bytes: 2,
        })
        .unwrap();
        assert_eq!(json["count"], 1);
        assert_eq!(json["total_size_bytes"], 2);
    }
}

/*!
# worldvault Core Engine

Periodic backups of a world directory to an object store, with a retention
budget over the stored archives.

Each cycle:

- archives the world directory into `world_<timestamp>.tar.gz`
- uploads it to the bucket (S3-compatible or a local directory)
- deletes the oldest archives until both the count and size budgets hold
- reports how many backups remain and how much space they take

## Architecture

The cycle only talks to the [`ObjectStore`] port; S3, local-directory and
in-memory adapters plug into it. Archive creation sits behind the
[`Archiver`] trait. Everything is wired together by the [`Scheduler`].

## Usage

```rust,no_run
use std::sync::Arc;
use worldvault_core::{BackupConfig, LocalObjectStore, Scheduler, StoreConfig};

# async fn demo() -> worldvault_core::Result<()> {
let config = BackupConfig::new(StoreConfig::local("backups", "/srv/backups"), "survival");
config.validate()?;

let store = Arc::new(LocalObjectStore::new("/srv/backups", "backups"));
let scheduler = Scheduler::new(store, &config);

// One cycle
let report = scheduler.run_once().await?;
println!("uploaded {} ({})", report.key, report.stats);

// Forever, until Ctrl+C
scheduler.run(async { let _ = tokio::signal::ctrl_c().await; }).await?;
# Ok(())
# }
```
*/

pub mod archive;
pub mod config;
pub mod error;
pub mod naming;
pub mod observability;
pub mod retention;
pub mod scheduler;
pub mod stats;
pub mod storage;

pub use archive::{Archiver, ScratchArchive, TarGzArchiver};
pub use config::{BackupConfig, S3Settings, StorageBackend, StoreConfig};
pub use error::{BackupError, Result};
pub use naming::{BackupKey, BACKUP_PREFIX};
pub use retention::{RetentionEnforcer, RetentionOutcome, RetentionPlan, RetentionPolicy};
pub use scheduler::{CycleReport, Scheduler};
pub use stats::BackupStats;
pub use storage::{ensure_bucket, BackupObject, BucketProbe, LocalObjectStore, MemoryObjectStore, ObjectStore};
#[cfg(feature = "s3")]
pub use storage::S3ObjectStore;
#[cfg(feature = "metrics")]
pub use observability::BackupMetrics;

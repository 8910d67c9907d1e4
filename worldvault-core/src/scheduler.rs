/*!
The backup loop.

A cycle is: ensure bucket, archive the world, upload the archive, enforce
retention, report. Cycles run strictly one after another; the interval is
slept *after* a cycle finishes, so the time between two backup starts is the
interval plus however long the cycle took. A failed cycle ends the loop with
its error. The sleep between cycles can be interrupted by a shutdown future;
an in-flight cycle is always allowed to finish.
*/

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::archive::{Archiver, ScratchArchive, TarGzArchiver};
use crate::config::BackupConfig;
use crate::naming::{BackupKey, BACKUP_PREFIX};
use crate::retention::{sort_newest_first, RetentionEnforcer, RetentionOutcome, RetentionPlan};
use crate::stats::{self, BackupStats};
use crate::storage::{ensure_bucket, BackupObject, ObjectStore};
use crate::{BackupError, Result};

/// What one successful cycle did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Key the new archive was uploaded under
    pub key: String,
    pub archive_size_bytes: u64,
    /// Keys removed by retention, oldest first
    pub deleted_keys: Vec<String>,
    pub stats: BackupStats,
    pub duration: Duration,
}

/// Drives backup cycles against one object store
pub struct Scheduler {
    store: Arc<dyn ObjectStore>,
    archiver: Arc<dyn Archiver>,
    source_dir: PathBuf,
    interval: Duration,
    enforcer: RetentionEnforcer,
    #[cfg(feature = "metrics")]
    metrics_file: Option<PathBuf>,
}

impl Scheduler {
    /// Create a scheduler using the tar.gz archiver described by `config`
    pub fn new(store: Arc<dyn ObjectStore>, config: &BackupConfig) -> Self {
        let archiver = TarGzArchiver::new(&config.scratch_dir).with_level(config.compression_level);
        Self::with_archiver(store, Arc::new(archiver), config)
    }

    /// Create a scheduler with a custom archiver
    pub fn with_archiver(
        store: Arc<dyn ObjectStore>,
        archiver: Arc<dyn Archiver>,
        config: &BackupConfig,
    ) -> Self {
        Self {
            store,
            archiver,
            source_dir: config.source_dir(),
            interval: config.interval,
            enforcer: RetentionEnforcer::new(config.retention),
            #[cfg(feature = "metrics")]
            metrics_file: None,
        }
    }

    /// Write Prometheus metrics to `path` after every cycle
    #[cfg(feature = "metrics")]
    pub fn with_metrics_file(mut self, path: PathBuf) -> Self {
        self.metrics_file = Some(path);
        self
    }

    pub fn store(&self) -> &dyn ObjectStore {
        self.store.as_ref()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run cycles until one fails or `shutdown` completes during a sleep
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(
            bucket = %self.store.bucket(),
            source = %self.source_dir.display(),
            interval_secs = self.interval.as_secs(),
            "Backup scheduler started"
        );

        loop {
            self.run_once().await?;

            info!(interval_secs = self.interval.as_secs(), "Done. Sleeping");
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping scheduler");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    /// Run a single cycle, recording its outcome
    pub async fn run_once(&self) -> Result<CycleReport> {
        let result = self.cycle().await;
        match &result {
            Ok(report) => info!(
                key = %report.key,
                deleted = report.deleted_keys.len(),
                duration_ms = report.duration.as_millis() as u64,
                "Backup cycle finished"
            ),
            Err(e) => error!(stage = e.stage(), error = %e, "Backup cycle failed"),
        }
        self.record(&result);
        result
    }

    async fn cycle(&self) -> Result<CycleReport> {
        let started = Instant::now();
        info!(source = %self.source_dir.display(), "Starting backup");

        ensure_bucket(self.store.as_ref()).await?;

        let archive = self.create_archive().await?;
        let key = archive.key().to_string();
        let archive_size_bytes = archive.size_bytes();

        let upload = self.store.put_object(&key, archive.path()).await;
        if let Err(e) = archive.close() {
            warn!(key = %key, error = %e, "Scratch archive was not removed");
        }
        upload?;
        info!(key = %key, size_bytes = archive_size_bytes, "Backup uploaded");

        let outcome = self
            .enforcer
            .enforce_prefix(self.store.as_ref(), BACKUP_PREFIX)
            .await?;
        let stats = stats::report(self.store.as_ref(), BACKUP_PREFIX).await;

        Ok(CycleReport {
            key,
            archive_size_bytes,
            deleted_keys: outcome.deleted_keys,
            stats,
            duration: started.elapsed(),
        })
    }

    async fn create_archive(&self) -> Result<ScratchArchive> {
        let archiver = Arc::clone(&self.archiver);
        let source = self.source_dir.clone();
        let timestamp = BackupKey::now().timestamp();

        tokio::task::spawn_blocking(move || archiver.create_snapshot(&source, timestamp))
            .await
            .map_err(|e| BackupError::archive(format!("Archive task failed: {e}")))?
    }

    /// Current backups, newest first
    pub async fn list_backups(&self) -> Result<Vec<BackupObject>> {
        let mut objects = self.store.list_objects(BACKUP_PREFIX).await?;
        sort_newest_first(&mut objects);
        Ok(objects)
    }

    /// What retention would delete right now, without deleting anything
    pub async fn plan_retention(&self) -> Result<RetentionPlan> {
        let objects = self.store.list_objects(BACKUP_PREFIX).await?;
        Ok(self.enforcer.plan(objects))
    }

    /// Apply retention without creating a new backup
    pub async fn prune(&self) -> Result<(RetentionOutcome, BackupStats)> {
        let outcome = self
            .enforcer
            .enforce_prefix(self.store.as_ref(), BACKUP_PREFIX)
            .await?;
        let stats = stats::report(self.store.as_ref(), BACKUP_PREFIX).await;
        Ok((outcome, stats))
    }

    /// Count and size of the current backups
    pub async fn stats(&self) -> BackupStats {
        stats::report(self.store.as_ref(), BACKUP_PREFIX).await
    }

    #[cfg(feature = "metrics")]
    fn record(&self, result: &Result<CycleReport>) {
        use crate::observability::BackupMetrics;

        let Some(metrics) = BackupMetrics::global() else {
            return;
        };
        match result {
            Ok(report) => metrics.record_success(
                report.archive_size_bytes,
                report.deleted_keys.len(),
                report.stats.count,
                report.stats.total_size_bytes,
            ),
            Err(e) => metrics.record_failure(e.stage()),
        }
        if let Some(path) = &self.metrics_file {
            if let Err(e) = metrics.write_textfile(path) {
                warn!(path = %path.display(), error = %e, "Failed to write metrics file");
            }
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn record(&self, _result: &Result<CycleReport>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackupConfig, StoreConfig};
    use crate::retention::RetentionPolicy;
    use crate::storage::{BucketProbe, MemoryObjectStore, StoreOperation};
    use chrono::{TimeZone, Utc};
    use flate2::read::GzDecoder;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _root: TempDir,
        scratch: PathBuf,
        config: BackupConfig,
    }

    fn fixture(policy: RetentionPolicy) -> Fixture {
        let root = TempDir::new().unwrap();
        let world = root.path().join("survival");
        fs::create_dir_all(world.join("region")).unwrap();
        fs::write(world.join("level.dat"), b"level").unwrap();
        fs::write(world.join("region/r.0.0.mca"), vec![1u8; 2048]).unwrap();
        let scratch = root.path().join("scratch");

        let mut config = BackupConfig::new(
            StoreConfig::local("backups", root.path().join("store")),
            "survival",
        );
        config.snapshot_root = root.path().to_path_buf();
        config.scratch_dir = scratch.clone();
        config.retention = policy;
        config.interval = Duration::from_secs(3600);

        Fixture {
            _root: root,
            scratch,
            config,
        }
    }

    fn scratch_is_empty(path: &std::path::Path) -> bool {
        !path.exists() || fs::read_dir(path).unwrap().next().is_none()
    }

    fn seed_old(store: &MemoryObjectStore, n: i64) {
        for i in 1..=n {
            store.insert(
                format!("world_2020-01-0{i}_00-00-00.tar.gz"),
                10,
                Utc.timestamp_opt(1_577_836_800 + i * 86_400, 0).unwrap(),
            );
        }
    }

    #[tokio::test]
    async fn test_cycle_uploads_and_cleans_scratch() {
        let fx = fixture(RetentionPolicy::default());
        let store = Arc::new(MemoryObjectStore::without_bucket("backups"));
        let scheduler = Scheduler::new(store.clone(), &fx.config);

        let report = scheduler.run_once().await.unwrap();

        assert!(report.key.starts_with("world_"));
        assert!(report.key.ends_with(".tar.gz"));
        assert!(report.deleted_keys.is_empty());
        assert_eq!(report.stats.count, 1);
        assert_eq!(report.stats.total_size_bytes, report.archive_size_bytes);
        assert_eq!(store.buckets_created(), 1);
        assert_eq!(store.probe_bucket().await, BucketProbe::Present);

        let body = store.body(&report.key).unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(&body[..]));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect();
        assert!(names.iter().any(|n| n == "world/level.dat"));

        assert!(scratch_is_empty(&fx.scratch));
    }

    #[tokio::test]
    async fn test_enforcement_sees_new_upload() {
        let fx = fixture(RetentionPolicy::new(1, u64::MAX));
        let store = Arc::new(MemoryObjectStore::new("backups"));
        seed_old(&store, 2);
        let scheduler = Scheduler::new(store.clone(), &fx.config);

        let report = scheduler.run_once().await.unwrap();

        assert_eq!(
            report.deleted_keys,
            vec![
                "world_2020-01-01_00-00-00.tar.gz",
                "world_2020-01-02_00-00-00.tar.gz"
            ]
        );
        assert_eq!(store.keys(), vec![report.key.clone()]);
        assert_eq!(report.stats.count, 1);
    }

    #[tokio::test]
    async fn test_upload_failure_skips_retention() {
        let fx = fixture(RetentionPolicy::new(3, u64::MAX));
        let store = Arc::new(MemoryObjectStore::new("backups"));
        seed_old(&store, 5);
        store.fail(StoreOperation::Put);
        let scheduler = Scheduler::new(store.clone(), &fx.config);

        let result = scheduler.run_once().await;

        assert!(matches!(result, Err(BackupError::Upload { .. })));
        // Retention never ran, and nothing from this cycle was stored.
        assert_eq!(store.keys().len(), 5);
        assert!(store.keys().iter().all(|k| k.starts_with("world_2020")));
        assert!(scratch_is_empty(&fx.scratch));
    }

    #[tokio::test]
    async fn test_missing_source_fails_before_upload() {
        let mut fx = fixture(RetentionPolicy::default());
        fx.config.world_name = "does-not-exist".to_string();
        let store = Arc::new(MemoryObjectStore::new("backups"));
        let scheduler = Scheduler::new(store.clone(), &fx.config);

        let result = scheduler.run_once().await;
        assert!(matches!(result, Err(BackupError::SourceUnavailable { .. })));
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_delete_failure_fails_cycle() {
        let fx = fixture(RetentionPolicy::new(1, u64::MAX));
        let store = Arc::new(MemoryObjectStore::new("backups"));
        seed_old(&store, 3);
        store.fail_deletes_after(1);
        let scheduler = Scheduler::new(store.clone(), &fx.config);

        let result = scheduler.run_once().await;
        assert!(matches!(result, Err(BackupError::Delete { .. })));
        // The oldest went, the rest stayed along with the fresh upload.
        assert_eq!(store.keys().len(), 3);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_after_cycle() {
        let fx = fixture(RetentionPolicy::default());
        let store = Arc::new(MemoryObjectStore::new("backups"));
        let scheduler = Scheduler::new(store.clone(), &fx.config);

        // Shutdown is already requested: one cycle runs, then the sleep is cut short.
        tokio::time::timeout(Duration::from_secs(30), scheduler.run(async {}))
            .await
            .expect("run should not sleep the full interval")
            .unwrap();
        assert_eq!(store.keys().len(), 1);
    }

    #[tokio::test]
    async fn test_run_propagates_cycle_failure() {
        let fx = fixture(RetentionPolicy::default());
        let store = Arc::new(MemoryObjectStore::new("backups"));
        store.fail(StoreOperation::List);
        let scheduler = Scheduler::new(store.clone(), &fx.config);

        let result = scheduler.run(std::future::pending()).await;
        assert!(matches!(result, Err(BackupError::List { .. })));
    }

    #[tokio::test]
    async fn test_plan_and_prune() {
        let fx = fixture(RetentionPolicy::new(2, u64::MAX));
        let store = Arc::new(MemoryObjectStore::new("backups"));
        seed_old(&store, 4);
        let scheduler = Scheduler::new(store.clone(), &fx.config);

        let plan = scheduler.plan_retention().await.unwrap();
        assert_eq!(plan.delete.len(), 2);
        assert_eq!(store.keys().len(), 4);

        let (outcome, stats) = scheduler.prune().await.unwrap();
        assert_eq!(outcome.deleted_keys.len(), 2);
        assert_eq!(stats.count, 2);

        let listed = scheduler.list_backups().await.unwrap();
        assert_eq!(listed[0].key, "world_2020-01-04_00-00-00.tar.gz");
        assert_eq!(scheduler.stats().await.count, 2);
    }
}

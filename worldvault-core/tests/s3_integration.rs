/*!
S3 integration tests against a MinIO (or any S3-compatible) server.

These tests need a reachable server and are skipped unless `RUN_S3_TESTS=1`.

To run MinIO:
```bash
docker run --rm -p 9000:9000 -e MINIO_ROOT_USER=minioadmin -e MINIO_ROOT_PASSWORD=minioadmin minio/minio server /data
```

Then run tests with:
```bash
RUN_S3_TESTS=1 cargo test -p worldvault-core --features s3 --test s3_integration
```

`S3_URL`, `S3_PORT`, `S3_USERNAME` and `S3_PASSWORD` override the MinIO defaults.
*/

#![cfg(feature = "s3")]

use chrono::Utc;
use std::fs;
use std::io::Write;
use std::sync::Arc;
use tempfile::{NamedTempFile, TempDir};
use worldvault_core::{
    ensure_bucket, BackupConfig, BucketProbe, ObjectStore, RetentionPolicy, S3ObjectStore,
    S3Settings, Scheduler, StoreConfig, BACKUP_PREFIX,
};

const MIB: u64 = 1024 * 1024;

fn s3_tests_enabled() -> bool {
    std::env::var("RUN_S3_TESTS").unwrap_or_default() == "1"
}

fn settings() -> S3Settings {
    let url = std::env::var("S3_URL").unwrap_or_else(|_| "http://localhost".to_string());
    let port = std::env::var("S3_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(9000);
    let user = std::env::var("S3_USERNAME").unwrap_or_else(|_| "minioadmin".to_string());
    let password = std::env::var("S3_PASSWORD").unwrap_or_else(|_| "minioadmin".to_string());
    S3Settings::new(&url, port, user, password)
}

/// Unique per test run so reruns never see leftovers
fn bucket_name(test: &str) -> String {
    format!("worldvault-{test}-{}", Utc::now().timestamp_millis())
}

async fn connect(bucket: &str, threshold: u64) -> S3ObjectStore {
    S3ObjectStore::connect(bucket, &settings(), threshold).await
}

async fn clear_bucket(store: &S3ObjectStore) {
    if let Ok(objects) = store.list_objects("").await {
        for object in objects {
            let _ = store.delete_object(&object.key).await;
        }
    }
}

#[tokio::test]
async fn test_s3_bucket_and_object_lifecycle() {
    if !s3_tests_enabled() {
        println!("Skipping S3 test - set RUN_S3_TESTS=1 and start MinIO");
        return;
    }

    let bucket = bucket_name("lifecycle");
    let store = connect(&bucket, 64 * MIB).await;

    assert_eq!(store.probe_bucket().await, BucketProbe::Absent);
    ensure_bucket(&store).await.unwrap();
    assert_eq!(store.probe_bucket().await, BucketProbe::Present);
    // Second call finds it and does nothing
    ensure_bucket(&store).await.unwrap();

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"not really a world").unwrap();
    file.flush().unwrap();

    let key = "world_2024-06-01_12-00-00.tar.gz";
    store.put_object(key, file.path()).await.unwrap();
    store.put_object("notes.txt", file.path()).await.unwrap();

    let backups = store.list_objects(BACKUP_PREFIX).await.unwrap();
    assert_eq!(backups.len(), 1);
    assert_eq!(backups[0].key, key);
    assert_eq!(backups[0].size_bytes, 18);

    store.delete_object(key).await.unwrap();
    assert!(store.list_objects(BACKUP_PREFIX).await.unwrap().is_empty());

    clear_bucket(&store).await;
}

#[tokio::test]
async fn test_s3_multipart_upload() {
    if !s3_tests_enabled() {
        println!("Skipping S3 test - set RUN_S3_TESTS=1 and start MinIO");
        return;
    }

    let bucket = bucket_name("multipart");
    let store = connect(&bucket, 5 * MIB).await;
    ensure_bucket(&store).await.unwrap();

    // Two full parts plus a short tail
    let mut file = NamedTempFile::new().unwrap();
    let chunk = vec![42u8; MIB as usize];
    for _ in 0..11 {
        file.write_all(&chunk).unwrap();
    }
    file.flush().unwrap();

    let key = "world_2024-06-02_12-00-00.tar.gz";
    store.put_object(key, file.path()).await.unwrap();

    let listed = store.list_objects(key).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].size_bytes, 11 * MIB);

    clear_bucket(&store).await;
}

#[tokio::test]
async fn test_s3_full_cycle_with_retention() {
    if !s3_tests_enabled() {
        println!("Skipping S3 test - set RUN_S3_TESTS=1 and start MinIO");
        return;
    }

    let root = TempDir::new().unwrap();
    let world = root.path().join("survival");
    fs::create_dir_all(world.join("region")).unwrap();
    fs::write(world.join("level.dat"), b"level").unwrap();
    fs::write(world.join("region/r.0.0.mca"), vec![3u8; 4096]).unwrap();

    let bucket = bucket_name("cycle");
    let mut config = BackupConfig::new(StoreConfig::s3(bucket.clone(), settings()), "survival");
    config.snapshot_root = root.path().to_path_buf();
    config.scratch_dir = root.path().join("scratch");
    config.retention = RetentionPolicy::new(2, u64::MAX);
    config.validate().unwrap();

    let store = Arc::new(connect(&bucket, config.store.multipart_threshold_bytes).await);
    ensure_bucket(store.as_ref()).await.unwrap();

    let mut seed = NamedTempFile::new().unwrap();
    seed.write_all(b"old").unwrap();
    seed.flush().unwrap();
    for key in [
        "world_2020-01-01_00-00-00.tar.gz",
        "world_2020-01-02_00-00-00.tar.gz",
    ] {
        store.put_object(key, seed.path()).await.unwrap();
    }

    let scheduler = Scheduler::new(store.clone(), &config);
    let report = scheduler.run_once().await.unwrap();

    assert_eq!(report.deleted_keys, vec!["world_2020-01-01_00-00-00.tar.gz"]);
    assert_eq!(report.stats.count, 2);

    let keys: Vec<String> = scheduler
        .list_backups()
        .await
        .unwrap()
        .into_iter()
        .map(|object| object.key)
        .collect();
    assert_eq!(keys[0], report.key);
    assert_eq!(keys[1], "world_2020-01-02_00-00-00.tar.gz");

    clear_bucket(&store).await;
}

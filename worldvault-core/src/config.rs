//! Configuration module for backup settings and storage backend selection
//!
//! This module provides the validated configuration a backup process runs
//! with: where the world lives, where archives go, how often to run, and the
//! retention budget. Values are parsed elsewhere (the CLI reads them from the
//! environment) and checked here before any cycle starts.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::retention::RetentionPolicy;
use crate::{BackupError, Result};

/// Default endpoint port when only a URL is given
pub const DEFAULT_S3_PORT: u16 = 9000;

/// Default signing region
pub const DEFAULT_S3_REGION: &str = "us-east-1";

/// Default sleep between the end of one cycle and the start of the next
pub const DEFAULT_INTERVAL_SECS: u64 = 3600;

/// Default retention count budget
pub const DEFAULT_MAX_BACKUPS: u32 = 20;

/// Default retention size budget, in GB
pub const DEFAULT_MAX_TOTAL_SIZE_GB: f64 = 20.0;

/// Default root the world directory is looked up under
pub const DEFAULT_SNAPSHOT_ROOT: &str = "/minecraft";

/// Default multipart cut-over and part size, in MiB
pub const DEFAULT_MULTIPART_THRESHOLD_MB: u64 = 64;

/// Smallest part size S3 accepts for multipart uploads, in MiB
pub const MIN_MULTIPART_THRESHOLD_MB: u64 = 5;

/// Enumeration of supported storage backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Local directory acting as a bucket
    Local,
    /// S3-compatible object storage (AWS S3, MinIO, ...)
    S3,
}

/// Connection settings for an S3-compatible endpoint
#[derive(Clone, PartialEq, Eq)]
pub struct S3Settings {
    /// Full endpoint, e.g. `http://minio:9000`
    pub endpoint_url: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

impl S3Settings {
    /// Build settings from a URL and a port, joined as `{url}:{port}`
    pub fn new(
        url: &str,
        port: u16,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            endpoint_url: endpoint_url(url, port),
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            region: DEFAULT_S3_REGION.to_string(),
        }
    }

    /// Override the signing region
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }
}

impl fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Settings")
            .field("endpoint_url", &self.endpoint_url)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("region", &self.region)
            .finish()
    }
}

/// Join an endpoint URL and port the way object store endpoints are configured
pub fn endpoint_url(url: &str, port: u16) -> String {
    format!("{}:{port}", url.trim().trim_end_matches('/'))
}

/// Configuration structure for the object store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// The storage backend to use
    pub backend: StorageBackend,
    /// Target bucket
    pub bucket: String,
    /// Endpoint and credentials (required for the S3 backend)
    pub s3: Option<S3Settings>,
    /// Base directory for the local backend
    pub local_base_path: Option<PathBuf>,
    /// Files larger than this are uploaded in parts of this size
    pub multipart_threshold_bytes: u64,
}

impl StoreConfig {
    /// An S3 store configuration for `bucket`
    pub fn s3(bucket: impl Into<String>, settings: S3Settings) -> Self {
        Self {
            backend: StorageBackend::S3,
            bucket: bucket.into(),
            s3: Some(settings),
            local_base_path: None,
            multipart_threshold_bytes: DEFAULT_MULTIPART_THRESHOLD_MB * 1024 * 1024,
        }
    }

    /// A local directory store configuration for `bucket` under `base_path`
    pub fn local(bucket: impl Into<String>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            backend: StorageBackend::Local,
            bucket: bucket.into(),
            s3: None,
            local_base_path: Some(base_path.into()),
            multipart_threshold_bytes: DEFAULT_MULTIPART_THRESHOLD_MB * 1024 * 1024,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.bucket.trim().is_empty() {
            return Err(BackupError::configuration("bucket name must not be empty"));
        }
        if self.multipart_threshold_bytes < MIN_MULTIPART_THRESHOLD_MB * 1024 * 1024 {
            return Err(BackupError::configuration(format!(
                "multipart threshold must be at least {MIN_MULTIPART_THRESHOLD_MB} MB"
            )));
        }
        match self.backend {
            StorageBackend::S3 => {
                let settings = self.s3.as_ref().ok_or_else(|| {
                    BackupError::configuration("S3 backend requires endpoint and credentials")
                })?;
                if !settings.endpoint_url.starts_with("http://")
                    && !settings.endpoint_url.starts_with("https://")
                {
                    return Err(BackupError::configuration(format!(
                        "S3 endpoint '{}' must start with http:// or https://",
                        settings.endpoint_url
                    )));
                }
                if settings.access_key.is_empty() || settings.secret_key.is_empty() {
                    return Err(BackupError::configuration(
                        "S3 access key and secret key must not be empty",
                    ));
                }
            }
            StorageBackend::Local => {
                if self.local_base_path.is_none() {
                    return Err(BackupError::configuration(
                        "local backend requires a base path",
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Everything a backup process needs to run
#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub store: StoreConfig,
    /// Fixed root the world directory lives under
    pub snapshot_root: PathBuf,
    /// Name of the world directory under `snapshot_root`
    pub world_name: String,
    /// Where archives are staged before upload
    pub scratch_dir: PathBuf,
    /// Sleep between the end of one cycle and the start of the next
    pub interval: Duration,
    pub retention: RetentionPolicy,
    /// gzip level, 0-9
    pub compression_level: u32,
}

impl BackupConfig {
    /// Build a configuration with defaults for everything but the store and world
    pub fn new(store: StoreConfig, world_name: impl Into<String>) -> Self {
        Self {
            store,
            snapshot_root: PathBuf::from(DEFAULT_SNAPSHOT_ROOT),
            world_name: world_name.into(),
            scratch_dir: std::env::temp_dir(),
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
            retention: RetentionPolicy::default(),
            compression_level: 6,
        }
    }

    /// Directory that gets archived each cycle
    pub fn source_dir(&self) -> PathBuf {
        self.snapshot_root.join(&self.world_name)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;

        let name = self.world_name.trim();
        if name.is_empty() {
            return Err(BackupError::configuration("world name must not be empty"));
        }
        if name == "." || name == ".." || name.contains('/') || name.contains('\\') {
            return Err(BackupError::configuration(format!(
                "world name '{}' must be a single directory name",
                self.world_name
            )));
        }
        if self.compression_level > 9 {
            return Err(BackupError::configuration(format!(
                "compression level {} is out of range 0-9",
                self.compression_level
            )));
        }
        Ok(())
    }
}

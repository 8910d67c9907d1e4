/*!
worldvault CLI - backup daemon and maintenance commands.

`worldvault run` archives the configured world directory on a fixed interval,
uploads each archive and prunes old ones. The other subcommands inspect or
prune the bucket without creating a backup.

Every setting can be given as an environment variable (a `.env` file in the
working directory is loaded first) or as a flag.
*/

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tabled::{Table, Tabled};
use tracing::{info, warn};
use worldvault_core::config::{
    DEFAULT_INTERVAL_SECS, DEFAULT_MAX_BACKUPS, DEFAULT_MAX_TOTAL_SIZE_GB,
    DEFAULT_MULTIPART_THRESHOLD_MB, DEFAULT_S3_PORT, DEFAULT_S3_REGION, DEFAULT_SNAPSHOT_ROOT,
};
use worldvault_core::observability::{init_logging, LogFormat};
use worldvault_core::{
    BackupConfig, BackupError, BackupObject, LocalObjectStore, ObjectStore, RetentionPolicy,
    S3Settings, Scheduler, StorageBackend, StoreConfig,
};

#[derive(Parser, Debug)]
#[command(name = "worldvault")]
#[command(about = "Periodic world backups to S3-compatible storage with retention")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, global = true, env = "LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormatArg,

    #[command(flatten)]
    settings: Settings,

    /// Defaults to `run`
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum BackendArg {
    S3,
    Local,
}

#[derive(Args, Debug)]
struct Settings {
    /// Storage backend to use
    #[arg(long, env = "STORAGE_BACKEND", value_enum, default_value = "s3")]
    backend: BackendArg,

    /// Object store URL, without the port
    #[arg(long, env = "S3_URL")]
    s3_url: Option<String>,

    /// Object store port
    #[arg(long, env = "S3_PORT", default_value_t = DEFAULT_S3_PORT)]
    s3_port: u16,

    /// Access key
    #[arg(long, env = "S3_USERNAME")]
    s3_username: Option<String>,

    /// Secret key
    #[arg(long, env = "S3_PASSWORD", hide_env_values = true)]
    s3_password: Option<String>,

    /// Signing region
    #[arg(long, env = "S3_REGION", default_value = DEFAULT_S3_REGION)]
    s3_region: String,

    /// Base directory for the local backend
    #[arg(long, env = "LOCAL_STORE_PATH")]
    local_store_path: Option<PathBuf>,

    /// Target bucket
    #[arg(long = "bucket", env = "BUCKET_NAME")]
    bucket: String,

    /// Seconds to sleep between the end of one cycle and the start of the next
    #[arg(long = "interval", env = "BACKUP_INTERVAL", default_value_t = DEFAULT_INTERVAL_SECS)]
    interval_secs: u64,

    /// Size budget for all backups together, in GB
    #[arg(long, env = "MAX_TOTAL_SIZE_GB", default_value_t = DEFAULT_MAX_TOTAL_SIZE_GB)]
    max_total_size_gb: f64,

    /// Maximum number of backups to keep
    #[arg(long, env = "MAX_BACKUPS", default_value_t = DEFAULT_MAX_BACKUPS)]
    max_backups: u32,

    /// World directory name under the snapshot root
    #[arg(long, env = "WORLD_NAME")]
    world_name: String,

    /// Directory holding the world directories
    #[arg(long, env = "SNAPSHOT_ROOT", default_value = DEFAULT_SNAPSHOT_ROOT)]
    snapshot_root: PathBuf,

    /// Where archives are staged before upload (defaults to the system temp dir)
    #[arg(long, env = "SCRATCH_DIR")]
    scratch_dir: Option<PathBuf>,

    /// gzip level, 0-9
    #[arg(long, env = "COMPRESSION_LEVEL", default_value_t = 6)]
    compression_level: u32,

    /// Archives above this size (MB) are uploaded in parts of this size
    #[arg(long, env = "MULTIPART_THRESHOLD_MB", default_value_t = DEFAULT_MULTIPART_THRESHOLD_MB)]
    multipart_threshold_mb: u64,

    /// Write Prometheus metrics to this file after every cycle
    #[arg(long, env = "METRICS_FILE")]
    metrics_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Commands {
    /// Back up on a fixed interval until stopped
    Run,
    /// Run a single backup cycle
    Once,
    /// List stored backups, newest first
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show backup count and total size
    Stats {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Apply the retention policy without creating a backup
    Prune {
        /// Show what would be deleted without deleting it
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Tabled)]
struct BackupRow {
    #[tabled(rename = "Key")]
    key: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Last Modified")]
    last_modified: String,
}

impl From<&BackupObject> for BackupRow {
    fn from(object: &BackupObject) -> Self {
        Self {
            key: object.key.clone(),
            size: format_size(object.size_bytes),
            last_modified: format_timestamp(object.last_modified.timestamp()),
        }
    }
}

impl Settings {
    fn into_config(self) -> Result<(BackupConfig, Option<PathBuf>), BackupError> {
        let mut store = match self.backend {
            BackendArg::S3 => {
                let url = self
                    .s3_url
                    .ok_or_else(|| BackupError::configuration("S3_URL is required"))?;
                let access_key = self
                    .s3_username
                    .ok_or_else(|| BackupError::configuration("S3_USERNAME is required"))?;
                let secret_key = self
                    .s3_password
                    .ok_or_else(|| BackupError::configuration("S3_PASSWORD is required"))?;
                let settings = S3Settings::new(&url, self.s3_port, access_key, secret_key)
                    .with_region(self.s3_region);
                StoreConfig::s3(self.bucket, settings)
            }
            BackendArg::Local => {
                let base = self.local_store_path.ok_or_else(|| {
                    BackupError::configuration("LOCAL_STORE_PATH is required for the local backend")
                })?;
                StoreConfig::local(self.bucket, base)
            }
        };
        store.multipart_threshold_bytes = self.multipart_threshold_mb.saturating_mul(1024 * 1024);

        let mut config = BackupConfig::new(store, self.world_name);
        config.snapshot_root = self.snapshot_root;
        if let Some(scratch_dir) = self.scratch_dir {
            config.scratch_dir = scratch_dir;
        }
        config.interval = std::time::Duration::from_secs(self.interval_secs);
        config.retention = RetentionPolicy::from_gigabytes(self.max_backups, self.max_total_size_gb)?;
        config.compression_level = self.compression_level;

        config.validate()?;
        Ok((config, self.metrics_file))
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_format.into())?;

    let (config, metrics_file) = cli
        .settings
        .into_config()
        .context("Invalid configuration")?;
    let store = build_store(&config.store).await?;
    let scheduler = build_scheduler(store, &config, metrics_file);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&scheduler, &config).await?,
        Commands::Once => {
            let report = scheduler.run_once().await?;
            println!(
                "Uploaded {} ({}), removed {} old backup(s); now {}",
                report.key,
                format_size(report.archive_size_bytes),
                report.deleted_keys.len(),
                report.stats
            );
        }
        Commands::List { json } => list_backups(&scheduler, json).await?,
        Commands::Stats { json } => {
            let stats = scheduler.stats().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Backups count: {}", stats.count);
                println!("Total backup size: {:.2} GB", stats.total_size_gb());
            }
        }
        Commands::Prune { dry_run } => prune(&scheduler, dry_run).await?,
    }

    Ok(())
}

async fn build_store(config: &StoreConfig) -> Result<Arc<dyn ObjectStore>, anyhow::Error> {
    match config.backend {
        StorageBackend::Local => {
            let base = config
                .local_base_path
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("Local backend requires a base path"))?;
            Ok(Arc::new(LocalObjectStore::new(base, config.bucket.as_str())))
        }
        StorageBackend::S3 => {
            #[cfg(feature = "s3")]
            {
                use worldvault_core::S3ObjectStore;
                let settings = config
                    .s3
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("S3 settings not configured"))?;
                let store = S3ObjectStore::connect(
                    &config.bucket,
                    settings,
                    config.multipart_threshold_bytes,
                )
                .await;
                Ok(Arc::new(store))
            }
            #[cfg(not(feature = "s3"))]
            {
                Err(anyhow::anyhow!("S3 support not enabled"))
            }
        }
    }
}

fn build_scheduler(
    store: Arc<dyn ObjectStore>,
    config: &BackupConfig,
    metrics_file: Option<PathBuf>,
) -> Scheduler {
    let scheduler = Scheduler::new(store, config);
    #[cfg(feature = "metrics")]
    let scheduler = match metrics_file {
        Some(path) => scheduler.with_metrics_file(path),
        None => scheduler,
    };
    #[cfg(not(feature = "metrics"))]
    if metrics_file.is_some() {
        warn!("METRICS_FILE is set but metrics support is not enabled");
    }
    scheduler
}

async fn run(scheduler: &Scheduler, config: &BackupConfig) -> Result<(), anyhow::Error> {
    if config.retention.drains_everything() {
        warn!(
            max_backups = config.retention.max_count,
            max_total_size_bytes = config.retention.max_total_size_bytes,
            "Retention policy keeps no backups: every archive will be deleted right after upload"
        );
    }
    info!(
        world = %config.world_name,
        bucket = %config.store.bucket,
        max_backups = config.retention.max_count,
        max_total_size_bytes = config.retention.max_total_size_bytes,
        "Backup service started"
    );

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        relay_signals(shutdown_signal, stop_tx).await;
        std::process::exit(130);
    });

    scheduler
        .run(async move {
            let _ = stop_rx.await;
        })
        .await?;
    Ok(())
}

/// Request a graceful stop on the first signal; return on the second
///
/// The caller exits the process once this returns, so a cycle stuck on a
/// store call can still be interrupted.
async fn relay_signals<F, Fut>(mut next_signal: F, stop_tx: tokio::sync::oneshot::Sender<()>)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    next_signal().await;
    info!("Shutdown signal received, stopping after the current cycle (signal again to exit now)");
    let _ = stop_tx.send(());

    next_signal().await;
    warn!("Second shutdown signal received, exiting immediately");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn list_backups(scheduler: &Scheduler, json: bool) -> Result<(), anyhow::Error> {
    let backups = scheduler.list_backups().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&backups)?);
    } else if backups.is_empty() {
        println!("No backups found");
    } else {
        let rows: Vec<BackupRow> = backups.iter().map(BackupRow::from).collect();
        println!("{}", Table::new(rows));
    }
    Ok(())
}

async fn prune(scheduler: &Scheduler, dry_run: bool) -> Result<(), anyhow::Error> {
    if dry_run {
        let plan = scheduler.plan_retention().await?;
        if plan.delete.is_empty() {
            println!("Nothing to delete ({} backups within budget)", plan.keep.len());
        } else {
            println!("Would delete {} backup(s):", plan.delete.len());
            for object in &plan.delete {
                println!("  {} ({})", object.key, format_size(object.size_bytes));
            }
        }
        return Ok(());
    }

    let (outcome, stats) = scheduler.prune().await?;
    for key in &outcome.deleted_keys {
        println!("Removed {key}");
    }
    println!("Now {stats}");
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

fn format_timestamp(timestamp: i64) -> String {
    use chrono::{Local, TimeZone};

    match Local.timestamp_opt(timestamp, 0) {
        chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => timestamp.to_string(),
    }
}

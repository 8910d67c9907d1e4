/*!
Error types for the worldvault core engine.
*/

use std::path::PathBuf;
use thiserror::Error;

/// Result type used throughout the worldvault core.
pub type Result<T> = std::result::Result<T, BackupError>;

/// Errors that can occur while creating, uploading or pruning backups.
#[derive(Error, Debug)]
pub enum BackupError {
    /// I/O errors during local file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Missing or invalid settings, detected before any cycle runs
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The directory to archive is missing or unreadable
    #[error("Backup source {} is unavailable: {reason}", path.display())]
    SourceUnavailable { path: PathBuf, reason: String },

    /// Building the tar.gz archive failed
    #[error("Archive error: {0}")]
    Archive(String),

    /// An object key that does not follow the backup naming layout
    #[error("Invalid backup key: {0}")]
    InvalidKey(String),

    /// Bucket creation failed for a reason other than "already exists"
    #[error("Failed to create bucket '{bucket}': {message}")]
    Bucket { bucket: String, message: String },

    /// Uploading an archive failed
    #[error("Failed to upload '{key}': {message}")]
    Upload { key: String, message: String },

    /// Listing objects under a prefix failed
    #[error("Failed to list objects with prefix '{prefix}': {message}")]
    List { prefix: String, message: String },

    /// Deleting an object failed
    #[error("Failed to delete '{key}': {message}")]
    Delete { key: String, message: String },

    /// Metrics registry errors
    #[error("Metrics error: {0}")]
    Metrics(String),
}

impl BackupError {
    /// Create a new configuration error
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new archive error
    pub fn archive<S: Into<String>>(msg: S) -> Self {
        Self::Archive(msg.into())
    }

    /// Create a new source-unavailable error
    pub fn source_unavailable<P: Into<PathBuf>, S: Into<String>>(path: P, reason: S) -> Self {
        Self::SourceUnavailable {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a new upload error
    pub fn upload<K: Into<String>, S: Into<String>>(key: K, msg: S) -> Self {
        Self::Upload {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a new list error
    pub fn list<P: Into<String>, S: Into<String>>(prefix: P, msg: S) -> Self {
        Self::List {
            prefix: prefix.into(),
            message: msg.into(),
        }
    }

    /// Create a new delete error
    pub fn delete<K: Into<String>, S: Into<String>>(key: K, msg: S) -> Self {
        Self::Delete {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a new bucket error
    pub fn bucket<B: Into<String>, S: Into<String>>(bucket: B, msg: S) -> Self {
        Self::Bucket {
            bucket: bucket.into(),
            message: msg.into(),
        }
    }

    /// Name of the cycle stage this error belongs to, used in logs and metrics labels.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "config",
            Self::SourceUnavailable { .. } | Self::Archive(_) | Self::Io(_) => "archive",
            Self::InvalidKey(_) => "naming",
            Self::Bucket { .. } => "bucket",
            Self::Upload { .. } => "upload",
            Self::List { .. } => "list",
            Self::Delete { .. } => "delete",
            Self::Metrics(_) => "metrics",
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod error_tests;

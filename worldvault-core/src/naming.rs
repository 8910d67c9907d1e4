/*!
Object key naming for backup archives.

Keys look like `world_2024-05-01_13-45-00.tar.gz`. The layout is wire-visible:
existing buckets already hold objects named this way, so it must not change.
*/

use chrono::{Local, NaiveDateTime, Timelike};
use std::fmt;

use crate::{BackupError, Result};

/// Prefix shared by every backup object; listings are scoped to it.
pub const BACKUP_PREFIX: &str = "world_";

/// Extension of every backup object.
pub const ARCHIVE_SUFFIX: &str = ".tar.gz";

/// Timestamp layout embedded in keys.
pub const KEY_TIME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Name of the single top-level directory inside each archive.
pub const ARCHIVE_ROOT: &str = "world";

/// A validated backup object key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackupKey {
    key: String,
    timestamp: NaiveDateTime,
}

impl BackupKey {
    /// Build the key for an archive created at `timestamp` (local wall-clock time).
    ///
    /// Sub-second precision is dropped.
    pub fn for_timestamp(timestamp: NaiveDateTime) -> Self {
        let timestamp = timestamp.with_nanosecond(0).unwrap_or(timestamp);
        let key = format!(
            "{BACKUP_PREFIX}{}{ARCHIVE_SUFFIX}",
            timestamp.format(KEY_TIME_FORMAT)
        );
        Self { key, timestamp }
    }

    /// Key for an archive created right now, in the process's local time zone.
    pub fn now() -> Self {
        Self::for_timestamp(Local::now().naive_local())
    }

    /// Parse an object key back into its timestamp.
    pub fn parse(key: &str) -> Result<Self> {
        let stamp = key
            .strip_prefix(BACKUP_PREFIX)
            .and_then(|rest| rest.strip_suffix(ARCHIVE_SUFFIX))
            .ok_or_else(|| BackupError::InvalidKey(key.to_string()))?;

        let timestamp = NaiveDateTime::parse_from_str(stamp, KEY_TIME_FORMAT)
            .map_err(|e| BackupError::InvalidKey(format!("{key}: {e}")))?;

        // Reject non-canonical spellings such as unpadded fields.
        if timestamp.format(KEY_TIME_FORMAT).to_string() != stamp {
            return Err(BackupError::InvalidKey(key.to_string()));
        }

        Ok(Self {
            key: key.to_string(),
            timestamp,
        })
    }

    /// The full object key.
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Wall-clock time embedded in the key.
    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }

    /// Stem used for the local scratch file of this archive.
    pub(crate) fn scratch_prefix(&self) -> String {
        format!("{}.", self.key.trim_end_matches(ARCHIVE_SUFFIX))
    }
}

impl fmt::Display for BackupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl AsRef<str> for BackupKey {
    fn as_ref(&self) -> &str {
        &self.key
    }
}

/*!
Archive creation for world snapshots.

An archive is a gzip-compressed tar stream whose only top-level member is a
directory named `world`, holding a recursive copy of the source directory.
Archives are staged in a scratch directory and removed again when the
[`ScratchArchive`] handle is dropped, whatever the outcome of the upload.
*/

use chrono::NaiveDateTime;
use flate2::{write::GzEncoder, Compression};
use std::fs;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::naming::{BackupKey, ARCHIVE_ROOT, ARCHIVE_SUFFIX};
use crate::{BackupError, Result};

/// Snapshot abstraction for turning a directory into an uploadable archive
///
/// Implementations run on a blocking thread; they may do synchronous I/O.
pub trait Archiver: Send + Sync + 'static {
    /// Package `source` into an archive named after `timestamp`
    ///
    /// # Errors
    /// * `BackupError::SourceUnavailable` - If `source` is missing, not a directory or unreadable
    /// * `BackupError::Archive` - If writing the archive fails
    fn create_snapshot(&self, source: &Path, timestamp: NaiveDateTime) -> Result<ScratchArchive>;
}

/// A locally staged archive awaiting upload.
///
/// The file is deleted when this value is dropped.
#[derive(Debug)]
pub struct ScratchArchive {
    key: BackupKey,
    file: NamedTempFile,
    size_bytes: u64,
}

impl ScratchArchive {
    /// Object key the archive should be uploaded under
    pub fn key(&self) -> &BackupKey {
        &self.key
    }

    /// Location of the staged file
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Size of the compressed archive in bytes
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Remove the staged file, reporting any failure instead of ignoring it.
    pub fn close(self) -> Result<()> {
        let path = self.file.path().to_path_buf();
        self.file.close().map_err(|e| {
            warn!(path = %path.display(), error = %e, "Failed to remove scratch archive");
            BackupError::Io(e)
        })?;
        debug!(path = %path.display(), "Removed scratch archive");
        Ok(())
    }
}

/// Tar + gzip archiver
///
/// This implementation writes archives with the `tar` crate through a flate2
/// gzip encoder. Symlinks inside the source are stored as links, not followed.
///
/// # Example
/// ```rust,no_run
/// use worldvault_core::{Archiver, TarGzArchiver};
/// use std::path::Path;
///
/// let archiver = TarGzArchiver::new(std::env::temp_dir());
/// let archive = archiver.create_snapshot(
///     Path::new("/minecraft/survival"),
///     chrono::Local::now().naive_local(),
/// )?;
/// println!("{} ({} bytes)", archive.key(), archive.size_bytes());
/// # Ok::<(), worldvault_core::BackupError>(())
/// ```
#[derive(Debug, Clone)]
pub struct TarGzArchiver {
    scratch_dir: PathBuf,
    compression_level: Compression,
}

impl TarGzArchiver {
    /// Create an archiver staging files in `scratch_dir` with the default compression level (6)
    pub fn new<P: Into<PathBuf>>(scratch_dir: P) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            compression_level: Compression::default(),
        }
    }

    /// Use the specified gzip level (0-9, where 0 is no compression and 9 is maximum)
    pub fn with_level(mut self, level: u32) -> Self {
        self.compression_level = Compression::new(level);
        self
    }

    /// Directory where archives are staged
    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    fn check_source(source: &Path) -> Result<()> {
        let metadata = fs::metadata(source)
            .map_err(|e| BackupError::source_unavailable(source, e.to_string()))?;
        if !metadata.is_dir() {
            return Err(BackupError::source_unavailable(source, "not a directory"));
        }
        fs::read_dir(source).map_err(|e| BackupError::source_unavailable(source, e.to_string()))?;
        Ok(())
    }

    fn write_archive(&self, source: &Path, file: &fs::File) -> Result<()> {
        let encoder = GzEncoder::new(BufWriter::new(file), self.compression_level);
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);

        append_tree(&mut builder, source, Path::new(ARCHIVE_ROOT)).map_err(|e| {
            if e.kind() == io::ErrorKind::PermissionDenied {
                BackupError::source_unavailable(source, e.to_string())
            } else {
                BackupError::archive(format!("Failed to add {} to archive: {e}", source.display()))
            }
        })?;

        let encoder = builder
            .into_inner()
            .map_err(|e| BackupError::archive(format!("Failed to finish tar stream: {e}")))?;
        let mut writer = encoder
            .finish()
            .map_err(|e| BackupError::archive(format!("Failed to finish compression: {e}")))?;
        writer
            .flush()
            .map_err(|e| BackupError::archive(format!("Failed to flush archive: {e}")))?;
        Ok(())
    }
}

/// Append `dir` and everything below it under `name`
///
/// Entries are added in name order. Regular files are copied with exactly the
/// size recorded in their header, so a file that grows while it is read cannot
/// shift the members after it; one that shrinks fails the archive.
fn append_tree<W: Write>(builder: &mut tar::Builder<W>, dir: &Path, name: &Path) -> io::Result<()> {
    builder.append_dir(name, dir)?;

    let mut entries = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let member = name.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            builder.append_path_with_name(&path, &member)?;
        } else if file_type.is_dir() {
            append_tree(builder, &path, &member)?;
        } else if file_type.is_file() {
            append_file(builder, &path, &member)?;
        } else {
            warn!(path = %path.display(), "Skipping special file");
        }
    }
    Ok(())
}

fn append_file<W: Write>(builder: &mut tar::Builder<W>, path: &Path, member: &Path) -> io::Result<()> {
    let file = fs::File::open(path)?;
    let metadata = file.metadata()?;
    let size = metadata.len();

    let mut header = tar::Header::new_gnu();
    header.set_metadata_in_mode(&metadata, tar::HeaderMode::Complete);
    header.set_size(size);

    builder
        .append_data(&mut header, member, ExactLen::new(file, size))
        .map_err(|e| io::Error::new(e.kind(), format!("{}: {e}", path.display())))
}

/// Reader yielding exactly `len` bytes of `inner`, failing if it ends early
struct ExactLen<R> {
    inner: io::Take<R>,
    remaining: u64,
}

impl<R: Read> ExactLen<R> {
    fn new(inner: R, len: u64) -> Self {
        Self {
            inner: inner.take(len),
            remaining: len,
        }
    }
}

impl<R: Read> Read for ExactLen<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let n = self.inner.read(buf)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("file shrank while archiving, {} bytes missing", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

impl Archiver for TarGzArchiver {
    fn create_snapshot(&self, source: &Path, timestamp: NaiveDateTime) -> Result<ScratchArchive> {
        Self::check_source(source)?;

        let key = BackupKey::for_timestamp(timestamp);
        fs::create_dir_all(&self.scratch_dir)?;
        let file = tempfile::Builder::new()
            .prefix(&key.scratch_prefix())
            .suffix(ARCHIVE_SUFFIX)
            .tempfile_in(&self.scratch_dir)?;

        debug!(
            source = %source.display(),
            scratch = %file.path().display(),
            "Writing archive"
        );
        self.write_archive(source, file.as_file())?;

        let size_bytes = file.as_file().metadata()?.len();
        info!(key = %key, size_bytes, "Archive created");

        Ok(ScratchArchive {
            key,
            file,
            size_bytes,
        })
    }
}

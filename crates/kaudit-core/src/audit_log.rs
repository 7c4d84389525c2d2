//! Size-bounded, rotating, append-only record log.
//!
//! Each record is written as-is followed by a single `\n`. Once more than
//! `threshold` bytes have reached the active file it is renamed to the
//! rotated path and a fresh active file is started, so at most two
//! generations exist on disk.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// `rw-r-----`
pub const LOG_FILE_MODE: u32 = 0o640;

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("could not {op} {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("error writing audit record: {0}")]
    Write(#[source] io::Error),

    #[error("log rotation failed at {}: {source}", .path.display())]
    RotationFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("audit log has no open file")]
    Unavailable,
}

impl LogError {
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Io { source, .. } | Self::RotationFailed { source, .. } => source.raw_os_error(),
            Self::Write(e) => e.raw_os_error(),
            Self::Unavailable => Some(libc::EBADF),
        }
    }
}

// ---------------------------------------------------------------------------
// File opener
// ---------------------------------------------------------------------------

/// Creates the active log file, on open and after every rotation.
pub trait LogFileOpener {
    type File: Write;

    fn open(&self, path: &Path) -> io::Result<Self::File>;
}

/// Opens with `O_SYNC` so every accepted write is on disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncFileOpener;

impl LogFileOpener for SyncFileOpener {
    type File = fs::File;

    fn open(&self, path: &Path) -> io::Result<fs::File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(LOG_FILE_MODE)
            .custom_flags(libc::O_SYNC)
            .open(path)?;
        // The umask may have stripped bits from the creation mode.
        if let Err(e) = file.set_permissions(fs::Permissions::from_mode(LOG_FILE_MODE)) {
            tracing::warn!(path = %path.display(), "could not set audit log mode: {e}");
        }
        Ok(file)
    }
}

// ---------------------------------------------------------------------------
// Log
// ---------------------------------------------------------------------------

pub struct AuditLog<O: LogFileOpener = SyncFileOpener> {
    opener: O,
    file: Option<O::File>,
    bytes_written: u64,
    threshold: u64,
    active_path: PathBuf,
    rotated_path: PathBuf,
}

impl<O: LogFileOpener> std::fmt::Debug for AuditLog<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("active_path", &self.active_path)
            .field("rotated_path", &self.rotated_path)
            .field("bytes_written", &self.bytes_written)
            .field("threshold", &self.threshold)
            .field("open", &self.file.is_some())
            .finish()
    }
}

impl AuditLog<SyncFileOpener> {
    pub fn open(
        active_path: impl Into<PathBuf>,
        rotated_path: impl Into<PathBuf>,
        threshold: u64,
    ) -> Result<Self, LogError> {
        Self::open_with(SyncFileOpener, active_path, rotated_path, threshold)
    }
}

impl<O: LogFileOpener> AuditLog<O> {
    /// Open the active log, first moving a non-empty previous log aside.
    /// An empty existing file is reused.
    pub fn open_with(
        opener: O,
        active_path: impl Into<PathBuf>,
        rotated_path: impl Into<PathBuf>,
        threshold: u64,
    ) -> Result<Self, LogError> {
        let active_path = active_path.into();
        let rotated_path = rotated_path.into();

        match fs::metadata(&active_path) {
            Ok(meta) if meta.len() > 0 => {
                if let Err(source) = fs::rename(&active_path, &rotated_path) {
                    tracing::error!(
                        from = %active_path.display(),
                        to = %rotated_path.display(),
                        "could not move previous audit log aside: {source}"
                    );
                    return Err(LogError::Io {
                        op: "rename",
                        path: active_path,
                        source,
                    });
                }
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                tracing::error!(path = %active_path.display(), "could not stat audit log: {source}");
                return Err(LogError::Io {
                    op: "stat",
                    path: active_path,
                    source,
                });
            }
        }

        let file = match opener.open(&active_path) {
            Ok(file) => file,
            Err(source) => {
                tracing::error!(path = %active_path.display(), "could not open audit log: {source}");
                return Err(LogError::Io {
                    op: "open",
                    path: active_path,
                    source,
                });
            }
        };

        tracing::info!(
            path = %active_path.display(),
            rotated = %rotated_path.display(),
            threshold,
            "audit log opened"
        );
        Ok(Self {
            opener,
            file: Some(file),
            bytes_written: 0,
            threshold,
            active_path,
            rotated_path,
        })
    }

    /// Append one record followed by `\n`.
    ///
    /// A failed write does not end the record: the separator is still
    /// attempted and rotation is still evaluated. When both fail, the
    /// rotation error is returned.
    pub fn append(&mut self, record: &[u8]) -> Result<(), LogError> {
        let Some(file) = self.file.as_mut() else {
            return Err(LogError::Unavailable);
        };

        let mut outcome = Ok(());
        let mut remaining = record;
        while !remaining.is_empty() {
            match file.write(remaining) {
                Ok(0) => {
                    outcome = Err(io::Error::from(io::ErrorKind::WriteZero));
                    break;
                }
                Ok(n) => {
                    self.bytes_written += n as u64;
                    remaining = &remaining[n..];
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        if let Err(e) = &outcome {
            tracing::error!(
                path = %self.active_path.display(),
                unwritten = remaining.len(),
                "error writing audit record: {e}"
            );
        }

        // Errors here are usually the same failure as above.
        match file.write(b"\n") {
            Ok(n) => self.bytes_written += n as u64,
            Err(e) => tracing::debug!("record separator not written: {e}"),
        }

        if self.bytes_written > self.threshold {
            self.rotate()?;
        }
        outcome.map_err(LogError::Write)
    }

    pub fn append_str(&mut self, record: &str) -> Result<(), LogError> {
        self.append(record.as_bytes())
    }

    /// Move the active file to the rotated path and start a new one.
    ///
    /// If the rename fails the current file stays in use. If the reopen
    /// fails the log has no file and later appends return
    /// [`LogError::Unavailable`].
    pub fn rotate(&mut self) -> Result<(), LogError> {
        if let Err(source) = fs::rename(&self.active_path, &self.rotated_path) {
            tracing::error!(
                from = %self.active_path.display(),
                to = %self.rotated_path.display(),
                "could not rotate audit log: {source}"
            );
            return Err(LogError::RotationFailed {
                path: self.rotated_path.clone(),
                source,
            });
        }

        drop(self.file.take());
        let rotated_bytes = std::mem::take(&mut self.bytes_written);

        match self.opener.open(&self.active_path) {
            Ok(file) => {
                self.file = Some(file);
                tracing::info!(
                    path = %self.rotated_path.display(),
                    bytes = rotated_bytes,
                    "audit log rotated"
                );
                Ok(())
            }
            Err(source) => {
                tracing::error!(
                    path = %self.active_path.display(),
                    "could not reopen audit log after rotation: {source}"
                );
                Err(LogError::RotationFailed {
                    path: self.active_path.clone(),
                    source,
                })
            }
        }
    }

    /// Flush and release the file.
    pub fn close(mut self) -> Result<(), LogError> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        file.flush().map_err(|source| LogError::Io {
            op: "flush",
            path: self.active_path.clone(),
            source,
        })
    }

    /// Bytes in the active file since it was opened or last rotated.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn active_path(&self) -> &Path {
        &self.active_path
    }

    pub fn rotated_path(&self) -> &Path {
        &self.rotated_path
    }

    pub fn is_available(&self) -> bool {
        self.file.is_some()
    }
}

use std::io;
use thiserror::Error;

/// Failure taxonomy for the storage and autosave layers.
///
/// Every host or I/O failure is classified into one of these variants before
/// it crosses a module boundary; callers branch on [`StorageError::kind`]
/// rather than matching message text.
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Storage full: {0}")]
    StorageFull(String),

    #[error("File locked: {0}")]
    FileLocked(String),

    #[error("Stale directory handle: {0}")]
    StaleHandle(String),

    #[error("Data missing: {0}")]
    DataMissing(String),

    #[error("Write rejected: {0}")]
    WriteRejected(String),

    #[error("Storage error: {0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Severity attached to messages routed through an [`ErrorCallback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// Callback contract for every user-facing failure or advisory.
pub type ErrorCallback = std::sync::Arc<dyn Fn(&str, Severity) + Send + Sync>;

impl StorageError {
    /// Stable kind label, used as the histogram key in persisted statistics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PermissionDenied(_) => "permission",
            Self::Network(_) => "network",
            Self::StorageFull(_) => "storage-full",
            Self::FileLocked(_) => "file-locked",
            Self::StaleHandle(_) => "stale-handle",
            Self::DataMissing(_) => "data-missing",
            Self::WriteRejected(_) => "write-rejected",
            Self::Unknown(_) => "unknown",
        }
    }

    /// Whether the failure can be cured without abandoning autosave:
    /// permission can be re-prompted, a stale handle re-acquired, transient
    /// classes retried. Storage-full cannot.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::StorageFull(_))
    }

    /// Whether a retry with backoff is worthwhile. Permission failures are
    /// recoverable but handled by the permission watcher, and a rejected
    /// write means another attempt is already in flight.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::FileLocked(_) | Self::StaleHandle(_) | Self::Unknown(_)
        )
    }

    /// Actionable guidance surfaced alongside the failure.
    pub fn suggested_action(&self) -> &'static str {
        match self {
            Self::PermissionDenied(_) => {
                "Re-grant access to the storage folder to resume saving"
            }
            Self::Network(_) => "Check the connection to the storage location",
            Self::StorageFull(_) => "Free up disk space, then save manually",
            Self::FileLocked(_) => "Close other programs using the case file",
            Self::StaleHandle(_) => "Re-select the storage folder",
            Self::DataMissing(_) => "Choose a storage folder before saving",
            Self::WriteRejected(_) => "A save is already in progress; changes will be retried",
            Self::Unknown(_) => "Retry the save; reselect the folder if it keeps failing",
        }
    }

    /// Classify a raw I/O failure into the taxonomy.
    pub fn from_io(context: &str, err: &io::Error) -> Self {
        // ENOSPC has no stable ErrorKind; match the raw errno.
        if err.raw_os_error() == Some(28) {
            return Self::StorageFull(format!("{context}: {err}"));
        }
        match err.kind() {
            io::ErrorKind::PermissionDenied => {
                Self::PermissionDenied(format!("{context}: {err}"))
            }
            io::ErrorKind::NotFound => Self::DataMissing(format!("{context}: {err}")),
            io::ErrorKind::WouldBlock => Self::FileLocked(format!("{context}: {err}")),
            io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe => Self::Network(format!("{context}: {err}")),
            _ => Self::Unknown(format!("{context}: {err}")),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Unknown(format!("Serialization error: {err}"))
    }
}

impl<T> From<std::sync::PoisonError<T>> for StorageError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Unknown(format!("Lock poisoned: {err}"))
    }
}

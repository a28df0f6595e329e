//! Host capability abstraction: permission-gated access to one user-chosen
//! directory, with typed errors for the conditions the service must react to
//! (notably stale directory handles).

use crate::core::{Result, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Permission of the current instance against a directory reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionState {
    Granted,
    Denied,
    Prompt,
    Unsupported,
    Unknown,
}

impl PermissionState {
    pub fn is_granted(self) -> bool {
        self == Self::Granted
    }
}

/// Opaque capability for one chosen directory.
///
/// Exclusively owned by one `StorageService`; may go stale between calls and
/// must be re-derived through [`StorageHost::refresh`] rather than cached
/// long-term. Serializable so it can be persisted across sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryReference {
    path: PathBuf,
    acquired_at: DateTime<Utc>,
}

impl DirectoryReference {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            acquired_at: Utc::now(),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Stable identity for scoping persisted config/statistics to this
    /// directory.
    pub fn identity_key(&self) -> String {
        self.path
            .to_string_lossy()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

/// Picker supplied by the UI layer; returns `None` when the user cancels.
pub type DirectoryPicker = Arc<dyn Fn() -> Option<PathBuf> + Send + Sync>;

/// The host surface the storage service runs against.
///
/// All failures are typed [`StorageError`] variants; implementations must
/// report a vanished directory as `StaleHandle` so callers can re-acquire
/// through [`StorageHost::refresh`] on that condition only.
#[async_trait]
pub trait StorageHost: Send + Sync {
    /// Whether this host can prompt the user for a directory at all.
    fn supports_directory_picker(&self) -> bool;

    /// Ask the user to choose a directory. `Ok(None)` means cancellation.
    async fn pick_directory(&self) -> Result<Option<DirectoryReference>>;

    async fn query_permission(&self, dir: &DirectoryReference) -> PermissionState;

    /// Attempt to elevate to readwrite access.
    async fn request_permission(&self, dir: &DirectoryReference) -> PermissionState;

    /// Re-derive a fresh reference for the same directory.
    async fn refresh(&self, dir: &DirectoryReference) -> Result<DirectoryReference>;

    /// Read a file under the directory. `Ok(None)` means the file is absent.
    async fn read(&self, dir: &DirectoryReference, name: &str) -> Result<Option<Vec<u8>>>;

    /// Atomically replace a file under the directory.
    async fn write(&self, dir: &DirectoryReference, name: &str, bytes: &[u8]) -> Result<()>;
}

/// Native filesystem host.
///
/// Directory picking delegates to an injected closure (the application's file
/// dialog); permission is probed from filesystem metadata. Writes go through
/// a temp file in the target directory followed by an atomic rename.
pub struct FsHost {
    picker: Option<DirectoryPicker>,
}

impl FsHost {
    /// Host without a picker; `connect` is unsupported, restored references
    /// still work.
    pub fn new() -> Self {
        Self { picker: None }
    }

    /// Host whose picker always yields the given directory.
    pub fn fixed(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self::with_picker(move || Some(path.clone()))
    }

    pub fn with_picker(picker: impl Fn() -> Option<PathBuf> + Send + Sync + 'static) -> Self {
        Self {
            picker: Some(Arc::new(picker)),
        }
    }
}

impl Default for FsHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageHost for FsHost {
    fn supports_directory_picker(&self) -> bool {
        self.picker.is_some()
    }

    async fn pick_directory(&self) -> Result<Option<DirectoryReference>> {
        let picker = self.picker.as_ref().ok_or_else(|| {
            StorageError::Unknown("No directory picker configured for this host".into())
        })?;
        Ok(picker().map(DirectoryReference::new))
    }

    async fn query_permission(&self, dir: &DirectoryReference) -> PermissionState {
        match fs::metadata(dir.path()).await {
            Ok(md) if !md.is_dir() => PermissionState::Unknown,
            Ok(md) if md.permissions().readonly() => PermissionState::Denied,
            Ok(_) => PermissionState::Granted,
            Err(err) if err.kind() == io::ErrorKind::NotFound => PermissionState::Prompt,
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => PermissionState::Denied,
            Err(_) => PermissionState::Unknown,
        }
    }

    async fn request_permission(&self, dir: &DirectoryReference) -> PermissionState {
        if let Err(err) = fs::create_dir_all(dir.path()).await {
            return if err.kind() == io::ErrorKind::PermissionDenied {
                PermissionState::Denied
            } else {
                PermissionState::Unknown
            };
        }
        // Readwrite is only proven by writing.
        let probe = dir.path().join(".write-probe");
        match fs::write(&probe, b"probe").await {
            Ok(()) => {
                let _ = fs::remove_file(&probe).await;
                PermissionState::Granted
            }
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => PermissionState::Denied,
            Err(_) => PermissionState::Unknown,
        }
    }

    async fn refresh(&self, dir: &DirectoryReference) -> Result<DirectoryReference> {
        match fs::metadata(dir.path()).await {
            Ok(md) if md.is_dir() => Ok(DirectoryReference::new(dir.path())),
            Ok(_) => Err(StorageError::StaleHandle(format!(
                "'{}' is no longer a directory",
                dir.path().display()
            ))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::StaleHandle(format!(
                    "Directory '{}' no longer exists",
                    dir.path().display()
                )))
            }
            Err(err) => Err(StorageError::from_io("Refreshing directory reference", &err)),
        }
    }

    async fn read(&self, dir: &DirectoryReference, name: &str) -> Result<Option<Vec<u8>>> {
        if let Err(err) = fs::metadata(dir.path()).await {
            if err.kind() == io::ErrorKind::NotFound {
                return Err(StorageError::StaleHandle(format!(
                    "Directory '{}' no longer exists",
                    dir.path().display()
                )));
            }
            return Err(StorageError::from_io("Opening directory", &err));
        }
        match fs::read(dir.path().join(name)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::from_io("Reading file", &err)),
        }
    }

    async fn write(&self, dir: &DirectoryReference, name: &str, bytes: &[u8]) -> Result<()> {
        let final_path = dir.path().join(name);
        let tmp_path = dir.path().join(format!("{name}.tmp"));

        let mut file = match fs::File::create(&tmp_path).await {
            Ok(file) => file,
            // A vanished directory is the stale-handle condition, not a
            // missing-file condition.
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::StaleHandle(format!(
                    "Directory '{}' no longer exists",
                    dir.path().display()
                )));
            }
            Err(err) => return Err(StorageError::from_io("Creating temp file", &err)),
        };

        file.write_all(bytes)
            .await
            .map_err(|err| StorageError::from_io("Writing file", &err))?;
        file.flush()
            .await
            .map_err(|err| StorageError::from_io("Flushing file", &err))?;
        file.sync_all()
            .await
            .map_err(|err| StorageError::from_io("Syncing file", &err))?;
        drop(file);

        fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|err| StorageError::from_io("Committing file", &err))
    }
}

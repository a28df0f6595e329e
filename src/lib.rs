//! Local persistence layer for a case-management application.
//!
//! Two pieces: a permission-gated [`StorageService`] performing atomic
//! document I/O with validation/repair against one user-chosen directory,
//! and an [`AutosaveCoordinator`] handling debounced scheduling, classified
//! retry with backoff, cross-instance awareness, permission watching, and
//! persisted configuration/statistics.
//!
//! # Examples
//!
//! ```no_run
//! use casevault::{
//!     AutosaveConfigPatch, AutosaveCoordinator, ErrorCallback, FsHost, LocalStore, SaveBus,
//!     StorageService,
//! };
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> casevault::Result<()> {
//! let on_error: ErrorCallback = Arc::new(|message, _severity| eprintln!("{message}"));
//! let store = LocalStore::open("app-data/local-state.json");
//!
//! let storage = Arc::new(StorageService::new(
//!     Arc::new(FsHost::fixed("/home/user/cases")),
//!     store.clone(),
//!     on_error.clone(),
//! ));
//! if !storage.connect().await {
//!     return Ok(());
//! }
//!
//! let coordinator = AutosaveCoordinator::new(
//!     store,
//!     SaveBus::new(),
//!     storage.directory_key().unwrap_or_default(),
//!     AutosaveConfigPatch::default(),
//!     on_error,
//! )?;
//! coordinator
//!     .initialize(
//!         storage,
//!         Arc::new(|| serde_json::json!({ "cases": [] })),
//!         Arc::new(|event| println!("{}: {}", event.status, event.message)),
//!     )
//!     .await;
//!
//! coordinator.notify_data_change("case edited");
//! # Ok(())
//! # }
//! ```

pub mod autosave;
pub mod core;
pub mod storage;

// Re-export main types for convenience
pub use autosave::{
    AutosaveConfig, AutosaveConfigPatch, AutosaveCoordinator, AutosaveStatistics,
    CoordinatorStatus, DataProvider, RunState, SaveBus, SaveOptions, SaveStatus, StatusCallback,
    StatusEvent,
};
pub use crate::core::{
    Document, ErrorCallback, InstanceId, Result, Severity, StorageError, validate_and_repair,
};
pub use storage::{
    DOCUMENT_FILE, DirectoryReference, FsHost, LastSaveEntry, LocalStore, PermissionState,
    SERVICE_NAME, StorageHost, StorageService,
};

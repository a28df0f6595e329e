//! Permission-gated atomic document I/O against one user-chosen directory.

use crate::core::{
    Document, ErrorCallback, InstanceId, Result, Severity, StorageError, validate_and_repair,
};
use crate::storage::host::{DirectoryReference, PermissionState, StorageHost};
use crate::storage::local_store::{LocalStore, keys};
use crate::storage::locks::{InstanceWriteGuard, WriteLockRegistry};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

/// Service identity used to namespace persisted local entries.
pub const SERVICE_NAME: &str = "case-storage";

/// Default document file name under the chosen directory.
pub const DOCUMENT_FILE: &str = "case-data.json";

/// Shared local entry recording the most recent successful write, so sibling
/// instances can see who saved last.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastSaveEntry {
    pub timestamp: DateTime<Utc>,
    pub instance_id: InstanceId,
}

/// Turns the in-memory document into durable bytes under a granted directory,
/// and back.
///
/// The write and connect paths never raise across this boundary: every
/// failure funnels through the injected error callback plus a boolean
/// return. The read path re-raises for every failure except an absent file.
pub struct StorageService {
    host: Arc<dyn StorageHost>,
    store: LocalStore,
    on_error: ErrorCallback,
    file_name: String,
    instance_id: InstanceId,
    directory: Mutex<Option<DirectoryReference>>,
    writing: Arc<AtomicBool>,
    last_error: Mutex<Option<StorageError>>,
}

impl StorageService {
    pub fn new(host: Arc<dyn StorageHost>, store: LocalStore, on_error: ErrorCallback) -> Self {
        Self {
            host,
            store,
            on_error,
            file_name: DOCUMENT_FILE.to_string(),
            instance_id: InstanceId::generate(),
            directory: Mutex::new(None),
            writing: Arc::new(AtomicBool::new(false)),
            last_error: Mutex::new(None),
        }
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = name.into();
        self
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.store
    }

    pub fn has_directory(&self) -> bool {
        self.current_directory().is_some()
    }

    /// Identity key of the connected directory, for scoping persisted
    /// config/statistics.
    pub fn directory_key(&self) -> Option<String> {
        self.current_directory().map(|d| d.identity_key())
    }

    /// Most recent classified write-path failure, for callers that only see
    /// the boolean return.
    pub fn last_error(&self) -> Option<StorageError> {
        self.last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Ask the user to choose a directory and persist the granted reference.
    ///
    /// Returns `false` without an error on user cancellation; every other
    /// failure is routed through the error callback.
    pub async fn connect(&self) -> bool {
        if !self.host.supports_directory_picker() {
            (self.on_error)(
                "Folder selection is not available on this system",
                Severity::Info,
            );
            return false;
        }

        let picked = match self.host.pick_directory().await {
            Ok(Some(dir)) => dir,
            Ok(None) => return false,
            Err(err) => {
                self.fail(err);
                return false;
            }
        };

        let state = self.host.request_permission(&picked).await;
        if !state.is_granted() {
            self.fail(StorageError::PermissionDenied(format!(
                "Access to '{}' was not granted",
                picked.path().display()
            )));
            return false;
        }

        if let Err(err) = self.store.set(&keys::directory(SERVICE_NAME), &picked) {
            self.fail(err);
            return false;
        }
        self.set_directory(Some(picked));
        true
    }

    pub async fn check_permission(&self) -> PermissionState {
        match self.current_directory() {
            Some(dir) => self.host.query_permission(&dir).await,
            None => PermissionState::Unknown,
        }
    }

    pub async fn request_permission(&self) -> PermissionState {
        match self.current_directory() {
            Some(dir) => self.host.request_permission(&dir).await,
            None => PermissionState::Unknown,
        }
    }

    /// Durably write the document, guarded by the two-tier save lock.
    ///
    /// If either lock tier is held the call returns `false` immediately —
    /// no queueing, the caller re-triggers. The directory handle is acquired
    /// fresh for this call; on the stale-handle failure class the write is
    /// retried exactly once with a re-acquired reference.
    pub async fn write_file(&self, data: Value) -> bool {
        let Some(_instance_guard) = InstanceWriteGuard::try_acquire(&self.writing) else {
            debug!("Write rejected: this instance already has a save in flight");
            self.record(StorageError::WriteRejected(
                "A save is already in progress in this instance".into(),
            ));
            return false;
        };

        let Some(dir) = self.current_directory() else {
            self.fail(StorageError::DataMissing(
                "No storage folder has been selected".into(),
            ));
            return false;
        };

        let resource = format!("{}/{}", dir.identity_key(), self.file_name);
        let Some(_resource_guard) = WriteLockRegistry::global().try_acquire(&resource) else {
            debug!("Write rejected: '{resource}' is being written elsewhere in this process");
            self.record(StorageError::WriteRejected(format!(
                "'{}' is already being written",
                self.file_name
            )));
            return false;
        };

        let repaired = validate_and_repair(data);
        let serialized = match repaired.to_pretty_json() {
            Ok(text) => text,
            Err(err) => {
                self.fail(err.into());
                return false;
            }
        };

        // Handles are never cached across calls; the host opens a fresh one
        // per write.
        match self.host.write(&dir, &self.file_name, serialized.as_bytes()).await {
            Ok(()) => {}
            Err(StorageError::StaleHandle(msg)) => {
                warn!("Stale directory handle, re-acquiring once: {msg}");
                let refreshed = match self.host.refresh(&dir).await {
                    Ok(fresh) => fresh,
                    Err(err) => {
                        self.fail(err);
                        return false;
                    }
                };
                if let Err(err) = self
                    .host
                    .write(&refreshed, &self.file_name, serialized.as_bytes())
                    .await
                {
                    self.fail(err);
                    return false;
                }
                self.set_directory(Some(refreshed));
            }
            Err(err) => {
                self.fail(err);
                return false;
            }
        }

        let entry = LastSaveEntry {
            timestamp: Utc::now(),
            instance_id: self.instance_id,
        };
        if let Err(err) = self.store.set(&keys::last_save(SERVICE_NAME), &entry) {
            // The document itself is durable; the shared entry is advisory.
            warn!("Failed to record last-save entry: {err}");
        }

        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = None;
        true
    }

    /// Read and repair the stored document.
    ///
    /// An absent file is a normal startup state and yields `Ok(None)`; every
    /// other failure is reported through the callback and re-raised.
    pub async fn read_file(&self) -> Result<Option<Document>> {
        let Some(dir) = self.current_directory() else {
            let err = StorageError::DataMissing("No storage folder has been selected".into());
            self.report(&err);
            return Err(err);
        };

        let state = self.host.query_permission(&dir).await;
        if !state.is_granted() {
            let err = StorageError::PermissionDenied(format!(
                "Read access to '{}' is not granted",
                dir.path().display()
            ));
            self.report(&err);
            return Err(err);
        }

        match self.host.read(&dir, &self.file_name).await {
            Ok(None) => Ok(None),
            Ok(Some(bytes)) => match Document::parse(&bytes) {
                Ok(doc) => Ok(Some(doc)),
                Err(err) => {
                    let err: StorageError = err.into();
                    self.report(&err);
                    Err(err)
                }
            },
            Err(err) => {
                self.report(&err);
                Err(err)
            }
        }
    }

    /// Recover a previously granted reference from the local store without
    /// prompting. Clears the stored reference when recovery fails.
    pub async fn restore_last_directory_access(
        &self,
    ) -> (Option<DirectoryReference>, PermissionState) {
        let Some(saved) = self
            .store
            .get::<DirectoryReference>(&keys::directory(SERVICE_NAME))
        else {
            return (None, PermissionState::Unknown);
        };

        match self.host.refresh(&saved).await {
            Ok(fresh) => {
                let state = self.host.query_permission(&fresh).await;
                self.set_directory(Some(fresh.clone()));
                (Some(fresh), state)
            }
            Err(err) => {
                warn!("Stored directory reference could not be restored: {err}");
                if let Err(err) = self.store.remove(&keys::directory(SERVICE_NAME)) {
                    warn!("Failed to clear stored directory reference: {err}");
                }
                (None, PermissionState::Unknown)
            }
        }
    }

    /// Write an auxiliary file (export, backup) next to the document, through
    /// the same error funnel. Guarded by the process-wide registry only; the
    /// document save lock is not involved.
    pub async fn write_auxiliary_file(&self, name: &str, bytes: &[u8]) -> bool {
        let Some(dir) = self.current_directory() else {
            self.fail(StorageError::DataMissing(
                "No storage folder has been selected".into(),
            ));
            return false;
        };

        let resource = format!("{}/{}", dir.identity_key(), name);
        let Some(_guard) = WriteLockRegistry::global().try_acquire(&resource) else {
            self.record(StorageError::WriteRejected(format!(
                "'{name}' is already being written"
            )));
            return false;
        };

        match self.host.write(&dir, name, bytes).await {
            Ok(()) => true,
            Err(err) => {
                self.fail(err);
                false
            }
        }
    }

    fn current_directory(&self) -> Option<DirectoryReference> {
        self.directory
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_directory(&self, dir: Option<DirectoryReference>) {
        *self.directory.lock().unwrap_or_else(|e| e.into_inner()) = dir;
    }

    fn record(&self, err: StorageError) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err);
    }

    fn report(&self, err: &StorageError) {
        (self.on_error)(&err.to_string(), Severity::Error);
    }

    fn fail(&self, err: StorageError) {
        warn!("Storage failure ({}): {err}", err.kind());
        self.report(&err);
        self.record(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::host::FsHost;
    use serde_json::json;
    use tempfile::TempDir;

    fn collecting_callback() -> (ErrorCallback, Arc<Mutex<Vec<(String, Severity)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb: ErrorCallback = Arc::new(move |msg, severity| {
            sink.lock().unwrap().push((msg.to_string(), severity));
        });
        (cb, seen)
    }

    fn service_for(tmp: &TempDir) -> (StorageService, Arc<Mutex<Vec<(String, Severity)>>>) {
        let (cb, seen) = collecting_callback();
        let host = Arc::new(FsHost::fixed(tmp.path().join("vault")));
        let store = LocalStore::open(tmp.path().join("local-state.json"));
        (StorageService::new(host, store, cb), seen)
    }

    #[tokio::test]
    async fn connect_persists_reference_and_grants() {
        let tmp = TempDir::new().unwrap();
        let (service, errors) = service_for(&tmp);

        assert!(service.connect().await);
        assert!(service.has_directory());
        assert!(service.check_permission().await.is_granted());
        assert!(errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn write_repairs_before_persisting() {
        let tmp = TempDir::new().unwrap();
        let (service, _) = service_for(&tmp);
        service.connect().await;

        let wrote = service
            .write_file(json!({
                "cases": [],
                "people": [{"id": null, "name": "X"}],
            }))
            .await;
        assert!(wrote);

        let doc = service.read_file().await.unwrap().unwrap();
        assert!(doc.cases.is_empty());
        assert!(doc.people.is_empty());
    }

    #[tokio::test]
    async fn write_records_last_save_entry() {
        let tmp = TempDir::new().unwrap();
        let (service, _) = service_for(&tmp);
        service.connect().await;

        assert!(service.write_file(json!({"cases": []})).await);

        let entry: LastSaveEntry = service
            .local_store()
            .get(&keys::last_save(SERVICE_NAME))
            .unwrap();
        assert_eq!(entry.instance_id, service.instance_id());
    }

    #[tokio::test]
    async fn held_resource_lock_rejects_write() {
        let tmp = TempDir::new().unwrap();
        let (service, _) = service_for(&tmp);
        service.connect().await;

        let resource = format!("{}/{}", service.directory_key().unwrap(), DOCUMENT_FILE);
        let _guard = WriteLockRegistry::global().try_acquire(&resource).unwrap();

        assert!(!service.write_file(json!({"cases": []})).await);
        assert_eq!(service.last_error().unwrap().kind(), "write-rejected");
    }

    #[tokio::test]
    async fn write_without_directory_reports() {
        let tmp = TempDir::new().unwrap();
        let (service, errors) = service_for(&tmp);

        assert!(!service.write_file(json!({"cases": []})).await);
        assert_eq!(service.last_error().unwrap().kind(), "data-missing");
        assert_eq!(errors.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn absent_file_reads_as_none() {
        let tmp = TempDir::new().unwrap();
        let (service, _) = service_for(&tmp);
        service.connect().await;

        assert!(service.read_file().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn restore_recovers_persisted_reference() {
        let tmp = TempDir::new().unwrap();
        let (service, _) = service_for(&tmp);
        service.connect().await;
        assert!(service.write_file(json!({"cases": [{"id": "c-1"}]})).await);

        // A later session against the same local store, without a picker.
        let (cb, _) = collecting_callback();
        let revived = StorageService::new(
            Arc::new(FsHost::new()),
            LocalStore::open(tmp.path().join("local-state.json")),
            cb,
        );
        let (dir, state) = revived.restore_last_directory_access().await;
        assert!(dir.is_some());
        assert!(state.is_granted());
        assert_eq!(revived.read_file().await.unwrap().unwrap().cases.len(), 1);
    }

    #[tokio::test]
    async fn restore_clears_dead_reference() {
        let tmp = TempDir::new().unwrap();
        let (service, _) = service_for(&tmp);
        service.connect().await;

        std::fs::remove_dir_all(tmp.path().join("vault")).unwrap();

        let (dir, state) = service.restore_last_directory_access().await;
        assert!(dir.is_none());
        assert_eq!(state, PermissionState::Unknown);
        assert!(
            service
                .local_store()
                .get::<DirectoryReference>(&keys::directory(SERVICE_NAME))
                .is_none()
        );
    }

    #[tokio::test]
    async fn auxiliary_write_lands_next_to_document() {
        let tmp = TempDir::new().unwrap();
        let (service, _) = service_for(&tmp);
        service.connect().await;

        assert!(service.write_auxiliary_file("export.csv", b"id,title\n").await);
        assert!(tmp.path().join("vault").join("export.csv").exists());
    }

    #[tokio::test]
    async fn cancelled_picker_is_silent() {
        let tmp = TempDir::new().unwrap();
        let (cb, errors) = collecting_callback();
        let host = Arc::new(FsHost::with_picker(|| None));
        let store = LocalStore::open(tmp.path().join("local-state.json"));
        let service = StorageService::new(host, store, cb);

        assert!(!service.connect().await);
        assert!(errors.lock().unwrap().is_empty());
    }
}

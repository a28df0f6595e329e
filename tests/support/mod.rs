#![allow(dead_code)]

use async_trait::async_trait;
use casevault::{DirectoryReference, PermissionState, StorageError, StorageHost};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Scriptable in-memory host: permission state is settable, write outcomes
/// can be queued, and writes can be slowed down to hold the lock window open.
pub struct ScriptedHost {
    path: PathBuf,
    files: Mutex<HashMap<String, Vec<u8>>>,
    permission: Mutex<PermissionState>,
    write_outcomes: Mutex<VecDeque<StorageError>>,
    write_delay: Mutex<Option<Duration>>,
    fail_next_refresh: AtomicBool,
    pub write_attempts: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    write_times: Mutex<Vec<Instant>>,
}

impl ScriptedHost {
    pub fn new() -> Arc<Self> {
        // Unique per host so the process-wide lock registry never sees
        // collisions between unrelated tests.
        let path = PathBuf::from(format!("/scripted/{}", uuid::Uuid::new_v4()));
        Arc::new(Self {
            path,
            files: Mutex::new(HashMap::new()),
            permission: Mutex::new(PermissionState::Granted),
            write_outcomes: Mutex::new(VecDeque::new()),
            write_delay: Mutex::new(None),
            fail_next_refresh: AtomicBool::new(false),
            write_attempts: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            write_times: Mutex::new(Vec::new()),
        })
    }

    pub fn dir(&self) -> DirectoryReference {
        DirectoryReference::new(&self.path)
    }

    pub fn set_permission(&self, state: PermissionState) {
        *self.permission.lock().unwrap() = state;
    }

    /// Queue a failure for the next write attempt; once the queue is empty,
    /// writes succeed.
    pub fn push_write_error(&self, err: StorageError) {
        self.write_outcomes.lock().unwrap().push_back(err);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock().unwrap() = Some(delay);
    }

    pub fn fail_next_refresh(&self) {
        self.fail_next_refresh.store(true, Ordering::SeqCst);
    }

    pub fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(name).cloned()
    }

    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn write_times(&self) -> Vec<Instant> {
        self.write_times.lock().unwrap().clone()
    }
}

#[async_trait]
impl StorageHost for ScriptedHost {
    fn supports_directory_picker(&self) -> bool {
        true
    }

    async fn pick_directory(&self) -> casevault::Result<Option<DirectoryReference>> {
        Ok(Some(self.dir()))
    }

    async fn query_permission(&self, _dir: &DirectoryReference) -> PermissionState {
        *self.permission.lock().unwrap()
    }

    async fn request_permission(&self, _dir: &DirectoryReference) -> PermissionState {
        *self.permission.lock().unwrap()
    }

    async fn refresh(&self, dir: &DirectoryReference) -> casevault::Result<DirectoryReference> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_refresh.swap(false, Ordering::SeqCst) {
            return Err(StorageError::StaleHandle(
                "Directory can no longer be resolved".into(),
            ));
        }
        Ok(DirectoryReference::new(dir.path()))
    }

    async fn read(
        &self,
        _dir: &DirectoryReference,
        name: &str,
    ) -> casevault::Result<Option<Vec<u8>>> {
        Ok(self.files.lock().unwrap().get(name).cloned())
    }

    async fn write(
        &self,
        _dir: &DirectoryReference,
        name: &str,
        bytes: &[u8],
    ) -> casevault::Result<()> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        self.write_times.lock().unwrap().push(Instant::now());

        let delay = *self.write_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.write_outcomes.lock().unwrap().pop_front();
        if let Some(err) = scripted {
            return Err(err);
        }

        self.files
            .lock()
            .unwrap()
            .insert(name.to_string(), bytes.to_vec());
        Ok(())
    }
}

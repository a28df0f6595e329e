//! Debounced save scheduling, failure classification and retry, permission
//! watching, cross-instance awareness, and persisted config/statistics.
//!
//! Every trigger (change notification, periodic timer, visibility loss,
//! retry, manual request) funnels through one save path. Timer-driven
//! triggers spawn detached save tasks so that cancelling a timer never
//! cancels a write mid-flight.

use crate::autosave::bus::{SaveBus, SaveEvent};
use crate::autosave::config::{AutosaveConfig, AutosaveConfigPatch};
use crate::autosave::stats::AutosaveStatistics;
use crate::autosave::status::{
    CoordinatorStatus, DataProvider, RunState, SaveStatus, StatusCallback, StatusEvent,
};
use crate::core::{ErrorCallback, InstanceId, Result, Severity, StorageError};
use crate::storage::host::PermissionState;
use crate::storage::local_store::{LocalStore, keys};
use crate::storage::service::StorageService;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Options for the single save funnel.
#[derive(Debug, Clone, Copy, Default)]
pub struct SaveOptions {
    /// Bypass the content fingerprint and the paused state; resets the
    /// permission-failure counter (a fresh, user-initiated attempt).
    pub force: bool,
    /// Bypass the minimum inter-save interval.
    pub skip_throttle: bool,
}

impl SaveOptions {
    /// Un-throttled but otherwise ordinary save.
    pub fn immediate() -> Self {
        Self {
            force: false,
            skip_throttle: true,
        }
    }

    /// Manual save: un-throttled and unconditional.
    pub fn forced() -> Self {
        Self {
            force: true,
            skip_throttle: true,
        }
    }
}

#[derive(Default)]
struct TaskHandles {
    periodic: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
    debounce: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
}

impl TaskHandles {
    fn abort_all(&mut self) {
        for handle in [
            self.periodic.take(),
            self.watcher.take(),
            self.listener.take(),
            self.debounce.take(),
            self.retry.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

struct Inner {
    config: Mutex<AutosaveConfig>,
    stats: Mutex<AutosaveStatistics>,
    directory_key: String,
    store: LocalStore,
    bus: SaveBus,
    instance: Mutex<InstanceId>,
    on_error: ErrorCallback,
    storage: Mutex<Option<Arc<StorageService>>>,
    provider: Mutex<Option<DataProvider>>,
    on_status: Mutex<Option<StatusCallback>>,
    run_state: Mutex<RunState>,
    enabled: AtomicBool,
    save_in_progress: AtomicBool,
    pending_save: AtomicBool,
    debounce_generation: AtomicU64,
    consecutive_failures: AtomicU32,
    permission_failures: AtomicU32,
    last_fingerprint: Mutex<Option<u64>>,
    last_attempt_at: Mutex<Option<Instant>>,
    last_save_at: Mutex<Option<DateTime<Utc>>>,
    next_save_at: Mutex<Option<DateTime<Utc>>>,
    last_permission: Mutex<PermissionState>,
    tasks: Mutex<TaskHandles>,
}

/// Schedules and supervises saves of the application document.
///
/// Construction resolves config and statistics from the local store; the
/// coordinator is inert until [`AutosaveCoordinator::initialize`] wires the
/// storage service, the data provider and the status callback.
pub struct AutosaveCoordinator {
    inner: Arc<Inner>,
}

impl AutosaveCoordinator {
    pub fn new(
        store: LocalStore,
        bus: SaveBus,
        directory_key: impl Into<String>,
        overrides: AutosaveConfigPatch,
        on_error: ErrorCallback,
    ) -> Result<Self> {
        let directory_key = directory_key.into();
        let persisted: Option<AutosaveConfig> = store.get(&keys::autosave_config(&directory_key));
        let config = AutosaveConfig::resolve(persisted, &overrides);
        config.validate()?;

        let mut stats: AutosaveStatistics = store
            .get(&keys::autosave_stats(&directory_key))
            .unwrap_or_default();
        stats.start_session();

        Ok(Self {
            inner: Arc::new(Inner {
                config: Mutex::new(config),
                stats: Mutex::new(stats),
                directory_key,
                store,
                bus,
                instance: Mutex::new(InstanceId::generate()),
                on_error,
                storage: Mutex::new(None),
                provider: Mutex::new(None),
                on_status: Mutex::new(None),
                run_state: Mutex::new(RunState::Stopped),
                enabled: AtomicBool::new(false),
                save_in_progress: AtomicBool::new(false),
                pending_save: AtomicBool::new(false),
                debounce_generation: AtomicU64::new(0),
                consecutive_failures: AtomicU32::new(0),
                permission_failures: AtomicU32::new(0),
                last_fingerprint: Mutex::new(None),
                last_attempt_at: Mutex::new(None),
                last_save_at: Mutex::new(None),
                next_save_at: Mutex::new(None),
                last_permission: Mutex::new(PermissionState::Unknown),
                tasks: Mutex::new(TaskHandles::default()),
            }),
        })
    }

    pub fn instance_id(&self) -> InstanceId {
        self.inner.current_instance()
    }

    pub fn config(&self) -> AutosaveConfig {
        self.inner.config_snapshot()
    }

    /// Wire dependencies and start the periodic timer, the permission
    /// watcher and the cross-instance listener.
    pub async fn initialize(
        &self,
        storage: Arc<StorageService>,
        provider: DataProvider,
        on_status: StatusCallback,
    ) {
        let initial_permission = storage.check_permission().await;

        let inner = &self.inner;
        // One logical instance, one identity: broadcasts carry the same id
        // the storage service stamps into the shared last-save entry.
        *lock(&inner.instance) = storage.instance_id();
        *lock(&inner.storage) = Some(storage);
        *lock(&inner.provider) = Some(provider);
        *lock(&inner.on_status) = Some(on_status);
        *lock(&inner.last_permission) = initial_permission;
        inner.set_run_state(RunState::Started);
        inner.enabled.store(true, Ordering::SeqCst);

        {
            let mut tasks = lock(&inner.tasks);
            tasks.abort_all();
            tasks.periodic = Some(spawn_periodic(inner));
            tasks.watcher = Some(spawn_permission_watcher(inner));
            tasks.listener = Some(spawn_bus_listener(inner));
        }

        emit_status(inner, SaveStatus::Idle, "Autosave ready");
    }

    /// Restart the debounce window; the save fires after the configured
    /// quiet period with no further notifications.
    pub fn notify_data_change(&self, reason: &str) {
        let inner = &self.inner;
        if inner.run_state() == RunState::Stopped {
            return;
        }

        let generation = inner.debounce_generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Data change ({reason}); debounce restarted");
        emit_status(inner, SaveStatus::Pending, format!("Changes pending ({reason})"));

        let delay = inner.config_snapshot().debounce_delay();
        let task_inner = Arc::clone(inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if task_inner.debounce_generation.load(Ordering::SeqCst) == generation {
                // Detached so a later debounce restart cannot cancel a write
                // that already began.
                spawn_detached_save(&task_inner, SaveOptions::default());
            }
        });
        if let Some(old) = lock(&inner.tasks).debounce.replace(handle) {
            old.abort();
        }
    }

    /// The single funnel for every save trigger.
    pub async fn save_now(&self, options: SaveOptions) -> bool {
        save_future(Arc::clone(&self.inner), options).await
    }

    /// Un-throttled save when the application loses visibility.
    pub async fn handle_visibility_hidden(&self) -> bool {
        self.save_now(SaveOptions::immediate()).await
    }

    /// Best-effort forced save on shutdown when unsaved changes are
    /// suspected. Non-blocking warning; never raises.
    pub async fn prepare_shutdown(&self) -> bool {
        if !self.has_unsaved_changes() {
            return true;
        }
        (self.inner.on_error)(
            "You have unsaved changes; attempting a final save",
            Severity::Warning,
        );
        self.save_now(SaveOptions::forced()).await
    }

    /// Whether the current snapshot differs from the last persisted one.
    pub fn has_unsaved_changes(&self) -> bool {
        let Some(provider) = self.inner.provider_ref() else {
            return false;
        };
        let fingerprint = fingerprint_of(&provider());
        *lock(&self.inner.last_fingerprint) != Some(fingerprint)
    }

    pub fn pause(&self) {
        pause_with(&self.inner, "Autosave paused");
    }

    pub fn resume(&self) {
        resume_if_enabled(&self.inner);
    }

    /// Stop all timers. Unlike pause, a stopped coordinator ignores every
    /// trigger until re-initialized.
    pub fn stop(&self) {
        self.inner.set_run_state(RunState::Stopped);
        lock(&self.inner.tasks).abort_all();
        *lock(&self.inner.next_save_at) = None;
    }

    /// Full teardown: stop timers, detach listeners, release dependencies.
    pub fn destroy(&self) {
        self.stop();
        *lock(&self.inner.storage) = None;
        *lock(&self.inner.provider) = None;
        *lock(&self.inner.on_status) = None;
    }

    pub fn status(&self) -> CoordinatorStatus {
        let inner = &self.inner;
        CoordinatorStatus {
            enabled: inner.enabled.load(Ordering::SeqCst),
            run_state: inner.run_state(),
            save_in_progress: inner.save_in_progress.load(Ordering::SeqCst),
            pending_save: inner.pending_save.load(Ordering::SeqCst),
            last_save_at: *lock(&inner.last_save_at),
            next_save_at: *lock(&inner.next_save_at),
            consecutive_failures: inner.consecutive_failures.load(Ordering::SeqCst),
            statistics: inner.stats_snapshot(),
        }
    }

    /// Apply and persist a config change; the periodic timer restarts when
    /// its interval changed.
    pub fn update_config(&self, patch: &AutosaveConfigPatch) -> Result<()> {
        let inner = &self.inner;
        let (old_interval, updated) = {
            let mut config = lock(&inner.config);
            let old_interval = config.save_interval_ms;
            let mut next = config.clone();
            next.apply(patch);
            next.validate()?;
            *config = next.clone();
            (old_interval, next)
        };

        inner
            .store
            .set(&keys::autosave_config(&inner.directory_key), &updated)?;

        if updated.save_interval_ms != old_interval {
            let mut tasks = lock(&inner.tasks);
            if let Some(old) = tasks.periodic.take() {
                old.abort();
                tasks.periodic = Some(spawn_periodic(inner));
            }
        }
        Ok(())
    }
}

impl Inner {
    fn config_snapshot(&self) -> AutosaveConfig {
        lock(&self.config).clone()
    }

    fn current_instance(&self) -> InstanceId {
        *lock(&self.instance)
    }

    fn stats_snapshot(&self) -> AutosaveStatistics {
        lock(&self.stats).clone()
    }

    fn run_state(&self) -> RunState {
        *lock(&self.run_state)
    }

    fn set_run_state(&self, state: RunState) {
        *lock(&self.run_state) = state;
    }

    fn storage_ref(&self) -> Option<Arc<StorageService>> {
        lock(&self.storage).clone()
    }

    fn provider_ref(&self) -> Option<DataProvider> {
        lock(&self.provider).clone()
    }

    fn persist_stats(&self) {
        let snapshot = self.stats_snapshot();
        if let Err(err) = self
            .store
            .set(&keys::autosave_stats(&self.directory_key), &snapshot)
        {
            warn!("Failed to persist autosave statistics: {err}");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn emit_status(inner: &Inner, status: SaveStatus, message: impl Into<String>) {
    let callback = lock(&inner.on_status).clone();
    let Some(callback) = callback else { return };
    callback(StatusEvent {
        status,
        message: message.into(),
        timestamp: Utc::now(),
        data: None,
        statistics: Some(inner.stats_snapshot()),
    });
}

fn pause_with(inner: &Inner, message: &str) {
    if inner.run_state() == RunState::Started {
        inner.set_run_state(RunState::Paused);
        emit_status(inner, SaveStatus::Paused, message);
    }
}

fn resume_if_enabled(inner: &Inner) {
    if inner.enabled.load(Ordering::SeqCst) && inner.run_state() == RunState::Paused {
        inner.set_run_state(RunState::Started);
        emit_status(inner, SaveStatus::Resumed, "Autosave resumed");
    }
}

fn disable(inner: &Inner, message: String) {
    inner.enabled.store(false, Ordering::SeqCst);
    if inner.run_state() == RunState::Started {
        inner.set_run_state(RunState::Paused);
    }
    warn!("{message}");
    (inner.on_error)(&message, Severity::Error);
    emit_status(inner, SaveStatus::Disabled, message);
}

/// Exponential backoff for the given consecutive-failure count, capped at
/// the configured maximum.
pub fn backoff_delay(config: &AutosaveConfig, consecutive_failures: u32) -> std::time::Duration {
    let attempt = consecutive_failures.max(1);
    let exponent = (attempt - 1).min(16);
    let ms = config
        .retry_base_delay_ms
        .saturating_mul(1u64 << exponent)
        .min(config.retry_max_delay_ms);
    std::time::Duration::from_millis(ms)
}

fn fingerprint_of(value: &Value) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    serde_json::to_string(value).unwrap_or_default().hash(&mut hasher);
    hasher.finish()
}

fn spawn_detached_save(inner: &Arc<Inner>, options: SaveOptions) {
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        save_future(inner, options).await;
    });
}

/// Boxed entry to the save path, so timer tasks and follow-up saves can
/// re-enter it without recursive future types.
fn save_future(
    inner: Arc<Inner>,
    options: SaveOptions,
) -> Pin<Box<dyn Future<Output = bool> + Send>> {
    Box::pin(run_save(inner, options))
}

async fn run_save(inner: Arc<Inner>, options: SaveOptions) -> bool {
    let state = inner.run_state();
    if state == RunState::Stopped {
        return false;
    }
    if options.force {
        // A manual save is a fresh, user-initiated attempt.
        inner.permission_failures.store(0, Ordering::SeqCst);
    }
    if state == RunState::Paused && !options.force {
        return false;
    }

    if !options.skip_throttle && !options.force {
        let min_interval = inner.config_snapshot().min_save_interval();
        let last_attempt = *lock(&inner.last_attempt_at);
        let throttled = last_attempt.is_some_and(|last| last.elapsed() < min_interval);
        if throttled {
            debug!("Save throttled; next periodic attempt will pick it up");
            return false;
        }
    }

    let Some(storage) = inner.storage_ref() else {
        warn!("Autosave is not initialized; save skipped");
        return false;
    };
    let Some(provider) = inner.provider_ref() else {
        warn!("Autosave has no data provider; save skipped");
        return false;
    };

    if inner.save_in_progress.swap(true, Ordering::SeqCst) {
        inner.pending_save.store(true, Ordering::SeqCst);
        debug!("Save already in flight; follow-up queued");
        return false;
    }

    let saved = attempt_save(&inner, &storage, &provider, options).await;

    inner.save_in_progress.store(false, Ordering::SeqCst);
    if saved
        && inner.pending_save.swap(false, Ordering::SeqCst)
        && inner.run_state() == RunState::Started
    {
        spawn_detached_save(&inner, SaveOptions::immediate());
    }
    saved
}

async fn attempt_save(
    inner: &Arc<Inner>,
    storage: &Arc<StorageService>,
    provider: &DataProvider,
    options: SaveOptions,
) -> bool {
    *lock(&inner.last_attempt_at) = Some(Instant::now());

    let snapshot = provider();
    let fingerprint = fingerprint_of(&snapshot);
    if !options.force && *lock(&inner.last_fingerprint) == Some(fingerprint) {
        debug!("Document unchanged; nothing to save");
        emit_status(inner, SaveStatus::Saved, "No changes to save");
        return true;
    }

    emit_status(inner, SaveStatus::Saving, "Saving case data");
    inner.bus.publish(inner.current_instance(), SaveEvent::Started);

    let started = Instant::now();
    let wrote = storage.write_file(snapshot).await;
    let duration = started.elapsed();

    if wrote {
        let cap = inner.config_snapshot().duration_sample_cap;
        lock(&inner.stats).record_success(duration, cap);
        inner.persist_stats();

        *lock(&inner.last_fingerprint) = Some(fingerprint);
        *lock(&inner.last_save_at) = Some(Utc::now());
        inner.consecutive_failures.store(0, Ordering::SeqCst);
        inner.permission_failures.store(0, Ordering::SeqCst);

        if !inner.enabled.swap(true, Ordering::SeqCst) {
            // A successful manual save re-arms autosave after a terminal
            // stop.
            inner.set_run_state(RunState::Started);
            emit_status(inner, SaveStatus::Resumed, "Autosave re-enabled");
        }

        inner.bus.publish(
            inner.current_instance(),
            SaveEvent::Completed {
                timestamp: Utc::now(),
            },
        );
        emit_status(inner, SaveStatus::Saved, "All changes saved");
        return true;
    }

    let err = storage
        .last_error()
        .unwrap_or_else(|| StorageError::Unknown("Save failed".into()));
    lock(&inner.stats).record_failure(err.kind());
    inner.persist_stats();

    inner.bus.publish(
        inner.current_instance(),
        SaveEvent::Failed {
            kind: err.kind().to_string(),
        },
    );
    emit_status(inner, SaveStatus::Error, format!("Save failed: {err}"));
    handle_failure(inner, err);
    false
}

fn handle_failure(inner: &Arc<Inner>, err: StorageError) {
    let failures = inner.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;

    match &err {
        StorageError::PermissionDenied(_) => {
            let permission_failures = inner.permission_failures.fetch_add(1, Ordering::SeqCst) + 1;
            let max = inner.config_snapshot().max_permission_failures;
            if permission_failures >= max {
                disable(
                    inner,
                    format!(
                        "Autosave stopped after {permission_failures} permission failures. {}",
                        err.suggested_action()
                    ),
                );
            } else {
                (inner.on_error)(err.suggested_action(), Severity::Warning);
                schedule_retry(inner, failures);
            }
        }
        StorageError::WriteRejected(_) => {
            // Another attempt is in flight; it will be followed up, not
            // retried.
            inner.pending_save.store(true, Ordering::SeqCst);
        }
        _ if !err.is_recoverable() => {
            disable(
                inner,
                format!("Autosave stopped: {err}. {}", err.suggested_action()),
            );
        }
        _ if err.is_retryable() => {
            (inner.on_error)(err.suggested_action(), Severity::Warning);
            schedule_retry(inner, failures);
        }
        _ => {
            pause_with(inner, "Autosave paused until storage is available");
            (inner.on_error)(err.suggested_action(), Severity::Warning);
        }
    }
}

fn schedule_retry(inner: &Arc<Inner>, consecutive_failures: u32) {
    let delay = backoff_delay(&inner.config_snapshot(), consecutive_failures);
    debug!(
        "Retrying save in {} ms (failure #{consecutive_failures})",
        delay.as_millis()
    );

    let task_inner = Arc::clone(inner);
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if task_inner.run_state() == RunState::Started {
            spawn_detached_save(&task_inner, SaveOptions::immediate());
        }
    });
    if let Some(old) = lock(&inner.tasks).retry.replace(handle) {
        old.abort();
    }
}

fn spawn_periodic(inner: &Arc<Inner>) -> JoinHandle<()> {
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        loop {
            let interval = inner.config_snapshot().save_interval();
            let eta = chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::zero());
            *lock(&inner.next_save_at) = Some(Utc::now() + eta);
            tokio::time::sleep(interval).await;
            match inner.run_state() {
                RunState::Stopped => break,
                RunState::Paused => continue,
                RunState::Started => spawn_detached_save(&inner, SaveOptions::default()),
            }
        }
    })
}

fn spawn_permission_watcher(inner: &Arc<Inner>) -> JoinHandle<()> {
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        loop {
            let interval = inner.config_snapshot().permission_check_interval();
            tokio::time::sleep(interval).await;
            if inner.run_state() == RunState::Stopped {
                break;
            }
            let Some(storage) = inner.storage_ref() else {
                continue;
            };

            let state = storage.check_permission().await;
            let previous = std::mem::replace(&mut *lock(&inner.last_permission), state);

            if state == PermissionState::Denied && previous != PermissionState::Denied {
                warn!("Storage permission lost; autosave paused");
                pause_with(&inner, "Storage access was lost; autosave is paused");
                (inner.on_error)(
                    StorageError::PermissionDenied("autosave".into()).suggested_action(),
                    Severity::Warning,
                );
            } else if state.is_granted() && previous == PermissionState::Denied {
                debug!("Storage permission restored");
                resume_if_enabled(&inner);
            }
        }
    })
}

fn spawn_bus_listener(inner: &Arc<Inner>) -> JoinHandle<()> {
    let inner = Arc::clone(inner);
    let mut rx = inner.bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    if msg.instance == inner.current_instance() {
                        continue;
                    }
                    match msg.event {
                        SaveEvent::Started => {
                            emit_status(&inner, SaveStatus::PeerSaving, "Another instance is saving");
                        }
                        SaveEvent::Completed { .. } => {
                            // The next local comparison must re-evaluate
                            // rather than trust stale local memory.
                            *lock(&inner.last_fingerprint) = None;
                            emit_status(
                                &inner,
                                SaveStatus::PeerSaved,
                                "Another instance saved the document",
                            );
                        }
                        SaveEvent::Failed { kind } => {
                            emit_status(
                                &inner,
                                SaveStatus::PeerError,
                                format!("Another instance failed to save ({kind})"),
                            );
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Bus listener lagged; skipped {skipped} messages");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

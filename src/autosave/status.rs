use crate::autosave::stats::AutosaveStatistics;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Lifecycle position of the current or most recent save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStatus {
    Idle,
    Pending,
    Saving,
    Saved,
    Error,
    Paused,
    Resumed,
    Disabled,
    PeerSaving,
    PeerSaved,
    PeerError,
}

impl SaveStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Pending => "pending",
            Self::Saving => "saving",
            Self::Saved => "saved",
            Self::Error => "error",
            Self::Paused => "paused",
            Self::Resumed => "resumed",
            Self::Disabled => "disabled",
            Self::PeerSaving => "peer-saving",
            Self::PeerSaved => "peer-saved",
            Self::PeerError => "peer-error",
        }
    }
}

impl fmt::Display for SaveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Enablement axis, independent of the save lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Started,
    Paused,
    Stopped,
}

/// Event delivered to the status callback on every lifecycle transition.
#[derive(Clone)]
pub struct StatusEvent {
    pub status: SaveStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub data: Option<Value>,
    pub statistics: Option<AutosaveStatistics>,
}

/// Snapshot returned by status introspection.
#[derive(Debug, Clone)]
pub struct CoordinatorStatus {
    pub enabled: bool,
    pub run_state: RunState,
    pub save_in_progress: bool,
    pub pending_save: bool,
    pub last_save_at: Option<DateTime<Utc>>,
    pub next_save_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub statistics: AutosaveStatistics,
}

/// Zero-argument, side-effect-free snapshot of the in-memory document.
pub type DataProvider = Arc<dyn Fn() -> Value + Send + Sync>;

/// Invoked on every lifecycle transition.
pub type StatusCallback = Arc<dyn Fn(StatusEvent) + Send + Sync>;

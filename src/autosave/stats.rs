use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

/// Save counters persisted across sessions.
///
/// Everything survives a restart except `session_started_at`, which is the
/// only per-session field. Duration samples are a rolling window capped at
/// the configured sample count (most recent kept).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AutosaveStatistics {
    pub total_saves: u64,
    pub successful_saves: u64,
    pub failed_saves: u64,
    /// Failure histogram keyed by error kind label.
    pub error_counts: HashMap<String, u64>,
    pub duration_samples_ms: VecDeque<u64>,
    pub last_save_at: Option<DateTime<Utc>>,
    pub session_started_at: DateTime<Utc>,
}

impl Default for AutosaveStatistics {
    fn default() -> Self {
        Self {
            total_saves: 0,
            successful_saves: 0,
            failed_saves: 0,
            error_counts: HashMap::new(),
            duration_samples_ms: VecDeque::new(),
            last_save_at: None,
            session_started_at: Utc::now(),
        }
    }
}

impl AutosaveStatistics {
    /// Called once when a session adopts persisted statistics.
    pub fn start_session(&mut self) {
        self.session_started_at = Utc::now();
    }

    pub fn record_success(&mut self, duration: Duration, sample_cap: usize) {
        self.total_saves += 1;
        self.successful_saves += 1;
        self.last_save_at = Some(Utc::now());
        self.duration_samples_ms.push_back(duration.as_millis() as u64);
        while self.duration_samples_ms.len() > sample_cap {
            self.duration_samples_ms.pop_front();
        }
    }

    pub fn record_failure(&mut self, kind: &str) {
        self.total_saves += 1;
        self.failed_saves += 1;
        *self.error_counts.entry(kind.to_string()).or_insert(0) += 1;
    }

    pub fn average_duration_ms(&self) -> Option<u64> {
        if self.duration_samples_ms.is_empty() {
            return None;
        }
        let sum: u64 = self.duration_samples_ms.iter().sum();
        Some(sum / self.duration_samples_ms.len() as u64)
    }
}

impl fmt::Display for AutosaveStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Autosave Stats: {}/{} succeeded, {} failed, avg {} ms",
            self.successful_saves,
            self.total_saves,
            self.failed_saves,
            self.average_duration_ms().unwrap_or(0)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_and_failure_counters() {
        let mut stats = AutosaveStatistics::default();
        stats.record_success(Duration::from_millis(40), 100);
        stats.record_failure("network");
        stats.record_failure("network");

        assert_eq!(stats.total_saves, 3);
        assert_eq!(stats.successful_saves, 1);
        assert_eq!(stats.failed_saves, 2);
        assert_eq!(stats.error_counts["network"], 2);
        assert!(stats.last_save_at.is_some());
    }

    #[test]
    fn duration_samples_keep_most_recent() {
        let mut stats = AutosaveStatistics::default();
        for i in 0..150 {
            stats.record_success(Duration::from_millis(i), 100);
        }
        assert_eq!(stats.duration_samples_ms.len(), 100);
        assert_eq!(*stats.duration_samples_ms.front().unwrap(), 50);
        assert_eq!(*stats.duration_samples_ms.back().unwrap(), 149);
    }

    #[test]
    fn persisted_counters_survive_round_trip() {
        let mut stats = AutosaveStatistics::default();
        stats.record_success(Duration::from_millis(10), 100);
        stats.record_failure("storage-full");

        let text = serde_json::to_string(&stats).unwrap();
        let mut back: AutosaveStatistics = serde_json::from_str(&text).unwrap();
        assert_eq!(back.total_saves, 2);
        assert_eq!(back.error_counts["storage-full"], 1);

        // Only the session marker resets on a new session.
        let old_session = back.session_started_at;
        back.start_session();
        assert!(back.session_started_at >= old_session);
        assert_eq!(back.successful_saves, 1);
    }

    #[test]
    fn average_over_samples() {
        let mut stats = AutosaveStatistics::default();
        assert!(stats.average_duration_ms().is_none());
        stats.record_success(Duration::from_millis(10), 100);
        stats.record_success(Duration::from_millis(30), 100);
        assert_eq!(stats.average_duration_ms(), Some(20));
    }
}

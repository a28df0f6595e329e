use crate::core::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Autosave tunables.
///
/// Persisted per directory identity and resolved once at construction as
/// layered values: defaults, then the persisted entry, then explicit
/// constructor overrides (overrides win).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AutosaveConfig {
    /// Periodic save interval.
    pub save_interval_ms: u64,

    /// Quiet period after the last change notification before a save fires.
    pub debounce_delay_ms: u64,

    /// Permission re-check cadence.
    pub permission_check_interval_ms: u64,

    /// Minimum spacing between save attempts (throttle).
    pub min_save_interval_ms: u64,

    /// First retry delay after a recoverable failure.
    pub retry_base_delay_ms: u64,

    /// Upper bound on any retry delay.
    pub retry_max_delay_ms: u64,

    /// Consecutive permission failures tolerated before autosave stops.
    pub max_permission_failures: u32,

    /// Rolling save-duration samples kept in statistics.
    pub duration_sample_cap: usize,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            save_interval_ms: 30_000,
            debounce_delay_ms: 2_000,
            permission_check_interval_ms: 10_000,
            min_save_interval_ms: 1_000,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
            max_permission_failures: 3,
            duration_sample_cap: 100,
        }
    }
}

impl AutosaveConfig {
    /// Layered resolution: defaults < persisted < overrides.
    pub fn resolve(persisted: Option<AutosaveConfig>, overrides: &AutosaveConfigPatch) -> Self {
        let mut config = persisted.unwrap_or_default();
        config.apply(overrides);
        config
    }

    pub fn apply(&mut self, patch: &AutosaveConfigPatch) {
        if let Some(v) = patch.save_interval_ms {
            self.save_interval_ms = v;
        }
        if let Some(v) = patch.debounce_delay_ms {
            self.debounce_delay_ms = v;
        }
        if let Some(v) = patch.permission_check_interval_ms {
            self.permission_check_interval_ms = v;
        }
        if let Some(v) = patch.min_save_interval_ms {
            self.min_save_interval_ms = v;
        }
        if let Some(v) = patch.retry_base_delay_ms {
            self.retry_base_delay_ms = v;
        }
        if let Some(v) = patch.retry_max_delay_ms {
            self.retry_max_delay_ms = v;
        }
        if let Some(v) = patch.max_permission_failures {
            self.max_permission_failures = v;
        }
        if let Some(v) = patch.duration_sample_cap {
            self.duration_sample_cap = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.save_interval_ms == 0 {
            return Err(StorageError::Unknown("saveIntervalMs must be > 0".into()));
        }
        if self.permission_check_interval_ms == 0 {
            return Err(StorageError::Unknown(
                "permissionCheckIntervalMs must be > 0".into(),
            ));
        }
        if self.retry_base_delay_ms == 0 || self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(StorageError::Unknown(
                "retry delays must satisfy 0 < base <= max".into(),
            ));
        }
        if self.max_permission_failures == 0 {
            return Err(StorageError::Unknown(
                "maxPermissionFailures must be >= 1".into(),
            ));
        }
        if self.duration_sample_cap == 0 {
            return Err(StorageError::Unknown("durationSampleCap must be >= 1".into()));
        }
        Ok(())
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_millis(self.save_interval_ms)
    }

    pub fn debounce_delay(&self) -> Duration {
        Duration::from_millis(self.debounce_delay_ms)
    }

    pub fn permission_check_interval(&self) -> Duration {
        Duration::from_millis(self.permission_check_interval_ms)
    }

    pub fn min_save_interval(&self) -> Duration {
        Duration::from_millis(self.min_save_interval_ms)
    }
}

/// All-optional overlay for constructor overrides and live reconfiguration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AutosaveConfigPatch {
    pub save_interval_ms: Option<u64>,
    pub debounce_delay_ms: Option<u64>,
    pub permission_check_interval_ms: Option<u64>,
    pub min_save_interval_ms: Option<u64>,
    pub retry_base_delay_ms: Option<u64>,
    pub retry_max_delay_ms: Option<u64>,
    pub max_permission_failures: Option<u32>,
    pub duration_sample_cap: Option<usize>,
}

impl AutosaveConfigPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn save_interval_ms(mut self, ms: u64) -> Self {
        self.save_interval_ms = Some(ms);
        self
    }

    pub fn debounce_delay_ms(mut self, ms: u64) -> Self {
        self.debounce_delay_ms = Some(ms);
        self
    }

    pub fn permission_check_interval_ms(mut self, ms: u64) -> Self {
        self.permission_check_interval_ms = Some(ms);
        self
    }

    pub fn min_save_interval_ms(mut self, ms: u64) -> Self {
        self.min_save_interval_ms = Some(ms);
        self
    }

    pub fn retry_base_delay_ms(mut self, ms: u64) -> Self {
        self.retry_base_delay_ms = Some(ms);
        self
    }

    pub fn retry_max_delay_ms(mut self, ms: u64) -> Self {
        self.retry_max_delay_ms = Some(ms);
        self
    }

    pub fn max_permission_failures(mut self, count: u32) -> Self {
        self.max_permission_failures = Some(count);
        self
    }

    pub fn duration_sample_cap(mut self, cap: usize) -> Self {
        self.duration_sample_cap = Some(cap);
        self
    }
}

//! Two-tier write locking.
//!
//! Tier one is a process-wide registry keyed by logical resource (directory
//! identity plus file name), shared by every storage service in the process.
//! Tier two is a per-instance in-flight flag. Both tiers hand out RAII
//! guards, so locks are released on every exit path. Acquisition never
//! blocks or queues: a held lock means the caller backs off and re-triggers.

use lazy_static::lazy_static;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

lazy_static! {
    static ref PROCESS_REGISTRY: WriteLockRegistry = WriteLockRegistry::new();
}

/// Process-wide registry of in-flight write resources.
pub struct WriteLockRegistry {
    held: Mutex<HashSet<String>>,
}

impl WriteLockRegistry {
    fn new() -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
        }
    }

    /// The registry shared by every storage service in this process.
    pub fn global() -> &'static WriteLockRegistry {
        &PROCESS_REGISTRY
    }

    /// Non-blocking acquisition. `None` means another write against the same
    /// resource is in flight somewhere in this process.
    pub fn try_acquire(&'static self, resource: &str) -> Option<ResourceWriteGuard> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(resource.to_string()) {
            return None;
        }
        Some(ResourceWriteGuard {
            registry: self,
            resource: resource.to_string(),
        })
    }

    pub fn is_held(&self, resource: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(resource)
    }

    fn release(&self, resource: &str) {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(resource);
    }
}

/// Holds the process-wide lock for one resource; released on drop.
pub struct ResourceWriteGuard {
    registry: &'static WriteLockRegistry,
    resource: String,
}

impl Drop for ResourceWriteGuard {
    fn drop(&mut self) {
        self.registry.release(&self.resource);
    }
}

/// Per-instance in-flight flag, the second lock tier.
pub struct InstanceWriteGuard {
    flag: Arc<AtomicBool>,
}

impl InstanceWriteGuard {
    /// `None` if this instance already has a write in flight.
    pub fn try_acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        if flag.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(Self {
            flag: Arc::clone(flag),
        })
    }
}

impl Drop for InstanceWriteGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquisition_is_rejected() {
        let registry = WriteLockRegistry::global();
        let guard = registry.try_acquire("locks-test/reject").unwrap();
        assert!(registry.try_acquire("locks-test/reject").is_none());
        drop(guard);
        assert!(registry.try_acquire("locks-test/reject").is_some());
    }

    #[test]
    fn distinct_resources_are_independent() {
        let registry = WriteLockRegistry::global();
        let _a = registry.try_acquire("locks-test/a").unwrap();
        let _b = registry.try_acquire("locks-test/b").unwrap();
        assert!(registry.is_held("locks-test/a"));
        assert!(registry.is_held("locks-test/b"));
    }

    #[test]
    fn guard_releases_on_drop() {
        let registry = WriteLockRegistry::global();
        {
            let _guard = registry.try_acquire("locks-test/drop").unwrap();
            assert!(registry.is_held("locks-test/drop"));
        }
        assert!(!registry.is_held("locks-test/drop"));
    }

    #[test]
    fn instance_flag_is_exclusive() {
        let flag = Arc::new(AtomicBool::new(false));
        let guard = InstanceWriteGuard::try_acquire(&flag).unwrap();
        assert!(InstanceWriteGuard::try_acquire(&flag).is_none());
        drop(guard);
        assert!(InstanceWriteGuard::try_acquire(&flag).is_some());
    }
}

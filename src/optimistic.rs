/*!
# Optimistic Lock Manager

Version-based concurrency control for shared state. Acquisition is free;
conflicts surface at validation time as a version mismatch.
*/

use crate::error::{CoordinationError, Result};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct VersionedEntry {
    version: u64,
    last_acquirer: Option<String>,
    acquired_at: Instant,
}

/// Non-blocking version-stamped locks
pub struct OptimisticLockManager {
    entries: RwLock<HashMap<String, VersionedEntry>>,
    max_age: Duration,
}

impl OptimisticLockManager {
    /// Create a manager; holders older than `max_age_ms` are purged during
    /// maintenance
    pub fn new(max_age_ms: u64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_age: Duration::from_millis(max_age_ms),
        }
    }

    /// Record the worker as the latest acquirer and return the version it
    /// must later validate against
    pub fn acquire(&self, resource: &str, worker: &str) -> u64 {
        let mut entries = self.entries.write().unwrap();
        let entry = entries
            .entry(resource.to_string())
            .or_insert_with(|| VersionedEntry {
                version: 0,
                last_acquirer: None,
                acquired_at: Instant::now(),
            });
        entry.last_acquirer = Some(worker.to_string());
        entry.acquired_at = Instant::now();
        debug!(resource, worker, version = entry.version, "optimistic acquire");
        entry.version
    }

    /// Commit: succeeds iff the version is unchanged and the worker is still
    /// the latest acquirer. Bumps the version on success.
    pub fn validate_and_update(
        &self,
        resource: &str,
        worker: &str,
        expected_version: u64,
    ) -> Result<u64> {
        let mut entries = self.entries.write().unwrap();
        let entry = entries
            .get_mut(resource)
            .ok_or_else(|| CoordinationError::VersionConflict {
                resource: resource.to_string(),
                expected: expected_version,
                actual: 0,
            })?;

        if entry.version != expected_version || entry.last_acquirer.as_deref() != Some(worker) {
            return Err(CoordinationError::VersionConflict {
                resource: resource.to_string(),
                expected: expected_version,
                actual: entry.version,
            });
        }

        entry.version += 1;
        entry.last_acquirer = None;
        Ok(entry.version)
    }

    /// Current version of a resource
    pub fn version(&self, resource: &str) -> Option<u64> {
        self.entries.read().unwrap().get(resource).map(|e| e.version)
    }

    /// Latest acquirer, if any
    pub fn latest_acquirer(&self, resource: &str) -> Option<String> {
        self.entries
            .read()
            .unwrap()
            .get(resource)
            .and_then(|e| e.last_acquirer.clone())
    }

    /// Purge stale holders
    pub fn maintenance(&self) {
        let mut entries = self.entries.write().unwrap();
        for (resource, entry) in entries.iter_mut() {
            if entry.last_acquirer.is_some() && entry.acquired_at.elapsed() > self.max_age {
                warn!(
                    resource,
                    holder = entry.last_acquirer.as_deref().unwrap_or(""),
                    "purging stale optimistic holder"
                );
                entry.last_acquirer = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_validate_update() {
        let olm = OptimisticLockManager::new(60_000);

        let version = olm.acquire("state", "w1");
        assert_eq!(version, 0);

        let next = olm.validate_and_update("state", "w1", version).unwrap();
        assert_eq!(next, 1);
        assert_eq!(olm.version("state"), Some(1));
    }

    #[test]
    fn test_interleaved_acquirer_loses() {
        let olm = OptimisticLockManager::new(60_000);

        let v1 = olm.acquire("state", "w1");
        // w2 acquires after w1; w1 is no longer the latest acquirer
        let _v2 = olm.acquire("state", "w2");

        let err = olm.validate_and_update("state", "w1", v1).unwrap_err();
        assert!(matches!(err, CoordinationError::VersionConflict { .. }));

        // w2 commits fine
        olm.validate_and_update("state", "w2", v1).unwrap();
    }

    #[test]
    fn test_stale_version_rejected() {
        let olm = OptimisticLockManager::new(60_000);

        let v = olm.acquire("state", "w1");
        olm.validate_and_update("state", "w1", v).unwrap();

        let _ = olm.acquire("state", "w1");
        let err = olm.validate_and_update("state", "w1", v).unwrap_err();
        assert!(matches!(
            err,
            CoordinationError::VersionConflict { expected: 0, actual: 1, .. }
        ));
    }

    #[test]
    fn test_maintenance_purges_stale_holder() {
        let olm = OptimisticLockManager::new(0);
        olm.acquire("state", "w1");
        std::thread::sleep(Duration::from_millis(5));
        olm.maintenance();
        assert_eq!(olm.latest_acquirer("state"), None);
    }
}

/*!
# Resource Lock Manager

Exclusive named locks with priority-ordered wait queues, plus periodic
wait-for-graph deadlock detection that preempts the lowest-priority member
of a cycle.
*/

use crate::error::{CoordinationError, Result};
use crate::events::{CoordinationEvent, EventBus};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

/// A queued acquisition request
struct Waiter {
    worker: String,
    priority: i32,
    requested_at: Instant,
    grant: oneshot::Sender<()>,
}

/// State of one lockable resource
#[derive(Default)]
struct ResourceState {
    holder: Option<String>,
    locked_at: Option<Instant>,
    waiters: Vec<Waiter>,
}

impl ResourceState {
    /// Hand the lock to the next live waiter, in queue order
    fn grant_next(&mut self) {
        self.holder = None;
        self.locked_at = None;
        while !self.waiters.is_empty() {
            let waiter = self.waiters.remove(0);
            let worker = waiter.worker.clone();
            if waiter.grant.send(()).is_ok() {
                self.holder = Some(worker);
                self.locked_at = Some(Instant::now());
                break;
            }
            // Waiter already gave up; try the next one
        }
    }
}

/// A wait-for cycle found by the detector
#[derive(Debug, Clone)]
pub struct DeadlockCycle {
    /// Workers forming the cycle
    pub workers: Vec<String>,
    /// Resources the cycle is contending on
    pub resources: Vec<String>,
}

/// Exclusive lock manager over named resources
pub struct ResourceLockManager {
    resources: Mutex<HashMap<String, ResourceState>>,
    resource_timeout: Duration,
    events: EventBus,
}

impl ResourceLockManager {
    /// Create a manager; `resource_timeout` bounds waiter age and, doubled,
    /// the age at which a held lock is considered stale
    pub fn new(resource_timeout_ms: u64, events: EventBus) -> Self {
        Self {
            resources: Mutex::new(HashMap::new()),
            resource_timeout: Duration::from_millis(resource_timeout_ms),
            events,
        }
    }

    /// Acquire an exclusive lock, waiting up to `timeout`.
    ///
    /// Grants are FIFO within a priority bucket; a higher-priority request
    /// preempts the queue head. Re-acquiring a held lock is a no-op.
    pub async fn acquire(
        &self,
        resource: &str,
        worker: &str,
        priority: i32,
        timeout: Duration,
    ) -> Result<()> {
        let rx = {
            let mut map = self.resources.lock().await;
            let state = map.entry(resource.to_string()).or_default();

            if state.holder.as_deref() == Some(worker) {
                return Ok(());
            }
            if state.holder.is_none() && state.waiters.is_empty() {
                state.holder = Some(worker.to_string());
                state.locked_at = Some(Instant::now());
                debug!(resource, worker, "lock acquired");
                return Ok(());
            }

            // Wait queue entries are distinct by worker id; a re-request
            // supersedes the previous one.
            state.waiters.retain(|w| w.worker != worker);

            let (tx, rx) = oneshot::channel();
            let waiter = Waiter {
                worker: worker.to_string(),
                priority,
                requested_at: Instant::now(),
                grant: tx,
            };
            let pos = state
                .waiters
                .iter()
                .position(|w| w.priority < priority)
                .unwrap_or(state.waiters.len());
            state.waiters.insert(pos, waiter);
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => {
                debug!(resource, worker, "lock granted from queue");
                Ok(())
            }
            _ => {
                // Timed out or the manager dropped us; withdraw unless a
                // grant raced ahead of the timeout.
                let mut map = self.resources.lock().await;
                if let Some(state) = map.get_mut(resource) {
                    if state.holder.as_deref() == Some(worker) {
                        return Ok(());
                    }
                    state.waiters.retain(|w| w.worker != worker);
                }
                Err(CoordinationError::ResourceTimeout {
                    resource: resource.to_string(),
                    worker: worker.to_string(),
                })
            }
        }
    }

    /// Release a lock. Calls by a non-holder are logged and ignored.
    pub async fn release(&self, resource: &str, worker: &str) {
        let mut map = self.resources.lock().await;
        match map.get_mut(resource) {
            Some(state) if state.holder.as_deref() == Some(worker) => {
                state.grant_next();
                debug!(resource, worker, "lock released");
                if state.holder.is_none() && state.waiters.is_empty() {
                    map.remove(resource);
                }
            }
            Some(_) => {
                warn!(resource, worker, "release by non-holder ignored");
            }
            None => {
                warn!(resource, worker, "release of unknown resource ignored");
            }
        }
    }

    /// Drop every lock and queued request belonging to a worker.
    /// Returns the resources that were actually held.
    pub async fn release_all_for(&self, worker: &str) -> Vec<String> {
        let mut map = self.resources.lock().await;
        let mut released = Vec::new();
        for (resource, state) in map.iter_mut() {
            state.waiters.retain(|w| w.worker != worker);
            if state.holder.as_deref() == Some(worker) {
                state.grant_next();
                released.push(resource.clone());
            }
        }
        map.retain(|_, state| state.holder.is_some() || !state.waiters.is_empty());
        if !released.is_empty() {
            info!(worker, resources = ?released, "force-released locks");
        }
        released
    }

    /// Current holder of a resource
    pub async fn holder(&self, resource: &str) -> Option<String> {
        self.resources
            .lock()
            .await
            .get(resource)
            .and_then(|s| s.holder.clone())
    }

    /// Number of queued waiters on a resource
    pub async fn wait_queue_len(&self, resource: &str) -> usize {
        self.resources
            .lock()
            .await
            .get(resource)
            .map(|s| s.waiters.len())
            .unwrap_or(0)
    }

    /// Resources currently held by a worker
    pub async fn held_by(&self, worker: &str) -> Vec<String> {
        self.resources
            .lock()
            .await
            .iter()
            .filter(|(_, s)| s.holder.as_deref() == Some(worker))
            .map(|(r, _)| r.clone())
            .collect()
    }

    /// Expire over-age waiters and force-release stale locks
    pub async fn maintenance(&self) {
        let mut map = self.resources.lock().await;
        let waiter_cutoff = self.resource_timeout;
        let stale_cutoff = self.resource_timeout * 2;

        for (resource, state) in map.iter_mut() {
            let before = state.waiters.len();
            state
                .waiters
                .retain(|w| w.requested_at.elapsed() < waiter_cutoff);
            let expired = before - state.waiters.len();
            if expired > 0 {
                warn!(resource, expired, "expired lock waiters removed");
            }

            let stale = state
                .locked_at
                .map(|at| at.elapsed() > stale_cutoff)
                .unwrap_or(false);
            if stale {
                // Holder loss is normally signalled by deregistration; this
                // path catches the ones that were not.
                warn!(
                    resource,
                    holder = state.holder.as_deref().unwrap_or(""),
                    "stale lock force-released"
                );
                state.grant_next();
            }
        }
        map.retain(|_, state| state.holder.is_some() || !state.waiters.is_empty());
    }

    /// Find all wait-for cycles: an edge `w1 → w2` exists when `w1` is
    /// queued on a resource `w2` holds.
    pub async fn detect_deadlocks(&self) -> Vec<DeadlockCycle> {
        let map = self.resources.lock().await;

        // waiter -> set of holders it is blocked on
        let mut edges: HashMap<String, HashSet<String>> = HashMap::new();
        for state in map.values() {
            if let Some(holder) = &state.holder {
                for waiter in &state.waiters {
                    edges
                        .entry(waiter.worker.clone())
                        .or_default()
                        .insert(holder.clone());
                }
            }
        }

        let mut cycles = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut workers: Vec<&String> = edges.keys().collect();
        workers.sort();

        for start in workers {
            if visited.contains(start) {
                continue;
            }
            let mut stack = vec![start.clone()];
            let mut on_stack: HashSet<String> = stack.iter().cloned().collect();
            Self::dfs_cycles(&edges, &mut visited, &mut stack, &mut on_stack, &mut cycles);
        }

        cycles
            .into_iter()
            .map(|workers| {
                let member: HashSet<&String> = workers.iter().collect();
                let mut resources: Vec<String> = map
                    .iter()
                    .filter(|(_, s)| {
                        s.holder.as_ref().map(|h| member.contains(h)).unwrap_or(false)
                            && s.waiters.iter().any(|w| member.contains(&w.worker))
                    })
                    .map(|(r, _)| r.clone())
                    .collect();
                resources.sort();
                DeadlockCycle { workers, resources }
            })
            .collect()
    }

    fn dfs_cycles(
        edges: &HashMap<String, HashSet<String>>,
        visited: &mut HashSet<String>,
        stack: &mut Vec<String>,
        on_stack: &mut HashSet<String>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        let current = stack.last().cloned().unwrap_or_default();
        visited.insert(current.clone());

        if let Some(next_set) = edges.get(&current) {
            let mut nexts: Vec<&String> = next_set.iter().collect();
            nexts.sort();
            for next in nexts {
                if on_stack.contains(next) {
                    let start = stack.iter().position(|s| s == next).unwrap_or(0);
                    cycles.push(stack[start..].to_vec());
                } else if !visited.contains(next) {
                    stack.push(next.clone());
                    on_stack.insert(next.clone());
                    Self::dfs_cycles(edges, visited, stack, on_stack, cycles);
                    on_stack.remove(stack.last().unwrap());
                    stack.pop();
                }
            }
        }
    }

    /// Break a cycle by preempting its lowest-priority member. Returns the
    /// preempted worker so the caller can requeue its tasks.
    pub async fn break_deadlock(&self, cycle: &DeadlockCycle) -> Option<String> {
        let victim = {
            let map = self.resources.lock().await;
            let mut priorities: HashMap<&String, i32> = HashMap::new();
            for state in map.values() {
                for waiter in &state.waiters {
                    if cycle.workers.contains(&waiter.worker) {
                        let entry = priorities.entry(&waiter.worker).or_insert(waiter.priority);
                        *entry = (*entry).max(waiter.priority);
                    }
                }
            }
            cycle
                .workers
                .iter()
                .min_by_key(|w| (priorities.get(w).copied().unwrap_or(i32::MAX), (*w).clone()))
                .cloned()
        }?;

        self.events.emit(CoordinationEvent::DeadlockDetected {
            workers: cycle.workers.clone(),
            resources: cycle.resources.clone(),
        });
        warn!(
            workers = ?cycle.workers,
            resources = ?cycle.resources,
            victim = %victim,
            "deadlock detected, preempting lowest-priority member"
        );

        self.release_all_for(&victim).await;
        self.events.emit(CoordinationEvent::DeadlockBroken {
            victim: victim.clone(),
        });
        Some(victim)
    }

    /// One detection pass: find cycles and break each. Returns the victims.
    pub async fn detect_and_resolve(&self) -> Vec<String> {
        let cycles = self.detect_deadlocks().await;
        let mut victims = Vec::new();
        for cycle in &cycles {
            if let Some(victim) = self.break_deadlock(cycle).await {
                victims.push(victim);
            }
        }
        victims
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ResourceLockManager {
        ResourceLockManager::new(200, EventBus::new())
    }

    #[tokio::test]
    async fn test_acquire_and_idempotence() {
        let locks = manager();
        locks
            .acquire("r1", "w1", 0, Duration::from_millis(100))
            .await
            .unwrap();
        // Holder re-acquiring is a no-op
        locks
            .acquire("r1", "w1", 0, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(locks.holder("r1").await, Some("w1".to_string()));
    }

    #[tokio::test]
    async fn test_waiter_granted_on_release() {
        let locks = std::sync::Arc::new(manager());
        locks
            .acquire("r1", "w1", 0, Duration::from_millis(100))
            .await
            .unwrap();

        let locks2 = locks.clone();
        let waiter = tokio::spawn(async move {
            locks2
                .acquire("r1", "w2", 0, Duration::from_millis(500))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(locks.wait_queue_len("r1").await, 1);

        locks.release("r1", "w1").await;
        waiter.await.unwrap().unwrap();
        assert_eq!(locks.holder("r1").await, Some("w2".to_string()));
    }

    #[tokio::test]
    async fn test_acquisition_timeout() {
        let locks = manager();
        locks
            .acquire("r1", "w1", 0, Duration::from_millis(100))
            .await
            .unwrap();

        let err = locks
            .acquire("r1", "w2", 0, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::ResourceTimeout { .. }));
        // The withdrawn waiter must not linger in the queue
        assert_eq!(locks.wait_queue_len("r1").await, 0);
    }

    #[tokio::test]
    async fn test_priority_preempts_queue_head() {
        let locks = std::sync::Arc::new(manager());
        locks
            .acquire("r1", "holder", 0, Duration::from_millis(100))
            .await
            .unwrap();

        let low = {
            let locks = locks.clone();
            tokio::spawn(
                async move { locks.acquire("r1", "low", 1, Duration::from_millis(500)).await },
            )
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let high = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks.acquire("r1", "high", 10, Duration::from_millis(500)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        locks.release("r1", "holder").await;
        high.await.unwrap().unwrap();
        assert_eq!(locks.holder("r1").await, Some("high".to_string()));

        locks.release("r1", "high").await;
        low.await.unwrap().unwrap();
        assert_eq!(locks.holder("r1").await, Some("low".to_string()));
    }

    #[tokio::test]
    async fn test_release_by_non_holder_is_noop() {
        let locks = manager();
        locks
            .acquire("r1", "w1", 0, Duration::from_millis(100))
            .await
            .unwrap();
        locks.release("r1", "w2").await;
        assert_eq!(locks.holder("r1").await, Some("w1".to_string()));
    }

    #[tokio::test]
    async fn test_release_all_for() {
        let locks = manager();
        locks
            .acquire("r1", "w1", 0, Duration::from_millis(100))
            .await
            .unwrap();
        locks
            .acquire("r2", "w1", 0, Duration::from_millis(100))
            .await
            .unwrap();

        let mut released = locks.release_all_for("w1").await;
        released.sort();
        assert_eq!(released, vec!["r1".to_string(), "r2".to_string()]);
        assert_eq!(locks.holder("r1").await, None);
    }

    #[tokio::test]
    async fn test_deadlock_detected_and_broken() {
        let locks = std::sync::Arc::new(manager());

        // w1 holds r1, w2 holds r2
        locks
            .acquire("r1", "w1", 5, Duration::from_millis(100))
            .await
            .unwrap();
        locks
            .acquire("r2", "w2", 10, Duration::from_millis(100))
            .await
            .unwrap();

        // Cross-wait: w1 -> r2, w2 -> r1
        let l1 = locks.clone();
        let w1_wait =
            tokio::spawn(async move { l1.acquire("r2", "w1", 5, Duration::from_secs(2)).await });
        let l2 = locks.clone();
        let w2_wait =
            tokio::spawn(async move { l2.acquire("r1", "w2", 10, Duration::from_secs(2)).await });
        tokio::time::sleep(Duration::from_millis(30)).await;

        let cycles = locks.detect_deadlocks().await;
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].workers.len(), 2);

        let victims = locks.detect_and_resolve().await;
        // w1 has the lower priority and loses its locks
        assert_eq!(victims, vec!["w1".to_string()]);

        // w2 now gets r1 and the system is unblocked
        w2_wait.await.unwrap().unwrap();
        assert_eq!(locks.holder("r1").await, Some("w2".to_string()));

        // w1's wait either times out or was withdrawn with its locks
        let _ = w1_wait.await;
    }

    #[tokio::test]
    async fn test_maintenance_releases_stale_locks() {
        let locks = ResourceLockManager::new(20, EventBus::new());
        locks
            .acquire("r1", "w1", 0, Duration::from_millis(100))
            .await
            .unwrap();

        // Held longer than 2x the resource timeout
        tokio::time::sleep(Duration::from_millis(60)).await;
        locks.maintenance().await;
        assert_eq!(locks.holder("r1").await, None);
    }
}

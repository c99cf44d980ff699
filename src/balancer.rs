/*!
# Work-Stealing Balancer

Watches per-worker load snapshots and plans migrations of not-yet-running
tasks from overloaded workers to underloaded ones.
*/

use crate::worker::LoadSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

/// Utilization above which a worker is a steal source
const OVERLOADED_UTILIZATION: f64 = 0.8;

/// Utilization below which a worker is a steal target
const UNDERLOADED_UTILIZATION: f64 = 0.3;

/// Queue depth below which a worker is a steal target
const UNDERLOADED_QUEUE_DEPTH: usize = 2;

/// Work-stealing tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkStealingConfig {
    /// Master switch
    pub enabled: bool,
    /// Queue depth a source must exceed before it is stolen from
    pub steal_threshold: usize,
    /// Maximum tasks moved per source per tick
    pub max_steal_batch: usize,
    /// Rebalance interval in milliseconds
    pub interval_ms: u64,
}

impl Default for WorkStealingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            steal_threshold: 3,
            max_steal_batch: 2,
            interval_ms: 10_000,
        }
    }
}

/// One planned migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StealPlan {
    /// Overloaded worker losing tasks
    pub source: String,
    /// Underloaded worker receiving them
    pub target: String,
    /// Tasks to move
    pub count: usize,
}

/// Plans task migration from per-worker load snapshots
pub struct WorkStealingBalancer {
    config: WorkStealingConfig,
    loads: RwLock<HashMap<String, LoadSnapshot>>,
}

impl WorkStealingBalancer {
    /// Create a balancer
    pub fn new(config: WorkStealingConfig) -> Self {
        Self {
            config,
            loads: RwLock::new(HashMap::new()),
        }
    }

    /// Record a worker's latest load snapshot
    pub fn update(&self, worker: &str, snapshot: LoadSnapshot) {
        self.loads
            .write()
            .unwrap()
            .insert(worker.to_string(), snapshot);
    }

    /// Forget a worker
    pub fn remove(&self, worker: &str) {
        self.loads.write().unwrap().remove(worker);
    }

    /// Latest utilization per worker
    pub fn utilizations(&self) -> HashMap<String, f64> {
        self.loads
            .read()
            .unwrap()
            .iter()
            .map(|(id, snapshot)| (id.clone(), snapshot.utilization()))
            .collect()
    }

    /// Compute this tick's migrations.
    ///
    /// Each overloaded worker is matched with the currently most-underloaded
    /// target; the batch halves the queue-depth gap, capped by
    /// `max_steal_batch`.
    pub fn plan(&self) -> Vec<StealPlan> {
        if !self.config.enabled {
            return Vec::new();
        }
        let loads = self.loads.read().unwrap();

        let mut overloaded: Vec<(&String, usize)> = loads
            .iter()
            .filter(|(_, s)| {
                s.utilization() > OVERLOADED_UTILIZATION
                    && s.queue_depth > self.config.steal_threshold
            })
            .map(|(id, s)| (id, s.queue_depth))
            .collect();
        // Worst first
        overloaded.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        let mut underloaded: Vec<(&String, usize, f64)> = loads
            .iter()
            .filter(|(_, s)| {
                s.utilization() < UNDERLOADED_UTILIZATION
                    && s.queue_depth < UNDERLOADED_QUEUE_DEPTH
            })
            .map(|(id, s)| (id, s.queue_depth, s.utilization()))
            .collect();

        let mut plans = Vec::new();
        for (source, source_queue) in overloaded {
            // Most underloaded remaining target
            underloaded.sort_by(|a, b| {
                a.2.partial_cmp(&b.2)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.1.cmp(&b.1))
                    .then_with(|| a.0.cmp(b.0))
            });
            let Some(slot) = underloaded
                .iter_mut()
                .find(|(target, _, _)| *target != source)
            else {
                break;
            };

            let gap = source_queue.saturating_sub(slot.1);
            let count = (gap / 2).min(self.config.max_steal_batch);
            if count == 0 {
                continue;
            }

            debug!(source = %source, target = %slot.0, count, "steal planned");
            plans.push(StealPlan {
                source: source.clone(),
                target: slot.0.clone(),
                count,
            });
            // Account for the planned move so later sources see updated depths
            slot.1 += count;
        }
        plans
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(queue_depth: usize, cpu: f64, task_count: usize, capacity: usize) -> LoadSnapshot {
        LoadSnapshot {
            queue_depth,
            cpu,
            memory: cpu,
            task_count,
            capacity,
            ..Default::default()
        }
    }

    #[test]
    fn test_steal_between_imbalanced_workers() {
        let balancer = WorkStealingBalancer::new(WorkStealingConfig {
            steal_threshold: 3,
            max_steal_batch: 2,
            ..Default::default()
        });
        // Overloaded: queue 8, cpu/mem saturated, all slots in use
        balancer.update("w1", snapshot(8, 1.0, 10, 10));
        // Underloaded: queue 1, nearly idle
        balancer.update("w2", snapshot(1, 0.1, 1, 10));

        let plans = balancer.plan();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].source, "w1");
        assert_eq!(plans[0].target, "w2");
        // (8 - 1) / 2 = 3, capped at max_steal_batch
        assert_eq!(plans[0].count, 2);
    }

    #[test]
    fn test_no_steal_when_balanced() {
        let balancer = WorkStealingBalancer::new(WorkStealingConfig::default());
        balancer.update("w1", snapshot(3, 0.5, 5, 10));
        balancer.update("w2", snapshot(3, 0.5, 5, 10));
        assert!(balancer.plan().is_empty());
    }

    #[test]
    fn test_no_steal_below_threshold() {
        let balancer = WorkStealingBalancer::new(WorkStealingConfig {
            steal_threshold: 5,
            ..Default::default()
        });
        // Hot, but the queue is within the threshold
        balancer.update("w1", snapshot(4, 1.0, 10, 10));
        balancer.update("w2", snapshot(0, 0.1, 0, 10));
        assert!(balancer.plan().is_empty());
    }

    #[test]
    fn test_disabled() {
        let balancer = WorkStealingBalancer::new(WorkStealingConfig {
            enabled: false,
            ..Default::default()
        });
        balancer.update("w1", snapshot(8, 1.0, 10, 10));
        balancer.update("w2", snapshot(0, 0.1, 0, 10));
        assert!(balancer.plan().is_empty());
    }

    #[test]
    fn test_two_sources_share_one_target() {
        let balancer = WorkStealingBalancer::new(WorkStealingConfig {
            steal_threshold: 3,
            max_steal_batch: 10,
            ..Default::default()
        });
        balancer.update("w1", snapshot(10, 1.0, 10, 10));
        balancer.update("w2", snapshot(8, 1.0, 10, 10));
        balancer.update("w3", snapshot(0, 0.0, 0, 10));

        let plans = balancer.plan();
        assert_eq!(plans.len(), 2);
        // w1 (deeper queue) is drained first: (10-0)/2 = 5
        assert_eq!(plans[0], StealPlan {
            source: "w1".to_string(),
            target: "w3".to_string(),
            count: 5,
        });
        // w3's simulated depth is now 5: (8-5)/2 = 1
        assert_eq!(plans[1].count, 1);
    }
}

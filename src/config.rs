/*!
# Configuration

The full tuning surface of the coordination core. Every field has a default,
so a partial (or absent) configuration is always valid.
*/

use crate::balancer::WorkStealingConfig;
use crate::breaker::CircuitBreakerConfig;
use crate::error::{CoordinationError, Result};
use crate::executor::ExecutorConfig;
use crate::metrics::AlertThresholds;
use crate::scheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for the coordination manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Default per-task retry budget
    pub max_retries: u32,

    /// Scheduling pump interval: how often due retries are requeued and
    /// ready tasks dispatched, in milliseconds
    pub retry_delay_ms: u64,

    /// Lock-wait budget; doubled, the stale-lock threshold (milliseconds)
    pub resource_timeout_ms: u64,

    /// Request/response budget in the router, in milliseconds
    pub message_timeout_ms: u64,

    /// Whether the deadlock detection loop runs
    pub deadlock_detection: bool,

    /// Deadlock detection interval, in milliseconds
    pub deadlock_interval_ms: u64,

    /// Executor concurrency ceiling
    pub max_concurrent_tasks: usize,

    /// Default per-task execution budget, in milliseconds
    pub default_task_timeout_ms: u64,

    /// Grace between stop signal and force-kill, in milliseconds
    pub kill_timeout_ms: u64,

    /// Retry backoff base, in milliseconds
    pub retry_backoff_base_ms: u64,

    /// Retry backoff ceiling, in milliseconds
    pub retry_backoff_max_ms: u64,

    /// Work-stealing tuning
    pub work_stealing: WorkStealingConfig,

    /// Circuit-breaker tuning, applied per target
    pub circuit_breaker: CircuitBreakerConfig,

    /// Load sampling interval for the predictor, in milliseconds
    pub load_sampling_interval_ms: u64,

    /// Rebalance loop interval, in milliseconds
    pub rebalance_interval_ms: u64,

    /// Samples retained per metrics series and histogram
    pub metrics_retention: usize,

    /// Expected worker heartbeat cadence, in milliseconds
    pub heartbeat_interval_ms: u64,

    /// Consecutive missed heartbeats before a worker is considered dead
    pub heartbeat_miss_limit: u32,

    /// Router/lock/metrics maintenance interval, in milliseconds
    pub maintenance_interval_ms: u64,

    /// Active worker-selection strategy
    pub strategy: String,

    /// Blend weight the hybrid strategy gives the load predictor
    pub predictor_weight: f64,

    /// Terminal tasks retained in history
    pub task_history_capacity: usize,

    /// Default conflict-resolution strategy
    pub conflict_strategy: String,

    /// Whether reported conflicts are resolved immediately
    pub auto_resolve_conflicts: bool,

    /// Cancel (instead of requeue) a deregistering worker's pending tasks
    pub quarantine_on_deregister: bool,

    /// Age at which an optimistic holder is purged, in milliseconds
    pub optimistic_max_age_ms: u64,

    /// Where the best-effort state snapshot is written; `None` disables it
    pub snapshot_path: Option<PathBuf>,

    /// Alert thresholds
    pub alerts: AlertThresholds,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 500,
            resource_timeout_ms: 30_000,
            message_timeout_ms: 30_000,
            deadlock_detection: true,
            deadlock_interval_ms: 10_000,
            max_concurrent_tasks: 10,
            default_task_timeout_ms: 300_000,
            kill_timeout_ms: 5_000,
            retry_backoff_base_ms: 1_000,
            retry_backoff_max_ms: 60_000,
            work_stealing: WorkStealingConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            load_sampling_interval_ms: 5_000,
            rebalance_interval_ms: 10_000,
            metrics_retention: 10_000,
            heartbeat_interval_ms: 10_000,
            heartbeat_miss_limit: 3,
            maintenance_interval_ms: 60_000,
            strategy: "capability".to_string(),
            predictor_weight: 0.3,
            task_history_capacity: 1_000,
            conflict_strategy: "priority".to_string(),
            auto_resolve_conflicts: true,
            quarantine_on_deregister: false,
            optimistic_max_age_ms: 60_000,
            snapshot_path: None,
            alerts: AlertThresholds::default(),
        }
    }
}

impl CoordinationConfig {
    /// The scheduler's slice of this configuration
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            strategy: self.strategy.clone(),
            retry_backoff_base_ms: self.retry_backoff_base_ms,
            retry_backoff_max_ms: self.retry_backoff_max_ms,
            history_capacity: self.task_history_capacity,
            predictor_weight: self.predictor_weight,
        }
    }

    /// The executor's slice of this configuration
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_concurrent_tasks: self.max_concurrent_tasks,
            kill_timeout_ms: self.kill_timeout_ms,
            retry_attempts: 1,
            retry_backoff_base_ms: self.retry_backoff_base_ms,
            retry_backoff_max_ms: self.retry_backoff_max_ms,
            monitor_interval_ms: 5_000,
        }
    }

    /// Reject configurations that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(CoordinationError::system(
                "max_concurrent_tasks must be at least 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.predictor_weight) {
            return Err(CoordinationError::system(
                "predictor_weight must be within [0, 1]",
            ));
        }
        if self.heartbeat_miss_limit == 0 {
            return Err(CoordinationError::system(
                "heartbeat_miss_limit must be at least 1",
            ));
        }
        if self.metrics_retention == 0 {
            return Err(CoordinationError::system(
                "metrics_retention must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let config = CoordinationConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_retries, 3);
        assert!(config.deadlock_detection);
        assert_eq!(config.work_stealing.max_steal_batch, 2);
    }

    #[test]
    fn test_partial_deserialization() {
        let config: CoordinationConfig = serde_json::from_str(
            r#"{
                "max_retries": 5,
                "work_stealing": {
                    "enabled": false,
                    "steal_threshold": 4,
                    "max_steal_batch": 3,
                    "interval_ms": 2000
                }
            }"#,
        )
        .unwrap();
        assert_eq!(config.max_retries, 5);
        assert!(!config.work_stealing.enabled);
        // Unspecified keys fall back to defaults
        assert_eq!(config.message_timeout_ms, 30_000);
    }

    #[test]
    fn test_validation_rejects_zero_capacity() {
        let config = CoordinationConfig {
            max_concurrent_tasks: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}

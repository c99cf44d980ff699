/*!
# Swarm Coordination

The coordination core of a multi-agent task-execution platform:

- **Scheduler**: dependency-respecting task queue with pluggable worker
  selection (capability, round-robin, least-loaded, affinity, hybrid)
- **Resource Locks**: priority-ordered wait queues with wait-for-graph
  deadlock detection and preemption
- **Work Stealing**: migration of queued tasks from overloaded workers,
  informed by a simple linear load predictor
- **Fault Tolerance**: per-worker circuit breakers, timeout races, and
  retry with jittered exponential backoff
- **Conflict Resolution**: priority, timestamp, vote, and optimistic
  version strategies
- **Observability**: counters, gauges, bounded histograms, and threshold
  alerts feeding the balancing loops

## Example Usage

```rust,ignore
use swarm_coordination::{
    CoordinationManager, CoordinationConfig, HandlerRunner,
    TaskSpec, TaskPriority, WorkerSpec,
};
use std::sync::Arc;

let runner = Arc::new(HandlerRunner::new(|task| async move {
    Ok(serde_json::json!({"echo": task.payload}))
}));
let manager = CoordinationManager::new(CoordinationConfig::default(), runner)?;
manager.initialize();

manager.register_worker(
    WorkerSpec::new("w1", "researcher").with_capability("research"),
)?;

let objective = manager.create_objective("summarize the corpus", "sequential");
manager.add_task(objective, TaskSpec::new("research").with_priority(TaskPriority::High))?;
manager.start_objective(objective)?;
```
*/

pub mod balancer;
pub mod breaker;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod executor;
pub mod graph;
pub mod locks;
pub mod metrics;
pub mod optimistic;
pub mod predictor;
pub mod router;
pub mod scheduler;
pub mod task;
pub mod worker;

pub use balancer::{StealPlan, WorkStealingBalancer, WorkStealingConfig};
pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use config::CoordinationConfig;
pub use conflict::{
    Conflict, ConflictKind, ConflictResolver, ConflictStrategy, Resolution, ResolutionContext,
};
pub use coordinator::{
    ComponentHealth, CoordinationManager, CoordinatorStats, HealthReport, HealthStatus, Objective,
    ObjectiveStatus, StateSnapshot,
};
pub use error::{CoordinationError, Result};
pub use events::{CoordinationEvent, EventBus};
pub use executor::{
    ExecutionContext, ExecutorConfig, HandlerRunner, ProcessRunner, TaskExecutor, TaskHandler,
    TaskRunner,
};
pub use graph::{DependencyGraph, NodeStatus};
pub use locks::{DeadlockCycle, ResourceLockManager};
pub use metrics::{Alert, AlertThresholds, DerivedMetrics, MetricsCollector, MetricsSnapshot};
pub use optimistic::OptimisticLockManager;
pub use predictor::{LoadPrediction, LoadPredictor};
pub use router::{Message, MessageHandler, MessageRouter, Recipient};
pub use scheduler::{
    Dispatch, FailDisposition, SchedulerConfig, SelectionInput, SelectionStrategy, TaskScheduler,
};
pub use task::{
    ResourceMode, ResourceRequest, Task, TaskFailure, TaskOutcome, TaskPriority, TaskSpec,
    TaskStatus,
};
pub use worker::{LoadSnapshot, ResourceLimits, Worker, WorkerSpec, WorkerStatus};

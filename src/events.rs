/*!
# Coordination Events

The closed set of signals components exchange. Cross-component feedback
(metrics, rebalancing, alerting) consumes these variants instead of holding
references into other components.
*/

use crate::breaker::CircuitState;
use serde::Serialize;
use tokio::sync::broadcast;

/// Default buffer for the event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Everything that can happen inside the coordination core
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoordinationEvent {
    /// A task was admitted
    TaskCreated { task_id: String },
    /// A task's dependencies are all satisfied
    TaskReady { task_id: String },
    /// A task was bound to a worker
    TaskAssigned { task_id: String, worker_id: String },
    /// A task began executing
    TaskStarted { task_id: String, worker_id: String },
    /// A task finished with a result
    TaskCompleted {
        task_id: String,
        worker_id: String,
        duration_ms: u64,
    },
    /// A task attempt failed
    TaskFailed {
        task_id: String,
        error_kind: String,
        will_retry: bool,
    },
    /// A task was cancelled
    TaskCancelled { task_id: String, cause: String },
    /// No worker could be selected this tick
    NoSuitableWorker { task_id: String },
    /// A worker registered
    WorkerRegistered { worker_id: String },
    /// A worker deregistered cleanly
    WorkerDeregistered { worker_id: String },
    /// A worker missed its heartbeat budget
    WorkerDead { worker_id: String },
    /// A wait-for cycle was found
    DeadlockDetected {
        workers: Vec<String>,
        resources: Vec<String>,
    },
    /// A deadlock was resolved by preempting a worker
    DeadlockBroken { victim: String },
    /// Tasks migrated from an overloaded worker
    WorkStealing {
        source: String,
        target: String,
        count: usize,
    },
    /// A circuit breaker changed state
    CircuitStateChanged { target: String, state: CircuitState },
    /// A contention was resolved
    ConflictResolved { conflict_id: String, winner: String },
    /// A metric crossed its threshold
    Alert {
        name: String,
        message: String,
        value: f64,
    },
    /// Internal invariant breach, logged but never fatal
    SystemError { message: String },
}

impl CoordinationEvent {
    /// Stable name used as a metrics counter key
    pub fn name(&self) -> &'static str {
        match self {
            CoordinationEvent::TaskCreated { .. } => "task_created",
            CoordinationEvent::TaskReady { .. } => "task_ready",
            CoordinationEvent::TaskAssigned { .. } => "task_assigned",
            CoordinationEvent::TaskStarted { .. } => "task_started",
            CoordinationEvent::TaskCompleted { .. } => "task_completed",
            CoordinationEvent::TaskFailed { .. } => "task_failed",
            CoordinationEvent::TaskCancelled { .. } => "task_cancelled",
            CoordinationEvent::NoSuitableWorker { .. } => "no_suitable_worker",
            CoordinationEvent::WorkerRegistered { .. } => "worker_registered",
            CoordinationEvent::WorkerDeregistered { .. } => "worker_deregistered",
            CoordinationEvent::WorkerDead { .. } => "worker_dead",
            CoordinationEvent::DeadlockDetected { .. } => "deadlock_detected",
            CoordinationEvent::DeadlockBroken { .. } => "deadlock_broken",
            CoordinationEvent::WorkStealing { .. } => "work_stealing",
            CoordinationEvent::CircuitStateChanged { .. } => "circuit_state_changed",
            CoordinationEvent::ConflictResolved { .. } => "conflict_resolved",
            CoordinationEvent::Alert { .. } => "alert",
            CoordinationEvent::SystemError { .. } => "system_error",
        }
    }
}

/// Broadcast channel the components publish to.
///
/// Constructor-injected into every component that emits; nothing in the core
/// reaches for a global.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoordinationEvent>,
}

impl EventBus {
    /// Create a bus with the default buffer
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Lagging or absent subscribers are not an error.
    pub fn emit(&self, event: CoordinationEvent) {
        tracing::debug!(event = event.name(), "coordination event");
        let _ = self.tx.send(event);
    }

    /// Subscribe to the event stream
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinationEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(CoordinationEvent::TaskCreated {
            task_id: "t1".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "task_created");
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new();
        // Must not panic or error
        bus.emit(CoordinationEvent::SystemError {
            message: "nothing listening".to_string(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }
}

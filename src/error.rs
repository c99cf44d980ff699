//! Error types for the coordination core.
//!
//! Every failure the core can produce is one of these kinds; free-text detail
//! lives in the structured fields and is only formatted at the boundary.

use thiserror::Error;
use uuid::Uuid;

/// Main error type for coordination operations
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// A submitted task references dependencies that are neither in the graph
    /// nor already completed
    #[error("task '{task_id}' references unknown dependencies: {missing:?}")]
    DependencyMissing {
        /// Task being added
        task_id: String,
        /// The unresolved predecessor ids
        missing: Vec<String>,
    },

    /// The dependency graph contains a cycle
    #[error("dependency cycle detected: {0:?}")]
    CycleDetected(Vec<String>),

    /// Worker selection found zero candidates; the task stays pending
    #[error("no suitable worker for task '{task_id}'")]
    NoSuitableWorker {
        /// Task that could not be placed
        task_id: String,
    },

    /// An acquisition attempt outlived the resource timeout
    #[error("worker '{worker}' timed out waiting for resource '{resource}'")]
    ResourceTimeout {
        /// Contended resource
        resource: String,
        /// Waiting worker
        worker: String,
    },

    /// A lock was held long enough to be considered abandoned
    #[error("stale lock on resource '{resource}' held by '{holder}'")]
    ResourceLockStale {
        /// Resource whose lock went stale
        resource: String,
        /// Worker that held it
        holder: String,
    },

    /// A wait-for cycle was found between workers
    #[error("deadlock between workers {workers:?} on resources {resources:?}")]
    Deadlock {
        /// Workers in the cycle
        workers: Vec<String>,
        /// Resources in the cycle
        resources: Vec<String>,
    },

    /// The per-target circuit breaker is open
    #[error("circuit open for '{target}'")]
    CircuitOpen {
        /// Breaker target (e.g. `worker:<id>`)
        target: String,
    },

    /// A task exceeded its time budget
    #[error("task '{task_id}' exceeded its {timeout_ms} ms budget")]
    Timeout {
        /// Timed-out task
        task_id: String,
        /// Budget that was exceeded
        timeout_ms: u64,
    },

    /// A task breached a hard resource limit
    #[error("task '{task_id}' exceeded resource limits: {detail}")]
    ResourceExceeded {
        /// Offending task
        task_id: String,
        /// Which limit, and by how much
        detail: String,
    },

    /// The worker reported a non-zero exit or an execution error
    #[error("task '{task_id}' execution failed: {message}")]
    ExecutionFailure {
        /// Failed task
        task_id: String,
        /// stderr or error text from the worker
        message: String,
    },

    /// Terminal by design; `cause` names the parent for cascade cancellation
    #[error("'{id}' cancelled (cause: {cause})")]
    Cancelled {
        /// Cancelled task or waiter
        id: String,
        /// Why it was cancelled
        cause: String,
    },

    /// A request/response exchange through the router timed out
    #[error("response to message {correlation_id} timed out")]
    ResponseTimeout {
        /// Correlation id of the unanswered request
        correlation_id: Uuid,
    },

    /// Optimistic concurrency check failed
    #[error("version conflict on '{resource}': expected {expected}, found {actual}")]
    VersionConflict {
        /// Versioned resource
        resource: String,
        /// Version the caller validated against
        expected: u64,
        /// Version actually current
        actual: u64,
    },

    /// Referenced worker is not registered
    #[error("unknown worker '{0}'")]
    WorkerUnknown(String),

    /// Referenced task is not tracked
    #[error("unknown task '{0}'")]
    TaskUnknown(String),

    /// Referenced objective does not exist
    #[error("unknown objective {0}")]
    ObjectiveUnknown(Uuid),

    /// Internal invariant breach; logged and emitted, never crashes the process
    #[error("internal error: {0}")]
    System(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenient Result type using CoordinationError
pub type Result<T> = std::result::Result<T, CoordinationError>;

impl CoordinationError {
    /// Create an internal error
    pub fn system(msg: impl Into<String>) -> Self {
        CoordinationError::System(msg.into())
    }

    /// Create an execution failure for a task
    pub fn execution(task_id: impl Into<String>, msg: impl Into<String>) -> Self {
        CoordinationError::ExecutionFailure {
            task_id: task_id.into(),
            message: msg.into(),
        }
    }

    /// Create a cancellation with an explicit cause
    pub fn cancelled(id: impl Into<String>, cause: impl Into<String>) -> Self {
        CoordinationError::Cancelled {
            id: id.into(),
            cause: cause.into(),
        }
    }

    /// Stable kind tag, used for metrics and for the error attached to a task
    pub fn kind(&self) -> &'static str {
        match self {
            CoordinationError::DependencyMissing { .. } => "dependency_missing",
            CoordinationError::CycleDetected(_) => "cycle_detected",
            CoordinationError::NoSuitableWorker { .. } => "no_suitable_worker",
            CoordinationError::ResourceTimeout { .. } => "resource_timeout",
            CoordinationError::ResourceLockStale { .. } => "resource_lock_stale",
            CoordinationError::Deadlock { .. } => "deadlock",
            CoordinationError::CircuitOpen { .. } => "circuit_open",
            CoordinationError::Timeout { .. } => "timeout",
            CoordinationError::ResourceExceeded { .. } => "resource_exceeded",
            CoordinationError::ExecutionFailure { .. } => "execution_failure",
            CoordinationError::Cancelled { .. } => "cancelled",
            CoordinationError::ResponseTimeout { .. } => "response_timeout",
            CoordinationError::VersionConflict { .. } => "version_conflict",
            CoordinationError::WorkerUnknown(_) => "worker_unknown",
            CoordinationError::TaskUnknown(_) => "task_unknown",
            CoordinationError::ObjectiveUnknown(_) => "objective_unknown",
            CoordinationError::System(_) => "system",
            CoordinationError::Serialization(_) => "serialization",
            CoordinationError::Io(_) => "io",
        }
    }

    /// Whether the task-level retry policy may recover from this error.
    ///
    /// Transient kinds are retried with backoff; everything else surfaces to
    /// the planner as the task's final state.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinationError::ResourceTimeout { .. }
                | CoordinationError::ResourceLockStale { .. }
                | CoordinationError::Deadlock { .. }
                | CoordinationError::CircuitOpen { .. }
                | CoordinationError::Timeout { .. }
                | CoordinationError::ExecutionFailure { .. }
                | CoordinationError::ResponseTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoordinationError::CircuitOpen {
            target: "worker:w1".to_string(),
        };
        assert_eq!(err.to_string(), "circuit open for 'worker:w1'");
        assert_eq!(err.kind(), "circuit_open");
    }

    #[test]
    fn test_retryability() {
        assert!(CoordinationError::Timeout {
            task_id: "t1".to_string(),
            timeout_ms: 1000,
        }
        .is_retryable());

        assert!(!CoordinationError::ResourceExceeded {
            task_id: "t1".to_string(),
            detail: "memory".to_string(),
        }
        .is_retryable());

        assert!(!CoordinationError::cancelled("t2", "t1").is_retryable());
    }
}

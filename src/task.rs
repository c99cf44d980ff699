/*!
# Task Model

Defines the unit of work the coordinator schedules: its priority, dependency
and resource declarations, lifecycle status, and the structured outcome a
worker reports back.
*/

use crate::error::CoordinationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task priority, ordered from least to most urgent
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    /// Background work
    Low,
    /// Normal work
    #[default]
    Medium,
    /// Urgent work
    High,
    /// Must run before anything else
    Critical,
}

impl TaskPriority {
    /// Numeric weight, used where an ordering integer is needed (e.g. lock
    /// wait queues)
    pub fn weight(&self) -> i32 {
        match self {
            TaskPriority::Low => 0,
            TaskPriority::Medium => 1,
            TaskPriority::High => 2,
            TaskPriority::Critical => 3,
        }
    }
}

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting on dependencies
    #[default]
    Pending,
    /// Dependencies satisfied, eligible for selection
    Ready,
    /// Placed on a worker's queue
    Queued,
    /// Bound to a worker, not yet executing
    Assigned,
    /// Executing on a worker
    Running,
    /// Finished with a result
    Completed,
    /// Finished with an error after exhausting retries
    Failed,
    /// Stopped by request or cascade
    Cancelled,
}

impl TaskStatus {
    /// Whether the status is final
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Access mode for a declared resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceMode {
    /// Shared read intent
    Read,
    /// Exclusive write intent
    Write,
}

/// A resource a task needs locked for the duration of its execution
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Resource id
    pub resource: String,
    /// Declared access mode
    pub mode: ResourceMode,
}

impl ResourceRequest {
    /// Declare read access to a resource
    pub fn read(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            mode: ResourceMode::Read,
        }
    }

    /// Declare write access to a resource
    pub fn write(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            mode: ResourceMode::Write,
        }
    }
}

/// Specification of a task, as supplied by the planner.
///
/// Status, attempts, and timestamps are coordinator-owned and do not appear
/// here; they are filled in when the spec is admitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Task id; generated when not supplied
    pub id: String,
    /// Type tag matched against worker capabilities
    pub task_type: String,
    /// Priority
    pub priority: TaskPriority,
    /// Ids of tasks that must complete first
    pub dependencies: Vec<String>,
    /// Capabilities the executing worker must declare
    pub required_capabilities: Vec<String>,
    /// Resources to lock before execution
    pub required_resources: Vec<ResourceRequest>,
    /// Execution budget in milliseconds; the configured default applies when absent
    pub timeout_ms: Option<u64>,
    /// Retry budget; the configured default applies when absent
    pub max_retries: Option<u32>,
    /// Expected peak memory in bytes, used by the load predictor
    pub memory_hint_bytes: Option<u64>,
    /// Opaque work description handed to the worker
    pub payload: serde_json::Value,
}

impl TaskSpec {
    /// Create a new spec with a generated id
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            priority: TaskPriority::Medium,
            dependencies: Vec::new(),
            required_capabilities: Vec::new(),
            required_resources: Vec::new(),
            timeout_ms: None,
            max_retries: None,
            memory_hint_bytes: None,
            payload: serde_json::Value::Null,
        }
    }

    /// Override the generated id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set priority
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Add a dependency
    pub fn depends_on(mut self, task_id: impl Into<String>) -> Self {
        self.dependencies.push(task_id.into());
        self
    }

    /// Require a capability of the executing worker
    pub fn requires_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.push(capability.into());
        self
    }

    /// Declare a resource to lock
    pub fn with_resource(mut self, request: ResourceRequest) -> Self {
        self.required_resources.push(request);
        self
    }

    /// Set the execution budget
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Set the retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set the expected memory footprint
    pub fn with_memory_hint(mut self, bytes: u64) -> Self {
        self.memory_hint_bytes = Some(bytes);
        self
    }

    /// Set the payload
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

fn default_quality() -> f64 {
    0.8
}

fn default_completeness() -> f64 {
    1.0
}

fn default_accuracy() -> f64 {
    0.9
}

/// Structured result a worker reports for a completed task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// Primary result value
    pub result: serde_json::Value,
    /// Produced artifacts
    #[serde(default)]
    pub artifacts: Vec<serde_json::Value>,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Self-assessed quality in [0,1]
    #[serde(default = "default_quality")]
    pub quality: f64,
    /// Self-assessed completeness in [0,1]
    #[serde(default = "default_completeness")]
    pub completeness: f64,
    /// Self-assessed accuracy in [0,1]
    #[serde(default = "default_accuracy")]
    pub accuracy: f64,
}

impl TaskOutcome {
    /// Build an outcome from a structured result value
    pub fn structured(result: serde_json::Value) -> Self {
        Self {
            result,
            artifacts: Vec::new(),
            metadata: serde_json::Value::Null,
            quality: default_quality(),
            completeness: default_completeness(),
            accuracy: default_accuracy(),
        }
    }

    /// Build an outcome from unparseable raw text
    pub fn raw_text(text: impl Into<String>) -> Self {
        Self {
            result: serde_json::Value::String(text.into()),
            artifacts: Vec::new(),
            metadata: serde_json::Value::Null,
            quality: 0.5,
            completeness: default_completeness(),
            accuracy: default_accuracy(),
        }
    }
}

/// Structured error attached to a task in its final state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Error kind tag (see [`CoordinationError::kind`])
    pub kind: String,
    /// Human-readable detail
    pub message: String,
    /// Id of the parent whose failure cascaded here, if any
    pub cause: Option<String>,
}

impl From<&CoordinationError> for TaskFailure {
    fn from(err: &CoordinationError) -> Self {
        let cause = match err {
            CoordinationError::Cancelled { cause, .. } => Some(cause.clone()),
            _ => None,
        };
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            cause,
        }
    }
}

/// A scheduled unit of work, owned by the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Task id
    pub id: String,
    /// Type tag matched against worker capabilities
    pub task_type: String,
    /// Priority
    pub priority: TaskPriority,
    /// Ids of tasks that must complete first
    pub dependencies: Vec<String>,
    /// Capabilities the executing worker must declare
    pub required_capabilities: Vec<String>,
    /// Resources to lock before execution
    pub required_resources: Vec<ResourceRequest>,
    /// Execution budget in milliseconds
    pub timeout_ms: u64,
    /// Retry budget
    pub max_retries: u32,
    /// Expected peak memory in bytes
    pub memory_hint_bytes: Option<u64>,
    /// Opaque work description
    pub payload: serde_json::Value,
    /// Lifecycle status
    pub status: TaskStatus,
    /// Executions started so far; never exceeds `max_retries + 1`
    pub attempts: u32,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// First execution start
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal-state timestamp
    pub completed_at: Option<DateTime<Utc>>,
    /// Worker currently bound to the task
    pub assigned_worker: Option<String>,
    /// Result, present iff completed
    pub result: Option<TaskOutcome>,
    /// Error, present iff failed or cancelled
    pub error: Option<TaskFailure>,
}

impl Task {
    /// Admit a spec, filling coordinator-owned fields from the given defaults
    pub fn from_spec(spec: TaskSpec, default_timeout_ms: u64, default_max_retries: u32) -> Self {
        Self {
            id: spec.id,
            task_type: spec.task_type,
            priority: spec.priority,
            dependencies: spec.dependencies,
            required_capabilities: spec.required_capabilities,
            required_resources: spec.required_resources,
            timeout_ms: spec.timeout_ms.unwrap_or(default_timeout_ms),
            max_retries: spec.max_retries.unwrap_or(default_max_retries),
            memory_hint_bytes: spec.memory_hint_bytes,
            payload: spec.payload,
            status: TaskStatus::Pending,
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            assigned_worker: None,
            result: None,
            error: None,
        }
    }

    /// Whether the task has reached a final state
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether another attempt fits the retry budget
    pub fn can_retry(&self) -> bool {
        self.attempts <= self.max_retries
    }

    /// Record the start of an execution attempt
    pub fn mark_started(&mut self, worker_id: &str) {
        self.status = TaskStatus::Running;
        self.assigned_worker = Some(worker_id.to_string());
        self.attempts += 1;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Record successful completion
    pub fn mark_completed(&mut self, outcome: TaskOutcome) {
        self.status = TaskStatus::Completed;
        self.result = Some(outcome);
        self.error = None;
        self.completed_at = Some(Utc::now());
    }

    /// Record terminal failure
    pub fn mark_failed(&mut self, failure: TaskFailure) {
        self.status = TaskStatus::Failed;
        self.error = Some(failure);
        self.completed_at = Some(Utc::now());
    }

    /// Record cancellation
    pub fn mark_cancelled(&mut self, failure: TaskFailure) {
        self.status = TaskStatus::Cancelled;
        self.error = Some(failure);
        self.completed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_builder() {
        let spec = TaskSpec::new("analysis")
            .with_id("t1")
            .with_priority(TaskPriority::High)
            .depends_on("t0")
            .requires_capability("python")
            .with_resource(ResourceRequest::write("db"))
            .with_timeout_ms(60_000)
            .with_max_retries(2);

        assert_eq!(spec.id, "t1");
        assert_eq!(spec.priority, TaskPriority::High);
        assert_eq!(spec.dependencies, vec!["t0".to_string()]);
        assert_eq!(spec.required_resources[0].mode, ResourceMode::Write);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Medium);
        assert!(TaskPriority::Medium > TaskPriority::Low);
    }

    #[test]
    fn test_retry_budget() {
        let mut task = Task::from_spec(TaskSpec::new("x").with_max_retries(2), 1000, 0);
        assert!(task.can_retry());

        task.mark_started("w1");
        task.mark_started("w1");
        task.mark_started("w1");
        assert_eq!(task.attempts, 3);
        // Budget is max_retries + 1 total attempts
        assert!(!task.can_retry());
    }

    #[test]
    fn test_outcome_defaults() {
        let outcome: TaskOutcome = serde_json::from_value(serde_json::json!({
            "result": {"answer": 42}
        }))
        .unwrap();
        assert_eq!(outcome.quality, 0.8);
        assert_eq!(outcome.completeness, 1.0);
        assert_eq!(outcome.accuracy, 0.9);

        let raw = TaskOutcome::raw_text("plain output");
        assert_eq!(raw.quality, 0.5);
    }

    #[test]
    fn test_terminal_states() {
        let mut task = Task::from_spec(TaskSpec::new("x"), 1000, 3);
        assert!(!task.is_terminal());

        task.mark_completed(TaskOutcome::structured(serde_json::json!({})));
        assert!(task.is_terminal());
        assert!(task.result.is_some());
        assert!(task.error.is_none());
    }
}

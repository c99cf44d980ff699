/*!
# Worker Model

Registered executors, their declared capabilities and limits, and the load
snapshots they report through heartbeats.
*/

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Instant;

/// Queue depth at which the normalized queue factor saturates
const QUEUE_DEPTH_NORM: f64 = 10.0;

/// Worker lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Registered, not yet accepting work
    Initializing,
    /// No tasks in flight
    Idle,
    /// At least one task in flight
    Busy,
    /// Draining before deregistration
    Terminating,
    /// Deregistered
    Terminated,
}

impl WorkerStatus {
    /// Whether the worker may receive new assignments
    pub fn accepts_work(&self) -> bool {
        matches!(self, WorkerStatus::Idle | WorkerStatus::Busy)
    }
}

/// Hard resource limits a worker enforces on its tasks
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory ceiling in bytes
    pub memory_bytes: u64,
    /// CPU ceiling in cores
    pub cpu_cores: f64,
    /// Disk ceiling in bytes
    pub disk_bytes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 512 * 1024 * 1024,
            cpu_cores: 1.0,
            disk_bytes: 1024 * 1024 * 1024,
        }
    }
}

/// Registration data supplied by the worker runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Worker id
    pub id: String,
    /// Worker type tag
    pub worker_type: String,
    /// Declared capabilities (languages, frameworks, tools, domains)
    pub capabilities: Vec<String>,
    /// Selection priority; higher wins ties
    pub priority: i32,
    /// Maximum tasks in flight
    pub max_concurrent: usize,
    /// Hard limits enforced on this worker's tasks
    pub resource_limits: ResourceLimits,
}

impl WorkerSpec {
    /// Create a spec with defaults
    pub fn new(id: impl Into<String>, worker_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            worker_type: worker_type.into(),
            capabilities: Vec::new(),
            priority: 0,
            max_concurrent: 1,
            resource_limits: ResourceLimits::default(),
        }
    }

    /// Declare a capability
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    /// Set selection priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the concurrency ceiling
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Set resource limits
    pub fn with_resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = limits;
        self
    }
}

/// Load snapshot reported in a heartbeat
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoadSnapshot {
    /// Tasks waiting on the worker's queue
    pub queue_depth: usize,
    /// CPU load in [0,1]
    pub cpu: f64,
    /// Memory load in [0,1]
    pub memory: f64,
    /// Tasks currently in flight
    pub task_count: usize,
    /// Concurrency ceiling
    pub capacity: usize,
    /// Mean task duration in milliseconds
    pub avg_task_duration_ms: f64,
    /// Affinity score reported by the worker
    pub affinity_score: f64,
    /// Throughput efficiency reported by the worker
    pub efficiency: f64,
}

impl LoadSnapshot {
    /// Normalized utilization in [0,1]: the average of queue, cpu, memory,
    /// and task-slot factors.
    pub fn utilization(&self) -> f64 {
        let queue = (self.queue_depth as f64 / QUEUE_DEPTH_NORM).min(1.0);
        let cpu = self.cpu.clamp(0.0, 1.0);
        let memory = self.memory.clamp(0.0, 1.0);
        let slots = if self.capacity == 0 {
            1.0
        } else {
            (self.task_count as f64 / self.capacity as f64).min(1.0)
        };
        (queue + cpu + memory + slots) / 4.0
    }
}

/// A registered worker, owned by the coordination manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    /// Worker id
    pub id: String,
    /// Worker type tag
    pub worker_type: String,
    /// Declared capabilities
    pub capabilities: Vec<String>,
    /// Selection priority
    pub priority: i32,
    /// Maximum tasks in flight
    pub max_concurrent: usize,
    /// Hard limits enforced on this worker's tasks
    pub resource_limits: ResourceLimits,
    /// Lifecycle status
    pub status: WorkerStatus,
    /// Ids of tasks currently in flight
    pub current_tasks: HashSet<String>,
    /// Health score in [0,1]
    pub health: f64,
    /// Latest reported load snapshot
    pub load: LoadSnapshot,
    /// Registration timestamp
    pub registered_at: DateTime<Utc>,
    /// Monotonic instant of the last heartbeat
    #[serde(skip)]
    pub last_heartbeat: Option<Instant>,
}

impl Worker {
    /// Create a worker from its registration spec
    pub fn from_spec(spec: WorkerSpec) -> Self {
        Self {
            id: spec.id,
            worker_type: spec.worker_type,
            capabilities: spec.capabilities,
            priority: spec.priority,
            max_concurrent: spec.max_concurrent,
            resource_limits: spec.resource_limits,
            status: WorkerStatus::Idle,
            current_tasks: HashSet::new(),
            health: 1.0,
            load: LoadSnapshot::default(),
            registered_at: Utc::now(),
            last_heartbeat: Some(Instant::now()),
        }
    }

    /// Fraction of concurrency slots in use, in [0,1]
    pub fn workload(&self) -> f64 {
        if self.max_concurrent == 0 {
            return 1.0;
        }
        (self.current_tasks.len() as f64 / self.max_concurrent as f64).min(1.0)
    }

    /// Whether a new task may be assigned right now
    pub fn can_accept(&self) -> bool {
        self.status.accepts_work() && self.current_tasks.len() < self.max_concurrent
    }

    /// Whether the worker's capabilities cover the given requirements
    pub fn covers(&self, required: &[String]) -> bool {
        required.iter().all(|cap| self.capabilities.contains(cap))
    }

    /// Whether a heartbeat arrived within `miss_limit` intervals
    pub fn is_alive(&self, heartbeat_interval_ms: u64, miss_limit: u32) -> bool {
        let budget = heartbeat_interval_ms as u128 * miss_limit as u128;
        self.last_heartbeat
            .map(|hb| hb.elapsed().as_millis() < budget)
            .unwrap_or(false)
    }

    /// Record a task entering the worker; keeps `busy ⇔ tasks in flight`
    pub fn task_started(&mut self, task_id: &str) {
        self.current_tasks.insert(task_id.to_string());
        if self.status == WorkerStatus::Idle {
            self.status = WorkerStatus::Busy;
        }
    }

    /// Record a task leaving the worker
    pub fn task_finished(&mut self, task_id: &str) {
        self.current_tasks.remove(task_id);
        if self.current_tasks.is_empty() && self.status == WorkerStatus::Busy {
            self.status = WorkerStatus::Idle;
        }
    }

    /// Apply a heartbeat
    pub fn heartbeat(&mut self, load: LoadSnapshot) {
        self.load = load;
        self.last_heartbeat = Some(Instant::now());
    }
}

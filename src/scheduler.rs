/*!
# Task Scheduler

Dependency-respecting task queue with pluggable worker selection. Tasks are
owned here; per-worker queues are indices kept for steal visibility.
*/

use crate::error::{CoordinationError, Result};
use crate::events::{CoordinationEvent, EventBus};
use crate::graph::DependencyGraph;
use crate::metrics::{MetricsCollector, RingBuffer};
use crate::predictor::LoadPredictor;
use crate::task::{Task, TaskFailure, TaskOutcome, TaskStatus};
use crate::worker::Worker;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Scheduler tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Active selection strategy
    pub strategy: String,
    /// Backoff base for task retries, in milliseconds
    pub retry_backoff_base_ms: u64,
    /// Backoff ceiling, in milliseconds
    pub retry_backoff_max_ms: u64,
    /// Terminal tasks retained for audit
    pub history_capacity: usize,
    /// Blend weight the hybrid strategy gives the load predictor
    pub predictor_weight: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: "capability".to_string(),
            retry_backoff_base_ms: 1_000,
            retry_backoff_max_ms: 60_000,
            history_capacity: 1_000,
            predictor_weight: 0.3,
        }
    }
}

/// Everything a strategy may look at when selecting a worker
pub struct SelectionInput<'a> {
    /// The task being placed
    pub task: &'a Task,
    /// Candidate workers, including ineligible ones
    pub workers: &'a [Worker],
    /// task_type → worker that last completed that type
    pub affinity: &'a HashMap<String, String>,
}

impl SelectionInput<'_> {
    /// Workers that may take the task right now, in stable id order
    pub fn eligible(&self) -> Vec<&Worker> {
        let mut workers: Vec<&Worker> = self
            .workers
            .iter()
            .filter(|w| w.can_accept() && w.covers(&self.task.required_capabilities))
            .collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }
}

/// Worker-selection policy, registered by name at startup
pub trait SelectionStrategy: Send + Sync {
    /// Registry key
    fn name(&self) -> &'static str;

    /// Pick a worker for the task, or `None` when no candidate fits
    fn select(&self, input: &SelectionInput<'_>) -> Option<String>;
}

/// Reported load when a snapshot exists, slot usage otherwise
fn effective_load(worker: &Worker) -> f64 {
    if worker.load.capacity > 0 {
        worker.load.utilization()
    } else {
        worker.workload()
    }
}

/// Universal tie-break: score desc, priority desc, load asc, id asc
fn pick_best(mut scored: Vec<(&Worker, f64)>) -> Option<String> {
    scored.sort_by(|(a, sa), (b, sb)| {
        sb.partial_cmp(sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.priority.cmp(&a.priority))
            .then_with(|| {
                effective_load(a)
                    .partial_cmp(&effective_load(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.id.cmp(&b.id))
    });
    scored.first().map(|(w, _)| w.id.clone())
}

/// Capability matching with the universal tie-break
pub struct CapabilityStrategy;

impl SelectionStrategy for CapabilityStrategy {
    fn name(&self) -> &'static str {
        "capability"
    }

    fn select(&self, input: &SelectionInput<'_>) -> Option<String> {
        pick_best(input.eligible().into_iter().map(|w| (w, 1.0)).collect())
    }
}

/// Rotate through eligible workers
pub struct RoundRobinStrategy {
    cursor: AtomicUsize,
}

impl RoundRobinStrategy {
    /// Create with the cursor at zero
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionStrategy for RoundRobinStrategy {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select(&self, input: &SelectionInput<'_>) -> Option<String> {
        let eligible = input.eligible();
        if eligible.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % eligible.len();
        Some(eligible[idx].id.clone())
    }
}

/// Minimum current utilization
pub struct LeastLoadedStrategy;

impl SelectionStrategy for LeastLoadedStrategy {
    fn name(&self) -> &'static str {
        "least_loaded"
    }

    fn select(&self, input: &SelectionInput<'_>) -> Option<String> {
        pick_best(
            input
                .eligible()
                .into_iter()
                .map(|w| (w, 1.0 - effective_load(w)))
                .collect(),
        )
    }
}

/// Prefer the worker that last completed this task type
pub struct AffinityStrategy;

impl SelectionStrategy for AffinityStrategy {
    fn name(&self) -> &'static str {
        "affinity"
    }

    fn select(&self, input: &SelectionInput<'_>) -> Option<String> {
        if let Some(previous) = input.affinity.get(&input.task.task_type) {
            if input.eligible().iter().any(|w| &w.id == previous) {
                return Some(previous.clone());
            }
        }
        CapabilityStrategy.select(input)
    }
}

/// Weights for the hybrid score; normalized over the set before use
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridWeights {
    /// Weight of the inverse-load score
    pub load: f64,
    /// Weight of the health score
    pub performance: f64,
    /// Weight of the capability-focus score
    pub capability: f64,
    /// Weight of the affinity score
    pub affinity: f64,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            load: 0.3,
            performance: 0.25,
            capability: 0.25,
            affinity: 0.2,
        }
    }
}

/// Weighted blend of load, health, capability focus, and affinity, tilted by
/// the load predictor
pub struct HybridStrategy {
    weights: HybridWeights,
    predictor: Arc<LoadPredictor>,
    predictor_weight: f64,
}

impl HybridStrategy {
    /// Create a hybrid strategy around the shared predictor
    pub fn new(weights: HybridWeights, predictor: Arc<LoadPredictor>, predictor_weight: f64) -> Self {
        Self {
            weights,
            predictor,
            predictor_weight: predictor_weight.clamp(0.0, 1.0),
        }
    }

    fn instant_score(&self, worker: &Worker, input: &SelectionInput<'_>) -> f64 {
        let load_score = 1.0 - effective_load(worker);
        let perf_score = worker.health.clamp(0.0, 1.0);
        let cap_score = if worker.capabilities.is_empty() {
            1.0
        } else {
            (input.task.required_capabilities.len().max(1) as f64
                / worker.capabilities.len() as f64)
                .min(1.0)
        };
        let affinity_score = match input.affinity.get(&input.task.task_type) {
            Some(previous) if previous == &worker.id => 1.0,
            _ => 0.0,
        };

        let w = &self.weights;
        let total = w.load + w.performance + w.capability + w.affinity;
        if total <= 0.0 {
            return load_score;
        }
        (w.load * load_score
            + w.performance * perf_score
            + w.capability * cap_score
            + w.affinity * affinity_score)
            / total
    }
}

impl SelectionStrategy for HybridStrategy {
    fn name(&self) -> &'static str {
        "hybrid"
    }

    fn select(&self, input: &SelectionInput<'_>) -> Option<String> {
        let scored = input
            .eligible()
            .into_iter()
            .map(|worker| {
                let instant = self.instant_score(worker, input);
                let score = match self.predictor.predict_with_task(&worker.id, input.task) {
                    Some(predicted) => {
                        (1.0 - self.predictor_weight) * instant
                            + self.predictor_weight * (1.0 - predicted)
                    }
                    None => instant,
                };
                (worker, score)
            })
            .collect();
        pick_best(scored)
    }
}

/// A task bound to a worker, ready to hand to the executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    /// Task to run
    pub task_id: String,
    /// Worker it is bound to
    pub worker_id: String,
}

/// What `fail` decided to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailDisposition {
    /// Requeued; eligible again after the backoff delay
    Retried {
        /// Backoff applied, in milliseconds
        backoff_ms: u64,
    },
    /// Terminal; these dependents were cascade-cancelled
    Failed {
        /// Transitively cancelled task ids
        cancelled: Vec<String>,
    },
}

/// Tasks a removed worker leaves behind
#[derive(Debug, Clone, Default)]
pub struct WorkerRemoval {
    /// Queued/assigned tasks put back for re-dispatch (or cancelled under
    /// quarantine)
    pub requeued: Vec<String>,
    /// Running tasks the caller must fail through the retry path
    pub running: Vec<String>,
}

struct RetryEntry {
    task_id: String,
    due: Instant,
}

struct SchedulerState {
    tasks: HashMap<String, Task>,
    graph: DependencyGraph,
    worker_queues: HashMap<String, VecDeque<String>>,
    retries: Vec<RetryEntry>,
    history: RingBuffer<Task>,
    affinity: HashMap<String, String>,
}

/// The scheduler
pub struct TaskScheduler {
    config: SchedulerConfig,
    state: RwLock<SchedulerState>,
    strategies: RwLock<HashMap<String, Arc<dyn SelectionStrategy>>>,
    active_strategy: RwLock<String>,
    events: EventBus,
    metrics: Arc<MetricsCollector>,
}

impl TaskScheduler {
    /// Create a scheduler with the five stock strategies registered
    pub fn new(
        config: SchedulerConfig,
        predictor: Arc<LoadPredictor>,
        events: EventBus,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let mut strategies: HashMap<String, Arc<dyn SelectionStrategy>> = HashMap::new();
        for strategy in [
            Arc::new(CapabilityStrategy) as Arc<dyn SelectionStrategy>,
            Arc::new(RoundRobinStrategy::new()),
            Arc::new(LeastLoadedStrategy),
            Arc::new(AffinityStrategy),
            Arc::new(HybridStrategy::new(
                HybridWeights::default(),
                predictor,
                config.predictor_weight,
            )),
        ] {
            strategies.insert(strategy.name().to_string(), strategy);
        }

        let active = if strategies.contains_key(&config.strategy) {
            config.strategy.clone()
        } else {
            warn!(strategy = %config.strategy, "unknown strategy, using capability");
            "capability".to_string()
        };

        Self {
            state: RwLock::new(SchedulerState {
                tasks: HashMap::new(),
                graph: DependencyGraph::new(),
                worker_queues: HashMap::new(),
                retries: Vec::new(),
                history: RingBuffer::new(config.history_capacity),
                affinity: HashMap::new(),
            }),
            strategies: RwLock::new(strategies),
            active_strategy: RwLock::new(active),
            events,
            metrics,
            config,
        }
    }

    /// Register an additional strategy
    pub fn register_strategy(&self, strategy: Arc<dyn SelectionStrategy>) {
        self.strategies
            .write()
            .unwrap()
            .insert(strategy.name().to_string(), strategy);
    }

    /// Switch the active strategy
    pub fn set_strategy(&self, name: &str) -> Result<()> {
        if !self.strategies.read().unwrap().contains_key(name) {
            return Err(CoordinationError::system(format!(
                "unknown selection strategy '{name}'"
            )));
        }
        *self.active_strategy.write().unwrap() = name.to_string();
        Ok(())
    }

    /// Admit a task into the graph. Returns its initial status.
    pub fn add_task(&self, task: Task) -> Result<TaskStatus> {
        let mut state = self.state.write().unwrap();
        if state.tasks.contains_key(&task.id) || state.graph.is_completed(&task.id) {
            return Err(CoordinationError::system(format!(
                "duplicate task id '{}'",
                task.id
            )));
        }

        let node_status = state.graph.add(&task.id, &task.dependencies)?;
        let mut task = task;
        task.status = match node_status {
            crate::graph::NodeStatus::Ready => TaskStatus::Ready,
            _ => TaskStatus::Pending,
        };

        let task_id = task.id.clone();
        let ready = task.status == TaskStatus::Ready;
        state.tasks.insert(task_id.clone(), task);
        drop(state);

        self.events.emit(CoordinationEvent::TaskCreated {
            task_id: task_id.clone(),
        });
        if ready {
            self.events.emit(CoordinationEvent::TaskReady { task_id });
        }
        Ok(if ready {
            TaskStatus::Ready
        } else {
            TaskStatus::Pending
        })
    }

    /// Bind ready tasks to workers, highest priority first.
    ///
    /// `preferred` pins a specific task to a specific worker, bypassing the
    /// strategy but not the readiness rules.
    pub fn next_dispatches(
        &self,
        workers: &[Worker],
        preferred: Option<(&str, &str)>,
    ) -> Vec<Dispatch> {
        let strategy = {
            let name = self.active_strategy.read().unwrap().clone();
            self.strategies.read().unwrap().get(&name).cloned()
        };
        let Some(strategy) = strategy else {
            return Vec::new();
        };

        // Local copy so same-tick assignments consume capacity
        let mut workers: Vec<Worker> = workers.to_vec();
        let mut dispatches = Vec::new();
        let mut no_candidate = Vec::new();

        {
            let mut state = self.state.write().unwrap();

            // Tasks already bound to a worker occupy slots even when the
            // caller's snapshot has not observed them yet
            for worker in workers.iter_mut() {
                if let Some(queue) = state.worker_queues.get(&worker.id) {
                    for task_id in queue {
                        worker.task_started(task_id);
                    }
                }
            }

            let mut ready: Vec<(String, crate::task::TaskPriority, chrono::DateTime<chrono::Utc>)> =
                state
                    .tasks
                    .values()
                    .filter(|t| t.status == TaskStatus::Ready)
                    .map(|t| (t.id.clone(), t.priority, t.created_at))
                    .collect();
            ready.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.2.cmp(&b.2)));

            for (task_id, _, _) in ready {
                let task = match state.tasks.get(&task_id) {
                    Some(task) => task.clone(),
                    None => continue,
                };

                let started = Instant::now();
                let choice = match preferred {
                    Some((pinned_task, pinned_worker)) if pinned_task == task_id => workers
                        .iter()
                        .find(|w| {
                            w.id == pinned_worker
                                && w.can_accept()
                                && w.covers(&task.required_capabilities)
                        })
                        .map(|w| w.id.clone()),
                    _ => {
                        let input = SelectionInput {
                            task: &task,
                            workers: &workers,
                            affinity: &state.affinity,
                        };
                        strategy.select(&input)
                    }
                };
                self.metrics.observe(
                    "scheduler.selection_latency_ms",
                    started.elapsed().as_secs_f64() * 1_000.0,
                );

                match choice {
                    Some(worker_id) => {
                        if let Some(task) = state.tasks.get_mut(&task_id) {
                            task.status = TaskStatus::Queued;
                            task.assigned_worker = Some(worker_id.clone());
                        }
                        state
                            .worker_queues
                            .entry(worker_id.clone())
                            .or_default()
                            .push_back(task_id.clone());
                        if let Some(worker) = workers.iter_mut().find(|w| w.id == worker_id) {
                            worker.task_started(&task_id);
                        }
                        dispatches.push(Dispatch {
                            task_id,
                            worker_id,
                        });
                    }
                    None => no_candidate.push(task_id),
                }
            }
        }

        for dispatch in &dispatches {
            debug!(task = %dispatch.task_id, worker = %dispatch.worker_id, "task dispatched");
            self.events.emit(CoordinationEvent::TaskAssigned {
                task_id: dispatch.task_id.clone(),
                worker_id: dispatch.worker_id.clone(),
            });
        }
        for task_id in no_candidate {
            warn!(task = %task_id, "no suitable worker this tick");
            self.events
                .emit(CoordinationEvent::NoSuitableWorker { task_id });
        }
        dispatches
    }

    /// The executor driver picked the task up
    pub fn mark_assigned(&self, task_id: &str) {
        let mut state = self.state.write().unwrap();
        if let Some(task) = state.tasks.get_mut(task_id) {
            if task.status == TaskStatus::Queued {
                task.status = TaskStatus::Assigned;
            }
        }
    }

    /// Execution actually began on the worker
    pub fn mark_running(&self, task_id: &str, worker_id: &str) {
        let worker_id = worker_id.to_string();
        let mut state = self.state.write().unwrap();
        if let Some(task) = state.tasks.get_mut(task_id) {
            task.mark_started(&worker_id);
        }
        state.graph.mark_running(task_id);
        drop(state);
        self.events.emit(CoordinationEvent::TaskStarted {
            task_id: task_id.to_string(),
            worker_id,
        });
    }

    /// Record completion and return the dependents that became ready
    pub fn complete(&self, task_id: &str, outcome: TaskOutcome) -> Result<Vec<String>> {
        let mut state = self.state.write().unwrap();
        let mut task = state
            .tasks
            .remove(task_id)
            .ok_or_else(|| CoordinationError::TaskUnknown(task_id.to_string()))?;
        if task.is_terminal() {
            // Completion races cancellation; first writer wins
            state.tasks.insert(task_id.to_string(), task);
            return Ok(Vec::new());
        }

        task.mark_completed(outcome);
        let worker_id = task.assigned_worker.clone().unwrap_or_default();
        let duration_ms = task
            .started_at
            .map(|s| (chrono::Utc::now() - s).num_milliseconds().max(0) as u64)
            .unwrap_or(0);

        if !worker_id.is_empty() {
            state.affinity.insert(task.task_type.clone(), worker_id.clone());
            if let Some(queue) = state.worker_queues.get_mut(&worker_id) {
                queue.retain(|id| id != task_id);
            }
        }

        let newly_ready = state.graph.mark_completed(task_id);
        for ready_id in &newly_ready {
            if let Some(next) = state.tasks.get_mut(ready_id) {
                next.status = TaskStatus::Ready;
            }
        }
        state.history.push(task);
        drop(state);

        info!(task = task_id, worker = %worker_id, duration_ms, "task completed");
        self.events.emit(CoordinationEvent::TaskCompleted {
            task_id: task_id.to_string(),
            worker_id,
            duration_ms,
        });
        for ready_id in &newly_ready {
            self.events.emit(CoordinationEvent::TaskReady {
                task_id: ready_id.clone(),
            });
        }
        Ok(newly_ready)
    }

    /// Record a failed attempt: requeue with backoff while the retry budget
    /// lasts, otherwise fail and cascade-cancel dependents.
    pub fn fail(&self, task_id: &str, error: &CoordinationError) -> Result<FailDisposition> {
        let mut state = self.state.write().unwrap();
        let task = state
            .tasks
            .get(task_id)
            .ok_or_else(|| CoordinationError::TaskUnknown(task_id.to_string()))?;
        if task.is_terminal() {
            return Ok(FailDisposition::Failed {
                cancelled: Vec::new(),
            });
        }

        let will_retry = error.is_retryable() && task.can_retry();
        if will_retry {
            let attempts = task.attempts.max(1);
            let exponent = (attempts - 1).min(16);
            let backoff_ms = self
                .config
                .retry_backoff_base_ms
                .saturating_mul(1u64 << exponent)
                .min(self.config.retry_backoff_max_ms);

            let worker = state
                .tasks
                .get_mut(task_id)
                .map(|task| {
                    task.status = TaskStatus::Pending;
                    task.assigned_worker.take()
                })
                .flatten();
            if let Some(worker) = worker {
                if let Some(queue) = state.worker_queues.get_mut(&worker) {
                    queue.retain(|id| id != task_id);
                }
            }
            state.retries.push(RetryEntry {
                task_id: task_id.to_string(),
                due: Instant::now() + Duration::from_millis(backoff_ms),
            });
            drop(state);

            warn!(task = task_id, backoff_ms, error = %error, "attempt failed, retrying");
            self.events.emit(CoordinationEvent::TaskFailed {
                task_id: task_id.to_string(),
                error_kind: error.kind().to_string(),
                will_retry: true,
            });
            return Ok(FailDisposition::Retried { backoff_ms });
        }

        // Terminal failure
        let mut task = state.tasks.remove(task_id).unwrap();
        task.mark_failed(TaskFailure::from(error));
        if let Some(worker) = &task.assigned_worker {
            if let Some(queue) = state.worker_queues.get_mut(worker) {
                queue.retain(|id| id != task_id);
            }
        }
        state.history.push(task);

        let dependents = state.graph.mark_failed(task_id);
        state.graph.remove(task_id);
        drop(state);

        warn!(task = task_id, error = %error, "task failed terminally");
        self.events.emit(CoordinationEvent::TaskFailed {
            task_id: task_id.to_string(),
            error_kind: error.kind().to_string(),
            will_retry: false,
        });

        let mut cancelled = Vec::new();
        for dependent in dependents {
            cancelled.extend(self.cancel(&dependent, task_id)?);
        }
        Ok(FailDisposition::Failed { cancelled })
    }

    /// Cancel a task and cascade to its transitive dependents. Returns every
    /// cancelled id, the task itself first. Running entries in the result
    /// still need their executions stopped by the caller.
    pub fn cancel(&self, task_id: &str, cause: &str) -> Result<Vec<String>> {
        let mut state = self.state.write().unwrap();
        let Some(task) = state.tasks.get(task_id) else {
            return Ok(Vec::new());
        };
        if task.is_terminal() {
            return Ok(Vec::new());
        }

        let mut order = vec![task_id.to_string()];
        order.extend(state.graph.mark_failed(task_id));

        let mut cancelled = Vec::new();
        for id in order {
            let Some(mut task) = state.tasks.remove(&id) else {
                continue;
            };
            if task.is_terminal() {
                state.tasks.insert(id, task);
                continue;
            }
            let cause = if id == task_id { cause } else { task_id };
            task.mark_cancelled(TaskFailure::from(&CoordinationError::cancelled(
                id.clone(),
                cause,
            )));
            if let Some(worker) = &task.assigned_worker {
                if let Some(queue) = state.worker_queues.get_mut(worker) {
                    queue.retain(|queued| queued != &id);
                }
            }
            state.graph.remove(&id);
            state.retries.retain(|r| r.task_id != id);
            state.history.push(task);
            cancelled.push((id, cause.to_string()));
        }
        drop(state);

        for (id, cause) in &cancelled {
            info!(task = %id, cause = %cause, "task cancelled");
            self.events.emit(CoordinationEvent::TaskCancelled {
                task_id: id.clone(),
                cause: cause.clone(),
            });
        }
        Ok(cancelled.into_iter().map(|(id, _)| id).collect())
    }

    /// Move due retries back to ready; returns their ids
    pub fn process_due_retries(&self) -> Vec<String> {
        let mut state = self.state.write().unwrap();
        let now = Instant::now();
        let due: Vec<String> = state
            .retries
            .iter()
            .filter(|r| r.due <= now)
            .map(|r| r.task_id.clone())
            .collect();
        state.retries.retain(|r| r.due > now);

        let mut requeued = Vec::new();
        for task_id in due {
            if let Some(task) = state.tasks.get_mut(&task_id) {
                if !task.is_terminal() {
                    task.status = TaskStatus::Ready;
                    state.graph.mark_ready(&task_id);
                    requeued.push(task_id);
                }
            }
        }
        drop(state);

        for task_id in &requeued {
            self.events.emit(CoordinationEvent::TaskReady {
                task_id: task_id.clone(),
            });
        }
        requeued
    }

    /// Move up to `count` not-yet-running tasks from one worker's queue to
    /// another's, lowest priority first. Returns the moved ids.
    pub fn steal(&self, source: &str, target: &str, count: usize) -> Vec<String> {
        let mut state = self.state.write().unwrap();

        let mut candidates: Vec<(String, crate::task::TaskPriority)> = state
            .worker_queues
            .get(source)
            .map(|queue| {
                queue
                    .iter()
                    .filter(|id| {
                        state
                            .tasks
                            .get(*id)
                            .map(|t| {
                                matches!(t.status, TaskStatus::Queued | TaskStatus::Assigned)
                            })
                            .unwrap_or(false)
                    })
                    .map(|id| (id.clone(), state.tasks[id].priority))
                    .collect()
            })
            .unwrap_or_default();
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        candidates.truncate(count);

        let mut moved = Vec::new();
        for (task_id, _) in candidates {
            if let Some(queue) = state.worker_queues.get_mut(source) {
                queue.retain(|id| id != &task_id);
            }
            state
                .worker_queues
                .entry(target.to_string())
                .or_default()
                .push_back(task_id.clone());
            if let Some(task) = state.tasks.get_mut(&task_id) {
                task.assigned_worker = Some(target.to_string());
            }
            moved.push(task_id);
        }
        drop(state);

        if !moved.is_empty() {
            info!(source, target, count = moved.len(), "tasks stolen");
            self.events.emit(CoordinationEvent::WorkStealing {
                source: source.to_string(),
                target: target.to_string(),
                count: moved.len(),
            });
        }
        moved
    }

    /// Detach a worker: requeue (or cancel, under quarantine) its queued and
    /// assigned tasks, and report its running ones for the retry path.
    pub fn worker_removed(&self, worker_id: &str, quarantine: bool) -> WorkerRemoval {
        let mut removal = WorkerRemoval::default();
        let queued: Vec<String> = {
            let mut state = self.state.write().unwrap();
            let queued = state
                .worker_queues
                .remove(worker_id)
                .map(|q| q.into_iter().collect::<Vec<_>>())
                .unwrap_or_default();

            removal.running = state
                .tasks
                .values()
                .filter(|t| {
                    t.status == TaskStatus::Running
                        && t.assigned_worker.as_deref() == Some(worker_id)
                })
                .map(|t| t.id.clone())
                .collect();

            if !quarantine {
                for task_id in &queued {
                    if let Some(task) = state.tasks.get_mut(task_id) {
                        if matches!(task.status, TaskStatus::Queued | TaskStatus::Assigned) {
                            task.status = TaskStatus::Ready;
                            task.assigned_worker = None;
                        }
                    }
                }
            }
            queued
        };

        if quarantine {
            for task_id in &queued {
                if let Ok(cancelled) = self.cancel(task_id, "worker deregistered") {
                    removal.requeued.extend(cancelled);
                }
            }
        } else {
            removal.requeued = queued;
        }
        removal
    }

    /// Restore a terminal task from a snapshot: goes straight to history,
    /// and completed ids still satisfy future dependencies
    pub fn admit_terminal(&self, task: Task) {
        let mut state = self.state.write().unwrap();
        if task.status == TaskStatus::Completed {
            state.graph.insert_completed(&task.id);
        }
        state.history.push(task);
    }

    /// A task by id, from the live set or history
    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        let state = self.state.read().unwrap();
        state.tasks.get(task_id).cloned().or_else(|| {
            state
                .history
                .iter()
                .rev()
                .find(|t| t.id == task_id)
                .cloned()
        })
    }

    /// Queue depth of a worker's index
    pub fn queue_depth(&self, worker_id: &str) -> usize {
        self.state
            .read()
            .unwrap()
            .worker_queues
            .get(worker_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Count of live (non-terminal) tasks
    pub fn live_task_count(&self) -> usize {
        self.state.read().unwrap().tasks.len()
    }

    /// Ids of currently running tasks
    pub fn running_task_ids(&self) -> Vec<String> {
        self.state
            .read()
            .unwrap()
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .map(|t| t.id.clone())
            .collect()
    }

    /// All live tasks, cloned
    pub fn live_tasks(&self) -> Vec<Task> {
        self.state.read().unwrap().tasks.values().cloned().collect()
    }

    /// Terminal tasks, oldest first
    pub fn history(&self) -> Vec<Task> {
        self.state.read().unwrap().history.iter().cloned().collect()
    }
}

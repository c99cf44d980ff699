/*!
# Coordination Manager

Binds the graph, scheduler, executor, locks, router, balancer, predictor,
breakers, conflicts, and metrics into one lifecycle and exposes the external
contract the planner and worker runtimes program against.
*/

use crate::balancer::WorkStealingBalancer;
use crate::breaker::CircuitBreakerRegistry;
use crate::config::CoordinationConfig;
use crate::conflict::{Conflict, ConflictKind, ConflictResolver, Resolution, ResolutionContext};
use crate::error::{CoordinationError, Result};
use crate::events::{CoordinationEvent, EventBus};
use crate::executor::{TaskExecutor, TaskRunner};
use crate::locks::ResourceLockManager;
use crate::metrics::MetricsCollector;
use crate::optimistic::OptimisticLockManager;
use crate::predictor::LoadPredictor;
use crate::router::{Message, MessageRouter};
use crate::scheduler::{Dispatch, FailDisposition, TaskScheduler};
use crate::task::{Task, TaskOutcome, TaskSpec, TaskStatus};
use crate::worker::{LoadSnapshot, Worker, WorkerSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Objective lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectiveStatus {
    /// Collecting tasks, not yet started
    Created,
    /// Tasks admitted to the scheduler
    Running,
    /// Every task completed
    Completed,
    /// At least one task failed or was cancelled
    Failed,
}

/// A user-facing goal: a named bundle of tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Objective {
    /// Objective id
    pub id: Uuid,
    /// Free-text description
    pub description: String,
    /// Decomposition strategy name, recorded for audit
    pub strategy: String,
    /// Specs collected before start
    pub pending_specs: Vec<TaskSpec>,
    /// Ids of admitted tasks
    pub task_ids: Vec<String>,
    /// Lifecycle status
    pub status: ObjectiveStatus,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Start timestamp
    pub started_at: Option<DateTime<Utc>>,
}

/// Overall health classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All components nominal
    Healthy,
    /// Operational with degraded signals
    Degraded,
    /// Needs attention
    Unhealthy,
}

/// One component's health line
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    /// Component name
    pub name: String,
    /// Classification
    pub status: HealthStatus,
    /// What the classification is based on
    pub detail: String,
}

/// Health rollup returned by `health_status`
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Worst component status
    pub overall: HealthStatus,
    /// Per-component lines
    pub components: Vec<ComponentHealth>,
}

/// Aggregate view computed on demand
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    /// Registered workers
    pub total_workers: usize,
    /// Workers within their heartbeat budget
    pub alive_workers: usize,
    /// Non-terminal tasks
    pub live_tasks: usize,
    /// Currently running tasks
    pub running_tasks: usize,
    /// Tasks waiting on executor capacity
    pub executor_queue_depth: usize,
    /// Completions since start
    pub completed_total: u64,
    /// Terminal failures since start
    pub failed_total: u64,
    /// Mean reported worker utilization
    pub avg_utilization: f64,
}

/// Best-effort persisted state: the core always starts cleanly without it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Capture timestamp
    pub timestamp: DateTime<Utc>,
    /// All objectives
    pub objectives: Vec<Objective>,
    /// Live and terminal tasks
    pub tasks: Vec<Task>,
    /// Workers, minus their in-flight task sets
    pub workers: Vec<Worker>,
}

/// The coordination core's public entry point
pub struct CoordinationManager {
    config: CoordinationConfig,
    events: EventBus,
    metrics: Arc<MetricsCollector>,
    router: Arc<MessageRouter>,
    locks: Arc<ResourceLockManager>,
    breakers: Arc<CircuitBreakerRegistry>,
    predictor: Arc<LoadPredictor>,
    balancer: Arc<WorkStealingBalancer>,
    scheduler: Arc<TaskScheduler>,
    executor: Arc<TaskExecutor>,
    conflicts: Arc<ConflictResolver>,
    optimistic: Arc<OptimisticLockManager>,
    runner: Arc<dyn TaskRunner>,
    workers: RwLock<HashMap<String, Worker>>,
    objectives: RwLock<HashMap<Uuid, Objective>>,
    shutdown: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl CoordinationManager {
    /// Wire the components together. Construction order follows the
    /// initialization contract: metrics and router first, then locks and
    /// breakers, then the scheduler and executor on top.
    pub fn new(config: CoordinationConfig, runner: Arc<dyn TaskRunner>) -> Result<Arc<Self>> {
        config.validate()?;
        let events = EventBus::new();

        let metrics = Arc::new(MetricsCollector::new(config.metrics_retention));
        let router = Arc::new(MessageRouter::new(config.message_timeout_ms));
        let locks = Arc::new(ResourceLockManager::new(
            config.resource_timeout_ms,
            events.clone(),
        ));
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        let predictor = Arc::new(LoadPredictor::new());
        let balancer = Arc::new(WorkStealingBalancer::new(config.work_stealing.clone()));
        let optimistic = Arc::new(OptimisticLockManager::new(config.optimistic_max_age_ms));
        let conflicts = Arc::new(ConflictResolver::new(
            config.conflict_strategy.clone(),
            optimistic.clone(),
            config.task_history_capacity,
            events.clone(),
        ));
        let scheduler = Arc::new(TaskScheduler::new(
            config.scheduler_config(),
            predictor.clone(),
            events.clone(),
            metrics.clone(),
        ));
        let executor = Arc::new(TaskExecutor::new(
            config.executor_config(),
            breakers.clone(),
            events.clone(),
            metrics.clone(),
        ));

        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            config,
            events,
            metrics,
            router,
            locks,
            breakers,
            predictor,
            balancer,
            scheduler,
            executor,
            conflicts,
            optimistic,
            runner,
            workers: RwLock::new(HashMap::new()),
            objectives: RwLock::new(HashMap::new()),
            shutdown,
            loops: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }))
    }

    /// The event stream; external observers may subscribe too
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The metrics collector
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// The message router
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// The conflict resolver
    pub fn conflicts(&self) -> &Arc<ConflictResolver> {
        &self.conflicts
    }

    /// The circuit breaker registry
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// The optimistic lock manager
    pub fn optimistic_locks(&self) -> &Arc<OptimisticLockManager> {
        &self.optimistic
    }

    /// Start the background loops. Idempotent.
    pub fn initialize(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("coordination manager starting");
        let mut loops = self.loops.lock().unwrap();

        // Event → metrics pump: the single place events become counters
        {
            let mut rx = self.events.subscribe();
            let metrics = self.metrics.clone();
            let mut shutdown = self.shutdown.subscribe();
            loops.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = rx.recv() => match event {
                            Ok(event) => metrics.record_event(&event),
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(_) => break,
                        },
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        // Scheduling pump: due retries and ready dispatches
        loops.push(self.spawn_loop(self.config.retry_delay_ms, |this| async move {
            let requeued = this.scheduler.process_due_retries();
            if !requeued.is_empty() {
                debug!(count = requeued.len(), "retries requeued");
            }
            this.dispatch_ready();
        }));

        // Deadlock detection
        if self.config.deadlock_detection {
            loops.push(self.spawn_loop(self.config.deadlock_interval_ms, |this| async move {
                let victims = this.locks.detect_and_resolve().await;
                for victim in victims {
                    this.requeue_preempted_worker(&victim);
                }
            }));
        }

        // Work-stealing rebalance
        if self.config.work_stealing.enabled {
            loops.push(self.spawn_loop(self.config.rebalance_interval_ms, |this| async move {
                for plan in this.balancer.plan() {
                    let moved = this.scheduler.steal(&plan.source, &plan.target, plan.count);
                    if !moved.is_empty() {
                        this.metrics.incr_by("balancer.tasks_stolen", moved.len() as u64);
                    }
                }
            }));
        }

        // Heartbeat sweep
        loops.push(self.spawn_loop(self.config.heartbeat_interval_ms, |this| async move {
            let dead: Vec<String> = {
                let workers = this.workers.read().unwrap();
                workers
                    .values()
                    .filter(|w| {
                        w.status.accepts_work()
                            && !w.is_alive(
                                this.config.heartbeat_interval_ms,
                                this.config.heartbeat_miss_limit,
                            )
                    })
                    .map(|w| w.id.clone())
                    .collect()
            };
            for worker_id in dead {
                warn!(worker = %worker_id, "heartbeat budget exhausted, removing worker");
                this.events.emit(CoordinationEvent::WorkerDead {
                    worker_id: worker_id.clone(),
                });
                this.remove_worker(&worker_id).await;
            }
        }));

        // Maintenance
        loops.push(self.spawn_loop(self.config.maintenance_interval_ms, |this| async move {
            this.perform_maintenance().await;
        }));

        // Load sampling: utilization histograms for the balancer and alerts
        loops.push(self.spawn_loop(self.config.load_sampling_interval_ms, |this| async move {
            let snapshot: Vec<(String, f64)> = {
                let workers = this.workers.read().unwrap();
                workers
                    .values()
                    .map(|w| (w.id.clone(), w.load.utilization()))
                    .collect()
            };
            for (worker_id, utilization) in snapshot {
                this.metrics.observe("worker.utilization", utilization);
                this.predictor.record(&worker_id, utilization);
            }
        }));
    }

    fn spawn_loop<F, Fut>(self: &Arc<Self>, interval_ms: u64, body: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let this = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => body(this.clone()).await,
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// Stop loops, cancel running work, flush the router, release locks
    pub async fn shutdown(self: &Arc<Self>) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("coordination manager shutting down");
        let _ = self.shutdown.send(true);

        let handles: Vec<JoinHandle<()>> = self.loops.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        for task_id in self.scheduler.running_task_ids() {
            self.executor.cancel(&task_id);
            let _ = self.scheduler.cancel(&task_id, "shutdown");
        }
        self.executor.cancel_all();

        let worker_ids: Vec<String> =
            self.workers.read().unwrap().keys().cloned().collect();
        for worker_id in worker_ids {
            self.locks.release_all_for(&worker_id).await;
        }
        self.router.flush();
    }

    // ── Planner contract ─────────────────────────────────────────────

    /// Create an objective that will collect tasks until started
    pub fn create_objective(
        &self,
        description: impl Into<String>,
        strategy: impl Into<String>,
    ) -> Uuid {
        let objective = Objective {
            id: Uuid::new_v4(),
            description: description.into(),
            strategy: strategy.into(),
            pending_specs: Vec::new(),
            task_ids: Vec::new(),
            status: ObjectiveStatus::Created,
            created_at: Utc::now(),
            started_at: None,
        };
        let id = objective.id;
        self.objectives.write().unwrap().insert(id, objective);
        info!(objective = %id, "objective created");
        id
    }

    /// Attach a task spec to an objective; admitted when the objective starts
    pub fn add_task(&self, objective_id: Uuid, spec: TaskSpec) -> Result<String> {
        let mut objectives = self.objectives.write().unwrap();
        let objective = objectives
            .get_mut(&objective_id)
            .ok_or(CoordinationError::ObjectiveUnknown(objective_id))?;
        if objective.status != ObjectiveStatus::Created {
            return Err(CoordinationError::system(format!(
                "objective {objective_id} already started"
            )));
        }
        let task_id = spec.id.clone();
        objective.pending_specs.push(spec);
        Ok(task_id)
    }

    /// Admit an objective's tasks to the scheduler and start dispatching
    pub fn start_objective(self: &Arc<Self>, objective_id: Uuid) -> Result<()> {
        let specs = {
            let mut objectives = self.objectives.write().unwrap();
            let objective = objectives
                .get_mut(&objective_id)
                .ok_or(CoordinationError::ObjectiveUnknown(objective_id))?;
            objective.status = ObjectiveStatus::Running;
            objective.started_at = Some(Utc::now());
            std::mem::take(&mut objective.pending_specs)
        };

        for spec in specs {
            let task_id = self.assign_task(spec)?;
            let mut objectives = self.objectives.write().unwrap();
            if let Some(objective) = objectives.get_mut(&objective_id) {
                objective.task_ids.push(task_id);
            }
        }
        info!(objective = %objective_id, "objective started");
        Ok(())
    }

    /// An objective by id
    pub fn objective(&self, objective_id: Uuid) -> Option<Objective> {
        self.objectives.read().unwrap().get(&objective_id).cloned()
    }

    // ── Task contract ────────────────────────────────────────────────

    /// Admit a task directly and trigger dispatch
    pub fn assign_task(self: &Arc<Self>, spec: TaskSpec) -> Result<String> {
        let task = Task::from_spec(
            spec,
            self.config.default_task_timeout_ms,
            self.config.max_retries,
        );
        let task_id = task.id.clone();
        self.scheduler.add_task(task)?;
        self.dispatch_ready();
        Ok(task_id)
    }

    /// Admit a task pinned to a specific worker. The pin bypasses the
    /// selection strategy but not the readiness or capacity rules.
    pub fn assign_task_to(self: &Arc<Self>, spec: TaskSpec, worker_id: &str) -> Result<String> {
        if !self.workers.read().unwrap().contains_key(worker_id) {
            return Err(CoordinationError::WorkerUnknown(worker_id.to_string()));
        }
        let task = Task::from_spec(
            spec,
            self.config.default_task_timeout_ms,
            self.config.max_retries,
        );
        let task_id = task.id.clone();
        self.scheduler.add_task(task)?;

        let workers: Vec<Worker> = self.workers.read().unwrap().values().cloned().collect();
        let dispatches = self
            .scheduler
            .next_dispatches(&workers, Some((&task_id, worker_id)));
        for dispatch in dispatches {
            let this = self.clone();
            tokio::spawn(async move {
                this.drive_task(dispatch).await;
            });
        }
        Ok(task_id)
    }

    /// Switch the worker-selection strategy at runtime
    pub fn set_selection_strategy(&self, name: &str) -> Result<()> {
        self.scheduler.set_strategy(name)
    }

    /// Record an externally-executed task's completion
    pub fn complete_task(self: &Arc<Self>, task_id: &str, outcome: TaskOutcome) -> Result<()> {
        self.finish_task_bookkeeping(task_id);
        self.scheduler.complete(task_id, outcome)?;
        self.refresh_objectives();
        self.dispatch_ready();
        Ok(())
    }

    /// Record an externally-executed task's failure; retries per policy
    pub fn fail_task(self: &Arc<Self>, task_id: &str, error: &CoordinationError) -> Result<()> {
        self.finish_task_bookkeeping(task_id);
        let disposition = self.scheduler.fail(task_id, error)?;
        if let FailDisposition::Failed { cancelled } = disposition {
            for cancelled_id in cancelled {
                self.executor.cancel(&cancelled_id);
            }
        }
        self.refresh_objectives();
        self.dispatch_ready();
        Ok(())
    }

    /// Cancel a task and its transitive dependents
    pub fn cancel_task(self: &Arc<Self>, task_id: &str, reason: &str) -> Result<()> {
        let cancelled = self.scheduler.cancel(task_id, reason)?;
        for id in &cancelled {
            self.executor.cancel(id);
            self.finish_task_bookkeeping(id);
        }
        self.refresh_objectives();
        Ok(())
    }

    /// A task's current record, live or historical
    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.scheduler.get_task(task_id)
    }

    // ── Worker contract ──────────────────────────────────────────────

    /// Register a worker
    pub fn register_worker(self: &Arc<Self>, spec: WorkerSpec) -> Result<()> {
        let worker = Worker::from_spec(spec);
        let worker_id = worker.id.clone();
        {
            let mut workers = self.workers.write().unwrap();
            if workers.contains_key(&worker_id) {
                return Err(CoordinationError::system(format!(
                    "worker '{worker_id}' already registered"
                )));
            }
            workers.insert(worker_id.clone(), worker);
        }
        self.router.register_mailbox(&worker_id);
        self.events.emit(CoordinationEvent::WorkerRegistered {
            worker_id: worker_id.clone(),
        });
        self.metrics
            .set_gauge("workers.registered", self.workers.read().unwrap().len() as f64);
        info!(worker = %worker_id, "worker registered");
        // Pending work may now be placeable
        self.dispatch_ready();
        Ok(())
    }

    /// Record a worker heartbeat with its load snapshot
    pub fn heartbeat(&self, worker_id: &str, mut load: LoadSnapshot) -> Result<()> {
        // The scheduler's queue index is authoritative for queue depth
        load.queue_depth = load.queue_depth.max(self.scheduler.queue_depth(worker_id));
        let utilization = load.utilization();
        {
            let mut workers = self.workers.write().unwrap();
            let worker = workers
                .get_mut(worker_id)
                .ok_or_else(|| CoordinationError::WorkerUnknown(worker_id.to_string()))?;
            worker.heartbeat(load.clone());
        }
        self.balancer.update(worker_id, load);
        self.predictor.record(worker_id, utilization);
        Ok(())
    }

    /// Deregister a worker cleanly
    pub async fn deregister_worker(self: &Arc<Self>, worker_id: &str) -> Result<()> {
        if !self.workers.read().unwrap().contains_key(worker_id) {
            return Err(CoordinationError::WorkerUnknown(worker_id.to_string()));
        }
        self.events.emit(CoordinationEvent::WorkerDeregistered {
            worker_id: worker_id.to_string(),
        });
        self.remove_worker(worker_id).await;
        Ok(())
    }

    /// Shared removal path for deregistration and heartbeat death: release
    /// locks, requeue or fail the worker's tasks, drop its state everywhere.
    async fn remove_worker(self: &Arc<Self>, worker_id: &str) {
        self.locks.release_all_for(worker_id).await;

        let removal = self
            .scheduler
            .worker_removed(worker_id, self.config.quarantine_on_deregister);
        for task_id in &removal.running {
            self.executor.cancel(task_id);
            let err = CoordinationError::execution(task_id.clone(), "worker lost");
            if let Err(err) = self.scheduler.fail(task_id, &err) {
                warn!(task = %task_id, %err, "failed to requeue task of lost worker");
            }
        }

        self.workers.write().unwrap().remove(worker_id);
        self.balancer.remove(worker_id);
        self.predictor.remove(worker_id);
        self.breakers.remove(&format!("worker:{worker_id}"));
        self.router.remove_mailbox(worker_id);
        self.metrics
            .set_gauge("workers.registered", self.workers.read().unwrap().len() as f64);

        self.refresh_objectives();
        self.dispatch_ready();
    }

    // ── Resource contract ────────────────────────────────────────────

    /// Acquire an exclusive resource lock for a worker
    pub async fn acquire_resource(
        &self,
        resource: &str,
        worker_id: &str,
        priority: i32,
    ) -> Result<()> {
        self.locks
            .acquire(
                resource,
                worker_id,
                priority,
                Duration::from_millis(self.config.resource_timeout_ms),
            )
            .await
    }

    /// Release a resource lock
    pub async fn release_resource(&self, resource: &str, worker_id: &str) {
        self.locks.release(resource, worker_id).await;
    }

    // ── Messaging contract ───────────────────────────────────────────

    /// Fire-and-forget message between participants
    pub fn send_message(
        &self,
        from: &str,
        to: &str,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        self.router.send(Message::new(from, to, kind, payload))
    }

    // ── Conflict contract ────────────────────────────────────────────

    /// Report a contention. Resolved immediately when auto-resolution is on,
    /// otherwise recorded for a later explicit resolution.
    pub fn report_conflict(
        &self,
        kind: ConflictKind,
        target_id: &str,
        contenders: Vec<String>,
    ) -> Result<Conflict> {
        let conflict = Conflict::new(kind, target_id, contenders.clone());
        if !self.config.auto_resolve_conflicts {
            self.conflicts.report(conflict.clone());
            return Ok(conflict);
        }

        let mut ctx = ResolutionContext::new();
        {
            let workers = self.workers.read().unwrap();
            for contender in &contenders {
                if let Some(worker) = workers.get(contender) {
                    ctx = ctx.with_priority(contender.clone(), worker.priority);
                }
            }
        }
        let resolution = self.conflicts.resolve(conflict.clone(), &ctx, None)?;
        let mut resolved = conflict;
        resolved.resolved = true;
        resolved.resolution = Some(resolution);
        Ok(resolved)
    }

    /// Resolve a previously reported conflict with an explicit strategy
    pub fn resolve_conflict(
        &self,
        conflict_id: Uuid,
        strategy: Option<&str>,
    ) -> Result<Resolution> {
        let conflict = self
            .conflicts
            .get(conflict_id)
            .ok_or_else(|| CoordinationError::system(format!("unknown conflict {conflict_id}")))?;
        let mut ctx = ResolutionContext::new();
        {
            let workers = self.workers.read().unwrap();
            for contender in &conflict.contenders {
                if let Some(worker) = workers.get(contender) {
                    ctx = ctx.with_priority(contender.clone(), worker.priority);
                }
            }
        }
        self.conflicts.resolve(conflict, &ctx, strategy)
    }

    // ── Observation ──────────────────────────────────────────────────

    /// Aggregate stats, computed on demand
    pub fn stats(&self) -> CoordinatorStats {
        let (total_workers, alive_workers, avg_utilization) = {
            let workers = self.workers.read().unwrap();
            let alive = workers
                .values()
                .filter(|w| {
                    w.is_alive(
                        self.config.heartbeat_interval_ms,
                        self.config.heartbeat_miss_limit,
                    )
                })
                .count();
            let avg = if workers.is_empty() {
                0.0
            } else {
                workers.values().map(|w| w.load.utilization()).sum::<f64>()
                    / workers.len() as f64
            };
            (workers.len(), alive, avg)
        };

        CoordinatorStats {
            total_workers,
            alive_workers,
            live_tasks: self.scheduler.live_task_count(),
            running_tasks: self.scheduler.running_task_ids().len(),
            executor_queue_depth: self.executor.queue_depth(),
            completed_total: self.metrics.counter("events.task_completed"),
            failed_total: self.metrics.counter("events.task_failed"),
            avg_utilization,
        }
    }

    /// Health rollup across components
    pub fn health_status(&self) -> HealthReport {
        let stats = self.stats();
        let derived = self.metrics.derived();
        let mut components = Vec::new();

        let worker_status = if stats.total_workers == 0 {
            HealthStatus::Degraded
        } else if stats.alive_workers * 2 < stats.total_workers {
            HealthStatus::Unhealthy
        } else if stats.alive_workers < stats.total_workers {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        components.push(ComponentHealth {
            name: "workers".to_string(),
            status: worker_status,
            detail: format!("{}/{} alive", stats.alive_workers, stats.total_workers),
        });

        let queue_status = if stats.executor_queue_depth > self.config.max_concurrent_tasks * 4 {
            HealthStatus::Unhealthy
        } else if stats.executor_queue_depth > self.config.max_concurrent_tasks {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        components.push(ComponentHealth {
            name: "executor".to_string(),
            status: queue_status,
            detail: format!("{} tasks waiting on capacity", stats.executor_queue_depth),
        });

        let error_status = if derived.error_rate_per_min > self.config.alerts.error_rate_threshold
        {
            HealthStatus::Unhealthy
        } else if derived.error_rate_per_min > self.config.alerts.error_rate_threshold / 2.0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        components.push(ComponentHealth {
            name: "errors".to_string(),
            status: error_status,
            detail: format!("{:.1} failures/min", derived.error_rate_per_min),
        });

        let overall = components
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        HealthReport {
            overall,
            components,
        }
    }

    /// Run one maintenance pass: router TTLs, lock expiry, optimistic purge,
    /// alert evaluation, objective refresh, optional snapshot.
    pub async fn perform_maintenance(self: &Arc<Self>) {
        self.router.maintenance();
        self.locks.maintenance().await;
        self.optimistic.maintenance();

        for alert in self.metrics.check_alerts(&self.config.alerts) {
            warn!(alert = %alert.name, value = alert.value, "alert fired");
            self.events.emit(CoordinationEvent::Alert {
                name: alert.name,
                message: alert.message,
                value: alert.value,
            });
        }

        self.refresh_objectives();

        if let Some(path) = self.config.snapshot_path.clone() {
            if let Err(err) = self.save_snapshot(&path) {
                // Snapshotting is best-effort
                error!(%err, "snapshot write failed");
                self.events.emit(CoordinationEvent::SystemError {
                    message: format!("snapshot write failed: {err}"),
                });
            }
        }
    }

    /// Build a snapshot of the current state
    pub fn snapshot(&self) -> StateSnapshot {
        let workers = self
            .workers
            .read()
            .unwrap()
            .values()
            .map(|w| {
                let mut worker = w.clone();
                worker.current_tasks.clear();
                worker
            })
            .collect();
        let mut tasks = self.scheduler.live_tasks();
        tasks.extend(self.scheduler.history());

        StateSnapshot {
            timestamp: Utc::now(),
            objectives: self.objectives.read().unwrap().values().cloned().collect(),
            tasks,
            workers,
        }
    }

    /// Write the snapshot as a single JSON blob
    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        let snapshot = self.snapshot();
        let json = serde_json::to_vec_pretty(&snapshot)?;
        std::fs::write(path, json)?;
        debug!(path = %path.display(), "snapshot written");
        Ok(())
    }

    /// Load a snapshot written by `save_snapshot`. Terminal tasks land in
    /// history; non-terminal ones are re-admitted for scheduling. Workers
    /// are not restored; they re-register.
    pub fn load_snapshot(self: &Arc<Self>, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path)?;
        let snapshot: StateSnapshot = serde_json::from_slice(&bytes)?;

        {
            let mut objectives = self.objectives.write().unwrap();
            for objective in snapshot.objectives {
                objectives.insert(objective.id, objective);
            }
        }

        let (terminal, live): (Vec<Task>, Vec<Task>) =
            snapshot.tasks.into_iter().partition(|t| t.is_terminal());
        for task in terminal {
            self.scheduler.admit_terminal(task);
        }

        // Admit in dependency order; anything left references state the
        // snapshot no longer carries
        let mut remaining = live;
        loop {
            let before = remaining.len();
            let mut deferred = Vec::new();
            for mut task in remaining {
                task.status = TaskStatus::Pending;
                task.assigned_worker = None;
                match self.scheduler.add_task(task.clone()) {
                    Ok(_) => {}
                    Err(CoordinationError::DependencyMissing { .. }) => deferred.push(task),
                    Err(err) => warn!(%err, "task from snapshot not restored"),
                }
            }
            if deferred.is_empty() || deferred.len() == before {
                if !deferred.is_empty() {
                    warn!(
                        count = deferred.len(),
                        "snapshot tasks with unresolvable dependencies dropped"
                    );
                }
                break;
            }
            remaining = deferred;
        }

        info!(path = %path.display(), "snapshot restored");
        self.dispatch_ready();
        Ok(())
    }

    // ── Internal driving ─────────────────────────────────────────────

    /// Bind ready tasks to workers and spawn their execution drivers
    pub fn dispatch_ready(self: &Arc<Self>) {
        let workers: Vec<Worker> = self.workers.read().unwrap().values().cloned().collect();
        let dispatches = self.scheduler.next_dispatches(&workers, None);
        for dispatch in dispatches {
            let this = self.clone();
            tokio::spawn(async move {
                this.drive_task(dispatch).await;
            });
        }
    }

    /// Run one dispatched task end to end: slot accounting, declared locks,
    /// execution, completion or failure through the retry policy.
    async fn drive_task(self: Arc<Self>, dispatch: Dispatch) {
        let Dispatch { task_id, worker_id } = dispatch;

        let Some(task) = self.scheduler.get_task(&task_id) else {
            return;
        };
        if task.is_terminal() {
            return;
        }
        let worker = {
            let mut workers = self.workers.write().unwrap();
            match workers.get_mut(&worker_id) {
                Some(worker) => {
                    worker.task_started(&task_id);
                    worker.clone()
                }
                None => {
                    let err = CoordinationError::execution(task_id.clone(), "worker disappeared");
                    drop(workers);
                    let _ = self.scheduler.fail(&task_id, &err);
                    return;
                }
            }
        };

        self.scheduler.mark_assigned(&task_id);

        // Declared resources are locked before execution begins
        let mut held = Vec::new();
        let mut lock_error = None;
        for request in &task.required_resources {
            match self
                .locks
                .acquire(
                    &request.resource,
                    &worker_id,
                    task.priority.weight(),
                    Duration::from_millis(self.config.resource_timeout_ms),
                )
                .await
            {
                Ok(()) => held.push(request.resource.clone()),
                Err(err) => {
                    lock_error = Some(err);
                    break;
                }
            }
        }

        let result = match lock_error {
            Some(err) => Err(err),
            None => {
                self.scheduler.mark_running(&task_id, &worker_id);
                self.executor
                    .execute(task.clone(), worker, self.runner.clone())
                    .await
            }
        };

        for resource in held {
            self.locks.release(&resource, &worker_id).await;
        }
        {
            let mut workers = self.workers.write().unwrap();
            if let Some(worker) = workers.get_mut(&worker_id) {
                worker.task_finished(&task_id);
            }
        }

        match result {
            Ok(outcome) => {
                if let Err(err) = self.scheduler.complete(&task_id, outcome) {
                    debug!(task = %task_id, %err, "completion dropped");
                }
            }
            // A cancelled execution was already settled by whoever cancelled
            // it (cancel_task, shutdown, worker removal); re-failing here
            // would override that disposition
            Err(CoordinationError::Cancelled { .. }) => {}
            Err(err) => match self.scheduler.fail(&task_id, &err) {
                Ok(FailDisposition::Failed { cancelled }) => {
                    for id in cancelled {
                        self.executor.cancel(&id);
                    }
                }
                Ok(FailDisposition::Retried { .. }) => {}
                Err(err) => debug!(task = %task_id, %err, "failure dropped"),
            },
        }

        self.refresh_objectives();
        self.dispatch_ready();
    }

    /// Release slot accounting for externally-reported task terminations
    fn finish_task_bookkeeping(&self, task_id: &str) {
        let Some(task) = self.scheduler.get_task(task_id) else {
            return;
        };
        if let Some(worker_id) = &task.assigned_worker {
            let mut workers = self.workers.write().unwrap();
            if let Some(worker) = workers.get_mut(worker_id) {
                worker.task_finished(task_id);
            }
        }
    }

    /// A preempted deadlock victim gets its running work recycled through
    /// the normal retry path
    fn requeue_preempted_worker(self: &Arc<Self>, worker_id: &str) {
        let running: Vec<String> = self
            .scheduler
            .running_task_ids()
            .into_iter()
            .filter(|task_id| {
                self.scheduler
                    .get_task(task_id)
                    .and_then(|t| t.assigned_worker)
                    .as_deref()
                    == Some(worker_id)
            })
            .collect();
        for task_id in running {
            self.executor.cancel(&task_id);
            let err = CoordinationError::Deadlock {
                workers: vec![worker_id.to_string()],
                resources: Vec::new(),
            };
            let _ = self.scheduler.fail(&task_id, &err);
        }
    }

    /// Roll objective status forward from task terminal states
    fn refresh_objectives(&self) {
        let mut objectives = self.objectives.write().unwrap();
        for objective in objectives.values_mut() {
            if objective.status != ObjectiveStatus::Running || objective.task_ids.is_empty() {
                continue;
            }
            let tasks: Vec<Task> = objective
                .task_ids
                .iter()
                .filter_map(|id| self.scheduler.get_task(id))
                .collect();
            if tasks.len() < objective.task_ids.len() {
                continue;
            }
            if tasks.iter().all(|t| t.is_terminal()) {
                objective.status = if tasks.iter().all(|t| t.status == TaskStatus::Completed) {
                    ObjectiveStatus::Completed
                } else {
                    ObjectiveStatus::Failed
                };
                info!(objective = %objective.id, status = ?objective.status, "objective finished");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictKind;
    use crate::executor::HandlerRunner;

    fn manager() -> Arc<CoordinationManager> {
        let runner = Arc::new(HandlerRunner::new(|_| async {
            Ok(serde_json::json!({"ok": true}))
        }));
        CoordinationManager::new(CoordinationConfig::default(), runner).unwrap()
    }

    #[tokio::test]
    async fn test_objective_collects_until_started() {
        let manager = manager();
        let objective = manager.create_objective("demo", "sequential");

        let task_id = manager
            .add_task(objective, TaskSpec::new("step"))
            .unwrap();
        // Not admitted yet
        assert!(manager.task(&task_id).is_none());

        manager.start_objective(objective).unwrap();
        assert!(manager.task(&task_id).is_some());
        assert_eq!(
            manager.objective(objective).unwrap().status,
            ObjectiveStatus::Running
        );
    }

    #[tokio::test]
    async fn test_duplicate_worker_rejected() {
        let manager = manager();
        manager
            .register_worker(WorkerSpec::new("w1", "generic"))
            .unwrap();
        assert!(manager
            .register_worker(WorkerSpec::new("w1", "generic"))
            .is_err());
    }

    #[tokio::test]
    async fn test_health_degraded_without_workers() {
        let manager = manager();
        let report = manager.health_status();
        assert_eq!(report.overall, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_conflict_auto_resolution_uses_worker_priority() {
        let manager = manager();
        manager
            .register_worker(WorkerSpec::new("w1", "generic").with_priority(1))
            .unwrap();
        manager
            .register_worker(WorkerSpec::new("w2", "generic").with_priority(9))
            .unwrap();

        let conflict = manager
            .report_conflict(
                ConflictKind::Resource,
                "r1",
                vec!["w1".to_string(), "w2".to_string()],
            )
            .unwrap();
        assert!(conflict.resolved);
        assert_eq!(conflict.resolution.unwrap().winner, "w2");
    }

    #[tokio::test]
    async fn test_heartbeat_updates_load() {
        let manager = manager();
        manager
            .register_worker(WorkerSpec::new("w1", "generic"))
            .unwrap();

        manager
            .heartbeat(
                "w1",
                LoadSnapshot {
                    cpu: 0.5,
                    memory: 0.5,
                    capacity: 4,
                    ..Default::default()
                },
            )
            .unwrap();

        let stats = manager.stats();
        assert_eq!(stats.total_workers, 1);
        assert!(stats.avg_utilization > 0.0);

        assert!(manager
            .heartbeat("ghost", LoadSnapshot::default())
            .is_err());
    }

    #[tokio::test]
    async fn test_stats_start_empty() {
        let manager = manager();
        let stats = manager.stats();
        assert_eq!(stats.live_tasks, 0);
        assert_eq!(stats.completed_total, 0);
    }
}

//! End-to-end scenarios through the coordination manager.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use swarm_coordination::{
    CircuitBreakerConfig, CircuitState, CoordinationConfig, CoordinationError,
    CoordinationManager, HandlerRunner, LoadSnapshot, TaskPriority, TaskScheduler, TaskSpec,
    TaskStatus, WorkStealingBalancer, WorkStealingConfig, WorkerSpec,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fast_config() -> CoordinationConfig {
    init_tracing();
    CoordinationConfig {
        retry_delay_ms: 25,
        retry_backoff_base_ms: 50,
        retry_backoff_max_ms: 200,
        resource_timeout_ms: 2_000,
        deadlock_interval_ms: 100,
        kill_timeout_ms: 200,
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            timeout_ms: 400,
            half_open_limit: 1,
        },
        ..Default::default()
    }
}

async fn wait_until<F>(mut predicate: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    predicate()
}

#[tokio::test]
async fn simple_chain_completes_in_dependency_order() {
    let executed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let log = executed.clone();
    let runner = Arc::new(HandlerRunner::new(move |task| {
        let log = log.clone();
        async move {
            log.lock().unwrap().push(task.task_type.clone());
            Ok(serde_json::json!({"done": task.id}))
        }
    }));

    let manager = CoordinationManager::new(fast_config(), runner).unwrap();
    manager.initialize();

    manager
        .register_worker(WorkerSpec::new("w1", "researcher").with_capability("research"))
        .unwrap();
    manager
        .register_worker(WorkerSpec::new("w2", "analyst").with_capability("analysis"))
        .unwrap();

    let objective = manager.create_objective("research then analyse", "sequential");
    manager
        .add_task(
            objective,
            TaskSpec::new("research")
                .with_id("t1")
                .with_priority(TaskPriority::High)
                .requires_capability("research"),
        )
        .unwrap();
    manager
        .add_task(
            objective,
            TaskSpec::new("analysis")
                .with_id("t2")
                .depends_on("t1")
                .requires_capability("analysis"),
        )
        .unwrap();
    manager.start_objective(objective).unwrap();

    let manager_ref = manager.clone();
    assert!(
        wait_until(
            move || {
                ["t1", "t2"].iter().all(|id| {
                    manager_ref
                        .task(id)
                        .map(|t| t.status == TaskStatus::Completed)
                        .unwrap_or(false)
                })
            },
            Duration::from_secs(5),
        )
        .await
    );

    // T2 only ever started after T1 finished
    assert_eq!(
        *executed.lock().unwrap(),
        vec!["research".to_string(), "analysis".to_string()]
    );

    let t1 = manager.task("t1").unwrap();
    assert_eq!(t1.assigned_worker.as_deref(), Some("w1"));
    let t2 = manager.task("t2").unwrap();
    assert_eq!(t2.assigned_worker.as_deref(), Some("w2"));

    manager.shutdown().await;
}

#[tokio::test]
async fn long_chain_runs_in_topological_order() {
    let executed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let log = executed.clone();
    let runner = Arc::new(HandlerRunner::new(move |task| {
        let log = log.clone();
        async move {
            log.lock().unwrap().push(task.id.clone());
            Ok(serde_json::json!({}))
        }
    }));

    let manager = CoordinationManager::new(fast_config(), runner).unwrap();
    manager.initialize();
    manager
        .register_worker(WorkerSpec::new("w1", "generic").with_max_concurrent(1))
        .unwrap();

    for i in 0..6 {
        let mut spec = TaskSpec::new("step").with_id(format!("n{i}"));
        if i > 0 {
            spec = spec.depends_on(format!("n{}", i - 1));
        }
        manager.assign_task(spec).unwrap();
    }

    let manager_ref = manager.clone();
    assert!(
        wait_until(
            move || {
                manager_ref
                    .task("n5")
                    .map(|t| t.status == TaskStatus::Completed)
                    .unwrap_or(false)
            },
            Duration::from_secs(5),
        )
        .await
    );

    let order = executed.lock().unwrap().clone();
    assert_eq!(order, vec!["n0", "n1", "n2", "n3", "n4", "n5"]);
    manager.shutdown().await;
}

#[tokio::test]
async fn imbalance_triggers_steal_of_lowest_priority_tasks() {
    // Scheduler + balancer in isolation: dispatch builds up one worker's
    // queue, the balancer plans the migration, the scheduler executes it.
    let scheduler = TaskScheduler::new(
        Default::default(),
        Arc::new(swarm_coordination::LoadPredictor::new()),
        swarm_coordination::EventBus::new(),
        Arc::new(swarm_coordination::MetricsCollector::new(1_000)),
    );

    let w1 = swarm_coordination::Worker::from_spec(
        WorkerSpec::new("w1", "generic").with_max_concurrent(10),
    );
    for i in 0..8 {
        let priority = if i == 0 {
            TaskPriority::Critical
        } else {
            TaskPriority::Low
        };
        scheduler
            .add_task(swarm_coordination::Task::from_spec(
                TaskSpec::new("batch")
                    .with_id(format!("t{i}"))
                    .with_priority(priority),
                5_000,
                0,
            ))
            .unwrap();
    }
    // Only w1 is known at dispatch time, so it absorbs the whole batch
    assert_eq!(scheduler.next_dispatches(&[w1], None).len(), 8);
    assert_eq!(scheduler.queue_depth("w1"), 8);

    let balancer = WorkStealingBalancer::new(WorkStealingConfig {
        steal_threshold: 3,
        max_steal_batch: 2,
        ..Default::default()
    });
    balancer.update(
        "w1",
        LoadSnapshot {
            queue_depth: 8,
            cpu: 0.9,
            memory: 0.9,
            task_count: 8,
            capacity: 10,
            ..Default::default()
        },
    );
    balancer.update(
        "w2",
        LoadSnapshot {
            queue_depth: 1,
            cpu: 0.1,
            memory: 0.1,
            task_count: 1,
            capacity: 10,
            ..Default::default()
        },
    );

    let plans = balancer.plan();
    assert_eq!(plans.len(), 1);
    let moved = scheduler.steal(&plans[0].source, &plans[0].target, plans[0].count);

    assert_eq!(moved.len(), 2);
    assert_eq!(scheduler.queue_depth("w1"), 6);
    assert_eq!(scheduler.queue_depth("w2"), 2);
    // The critical task stayed; only low-priority work moved
    assert!(!moved.contains(&"t0".to_string()));
    for id in &moved {
        assert_eq!(
            scheduler.get_task(id).unwrap().assigned_worker.as_deref(),
            Some("w2")
        );
    }
}

#[tokio::test]
async fn timeout_exhausts_retries_then_fails() {
    let runner = Arc::new(HandlerRunner::new(|_| async {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(serde_json::json!({}))
    }));

    let manager = CoordinationManager::new(fast_config(), runner).unwrap();
    manager.initialize();
    manager
        .register_worker(WorkerSpec::new("w1", "generic").with_max_concurrent(4))
        .unwrap();

    manager
        .assign_task(
            TaskSpec::new("sleepy")
                .with_id("t1")
                .with_timeout_ms(100)
                .with_max_retries(2),
        )
        .unwrap();

    let manager_ref = manager.clone();
    assert!(
        wait_until(
            move || {
                manager_ref
                    .task("t1")
                    .map(|t| t.status == TaskStatus::Failed)
                    .unwrap_or(false)
            },
            Duration::from_secs(10),
        )
        .await
    );

    let task = manager.task("t1").unwrap();
    // Exactly max_retries + 1 attempts, final error is the timeout
    assert_eq!(task.attempts, 3);
    assert_eq!(task.error.as_ref().unwrap().kind, "timeout");
    manager.shutdown().await;
}

#[tokio::test]
async fn deadlock_is_detected_and_lowest_priority_loses() {
    let runner = Arc::new(HandlerRunner::new(|_| async { Ok(serde_json::json!({})) }));
    let manager = CoordinationManager::new(fast_config(), runner).unwrap();
    manager.initialize();
    manager
        .register_worker(WorkerSpec::new("w1", "generic").with_priority(5))
        .unwrap();
    manager
        .register_worker(WorkerSpec::new("w2", "generic").with_priority(10))
        .unwrap();

    manager.acquire_resource("r1", "w1", 5).await.unwrap();
    manager.acquire_resource("r2", "w2", 10).await.unwrap();

    // Cross-wait to form the cycle
    let m1 = manager.clone();
    let w1_wait = tokio::spawn(async move { m1.acquire_resource("r2", "w1", 5).await });
    let m2 = manager.clone();
    let w2_wait = tokio::spawn(async move { m2.acquire_resource("r1", "w2", 10).await });

    // Within one detection interval, w1 (lower priority) is preempted and
    // w2 gets both resources
    let granted = tokio::time::timeout(Duration::from_secs(2), w2_wait)
        .await
        .expect("deadlock not broken in time")
        .unwrap();
    granted.unwrap();

    let _ = w1_wait.await;
    manager.shutdown().await;
}

#[tokio::test]
async fn circuit_breaker_opens_and_recovers() {
    let healthy = Arc::new(AtomicBool::new(false));
    let flag = healthy.clone();
    let runner = Arc::new(HandlerRunner::new(move |task| {
        let flag = flag.clone();
        async move {
            if flag.load(Ordering::SeqCst) {
                Ok(serde_json::json!({"ok": true}))
            } else {
                Err(CoordinationError::execution(task.id, "worker is broken"))
            }
        }
    }));

    let manager = CoordinationManager::new(fast_config(), runner).unwrap();
    manager.initialize();
    manager
        .register_worker(WorkerSpec::new("w3", "generic").with_max_concurrent(4))
        .unwrap();

    let run_one = |n: u32| {
        let manager = manager.clone();
        async move {
            let id = format!("task-{n}");
            manager
                .assign_task(TaskSpec::new("probe").with_id(&id).with_max_retries(0))
                .unwrap();
            let manager_ref = manager.clone();
            let id_ref = id.clone();
            wait_until(
                move || {
                    manager_ref
                        .task(&id_ref)
                        .map(|t| t.is_terminal())
                        .unwrap_or(false)
                },
                Duration::from_secs(5),
            )
            .await;
            manager.task(&id).unwrap()
        }
    };

    // Three consecutive failures trip the breaker
    for n in 0..3 {
        let task = run_one(n).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_ref().unwrap().kind, "execution_failure");
    }
    assert_eq!(
        manager.breakers().states()["worker:w3"],
        CircuitState::Open
    );

    // While open, assignments are rejected without reaching the worker
    let rejected = run_one(3).await;
    assert_eq!(rejected.error.as_ref().unwrap().kind, "circuit_open");

    // After the reset timeout, probes succeed and close the breaker
    tokio::time::sleep(Duration::from_millis(450)).await;
    healthy.store(true, Ordering::SeqCst);
    for n in 4..6 {
        let task = run_one(n).await;
        assert_eq!(task.status, TaskStatus::Completed);
    }
    assert_eq!(
        manager.breakers().states()["worker:w3"],
        CircuitState::Closed
    );
    manager.shutdown().await;
}

#[tokio::test]
async fn failed_parent_cancels_dependents_without_dispatching_them() {
    let executed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let log = executed.clone();
    let runner = Arc::new(HandlerRunner::new(move |task| {
        let log = log.clone();
        async move {
            log.lock().unwrap().push(task.id.clone());
            Err(CoordinationError::execution(task.id, "always fails"))
        }
    }));

    let manager = CoordinationManager::new(fast_config(), runner).unwrap();
    manager.initialize();
    manager
        .register_worker(WorkerSpec::new("w1", "generic").with_max_concurrent(4))
        .unwrap();

    manager
        .assign_task(TaskSpec::new("parent").with_id("t1").with_max_retries(1))
        .unwrap();
    manager
        .assign_task(TaskSpec::new("child").with_id("t2").depends_on("t1"))
        .unwrap();
    manager
        .assign_task(TaskSpec::new("child").with_id("t3").depends_on("t1"))
        .unwrap();

    let manager_ref = manager.clone();
    assert!(
        wait_until(
            move || {
                ["t2", "t3"].iter().all(|id| {
                    manager_ref
                        .task(id)
                        .map(|t| t.status == TaskStatus::Cancelled)
                        .unwrap_or(false)
                })
            },
            Duration::from_secs(10),
        )
        .await
    );

    let t1 = manager.task("t1").unwrap();
    assert_eq!(t1.status, TaskStatus::Failed);
    assert_eq!(t1.attempts, 2);

    for id in ["t2", "t3"] {
        let task = manager.task(id).unwrap();
        assert_eq!(task.error.as_ref().unwrap().kind, "cancelled");
        assert_eq!(task.error.as_ref().unwrap().cause.as_deref(), Some("t1"));
    }
    // Only the parent ever reached a worker
    assert_eq!(*executed.lock().unwrap(), vec!["t1", "t1"]);
    manager.shutdown().await;
}

#[tokio::test]
async fn snapshot_round_trip_restores_tasks_and_objectives() {
    let runner = Arc::new(HandlerRunner::new(|_| async { Ok(serde_json::json!({})) }));
    let manager = CoordinationManager::new(fast_config(), runner.clone()).unwrap();
    manager.initialize();
    manager
        .register_worker(WorkerSpec::new("w1", "generic"))
        .unwrap();

    let objective = manager.create_objective("persisted work", "parallel");
    manager
        .add_task(objective, TaskSpec::new("step").with_id("t1"))
        .unwrap();
    manager.start_objective(objective).unwrap();

    let manager_ref = manager.clone();
    assert!(
        wait_until(
            move || {
                manager_ref
                    .task("t1")
                    .map(|t| t.status == TaskStatus::Completed)
                    .unwrap_or(false)
            },
            Duration::from_secs(5),
        )
        .await
    );

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.json");
    manager.save_snapshot(&path).unwrap();
    manager.shutdown().await;

    // A fresh manager restores the objective and the completed task
    let restored = CoordinationManager::new(fast_config(), runner).unwrap();
    restored.load_snapshot(&path).unwrap();

    let objective = restored.objective(objective).unwrap();
    assert_eq!(objective.task_ids, vec!["t1".to_string()]);
    let task = restored.task("t1").unwrap();
    assert_eq!(task.status, TaskStatus::Completed);

    // And a dependent of the restored task is immediately schedulable
    restored
        .assign_task(TaskSpec::new("followup").with_id("t2").depends_on("t1"))
        .unwrap();
    assert!(restored.task("t2").is_some());
}

#[tokio::test]
async fn worker_death_requeues_its_tasks_to_survivors() {
    let runner = Arc::new(HandlerRunner::new(|task| async move {
        if task.payload["slow"] == serde_json::json!(true) {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        Ok(serde_json::json!({}))
    }));

    let manager = CoordinationManager::new(fast_config(), runner).unwrap();
    manager.initialize();
    manager
        .register_worker(WorkerSpec::new("w1", "generic").with_max_concurrent(4))
        .unwrap();

    manager
        .assign_task(
            TaskSpec::new("job")
                .with_id("t1")
                .with_payload(serde_json::json!({"slow": true})),
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // w1 goes away mid-flight; its running task recycles through the retry
    // path and lands on the replacement worker
    manager.deregister_worker("w1").await.unwrap();
    manager
        .register_worker(WorkerSpec::new("w2", "generic").with_max_concurrent(4))
        .unwrap();

    let manager_ref = manager.clone();
    assert!(
        wait_until(
            move || {
                manager_ref
                    .task("t1")
                    .map(|t| t.status == TaskStatus::Completed)
                    .unwrap_or(false)
            },
            Duration::from_secs(10),
        )
        .await
    );
    assert_eq!(
        manager.task("t1").unwrap().assigned_worker.as_deref(),
        Some("w2")
    );
    manager.shutdown().await;
}

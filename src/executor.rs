/*!
# Task Executor

Runs a bound task on a worker with a timeout race, per-worker circuit
breaking, resource monitoring, and jittered retry for transient execution
errors. The reference runner spawns an out-of-process child speaking the
stdin/stdout JSON protocol; an in-process handler runner is also provided.
*/

use crate::breaker::CircuitBreakerRegistry;
use crate::error::{CoordinationError, Result};
use crate::events::{CoordinationEvent, EventBus};
use crate::metrics::MetricsCollector;
use crate::task::{Task, TaskOutcome};
use crate::worker::Worker;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, warn};

/// Executor tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Concurrent executions; excess tasks wait in the executor queue
    pub max_concurrent_tasks: usize,
    /// Grace between the stop signal and the force-kill, in milliseconds
    pub kill_timeout_ms: u64,
    /// Attempts per execution for transient errors; 1 leaves retrying to the
    /// scheduler so per-task attempt accounting stays exact
    pub retry_attempts: u32,
    /// Backoff base between executor-level attempts, in milliseconds
    pub retry_backoff_base_ms: u64,
    /// Backoff ceiling, in milliseconds
    pub retry_backoff_max_ms: u64,
    /// Resource monitor poll interval, in milliseconds
    pub monitor_interval_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            kill_timeout_ms: 5_000,
            retry_attempts: 1,
            retry_backoff_base_ms: 1_000,
            retry_backoff_max_ms: 30_000,
            monitor_interval_ms: 5_000,
        }
    }
}

/// Everything a runner needs for one attempt
pub struct ExecutionContext {
    /// The task to run
    pub task: Task,
    /// The worker it is bound to
    pub worker: Worker,
    /// Signalled when the attempt must stop
    pub cancel: Arc<Notify>,
}

/// The execution seam: opaque to the coordinator, which only sees the typed
/// outcome or error
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Run one attempt. Implementations must return promptly once
    /// `ctx.cancel` fires.
    async fn run(&self, ctx: &ExecutionContext) -> Result<TaskOutcome>;
}

/// In-process handler function type
pub type TaskHandler = Arc<
    dyn Fn(Task) -> Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send>> + Send + Sync,
>;

/// Runs tasks through an in-process async handler
pub struct HandlerRunner {
    handler: TaskHandler,
}

impl HandlerRunner {
    /// Wrap a handler closure
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |task| Box::pin(handler(task))),
        }
    }
}

#[async_trait]
impl TaskRunner for HandlerRunner {
    async fn run(&self, ctx: &ExecutionContext) -> Result<TaskOutcome> {
        let fut = (self.handler)(ctx.task.clone());
        tokio::select! {
            result = fut => result.map(TaskOutcome::structured),
            _ = ctx.cancel.notified() => {
                Err(CoordinationError::cancelled(ctx.task.id.clone(), "stopped"))
            }
        }
    }
}

/// Runs tasks as child processes speaking the stdin/stdout JSON protocol
pub struct ProcessRunner {
    program: PathBuf,
    args: Vec<String>,
    kill_timeout: Duration,
    monitor_interval: Duration,
}

impl ProcessRunner {
    /// Create a runner for the given worker executable
    pub fn new(program: impl Into<PathBuf>, config: &ExecutorConfig) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            kill_timeout: Duration::from_millis(config.kill_timeout_ms),
            monitor_interval: Duration::from_millis(config.monitor_interval_ms),
        }
    }

    /// Extra arguments for the child
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    async fn stop_child(&self, child: &mut tokio::process::Child) {
        // stdin was already closed, which is the graceful stop signal
        if tokio::time::timeout(self.kill_timeout, child.wait())
            .await
            .is_err()
        {
            warn!("child did not stop in time, force-killing");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

#[async_trait]
impl TaskRunner for ProcessRunner {
    async fn run(&self, ctx: &ExecutionContext) -> Result<TaskOutcome> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let request = serde_json::json!({
            "task": ctx.task,
            "worker": ctx.worker.id,
            "input": ctx.task.payload,
        });
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&serde_json::to_vec(&request)?).await?;
            // Dropping stdin sends EOF; the child winds down on it
        }

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        let pid = child.id();
        let mut monitor = tokio::time::interval(self.monitor_interval);
        monitor.tick().await; // first tick fires immediately
        let mut cpu_probe = CpuProbe::new();

        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                _ = ctx.cancel.notified() => {
                    self.stop_child(&mut child).await;
                    return Err(CoordinationError::cancelled(ctx.task.id.clone(), "stopped"));
                }
                _ = monitor.tick() => {
                    if let Some(pid) = pid {
                        if let Some(memory) = probe_memory_bytes(pid) {
                            if memory > ctx.worker.resource_limits.memory_bytes {
                                let _ = child.start_kill();
                                let _ = child.wait().await;
                                return Err(CoordinationError::ResourceExceeded {
                                    task_id: ctx.task.id.clone(),
                                    detail: format!(
                                        "memory {memory} bytes over limit {}",
                                        ctx.worker.resource_limits.memory_bytes
                                    ),
                                });
                            }
                        }
                        if let Some(cores) = cpu_probe.sample(pid) {
                            if cores > ctx.worker.resource_limits.cpu_cores {
                                warn!(
                                    task = %ctx.task.id,
                                    cores,
                                    limit = ctx.worker.resource_limits.cpu_cores,
                                    "task over cpu limit"
                                );
                            }
                        }
                    }
                }
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        parse_child_output(&ctx.task.id, status.code(), &stdout, &stderr)
    }
}

/// Interpret the child's exit per the executor protocol
pub(crate) fn parse_child_output(
    task_id: &str,
    exit_code: Option<i32>,
    stdout: &[u8],
    stderr: &[u8],
) -> Result<TaskOutcome> {
    if exit_code != Some(0) {
        let message = String::from_utf8_lossy(stderr).trim().to_string();
        return Err(CoordinationError::ExecutionFailure {
            task_id: task_id.to_string(),
            message: if message.is_empty() {
                format!("exit code {:?}", exit_code)
            } else {
                message
            },
        });
    }

    let text = String::from_utf8_lossy(stdout);
    match serde_json::from_str::<serde_json::Value>(text.trim()) {
        Ok(value) if value.get("result").is_some() => {
            serde_json::from_value(value).map_err(CoordinationError::from)
        }
        Ok(value) => Ok(TaskOutcome::structured(value)),
        Err(_) => Ok(TaskOutcome::raw_text(text.trim())),
    }
}

/// Resident memory of a process, bytes (Linux procfs)
fn probe_memory_bytes(pid: u32) -> Option<u64> {
    if !cfg!(target_os = "linux") {
        return None;
    }
    let statm = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096)
}

/// Two-sample CPU usage estimate from procfs tick counters
struct CpuProbe {
    last: Option<(Instant, u64)>,
}

impl CpuProbe {
    fn new() -> Self {
        Self { last: None }
    }

    /// Cores used since the previous sample, or `None` until two samples exist
    fn sample(&mut self, pid: u32) -> Option<f64> {
        if !cfg!(target_os = "linux") {
            return None;
        }
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        // Fields 14 and 15 (utime, stime) follow the parenthesised comm field
        let rest = stat.rsplit(')').next()?;
        let fields: Vec<&str> = rest.split_whitespace().collect();
        let utime: u64 = fields.get(11)?.parse().ok()?;
        let stime: u64 = fields.get(12)?.parse().ok()?;
        let ticks = utime + stime;
        let now = Instant::now();

        let cores = match self.last {
            Some((at, previous)) => {
                let elapsed = now.duration_since(at).as_secs_f64();
                if elapsed > 0.0 {
                    let tick_hz = 100.0;
                    Some((ticks.saturating_sub(previous)) as f64 / tick_hz / elapsed)
                } else {
                    None
                }
            }
            None => None,
        };
        self.last = Some((now, ticks));
        cores
    }
}

/// The executor
pub struct TaskExecutor {
    config: ExecutorConfig,
    breakers: Arc<CircuitBreakerRegistry>,
    events: EventBus,
    metrics: Arc<MetricsCollector>,
    semaphore: Arc<Semaphore>,
    queued: AtomicUsize,
    running: Mutex<HashMap<String, Arc<Notify>>>,
}

impl TaskExecutor {
    /// Create an executor
    pub fn new(
        config: ExecutorConfig,
        breakers: Arc<CircuitBreakerRegistry>,
        events: EventBus,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_tasks)),
            config,
            breakers,
            events,
            metrics,
            queued: AtomicUsize::new(0),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Tasks waiting on executor capacity
    pub fn queue_depth(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    /// Tasks currently executing
    pub fn running_count(&self) -> usize {
        self.running.lock().unwrap().len()
    }

    /// Signal a running task to stop. Returns whether it was running.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.running.lock().unwrap().get(task_id) {
            Some(cancel) => {
                cancel.notify_one();
                true
            }
            None => false,
        }
    }

    /// Signal every running task; used at shutdown
    pub fn cancel_all(&self) {
        for cancel in self.running.lock().unwrap().values() {
            cancel.notify_one();
        }
    }

    /// Execute a task on a worker through the given runner.
    ///
    /// Waits for executor capacity first (distinct from the scheduler's
    /// dependency queue), then races the runner against the task's timeout
    /// and external cancellation, inside the worker's circuit breaker.
    pub async fn execute(
        &self,
        task: Task,
        worker: Worker,
        runner: Arc<dyn TaskRunner>,
    ) -> Result<TaskOutcome> {
        self.queued.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .set_gauge("executor.queue_depth", self.queue_depth() as f64);
        let permit = self.semaphore.clone().acquire_owned().await;
        self.queued.fetch_sub(1, Ordering::Relaxed);
        self.metrics
            .set_gauge("executor.queue_depth", self.queue_depth() as f64);
        let _permit =
            permit.map_err(|_| CoordinationError::system("executor is shut down"))?;

        let external_cancel = Arc::new(Notify::new());
        self.running
            .lock()
            .unwrap()
            .insert(task.id.clone(), external_cancel.clone());
        self.metrics
            .set_gauge("executor.running", self.running_count() as f64);

        let started = Instant::now();
        let result = self
            .run_attempts(&task, &worker, runner, external_cancel)
            .await;
        self.running.lock().unwrap().remove(&task.id);
        self.metrics
            .set_gauge("executor.running", self.running_count() as f64);
        self.metrics.observe(
            "executor.attempt_duration_ms",
            started.elapsed().as_secs_f64() * 1_000.0,
        );
        result
    }

    async fn run_attempts(
        &self,
        task: &Task,
        worker: &Worker,
        runner: Arc<dyn TaskRunner>,
        external_cancel: Arc<Notify>,
    ) -> Result<TaskOutcome> {
        let breaker = self.breakers.breaker_for(&format!("worker:{}", worker.id));
        let max_attempts = self.config.retry_attempts.max(1);
        let mut attempt = 1u32;

        loop {
            breaker.try_admit()?;
            let result = self
                .run_once(task, worker, runner.clone(), external_cancel.clone())
                .await;

            let transition = match &result {
                Ok(_) => breaker.record_success(),
                Err(CoordinationError::Cancelled { .. }) => {
                    breaker.record_discard();
                    None
                }
                Err(_) => breaker.record_failure(),
            };
            if let Some(state) = transition {
                self.events.emit(CoordinationEvent::CircuitStateChanged {
                    target: breaker.target().to_string(),
                    state,
                });
            }

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    // Timeouts and open circuits go back to the scheduler's
                    // retry policy; only transient execution errors are
                    // retried here.
                    let retry_here = err.is_retryable()
                        && !matches!(
                            err,
                            CoordinationError::Timeout { .. }
                                | CoordinationError::CircuitOpen { .. }
                        )
                        && attempt < max_attempts;
                    if !retry_here {
                        return Err(err);
                    }

                    let exponent = (attempt - 1).min(16);
                    let backoff = self
                        .config
                        .retry_backoff_base_ms
                        .saturating_mul(1u64 << exponent)
                        .min(self.config.retry_backoff_max_ms);
                    // Jitter by up to 30% to decorrelate retry storms
                    let factor = rand::thread_rng().gen_range(0.7..=1.3);
                    let delay = Duration::from_millis((backoff as f64 * factor) as u64);
                    warn!(
                        task = %task.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "execution attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn run_once(
        &self,
        task: &Task,
        worker: &Worker,
        runner: Arc<dyn TaskRunner>,
        external_cancel: Arc<Notify>,
    ) -> Result<TaskOutcome> {
        let attempt_cancel = Arc::new(Notify::new());
        let ctx = ExecutionContext {
            task: task.clone(),
            worker: worker.clone(),
            cancel: attempt_cancel.clone(),
        };

        let fut = runner.run(&ctx);
        tokio::pin!(fut);
        let grace = Duration::from_millis(self.config.kill_timeout_ms);

        tokio::select! {
            result = &mut fut => result,
            _ = tokio::time::sleep(Duration::from_millis(task.timeout_ms)) => {
                debug!(task = %task.id, "task timed out, signalling stop");
                attempt_cancel.notify_one();
                let _ = tokio::time::timeout(grace, &mut fut).await;
                Err(CoordinationError::Timeout {
                    task_id: task.id.clone(),
                    timeout_ms: task.timeout_ms,
                })
            }
            _ = external_cancel.notified() => {
                attempt_cancel.notify_one();
                let _ = tokio::time::timeout(grace, &mut fut).await;
                Err(CoordinationError::cancelled(task.id.clone(), "requested"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreakerConfig;
    use crate::task::TaskSpec;
    use crate::worker::WorkerSpec;

    fn executor(config: ExecutorConfig) -> TaskExecutor {
        TaskExecutor::new(
            config,
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
                failure_threshold: 3,
                success_threshold: 1,
                timeout_ms: 10_000,
                half_open_limit: 1,
            })),
            EventBus::new(),
            Arc::new(MetricsCollector::new(1000)),
        )
    }

    fn task(timeout_ms: u64) -> Task {
        Task::from_spec(TaskSpec::new("test").with_timeout_ms(timeout_ms), 5_000, 0)
    }

    fn worker() -> Worker {
        Worker::from_spec(WorkerSpec::new("w1", "generic").with_max_concurrent(4))
    }

    #[tokio::test]
    async fn test_handler_success() {
        let executor = executor(ExecutorConfig::default());
        let runner = Arc::new(HandlerRunner::new(|_| async {
            Ok(serde_json::json!({"answer": 42}))
        }));

        let outcome = executor.execute(task(1_000), worker(), runner).await.unwrap();
        assert_eq!(outcome.result, serde_json::json!({"answer": 42}));
        assert_eq!(outcome.quality, 0.8);
    }

    #[tokio::test]
    async fn test_timeout_surfaces() {
        let executor = executor(ExecutorConfig {
            kill_timeout_ms: 50,
            ..Default::default()
        });
        let runner = Arc::new(HandlerRunner::new(|_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(serde_json::json!({}))
        }));

        let started = Instant::now();
        let err = executor
            .execute(task(50), worker(), runner)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_external_cancel() {
        let executor = Arc::new(executor(ExecutorConfig {
            kill_timeout_ms: 50,
            ..Default::default()
        }));
        let runner = Arc::new(HandlerRunner::new(|_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(serde_json::json!({}))
        }));

        let task = task(60_000);
        let task_id = task.id.clone();
        let exec = executor.clone();
        let handle = tokio::spawn(async move { exec.execute(task, worker(), runner).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(executor.cancel(&task_id));

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, CoordinationError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_capacity_queues_excess() {
        let executor = Arc::new(executor(ExecutorConfig {
            max_concurrent_tasks: 1,
            ..Default::default()
        }));
        let runner = Arc::new(HandlerRunner::new(|_| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(serde_json::json!({}))
        }));

        let first = {
            let exec = executor.clone();
            let runner = runner.clone();
            tokio::spawn(async move { exec.execute(task(5_000), worker(), runner).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = {
            let exec = executor.clone();
            let runner = runner.clone();
            tokio::spawn(async move { exec.execute(task(5_000), worker(), runner).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Second task is waiting on capacity, not executing
        assert_eq!(executor.running_count(), 1);
        assert_eq!(executor.queue_depth(), 1);

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_internal_retry_on_transient_failure() {
        let executor = executor(ExecutorConfig {
            retry_attempts: 3,
            retry_backoff_base_ms: 5,
            retry_backoff_max_ms: 20,
            ..Default::default()
        });

        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let runner = Arc::new(HandlerRunner::new(move |task| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(CoordinationError::execution(task.id, "flaky"))
                } else {
                    Ok(serde_json::json!({"ok": true}))
                }
            }
        }));

        let outcome = executor.execute(task(1_000), worker(), runner).await.unwrap();
        assert_eq!(outcome.result, serde_json::json!({"ok": true}));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_breaker_rejects_after_failures() {
        let executor = executor(ExecutorConfig::default());
        let runner = Arc::new(HandlerRunner::new(|task| async move {
            Err(CoordinationError::execution(task.id, "always broken"))
        }));

        for _ in 0..3 {
            let _ = executor
                .execute(task(1_000), worker(), runner.clone())
                .await;
        }
        let err = executor
            .execute(task(1_000), worker(), runner)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::CircuitOpen { .. }));
    }

    #[test]
    fn test_parse_structured_output() {
        let stdout = br#"{"result": {"files": 3}, "quality": 0.95}"#;
        let outcome = parse_child_output("t1", Some(0), stdout, b"").unwrap();
        assert_eq!(outcome.result, serde_json::json!({"files": 3}));
        assert_eq!(outcome.quality, 0.95);
        assert_eq!(outcome.completeness, 1.0);
    }

    #[test]
    fn test_parse_json_without_result_key() {
        let stdout = br#"{"files": 3}"#;
        let outcome = parse_child_output("t1", Some(0), stdout, b"").unwrap();
        assert_eq!(outcome.result, serde_json::json!({"files": 3}));
        assert_eq!(outcome.quality, 0.8);
    }

    #[test]
    fn test_parse_raw_text_output() {
        let outcome = parse_child_output("t1", Some(0), b"done, wrote 3 files\n", b"").unwrap();
        assert_eq!(
            outcome.result,
            serde_json::Value::String("done, wrote 3 files".to_string())
        );
        assert_eq!(outcome.quality, 0.5);
    }

    #[test]
    fn test_parse_nonzero_exit() {
        let err = parse_child_output("t1", Some(2), b"", b"worker exploded\n").unwrap_err();
        match err {
            CoordinationError::ExecutionFailure { message, .. } => {
                assert_eq!(message, "worker exploded");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}

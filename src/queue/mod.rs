// =============================================================================
// Priority Task Queue — five levels, bounded workers, cooperative cancellation
// =============================================================================
//
// Ordering is strict by priority, FIFO within a level. One worker slot is
// reserved for low/background work whenever four or more workers run, so the
// background levels can never be starved indefinitely. Failed or timed-out
// tasks re-enqueue at the same priority with exponential backoff until
// `max_retries` is exhausted. Over the pending cap, low/background
// submissions are shed and critical submissions block the submitter briefly
// until capacity frees. Shutdown drains critical and high within a grace
// period and cancels everything else.
//
// Every background subsystem runs through here: fill watches, auto-bracket
// sweeps, EOD rollover, prefetches, scheduled strategy restarts.
// =============================================================================

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Base delay before the first retry; doubles per attempt.
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(250);
/// Idle poll interval for workers waiting on the notify.
const WORKER_IDLE_POLL: Duration = Duration::from_millis(100);
/// How long an over-capacity critical submission blocks waiting for a slot
/// before being accepted anyway (critical work must never be lost).
const CRITICAL_BLOCK_MAX: Duration = Duration::from_secs(2);
/// Poll interval while a critical submission waits for capacity.
const CAPACITY_POLL: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
    Background = 4,
}

impl Priority {
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Background,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Levels kept alive through shutdown.
    fn survives_shutdown(self) -> bool {
        matches!(self, Priority::Critical | Priority::High)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
            Self::Background => "background",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation flag. Long-running tasks check this at their
/// yield points and bail out cleanly.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Task plumbing
// ---------------------------------------------------------------------------

/// Declares how a task runs: priority, timeout, retry budget.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: String,
    pub priority: Priority,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, priority: Priority) -> Self {
        Self {
            name: name.into(),
            priority,
            timeout: Duration::from_secs(30),
            max_retries: 3,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type TaskFactory = Arc<dyn Fn(CancelToken) -> TaskFuture + Send + Sync>;

struct QueuedTask {
    spec: TaskSpec,
    factory: TaskFactory,
    attempt: u32,
    cancel: CancelToken,
}

/// Why a submission was refused.
#[derive(Debug, PartialEq, Eq)]
pub enum SubmitError {
    /// Backpressure: the pending cap was hit and this level sheds first.
    Shed,
    /// The queue is shutting down and only critical/high are accepted.
    ShuttingDown,
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shed => write!(f, "task shed by backpressure"),
            Self::ShuttingDown => write!(f, "queue shutting down"),
        }
    }
}

/// Counters exposed on `/metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub shed: u64,
    pub cancelled: u64,
    pub pending: usize,
    pub active: u64,
}

// ---------------------------------------------------------------------------
// TaskQueue
// ---------------------------------------------------------------------------

pub struct TaskQueue {
    queues: Mutex<[VecDeque<QueuedTask>; 5]>,
    notify: Notify,
    workers: usize,
    max_pending: usize,
    shutting_down: AtomicBool,
    active: AtomicU64,

    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    shed: AtomicU64,
    cancelled: AtomicU64,
}

impl TaskQueue {
    pub fn new(workers: usize, max_pending: usize) -> Arc<Self> {
        Arc::new(Self {
            queues: Mutex::new(std::array::from_fn(|_| VecDeque::new())),
            notify: Notify::new(),
            workers: workers.max(1),
            max_pending: max_pending.max(1),
            shutting_down: AtomicBool::new(false),
            active: AtomicU64::new(0),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            shed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        })
    }

    /// Spawn the worker pool. Whenever four or more workers run, worker 0 is
    /// reserved: it prefers low/background so those levels always progress.
    pub fn start(self: &Arc<Self>) {
        for i in 0..self.workers {
            let queue = Arc::clone(self);
            let reserved = i == 0 && self.workers >= 4;
            tokio::spawn(async move {
                queue.worker_loop(reserved).await;
            });
        }
        info!(workers = self.workers, "task queue workers started");
    }

    /// Enqueue a task. The closure is a factory so retries re-run it from
    /// the start. Returns the task's cancellation token.
    ///
    /// Backpressure above `max_pending`: low/background submissions are
    /// shed, critical submissions block the submitter briefly until a slot
    /// frees (then enqueue regardless), high/normal are accepted with a
    /// warning.
    pub async fn submit<F, Fut>(
        &self,
        spec: TaskSpec,
        factory: F,
    ) -> Result<CancelToken, SubmitError>
    where
        F: Fn(CancelToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.shutting_down.load(Ordering::SeqCst) && !spec.priority.survives_shutdown() {
            return Err(SubmitError::ShuttingDown);
        }

        let pending = self.pending();
        if pending >= self.max_pending {
            match spec.priority {
                Priority::Low | Priority::Background => {
                    self.shed.fetch_add(1, Ordering::Relaxed);
                    warn!(task = %spec.name, pending, "submission shed by backpressure");
                    return Err(SubmitError::Shed);
                }
                Priority::Critical => {
                    // Block the submitter briefly until capacity frees.
                    let deadline = tokio::time::Instant::now() + CRITICAL_BLOCK_MAX;
                    while self.pending() >= self.max_pending
                        && tokio::time::Instant::now() < deadline
                    {
                        tokio::time::sleep(CAPACITY_POLL).await;
                    }
                    if self.pending() >= self.max_pending {
                        warn!(
                            task = %spec.name,
                            "capacity wait expired — accepting critical task over the cap"
                        );
                    }
                }
                p => {
                    warn!(task = %spec.name, priority = %p, pending, "queue over capacity — accepting anyway");
                }
            }
        }

        let cancel = CancelToken::new();
        let factory: TaskFactory = Arc::new(move |token| Box::pin(factory(token)) as TaskFuture);

        let task = QueuedTask {
            spec,
            factory,
            attempt: 0,
            cancel: cancel.clone(),
        };

        self.push(task);
        self.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(cancel)
    }

    fn push(&self, task: QueuedTask) {
        let idx = task.spec.priority.index();
        self.queues.lock()[idx].push_back(task);
        self.notify.notify_one();
    }

    fn pending(&self) -> usize {
        self.queues.lock().iter().map(VecDeque::len).sum()
    }

    /// Pop the next task. Regular workers scan critical → background; the
    /// reserved worker scans low/background first so they cannot starve.
    fn pop(&self, reserved: bool) -> Option<QueuedTask> {
        let mut queues = self.queues.lock();
        let order: &[usize] = if reserved {
            &[3, 4, 0, 1, 2]
        } else {
            &[0, 1, 2, 3, 4]
        };
        for &idx in order {
            if let Some(task) = queues[idx].pop_front() {
                return Some(task);
            }
        }
        None
    }

    async fn worker_loop(self: Arc<Self>, reserved: bool) {
        loop {
            match self.pop(reserved) {
                Some(task) => {
                    Arc::clone(&self).run_task(task).await;
                }
                None => {
                    if self.shutting_down.load(Ordering::SeqCst) {
                        break;
                    }
                    // Wake on notify or poll periodically to observe shutdown.
                    let _ = tokio::time::timeout(WORKER_IDLE_POLL, self.notify.notified()).await;
                }
            }
        }
        debug!(reserved, "worker exiting");
    }

    async fn run_task(self: Arc<Self>, mut task: QueuedTask) {
        if task.cancel.is_cancelled() {
            self.cancelled.fetch_add(1, Ordering::Relaxed);
            debug!(task = %task.spec.name, "task skipped (cancelled before start)");
            return;
        }

        self.active.fetch_add(1, Ordering::SeqCst);
        let fut = (task.factory)(task.cancel.clone());
        let outcome = tokio::time::timeout(task.spec.timeout, fut).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        let failure = match outcome {
            Ok(Ok(())) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                debug!(task = %task.spec.name, attempt = task.attempt, "task completed");
                return;
            }
            Ok(Err(e)) => format!("{e:#}"),
            Err(_) => format!("timed out after {:?}", task.spec.timeout),
        };

        if task.cancel.is_cancelled() {
            self.cancelled.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if task.attempt < task.spec.max_retries {
            task.attempt += 1;
            self.retried.fetch_add(1, Ordering::Relaxed);
            let delay = RETRY_BACKOFF_BASE * 2u32.saturating_pow(task.attempt - 1);
            warn!(
                task = %task.spec.name,
                attempt = task.attempt,
                max = task.spec.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "task failed — re-enqueueing with backoff"
            );

            // Delayed re-enqueue at the same priority. Dropped silently if
            // the level does not survive an in-progress shutdown.
            let queue = Arc::clone(&self);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if queue.shutting_down.load(Ordering::SeqCst)
                    && !task.spec.priority.survives_shutdown()
                {
                    queue.cancelled.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                queue.push(task);
            });
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                task = %task.spec.name,
                attempts = task.attempt + 1,
                error = %failure,
                "task failed terminally"
            );
        }
    }

    /// Cooperative shutdown: cancel and drop normal/low/background work,
    /// then wait up to `grace` for critical and high to drain.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutting_down.store(true, Ordering::SeqCst);

        {
            let mut queues = self.queues.lock();
            for idx in [2usize, 3, 4] {
                for task in queues[idx].drain(..) {
                    task.cancel.cancel();
                    self.cancelled.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        self.notify.notify_waiters();

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let critical_high_pending = {
                let queues = self.queues.lock();
                queues[0].len() + queues[1].len()
            };
            if critical_high_pending == 0 && self.active.load(Ordering::SeqCst) == 0 {
                info!("task queue drained cleanly");
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    pending = critical_high_pending,
                    active = self.active.load(Ordering::SeqCst),
                    "shutdown grace period expired — abandoning remaining tasks"
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            shed: self.shed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            pending: self.pending(),
            active: self.active.load(Ordering::SeqCst),
        }
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("workers", &self.workers)
            .field("pending", &self.pending())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    async fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn strict_priority_ordering_within_one_worker() {
        let queue = TaskQueue::new(1, 100);
        let order = Arc::new(Mutex::new(Vec::<&'static str>::new()));

        // Block the single worker so the later submissions queue up.
        let gate = Arc::new(AtomicBool::new(false));
        {
            let gate = gate.clone();
            queue
                .submit(TaskSpec::new("blocker", Priority::Critical), move |_| {
                    let gate = gate.clone();
                    async move {
                        while !gate.load(Ordering::SeqCst) {
                            tokio::time::sleep(Duration::from_millis(5)).await;
                        }
                        Ok(())
                    }
                })
                .await
                .unwrap();
        }

        queue.start();

        for (name, prio) in [
            ("background", Priority::Background),
            ("normal", Priority::Normal),
            ("critical", Priority::Critical),
            ("low", Priority::Low),
            ("high", Priority::High),
        ] {
            let order = order.clone();
            queue
                .submit(TaskSpec::new(name, prio), move |_| {
                    let order = order.clone();
                    async move {
                        order.lock().push(name);
                        Ok(())
                    }
                })
                .await
                .unwrap();
        }

        gate.store(true, Ordering::SeqCst);
        assert!(wait_until(|| order.lock().len() == 5, Duration::from_secs(5)).await);

        let observed = order.lock().clone();
        assert_eq!(observed, vec!["critical", "high", "normal", "low", "background"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn retry_with_backoff_then_success() {
        let queue = TaskQueue::new(1, 100);
        queue.start();

        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_c = attempts.clone();
        queue
            .submit(
                TaskSpec::new("flaky", Priority::Normal).with_max_retries(3),
                move |_| {
                    let attempts = attempts_c.clone();
                    async move {
                        let n = attempts.fetch_add(1, Ordering::SeqCst);
                        if n < 2 {
                            anyhow::bail!("transient failure {n}");
                        }
                        Ok(())
                    }
                },
            )
            .await
            .unwrap();

        assert!(
            wait_until(
                || queue.stats().completed == 1,
                Duration::from_secs(5)
            )
            .await
        );
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(queue.stats().retried, 2);
        assert_eq!(queue.stats().failed, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timeout_exhausts_retries_and_fails() {
        let queue = TaskQueue::new(1, 100);
        queue.start();

        queue
            .submit(
                TaskSpec::new("hangs", Priority::Normal)
                    .with_timeout(Duration::from_millis(20))
                    .with_max_retries(1),
                |_| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                },
            )
            .await
            .unwrap();

        assert!(wait_until(|| queue.stats().failed == 1, Duration::from_secs(5)).await);
        assert_eq!(queue.stats().retried, 1);
        assert_eq!(queue.stats().completed, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn backpressure_sheds_background_first() {
        // One worker, capacity 2, and the worker is kept busy.
        let queue = TaskQueue::new(1, 2);
        queue.start();

        let gate = Arc::new(AtomicBool::new(false));
        for i in 0..3 {
            let gate = gate.clone();
            let spec = TaskSpec::new(format!("busy-{i}"), Priority::Normal);
            queue
                .submit(spec, move |_| {
                    let gate = gate.clone();
                    async move {
                        while !gate.load(Ordering::SeqCst) {
                            tokio::time::sleep(Duration::from_millis(5)).await;
                        }
                        Ok(())
                    }
                })
                .await
                .unwrap();
        }

        // Queue is over capacity: background submissions shed immediately.
        let shed = queue
            .submit(TaskSpec::new("bg", Priority::Background), |_| async { Ok(()) })
            .await;
        assert_eq!(shed.unwrap_err(), SubmitError::Shed);
        assert_eq!(queue.stats().shed, 1);

        // A critical submission blocks the submitter until capacity frees.
        // Release the busy tasks shortly after the submit starts waiting.
        {
            let gate = gate.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                gate.store(true, Ordering::SeqCst);
            });
        }

        let started = tokio::time::Instant::now();
        let ok = queue
            .submit(TaskSpec::new("crit", Priority::Critical), |_| async { Ok(()) })
            .await;
        let waited = started.elapsed();

        assert!(ok.is_ok());
        assert!(
            waited >= Duration::from_millis(80),
            "critical submit must block until a slot frees, waited {waited:?}"
        );
        assert!(waited < CRITICAL_BLOCK_MAX, "capacity freed before the cap");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocked_critical_is_accepted_after_the_cap() {
        // No workers running: capacity never frees, so the critical
        // submission waits out the full block window and is then accepted
        // anyway rather than lost.
        let queue = TaskQueue::new(1, 1);
        queue
            .submit(TaskSpec::new("occupant", Priority::Normal), |_| async { Ok(()) })
            .await
            .unwrap();

        let started = tokio::time::Instant::now();
        let ok = queue
            .submit(TaskSpec::new("crit", Priority::Critical), |_| async { Ok(()) })
            .await;

        assert!(ok.is_ok());
        assert!(started.elapsed() >= CRITICAL_BLOCK_MAX);
        assert_eq!(queue.stats().pending, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_task_is_skipped() {
        let queue = TaskQueue::new(1, 100);

        let ran = Arc::new(AtomicBool::new(false));
        let ran_c = ran.clone();
        let token = queue
            .submit(TaskSpec::new("cancel-me", Priority::Normal), move |_| {
                let ran = ran_c.clone();
                async move {
                    ran.store(true, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();

        // Cancel before the workers ever start.
        token.cancel();
        queue.start();

        assert!(wait_until(|| queue.stats().cancelled == 1, Duration::from_secs(5)).await);
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reserved_worker_prefers_background() {
        let queue = TaskQueue::new(4, 100);

        // Without starting workers, drive pop() directly.
        queue
            .submit(TaskSpec::new("crit", Priority::Critical), |_| async { Ok(()) })
            .await
            .unwrap();
        queue
            .submit(TaskSpec::new("bg", Priority::Background), |_| async { Ok(()) })
            .await
            .unwrap();

        let picked = queue.pop(true).unwrap();
        assert_eq!(picked.spec.priority, Priority::Background);

        let picked = queue.pop(false).unwrap();
        assert_eq!(picked.spec.priority, Priority::Critical);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_cancels_low_and_drains_high() {
        let queue = TaskQueue::new(1, 100);

        // Blocker occupies the single worker so everything behind it stays
        // queued until shutdown has classified it.
        let gate = Arc::new(AtomicBool::new(false));
        {
            let gate = gate.clone();
            queue
                .submit(
                    TaskSpec::new("blocker", Priority::High)
                        .with_timeout(Duration::from_secs(10)),
                    move |_| {
                        let gate = gate.clone();
                        async move {
                            while !gate.load(Ordering::SeqCst) {
                                tokio::time::sleep(Duration::from_millis(5)).await;
                            }
                            Ok(())
                        }
                    },
                )
                .await
                .unwrap();
        }

        queue
            .submit(TaskSpec::new("bg", Priority::Background), |_| async { Ok(()) })
            .await
            .unwrap();
        queue
            .submit(TaskSpec::new("low", Priority::Low), |_| async { Ok(()) })
            .await
            .unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let done_c = done.clone();
        queue
            .submit(TaskSpec::new("high", Priority::High), move |_| {
                let done = done_c.clone();
                async move {
                    done.store(true, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();

        queue.start();
        // Let the worker pick up the blocker, then release it shortly after
        // shutdown begins.
        tokio::time::sleep(Duration::from_millis(50)).await;
        {
            let gate = gate.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                gate.store(true, Ordering::SeqCst);
            });
        }

        queue.shutdown(Duration::from_secs(5)).await;

        assert!(done.load(Ordering::SeqCst), "high task must drain");
        assert_eq!(queue.stats().cancelled, 2);

        // New non-critical submissions are refused after shutdown.
        let err = queue
            .submit(TaskSpec::new("late", Priority::Normal), |_| async { Ok(()) })
            .await;
        assert_eq!(err.unwrap_err(), SubmitError::ShuttingDown);
    }
}

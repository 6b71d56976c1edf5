//! Queue dispatcher — admission control, membership tracking, and drain signaling.
//!
//! This module provides [`Queue`], which accepts work via [`Queue::submit`],
//! wraps it in a [`Task`], and runs at most `concurrency_limit` work functions
//! at once. Failed tasks with budget left re-enter the backlog after their
//! backoff delay; everything else is observable through the queue's event
//! stream.
//!
//! ## Core types
//!
//! - [`Queue`] — the dispatcher handle; submit work, subscribe to events.
//! - [`QueueConfig`] — concurrency limit, label, timing windows, backoff policy.
//! - [`QueueEvent`] — per-task transitions plus `Started`/`Drained` cycle signals.
//! - [`QueueStats`] — snapshot of the backlog / active / waiting membership sizes.
//!
//! ## Dispatch model
//!
//! All queue state is owned by a single spawned dispatcher task and mutated
//! only while processing one message at a time, run to completion. Tasks,
//! backoff timers, the drain check, and the detach grace timer all communicate
//! with it by sending messages into the same channel, so no transition ever
//! interleaves with another.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

use crate::backoff::BackoffPolicy;
use crate::task::{Task, TaskHandle, TaskOptions, TaskStatus, WorkFn};

/// No fewer than 1 concurrent task; lower configured limits are clamped up.
const CONCURRENT_MIN: usize = 1;

/// Default quiescence window: how long `active_count` must stay at zero before
/// the queue believes it has drained (15 ms).
const DRAIN_WINDOW_MS: u64 = 15;

/// Default grace period before the queue releases its reference to a finished
/// task (500 ms), leaving consumers time to observe the final notification.
const DETACH_GRACE_MS: u64 = 500;

/// Display name for queues constructed without a label.
const DEFAULT_QUEUE_LABEL: &str = "queue";

/// Queue event broadcast buffer.
const QUEUE_EVENT_CAPACITY: usize = 256;

/// Construction-time configuration for a [`Queue`].
///
/// Every timing constant the queue relies on lives here so tests and unusual
/// deployments can override them; the defaults match ordinary use.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of work functions in flight at once. Values below 1 are
    /// clamped up, never rejected.
    pub concurrency_limit: usize,
    /// Label used in logs, `Display`, and generated task labels. Optional.
    pub label: String,
    /// How long the queue must stay idle before it signals `Drained`.
    pub drain_window: Duration,
    /// How long a finished task stays referenced by the queue after its final
    /// notification.
    pub detach_grace: Duration,
    /// Backoff policy applied to every task submitted to this queue.
    pub backoff: BackoffPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: CONCURRENT_MIN,
            label: String::new(),
            drain_window: Duration::from_millis(DRAIN_WINDOW_MS),
            detach_grace: Duration::from_millis(DETACH_GRACE_MS),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Snapshot of the queue's membership sizes.
///
/// Mirrors the dispatcher's view and is updated as it processes notifications,
/// so a snapshot taken immediately after `submit` may not yet include the new
/// task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Tasks eligible for dispatch but not yet executing.
    pub backlog: usize,
    /// Tasks currently holding a concurrency slot.
    pub active: usize,
    /// Tasks serving out a backoff delay.
    pub waiting: usize,
}

impl QueueStats {
    /// Total number of live tasks registered with the queue.
    pub fn len(&self) -> usize {
        self.backlog + self.active + self.waiting
    }

    /// Returns `true` when no live task is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An event on the queue's broadcast stream.
pub enum QueueEvent<T, E> {
    /// An idle queue admitted work: a new busy cycle began.
    Started,
    /// A task reported the given status transition.
    Task {
        /// Handle to the reporting task.
        task: TaskHandle<T, E>,
        /// The status it just transitioned to.
        status: TaskStatus,
    },
    /// The queue stayed idle for a full drain window. Emitted once per cycle.
    Drained,
}

impl<T, E> Clone for QueueEvent<T, E> {
    fn clone(&self) -> Self {
        match self {
            Self::Started => Self::Started,
            Self::Drained => Self::Drained,
            Self::Task { task, status } => Self::Task {
                task: Arc::clone(task),
                status: *status,
            },
        }
    }
}

impl<T, E> fmt::Debug for QueueEvent<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started => f.write_str("Started"),
            Self::Drained => f.write_str("Drained"),
            Self::Task { task, status } => f
                .debug_struct("Task")
                .field("task", &task.label())
                .field("status", status)
                .finish(),
        }
    }
}

// Everything the dispatcher reacts to arrives as one of these messages.
pub(crate) enum QueueMsg<T, E> {
    // A task reported a status transition.
    Notify {
        task: TaskHandle<T, E>,
        status: TaskStatus,
    },
    // The drain window elapsed for the given idle cycle.
    DrainCheck { epoch: u64 },
    // The detach grace period elapsed for a finished task.
    Detach { id: u64 },
}

// Membership sizes mirrored out of the dispatcher for lock-free reads.
#[derive(Default)]
struct Sizes {
    backlog: AtomicUsize,
    active: AtomicUsize,
    waiting: AtomicUsize,
}

/// An in-process task queue with bounded concurrency and automatic retries.
///
/// A `Queue` is long-lived: it has no terminal state, oscillates between busy
/// and drained, and accepts submissions indefinitely. Work-function failures
/// never escape it — they only change the failing task's own status.
///
/// # Examples
///
/// ```rust,no_run
/// use requeue::{Queue, QueueConfig, TaskOptions, TaskStatus};
///
/// #[tokio::main]
/// async fn main() {
///     let queue = Queue::with_config(QueueConfig {
///         concurrency_limit: 4,
///         ..QueueConfig::default()
///     });
///     let task = queue.submit(
///         |url: String| async move { fetch(url).await },
///         "https://example.com".to_string(),
///         TaskOptions { retries: 3, ..TaskOptions::default() },
///     );
///     assert_eq!(task.wait().await, TaskStatus::Success);
/// }
/// # async fn fetch(_url: String) -> Result<String, String> { Ok(String::new()) }
/// ```
pub struct Queue<T, E> {
    tx: mpsc::UnboundedSender<QueueMsg<T, E>>,
    events: broadcast::Sender<QueueEvent<T, E>>,
    sizes: Arc<Sizes>,
    limit: usize,
    label: String,
    backoff: BackoffPolicy,
    seq: AtomicU64,
}

impl<T, E> Queue<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Creates a queue with the default configuration (serial execution).
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime; the dispatcher is spawned here.
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    /// Creates a queue with the given configuration.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime; the dispatcher is spawned here.
    pub fn with_config(config: QueueConfig) -> Self {
        let limit = config.concurrency_limit.max(CONCURRENT_MIN);
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(QUEUE_EVENT_CAPACITY);
        let sizes = Arc::new(Sizes::default());
        let name = if config.label.is_empty() {
            DEFAULT_QUEUE_LABEL.to_string()
        } else {
            config.label.clone()
        };

        let dispatcher = Dispatcher {
            backlog: VecDeque::new(),
            active: HashMap::new(),
            waiting: HashMap::new(),
            detaching: HashMap::new(),
            active_count: 0,
            limit,
            drain_window: config.drain_window,
            detach_grace: config.detach_grace,
            idle_epoch: 0,
            drained_emitted: false,
            events: events.clone(),
            sizes: Arc::clone(&sizes),
            tx: tx.downgrade(),
            name,
        };
        tokio::spawn(dispatcher.run(rx));

        Self {
            tx,
            events,
            sizes,
            limit,
            label: config.label,
            backoff: config.backoff,
            seq: AtomicU64::new(0),
        }
    }

    /// Submits one unit of work and returns a handle to its task.
    ///
    /// The work function is invoked once per execution attempt with a clone of
    /// `params`. The task starts with `options.retries` budget (default 0: a
    /// first failure is final) and the label from `options`, falling back to a
    /// sequence-numbered default prefixed with the queue label when one is set.
    ///
    /// Submission itself cannot fail; the outcome is observed through the
    /// returned handle or the queue's event stream.
    pub fn submit<P, F, Fut>(&self, work: F, params: P, options: TaskOptions) -> TaskHandle<T, E>
    where
        P: Clone + Send + Sync + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let label = options.label.unwrap_or_else(|| self.sequence_label(seq));
        let work: WorkFn<T, E> = Box::new(move || Box::pin(work(params.clone())));
        let task = Task::new(
            seq,
            label,
            work,
            options.retries,
            self.backoff.clone(),
            self.tx.clone(),
        );
        debug!(queue = %self, task = %task, retries = options.retries, "task submitted");
        task.mark_added();
        task
    }

    /// Total number of live tasks: `|backlog| + |active| + |waiting|`.
    pub fn len(&self) -> usize {
        self.stats().len()
    }

    /// Returns `true` when no live task is registered with the queue.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the membership sizes.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            backlog: self.sizes.backlog.load(Ordering::Relaxed),
            active: self.sizes.active.load(Ordering::Relaxed),
            waiting: self.sizes.waiting.load(Ordering::Relaxed),
        }
    }

    /// The effective concurrency limit after clamping.
    pub fn concurrency_limit(&self) -> usize {
        self.limit
    }

    /// Subscribes to the queue's event stream.
    ///
    /// The stream mirrors every task transition the dispatcher processes as
    /// [`QueueEvent::Task`], frames each busy cycle with [`QueueEvent::Started`]
    /// and [`QueueEvent::Drained`], and stays open for the life of the queue.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent<T, E>> {
        self.events.subscribe()
    }

    /// Resolves at the next `Drained` signal.
    ///
    /// Subscribes on entry, so a drain that completed before the call is not
    /// observed — this waits for the *next* quiescence cycle to end.
    pub async fn drained(&self) {
        let mut events = self.subscribe();
        loop {
            match events.recv().await {
                Ok(QueueEvent::Drained) => return,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    fn sequence_label(&self, seq: u64) -> String {
        if self.label.is_empty() {
            format!("task-{seq}")
        } else {
            format!("{}-{seq}", self.label)
        }
    }
}

impl<T, E> Default for Queue<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> fmt::Display for Queue<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.label.is_empty() {
            f.write_str(DEFAULT_QUEUE_LABEL)
        } else {
            f.write_str(&self.label)
        }
    }
}

// The dispatcher: exclusive owner of the membership sets and slot counter.
struct Dispatcher<T, E> {
    // FIFO of tasks eligible to run, in submission / re-entry order.
    backlog: VecDeque<TaskHandle<T, E>>,
    // Tasks currently holding a concurrency slot, by task id.
    active: HashMap<u64, TaskHandle<T, E>>,
    // Failed tasks serving out their backoff delay, by task id.
    waiting: HashMap<u64, TaskHandle<T, E>>,
    // Finished tasks kept reachable until their grace period elapses.
    detaching: HashMap<u64, TaskHandle<T, E>>,
    // Occupied slots. Counts admitted tasks from admission until their outcome
    // notification is processed, so it can briefly exceed `active.len()`.
    active_count: usize,
    limit: usize,
    drain_window: Duration,
    detach_grace: Duration,
    // Bumped whenever the queue leaves idle; stale drain checks compare unequal.
    idle_epoch: u64,
    drained_emitted: bool,
    events: broadcast::Sender<QueueEvent<T, E>>,
    sizes: Arc<Sizes>,
    // Weak: timer clones alone must not keep the message channel open.
    tx: mpsc::WeakUnboundedSender<QueueMsg<T, E>>,
    name: String,
}

impl<T, E> Dispatcher<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<QueueMsg<T, E>>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                QueueMsg::Notify { task, status } => self.on_notify(task, status),
                QueueMsg::DrainCheck { epoch } => self.on_drain_check(epoch),
                QueueMsg::Detach { id } => {
                    self.detaching.remove(&id);
                }
            }
        }
        trace!(queue = %self.name, "dispatcher stopped");
    }

    // The reaction table: membership and slot accounting per reported status.
    fn on_notify(&mut self, task: TaskHandle<T, E>, status: TaskStatus) {
        match status {
            TaskStatus::Added => {
                self.backlog.push_back(Arc::clone(&task));
            }
            TaskStatus::Running => {
                self.remove_from_backlog(task.id());
                self.active.insert(task.id(), Arc::clone(&task));
            }
            TaskStatus::Ready => {
                self.waiting.remove(&task.id());
                self.backlog.push_back(Arc::clone(&task));
            }
            TaskStatus::Retry => {
                self.release_slot(task.id());
                self.waiting.insert(task.id(), Arc::clone(&task));
            }
            TaskStatus::Failed | TaskStatus::Success => {
                self.release_slot(task.id());
                self.schedule_detach(&task);
            }
            // Tasks are born New and never report it.
            TaskStatus::New => {}
        }
        self.sync_sizes();
        let _ = self.events.send(QueueEvent::Task { task, status });
        self.dispatch();
    }

    // Admits eligible backlog tasks, oldest first, until capacity is exhausted.
    fn dispatch(&mut self) {
        while self.active_count < self.limit {
            let Some(task) = self.next_eligible() else {
                break;
            };
            if self.active_count == 0 {
                self.begin_cycle();
            }
            self.active_count += 1;
            debug!(queue = %self.name, task = %task, "task admitted");
            // Transitions to Running synchronously; the notification moves it
            // out of the backlog before the next message is processed.
            task.run();
        }
    }

    fn next_eligible(&self) -> Option<TaskHandle<T, E>> {
        self.backlog
            .iter()
            .find(|task| matches!(task.status(), TaskStatus::Added | TaskStatus::Ready))
            .map(Arc::clone)
    }

    fn begin_cycle(&mut self) {
        self.idle_epoch += 1;
        self.drained_emitted = false;
        let _ = self.events.send(QueueEvent::Started);
    }

    fn release_slot(&mut self, id: u64) {
        self.active.remove(&id);
        self.active_count = self.active_count.saturating_sub(1);
        if self.active_count == 0 {
            self.schedule_drain_check();
        }
    }

    // Two-step drain: believe the queue is empty only if it still is a full
    // window later. Admissions in between bump the epoch and void the check.
    fn schedule_drain_check(&self) {
        let Some(tx) = self.tx.upgrade() else { return };
        let epoch = self.idle_epoch;
        let window = self.drain_window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let _ = tx.send(QueueMsg::DrainCheck { epoch });
        });
    }

    fn on_drain_check(&mut self, epoch: u64) {
        if epoch == self.idle_epoch && self.active_count == 0 && !self.drained_emitted {
            self.drained_emitted = true;
            debug!(queue = %self.name, "queue drained");
            let _ = self.events.send(QueueEvent::Drained);
        }
    }

    fn schedule_detach(&mut self, task: &TaskHandle<T, E>) {
        let id = task.id();
        let Some(tx) = self.tx.upgrade() else { return };
        self.detaching.insert(id, Arc::clone(task));
        let grace = self.detach_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = tx.send(QueueMsg::Detach { id });
        });
    }

    fn remove_from_backlog(&mut self, id: u64) {
        if let Some(pos) = self.backlog.iter().position(|task| task.id() == id) {
            self.backlog.remove(pos);
        }
    }

    fn sync_sizes(&self) {
        self.sizes.backlog.store(self.backlog.len(), Ordering::Relaxed);
        self.sizes.active.store(self.active.len(), Ordering::Relaxed);
        self.sizes.waiting.store(self.waiting.len(), Ordering::Relaxed);
        trace!(
            queue = %self.name,
            backlog = self.backlog.len(),
            active = self.active.len(),
            waiting = self.waiting.len(),
            "queue status"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicU32;

    use thiserror::Error;
    use tokio::time::Instant;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
    #[error("work failed: {0}")]
    struct WorkError(&'static str);

    /// Deterministic sub-second backoff so retries elapse on the paused clock
    /// while still dwarfing the 15 ms drain window.
    fn test_config() -> QueueConfig {
        QueueConfig {
            backoff: BackoffPolicy {
                base: Duration::from_millis(100),
                cap: Duration::from_millis(400),
                max_jitter: Duration::ZERO,
            },
            ..QueueConfig::default()
        }
    }

    fn submit_ok(queue: &Queue<String, WorkError>, label: &str) -> TaskHandle<String, WorkError> {
        queue.submit(
            |_: ()| async { Ok::<_, WorkError>("done".to_string()) },
            (),
            TaskOptions {
                label: Some(label.to_string()),
                ..TaskOptions::default()
            },
        )
    }

    /// Work that fails `failures` times, then succeeds. Returns the call counter.
    fn flaky_submit(
        queue: &Queue<String, WorkError>,
        label: &str,
        failures: u32,
        retries: u32,
    ) -> (TaskHandle<String, WorkError>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let task = queue.submit(
            move |_: ()| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < failures {
                        Err(WorkError("mostly does not work"))
                    } else {
                        Ok("sometimes it works".to_string())
                    }
                }
            },
            (),
            TaskOptions {
                retries,
                label: Some(label.to_string()),
                ..TaskOptions::default()
            },
        );
        (task, calls)
    }

    // ── Concurrency bound ─────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn burst_completes_within_the_concurrency_bound() {
        let queue = Queue::with_config(QueueConfig {
            concurrency_limit: 3,
            ..test_config()
        });
        let mut events = queue.subscribe();

        let tasks: Vec<_> = (1..=5)
            .map(|n| {
                queue.submit(
                    |params: Vec<String>| async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Ok::<_, WorkError>(params.join(" "))
                    },
                    vec!["hello".to_string(), "world".to_string(), format!("({n})")],
                    TaskOptions::default(),
                )
            })
            .collect();

        let mut running = 0usize;
        let mut max_running = 0usize;
        let mut done = 0usize;
        while done < 5 {
            match events.recv().await.unwrap() {
                QueueEvent::Task {
                    status: TaskStatus::Running,
                    ..
                } => {
                    running += 1;
                    max_running = max_running.max(running);
                }
                QueueEvent::Task {
                    status: TaskStatus::Success,
                    ..
                } => {
                    running -= 1;
                    done += 1;
                }
                QueueEvent::Task {
                    status: TaskStatus::Failed,
                    task,
                } => panic!("task {} failed unexpectedly", task.label()),
                _ => {}
            }
        }
        assert_eq!(max_running, 3, "all three slots should fill, never more");

        for (i, task) in tasks.iter().enumerate() {
            assert_eq!(task.status(), TaskStatus::Success);
            assert_eq!(task.result(), Some(format!("hello world ({})", i + 1)));
        }

        queue.drained().await;
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn serial_queue_runs_one_at_a_time_in_submission_order() {
        let queue = Queue::with_config(test_config());
        assert_eq!(queue.concurrency_limit(), 1);
        let mut events = queue.subscribe();

        submit_ok(&queue, "a");
        submit_ok(&queue, "b");
        submit_ok(&queue, "c");

        let mut running = 0usize;
        let mut completions = Vec::new();
        while completions.len() < 3 {
            match events.recv().await.unwrap() {
                QueueEvent::Task {
                    status: TaskStatus::Running,
                    ..
                } => {
                    running += 1;
                    assert_eq!(running, 1, "serial queue must never overlap tasks");
                }
                QueueEvent::Task {
                    status: TaskStatus::Success,
                    task,
                } => {
                    running -= 1;
                    completions.push(task.label().to_string());
                }
                _ => {}
            }
        }
        assert_eq!(completions, ["a", "b", "c"]);
    }

    // ── Retry semantics ───────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn flaky_task_traces_retry_cycles_to_success() {
        let queue = Queue::with_config(test_config());
        let mut events = queue.subscribe();
        let (task, calls) = flaky_submit(&queue, "flaky", 2, 3);

        let mut trace = Vec::new();
        loop {
            if let QueueEvent::Task { status, .. } = events.recv().await.unwrap() {
                trace.push(status);
                if status.is_terminal() {
                    break;
                }
            }
        }

        use TaskStatus::*;
        assert_eq!(
            trace,
            vec![Added, Running, Retry, Ready, Running, Retry, Ready, Running, Success]
        );
        assert_eq!(task.retries_remaining(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(task.error().is_none(), "success clears the captured error");
        assert_eq!(task.result(), Some("sometimes it works".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_is_conserved() {
        let queue = Queue::with_config(test_config());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let task = queue.submit(
            move |_: ()| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<String, _>(WorkError("never works"))
                }
            },
            (),
            TaskOptions {
                retries: 2,
                ..TaskOptions::default()
            },
        );

        assert_eq!(task.wait().await, TaskStatus::Failed);
        assert_eq!(task.retries_remaining(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 3, "R retries mean R+1 executions");
        assert_eq!(task.error(), Some(WorkError("never works")));
    }

    #[tokio::test]
    async fn failure_without_retries_is_contained() {
        let queue = Queue::with_config(test_config());
        let task = queue.submit(
            |_: ()| async { Err::<String, _>(WorkError("bad")) },
            (),
            TaskOptions::default(),
        );

        assert_eq!(task.wait().await, TaskStatus::Failed);
        assert_eq!(task.error(), Some(WorkError("bad")));
        assert!(task.result().is_none());
        assert_eq!(task.delay(), Duration::ZERO, "no retry was scheduled");
    }

    #[tokio::test(start_paused = true)]
    async fn retried_task_reenters_behind_later_submissions() {
        let queue = Queue::with_config(test_config());
        let mut events = queue.subscribe();

        let (flaky, _) = flaky_submit(&queue, "flaky", 1, 1);
        submit_ok(&queue, "b");
        submit_ok(&queue, "c");

        let mut completions = Vec::new();
        while completions.len() < 3 {
            if let QueueEvent::Task {
                status: TaskStatus::Success,
                task,
            } = events.recv().await.unwrap()
            {
                completions.push(task.label().to_string());
            }
        }
        // Eligible-FIFO: the retried task waits out its backoff and re-queues
        // behind work submitted after it.
        assert_eq!(completions, ["b", "c", "flaky"]);
        assert_eq!(flaky.status(), TaskStatus::Success);
    }

    // ── Drain signaling ───────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn drained_fires_once_one_window_after_the_last_terminal() {
        let queue = Queue::with_config(test_config());
        let mut events = queue.subscribe();
        submit_ok(&queue, "only");

        let mut finished_at = None;
        loop {
            match events.recv().await.unwrap() {
                QueueEvent::Task {
                    status: TaskStatus::Success,
                    ..
                } => finished_at = Some(Instant::now()),
                QueueEvent::Drained => break,
                _ => {}
            }
        }
        let elapsed = finished_at.expect("success must precede drained").elapsed();
        assert!(elapsed >= Duration::from_millis(DRAIN_WINDOW_MS));
        assert!(elapsed < Duration::from_millis(100));

        // Nothing else happens: one signal per quiescence cycle.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn submission_inside_the_window_suppresses_the_drain() {
        let queue = Queue::with_config(test_config());
        let mut events = queue.subscribe();

        submit_ok(&queue, "first");
        loop {
            if let QueueEvent::Task {
                status: TaskStatus::Success,
                ..
            } = events.recv().await.unwrap()
            {
                break;
            }
        }

        // Inside the drain window: this admission voids the pending check.
        submit_ok(&queue, "second");

        let mut second_done = false;
        loop {
            match events.recv().await.unwrap() {
                QueueEvent::Task {
                    status: TaskStatus::Success,
                    task,
                } => {
                    assert_eq!(task.label(), "second");
                    second_done = true;
                }
                QueueEvent::Drained => break,
                _ => {}
            }
        }
        assert!(second_done, "the drain must wait for the late submission");
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_wait_ends_one_cycle_and_reentry_starts_another() {
        let queue = Queue::with_config(test_config());
        let mut events = queue.subscribe();

        let (flaky, _) = flaky_submit(&queue, "flaky", 1, 1);

        // Cycle 1 ends while the task is still serving its backoff delay:
        // occupancy is the sole drain criterion.
        let mut log = Vec::new();
        let mut drains = 0usize;
        while drains < 2 {
            match events.recv().await.unwrap() {
                QueueEvent::Drained => {
                    drains += 1;
                    log.push("drained".to_string());
                }
                QueueEvent::Started => log.push("started".to_string()),
                QueueEvent::Task { status, .. } => log.push(format!("{status:?}")),
            }
        }

        assert_eq!(
            log,
            vec![
                "Added", "started", "Running", "Retry", "drained", "Ready", "started", "Running",
                "Success", "drained"
            ]
        );
        assert_eq!(flaky.status(), TaskStatus::Success);
        assert_eq!(queue.stats().waiting, 0);
    }

    // ── Options, labels, sizes ────────────────────────────────────────────────

    #[tokio::test]
    async fn zero_concurrency_limit_is_clamped_up() {
        let queue: Queue<String, WorkError> = Queue::with_config(QueueConfig {
            concurrency_limit: 0,
            ..QueueConfig::default()
        });
        assert_eq!(queue.concurrency_limit(), 1);
    }

    #[tokio::test]
    async fn labels_prefer_the_caller_then_the_sequence() {
        let queue = Queue::with_config(QueueConfig {
            label: "jobs".to_string(),
            ..test_config()
        });
        let custom = submit_ok(&queue, "custom");
        let generated = queue.submit(
            |_: ()| async { Ok::<_, WorkError>("done".to_string()) },
            (),
            TaskOptions::default(),
        );
        assert_eq!(custom.label(), "custom");
        assert_eq!(generated.label(), "jobs-2");
        assert_eq!(queue.to_string(), "jobs");
    }

    #[tokio::test]
    async fn unlabeled_queue_uses_the_default_display_and_plain_sequence() {
        let queue: Queue<String, WorkError> = Queue::with_config(test_config());
        assert_eq!(queue.to_string(), DEFAULT_QUEUE_LABEL);
        let task = queue.submit(
            |_: ()| async { Ok::<_, WorkError>("done".to_string()) },
            (),
            TaskOptions::default(),
        );
        assert_eq!(task.label(), "task-1");
    }

    #[tokio::test(start_paused = true)]
    async fn stats_track_the_membership_sets() {
        let queue = Queue::with_config(test_config());
        let mut events = queue.subscribe();

        queue.submit(
            |_: ()| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, WorkError>("slow".to_string())
            },
            (),
            TaskOptions::default(),
        );
        submit_ok(&queue, "queued");

        // Wait until the first task occupies the only slot.
        loop {
            if let QueueEvent::Task {
                status: TaskStatus::Running,
                ..
            } = events.recv().await.unwrap()
            {
                break;
            }
        }
        let stats = queue.stats();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.backlog, 1);
        assert_eq!(stats.waiting, 0);
        assert_eq!(queue.len(), 2);

        queue.drained().await;
        assert!(queue.is_empty());
    }

    // ── Detach grace ──────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn finished_task_is_released_only_after_the_grace_period() {
        let queue = Queue::with_config(test_config());
        let task = submit_ok(&queue, "ephemeral");
        assert_eq!(task.wait().await, TaskStatus::Success);

        let weak = Arc::downgrade(&task);
        drop(task);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(
            weak.upgrade().is_some(),
            "the queue retains a finished task through the grace period"
        );

        tokio::time::sleep(Duration::from_millis(DETACH_GRACE_MS)).await;
        assert!(weak.upgrade().is_none(), "detach released the last reference");
    }
}

//! Task state machine — one unit of retryable asynchronous work.
//!
//! A [`Task`] owns an opaque work function, a retry budget, and a status that
//! moves through a fixed transition table. Every transition is published on the
//! task's own broadcast stream ([`Task::subscribe`]) and reported to the owning
//! queue, which reacts by moving the task between its membership sets.
//!
//! Tasks are created by [`Queue::submit`](crate::queue::Queue::submit); the
//! returned [`TaskHandle`] is the caller's window into the outcome.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

use crate::backoff::BackoffPolicy;
use crate::queue::QueueMsg;

/// Per-task broadcast buffer. A lagging subscriber misses intermediate statuses,
/// never the ability to observe the current state (see [`Task::wait`]).
const TASK_EVENT_CAPACITY: usize = 32;

/// The status of a [`Task`].
///
/// `Success` and `Failed` are terminal: no transition leaves them, and a
/// terminal task never re-executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created but not yet submitted to a queue. Never reported to observers.
    New,
    /// Accepted by a queue and sitting in its backlog.
    Added,
    /// The work function is in flight.
    Running,
    /// The work function failed with budget remaining; a backoff delay is pending.
    Retry,
    /// The backoff delay elapsed; eligible for re-dispatch.
    Ready,
    /// The work function failed with no budget remaining. Terminal.
    Failed,
    /// The work function completed. Terminal.
    Success,
}

impl TaskStatus {
    /// Returns `true` for `Success` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Success)
    }

    // The transition table. Transitions not listed here are rejected as no-ops.
    fn permits(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (New, Added)
                | (Added, Running)
                | (Ready, Running)
                | (Running, Success)
                | (Running, Retry)
                | (Running, Failed)
                | (Retry, Ready)
        )
    }
}

/// Per-submission options for [`Queue::submit`](crate::queue::Queue::submit).
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// How many times a failing task is re-executed before going `Failed`.
    pub retries: u32,
    /// Label for the task; a sequence-numbered default is generated when absent.
    pub label: Option<String>,
}

/// Type-erased, heap-allocated work function.
///
/// Each invocation produces one attempt's future; the queue invokes it once per
/// execution, so the params captured at submit time are cloned per attempt.
pub(crate) type WorkFn<T, E> =
    Box<dyn Fn() -> Pin<Box<dyn Future<Output = Result<T, E>> + Send>> + Send + Sync>;

/// Shared handle to a [`Task`], returned by `submit` and carried in queue events.
pub type TaskHandle<T, E> = Arc<Task<T, E>>;

// Mutable task state, owned by the task and touched only from its own methods.
struct TaskState<T, E> {
    status: TaskStatus,
    retries_remaining: u32,
    backoff_attempt: u32,
    delay: Duration,
    result: Option<T>,
    error: Option<E>,
}

/// One unit of retryable asynchronous work.
///
/// All accessors are snapshots: the task may transition again immediately after
/// a read. Subscribe with [`Task::subscribe`] or await [`Task::wait`] to follow
/// the lifecycle instead of polling.
pub struct Task<T, E> {
    id: u64,
    label: String,
    work: WorkFn<T, E>,
    backoff: BackoffPolicy,
    state: Mutex<TaskState<T, E>>,
    events: broadcast::Sender<TaskStatus>,
    queue_tx: mpsc::UnboundedSender<QueueMsg<T, E>>,
    // Handle to self for queue notifications and the backoff timer. Upgrading
    // only fails during teardown, once every strong reference is gone.
    weak: Weak<Self>,
}

impl<T, E> Task<T, E> {
    /// Returns the task's label.
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl<T, E> Task<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub(crate) fn new(
        id: u64,
        label: String,
        work: WorkFn<T, E>,
        retries: u32,
        backoff: BackoffPolicy,
        queue_tx: mpsc::UnboundedSender<QueueMsg<T, E>>,
    ) -> TaskHandle<T, E> {
        let (events, _) = broadcast::channel(TASK_EVENT_CAPACITY);
        Arc::new_cyclic(|weak| Self {
            id,
            label,
            work,
            backoff,
            queue_tx,
            events,
            weak: weak.clone(),
            state: Mutex::new(TaskState {
                status: TaskStatus::New,
                retries_remaining: retries,
                backoff_attempt: 0,
                delay: Duration::ZERO,
                result: None,
                error: None,
            }),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Returns the current status.
    pub fn status(&self) -> TaskStatus {
        self.state().status
    }

    /// Returns `true` once the task reached `Success` or `Failed`.
    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Returns the remaining retry budget.
    pub fn retries_remaining(&self) -> u32 {
        self.state().retries_remaining
    }

    /// Returns the most recently computed backoff delay (zero before any retry).
    pub fn delay(&self) -> Duration {
        self.state().delay
    }

    /// Returns a clone of the success value, once the task has succeeded.
    pub fn result(&self) -> Option<T>
    where
        T: Clone,
    {
        self.state().result.clone()
    }

    /// Returns a clone of the last captured failure. Cleared on success.
    pub fn error(&self) -> Option<E>
    where
        E: Clone,
    {
        self.state().error.clone()
    }

    /// Subscribes to this task's status stream.
    ///
    /// Each transition is sent in order. The stream stays open for the life of
    /// the task, so a receiver sees the terminal status and nothing after it.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskStatus> {
        self.events.subscribe()
    }

    /// Resolves once the task is terminal, returning the final status.
    ///
    /// Inspect [`result`](Self::result) and [`error`](Self::error) afterwards
    /// for the outcome itself.
    pub async fn wait(&self) -> TaskStatus {
        let mut events = self.events.subscribe();
        loop {
            let status = self.status();
            if status.is_terminal() {
                return status;
            }
            match events.recv().await {
                Ok(status) if status.is_terminal() => return status,
                Ok(_) => {}
                // A lagged receiver re-checks the live status on the next pass.
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return self.status(),
            }
        }
    }

    /// Marks the task as accepted by a queue. Idempotent: only the first call,
    /// on a freshly created task, performs the `New → Added` transition.
    pub(crate) fn mark_added(&self) {
        self.transition(TaskStatus::Added);
    }

    /// Executes one attempt of the work function.
    ///
    /// No-op on a terminal task. Transitions to `Running` synchronously, then
    /// spawns the attempt; completion transitions to `Success`, `Retry`, or
    /// `Failed` and notifies the queue.
    pub(crate) fn run(&self) {
        if self.is_terminal() {
            return;
        }
        if !self.transition(TaskStatus::Running) {
            return;
        }
        let Some(task) = self.weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            match (task.work)().await {
                Ok(value) => task.succeed(value),
                Err(error) => task.fail(error),
            }
        });
    }

    fn succeed(&self, value: T) {
        {
            let mut state = self.state();
            state.error = None;
            state.result = Some(value);
        }
        self.transition(TaskStatus::Success);
    }

    fn fail(&self, error: E) {
        let retry_delay = {
            let mut state = self.state();
            state.error = Some(error);
            if state.retries_remaining == 0 {
                None
            } else {
                state.retries_remaining -= 1;
                let delay = self.backoff.delay(state.backoff_attempt);
                state.backoff_attempt += 1;
                state.delay = delay;
                Some(delay)
            }
        };
        match retry_delay {
            Some(delay) => {
                debug!(
                    task = %self,
                    delay_ms = delay.as_millis() as u64,
                    retries_remaining = self.retries_remaining(),
                    "work failed, retry scheduled"
                );
                self.transition(TaskStatus::Retry);
                self.schedule_ready(delay);
            }
            None => {
                debug!(task = %self, "work failed, retry budget exhausted");
                self.transition(TaskStatus::Failed);
            }
        }
    }

    // The automatic Retry → Ready edge: an independent timer that re-enters the
    // state machine when the backoff delay elapses. No dispatcher involvement.
    fn schedule_ready(&self, delay: Duration) {
        let Some(task) = self.weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.transition(TaskStatus::Ready);
        });
    }

    // Applies a transition if the table permits it, then notifies subscribers
    // and the owning queue. Returns whether the transition was applied.
    fn transition(&self, next: TaskStatus) -> bool {
        {
            let mut state = self.state();
            if !state.status.permits(next) {
                trace!(task = %self, from = ?state.status, to = ?next, "transition rejected");
                return false;
            }
            state.status = next;
        }
        trace!(task = %self, status = ?next, "transition");
        let _ = self.events.send(next);
        if let Some(task) = self.weak.upgrade() {
            let _ = self.queue_tx.send(QueueMsg::Notify { task, status: next });
        }
        true
    }

    fn state(&self) -> MutexGuard<'_, TaskState<T, E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T, E> fmt::Display for Task<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

impl<T, E> fmt::Debug for Task<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Task")
            .field("label", &self.label)
            .field("status", &state.status)
            .field("retries_remaining", &state.retries_remaining)
            .finish_non_exhaustive()
    }
}

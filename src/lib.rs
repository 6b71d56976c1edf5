//! # requeue
//!
//! An in-process async task queue with bounded concurrency, automatic retries,
//! and jittered exponential backoff.
//!
//! Submit a work function and its parameters; the queue wraps them in a
//! [`Task`], runs at most `concurrency_limit` work functions at once, and
//! re-executes failures until their retry budget runs out — each retry delayed
//! by a capped, jittered exponential backoff. Outcomes are observed through the
//! returned [`TaskHandle`] or the queue's event stream; failures never
//! propagate out of the queue.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use requeue::{Queue, QueueConfig, TaskOptions, TaskStatus};
//!
//! #[tokio::main]
//! async fn main() {
//!     let queue = Queue::with_config(QueueConfig {
//!         concurrency_limit: 3,
//!         ..QueueConfig::default()
//!     });
//!
//!     let task = queue.submit(
//!         |params: Vec<&str>| async move { Ok::<_, String>(params.join(" ")) },
//!         vec!["hello", "world"],
//!         TaskOptions { retries: 2, ..TaskOptions::default() },
//!     );
//!
//!     assert_eq!(task.wait().await, TaskStatus::Success);
//!     assert_eq!(task.result(), Some("hello world".to_string()));
//! }
//! ```

// ── Core modules ──────────────────────────────────────────────────────────────
pub mod backoff;
pub mod queue;
pub mod task;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use backoff::BackoffPolicy;
pub use queue::{Queue, QueueConfig, QueueEvent, QueueStats};
pub use task::{Task, TaskHandle, TaskOptions, TaskStatus};

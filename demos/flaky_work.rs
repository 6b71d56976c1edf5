//! Submits a mix of steady and flaky work and watches the queue drain.
//!
//! Run with: `cargo run --example flaky_work`
//! Set `RUST_LOG=requeue=trace` to see every transition.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use requeue::{Queue, QueueConfig, QueueEvent, TaskOptions};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("requeue=debug")),
        )
        .init();

    let queue = Queue::with_config(QueueConfig {
        concurrency_limit: 2,
        label: "demo".to_string(),
        ..QueueConfig::default()
    });

    let mut events = queue.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                QueueEvent::Task { task, status } => println!("{task}: {status:?}"),
                other => println!("queue: {other:?}"),
            }
        }
    });

    for n in 1..=4 {
        queue.submit(
            |params: Vec<String>| async move { Ok::<_, String>(params.join(" ")) },
            vec!["steady".to_string(), format!("#{n}")],
            TaskOptions::default(),
        );
    }

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    let flaky = queue.submit(
        move |_: ()| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("transient outage".to_string())
                } else {
                    Ok("recovered".to_string())
                }
            }
        },
        (),
        TaskOptions {
            retries: 3,
            label: Some("flaky".to_string()),
            ..TaskOptions::default()
        },
    );

    // The steady tasks finish quickly; the flaky one rides out two backoff
    // delays, so the queue drains once in between and again at the end.
    flaky.wait().await;
    queue.drained().await;

    println!(
        "flaky finished as {:?} after {} attempts: {:?}",
        flaky.status(),
        attempts.load(Ordering::SeqCst),
        flaky.result()
    );
    println!(
        "final stats: {}",
        serde_json::to_string(&queue.stats()).expect("stats serialize")
    );
}

//! # Example: request_reply
//!
//! Two tasks exchanging messages over the bus.
//!
//! Demonstrates how to:
//! - Subscribe a typed [`Subscriber`] on a task.
//! - Send a request with a response handler and await its completion.
//! - Round-robin pushes across subscribers that match the same topic.
//!
//! ## Flow
//! ```text
//! client.request("time/now") ──► bus ──► clock task: on_publish ─► ctx.reply(now)
//!                                              │
//! client task: response handler ◄──────────────┘
//!
//! client.publish("jobs/resize") x4 ──► worker-a, worker-b, worker-a, worker-b
//! ```
//!
//! ## Run
//! ```bash
//! RUST_LOG=taskmesh=debug cargo run --example request_reply
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use taskmesh::{
    AppContext, CallError, Config, MessageContext, Subscriber, Task, TimeLimit, now_millis,
};
use tracing_subscriber::EnvFilter;

/// Counts the jobs it received and logs which task ran it.
struct Worker {
    name: &'static str,
    done: AtomicUsize,
}

impl Subscriber<String> for Worker {
    fn on_publish(&self, ctx: &MessageContext, job: String) -> Result<(), CallError> {
        let n = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        println!("[{}] {} on {} (#{n})", self.name, job, ctx.topic());
        Ok(())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 1. One context for every task of this process
    let mut cfg = Config::default();
    cfg.poll_interval = Duration::from_millis(100);
    cfg.grace = Duration::from_secs(2);
    let ctx = AppContext::new(cfg);

    let clock = Task::spawn(&ctx, "clock", ())?;
    let worker_a = Task::spawn(&ctx, "worker-a", ())?;
    let worker_b = Task::spawn(&ctx, "worker-b", ())?;
    let client = Task::spawn(&ctx, "client", ())?;

    // 2. The clock answers time requests
    clock.subscribe::<(), _>(
        "time/now",
        Arc::new(|msg: &MessageContext, _: ()| -> Result<(), CallError> {
            msg.reply(now_millis());
            Ok(())
        }),
    )?;

    // 3. Two workers share one job topic
    let a = Arc::new(Worker {
        name: "worker-a",
        done: AtomicUsize::new(0),
    });
    let b = Arc::new(Worker {
        name: "worker-b",
        done: AtomicUsize::new(0),
    });
    worker_a.subscribe::<String, _>("jobs/+", a.clone())?;
    worker_b.subscribe::<String, _>("jobs/#", b.clone())?;

    // 4. Request / reply
    let msg = client.request::<(), i64, _>(
        "time/now",
        (),
        TimeLimit::in_millis(1000),
        |msg: &MessageContext, now: i64| -> Result<(), CallError> {
            println!("[client] time is {now} (asked at {})", msg.publish_time());
            Ok(())
        },
    )?;
    msg.completion().await.context("time request failed")?;

    // 5. Pushes alternate between the two workers
    for i in 0..4 {
        client
            .publish("jobs/resize", format!("image-{i}"), TimeLimit::in_millis(1000))?
            .completion()
            .await?;
    }
    println!(
        "[main] worker-a={} worker-b={}",
        a.done.load(Ordering::SeqCst),
        b.done.load(Ordering::SeqCst)
    );

    // 6. Nobody listens here
    if let Err(e) = client.publish("nobody/home", (), TimeLimit::in_millis(1000)) {
        println!("[main] {}", e.as_message());
    }

    ctx.shutdown().await?;
    Ok(())
}

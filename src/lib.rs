//! # taskmesh
//!
//! **Taskmesh** is a thread-per-actor runtime for Rust.
//!
//! Each [`Task`] owns one OS thread and a FIFO job queue. Everything that
//! touches task-owned state (its [`Actor`] value, the [`Terminal`] state
//! machines it hosts) is a closure queued onto that thread, so that state is
//! never shared and never locked. Tasks talk to each other through
//! deadline-bounded calls and a topic-based [`MessagingBus`].
//!
//! ## Architecture
//! ### Overview
//! ```text
//!   any thread                                   task thread ("worker")
//! ┌──────────────────────────┐                  ┌──────────────────────────────────┐
//! │ task.call_before(limit,…)│──push + wakeup──►│ SegQueue<job> ─► poll loop       │
//! │ handle.run_later(…)      │                  │   ├─ Actor value                 │
//! │ state.new_timeout(…)     │                  │   ├─ TerminalTable               │
//! │ task.publish(topic, …)   │                  │   │    └─ Terminal<B> ─ State<B> │
//! └────────────┬─────────────┘                  │   └─ epilogs / listeners         │
//!              │                                └───────────────▲──────────────────┘
//!              ▼                                                │
//! ┌──────────────────────────┐   round robin    ┌───────────────┴──────────────────┐
//! │ MessagingBus             │─────────────────►│ Subscriber::on_publish (bounded) │
//! │ ArcSwap<filter → subs>   │                  │   ctx.reply(v) ─► publisher task │
//! └──────────────────────────┘                  └──────────────────────────────────┘
//!
//!         HashedWheelTimer ("taskmesh-timer") ── cancels Deadline tokens, fires timeouts
//! ```
//!
//! ### Bounded call
//! ```text
//! call_before(limit, f) ──► queued ──► run on target thread:
//!   ├─ limit expired?     ─► Err(DeadlineExceeded { already_expired })
//!   ├─ arm timer(remaining)
//!   ├─ f(&deadline)           (timer fire ─► deadline.token().cancel())
//!   ├─ disarm timer
//!   └─ Err(Interrupted) after fire ─► Err(DeadlineExceeded { interrupted })
//! ```
//!
//! ## Features
//! | Area           | Description                                                  | Key types / traits                          |
//! |----------------|--------------------------------------------------------------|---------------------------------------------|
//! | **Tasks**      | Thread-owning actors with FIFO queues and graceful stop.     | [`Task`], [`TaskBuilder`], [`Actor`]        |
//! | **Deadlines**  | Time-limited calls with cooperative cancellation.            | [`TimeLimit`], [`Deadline`], [`CallHandle`] |
//! | **Executors**  | One scheduling seam for tasks and the tokio blocking pool.   | [`Executor`], [`ExecutorExt`]               |
//! | **Terminals**  | Per-task state machines with guarded cross-thread calls.     | [`Terminal`], [`State`], [`StateHandle`]    |
//! | **Messaging**  | MQTT-style topics, round-robin push, request/response.       | [`MessagingBus`], [`MessageContext`]        |
//! | **Lifecycle**  | Explicit registry, liveness checks, bounded shutdown.        | [`AppContext`], [`Config`]                  |
//! | **Errors**     | Typed errors for calls and for the runtime.                  | [`CallError`], [`RuntimeError`]             |
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use taskmesh::{AppContext, CallError, Config, MessageContext, Task, TimeLimit};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut cfg = Config::default();
//!     cfg.grace = Duration::from_secs(2);
//!     let ctx = AppContext::new(cfg);
//!
//!     let server = Task::spawn(&ctx, "server", ())?;
//!     let client = Task::spawn(&ctx, "client", ())?;
//!
//!     server.subscribe::<String, _>(
//!         "greet/+",
//!         Arc::new(|msg: &MessageContext, name: String| -> Result<(), CallError> {
//!             msg.reply(format!("hello {name}"));
//!             Ok(())
//!         }),
//!     )?;
//!
//!     let msg = client.request::<String, String, _>(
//!         "greet/en",
//!         "world".to_string(),
//!         TimeLimit::in_millis(1000),
//!         |_: &MessageContext, reply: String| -> Result<(), CallError> {
//!             assert_eq!(reply, "hello world");
//!             Ok(())
//!         },
//!     )?;
//!     msg.completion().await?;
//!
//!     ctx.shutdown().await?;
//!     Ok(())
//! }
//! ```

mod core;
mod error;
mod exec;
mod messaging;
mod sync;
mod terminals;
mod time;

// ---- Public re-exports ----

pub use core::{
    Actor, AppContext, Config, ShutdownSignal, ShutdownSignals, Task, TaskBuilder, TaskScope,
    TaskStatus, stop_topic, wait_for_shutdown_signal,
};
pub use error::{CallError, RuntimeError};
pub use exec::{
    CallHandle, Deadline, Executor, ExecutorExt, Job, call_before, call_before_then, call_later,
    new_timeout, new_timeout_on, run_before, run_bounded, run_later,
};
pub use messaging::{
    Completion, MessageContext, MessageKind, MessagingBus, ResponseHandler, Subscriber,
    Subscription, TopicFilter,
};
pub use sync::WakeupSignal;
pub use terminals::{Behavior, State, StateHandle, StateId, Terminal, TerminalHandle, TerminalId};
pub use time::{HashedWheelTimer, TimeLimit, Timeout, now_millis};

//! # Application context: explicit task registry.
//!
//! [`AppContext`] replaces process-wide static state. It owns the
//! [`MessagingBus`] shared by its tasks and the name → [`Task`] registry, and
//! answers the liveness questions a health check asks.
//!
//! ## Architecture
//! ```text
//! Task::spawn(&ctx, ..) ──► ctx.add_task ──► registry[name] = task
//!                                              │
//! task thread exits ──► Task::finish ──► ctx.remove_task
//!
//! ctx.shutdown() ──► stop every task ──► await all terminated() (bounded by grace)
//! ```
//!
//! ## Rules
//! - Registration fails on a duplicate name.
//! - A task leaves the registry only after its thread has finished its loop.
//! - `join` and `shutdown` wait on a single snapshot of the registry; tasks
//!   spawned afterwards are not waited on.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::core::Config;
use crate::core::shutdown::wait_for_shutdown_signal;
use crate::core::task::Task;
use crate::error::RuntimeError;
use crate::messaging::MessagingBus;
use crate::time::now_millis;

struct ContextInner {
    config: Config,
    bus: MessagingBus,
    tasks: RwLock<HashMap<String, Task>>,
    stop_pending: AtomicBool,
}

/// Shared handle to the registry, bus and configuration of one application.
///
/// Cloning is cheap; clones refer to the same context.
///
/// # Example
/// ```
/// use taskmesh::{AppContext, Task};
///
/// let ctx = AppContext::default();
/// let task = Task::spawn(&ctx, "worker", ()).unwrap();
/// assert!(ctx.is_live());
/// assert_eq!(ctx.task_names(), vec!["worker".to_string()]);
///
/// ctx.stop();
/// ctx.join();
/// assert!(ctx.tasks().is_empty());
/// # drop(task);
/// ```
#[derive(Clone)]
pub struct AppContext {
    inner: Arc<ContextInner>,
}

impl Default for AppContext {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl AppContext {
    /// Creates an empty context.
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                config,
                bus: MessagingBus::new(),
                tasks: RwLock::new(HashMap::new()),
                stop_pending: AtomicBool::new(false),
            }),
        }
    }

    /// Configuration this context was created with.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Messaging bus shared by every task of this context.
    pub fn bus(&self) -> &MessagingBus {
        &self.inner.bus
    }

    pub(crate) fn add_task(&self, task: &Task) -> Result<(), RuntimeError> {
        match self.inner.tasks.write().entry(task.name().to_owned()) {
            Entry::Occupied(_) => Err(RuntimeError::DuplicateTaskName {
                name: task.name().to_owned(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(task.clone());
                Ok(())
            }
        }
    }

    /// Removes `task` if the registry still maps its name to it.
    pub(crate) fn remove_task(&self, task: &Task) {
        let mut tasks = self.inner.tasks.write();
        if tasks.get(task.name()).is_some_and(|t| t.ptr_eq(task)) {
            tasks.remove(task.name());
        }
    }

    /// Registered task named `name`.
    pub fn task(&self, name: &str) -> Option<Task> {
        self.inner.tasks.read().get(name).cloned()
    }

    /// Snapshot of every registered task.
    pub fn tasks(&self) -> Vec<Task> {
        self.inner.tasks.read().values().cloned().collect()
    }

    /// Sorted names of registered tasks.
    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.tasks.read().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// True when every registered task completed a poll iteration within
    /// `max_staleness`.
    pub fn watchdog_check(&self, max_staleness: Duration) -> bool {
        let now = now_millis();
        let limit = i64::try_from(max_staleness.as_millis()).unwrap_or(i64::MAX);
        self.inner
            .tasks
            .read()
            .values()
            .all(|t| now.saturating_sub(t.last_scan_time()) <= limit)
    }

    /// Watchdog with the configured liveness window.
    pub fn is_live(&self) -> bool {
        self.watchdog_check(self.inner.config.liveness_window)
    }

    /// Watchdog passes, every task is alive, and no stop is pending.
    pub fn readiness_check(&self, max_staleness: Duration) -> bool {
        !self.is_stop_pending()
            && self.watchdog_check(max_staleness)
            && self.inner.tasks.read().values().all(Task::is_alive)
    }

    /// True once [`AppContext::stop`] has been called.
    pub fn is_stop_pending(&self) -> bool {
        self.inner.stop_pending.load(Ordering::SeqCst)
    }

    /// Requests a stop of every registered task.
    pub fn stop(&self) {
        self.inner.stop_pending.store(true, Ordering::SeqCst);
        let tasks = self.tasks();
        info!(tasks = tasks.len(), "stopping application context");
        for task in &tasks {
            task.stop();
        }
    }

    /// Blocks until every currently registered task has terminated.
    pub fn join(&self) {
        for task in self.tasks() {
            task.join();
        }
    }

    /// Stops every task, then waits for them up to the configured grace.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        let tasks = self.tasks();
        self.stop();
        let all = futures::future::join_all(tasks.iter().map(Task::terminated));

        match self.inner.config.grace_limit() {
            None => {
                all.await;
            }
            Some(grace) => {
                if tokio::time::timeout(grace, all).await.is_err() {
                    let stuck = self.task_names();
                    warn!(?grace, ?stuck, "grace exceeded; tasks still running");
                    return Err(RuntimeError::GraceExceeded { grace, stuck });
                }
            }
        }
        info!("application context shut down");
        Ok(())
    }

    /// Waits for a termination signal, then runs [`AppContext::shutdown`].
    ///
    /// If the signal handlers cannot be installed the error is logged and
    /// shutdown proceeds immediately.
    pub async fn run_until_signal(&self) -> Result<(), RuntimeError> {
        match wait_for_shutdown_signal().await {
            Ok(signal) => info!(
                signal = signal.as_label(),
                tasks = self.inner.tasks.read().len(),
                "termination signal received"
            ),
            Err(e) => error!(error = %e, "cannot listen for termination signals"),
        }
        self.shutdown().await
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("tasks", &self.task_names())
            .field("stop_pending", &self.is_stop_pending())
            .finish()
    }
}

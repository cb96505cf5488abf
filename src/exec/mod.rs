//! # Execution contexts and deadline-bounded calls.
//!
//! [`Executor`] is the seam every scheduling primitive goes through: anything
//! that can run a boxed closure somewhere else. A [`Task`](crate::Task) runs
//! it on its own thread; a tokio [`Handle`](tokio::runtime::Handle) runs it on
//! the blocking pool.
//!
//! - [`deadline`] bounded calls ([`call_before`], [`run_before`], ...) and timeouts.
//! - [`handle`] the [`CallHandle`] returned to callers.

use std::sync::Arc;

pub mod deadline;
pub mod handle;

pub use deadline::{
    Deadline, ExecutorExt, call_before, call_before_then, call_later, new_timeout,
    new_timeout_on, run_before, run_bounded, run_later,
};
pub use handle::CallHandle;

/// A unit of work handed to an executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that runs jobs, possibly on another thread.
///
/// ### Rules
/// - `execute` never blocks waiting for the job to run.
/// - A job the executor cannot run must be dropped, not leaked; dropping a
///   scheduled call resolves its handle with `Abandoned`.
pub trait Executor: Send + Sync {
    /// Queues `job` for execution.
    fn execute(&self, job: Job);

    /// Name used in logs and in `Abandoned` errors.
    fn name(&self) -> &str {
        "executor"
    }
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn execute(&self, job: Job) {
        (**self).execute(job)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

impl Executor for tokio::runtime::Handle {
    fn execute(&self, job: Job) {
        drop(self.spawn_blocking(job));
    }

    fn name(&self) -> &str {
        "tokio-blocking"
    }
}

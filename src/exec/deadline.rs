//! # Deadline-bounded execution.
//!
//! Runs a callable on an [`Executor`] under a [`TimeLimit`]. The process-wide
//! [`HashedWheelTimer`] races the callable; when it wins it cancels the call's
//! [`Deadline`], which the callable observes cooperatively.
//!
//! ## Rules
//! - An already-expired limit fails with `DeadlineExceeded { already_expired }`
//!   and the callable never runs.
//! - The timer is disarmed before the outcome is published, so a late fire can
//!   only touch the finished call's own token, never the next job.
//! - A callable that observed the interruption (returned
//!   [`CallError::Interrupted`]) fails with `DeadlineExceeded { interrupted }`.
//! - A callable that ignores the interruption and returns a value succeeds.
//! - Panics are caught and surface as [`CallError::Panicked`].
//!
//! # Example
//! ```no_run
//! use std::time::Duration;
//! use taskmesh::{AppContext, CallError, Task, TimeLimit};
//!
//! let ctx = AppContext::default();
//! let task = Task::spawn(&ctx, "worker", ()).unwrap();
//!
//! let slow = task.call_before(TimeLimit::in_millis(50), |deadline| {
//!     deadline.sleep(Duration::from_secs(5))?;
//!     Ok(1)
//! });
//! assert!(matches!(
//!     slow.wait(),
//!     Err(CallError::DeadlineExceeded { interrupted: true, .. })
//! ));
//! ```

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::CallError;
use crate::exec::Executor;
use crate::exec::handle::{CallHandle, Completer, completion_pair};
use crate::sync::WakeupSignal;
use crate::time::{HashedWheelTimer, TimeLimit, Timeout};

/// Cancellation context handed to every bounded callable.
///
/// The shared timer cancels [`token`](Deadline::token) and wakes any
/// [`sleep`](Deadline::sleep) in progress when the limit passes.
#[derive(Debug, Clone)]
pub struct Deadline {
    limit: TimeLimit,
    token: CancellationToken,
    signal: Arc<WakeupSignal>,
}

impl Deadline {
    fn new(limit: TimeLimit) -> Self {
        Self {
            limit,
            token: CancellationToken::new(),
            signal: Arc::new(WakeupSignal::new()),
        }
    }

    /// The limit this call runs under.
    pub fn limit(&self) -> TimeLimit {
        self.limit
    }

    /// Token cancelled when the limit passes; usable from async code.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// True once the timer has fired for this call.
    pub fn is_interrupted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fails with [`CallError::Interrupted`] once the timer has fired.
    pub fn checkpoint(&self) -> Result<(), CallError> {
        if self.is_interrupted() {
            Err(CallError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Blocks for `duration` unless interrupted first.
    pub fn sleep(&self, duration: Duration) -> Result<(), CallError> {
        let until = Instant::now().checked_add(duration);
        loop {
            self.checkpoint()?;
            let left = match until {
                Some(until) => until.saturating_duration_since(Instant::now()),
                None => Duration::MAX,
            };
            if left.is_zero() {
                return Ok(());
            }
            self.signal.wait_for_post(left);
        }
    }

    fn arm(&self) -> Option<Timeout> {
        let delay = self.limit.remaining_duration()?;
        let token = self.token.clone();
        let signal = self.signal.clone();
        Some(HashedWheelTimer::shared().new_timeout(delay, move || {
            token.cancel();
            signal.post();
        }))
    }
}

/// Runs `f` on the current thread under `limit`.
///
/// This is the body every scheduled bounded call executes on its target thread.
pub fn run_bounded<R, F>(limit: TimeLimit, f: F) -> Result<R, CallError>
where
    F: FnOnce(&Deadline) -> Result<R, CallError>,
{
    if limit.is_expired() {
        return Err(CallError::DeadlineExceeded {
            already_expired: true,
            interrupted: false,
        });
    }
    let deadline = Deadline::new(limit);
    let timeout = deadline.arm();
    let outcome = catch_unwind(AssertUnwindSafe(|| f(&deadline)));
    if let Some(timeout) = timeout {
        timeout.cancel();
    }
    match outcome {
        Ok(Err(CallError::Interrupted)) if deadline.is_interrupted() => {
            Err(CallError::DeadlineExceeded {
                already_expired: false,
                interrupted: true,
            })
        }
        Ok(result) => result,
        Err(panic) => Err(CallError::from_panic(panic)),
    }
}

/// Schedules `f` on `exec` under `limit` and returns its handle.
pub fn call_before<E, R, F>(exec: &E, limit: TimeLimit, f: F) -> CallHandle<R>
where
    E: Executor + ?Sized,
    R: Send + 'static,
    F: FnOnce(&Deadline) -> Result<R, CallError> + Send + 'static,
{
    let (completer, handle) = completion_pair(exec.name());
    exec.execute(Box::new(move || completer.complete(run_bounded(limit, f))));
    handle
}

/// Schedules `f` on `exec` under `limit`; `then` receives the outcome on the
/// executing thread (or `Abandoned` wherever the unrun job is dropped).
pub fn call_before_then<E, R, F, C>(exec: &E, limit: TimeLimit, f: F, then: C)
where
    E: Executor + ?Sized,
    R: Send + 'static,
    F: FnOnce(&Deadline) -> Result<R, CallError> + Send + 'static,
    C: FnOnce(Result<R, CallError>) + Send + 'static,
{
    let completer = Completer::new(exec.name(), then);
    exec.execute(Box::new(move || completer.complete(run_bounded(limit, f))));
}

/// Unit-result form of [`call_before`].
pub fn run_before<E, F>(exec: &E, limit: TimeLimit, f: F) -> CallHandle<()>
where
    E: Executor + ?Sized,
    F: FnOnce(&Deadline) -> Result<(), CallError> + Send + 'static,
{
    call_before(exec, limit, f)
}

/// Schedules `f` on `exec` without a deadline.
pub fn call_later<E, R, F>(exec: &E, f: F) -> CallHandle<R>
where
    E: Executor + ?Sized,
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    call_before(exec, TimeLimit::no_limit(), move |_| Ok(f()))
}

/// Unit-result form of [`call_later`].
pub fn run_later<E, F>(exec: &E, f: F) -> CallHandle<()>
where
    E: Executor + ?Sized,
    F: FnOnce() + Send + 'static,
{
    call_later(exec, f)
}

/// Fires `f` on the shared timer thread after `delay`.
pub fn new_timeout<F>(delay: Duration, f: F) -> Timeout
where
    F: FnOnce() + Send + 'static,
{
    HashedWheelTimer::shared().new_timeout(delay, f)
}

/// Fires `f` on `exec` after `delay`.
pub fn new_timeout_on<E, F>(exec: &E, delay: Duration, f: F) -> Timeout
where
    E: Executor + Clone + 'static,
    F: FnOnce() + Send + 'static,
{
    let exec = exec.clone();
    HashedWheelTimer::shared().new_timeout(delay, move || exec.execute(Box::new(f)))
}

/// Method-call sugar for the free functions of this module.
pub trait ExecutorExt: Executor {
    /// See [`call_before`].
    fn call_before<R, F>(&self, limit: TimeLimit, f: F) -> CallHandle<R>
    where
        R: Send + 'static,
        F: FnOnce(&Deadline) -> Result<R, CallError> + Send + 'static,
    {
        call_before(self, limit, f)
    }

    /// See [`run_before`].
    fn run_before<F>(&self, limit: TimeLimit, f: F) -> CallHandle<()>
    where
        F: FnOnce(&Deadline) -> Result<(), CallError> + Send + 'static,
    {
        run_before(self, limit, f)
    }

    /// See [`call_later`].
    fn call_later<R, F>(&self, f: F) -> CallHandle<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        call_later(self, f)
    }

    /// See [`run_later`].
    fn run_later<F>(&self, f: F) -> CallHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        run_later(self, f)
    }
}

impl<E: Executor + ?Sized> ExecutorExt for E {}

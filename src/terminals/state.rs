//! # Terminal states.
//!
//! A [`State`] is one node of a terminal's state machine. Its hooks run on the
//! host task's thread with the terminal borrowed mutably, so a state may call
//! [`Terminal::next_state`] from inside `on_entry` or `on_leave`.
//!
//! A [`StateHandle`] names one state occupancy of one terminal. It is the only
//! way to reach a state from another thread, and every call made through it
//! is guarded at run time: if the state is no longer current when the call
//! runs, the call fails with [`CallError::InactiveState`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::debug;

use crate::error::CallError;
use crate::exec::{CallHandle, Deadline};
use crate::terminals::{Behavior, Terminal, TerminalHandle, short_type_name};
use crate::time::{HashedWheelTimer, TimeLimit, Timeout};

static NEXT_STATE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one state occupancy; a state entered twice gets two ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(u64);

impl StateId {
    pub(crate) fn next() -> Self {
        StateId(NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Behavior unit of a terminal.
///
/// ### Rules
/// - `on_entry` runs exactly once each time the state becomes current.
/// - `on_leave` runs once when the terminal moves away from it.
/// - A panic in either hook is caught and logged; the transition stands.
pub trait State<B: Behavior>: 'static {
    /// Name used in logs and in `InactiveState` errors.
    fn name(&self) -> &str {
        short_type_name::<Self>()
    }

    /// Called after the state became current.
    fn on_entry(&self, terminal: &mut Terminal<B>);

    /// Called after another state (or termination) replaced this one.
    fn on_leave(&self, terminal: &mut Terminal<B>) {
        let _ = terminal;
    }
}

/// State every terminal starts in.
pub(crate) struct InitialState;

impl<B: Behavior> State<B> for InitialState {
    fn name(&self) -> &str {
        "initial"
    }

    fn on_entry(&self, _terminal: &mut Terminal<B>) {}
}

/// Cross-thread reference to one state occupancy of a terminal.
pub struct StateHandle<B: Behavior> {
    terminal: TerminalHandle<B>,
    id: StateId,
    name: Arc<str>,
}

impl<B: Behavior> Clone for StateHandle<B> {
    fn clone(&self) -> Self {
        Self {
            terminal: self.terminal.clone(),
            id: self.id,
            name: self.name.clone(),
        }
    }
}

impl<B: Behavior> fmt::Debug for StateHandle<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateHandle")
            .field("terminal", &self.terminal.label())
            .field("state", &self.name)
            .field("id", &self.id)
            .finish()
    }
}

impl<B: Behavior> StateHandle<B> {
    pub(crate) fn new(terminal: TerminalHandle<B>, id: StateId, name: &str) -> Self {
        Self {
            terminal,
            id,
            name: Arc::from(name),
        }
    }

    /// This occupancy's id.
    pub fn id(&self) -> StateId {
        self.id
    }

    /// State name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle of the owning terminal.
    pub fn terminal(&self) -> &TerminalHandle<B> {
        &self.terminal
    }

    fn inactive(&self) -> CallError {
        CallError::InactiveState {
            state: self.name.to_string(),
        }
    }

    /// Runs `f` on the host task under `limit`, only if this state is still current.
    pub fn call_before<R, F>(&self, limit: TimeLimit, f: F) -> CallHandle<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Terminal<B>, &Deadline) -> Result<R, CallError> + Send + 'static,
    {
        let guard = self.clone();
        self.terminal
            .task()
            .schedule_scoped(limit, move |_, scope, deadline| {
                let terminal = guard.resolve(scope)?;
                f(terminal, deadline)
            })
    }

    /// Unit-result form of [`StateHandle::call_before`].
    pub fn run_before<F>(&self, limit: TimeLimit, f: F) -> CallHandle<()>
    where
        F: FnOnce(&mut Terminal<B>, &Deadline) -> Result<(), CallError> + Send + 'static,
    {
        self.call_before(limit, f)
    }

    /// [`StateHandle::call_before`] without a deadline.
    pub fn call_later<R, F>(&self, f: F) -> CallHandle<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Terminal<B>) -> R + Send + 'static,
    {
        self.call_before(TimeLimit::no_limit(), move |terminal, _| Ok(f(terminal)))
    }

    /// Unit-result form of [`StateHandle::call_later`].
    pub fn run_later<F>(&self, f: F) -> CallHandle<()>
    where
        F: FnOnce(&mut Terminal<B>) + Send + 'static,
    {
        self.call_later(f)
    }

    /// Fires `f` on the host task after `delay` if this state is still current then.
    ///
    /// A skipped firing is logged at debug level.
    pub fn new_timeout<F>(&self, delay: Duration, f: F) -> Timeout
    where
        F: FnOnce(&mut Terminal<B>) + Send + 'static,
    {
        let guard = self.clone();
        HashedWheelTimer::shared().new_timeout(delay, move || {
            let task = guard.terminal.task().clone();
            let state = guard.name.clone();
            task.schedule_scoped_then(
                TimeLimit::no_limit(),
                move |_, scope, _| {
                    let terminal = guard.resolve(scope)?;
                    f(terminal);
                    Ok(())
                },
                move |outcome| {
                    if let Err(e) = outcome {
                        debug!(state = %state, reason = e.as_label(), "state timeout skipped");
                    }
                },
            );
        })
    }

    fn resolve<'s>(
        &self,
        scope: &'s mut crate::core::TaskScope<'_>,
    ) -> Result<&'s mut Terminal<B>, CallError> {
        match scope.terminal_mut::<B>(self.terminal.id()) {
            Some(terminal) if terminal.is_current(self.id) => Ok(terminal),
            _ => Err(self.inactive()),
        }
    }
}

//! # Terminals: state machines hosted by a task.
//!
//! A [`Terminal`] lives on its host task's thread and owns a [`Behavior`]
//! value plus the current [`State`]. [`Terminal::next_state`] is the only
//! transition: the new state becomes current before `on_leave` and `on_entry`
//! run, so re-entrant transitions from inside a hook see the right state.
//!
//! ```text
//! next_state(s) ─► current = s ─► prev.on_leave ─► s.on_entry (panics logged)
//! terminate()   ─► current = none ─► prev.on_leave ─► Behavior::on_termination
//! ```
//!
//! A [`TerminalHandle`] reaches the terminal from other threads. Calls made
//! through it are checked when they run, not when they are queued, and fail
//! with [`CallError::TerminatedTerminal`] once the terminal is gone.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::core::{Hosted, Task};
use crate::error::{CallError, panic_message};
use crate::exec::{CallHandle, Deadline};
use crate::terminals::short_type_name;
use crate::terminals::state::{InitialState, State, StateHandle, StateId};
use crate::time::{HashedWheelTimer, TimeLimit, Timeout};

static NEXT_TERMINAL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique terminal identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TerminalId(u64);

impl fmt::Display for TerminalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// User data and lifecycle hooks of a terminal.
///
/// The value lives inside the [`Terminal`] on the host task's thread and is
/// reached through [`Terminal::get`] / [`Terminal::get_mut`].
pub trait Behavior: Sized + 'static {
    /// Name used in logs and in the terminal's display form.
    fn name() -> &'static str {
        short_type_name::<Self>()
    }

    /// The host task received a stop request.
    fn on_stop_requested(terminal: &mut Terminal<Self>) {
        let _ = terminal;
    }

    /// The terminal has just terminated and left its task.
    fn on_termination(terminal: &mut Terminal<Self>) {
        let _ = terminal;
    }
}

struct Current<B: Behavior> {
    id: StateId,
    state: Rc<dyn State<B>>,
}

impl<B: Behavior> Clone for Current<B> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            state: self.state.clone(),
        }
    }
}

/// A state machine hosted by a task.
///
/// ```text
///   attach ──► initial ──next_state──► S1 ──next_state──► S2 ──terminate──► (terminated)
///                                         on_leave(S1)       on_leave(S2)
///                                         on_entry(S2)       on_termination
/// ```
///
/// ### Rules
/// - Lives on the host task's thread and is only touched from there.
/// - [`next_state`](Terminal::next_state) makes the new state current *before*
///   running any hook, so re-entrant transitions from hooks see it.
/// - Once terminated it leaves its task after the running job and never
///   becomes active again.
pub struct Terminal<B: Behavior> {
    id: TerminalId,
    task: Task,
    behavior: B,
    state: Option<Current<B>>,
}

impl<B: Behavior> Terminal<B> {
    pub(crate) fn new(task: Task, behavior: B) -> Self {
        Self {
            id: TerminalId(NEXT_TERMINAL_ID.fetch_add(1, Ordering::Relaxed)),
            task,
            behavior,
            state: Some(Current {
                id: StateId::next(),
                state: Rc::new(InitialState),
            }),
        }
    }

    /// Terminal id.
    pub fn id(&self) -> TerminalId {
        self.id
    }

    /// Host task.
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Behavior data.
    pub fn get(&self) -> &B {
        &self.behavior
    }

    /// Behavior data, mutably.
    pub fn get_mut(&mut self) -> &mut B {
        &mut self.behavior
    }

    /// Sendable handle for scheduling calls on this terminal.
    pub fn handle(&self) -> TerminalHandle<B> {
        TerminalHandle {
            task: self.task.clone(),
            id: self.id,
            label: Arc::from(self.to_string()),
            _behavior: PhantomData,
        }
    }

    /// True once terminated.
    pub fn is_terminated(&self) -> bool {
        self.state.is_none()
    }

    /// Id of the current state occupancy.
    pub fn current_state(&self) -> Option<StateId> {
        self.state.as_ref().map(|c| c.id)
    }

    /// Name of the current state; `None` once terminated.
    pub fn state_name(&self) -> Option<&str> {
        self.state.as_ref().map(|c| c.state.name())
    }

    /// Handle to the current state occupancy.
    pub fn current_handle(&self) -> Option<StateHandle<B>> {
        let current = self.state.as_ref()?;
        Some(StateHandle::new(self.handle(), current.id, current.state.name()))
    }

    /// True if `state` is the current occupancy.
    pub fn is_current(&self, state: StateId) -> bool {
        self.current_state() == Some(state)
    }

    /// Moves to `next` and returns a handle to the new occupancy.
    pub fn next_state<S: State<B>>(&mut self, next: S) -> StateHandle<B> {
        self.next_state_with(|_| next)
    }

    /// Moves to a state built from its own handle.
    ///
    /// The builder receives the handle before the state exists, so the state
    /// can keep it for scheduling guarded calls and timeouts on itself.
    pub fn next_state_with<S, F>(&mut self, build: F) -> StateHandle<B>
    where
        S: State<B>,
        F: FnOnce(StateHandle<B>) -> S,
    {
        let id = StateId::next();
        let state = build(StateHandle::new(self.handle(), id, short_type_name::<S>()));
        let handle = StateHandle::new(self.handle(), id, state.name());
        self.transition(Some(Current {
            id,
            state: Rc::new(state),
        }));
        handle
    }

    /// Terminates the terminal; equivalent to a transition to no state.
    pub fn terminate(&mut self) {
        self.transition(None);
    }

    fn transition(&mut self, next: Option<Current<B>>) {
        if self.is_terminated() {
            warn!(terminal = %self, "transition on terminated terminal ignored");
            return;
        }
        let prev = std::mem::replace(&mut self.state, next.clone());
        debug!(
            terminal = %self,
            prev = prev.as_ref().map(|c| c.state.name()).unwrap_or("-"),
            "terminal entering new state"
        );

        if let Some(prev) = prev {
            self.guard("on_leave", |t| prev.state.on_leave(t));
        }

        match next {
            None => {
                debug!(terminal = %self, "end of terminal");
                self.guard("on_termination", B::on_termination);
            }
            Some(next) => self.guard("on_entry", |t| next.state.on_entry(t)),
        }
    }

    fn guard(&mut self, hook: &'static str, f: impl FnOnce(&mut Self)) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| f(self))) {
            error!(
                terminal = %self,
                hook,
                error = %panic_message(panic.as_ref()),
                "terminal hook panicked"
            );
        }
    }
}

impl<B: Behavior> fmt::Display for Terminal<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", B::name(), self.id)
    }
}

impl<B: Behavior> Hosted for Terminal<B> {
    fn is_terminated(&self) -> bool {
        Terminal::is_terminated(self)
    }

    fn stop_requested(&mut self) {
        if !self.is_terminated() {
            self.guard("on_stop_requested", B::on_stop_requested);
        }
    }

    fn force_terminate(&mut self) {
        if !self.is_terminated() {
            warn!(terminal = %self, "terminating terminal left at task end");
            self.terminate();
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Cross-thread reference to a terminal.
///
/// Calls made through it run on the host task and fail with
/// [`CallError::TerminatedTerminal`] once the terminal is gone.
pub struct TerminalHandle<B: Behavior> {
    task: Task,
    id: TerminalId,
    label: Arc<str>,
    _behavior: PhantomData<fn() -> B>,
}

impl<B: Behavior> Clone for TerminalHandle<B> {
    fn clone(&self) -> Self {
        Self {
            task: self.task.clone(),
            id: self.id,
            label: self.label.clone(),
            _behavior: PhantomData,
        }
    }
}

impl<B: Behavior> fmt::Debug for TerminalHandle<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalHandle")
            .field("terminal", &self.label)
            .field("task", &self.task.name())
            .finish()
    }
}

impl<B: Behavior> TerminalHandle<B> {
    /// Terminal id.
    pub fn id(&self) -> TerminalId {
        self.id
    }

    /// Host task.
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Display form `<behavior>#<id>`.
    pub fn label(&self) -> &str {
        &self.label
    }

    fn terminated(&self) -> CallError {
        CallError::TerminatedTerminal {
            terminal: self.label.to_string(),
        }
    }

    /// Runs `f` on the host task under `limit` if the terminal is still alive then.
    pub fn call_before<R, F>(&self, limit: TimeLimit, f: F) -> CallHandle<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Terminal<B>, &Deadline) -> Result<R, CallError> + Send + 'static,
    {
        let this = self.clone();
        self.task.schedule_scoped(limit, move |_, scope, deadline| {
            let terminal = scope
                .terminal_mut::<B>(this.id)
                .ok_or_else(|| this.terminated())?;
            f(terminal, deadline)
        })
    }

    /// Unit-result form of [`TerminalHandle::call_before`].
    pub fn run_before<F>(&self, limit: TimeLimit, f: F) -> CallHandle<()>
    where
        F: FnOnce(&mut Terminal<B>, &Deadline) -> Result<(), CallError> + Send + 'static,
    {
        self.call_before(limit, f)
    }

    /// [`TerminalHandle::call_before`] without a deadline.
    pub fn call_later<R, F>(&self, f: F) -> CallHandle<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Terminal<B>) -> R + Send + 'static,
    {
        self.call_before(TimeLimit::no_limit(), move |terminal, _| Ok(f(terminal)))
    }

    /// Unit-result form of [`TerminalHandle::call_later`].
    pub fn run_later<F>(&self, f: F) -> CallHandle<()>
    where
        F: FnOnce(&mut Terminal<B>) + Send + 'static,
    {
        self.call_later(f)
    }

    /// Schedules termination of the terminal.
    pub fn terminate(&self) -> CallHandle<()> {
        self.run_later(Terminal::terminate)
    }

    /// Fires `f` on the host task after `delay`, unless the terminal is gone by then.
    pub fn new_timeout<F>(&self, delay: Duration, f: F) -> Timeout
    where
        F: FnOnce(&mut Terminal<B>) + Send + 'static,
    {
        let this = self.clone();
        HashedWheelTimer::shared().new_timeout(delay, move || {
            let label = this.label.clone();
            let task = this.task.clone();
            task.schedule_scoped_then(
                TimeLimit::no_limit(),
                move |_, scope, _| {
                    let terminal = scope
                        .terminal_mut::<B>(this.id)
                        .ok_or_else(|| this.terminated())?;
                    f(terminal);
                    Ok(())
                },
                move |outcome| {
                    if let Err(e) = outcome {
                        debug!(terminal = %label, reason = e.as_label(), "terminal timeout skipped");
                    }
                },
            );
        })
    }

    /// Runs `callback` on the host terminal once `future` completes.
    ///
    /// If the terminal has terminated by then, the callback is skipped and
    /// the skip is logged.
    pub fn listen_future<Fut, C>(&self, future: Fut, callback: C)
    where
        Fut: std::future::Future + Send + 'static,
        Fut::Output: Send + 'static,
        C: FnOnce(&mut Terminal<B>, Fut::Output) + Send + 'static,
    {
        let label = self.label.clone();
        self.listen_future_then(future, callback, move |outcome| {
            if let Err(e) = outcome {
                debug!(terminal = %label, reason = e.as_label(), "terminal listener skipped");
            }
        });
    }

    pub(crate) fn listen_future_then<Fut, C, T>(&self, future: Fut, callback: C, then: T)
    where
        Fut: std::future::Future + Send + 'static,
        Fut::Output: Send + 'static,
        C: FnOnce(&mut Terminal<B>, Fut::Output) + Send + 'static,
        T: FnOnce(Result<(), CallError>) + Send + 'static,
    {
        let this = self.clone();
        self.task.listen_future(future, move |output| {
            let task = this.task.clone();
            task.schedule_scoped_then(
                TimeLimit::no_limit(),
                move |_, scope, _| {
                    let terminal = scope
                        .terminal_mut::<B>(this.id)
                        .ok_or_else(|| this.terminated())?;
                    callback(terminal, output);
                    Ok(())
                },
                then,
            );
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AppContext;
    use parking_lot::Mutex;
    use std::cell::Cell;
    use std::sync::atomic::AtomicUsize;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Conversation {
        log: Log,
        terminations: Arc<AtomicUsize>,
        second: Option<StateHandle<Conversation>>,
    }

    impl Behavior for Conversation {
        fn on_stop_requested(terminal: &mut Terminal<Self>) {
            terminal.get().log.lock().push("stop".into());
            terminal.terminate();
        }

        fn on_termination(terminal: &mut Terminal<Self>) {
            terminal.get().log.lock().push("terminated".into());
            terminal.get().terminations.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Hands over to `Second` from inside its own entry hook.
    struct First;

    impl State<Conversation> for First {
        fn on_entry(&self, terminal: &mut Terminal<Conversation>) {
            terminal.get().log.lock().push("enter first".into());
            let second = terminal.next_state_with(|handle| Second {
                handle,
                calls: Cell::new(0),
            });
            assert!(terminal.is_current(second.id()));
            terminal.get_mut().second = Some(second);
            terminal.get().log.lock().push("first entry done".into());
        }

        fn on_leave(&self, terminal: &mut Terminal<Conversation>) {
            terminal.get().log.lock().push("leave first".into());
        }
    }

    struct Second {
        handle: StateHandle<Conversation>,
        calls: Cell<u32>,
    }

    impl State<Conversation> for Second {
        fn on_entry(&self, terminal: &mut Terminal<Conversation>) {
            assert!(terminal.is_current(self.handle.id()));
            terminal.get().log.lock().push("enter second".into());
        }

        fn on_leave(&self, terminal: &mut Terminal<Conversation>) {
            self.calls.set(self.calls.get() + 1);
            terminal.get().log.lock().push("leave second".into());
        }
    }

    struct Setup {
        task: Task,
        terminal: TerminalHandle<Conversation>,
        first: StateHandle<Conversation>,
        log: Log,
        terminations: Arc<AtomicUsize>,
    }

    fn setup(ctx: &AppContext, name: &str) -> Setup {
        let task = Task::spawn(ctx, name, ()).unwrap();
        let log: Log = Arc::default();
        let terminations = Arc::new(AtomicUsize::new(0));
        let behavior = Conversation {
            log: log.clone(),
            terminations: terminations.clone(),
            second: None,
        };
        let (terminal, first) = task
            .with_scope(TimeLimit::in_millis(2000), move |scope, _| {
                Ok(scope.attach(behavior, |t| (t.handle(), t.next_state(First))))
            })
            .wait()
            .unwrap();
        Setup {
            task,
            terminal,
            first,
            log,
            terminations,
        }
    }

    #[test]
    fn test_reentrant_transition_order() {
        let ctx = AppContext::default();
        let s = setup(&ctx, "terminal-order");
        assert_eq!(
            *s.log.lock(),
            vec![
                "enter first",
                "leave first",
                "enter second",
                "first entry done"
            ]
        );
        s.task.stop();
        s.task.join();
    }

    #[test]
    fn test_guards_after_transitions() {
        let ctx = AppContext::default();
        let s = setup(&ctx, "terminal-guards");

        let r = s.first.call_later(|_| ()).wait();
        assert_eq!(
            r,
            Err(CallError::InactiveState {
                state: "First".into()
            })
        );

        let second = s
            .terminal
            .call_later(|t| t.get().second.clone())
            .wait()
            .unwrap()
            .expect("second state handle");
        assert_eq!(second.name(), "Second");
        assert_eq!(second.call_later(|t| t.state_name().map(str::to_owned)).wait(), Ok(Some("Second".into())));

        assert_eq!(second.run_later(Terminal::terminate).wait(), Ok(()));
        assert_eq!(s.terminations.load(Ordering::SeqCst), 1);

        assert!(matches!(
            second.run_later(|_| ()).wait(),
            Err(CallError::InactiveState { .. })
        ));
        assert_eq!(
            s.terminal.run_later(|_| ()).wait(),
            Err(CallError::TerminatedTerminal {
                terminal: s.terminal.label().to_string()
            })
        );
        assert_eq!(
            s.task.with_scope(TimeLimit::no_limit(), |scope, _| Ok(scope.terminal_count())).wait(),
            Ok(0)
        );

        s.task.stop();
        s.task.join();
    }

    #[test]
    fn test_stop_request_reaches_terminal() {
        let ctx = AppContext::default();
        let s = setup(&ctx, "terminal-stop");
        s.task.stop();
        s.task.join();

        let log = s.log.lock().clone();
        assert!(log.ends_with(&["stop".into(), "leave second".into(), "terminated".into()]));
        assert_eq!(s.terminations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remaining_terminals_terminated_at_task_end() {
        struct Quiet(Arc<AtomicUsize>);
        impl Behavior for Quiet {
            fn on_termination(terminal: &mut Terminal<Self>) {
                terminal.get().0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let ctx = AppContext::default();
        let task = Task::spawn(&ctx, "terminal-leftover", ()).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        task.with_scope(TimeLimit::no_limit(), move |scope, _| {
            scope.attach(Quiet(c.clone()), |_| ());
            scope.attach(Quiet(c), |_| ());
            Ok(())
        })
        .wait()
        .unwrap();

        task.stop();
        task.join();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_entry_keeps_state_current() {
        struct Plain;
        impl Behavior for Plain {}
        struct Explodes;
        impl State<Plain> for Explodes {
            fn on_entry(&self, _terminal: &mut Terminal<Plain>) {
                panic!("entry failed");
            }
        }

        let ctx = AppContext::default();
        let task = Task::spawn(&ctx, "terminal-panic", ()).unwrap();
        let (terminal, state) = task
            .with_scope(TimeLimit::no_limit(), |scope, _| {
                Ok(scope.attach(Plain, |t| (t.handle(), t.next_state(Explodes))))
            })
            .wait()
            .unwrap();

        assert_eq!(state.call_later(|t| t.is_terminated()).wait(), Ok(false));
        assert_eq!(terminal.terminate().wait(), Ok(()));
        task.stop();
        task.join();
    }

    #[test]
    fn test_listener_skipped_once_terminal_terminated() {
        use futures::channel::oneshot;
        use std::sync::mpsc;

        let ctx = AppContext::default();
        let s = setup(&ctx, "terminal-listen");
        let (outcome_tx, outcome_rx) = mpsc::channel();

        let (tx, rx) = oneshot::channel::<u32>();
        let out = outcome_tx.clone();
        s.terminal.listen_future_then(
            rx,
            |t, v| t.get().log.lock().push(format!("heard {}", v.unwrap_or(0))),
            move |outcome| drop(out.send(outcome)),
        );
        tx.send(7).unwrap();
        assert_eq!(outcome_rx.recv_timeout(Duration::from_secs(2)), Ok(Ok(())));
        assert!(s.log.lock().contains(&"heard 7".to_string()));

        s.terminal.terminate().wait().unwrap();
        let (tx, rx) = oneshot::channel::<u32>();
        s.terminal.listen_future_then(
            rx,
            |t, v| t.get().log.lock().push(format!("heard {}", v.unwrap_or(0))),
            move |outcome| drop(outcome_tx.send(outcome)),
        );
        tx.send(8).unwrap();
        assert_eq!(
            outcome_rx.recv_timeout(Duration::from_secs(2)),
            Ok(Err(CallError::TerminatedTerminal {
                terminal: s.terminal.label().to_string()
            }))
        );
        assert!(!s.log.lock().contains(&"heard 8".to_string()));

        s.task.stop();
        s.task.join();
    }

    #[test]
    fn test_state_timeout_skipped_after_leaving() {
        struct Plain;
        impl Behavior for Plain {}
        struct Waiting;
        impl State<Plain> for Waiting {
            fn on_entry(&self, _terminal: &mut Terminal<Plain>) {}
        }
        struct Done;
        impl State<Plain> for Done {
            fn on_entry(&self, _terminal: &mut Terminal<Plain>) {}
        }

        let ctx = AppContext::default();
        let task = Task::spawn(&ctx, "terminal-timeout", ()).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let (terminal, waiting) = task
            .with_scope(TimeLimit::no_limit(), |scope, _| {
                Ok(scope.attach(Plain, |t| (t.handle(), t.next_state(Waiting))))
            })
            .wait()
            .unwrap();

        let f = fired.clone();
        waiting.new_timeout(Duration::from_millis(60), move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let f = fired.clone();
        terminal.new_timeout(Duration::from_millis(60), move |_| {
            f.fetch_add(10, Ordering::SeqCst);
        });
        terminal.run_later(|t| drop(t.next_state(Done))).wait().unwrap();

        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(fired.load(Ordering::SeqCst), 10);
        task.stop();
        task.join();
    }
}

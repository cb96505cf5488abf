//! # Task: a thread that owns its job queue.
//!
//! A [`Task`] is a cloneable handle to one actor thread. Every interaction
//! with the actor is a closure pushed onto the task's queue followed by a
//! wakeup; the thread runs queued closures one at a time, in push order.
//! Data owned by the thread (the [`Actor`] value and the attached terminals)
//! is therefore never touched concurrently and needs no locks.
//!
//! ## Lifecycle
//! ```text
//! Created ──spawn──► Running ──stop()──► StopRequested ──epilogs left──► DrainingEpilogs
//!                                              │                               │
//!                                              └──────────────┬────────────────┘
//!                                                             ▼
//!                                                        Terminated
//! ```
//!
//! ## Rules
//! - Task names are unique within an [`AppContext`]; spawn fails with
//!   `DuplicateTaskName` otherwise.
//! - After `stop()` the task still drains its queue and waits for every
//!   registered epilog before terminating.
//! - Jobs pushed after termination are dropped, which resolves their handles
//!   with `CallError::Abandoned`.

use std::any::{Any, type_name};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam::queue::SegQueue;
use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::core::AppContext;
use crate::core::epilog::EpilogInbox;
use crate::core::runner;
use crate::core::scope::TaskScope;
use crate::error::{CallError, RuntimeError};
use crate::exec::{self, CallHandle, Deadline, Executor, Job};
use crate::exec::handle::{Completer, completion_pair};
use crate::exec::run_bounded;
use crate::messaging::{Deliver, MessageContext, ResponseHandler, Subscriber};
use crate::sync::WakeupSignal;
use crate::time::{TimeLimit, Timeout, now_millis};

/// A job as queued on a task: it gets the actor and the thread-owned scope.
pub(crate) type TaskJob = Box<dyn FnOnce(&mut dyn Any, &mut TaskScope<'_>) + Send + 'static>;

/// Task-owned state and lifecycle hooks.
///
/// The value is moved onto the task thread at spawn and dropped there at
/// termination. Hook panics are caught and logged.
pub trait Actor: Send + 'static {
    /// Runs once on the task thread before any queued job.
    fn on_start(&mut self, scope: &mut TaskScope<'_>) {
        let _ = scope;
    }

    /// Runs once, on the first poll iteration after [`Task::stop`].
    ///
    /// This is the place to register epilogs that must finish before the
    /// task terminates.
    fn on_stop_requested(&mut self, scope: &mut TaskScope<'_>) {
        let _ = scope;
    }
}

impl Actor for () {}

/// Lifecycle position of a task.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Registered, thread not started yet.
    Created = 0,
    /// Polling its queue.
    Running = 1,
    /// Stop requested; still draining jobs.
    StopRequested = 2,
    /// Stop hooks done; waiting for epilogs.
    DrainingEpilogs = 3,
    /// Thread exited and the task was deregistered.
    Terminated = 4,
}

impl TaskStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TaskStatus::Created,
            1 => TaskStatus::Running,
            2 => TaskStatus::StopRequested,
            3 => TaskStatus::DrainingEpilogs,
            _ => TaskStatus::Terminated,
        }
    }

    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Running => "running",
            TaskStatus::StopRequested => "stop_requested",
            TaskStatus::DrainingEpilogs => "draining_epilogs",
            TaskStatus::Terminated => "terminated",
        }
    }
}

pub(crate) struct TaskShared {
    pub(crate) name: String,
    pub(crate) ctx: AppContext,
    pub(crate) jobs: SegQueue<TaskJob>,
    pub(crate) signal: Arc<WakeupSignal>,
    pub(crate) epilogs: EpilogInbox,
    pub(crate) listeners: EpilogInbox,
    pub(crate) poll_interval: Duration,
    running: AtomicBool,
    status: AtomicU8,
    last_scan: AtomicI64,
    thread: OnceLock<ThreadId>,
    join: Mutex<Option<JoinHandle<()>>>,
    done_tx: Mutex<Option<oneshot::Sender<()>>>,
    done: Shared<BoxFuture<'static, ()>>,
}

/// Handle to a task.
///
/// Cheap to clone; every clone refers to the same thread and queue.
#[derive(Clone)]
pub struct Task {
    pub(crate) shared: Arc<TaskShared>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.shared.name)
            .field("status", &self.status())
            .finish()
    }
}

impl Task {
    /// Starts building a task named `name`.
    pub fn builder(name: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(name)
    }

    /// Spawns a task with default settings.
    ///
    /// # Example
    /// ```
    /// use taskmesh::{AppContext, Task};
    ///
    /// let ctx = AppContext::default();
    /// let task = Task::spawn(&ctx, "worker", ()).unwrap();
    /// let on_task = task.call_later({
    ///     let task = task.clone();
    ///     move || task.is_current()
    /// });
    /// assert_eq!(on_task.wait(), Ok(true));
    ///
    /// task.stop();
    /// task.join();
    /// ```
    pub fn spawn<A: Actor>(
        ctx: &AppContext,
        name: impl Into<String>,
        actor: A,
    ) -> Result<Task, RuntimeError> {
        TaskBuilder::new(name).spawn(ctx, actor)
    }

    /// Task name, unique within its context.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Owning application context.
    pub fn context(&self) -> &AppContext {
        &self.shared.ctx
    }

    /// Current lifecycle position.
    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.shared.status.load(Ordering::SeqCst))
    }

    pub(crate) fn set_status(&self, status: TaskStatus) {
        self.shared.status.store(status as u8, Ordering::SeqCst);
    }

    /// True while the task thread is running its loop.
    pub fn is_alive(&self) -> bool {
        matches!(
            self.status(),
            TaskStatus::Running | TaskStatus::StopRequested | TaskStatus::DrainingEpilogs
        )
    }

    /// True once [`Task::stop`] has been called.
    pub fn is_stop_requested(&self) -> bool {
        !self.shared.running.load(Ordering::SeqCst)
    }

    /// True when called from this task's own thread.
    pub fn is_current(&self) -> bool {
        self.shared.thread.get() == Some(&std::thread::current().id())
    }

    /// Thread id of the task, once started.
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.shared.thread.get().copied()
    }

    /// Wall-clock millis at the end of the last poll iteration (spawn time before the first).
    pub fn last_scan_time(&self) -> i64 {
        self.shared.last_scan.load(Ordering::Acquire)
    }

    pub(crate) fn stamp_scan(&self, now: i64) {
        self.shared.last_scan.store(now, Ordering::Release);
    }

    pub(crate) fn mark_started(&self) {
        let _ = self.shared.thread.set(std::thread::current().id());
    }

    /// Epilogs registered and not yet completed.
    pub fn pending_epilogs(&self) -> usize {
        self.shared.epilogs.outstanding()
    }

    /// Same task, by identity.
    pub fn ptr_eq(&self, other: &Task) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Wakes the task thread so it re-evaluates its queue and exit condition.
    pub fn wakeup(&self) {
        self.shared.signal.post();
    }

    /// Requests a graceful stop. Idempotent.
    pub fn stop(&self) {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            info!(task = %self.shared.name, "stop requested");
        }
        self.wakeup();
    }

    /// Keeps the task alive after `stop()` until `epilog` completes.
    ///
    /// Callable from any thread. Completion wakes the task.
    pub fn register_epilog<F>(&self, epilog: F)
    where
        F: Future + Send + 'static,
    {
        self.shared.epilogs.push(epilog.map(drop).boxed());
        self.wakeup();
    }

    /// Runs `callback` on the task thread once `future` completes.
    ///
    /// Unlike an epilog, a pending listener does not hold the task open.
    pub fn listen_future<Fut, C>(&self, future: Fut, callback: C)
    where
        Fut: Future + Send + 'static,
        C: FnOnce(Fut::Output) + Send + 'static,
    {
        self.shared
            .listeners
            .push(future.map(callback).boxed());
        self.wakeup();
    }

    /// Resolves once the task has terminated and left its context.
    pub fn terminated(&self) -> impl Future<Output = ()> + Send + 'static {
        self.shared.done.clone()
    }

    /// Blocks until the task has terminated.
    ///
    /// Returns immediately, with a warning, when called from the task itself.
    pub fn join(&self) {
        if self.is_current() {
            warn!(task = %self.shared.name, "join called from the task's own thread; ignored");
            return;
        }
        futures::executor::block_on(self.terminated());
        if let Some(handle) = self.shared.join.lock().take() {
            let _ = handle.join();
        }
    }

    // ---- Scheduling ----

    pub(crate) fn enqueue(&self, job: TaskJob) {
        self.shared.jobs.push(job);
        if self.status() == TaskStatus::Terminated {
            self.drop_queued();
        } else {
            self.wakeup();
        }
    }

    /// Drops every queued job unrun; their handles resolve as abandoned.
    pub(crate) fn drop_queued(&self) {
        while let Some(job) = self.shared.jobs.pop() {
            drop(job);
        }
    }

    pub(crate) fn schedule_scoped<R, F>(&self, limit: TimeLimit, f: F) -> CallHandle<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn Any, &mut TaskScope<'_>, &Deadline) -> Result<R, CallError>
            + Send
            + 'static,
    {
        let (completer, handle) = completion_pair(self.name());
        self.schedule_with(limit, f, completer);
        handle
    }

    pub(crate) fn schedule_scoped_then<R, F, C>(&self, limit: TimeLimit, f: F, then: C)
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn Any, &mut TaskScope<'_>, &Deadline) -> Result<R, CallError>
            + Send
            + 'static,
        C: FnOnce(Result<R, CallError>) + Send + 'static,
    {
        self.schedule_with(limit, f, Completer::new(self.name(), then));
    }

    fn schedule_with<R, F>(&self, limit: TimeLimit, f: F, completer: Completer<R>)
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn Any, &mut TaskScope<'_>, &Deadline) -> Result<R, CallError>
            + Send
            + 'static,
    {
        self.enqueue(Box::new(move |actor, scope| {
            completer.complete(run_bounded(limit, |deadline| f(actor, scope, deadline)));
        }));
    }

    /// Runs `f` on the task thread under `limit`.
    pub fn call_before<R, F>(&self, limit: TimeLimit, f: F) -> CallHandle<R>
    where
        R: Send + 'static,
        F: FnOnce(&Deadline) -> Result<R, CallError> + Send + 'static,
    {
        exec::call_before(self, limit, f)
    }

    /// Unit-result form of [`Task::call_before`].
    pub fn run_before<F>(&self, limit: TimeLimit, f: F) -> CallHandle<()>
    where
        F: FnOnce(&Deadline) -> Result<(), CallError> + Send + 'static,
    {
        exec::run_before(self, limit, f)
    }

    /// Runs `f` on the task thread without a deadline.
    pub fn call_later<R, F>(&self, f: F) -> CallHandle<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        exec::call_later(self, f)
    }

    /// Unit-result form of [`Task::call_later`].
    pub fn run_later<F>(&self, f: F) -> CallHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        exec::run_later(self, f)
    }

    /// Runs `f` on the task thread with access to its [`TaskScope`].
    pub fn with_scope<R, F>(&self, limit: TimeLimit, f: F) -> CallHandle<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut TaskScope<'_>, &Deadline) -> Result<R, CallError> + Send + 'static,
    {
        self.schedule_scoped(limit, move |_, scope, deadline| f(scope, deadline))
    }

    /// Runs `f` on the task thread with the task's actor, typed as `A`.
    ///
    /// Fails with [`CallError::ActorType`] if the task runs another actor type.
    pub fn with_actor<A, R, F>(&self, limit: TimeLimit, f: F) -> CallHandle<R>
    where
        A: Actor,
        R: Send + 'static,
        F: FnOnce(&mut A, &mut TaskScope<'_>, &Deadline) -> Result<R, CallError> + Send + 'static,
    {
        self.schedule_scoped(limit, move |actor, scope, deadline| {
            let actor = actor.downcast_mut::<A>().ok_or(CallError::ActorType {
                expected: type_name::<A>(),
            })?;
            f(actor, scope, deadline)
        })
    }

    /// Fires `f` on the task thread after `delay`.
    pub fn new_timeout<F>(&self, delay: Duration, f: F) -> Timeout
    where
        F: FnOnce() + Send + 'static,
    {
        exec::new_timeout_on(self, delay, f)
    }

    // ---- Messaging ----

    /// Subscribes `subscriber` to `filter`; deliveries run on this task.
    pub fn subscribe<Q, S>(&self, filter: &str, subscriber: Arc<S>) -> Result<(), RuntimeError>
    where
        Q: Any + Send,
        S: Subscriber<Q> + ?Sized + 'static,
    {
        self.shared.ctx.bus().register(filter, self, subscriber)
    }

    /// Removes the subscriptions of `subscriber` on this task under `filter`.
    pub fn unsubscribe<S: ?Sized>(&self, filter: &str, subscriber: &Arc<S>) -> bool {
        self.shared.ctx.bus().unregister(filter, self, subscriber)
    }

    /// Publishes a push message from this task.
    pub fn publish<Q: Any + Send>(
        &self,
        topic: &str,
        payload: Q,
        limit: TimeLimit,
    ) -> Result<MessageContext, RuntimeError> {
        self.shared.ctx.bus().publish(topic, payload, limit, self)
    }

    /// Publishes a request from this task; `handler` runs here on reply.
    pub fn request<Q, R, H>(
        &self,
        topic: &str,
        payload: Q,
        limit: TimeLimit,
        handler: H,
    ) -> Result<MessageContext, RuntimeError>
    where
        Q: Any + Send,
        R: Any + Send,
        H: ResponseHandler<R> + 'static,
    {
        self.shared
            .ctx
            .bus()
            .request(topic, payload, limit, self, handler)
    }

    // ---- Termination ----

    /// Bookkeeping after the loop exits; runs on the task thread.
    pub(crate) fn finish(&self) {
        self.set_status(TaskStatus::Terminated);
        self.drop_queued();
        self.shared.ctx.bus().remove_task(self);
        self.shared.ctx.remove_task(self);
        if let Some(tx) = self.shared.done_tx.lock().take() {
            let _ = tx.send(());
        }
        info!(task = %self.shared.name, "end of task");
    }
}

impl Executor for Task {
    fn execute(&self, job: Job) {
        self.enqueue(Box::new(move |_, _| job()));
    }

    fn name(&self) -> &str {
        &self.shared.name
    }
}

/// Reserved topic that stops the task named `name`.
pub fn stop_topic(name: &str) -> String {
    format!("task/{name}/stop")
}

/// Stops its task on any publish to the task's stop topic.
pub(crate) struct StopOnPublish {
    task: Weak<TaskShared>,
}

impl Deliver for StopOnPublish {
    fn deliver(
        &self,
        _ctx: &MessageContext,
        _payload: Box<dyn Any + Send>,
    ) -> Result<(), CallError> {
        if let Some(shared) = self.task.upgrade() {
            Task { shared }.stop();
        }
        Ok(())
    }

    fn identity(&self) -> usize {
        self as *const Self as usize
    }
}

/// Builder for [`Task`].
///
/// # Example
/// ```
/// use std::time::Duration;
/// use taskmesh::{AppContext, Task};
///
/// let ctx = AppContext::default();
/// let task = Task::builder("fast-poller")
///     .poll_interval(Duration::from_millis(50))
///     .spawn(&ctx, ())
///     .unwrap();
/// assert!(task.is_alive());
/// task.stop();
/// task.join();
/// ```
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    name: String,
    poll_interval: Option<Duration>,
    stack_size: Option<usize>,
}

impl TaskBuilder {
    /// Creates a builder for a task named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            poll_interval: None,
            stack_size: None,
        }
    }

    /// Overrides the context's poll interval for this task.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Sets the task thread's stack size in bytes.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Registers the task in `ctx`, subscribes its stop topic and starts its thread.
    pub fn spawn<A: Actor>(self, ctx: &AppContext, actor: A) -> Result<Task, RuntimeError> {
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let poll_interval = match self.poll_interval {
            Some(interval) => interval.max(Duration::from_millis(1)),
            None => ctx.config().poll_interval_clamped(),
        };

        let task = Task {
            shared: Arc::new(TaskShared {
                name: self.name.clone(),
                ctx: ctx.clone(),
                jobs: SegQueue::new(),
                signal: Arc::new(WakeupSignal::new()),
                epilogs: EpilogInbox::default(),
                listeners: EpilogInbox::default(),
                poll_interval,
                running: AtomicBool::new(true),
                status: AtomicU8::new(TaskStatus::Created as u8),
                last_scan: AtomicI64::new(now_millis()),
                thread: OnceLock::new(),
                join: Mutex::new(None),
                done_tx: Mutex::new(Some(done_tx)),
                done: done_rx.map(drop).boxed().shared(),
            }),
        };

        ctx.add_task(&task)?;

        let stop = Arc::new(StopOnPublish {
            task: Arc::downgrade(&task.shared),
        });
        if let Err(e) = ctx
            .bus()
            .register_deliver(&stop_topic(&self.name), &task, stop)
        {
            ctx.remove_task(&task);
            return Err(e);
        }

        task.set_status(TaskStatus::Running);
        let mut thread = std::thread::Builder::new().name(self.name.clone());
        if let Some(bytes) = self.stack_size {
            thread = thread.stack_size(bytes);
        }
        let worker = task.clone();
        match thread.spawn(move || runner::run(worker, actor)) {
            Ok(handle) => {
                *task.shared.join.lock() = Some(handle);
                Ok(task)
            }
            Err(e) => {
                task.finish();
                Err(RuntimeError::Spawn {
                    name: self.name,
                    error: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Config;
    use std::sync::atomic::AtomicUsize;

    fn quick_ctx() -> AppContext {
        AppContext::new(Config {
            poll_interval: Duration::from_millis(20),
            ..Config::default()
        })
    }

    #[test]
    fn test_jobs_run_in_order_on_task_thread() {
        let ctx = quick_ctx();
        let task = Task::spawn(&ctx, "fifo", ()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..50)
            .map(|i| {
                let seen = seen.clone();
                let t = task.clone();
                task.call_later(move || {
                    assert!(t.is_current());
                    seen.lock().push(i);
                    std::thread::current().id()
                })
            })
            .collect();

        let ids: Vec<_> = handles.into_iter().map(|h| h.wait().unwrap()).collect();
        assert!(ids.iter().all(|id| Some(*id) == task.thread_id()));
        assert_ne!(task.thread_id(), Some(std::thread::current().id()));
        assert_eq!(*seen.lock(), (0..50).collect::<Vec<_>>());

        task.stop();
        task.join();
        assert_eq!(task.status(), TaskStatus::Terminated);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let ctx = quick_ctx();
        let first = Task::spawn(&ctx, "twin", ()).unwrap();
        let second = Task::spawn(&ctx, "twin", ());
        assert_eq!(
            second.unwrap_err(),
            RuntimeError::DuplicateTaskName {
                name: "twin".into()
            }
        );
        first.stop();
        first.join();

        // The name is free again once the first task has terminated.
        let again = Task::spawn(&ctx, "twin", ()).unwrap();
        again.stop();
        again.join();
    }

    fn explode() {
        panic!("bad job");
    }

    #[test]
    fn test_panicking_job_does_not_kill_task() {
        let ctx = quick_ctx();
        let task = Task::spawn(&ctx, "resilient", ()).unwrap();
        task.execute(Box::new(explode));
        let r = task.call_before::<(), _>(TimeLimit::no_limit(), |_| panic!("bad call"));
        assert!(matches!(r.wait(), Err(CallError::Panicked { .. })));
        assert_eq!(task.call_later(|| 1).wait(), Ok(1));
        task.stop();
        task.join();
    }

    #[test]
    fn test_call_before_deadlines_on_task() {
        let ctx = quick_ctx();
        let task = Task::spawn(&ctx, "deadlines", ()).unwrap();

        let slow = task.call_before(TimeLimit::in_millis(60), |d| {
            d.sleep(Duration::from_millis(400))?;
            Ok(())
        });
        assert_eq!(
            slow.wait(),
            Err(CallError::DeadlineExceeded {
                already_expired: false,
                interrupted: true
            })
        );

        let fast = task.call_before(TimeLimit::in_millis(1000), |d| {
            d.sleep(Duration::from_millis(10))?;
            Ok("fast")
        });
        assert_eq!(fast.wait(), Ok("fast"));

        // Blocks the queue so the second call's limit expires while waiting.
        let blocker = task.run_later(|| std::thread::sleep(Duration::from_millis(80)));
        let invoked = Arc::new(AtomicBool::new(false));
        let i = invoked.clone();
        let starved = task.run_before(TimeLimit::in_millis(20), move |_| {
            i.store(true, Ordering::SeqCst);
            Ok(())
        });
        blocker.wait().unwrap();
        assert_eq!(
            starved.wait(),
            Err(CallError::DeadlineExceeded {
                already_expired: true,
                interrupted: false
            })
        );
        assert!(!invoked.load(Ordering::SeqCst));

        task.stop();
        task.join();
    }

    struct Counter {
        hits: usize,
    }

    impl Actor for Counter {}

    #[test]
    fn test_with_actor_mutates_owned_state() {
        let ctx = quick_ctx();
        let task = Task::spawn(&ctx, "counter", Counter { hits: 0 }).unwrap();
        for _ in 0..5 {
            drop(task.with_actor(TimeLimit::no_limit(), |c: &mut Counter, _, _| {
                c.hits += 1;
                Ok(())
            }));
        }
        let hits = task.with_actor(TimeLimit::no_limit(), |c: &mut Counter, _, _| Ok(c.hits));
        assert_eq!(hits.wait(), Ok(5));

        let wrong = task.with_actor(TimeLimit::no_limit(), |_: &mut (), _, _| Ok(()));
        assert_eq!(
            wrong.wait(),
            Err(CallError::ActorType {
                expected: type_name::<()>()
            })
        );
        task.stop();
        task.join();
    }

    struct Lifecycle {
        events: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Actor for Lifecycle {
        fn on_start(&mut self, scope: &mut TaskScope<'_>) {
            assert!(scope.task().is_current());
            self.events.lock().push("start");
        }

        fn on_stop_requested(&mut self, _scope: &mut TaskScope<'_>) {
            self.events.lock().push("stop");
        }
    }

    #[test]
    fn test_hooks_run_once_and_queue_drains_after_stop() {
        let ctx = quick_ctx();
        let events = Arc::new(Mutex::new(Vec::new()));
        let task = Task::spawn(
            &ctx,
            "hooks",
            Lifecycle {
                events: events.clone(),
            },
        )
        .unwrap();

        let drained = Arc::new(AtomicUsize::new(0));
        let blocker = task.run_later(|| std::thread::sleep(Duration::from_millis(50)));
        for _ in 0..3 {
            let d = drained.clone();
            drop(task.run_later(move || {
                d.fetch_add(1, Ordering::SeqCst);
            }));
        }
        task.stop();
        task.stop();
        blocker.wait().unwrap();
        task.join();

        assert_eq!(drained.load(Ordering::SeqCst), 3);
        assert_eq!(*events.lock(), vec!["start", "stop"]);
        assert!(!ctx.task_names().contains(&"hooks".to_string()));
    }

    #[test]
    fn test_jobs_after_termination_are_abandoned() {
        let ctx = quick_ctx();
        let task = Task::spawn(&ctx, "gone", ()).unwrap();
        task.stop();
        task.join();
        assert!(!task.is_alive());
        assert_eq!(
            task.call_later(|| 1).wait(),
            Err(CallError::Abandoned {
                task: "gone".into()
            })
        );
    }

    #[test]
    fn test_last_scan_time_advances_while_idle() {
        let ctx = quick_ctx();
        let task = Task::spawn(&ctx, "heartbeat", ()).unwrap();
        let first = task.last_scan_time();
        assert!(first > 0);
        std::thread::sleep(Duration::from_millis(100));
        assert!(task.last_scan_time() > first);
        task.stop();
        task.join();
    }

    #[test]
    fn test_listen_future_runs_on_task_thread() {
        let ctx = quick_ctx();
        let task = Task::spawn(&ctx, "listener", ()).unwrap();
        let (tx, rx) = oneshot::channel::<u32>();
        let (seen_tx, seen_rx) = std::sync::mpsc::channel();
        let t = task.clone();
        task.listen_future(rx, move |v| {
            let _ = seen_tx.send((v.ok(), t.is_current()));
        });
        tx.send(9).unwrap();
        assert_eq!(
            seen_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            (Some(9), true)
        );
        task.stop();
        task.join();
    }

    #[test]
    fn test_epilog_holds_task_until_complete() {
        let ctx = quick_ctx();
        let task = Task::spawn(&ctx, "draining", ()).unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        task.register_epilog(rx);
        task.stop();

        let waiting = std::time::Instant::now();
        while task.status() != TaskStatus::DrainingEpilogs {
            assert!(waiting.elapsed() < Duration::from_secs(2), "never drained");
            std::thread::sleep(Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_millis(100));
        assert!(task.is_alive());
        assert_eq!(task.status(), TaskStatus::DrainingEpilogs);
        assert_eq!(task.pending_epilogs(), 1);

        tx.send(()).unwrap();
        let released = std::time::Instant::now();
        task.join();
        assert!(released.elapsed() < Duration::from_millis(200));
        assert_eq!(task.status(), TaskStatus::Terminated);
        assert_eq!(task.pending_epilogs(), 0);
    }

    #[test]
    fn test_builder_options_with_unbounded_poll() {
        let ctx = quick_ctx();
        let task = Task::builder("idle")
            .poll_interval(Duration::MAX)
            .stack_size(256 * 1024)
            .spawn(&ctx, ())
            .unwrap();

        assert_eq!(task.call_later(|| 5).wait(), Ok(5));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(task.status(), TaskStatus::Running);

        let stopping = std::time::Instant::now();
        task.stop();
        task.join();
        assert!(stopping.elapsed() < Duration::from_secs(1));
        assert_eq!(task.status(), TaskStatus::Terminated);
    }
}

//! # Epilogs: futures that hold a stopping task open.
//!
//! Any thread may register an epilog with [`Task::register_epilog`](crate::Task::register_epilog);
//! it lands in a lock-free inbox. The task thread adopts inbox entries into
//! its own [`EpilogSet`] and polls them once per iteration with a waker that
//! posts the task's wakeup signal, so a completing epilog re-runs the loop
//! (and its exit check) promptly.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Waker};

use crossbeam::queue::SegQueue;
use futures::future::BoxFuture;
use futures::task::{ArcWake, waker};
use tracing::error;

use crate::error::panic_message;
use crate::sync::WakeupSignal;

/// Thread-safe landing zone for epilogs registered from anywhere.
#[derive(Default)]
pub(crate) struct EpilogInbox {
    queue: SegQueue<BoxFuture<'static, ()>>,
    outstanding: AtomicUsize,
}

impl EpilogInbox {
    pub(crate) fn push(&self, epilog: BoxFuture<'static, ()>) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        self.queue.push(epilog);
    }

    /// Epilogs registered and not yet completed.
    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

struct SignalWaker(Arc<WakeupSignal>);

impl ArcWake for SignalWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.post();
    }
}

/// Epilogs owned by the task thread.
pub(crate) struct EpilogSet {
    pending: Vec<BoxFuture<'static, ()>>,
    waker: Waker,
}

impl EpilogSet {
    pub(crate) fn new(signal: Arc<WakeupSignal>) -> Self {
        Self {
            pending: Vec::new(),
            waker: waker(Arc::new(SignalWaker(signal))),
        }
    }

    pub(crate) fn adopt(&mut self, inbox: &EpilogInbox) {
        while let Some(epilog) = inbox.queue.pop() {
            self.pending.push(epilog);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Polls every epilog once and drops the completed ones.
    pub(crate) fn poll(&mut self, task: &str, inbox: &EpilogInbox) {
        let mut cx = Context::from_waker(&self.waker);
        let before = self.pending.len();
        self.pending.retain_mut(|epilog| {
            match catch_unwind(AssertUnwindSafe(|| epilog.as_mut().poll(&mut cx))) {
                Ok(poll) => poll.is_pending(),
                Err(panic) => {
                    error!(task, error = %panic_message(panic.as_ref()), "epilog panicked");
                    false
                }
            }
        });
        let done = before - self.pending.len();
        if done > 0 {
            inbox.outstanding.fetch_sub(done, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use futures::channel::oneshot;

    #[test]
    fn test_completion_posts_signal_and_prunes() {
        let signal = Arc::new(WakeupSignal::new());
        let inbox = EpilogInbox::default();
        let mut set = EpilogSet::new(signal.clone());

        let (tx, rx) = oneshot::channel::<()>();
        inbox.push(rx.map(drop).boxed());
        inbox.push(async {}.boxed());
        assert_eq!(inbox.outstanding(), 2);

        set.adopt(&inbox);
        set.poll("t", &inbox);
        assert_eq!(inbox.outstanding(), 1);
        assert!(!set.is_empty());
        assert!(!signal.is_posted());

        tx.send(()).unwrap();
        assert!(signal.is_posted());
        set.poll("t", &inbox);
        assert!(set.is_empty());
        assert_eq!(inbox.outstanding(), 0);
    }

    fn explode() {
        panic!("bad epilog");
    }

    #[test]
    fn test_panicking_epilog_is_dropped() {
        let inbox = EpilogInbox::default();
        let mut set = EpilogSet::new(Arc::new(WakeupSignal::new()));
        inbox.push(async { explode() }.boxed());
        set.adopt(&inbox);
        set.poll("t", &inbox);
        assert!(set.is_empty());
        assert_eq!(inbox.outstanding(), 0);
    }
}

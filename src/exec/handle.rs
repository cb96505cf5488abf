//! # Result handles for scheduled calls.
//!
//! [`CallHandle`] is the caller's side of a call scheduled onto an executor.
//! It is a [`Future`] and can also be waited on synchronously.
//!
//! [`Completer`] is the executing side. It resolves exactly once: either with
//! the call's outcome, or with [`CallError::Abandoned`] if the job is dropped
//! without running (for example because its task already terminated).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::channel::oneshot;

use crate::error::CallError;

type OnDone<R> = Box<dyn FnOnce(Result<R, CallError>) + Send>;

/// Resolves a scheduled call exactly once, even if dropped unrun.
pub(crate) struct Completer<R> {
    origin: Arc<str>,
    on_done: Option<OnDone<R>>,
}

impl<R> Completer<R> {
    pub(crate) fn new<F>(origin: &str, on_done: F) -> Self
    where
        F: FnOnce(Result<R, CallError>) + Send + 'static,
    {
        Self {
            origin: Arc::from(origin),
            on_done: Some(Box::new(on_done)),
        }
    }

    pub(crate) fn complete(mut self, outcome: Result<R, CallError>) {
        if let Some(f) = self.on_done.take() {
            f(outcome);
        }
    }
}

impl<R> Drop for Completer<R> {
    fn drop(&mut self) {
        if let Some(f) = self.on_done.take() {
            f(Err(CallError::Abandoned {
                task: self.origin.to_string(),
            }));
        }
    }
}

/// Creates a connected completer / handle pair.
pub(crate) fn completion_pair<R: Send + 'static>(origin: &str) -> (Completer<R>, CallHandle<R>) {
    let (tx, rx) = oneshot::channel();
    let completer = Completer::new(origin, move |outcome| {
        let _ = tx.send(outcome);
    });
    let handle = CallHandle {
        rx,
        origin: Arc::from(origin),
    };
    (completer, handle)
}

/// Outcome of a call scheduled on an executor.
///
/// Resolves with the callable's value or one [`CallError`].
///
/// # Note
/// Never [`wait`](CallHandle::wait) on a handle from the thread of the task
/// that is supposed to run the call; the task would block on itself.
#[must_use = "a CallHandle does nothing unless awaited or waited on"]
pub struct CallHandle<R> {
    rx: oneshot::Receiver<Result<R, CallError>>,
    origin: Arc<str>,
}

impl<R> CallHandle<R> {
    /// Blocks the current thread until the call resolves.
    pub fn wait(self) -> Result<R, CallError> {
        futures::executor::block_on(self)
    }

    /// Returns the outcome if already resolved, without blocking.
    pub fn try_take(&mut self) -> Option<Result<R, CallError>> {
        match self.rx.try_recv() {
            Ok(Some(outcome)) => Some(outcome),
            Ok(None) => None,
            Err(_) => Some(Err(self.abandoned())),
        }
    }

    fn abandoned(&self) -> CallError {
        CallError::Abandoned {
            task: self.origin.to_string(),
        }
    }
}

impl<R> Future for CallHandle<R> {
    type Output = Result<R, CallError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(this.abandoned())),
            Poll::Pending => Poll::Pending,
        }
    }
}

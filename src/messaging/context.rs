//! # Per-publish message context.
//!
//! Every publish creates one [`MessageContext`]. The publisher gets one view
//! of it back; the subscriber gets another, which additionally carries the
//! right to reply.
//!
//! ```text
//! publisher ──publish──► bus ──deliver (bounded, subscriber task)──► Subscriber::on_publish
//!     ▲                                                              │
//!     │                                                   ctx.reply(value)
//!     └──── ResponseHandler::on_response (bounded, publisher task) ◄─┘
//!
//! completion = delivery            (push)
//! completion = delivery ∧ response (request; a failing delivery fails the response)
//! ```
//!
//! ## Rules
//! - Only the first `reply` on a request counts; replies on a push are ignored.
//! - When every subscriber-side clone is dropped without a reply, the
//!   response fails with [`CallError::NoReply`].

use std::any::{Any, type_name};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::{self, BoxFuture, Shared};
use parking_lot::Mutex;
use tracing::debug;

use crate::core::Task;
use crate::error::CallError;
use crate::exec::call_before_then;
use crate::time::{TimeLimit, now_millis};

/// Shared, cloneable outcome of a publish.
pub type Completion = Shared<BoxFuture<'static, Result<(), CallError>>>;

type Outcome = Result<(), CallError>;

/// Whether a publish expects a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Published with a response handler; expects one reply.
    Request,
    /// Fire and forget.
    Push,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MessageKind::Request => "request",
            MessageKind::Push => "push",
        })
    }
}

/// Receives the reply to a request, on the publishing task.
///
/// Implemented for any `Fn(&MessageContext, R) -> Result<(), CallError>`.
pub trait ResponseHandler<R>: Send + Sync {
    /// Handles the reply. An error fails the request's completion.
    fn on_response(&self, ctx: &MessageContext, response: R) -> Result<(), CallError>;
}

impl<R, F> ResponseHandler<R> for F
where
    F: Fn(&MessageContext, R) -> Result<(), CallError> + Send + Sync,
{
    fn on_response(&self, ctx: &MessageContext, response: R) -> Result<(), CallError> {
        self(ctx, response)
    }
}

pub(crate) trait Respond: Send + Sync {
    fn respond(&self, ctx: &MessageContext, value: Box<dyn Any + Send>) -> Outcome;
}

pub(crate) struct TypedResponder<R, H> {
    handler: H,
    _response: PhantomData<fn(R)>,
}

impl<R, H> TypedResponder<R, H> {
    pub(crate) fn new(handler: H) -> Self {
        Self {
            handler,
            _response: PhantomData,
        }
    }
}

impl<R, H> Respond for TypedResponder<R, H>
where
    R: Any + Send,
    H: ResponseHandler<R>,
{
    fn respond(&self, ctx: &MessageContext, value: Box<dyn Any + Send>) -> Outcome {
        let value = value.downcast::<R>().map_err(|_| CallError::PayloadType {
            expected: type_name::<R>(),
        })?;
        self.handler.on_response(ctx, *value)
    }
}

/// Sender of the response outcome; dropping it unused means no reply.
pub(crate) struct ReplySlot {
    tx: Mutex<Option<oneshot::Sender<Outcome>>>,
}

impl ReplySlot {
    fn take(&self) -> Option<oneshot::Sender<Outcome>> {
        self.tx.lock().take()
    }

    /// Fails the response unless a reply already claimed it.
    pub(crate) fn fail(&self, error: CallError) {
        if let Some(tx) = self.take() {
            let _ = tx.send(Err(error));
        }
    }
}

struct ContextInner {
    kind: MessageKind,
    topic: String,
    publisher: Task,
    limit: TimeLimit,
    published_at: i64,
    responder: Option<Arc<dyn Respond>>,
    response: Completion,
    completion: Completion,
}

/// State of one publish, shared by the publisher and the subscriber.
#[derive(Clone)]
pub struct MessageContext {
    inner: Arc<ContextInner>,
    reply: Option<Arc<ReplySlot>>,
}

/// Subscriber-side pieces handed to the bus by [`MessageContext::open`].
pub(crate) struct Delivery {
    /// Context given to the subscriber (carries the reply slot).
    pub(crate) ctx: MessageContext,
    /// Resolves the delivery half of the completion.
    pub(crate) done: oneshot::Sender<Outcome>,
}

impl MessageContext {
    /// Creates the publisher view and the delivery side of a new publish.
    pub(crate) fn open(
        topic: &str,
        publisher: &Task,
        limit: TimeLimit,
        responder: Option<Arc<dyn Respond>>,
    ) -> (MessageContext, Delivery) {
        let kind = if responder.is_some() {
            MessageKind::Request
        } else {
            MessageKind::Push
        };

        let (done_tx, done_rx) = oneshot::channel::<Outcome>();
        let abandoned = publisher.name().to_owned();
        let delivered = done_rx
            .map(move |r| r.unwrap_or_else(|_| Err(CallError::Abandoned { task: abandoned })))
            .boxed()
            .shared();

        let (slot, response) = match kind {
            MessageKind::Push => (None, future::ready(Ok(())).boxed().shared()),
            MessageKind::Request => {
                let (tx, rx) = oneshot::channel::<Outcome>();
                let topic = topic.to_owned();
                let response = rx
                    .map(move |r| r.unwrap_or_else(|_| Err(CallError::NoReply { topic })))
                    .boxed()
                    .shared();
                let slot = Arc::new(ReplySlot {
                    tx: Mutex::new(Some(tx)),
                });
                (Some(slot), response)
            }
        };

        let completion = match kind {
            MessageKind::Push => delivered,
            MessageKind::Request => future::try_join(delivered, response.clone())
                .map(|r| r.map(drop))
                .boxed()
                .shared(),
        };

        let inner = Arc::new(ContextInner {
            kind,
            topic: topic.to_owned(),
            publisher: publisher.clone(),
            limit,
            published_at: now_millis(),
            responder,
            response,
            completion,
        });

        let publisher_view = MessageContext {
            inner: inner.clone(),
            reply: None,
        };
        let delivery = Delivery {
            ctx: MessageContext { inner, reply: slot },
            done: done_tx,
        };
        (publisher_view, delivery)
    }

    /// Replies to a request.
    ///
    /// Schedules the publisher's response handler on the publishing task
    /// under the message's limit. Returns `false`, doing nothing, on a push,
    /// on the publisher's own view, or when a reply was already sent.
    pub fn reply<R: Any + Send>(&self, response: R) -> bool {
        let (Some(slot), Some(responder)) = (&self.reply, &self.inner.responder) else {
            return false;
        };
        let Some(tx) = slot.take() else {
            debug!(topic = %self.inner.topic, "duplicate reply ignored");
            return false;
        };

        let responder = responder.clone();
        let ctx = MessageContext {
            inner: self.inner.clone(),
            reply: None,
        };
        let value: Box<dyn Any + Send> = Box::new(response);
        call_before_then(
            &self.inner.publisher,
            self.inner.limit,
            move |_| responder.respond(&ctx, value),
            move |outcome| {
                let _ = tx.send(outcome);
            },
        );
        true
    }

    pub(crate) fn reply_slot(&self) -> Option<Arc<ReplySlot>> {
        self.reply.clone()
    }

    /// Request or push.
    pub fn kind(&self) -> MessageKind {
        self.inner.kind
    }

    /// True for a request.
    pub fn is_request(&self) -> bool {
        self.inner.kind == MessageKind::Request
    }

    /// Topic the message was published on.
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Publishing task.
    pub fn publisher(&self) -> &Task {
        &self.inner.publisher
    }

    /// Limit applied to the delivery and to the reply.
    pub fn limit(&self) -> TimeLimit {
        self.inner.limit
    }

    /// Wall-clock millis at which the publish was made.
    pub fn publish_time(&self) -> i64 {
        self.inner.published_at
    }

    /// Resolves when the reply has been handled (or failed).
    ///
    /// Resolves `Ok` at once for a push.
    pub fn response(&self) -> impl Future<Output = Result<(), CallError>> + Send + 'static {
        self.inner.response.clone()
    }

    /// Resolves when the whole publish is done.
    pub fn completion(&self) -> Completion {
        self.inner.completion.clone()
    }

    /// True once the completion has resolved.
    pub fn is_done(&self) -> bool {
        self.inner.completion.peek().is_some()
    }

    /// Blocks until the publish completes.
    ///
    /// Never call this on the publishing task for a request: the reply
    /// handler needs that thread.
    pub fn join(&self) -> Result<(), CallError> {
        futures::executor::block_on(self.completion())
    }
}

impl fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageContext")
            .field("kind", &self.inner.kind)
            .field("topic", &self.inner.topic)
            .field("publisher", &self.inner.publisher.name())
            .field("limit", &self.inner.limit)
            .finish()
    }
}

impl fmt::Display for MessageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.inner.kind, self.inner.topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AppContext, Config};
    use std::time::Duration;

    fn quick_task(name: &str) -> (AppContext, Task) {
        let ctx = AppContext::new(Config {
            poll_interval: Duration::from_millis(20),
            ..Config::default()
        });
        let task = Task::spawn(&ctx, name, ()).unwrap();
        (ctx, task)
    }

    #[test]
    fn test_push_completion_follows_delivery() {
        let (_ctx, task) = quick_task("push");
        let (view, delivery) = MessageContext::open("a/b", &task, TimeLimit::no_limit(), None);
        assert_eq!(view.kind(), MessageKind::Push);
        assert!(!delivery.ctx.reply(1u8));
        assert!(!view.is_done());

        delivery.done.send(Ok(())).unwrap();
        assert_eq!(view.join(), Ok(()));
        assert!(view.is_done());
        task.stop();
        task.join();
    }

    #[test]
    fn test_dropped_request_resolves_no_reply() {
        let (_ctx, task) = quick_task("forgotten");
        let responder: Arc<dyn Respond> = Arc::new(TypedResponder::<String, _>::new(
            |_: &MessageContext, _: String| -> Result<(), CallError> { Ok(()) },
        ));
        let (view, delivery) =
            MessageContext::open("q", &task, TimeLimit::no_limit(), Some(responder));
        assert!(view.is_request());
        assert!(!view.reply("self".to_string()));

        let Delivery { ctx, done } = delivery;
        done.send(Ok(())).unwrap();
        drop(ctx);
        assert_eq!(
            view.join(),
            Err(CallError::NoReply { topic: "q".into() })
        );
        task.stop();
        task.join();
    }

    #[test]
    fn test_wrong_reply_type_fails_response() {
        let (_ctx, task) = quick_task("typed");
        let responder: Arc<dyn Respond> = Arc::new(TypedResponder::<String, _>::new(
            |_: &MessageContext, _: String| -> Result<(), CallError> { Ok(()) },
        ));
        let (view, delivery) =
            MessageContext::open("q", &task, TimeLimit::in_millis(2000), Some(responder));
        assert!(delivery.ctx.reply(42u64));
        assert!(!delivery.ctx.reply("late".to_string()));
        delivery.done.send(Ok(())).unwrap();
        assert_eq!(
            futures::executor::block_on(view.response()),
            Err(CallError::PayloadType {
                expected: type_name::<String>()
            })
        );
        task.stop();
        task.join();
    }
}

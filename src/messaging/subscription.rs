//! # Subscriptions: a filter bound to a (task, subscriber) pair.
//!
//! The bus stores payload-erased deliverers; [`Subscriber`] is the typed
//! face user code implements. A typed subscriber receiving a payload of
//! another type fails that delivery with [`CallError::PayloadType`].

use std::any::{Any, type_name};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::core::Task;
use crate::error::CallError;
use crate::messaging::{MessageContext, TopicFilter};

/// Receives publishes on the task it was subscribed with.
///
/// Implemented for any `Fn(&MessageContext, Q) -> Result<(), CallError>`.
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use taskmesh::{AppContext, CallError, MessageContext, Task, TimeLimit};
///
/// let ctx = AppContext::default();
/// let task = Task::spawn(&ctx, "echo", ()).unwrap();
/// task.subscribe::<String, _>(
///     "echo/+",
///     Arc::new(|msg: &MessageContext, text: String| -> Result<(), CallError> {
///         msg.reply(text);
///         Ok(())
///     }),
/// )
/// .unwrap();
///
/// let push = task.publish("echo/one", "hi".to_string(), TimeLimit::in_millis(1000)).unwrap();
/// assert_eq!(push.join(), Ok(()));
/// task.stop();
/// task.join();
/// ```
pub trait Subscriber<Q>: Send + Sync {
    /// Handles one publish. An error fails the publish's completion.
    fn on_publish(&self, ctx: &MessageContext, payload: Q) -> Result<(), CallError>;
}

impl<Q, F> Subscriber<Q> for F
where
    F: Fn(&MessageContext, Q) -> Result<(), CallError> + Send + Sync,
{
    fn on_publish(&self, ctx: &MessageContext, payload: Q) -> Result<(), CallError> {
        self(ctx, payload)
    }
}

/// Payload-erased receiving end stored by the bus.
pub(crate) trait Deliver: Send + Sync {
    fn deliver(&self, ctx: &MessageContext, payload: Box<dyn Any + Send>)
    -> Result<(), CallError>;

    /// Address of the user subscriber; used to match unregistrations.
    fn identity(&self) -> usize;
}

/// Adapts a typed [`Subscriber`] to [`Deliver`].
pub(crate) struct Typed<Q, S: ?Sized> {
    subscriber: Arc<S>,
    _payload: PhantomData<fn(Q)>,
}

impl<Q, S: ?Sized> Typed<Q, S> {
    pub(crate) fn new(subscriber: Arc<S>) -> Self {
        Self {
            subscriber,
            _payload: PhantomData,
        }
    }
}

/// Identity of the value behind an `Arc`, metadata discarded.
pub(crate) fn identity_of<S: ?Sized>(subscriber: &Arc<S>) -> usize {
    Arc::as_ptr(subscriber) as *const () as usize
}

impl<Q, S> Deliver for Typed<Q, S>
where
    Q: Any + Send,
    S: Subscriber<Q> + ?Sized,
{
    fn deliver(
        &self,
        ctx: &MessageContext,
        payload: Box<dyn Any + Send>,
    ) -> Result<(), CallError> {
        let payload = payload.downcast::<Q>().map_err(|_| CallError::PayloadType {
            expected: type_name::<Q>(),
        })?;
        self.subscriber.on_publish(ctx, *payload)
    }

    fn identity(&self) -> usize {
        identity_of(&self.subscriber)
    }
}

/// One registration in the bus.
#[derive(Clone)]
pub struct Subscription {
    filter: TopicFilter,
    task: Task,
    deliver: Arc<dyn Deliver>,
}

impl Subscription {
    pub(crate) fn new(filter: TopicFilter, task: Task, deliver: Arc<dyn Deliver>) -> Self {
        Self {
            filter,
            task,
            deliver,
        }
    }

    /// The filter this subscription was registered under.
    pub fn filter(&self) -> &TopicFilter {
        &self.filter
    }

    /// Task deliveries run on.
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Whether `topic` is delivered to this subscription.
    pub fn matches(&self, topic: &str) -> bool {
        self.filter.matches(topic)
    }

    pub(crate) fn deliverer(&self) -> &Arc<dyn Deliver> {
        &self.deliver
    }

    pub(crate) fn is(&self, task: &Task, identity: usize) -> bool {
        self.task.ptr_eq(task) && self.deliver.identity() == identity
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("filter", &self.filter.as_str())
            .field("task", &self.task.name())
            .finish()
    }
}

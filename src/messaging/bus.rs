//! # Messaging bus.
//!
//! Maps filter strings to subscriptions and routes each publish to exactly
//! one matching subscription.
//!
//! ## Architecture
//! ```text
//! register / unregister ──► write lock ──► clone map ──► mutate ──► swap pointer
//!
//! publish(topic) ──► load snapshot (no lock)
//!                      ├─► union of subscriptions whose filter matches
//!                      ├─► none ─► Err(InvalidTopic)
//!                      ├─► pick counter[(publisher, topic)] % matches
//!                      └─► deliver on the chosen task under the limit
//! ```
//!
//! ## Rules
//! - Readers never lock; a publish sees the map as it was when it loaded it.
//! - Subscriptions are keyed by the exact filter string. Two filters with the
//!   same meaning are separate keys.
//! - Round robin is approximate: counters survive subscription churn.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::core::Task;
use crate::error::RuntimeError;
use crate::exec::call_before_then;
use crate::messaging::context::{Delivery, Respond, TypedResponder};
use crate::messaging::subscription::{Deliver, Typed, identity_of};
use crate::messaging::{MessageContext, ResponseHandler, Subscriber, Subscription, TopicFilter};
use crate::time::TimeLimit;

#[derive(Clone)]
struct FilterEntry {
    filter: TopicFilter,
    subscriptions: Vec<Subscription>,
}

type SubscriptionMap = BTreeMap<String, FilterEntry>;

/// Copy-on-write pub/sub table shared by the tasks of one context.
pub struct MessagingBus {
    subscriptions: ArcSwap<SubscriptionMap>,
    write: Mutex<()>,
    counters: DashMap<(String, String), u64>,
}

impl Default for MessagingBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessagingBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self {
            subscriptions: ArcSwap::from_pointee(SubscriptionMap::new()),
            write: Mutex::new(()),
            counters: DashMap::new(),
        }
    }

    /// Subscribes `subscriber` under `filter`; deliveries run on `task`.
    pub fn register<Q, S>(
        &self,
        filter: &str,
        task: &Task,
        subscriber: Arc<S>,
    ) -> Result<(), RuntimeError>
    where
        Q: Any + Send,
        S: Subscriber<Q> + ?Sized + 'static,
    {
        self.register_deliver(filter, task, Arc::new(Typed::<Q, S>::new(subscriber)))
    }

    /// Removes the subscriptions of `subscriber` on `task` under `filter`.
    ///
    /// Returns whether anything was removed.
    pub fn unregister<S: ?Sized>(&self, filter: &str, task: &Task, subscriber: &Arc<S>) -> bool {
        self.unregister_deliver(filter, task, identity_of(subscriber))
    }

    pub(crate) fn register_deliver(
        &self,
        filter: &str,
        task: &Task,
        deliver: Arc<dyn Deliver>,
    ) -> Result<(), RuntimeError> {
        let parsed = TopicFilter::new(filter)?;
        self.update(|map| {
            map.entry(filter.to_owned())
                .or_insert_with(|| FilterEntry {
                    filter: parsed.clone(),
                    subscriptions: Vec::new(),
                })
                .subscriptions
                .push(Subscription::new(parsed, task.clone(), deliver));
        });
        debug!(filter, task = %task.name(), "subscription added");
        Ok(())
    }

    pub(crate) fn unregister_deliver(&self, filter: &str, task: &Task, identity: usize) -> bool {
        let removed = self.update(|map| {
            let Some(entry) = map.get_mut(filter) else {
                return 0;
            };
            let before = entry.subscriptions.len();
            entry.subscriptions.retain(|s| !s.is(task, identity));
            let removed = before - entry.subscriptions.len();
            if entry.subscriptions.is_empty() {
                map.remove(filter);
            }
            removed
        });
        if removed > 0 {
            debug!(filter, task = %task.name(), removed, "subscription removed");
        }
        removed > 0
    }

    /// Drops every subscription delivering to `task`.
    pub(crate) fn remove_task(&self, task: &Task) -> usize {
        let removed = self.update(|map| {
            let mut removed = 0;
            map.retain(|_, entry| {
                let before = entry.subscriptions.len();
                entry.subscriptions.retain(|s| !s.task().ptr_eq(task));
                removed += before - entry.subscriptions.len();
                !entry.subscriptions.is_empty()
            });
            removed
        });
        self.counters.retain(|(publisher, _), _| publisher != task.name());
        if removed > 0 {
            debug!(task = %task.name(), removed, "task subscriptions removed");
        }
        removed
    }

    fn update<T>(&self, f: impl FnOnce(&mut SubscriptionMap) -> T) -> T {
        let _write = self.write.lock();
        let mut map = SubscriptionMap::clone(&self.subscriptions.load());
        let out = f(&mut map);
        self.subscriptions.store(Arc::new(map));
        out
    }

    /// Snapshot of every subscription whose filter matches `topic`.
    pub fn subscriptions_for(&self, topic: &str) -> Vec<Subscription> {
        self.subscriptions
            .load()
            .values()
            .filter(|e| e.filter.matches(topic))
            .flat_map(|e| e.subscriptions.iter().cloned())
            .collect()
    }

    /// Registered filter strings, sorted.
    pub fn filters(&self) -> Vec<String> {
        self.subscriptions.load().keys().cloned().collect()
    }

    /// Pushes `payload` to one subscription matching `topic`.
    pub fn publish<Q: Any + Send>(
        &self,
        topic: &str,
        payload: Q,
        limit: TimeLimit,
        publisher: &Task,
    ) -> Result<MessageContext, RuntimeError> {
        self.dispatch(topic, Box::new(payload), limit, publisher, None)
    }

    /// Sends `payload` as a request; `handler` runs on `publisher` on reply.
    pub fn request<Q, R, H>(
        &self,
        topic: &str,
        payload: Q,
        limit: TimeLimit,
        publisher: &Task,
        handler: H,
    ) -> Result<MessageContext, RuntimeError>
    where
        Q: Any + Send,
        R: Any + Send,
        H: ResponseHandler<R> + 'static,
    {
        let responder: Arc<dyn Respond> = Arc::new(TypedResponder::<R, H>::new(handler));
        self.dispatch(topic, Box::new(payload), limit, publisher, Some(responder))
    }

    fn dispatch(
        &self,
        topic: &str,
        payload: Box<dyn Any + Send>,
        limit: TimeLimit,
        publisher: &Task,
        responder: Option<Arc<dyn Respond>>,
    ) -> Result<MessageContext, RuntimeError> {
        let matched = self.subscriptions_for(topic);
        if matched.is_empty() {
            return Err(RuntimeError::InvalidTopic {
                topic: topic.to_owned(),
            });
        }

        let turn = {
            let mut counter = self
                .counters
                .entry((publisher.name().to_owned(), topic.to_owned()))
                .or_insert(0);
            let turn = *counter;
            *counter += 1;
            turn
        };
        let index = usize::try_from(turn % matched.len() as u64).unwrap_or_default();
        let target = &matched[index];

        let (view, Delivery { ctx, done }) =
            MessageContext::open(topic, publisher, limit, responder);
        debug!(
            topic,
            kind = %view.kind(),
            publisher = %publisher.name(),
            subscriber = %target.task().name(),
            "publish"
        );

        let deliver = target.deliverer().clone();
        let slot = ctx.reply_slot();
        call_before_then(
            target.task(),
            limit,
            move |_| deliver.deliver(&ctx, payload),
            move |outcome| {
                if let (Err(e), Some(slot)) = (&outcome, &slot) {
                    slot.fail(e.clone());
                }
                let _ = done.send(outcome);
            },
        );
        Ok(view)
    }
}

impl std::fmt::Debug for MessagingBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingBus")
            .field("filters", &self.filters())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AppContext, Config, stop_topic};
    use crate::error::CallError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn quick_ctx() -> AppContext {
        AppContext::new(Config {
            poll_interval: Duration::from_millis(20),
            ..Config::default()
        })
    }

    struct Tally {
        received: AtomicUsize,
        on: Mutex<Vec<String>>,
    }

    impl Tally {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                received: AtomicUsize::new(0),
                on: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.received.load(Ordering::SeqCst)
        }
    }

    impl Subscriber<String> for Tally {
        fn on_publish(&self, ctx: &MessageContext, _payload: String) -> Result<(), CallError> {
            self.received.fetch_add(1, Ordering::SeqCst);
            self.on.lock().push(ctx.topic().to_owned());
            Ok(())
        }
    }

    fn stop_all(tasks: &[&Task]) {
        for t in tasks {
            t.stop();
        }
        for t in tasks {
            t.join();
        }
    }

    #[test]
    fn test_unregister_then_publish_is_invalid_topic() {
        let ctx = quick_ctx();
        let task = Task::spawn(&ctx, "registrar", ()).unwrap();
        let sub = Tally::new();

        task.subscribe::<String, _>("registered", sub.clone()).unwrap();
        task.publish("registered", "one".to_string(), TimeLimit::in_millis(5000))
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(sub.count(), 1);

        assert!(task.unsubscribe("registered", &sub));
        assert!(!task.unsubscribe("registered", &sub));
        let err = task
            .publish("registered", "two".to_string(), TimeLimit::in_millis(5000))
            .unwrap_err();
        assert_eq!(
            err,
            RuntimeError::InvalidTopic {
                topic: "registered".into()
            }
        );
        assert!(!ctx.bus().filters().contains(&"registered".to_string()));
        stop_all(&[&task]);
    }

    #[test]
    fn test_invalid_filter_rejected_before_registration() {
        let ctx = quick_ctx();
        let task = Task::spawn(&ctx, "strict", ()).unwrap();
        let before = ctx.bus().filters();
        let err = task.subscribe::<String, _>("a/b#", Tally::new()).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidTopicFilter { .. }));
        assert_eq!(ctx.bus().filters(), before);
        stop_all(&[&task]);
    }

    #[test]
    fn test_request_reply_round_trip() {
        let ctx = quick_ctx();
        let server = Task::spawn(&ctx, "server", ()).unwrap();
        let client = Task::spawn(&ctx, "client", ()).unwrap();

        let server_thread = server.clone();
        server
            .subscribe::<String, _>(
                "test/nominal/string",
                Arc::new(move |msg: &MessageContext, payload: String| -> Result<(), CallError> {
                    assert!(server_thread.is_current());
                    assert_eq!(payload, "foo");
                    assert!(msg.reply("bar".to_string()));
                    Ok(())
                }),
            )
            .unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let client_thread = client.clone();
        let msg = client
            .request::<String, String, _>(
                "test/nominal/string",
                "foo".to_string(),
                TimeLimit::in_millis(5000),
                move |msg: &MessageContext, reply: String| -> Result<(), CallError> {
                    assert!(client_thread.is_current());
                    assert_eq!(msg.topic(), "test/nominal/string");
                    tx.send(reply).unwrap();
                    Ok(())
                },
            )
            .unwrap();

        assert!(msg.is_request());
        assert_eq!(msg.join(), Ok(()));
        assert!(msg.is_done());
        assert_eq!(rx.try_recv().unwrap(), "bar");
        stop_all(&[&server, &client]);
    }

    #[test]
    fn test_push_completes_on_delivery() {
        let ctx = quick_ctx();
        let task = Task::spawn(&ctx, "pusher", ()).unwrap();
        let sub = Tally::new();
        task.subscribe::<String, _>("test/nominal/string", sub.clone())
            .unwrap();
        let msg = task
            .publish("test/nominal/string", "foo".to_string(), TimeLimit::in_millis(5000))
            .unwrap();
        assert_eq!(msg.kind(), crate::messaging::MessageKind::Push);
        assert_eq!(msg.join(), Ok(()));
        assert_eq!(sub.count(), 1);
        stop_all(&[&task]);
    }

    #[test]
    fn test_round_robin_over_fixed_set() {
        let ctx = quick_ctx();
        let first = Task::spawn(&ctx, "the-task", ()).unwrap();
        let second = Task::spawn(&ctx, "the-second-task", ()).unwrap();
        let (s1, s2, s3) = (Tally::new(), Tally::new(), Tally::new());
        first.subscribe::<String, _>("#", s1.clone()).unwrap();
        first.subscribe::<String, _>("+/matching/topic", s2.clone()).unwrap();
        second.subscribe::<String, _>("the/#", s3.clone()).unwrap();

        for _ in 0..6 {
            first
                .publish("the/matching/topic", "push".to_string(), TimeLimit::in_millis(5000))
                .unwrap()
                .join()
                .unwrap();
        }
        assert_eq!((s1.count(), s2.count(), s3.count()), (2, 2, 2));

        assert!(first.unsubscribe("#", &s1));
        assert!(first.unsubscribe("+/matching/topic", &s2));
        // Wrong task: s1 was never subscribed on the second task.
        assert!(!second.unsubscribe("#", &s1));
        stop_all(&[&first, &second]);
    }

    #[test]
    fn test_payload_type_mismatch_fails_delivery() {
        let ctx = quick_ctx();
        let task = Task::spawn(&ctx, "typed", ()).unwrap();
        let sub = Tally::new();
        task.subscribe::<String, _>("typed/topic", sub.clone()).unwrap();

        let msg = task
            .publish("typed/topic", 7u32, TimeLimit::in_millis(5000))
            .unwrap();
        assert_eq!(
            msg.join(),
            Err(CallError::PayloadType {
                expected: std::any::type_name::<String>()
            })
        );
        assert_eq!(sub.count(), 0);
        stop_all(&[&task]);
    }

    #[test]
    fn test_failed_delivery_fails_request_promptly() {
        let ctx = quick_ctx();
        let task = Task::spawn(&ctx, "failing", ()).unwrap();
        task.subscribe::<String, _>(
            "fail",
            Arc::new(|_: &MessageContext, _: String| -> Result<(), CallError> {
                Err(CallError::failed("no capacity"))
            }),
        )
        .unwrap();

        let msg = task
            .request::<String, String, _>(
                "fail",
                "x".to_string(),
                TimeLimit::in_millis(60_000),
                |_: &MessageContext, _: String| -> Result<(), CallError> { Ok(()) },
            )
            .unwrap();
        assert_eq!(msg.join(), Err(CallError::failed("no capacity")));
        assert_eq!(
            futures::executor::block_on(msg.response()),
            Err(CallError::failed("no capacity"))
        );
        stop_all(&[&task]);
    }

    #[test]
    fn test_stop_topic_stops_task_and_subscriptions_leave_with_it() {
        let ctx = quick_ctx();
        let target = Task::spawn(&ctx, "target", ()).unwrap();
        let caller = Task::spawn(&ctx, "caller", ()).unwrap();
        target
            .subscribe::<String, _>("target/inbox", Tally::new())
            .unwrap();
        assert!(ctx.bus().filters().contains(&stop_topic("target")));

        caller
            .publish(&stop_topic("target"), (), TimeLimit::in_millis(5000))
            .unwrap();
        target.join();

        let filters = ctx.bus().filters();
        assert!(!filters.contains(&stop_topic("target")));
        assert!(!filters.contains(&"target/inbox".to_string()));
        assert!(filters.contains(&stop_topic("caller")));
        stop_all(&[&caller]);
    }

    #[test]
    fn test_publish_snapshot_ignores_later_registration() {
        let ctx = quick_ctx();
        let task = Task::spawn(&ctx, "snap", ()).unwrap();
        let early = Tally::new();
        task.subscribe::<String, _>("snap/+", early.clone()).unwrap();
        let snapshot = ctx.bus().subscriptions_for("snap/x");
        task.subscribe::<String, _>("snap/#", Tally::new()).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(ctx.bus().subscriptions_for("snap/x").len(), 2);
        stop_all(&[&task]);
    }
}

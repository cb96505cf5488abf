//! # Topic-based messaging between tasks.
//!
//! - [`TopicFilter`] MQTT-style filters (`+` one level, `#` the rest).
//! - [`MessagingBus`] copy-on-write subscription table with round-robin routing.
//! - [`MessageContext`] per-publish state: reply, response and completion futures.
//! - [`Subscriber`] / [`ResponseHandler`] the typed receiving ends.
//!
//! Deliveries and replies are deadline-bounded calls on the receiving task,
//! so a subscriber always runs on the thread of the task it subscribed with.

mod bus;
mod context;
mod filter;
mod subscription;

pub use bus::MessagingBus;
pub use context::{Completion, MessageContext, MessageKind, ResponseHandler};
pub use filter::TopicFilter;
pub use subscription::{Subscriber, Subscription};

pub(crate) use subscription::Deliver;

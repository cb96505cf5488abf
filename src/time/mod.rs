//! Deadlines and the shared timer.
//!
//! - [`limit`] absolute millisecond deadlines ([`TimeLimit`]).
//! - [`wheel`] the coarse one-shot timer ([`HashedWheelTimer`]) behind every deadline.

pub mod limit;
pub mod wheel;

pub use limit::{TimeLimit, now_millis};
pub use wheel::{HashedWheelTimer, Timeout};

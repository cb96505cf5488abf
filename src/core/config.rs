//! # Global runtime configuration.
//!
//! Provides [`Config`], the settings shared by an [`AppContext`](crate::AppContext)
//! and every task spawned into it.
//!
//! Config is used in two ways:
//! 1. **Context creation**: `AppContext::new(config)`
//! 2. **Task defaults**: `TaskBuilder` copies `poll_interval` unless overridden
//!
//! ## Sentinel values
//! - `grace = 0s` → wait forever during `AppContext::shutdown`
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use taskmesh::Config;
//!
//! let mut cfg = Config::default();
//! cfg.poll_interval = Duration::from_millis(100);
//! cfg.grace = Duration::ZERO;
//!
//! assert_eq!(cfg.grace_limit(), None);
//! ```

use std::time::Duration;

/// Configuration for an application context and its tasks.
///
/// ## Field semantics
/// - `poll_interval`: upper bound of each task's idle wait; also the heartbeat period
/// - `liveness_window`: staleness tolerated by [`AppContext::is_live`](crate::AppContext::is_live)
/// - `grace`: how long `shutdown` waits for tasks to terminate (`0s` = forever)
#[derive(Clone, Debug)]
pub struct Config {
    /// Longest time a task thread blocks waiting for work.
    ///
    /// A task stamps its last scan time once per poll iteration, so this is
    /// also the worst-case heartbeat period of an idle task.
    pub poll_interval: Duration,

    /// Default maximum staleness of any task's last scan before the
    /// context is considered not live.
    pub liveness_window: Duration,

    /// Maximum time to wait for tasks to terminate after a stop.
    ///
    /// If exceeded, `shutdown` returns `RuntimeError::GraceExceeded`.
    pub grace: Duration,
}

impl Config {
    /// Returns the shutdown grace as an `Option`.
    ///
    /// - `None` → wait for termination without a bound
    /// - `Some(d)` → give up after `d`
    #[inline]
    pub fn grace_limit(&self) -> Option<Duration> {
        if self.grace == Duration::ZERO {
            None
        } else {
            Some(self.grace)
        }
    }

    /// Returns the poll interval clamped to at least one millisecond.
    #[inline]
    pub fn poll_interval_clamped(&self) -> Duration {
        self.poll_interval.max(Duration::from_millis(1))
    }
}

impl Default for Config {
    /// Default configuration:
    ///
    /// - `poll_interval = 500ms`
    /// - `liveness_window = 20s`
    /// - `grace = 10s`
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            liveness_window: Duration::from_secs(20),
            grace: Duration::from_secs(10),
        }
    }
}

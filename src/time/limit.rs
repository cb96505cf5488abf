//! # Absolute deadlines.
//!
//! [`TimeLimit`] is an immutable wall-clock deadline in milliseconds since the
//! Unix epoch. A deadline `<= 0` means "no limit".

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Immutable absolute deadline.
///
/// Created via [`TimeLimit::in_duration`], [`TimeLimit::in_millis`],
/// [`TimeLimit::before`] or [`TimeLimit::no_limit`].
///
/// # Example
/// ```
/// use std::time::Duration;
/// use taskmesh::TimeLimit;
///
/// let limit = TimeLimit::in_duration(Duration::from_secs(3));
/// assert!(!limit.is_expired());
/// assert!(limit.remaining() > 0);
///
/// assert!(TimeLimit::no_limit().is_no_limit());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeLimit {
    deadline_millis: i64,
}

impl TimeLimit {
    /// A limit that never expires.
    pub const fn no_limit() -> Self {
        Self { deadline_millis: 0 }
    }

    /// Deadline at the absolute timestamp `deadline_millis`.
    pub const fn before(deadline_millis: i64) -> Self {
        Self { deadline_millis }
    }

    /// Deadline `millis` from now.
    ///
    /// One extra millisecond is added so that `remaining()` is strictly
    /// positive right after construction even with millisecond clocks.
    pub fn in_millis(millis: u64) -> Self {
        let millis = i64::try_from(millis).unwrap_or(i64::MAX / 2);
        Self {
            deadline_millis: now_millis().saturating_add(millis).saturating_add(1),
        }
    }

    /// Deadline `duration` from now.
    pub fn in_duration(duration: Duration) -> Self {
        Self::in_millis(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    /// Absolute deadline in milliseconds (`<= 0` means no limit).
    pub fn deadline_millis(&self) -> i64 {
        self.deadline_millis
    }

    /// True when this limit is unbounded.
    pub fn is_no_limit(&self) -> bool {
        self.deadline_millis <= 0
    }

    /// True when bounded and the deadline has been reached.
    pub fn is_expired(&self) -> bool {
        !self.is_no_limit() && now_millis() >= self.deadline_millis
    }

    /// Milliseconds left until the deadline; negative once expired.
    ///
    /// Meaningless for an unbounded limit.
    pub fn remaining(&self) -> i64 {
        self.deadline_millis.saturating_sub(now_millis())
    }

    /// Remaining time as a `Duration`, or `None` if unbounded.
    ///
    /// An expired limit yields `Duration::ZERO`.
    pub fn remaining_duration(&self) -> Option<Duration> {
        if self.is_no_limit() {
            return None;
        }
        Some(Duration::from_millis(self.remaining().max(0) as u64))
    }
}

impl Default for TimeLimit {
    fn default() -> Self {
        Self::no_limit()
    }
}

impl From<Duration> for TimeLimit {
    fn from(d: Duration) -> Self {
        Self::in_duration(d)
    }
}

impl fmt::Display for TimeLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_no_limit() {
            f.write_str("no-limit")
        } else {
            write!(f, "before {}ms", self.deadline_millis)
        }
    }
}

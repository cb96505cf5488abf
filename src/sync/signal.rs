//! # Single-slot wakeup primitive.
//!
//! [`WakeupSignal`] is a levelled trigger: [`post`](WakeupSignal::post) raises
//! a flag and wakes one waiter, [`wait_for_post`](WakeupSignal::wait_for_post)
//! blocks until the flag is raised or the timeout elapses and always lowers it.
//! Several posts before a wait collapse into one. The waiter learns nothing
//! about why it returned; callers re-check their own state.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Flag + condition variable used to park a task thread between jobs.
#[derive(Debug, Default)]
pub struct WakeupSignal {
    posted: Mutex<bool>,
    cond: Condvar,
}

impl WakeupSignal {
    /// Creates a lowered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag and wakes one waiter. Idempotent while raised.
    pub fn post(&self) {
        let mut posted = self.posted.lock();
        if !*posted {
            *posted = true;
            self.cond.notify_one();
        }
    }

    /// Blocks until posted or until `timeout` elapses, then lowers the flag.
    ///
    /// Returns immediately if the flag is already raised. Spurious wakeups are
    /// absorbed: the wait resumes until posted or the full timeout has passed.
    /// A timeout too large to represent as an `Instant` waits for a post only.
    pub fn wait_for_post(&self, timeout: Duration) {
        let mut posted = self.posted.lock();
        match Instant::now().checked_add(timeout) {
            Some(until) => {
                while !*posted {
                    if self.cond.wait_until(&mut posted, until).timed_out() {
                        break;
                    }
                }
            }
            // Past the representable range: wait for a post only.
            None => {
                while !*posted {
                    self.cond.wait(&mut posted);
                }
            }
        }
        *posted = false;
    }

    /// True while a post has not been consumed.
    pub fn is_posted(&self) -> bool {
        *self.posted.lock()
    }
}

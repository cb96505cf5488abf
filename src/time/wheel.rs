//! # Hashed wheel timer.
//!
//! A coarse-grained one-shot timer serviced by a single worker thread.
//! Arming pushes onto a lock-free queue and cancelling flips an atomic flag,
//! so both are O(1) from any thread. The worker moves armed entries into
//! wheel buckets once per tick and fires those whose deadline has passed.
//!
//! ```text
//!   new_timeout() ──► pending (SegQueue) ──┐
//!                                          ▼   every tick
//!   ┌────────┬────────┬────────┬─── ─ ─┬────────┐
//!   │ slot 0 │ slot 1 │ slot 2 │        │ slot N │  entry.rounds counts
//!   └────────┴────────┴────────┴─── ─ ─┴────────┘  full rotations left
//! ```
//!
//! A timeout fires no earlier than its delay and usually within one tick of it.
//! Callbacks run on the worker thread and must be short; use
//! [`new_timeout_on`](crate::exec::new_timeout_on) to hop onto an executor.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use crossbeam::queue::SegQueue;
use tracing::error;

use crate::error::panic_message;

/// Tick of the process-wide timer.
pub const DEFAULT_TICK: Duration = Duration::from_millis(10);
/// Bucket count of the process-wide timer.
pub const DEFAULT_WHEEL_SIZE: usize = 512;

const ARMED: u8 = 0;
const CANCELLED: u8 = 1;
const EXPIRED: u8 = 2;

/// Handle to an armed one-shot timeout.
///
/// Dropping the handle does not cancel the timeout.
#[derive(Clone, Debug)]
pub struct Timeout {
    state: Arc<AtomicU8>,
}

impl Timeout {
    /// Disarms the timeout. Returns `false` if it already fired or was cancelled.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(ARMED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// True once [`Timeout::cancel`] succeeded.
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// True once the callback has been started.
    pub fn is_expired(&self) -> bool {
        self.state.load(Ordering::Acquire) == EXPIRED
    }
}

struct Entry {
    deadline: Duration,
    rounds: u64,
    state: Arc<AtomicU8>,
    callback: Box<dyn FnOnce() + Send>,
}

impl Entry {
    fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    fn expire(self) {
        if self
            .state
            .compare_exchange(ARMED, EXPIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let callback = self.callback;
        if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback)) {
            error!(error = %panic_message(panic.as_ref()), "timeout callback panicked");
        }
    }
}

struct Inner {
    tick: Duration,
    start: Instant,
    pending: SegQueue<Entry>,
    stopped: AtomicBool,
}

/// One-shot timer wheel with a dedicated worker thread.
///
/// The worker starts on the first armed timeout and stops when the timer is
/// dropped. [`HashedWheelTimer::shared`] is never dropped.
pub struct HashedWheelTimer {
    inner: Arc<Inner>,
    slots: usize,
    started: OnceLock<bool>,
}

impl HashedWheelTimer {
    /// Creates a timer with the given tick and bucket count (rounded up to a power of two).
    pub fn new(tick: Duration, slots: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                tick: tick.max(Duration::from_millis(1)),
                start: Instant::now(),
                pending: SegQueue::new(),
                stopped: AtomicBool::new(false),
            }),
            slots: slots.max(1).next_power_of_two(),
            started: OnceLock::new(),
        }
    }

    /// The process-wide timer servicing every deadline (10ms tick).
    pub fn shared() -> &'static HashedWheelTimer {
        static SHARED: OnceLock<HashedWheelTimer> = OnceLock::new();
        SHARED.get_or_init(|| HashedWheelTimer::new(DEFAULT_TICK, DEFAULT_WHEEL_SIZE))
    }

    /// Tick duration of this wheel.
    pub fn tick(&self) -> Duration {
        self.inner.tick
    }

    /// Arms `callback` to run on the timer thread after `delay`.
    pub fn new_timeout<F>(&self, delay: Duration, callback: F) -> Timeout
    where
        F: FnOnce() + Send + 'static,
    {
        self.ensure_worker();
        let state = Arc::new(AtomicU8::new(ARMED));
        self.inner.pending.push(Entry {
            deadline: self.inner.start.elapsed().saturating_add(delay),
            rounds: 0,
            state: state.clone(),
            callback: Box::new(callback),
        });
        Timeout { state }
    }

    fn ensure_worker(&self) {
        self.started.get_or_init(|| {
            let inner = self.inner.clone();
            let slots = self.slots;
            let spawned = std::thread::Builder::new()
                .name("taskmesh-timer".into())
                .spawn(move || Worker::new(inner, slots).run());
            match spawned {
                Ok(_) => true,
                Err(e) => {
                    error!(error = %e, "failed to start timer thread; timeouts will not fire");
                    false
                }
            }
        });
    }
}

impl Drop for HashedWheelTimer {
    fn drop(&mut self) {
        self.inner.stopped.store(true, Ordering::Release);
    }
}

struct Worker {
    inner: Arc<Inner>,
    wheel: Vec<Vec<Entry>>,
    mask: u64,
    tick: u64,
}

impl Worker {
    fn new(inner: Arc<Inner>, slots: usize) -> Self {
        Self {
            inner,
            wheel: (0..slots).map(|_| Vec::new()).collect(),
            mask: slots as u64 - 1,
            tick: 0,
        }
    }

    fn run(mut self) {
        while !self.inner.stopped.load(Ordering::Acquire) {
            let deadline = self.wait_for_next_tick();
            let idx = (self.tick & self.mask) as usize;
            self.transfer_pending();
            self.expire_bucket(idx, deadline);
            self.tick += 1;
        }
    }

    /// Sleeps until the end of the current tick and returns that instant
    /// relative to the timer start.
    fn wait_for_next_tick(&self) -> Duration {
        let tick_nanos = self.inner.tick.as_nanos() as u64;
        let deadline = Duration::from_nanos(tick_nanos.saturating_mul(self.tick + 1));
        loop {
            let elapsed = self.inner.start.elapsed();
            if elapsed >= deadline {
                return elapsed;
            }
            std::thread::sleep(deadline - elapsed);
        }
    }

    fn transfer_pending(&mut self) {
        let tick_nanos = self.inner.tick.as_nanos().max(1);
        while let Some(mut entry) = self.inner.pending.pop() {
            if entry.is_cancelled() {
                continue;
            }
            let calculated = (entry.deadline.as_nanos() / tick_nanos) as u64;
            entry.rounds = calculated.saturating_sub(self.tick) / self.wheel.len() as u64;
            // Already late entries go into the bucket processed right now.
            let ticks = calculated.max(self.tick);
            self.wheel[(ticks & self.mask) as usize].push(entry);
        }
    }

    fn expire_bucket(&mut self, idx: usize, deadline: Duration) {
        let bucket = std::mem::take(&mut self.wheel[idx]);
        let mut keep = Vec::with_capacity(bucket.len());
        for mut entry in bucket {
            if entry.is_cancelled() {
                continue;
            }
            if entry.rounds == 0 && entry.deadline <= deadline {
                entry.expire();
            } else {
                entry.rounds = entry.rounds.saturating_sub(1);
                keep.push(entry);
            }
        }
        self.wheel[idx] = keep;
    }
}

//! # Task poll loop.
//!
//! Body of every task thread. Owns the actor value, the terminal table and
//! the adopted epilogs for the lifetime of the thread.
//!
//! ## Flow
//! ```text
//! on_start ─► ┌─► wait_for_post(poll_interval)
//!             │      │
//!             │      ├─ first iteration after stop() ─► actor.on_stop_requested
//!             │      │                                  terminals.on_stop_requested
//!             │      ├─ drain queued jobs (FIFO, each guarded)
//!             │      ├─ poll listeners and epilogs
//!             │      └─ stamp last_scan
//!             └──────┘ while running || epilogs pending
//!
//! exit ─► terminate leftover terminals ─► finish (deregister, resolve `terminated()`)
//! ```
//!
//! ## Rules
//! - A panicking job, hook or epilog is logged and never ends the loop.
//! - Jobs still queued when the loop exits are dropped (handles resolve `Abandoned`).
//! - `finish` runs even if the loop itself unwinds.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::{debug, error, info};

use crate::core::epilog::EpilogSet;
use crate::core::scope::{TaskScope, TerminalTable};
use crate::core::task::{Actor, Task, TaskStatus};
use crate::error::panic_message;
use crate::time::now_millis;

/// Calls [`Task::finish`] when dropped.
struct FinishGuard(Task);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.finish();
    }
}

fn guarded<F: FnOnce()>(task: &str, what: &'static str, f: F) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        error!(task, what, error = %panic_message(panic.as_ref()), "panic on task thread");
    }
}

pub(crate) fn run<A: Actor>(task: Task, mut actor: A) {
    let guard = FinishGuard(task.clone());
    task.mark_started();
    let name = task.name().to_owned();
    info!(task = %name, "starting task");

    let shared = task.shared.clone();
    let mut terminals = TerminalTable::default();
    let mut epilogs = EpilogSet::new(shared.signal.clone());
    let mut listeners = EpilogSet::new(shared.signal.clone());

    guarded(&name, "on_start", || {
        actor.on_start(&mut TaskScope::new(&task, &mut terminals));
    });
    terminals.prune();
    if !shared.jobs.is_empty() {
        shared.signal.post();
    }

    let mut stop_handled = false;
    loop {
        epilogs.adopt(&shared.epilogs);
        if task.is_stop_requested() && stop_handled && epilogs.is_empty() {
            break;
        }

        shared.signal.wait_for_post(shared.poll_interval);

        if task.is_stop_requested() && !stop_handled {
            stop_handled = true;
            task.set_status(TaskStatus::StopRequested);
            info!(task = %name, terminals = terminals.len(), "stopping task");
            guarded(&name, "on_stop_requested", || {
                actor.on_stop_requested(&mut TaskScope::new(&task, &mut terminals));
            });
            terminals.stop_requested();
        }

        while let Some(job) = shared.jobs.pop() {
            let actor: &mut dyn Any = &mut actor;
            guarded(&name, "job", || job(actor, &mut TaskScope::new(&task, &mut terminals)));
            terminals.prune();
        }

        listeners.adopt(&shared.listeners);
        listeners.poll(&name, &shared.listeners);
        epilogs.adopt(&shared.epilogs);
        epilogs.poll(&name, &shared.epilogs);

        if stop_handled && !epilogs.is_empty() && task.status() != TaskStatus::DrainingEpilogs {
            debug!(task = %name, pending = task.pending_epilogs(), "draining epilogs");
            task.set_status(TaskStatus::DrainingEpilogs);
        }
        task.stamp_scan(now_millis());
    }

    if terminals.len() > 0 {
        info!(task = %name, terminals = terminals.len(), "terminating leftover terminals");
    }
    terminals.terminate_all();
    drop(listeners);
    drop(epilogs);
    drop(actor);
    drop(guard);
}

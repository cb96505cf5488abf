//! # Example: graceful_shutdown
//!
//! A task hosting a small state machine, stopped gracefully.
//!
//! Demonstrates how to:
//! - Attach a [`Terminal`] to a task and drive it with state timeouts.
//! - Register an epilog from [`Actor::on_stop_requested`] to delay termination.
//! - Shut down on Ctrl-C / SIGTERM, or after a few seconds otherwise.
//!
//! ## Flow
//! ```text
//! on_start ─► attach(Lamp) ─► On ──200ms──► Off ──200ms──► On ...
//!
//! shutdown ─► on_stop_requested ─► register_epilog(flush)
//!          ─► Lamp::on_stop_requested ─► terminate ─► on_termination
//!          ─► flush completes ─► task terminates ─► shutdown returns
//! ```
//!
//! ## Run
//! ```bash
//! cargo run --example graceful_shutdown
//! ```

use std::time::Duration;

use futures::channel::oneshot;
use taskmesh::{
    Actor, AppContext, Behavior, Config, State, StateHandle, Task, TaskScope, Terminal,
};
use tracing_subscriber::EnvFilter;

const BLINK: Duration = Duration::from_millis(200);

struct Lamp {
    blinks: u32,
}

impl Behavior for Lamp {
    fn on_stop_requested(terminal: &mut Terminal<Self>) {
        println!("[lamp] stop requested after {} blinks", terminal.get().blinks);
        terminal.terminate();
    }

    fn on_termination(terminal: &mut Terminal<Self>) {
        println!("[lamp] {terminal} terminated");
    }
}

struct On(StateHandle<Lamp>);
struct Off(StateHandle<Lamp>);

impl State<Lamp> for On {
    fn on_entry(&self, terminal: &mut Terminal<Lamp>) {
        terminal.get_mut().blinks += 1;
        println!("[lamp] on");
        self.0.new_timeout(BLINK, |t| {
            t.next_state_with(Off);
        });
    }
}

impl State<Lamp> for Off {
    fn on_entry(&self, _terminal: &mut Terminal<Lamp>) {
        println!("[lamp] off");
        self.0.new_timeout(BLINK, |t| {
            t.next_state_with(On);
        });
    }
}

/// Owns the lamp and flushes "state" on stop.
struct House;

impl Actor for House {
    fn on_start(&mut self, scope: &mut TaskScope<'_>) {
        scope.attach(Lamp { blinks: 0 }, |t| {
            t.next_state_with(On);
        });
    }

    fn on_stop_requested(&mut self, scope: &mut TaskScope<'_>) {
        let (tx, rx) = oneshot::channel::<()>();
        std::thread::spawn(move || {
            println!("[house] flushing...");
            std::thread::sleep(Duration::from_millis(300));
            let _ = tx.send(());
        });
        scope.task().register_epilog(rx);
        println!("[house] epilog registered, {} pending", scope.task().pending_epilogs());
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut cfg = Config::default();
    cfg.grace = Duration::from_secs(5);
    let ctx = AppContext::new(cfg);
    let house = Task::spawn(&ctx, "house", House)?;

    tokio::select! {
        r = ctx.run_until_signal() => r?,
        _ = tokio::time::sleep(Duration::from_secs(2)) => ctx.shutdown().await?,
    }

    println!("[main] house status: {}", house.status().as_label());
    Ok(())
}

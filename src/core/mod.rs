//! Runtime core: tasks, their poll loop and the application context.
//!
//! Public API from this module: [`Task`] and its [`TaskBuilder`], the
//! [`Actor`] hooks, the [`TaskScope`] lent to jobs, [`AppContext`] and
//! [`Config`], and the [`ShutdownSignal`] helpers.
//!
//! Internal modules:
//! - [`runner`]: the task thread's poll loop;
//! - [`epilog`]: epilog and listener futures polled by the loop;
//! - [`scope`]: thread-owned terminal table;
//! - [`shutdown`]: termination signals that end [`AppContext::run_until_signal`].

mod config;
mod context;
mod epilog;
mod runner;
mod scope;
mod shutdown;
mod task;

pub use config::Config;
pub use context::AppContext;
pub use scope::TaskScope;
pub use shutdown::{ShutdownSignal, ShutdownSignals, wait_for_shutdown_signal};
pub use task::{Actor, Task, TaskBuilder, TaskStatus, stop_topic};

pub(crate) use scope::Hosted;

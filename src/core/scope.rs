//! # Thread-owned view of a task.
//!
//! [`TaskScope`] is what jobs and actor hooks get while running on the task
//! thread: access to the task handle and to the terminals the task hosts.
//! The terminal table itself never leaves the task thread.

use std::any::Any;
use std::collections::BTreeMap;

use crate::core::Task;
use crate::terminals::{Behavior, Terminal, TerminalId};

/// Type-erased terminal as seen by its host task.
pub(crate) trait Hosted {
    fn is_terminated(&self) -> bool;
    fn stop_requested(&mut self);
    fn force_terminate(&mut self);
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Terminals attached to one task, in attach order.
#[derive(Default)]
pub(crate) struct TerminalTable {
    entries: BTreeMap<TerminalId, Box<dyn Hosted>>,
}

impl TerminalTable {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drops terminals that terminated since the last prune.
    pub(crate) fn prune(&mut self) {
        self.entries.retain(|_, t| !t.is_terminated());
    }

    /// Runs every terminal's stop hook; each hook is guarded individually.
    pub(crate) fn stop_requested(&mut self) {
        for terminal in self.entries.values_mut() {
            terminal.stop_requested();
        }
        self.prune();
    }

    pub(crate) fn terminate_all(&mut self) {
        for terminal in self.entries.values_mut() {
            terminal.force_terminate();
        }
        self.entries.clear();
    }
}

/// The task-thread side of a task, lent to jobs and hooks.
pub struct TaskScope<'a> {
    task: &'a Task,
    terminals: &'a mut TerminalTable,
}

impl<'a> TaskScope<'a> {
    pub(crate) fn new(task: &'a Task, terminals: &'a mut TerminalTable) -> Self {
        Self { task, terminals }
    }

    /// The task this scope belongs to.
    pub fn task(&self) -> &Task {
        self.task
    }

    /// Creates a terminal on this task and runs `setup` on it.
    ///
    /// `setup` usually moves the terminal out of its initial state and
    /// returns its handle. A terminal that `setup` already terminated is not
    /// attached.
    pub fn attach<B, R, F>(&mut self, behavior: B, setup: F) -> R
    where
        B: Behavior,
        F: FnOnce(&mut Terminal<B>) -> R,
    {
        let mut terminal = Terminal::new(self.task.clone(), behavior);
        let out = setup(&mut terminal);
        if !terminal.is_terminated() {
            self.terminals.entries.insert(terminal.id(), Box::new(terminal));
        }
        out
    }

    /// Live terminal `id`, if it exists and hosts behavior `B`.
    pub fn terminal_mut<B: Behavior>(&mut self, id: TerminalId) -> Option<&mut Terminal<B>> {
        self.terminals
            .entries
            .get_mut(&id)
            .and_then(|t| t.as_any_mut().downcast_mut::<Terminal<B>>())
            .filter(|t| !t.is_terminated())
    }

    /// Number of attached terminals.
    pub fn terminal_count(&self) -> usize {
        self.terminals.len()
    }

    /// Ids of attached terminals, in attach order.
    pub fn terminal_ids(&self) -> Vec<TerminalId> {
        self.terminals.entries.keys().copied().collect()
    }
}

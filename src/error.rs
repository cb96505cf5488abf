//! Error types used by the taskmesh runtime.
//!
//! This module defines two main error enums:
//!
//! - [`CallError`]: failures carried by the future of a scheduled call
//!   (deadline misses, state-machine guards, payload mismatches, user failures).
//! - [`RuntimeError`]: failures raised synchronously by the runtime itself
//!   (bad topics and filters, duplicate task names, shutdown overruns).
//!
//! Both types provide helper methods (`as_label`, `as_message`) for logging.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// # Failures surfaced through the result of a scheduled call.
///
/// A caller awaiting a [`CallHandle`](crate::CallHandle) sees either the
/// callable's value or exactly one of these.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// A deadline-bounded call did not complete in time.
    ///
    /// `already_expired` is set when the limit had passed before the call
    /// started (the callable never ran); `interrupted` when the shared timer
    /// fired while the callable was running and the callable observed it.
    #[error("deadline exceeded (already expired: {already_expired}, interrupted: {interrupted})")]
    DeadlineExceeded {
        /// The limit was expired before the callable was invoked.
        already_expired: bool,
        /// The callable was interrupted by the timer.
        interrupted: bool,
    },

    /// The call was scheduled from a state that is no longer current.
    #[error("call avoided on inactive state {state}")]
    InactiveState {
        /// Name of the state that scheduled the call.
        state: String,
    },

    /// The call targeted a terminal that has terminated.
    #[error("terminal {terminal} is terminated")]
    TerminatedTerminal {
        /// Display form of the terminal (`<behavior>#<id>`).
        terminal: String,
    },

    /// Raised by [`Deadline::checkpoint`](crate::Deadline::checkpoint) and
    /// [`Deadline::sleep`](crate::Deadline::sleep) once the timer has fired.
    #[error("interrupted")]
    Interrupted,

    /// A payload or response value did not have the type the receiver expects.
    #[error("payload type mismatch: expected {expected}")]
    PayloadType {
        /// Type name the receiver is typed for.
        expected: &'static str,
    },

    /// An actor-typed call reached a task running a different actor type.
    #[error("actor type mismatch: expected {expected}")]
    ActorType {
        /// Actor type the call was written for.
        expected: &'static str,
    },

    /// The job was dropped without running because its task terminated.
    #[error("task {task} terminated before the call could run")]
    Abandoned {
        /// Name of the task (or executor) that dropped the job.
        task: String,
    },

    /// The callable returned an error.
    #[error("execution failed: {error}")]
    Failed {
        /// The underlying error message.
        error: String,
    },

    /// Every handle on a request was dropped before anyone replied.
    #[error("request on {topic} was dropped without a reply")]
    NoReply {
        /// Topic the request was published on.
        topic: String,
    },

    /// The callable panicked; the panic was caught on the executing thread.
    #[error("panicked: {message}")]
    Panicked {
        /// Panic payload, when it was a string.
        message: String,
    },
}

impl CallError {
    /// Wraps any displayable error as [`CallError::Failed`].
    ///
    /// # Example
    /// ```
    /// use taskmesh::CallError;
    ///
    /// let err = CallError::failed("disk full");
    /// assert_eq!(err, CallError::Failed { error: "disk full".into() });
    /// ```
    pub fn failed(error: impl fmt::Display) -> Self {
        CallError::Failed {
            error: error.to_string(),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use taskmesh::CallError;
    ///
    /// let err = CallError::DeadlineExceeded { already_expired: true, interrupted: false };
    /// assert_eq!(err.as_label(), "call_deadline_exceeded");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            CallError::DeadlineExceeded { .. } => "call_deadline_exceeded",
            CallError::InactiveState { .. } => "call_inactive_state",
            CallError::TerminatedTerminal { .. } => "call_terminated_terminal",
            CallError::Interrupted => "call_interrupted",
            CallError::PayloadType { .. } => "call_payload_type",
            CallError::ActorType { .. } => "call_actor_type",
            CallError::Abandoned { .. } => "call_abandoned",
            CallError::Failed { .. } => "call_failed",
            CallError::NoReply { .. } => "call_no_reply",
            CallError::Panicked { .. } => "call_panicked",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            CallError::DeadlineExceeded {
                already_expired: true,
                ..
            } => "deadline already expired".to_string(),
            CallError::DeadlineExceeded { .. } => "deadline exceeded while running".to_string(),
            CallError::InactiveState { state } => format!("inactive state: {state}"),
            CallError::TerminatedTerminal { terminal } => format!("terminated: {terminal}"),
            CallError::Interrupted => "interrupted".to_string(),
            CallError::PayloadType { expected } => format!("expected payload {expected}"),
            CallError::ActorType { expected } => format!("expected actor {expected}"),
            CallError::Abandoned { task } => format!("abandoned by {task}"),
            CallError::Failed { error } => format!("error: {error}"),
            CallError::NoReply { topic } => format!("no reply on {topic}"),
            CallError::Panicked { message } => format!("panic: {message}"),
        }
    }

    /// Indicates a deadline miss of either kind.
    pub fn is_deadline(&self) -> bool {
        matches!(self, CallError::DeadlineExceeded { .. })
    }

    /// Builds [`CallError::Panicked`] from a caught panic payload.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        CallError::Panicked {
            message: panic_message(payload.as_ref()),
        }
    }
}

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// # Errors raised synchronously by the runtime.
///
/// These are returned directly from the operation that hit them; nothing is
/// scheduled when one of these is returned.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// A publish matched no subscription.
    #[error("no subscription matches topic {topic:?}")]
    InvalidTopic {
        /// The published topic.
        topic: String,
    },

    /// A topic filter has a malformed level.
    #[error("invalid topic filter {filter:?}: bad level {level:?}")]
    InvalidTopicFilter {
        /// The full filter string.
        filter: String,
        /// The first offending level.
        level: String,
    },

    /// A task with this name is already registered in the context.
    #[error("task name {name:?} is already registered")]
    DuplicateTaskName {
        /// The conflicting name.
        name: String,
    },

    /// The task thread could not be spawned.
    #[error("failed to spawn thread for task {name:?}: {error}")]
    Spawn {
        /// Task name.
        name: String,
        /// OS error message.
        error: String,
    },

    /// Shutdown grace period was exceeded; some tasks were still running.
    #[error("shutdown timeout {grace:?} exceeded; stuck: {stuck:?}")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
        /// Names of the tasks that did not terminate in time.
        stuck: Vec<String>,
    },
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use taskmesh::RuntimeError;
    ///
    /// let err = RuntimeError::InvalidTopic { topic: "a/b".into() };
    /// assert_eq!(err.as_label(), "runtime_invalid_topic");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::InvalidTopic { .. } => "runtime_invalid_topic",
            RuntimeError::InvalidTopicFilter { .. } => "runtime_invalid_topic_filter",
            RuntimeError::DuplicateTaskName { .. } => "runtime_duplicate_task_name",
            RuntimeError::Spawn { .. } => "runtime_spawn",
            RuntimeError::GraceExceeded { .. } => "runtime_grace_exceeded",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            RuntimeError::InvalidTopic { topic } => format!("no subscriber for {topic}"),
            RuntimeError::InvalidTopicFilter { filter, level } => {
                format!("filter {filter}: level {level:?} is malformed")
            }
            RuntimeError::DuplicateTaskName { name } => format!("duplicate task {name}"),
            RuntimeError::Spawn { name, error } => format!("spawn {name}: {error}"),
            RuntimeError::GraceExceeded { grace, stuck } => {
                format!("grace exceeded after {grace:?}; stuck tasks={stuck:?}")
            }
        }
    }
}

//! # Terminals: state machines hosted by a task.
//!
//! - [`Terminal`] owns a [`Behavior`] value and its current [`State`].
//! - [`TerminalHandle`] / [`StateHandle`] schedule guarded calls from any thread.
//!
//! A terminal is created on its task's thread with
//! [`TaskScope::attach`](crate::TaskScope::attach) and stays there; handles
//! only ever enqueue closures onto the task.

mod state;
mod terminal;

pub use state::{State, StateHandle, StateId};
pub use terminal::{Behavior, Terminal, TerminalHandle, TerminalId};

/// Last path segment of a type name, generics stripped (`a::b::Foo<X>` → `Foo`).
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::short_type_name;

    struct Plain;
    struct Wrapper<T>(T);

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name::<Plain>(), "Plain");
        assert_eq!(short_type_name::<Wrapper<Plain>>(), "Wrapper");
        assert_eq!(short_type_name::<u8>(), "u8");
    }
}

//! Thread synchronization primitives.

pub mod signal;

pub use signal::WakeupSignal;

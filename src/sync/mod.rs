//! Synchronization primitives used throughout the core.
//!
//! [`Lock`] is the binary signaling primitive every cross-thread handoff is
//! built on. [`Guarded`] pairs one Lock with the structure it protects for
//! that structure's whole lifetime.

mod guarded;
mod lock;

pub use guarded::{Guarded, GuardedRef};
pub use lock::{Acquire, Lock, Timeout};

//! Binary Lock with timed acquire.
//!
//! A Lock is either available or unavailable. `acquire` takes it if it is
//! available, otherwise blocks up to the given [`Timeout`]; `release` makes it
//! available and wakes one blocked acquirer. Any thread may release, which is
//! what lets one thread block on a Lock until another signals it.
//!
//! ```text
//!   create() ──▶ unavailable ──release()──▶ available ──acquire()──▶ unavailable
//!                                                   destroy() (no waiters) ──▶ gone
//! ```

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::LockError;
use crate::platform::{Reservation, ResourceKind, SharedPlatform};

/// How long `acquire` may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Return immediately.
    NoWait,
    /// Block at most this long.
    Bounded(Duration),
    /// Block until released.
    Infinite,
}

impl Timeout {
    pub const fn millis(ms: u64) -> Self {
        if ms == 0 {
            Self::NoWait
        } else {
            Self::Bounded(Duration::from_millis(ms))
        }
    }
}

/// Outcome of a successful `acquire` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Acquired,
    TimedOut,
}

struct State {
    available: bool,
    waiters: usize,
    destroyed: bool,
    reservation: Option<Reservation>,
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
}

/// Cloneable handle to one binary Lock.
#[derive(Clone)]
pub struct Lock {
    inner: Arc<Inner>,
}

impl Lock {
    /// New Lock in the unavailable state.
    pub fn create(platform: &SharedPlatform) -> Result<Self, LockError> {
        Self::with_state(platform, false)
    }

    /// New Lock in the available state.
    pub fn create_released(platform: &SharedPlatform) -> Result<Self, LockError> {
        Self::with_state(platform, true)
    }

    fn with_state(platform: &SharedPlatform, available: bool) -> Result<Self, LockError> {
        let reservation = Reservation::acquire(platform, ResourceKind::Lock)
            .map_err(|_| LockError::ResourceExhausted)?;
        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    available,
                    waiters: 0,
                    destroyed: false,
                    reservation: Some(reservation),
                }),
                cond: Condvar::new(),
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // State transitions never panic midway, so a poisoned guard is still consistent.
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn acquire(&self, timeout: Timeout) -> Result<Acquire, LockError> {
        let mut state = self.state();
        if state.destroyed {
            return Err(LockError::Destroyed);
        }
        if state.available {
            state.available = false;
            return Ok(Acquire::Acquired);
        }
        let deadline = match timeout {
            Timeout::NoWait => return Ok(Acquire::TimedOut),
            Timeout::Bounded(d) => Some(Instant::now() + d),
            Timeout::Infinite => None,
        };

        state.waiters += 1;
        let outcome = loop {
            if state.available {
                state.available = false;
                break Acquire::Acquired;
            }
            match deadline {
                None => {
                    state = self
                        .inner
                        .cond
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break Acquire::TimedOut;
                    }
                    state = self
                        .inner
                        .cond
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        };
        state.waiters -= 1;
        Ok(outcome)
    }

    pub fn release(&self) -> Result<(), LockError> {
        let mut state = self.state();
        if state.destroyed {
            return Err(LockError::Destroyed);
        }
        state.available = true;
        drop(state);
        self.inner.cond.notify_one();
        Ok(())
    }

    /// Destroy the Lock and return its reservation.
    ///
    /// Destroying a Lock twice, or while a thread is blocked on it, is a
    /// contract violation and panics.
    pub fn destroy(&self) {
        let mut state = self.state();
        assert!(!state.destroyed, "lock destroyed twice");
        assert_eq!(
            state.waiters, 0,
            "lock destroyed while {} thread(s) blocked on it",
            state.waiters
        );
        state.destroyed = true;
        state.reservation = None;
    }

    pub fn is_destroyed(&self) -> bool {
        self.state().destroyed
    }

    /// Threads currently blocked in `acquire`.
    pub fn waiters(&self) -> usize {
        self.state().waiters
    }
}

impl core::fmt::Debug for Lock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state();
        f.debug_struct("Lock")
            .field("available", &state.available)
            .field("waiters", &state.waiters)
            .field("destroyed", &state.destroyed)
            .finish()
    }
}

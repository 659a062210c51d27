//! A structure bound to exactly one [`Lock`] for its entire lifetime.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use super::lock::{Acquire, Lock, Timeout};
use crate::error::LockError;
use crate::platform::SharedPlatform;

/// Shared mutable state protected by a dedicated binary Lock.
///
/// The value is reachable only through [`GuardedRef`], which exists only while
/// the Lock is held. Once [`destroy`](Self::destroy) runs, every later
/// `lock()` fails with [`LockError::Destroyed`].
pub struct Guarded<T> {
    lock: Lock,
    value: UnsafeCell<T>,
}

// SAFETY: the binary Lock admits one holder at a time and `value` is only
// touched through a `GuardedRef`, so moving `T` between threads is all that
// is required.
unsafe impl<T: Send> Send for Guarded<T> {}
// SAFETY: see above.
unsafe impl<T: Send> Sync for Guarded<T> {}

impl<T> Guarded<T> {
    pub fn create(platform: &SharedPlatform, value: T) -> Result<Self, LockError> {
        Ok(Self {
            lock: Lock::create_released(platform)?,
            value: UnsafeCell::new(value),
        })
    }

    /// Block until the Lock is held.
    pub fn lock(&self) -> Result<GuardedRef<'_, T>, LockError> {
        loop {
            if self.lock.acquire(Timeout::Infinite)? == Acquire::Acquired {
                return Ok(GuardedRef { owner: self });
            }
        }
    }

    /// Run `f` with exclusive access.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, LockError> {
        let mut guard = self.lock()?;
        Ok(f(&mut guard))
    }

    /// Destroy the underlying Lock. Same contract as [`Lock::destroy`].
    pub fn destroy(&self) {
        self.lock.destroy();
    }

    /// Direct access while the value is not yet shared.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

/// Exclusive access to a [`Guarded`] value; releases the Lock on drop.
pub struct GuardedRef<'a, T> {
    owner: &'a Guarded<T>,
}

impl<T> Deref for GuardedRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: this guard is the sole holder of the owner's Lock.
        unsafe { &*self.owner.value.get() }
    }
}

impl<T> DerefMut for GuardedRef<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: this guard is the sole holder of the owner's Lock.
        unsafe { &mut *self.owner.value.get() }
    }
}

impl<T> Drop for GuardedRef<'_, T> {
    fn drop(&mut self) {
        // Destroyed while held: nobody can acquire it again, nothing to release.
        let _ = self.owner.lock.release();
    }
}

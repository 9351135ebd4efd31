//! Lock facade and ownership handles.
//!
//! [`Lock`] wraps a [`Gate`] behind two acquisition entry points — blocking
//! ([`Lock::lock_blocking`]) and suspending ([`Lock::lock`]) — each minting
//! a handle whose drop releases the permit on every exit path from the
//! critical section, early returns and unwinds included.
//!
//! # Example
//!
//! ```ignore
//! use gatelock::{CancelToken, Lock};
//!
//! let lock = Lock::new();
//! let token = CancelToken::new();
//!
//! let handle = lock.lock_blocking(&token)?;
//! // ... critical section ...
//! drop(handle); // permit released, next waiter woken
//! ```

use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::gate::{AcquireError, Gate, ReleaseError, TryAcquireError};

/// Error returned when trying to lock without waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryLockError {
    /// The lock is currently held.
    Locked,
    /// The lock was torn down.
    Disposed,
}

impl std::fmt::Display for TryLockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Locked => write!(f, "lock is held"),
            Self::Disposed => write!(f, "lock disposed"),
        }
    }
}

impl std::error::Error for TryLockError {}

/// A mutual-exclusion lock usable from blocking and suspending call sites.
///
/// Not re-entrant: a holder re-acquiring waits like any other caller.
#[derive(Debug, Default)]
pub struct Lock {
    gate: Gate,
}

impl Lock {
    /// Creates a new, unlocked lock.
    #[must_use]
    pub fn new() -> Self {
        Self { gate: Gate::new() }
    }

    /// Acquires the lock, blocking the calling thread.
    ///
    /// Returns a handle that releases the lock when dropped. Fails with
    /// [`AcquireError::Cancelled`] if `token` fires before the grant and
    /// [`AcquireError::Disposed`] after teardown.
    pub fn lock_blocking(&self, token: &CancelToken) -> Result<LockHandle<'_>, AcquireError> {
        self.gate.acquire_blocking(token)?;
        Ok(LockHandle { lock: Some(self) })
    }

    /// Acquires the lock, suspending the calling task.
    ///
    /// The wait for the permit is the only suspension point; once granted,
    /// control resumes without suspending again. Same error contract as
    /// [`Lock::lock_blocking`].
    pub async fn lock(&self, token: &CancelToken) -> Result<LockHandle<'_>, AcquireError> {
        self.gate.acquire(token).await?;
        Ok(LockHandle { lock: Some(self) })
    }

    /// Acquires the lock, suspending, and returns a handle that owns a
    /// reference to it. For holders that outlive a borrow scope.
    pub async fn lock_owned(
        self: Arc<Self>,
        token: &CancelToken,
    ) -> Result<OwnedLockHandle, AcquireError> {
        self.gate.acquire(token).await?;
        Ok(OwnedLockHandle { lock: Some(self) })
    }

    /// Blocking form of [`Lock::lock_owned`].
    pub fn lock_owned_blocking(
        self: Arc<Self>,
        token: &CancelToken,
    ) -> Result<OwnedLockHandle, AcquireError> {
        self.gate.acquire_blocking(token)?;
        Ok(OwnedLockHandle { lock: Some(self) })
    }

    /// Tries to acquire the lock without waiting.
    pub fn try_lock(&self) -> Result<LockHandle<'_>, TryLockError> {
        match self.gate.try_acquire() {
            Ok(()) => Ok(LockHandle { lock: Some(self) }),
            Err(TryAcquireError::Unavailable) => Err(TryLockError::Locked),
            Err(TryAcquireError::Disposed) => Err(TryLockError::Disposed),
        }
    }

    /// Releases the lock without going through a handle.
    ///
    /// For callers preferring manual discipline over scoped release; pair
    /// with [`LockHandle::forget`] so the handle does not release a second
    /// time. Releasing an unheld lock is an error.
    pub fn unlock(&self) -> Result<(), ReleaseError> {
        self.gate.release()
    }

    /// Tears the lock down.
    ///
    /// Queued and future acquisition attempts fail with
    /// [`AcquireError::Disposed`]. Idempotent.
    pub fn close(&self) {
        self.gate.close();
    }

    /// Returns true if the lock is currently held. Advisory.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        !self.gate.is_available()
    }

    /// Returns true if the lock has been torn down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.gate.is_closed()
    }
}

fn release_on_drop(gate: &Gate) {
    match gate.release() {
        Ok(()) => {}
        // Teardown already reclaimed the permit; nothing left to release.
        Err(ReleaseError::Disposed) => {}
        Err(ReleaseError::NotHeld) => {
            log::debug!("lock handle dropped after the lock was already released");
        }
    }
}

/// Ownership token for a held [`Lock`].
///
/// Minted only by a successful acquisition. Dropping a live handle releases
/// the lock exactly once; handles are move-only, so a release cannot run
/// twice for one acquisition. The default handle references no lock and its
/// drop is a no-op.
#[derive(Debug, Default)]
#[must_use = "lock is released immediately if the handle is not held"]
pub struct LockHandle<'a> {
    lock: Option<&'a Lock>,
}

impl LockHandle<'_> {
    /// Returns true if this handle references no lock.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock.is_none()
    }

    /// Releases the lock now. Equivalent to dropping the handle.
    pub fn release(self) {
        drop(self);
    }

    /// Forgets the handle without releasing the lock.
    ///
    /// The caller takes over the release obligation, typically via
    /// [`Lock::unlock`].
    pub fn forget(mut self) {
        self.lock = None;
    }
}

impl Drop for LockHandle<'_> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            release_on_drop(&lock.gate);
        }
    }
}

/// Ownership token that keeps its [`Lock`] alive.
///
/// Same release contract as [`LockHandle`], with an `Arc` back-reference so
/// the handle can cross task and thread boundaries.
#[derive(Debug, Default)]
#[must_use = "lock is released immediately if the handle is not held"]
pub struct OwnedLockHandle {
    lock: Option<Arc<Lock>>,
}

impl OwnedLockHandle {
    /// Returns true if this handle references no lock.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock.is_none()
    }

    /// Releases the lock now. Equivalent to dropping the handle.
    pub fn release(self) {
        drop(self);
    }

    /// Forgets the handle without releasing the lock.
    pub fn forget(mut self) {
        self.lock = None;
    }
}

impl Drop for OwnedLockHandle {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            release_on_drop(&lock.gate);
        }
    }
}

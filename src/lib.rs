//! Mutual exclusion usable interchangeably from blocking threads and
//! suspending tasks.
//!
//! One [`Lock`] arbitrates a single exclusive slot among OS threads and
//! async tasks contending at the same time. Both acquisition paths share
//! one permit and one FIFO waiter queue, so mixed contention is safe by
//! construction: there are not two locks to fall out of sync.
//!
//! # Entry points
//!
//! - [`Lock::lock_blocking`] — blocks the calling thread.
//! - [`Lock::lock`] — suspends the calling task; the wait for the permit is
//!   the only suspension point.
//! - Both return a [`LockHandle`] that releases the lock when dropped, on
//!   every exit path: early return, `?`, and unwind included.
//!
//! # Cancellation
//!
//! Every acquisition takes a [`CancelToken`]. A token that fires before the
//! grant fails the attempt with [`AcquireError::Cancelled`] and removes the
//! waiter cleanly; a token firing after the grant has no effect. Timeouts
//! are tokens built with [`CancelToken::after`].
//!
//! # Teardown
//!
//! [`Lock::close`] invalidates the lock: queued waiters wake with
//! [`AcquireError::Disposed`] and every later operation fails the same way,
//! deterministically.
//!
//! # Example
//!
//! ```
//! use gatelock::{CancelToken, Lock};
//! use std::time::Duration;
//!
//! let lock = Lock::new();
//!
//! let held = lock.lock_blocking(&CancelToken::new()).unwrap();
//!
//! // A second attempt with a deadline fails while the first handle lives.
//! let deadline = CancelToken::after(Duration::from_millis(50));
//! assert!(lock.lock_blocking(&deadline).is_err());
//!
//! drop(held);
//! let reacquired = lock.lock_blocking(&CancelToken::new()).unwrap();
//! drop(reacquired);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod cancel;
mod gate;
mod lock;
mod park;

pub use cancel::CancelToken;
pub use gate::{AcquireError, AcquireFuture, Gate, ReleaseError, TryAcquireError};
pub use lock::{Lock, LockHandle, OwnedLockHandle, TryLockError};

//! Cancellation signals for acquisition attempts.
//!
//! A [`CancelToken`] is a fire-once flag shared between the party that may
//! cancel a wait and the wait itself. Waits observe the token at every poll
//! and additionally register a waker with it, so firing the token wakes a
//! suspended task or a parked thread instead of leaving it to discover the
//! cancellation on its next poll.
//!
//! Timeouts are not a separate mechanism: [`CancelToken::after`] builds a
//! token that fires on its own once a duration elapses.
//!
//! # Example
//!
//! ```ignore
//! use gatelock::CancelToken;
//!
//! let token = CancelToken::after(std::time::Duration::from_secs(1));
//! // Pass to an acquisition attempt; it fails with Cancelled if the
//! // permit is not granted within one second.
//! ```

use parking_lot::Mutex as ParkingMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::Waker;
use std::time::Duration;

/// A clonable, fire-once cancellation signal.
///
/// Clones share the same underlying state: firing any clone fires them all.
/// An unfired token that nobody ever fires stands in for "no cancellation".
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug)]
struct TokenInner {
    /// Lock-free shadow of the fired flag for read-heavy checks.
    fired_shadow: AtomicBool,
    state: ParkingMutex<TokenState>,
}

#[derive(Debug)]
struct TokenState {
    fired: bool,
    watchers: Vec<Watcher>,
    next_watcher_id: u64,
}

#[derive(Debug)]
struct Watcher {
    id: u64,
    waker: Waker,
}

impl CancelToken {
    /// Creates a token that never fires on its own.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                fired_shadow: AtomicBool::new(false),
                state: ParkingMutex::new(TokenState {
                    fired: false,
                    watchers: Vec::new(),
                    next_watcher_id: 0,
                }),
            }),
        }
    }

    /// Creates a token that fires automatically once `duration` elapses.
    ///
    /// The deadline is driven by a dedicated timer thread holding only a
    /// weak reference to the token state; dropping every clone of the token
    /// before the deadline lets the state go away and the thread exit
    /// without firing anything.
    #[must_use]
    pub fn after(duration: Duration) -> Self {
        let token = Self::new();
        let weak: Weak<TokenInner> = Arc::downgrade(&token.inner);
        let spawned = std::thread::Builder::new()
            .name("gatelock-cancel-timer".into())
            .spawn(move || {
                std::thread::sleep(duration);
                if let Some(inner) = weak.upgrade() {
                    log::trace!("cancel deadline elapsed after {duration:?}");
                    fire_inner(&inner);
                }
            });
        if let Err(e) = spawned {
            // A token whose deadline can never fire would wait forever;
            // failing canceled is the conservative fallback.
            log::warn!("failed to spawn cancel timer thread: {e}; firing token immediately");
            token.fire();
        }
        token
    }

    /// Fires the token, waking every registered watcher.
    ///
    /// Idempotent: repeated calls are no-ops.
    pub fn fire(&self) {
        fire_inner(&self.inner);
    }

    /// Returns true if the token has fired.
    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.inner.fired_shadow.load(Ordering::Acquire)
    }

    /// Registers `waker` to be woken when the token fires, or refreshes the
    /// registration identified by `*slot` on a repoll.
    ///
    /// Returns `true` if the token has already fired, in which case nothing
    /// is registered and the caller must take its cancellation path. The
    /// check and the registration happen under one lock, so a concurrent
    /// `fire` either sees the watcher or is seen by the caller; the wakeup
    /// cannot fall between the two.
    pub(crate) fn watch(&self, slot: &mut Option<u64>, waker: &Waker) -> bool {
        let mut state = self.inner.state.lock();
        if state.fired {
            *slot = None;
            return true;
        }
        if let Some(id) = *slot {
            if let Some(existing) = state.watchers.iter_mut().find(|w| w.id == id) {
                if !existing.waker.will_wake(waker) {
                    existing.waker.clone_from(waker);
                }
                return false;
            }
        }
        let id = state.next_watcher_id;
        state.next_watcher_id = state.next_watcher_id.wrapping_add(1);
        state.watchers.push(Watcher {
            id,
            waker: waker.clone(),
        });
        *slot = Some(id);
        false
    }

    /// Removes the registration identified by `*slot`, if any.
    pub(crate) fn unwatch(&self, slot: &mut Option<u64>) {
        if let Some(id) = slot.take() {
            let mut state = self.inner.state.lock();
            if let Some(pos) = state.watchers.iter().position(|w| w.id == id) {
                state.watchers.remove(pos);
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

fn fire_inner(inner: &TokenInner) {
    // Drain under the lock, wake outside it: a watcher's wake may run
    // arbitrary code that re-enters the token.
    let taken = {
        let mut state = inner.state.lock();
        if state.fired {
            return;
        }
        state.fired = true;
        inner.fired_shadow.store(true, Ordering::Release);
        std::mem::take(&mut state.watchers)
    };
    for watcher in taken {
        watcher.waker.wake();
    }
}

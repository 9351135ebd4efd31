//! Thread parking for the blocking acquisition path.
//!
//! The blocking front-end drives the same future the suspending front-end
//! uses; it just needs a [`Waker`] that wakes an OS thread. [`Parker`]
//! provides park/unpark with token semantics (an unpark delivered before the
//! park is consumed by it, never lost), and [`Parker::waker`] wraps an
//! unpark in a `Waker`.

use parking_lot::{Condvar, Mutex as ParkingMutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Wake, Waker};

#[derive(Debug)]
struct ParkerInner {
    notified: AtomicBool,
    mutex: ParkingMutex<()>,
    cvar: Condvar,
}

/// A mechanism for parking and unparking one thread.
#[derive(Debug, Clone)]
pub(crate) struct Parker {
    inner: Arc<ParkerInner>,
}

impl Parker {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(ParkerInner {
                notified: AtomicBool::new(false),
                mutex: ParkingMutex::new(()),
                cvar: Condvar::new(),
            }),
        }
    }

    /// Parks the current thread until notified, consuming the notification.
    pub(crate) fn park(&self) {
        // Fast path: a pending notification means no need to sleep.
        if self.consume_notification() {
            return;
        }
        let mut guard = self.inner.mutex.lock();
        while !self.consume_notification() {
            self.inner.cvar.wait(&mut guard);
        }
    }

    /// Notifies the parker, waking the parked thread if there is one.
    pub(crate) fn unpark(&self) {
        if self.inner.notified.swap(true, Ordering::Release) {
            // Already notified; the parked thread will consume it.
            return;
        }
        // Take the mutex so the flag store cannot slip between the parked
        // thread's check and its wait.
        drop(self.inner.mutex.lock());
        self.inner.cvar.notify_one();
    }

    /// Returns a `Waker` that unparks this parker.
    pub(crate) fn waker(&self) -> Waker {
        Waker::from(Arc::new(UnparkWaker {
            parker: self.clone(),
        }))
    }

    fn consume_notification(&self) -> bool {
        self.inner
            .notified
            .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}

#[derive(Debug)]
struct UnparkWaker {
    parker: Parker,
}

impl Wake for UnparkWaker {
    fn wake(self: Arc<Self>) {
        self.parker.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.parker.unpark();
    }
}

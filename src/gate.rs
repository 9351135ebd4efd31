//! Binary-permit gate: the synchronization core.
//!
//! A [`Gate`] holds a single permit and arbitrates access to it among
//! threads and suspended tasks. Both front-ends share one waiter queue and
//! one permit flag, so blocking and suspending acquirers contend against
//! the same state.
//!
//! # Cancel Safety
//!
//! An acquisition attempt is a single wait: cancellation (or dropping a
//! pending future) before the grant removes the waiter from the queue and,
//! if the waiter was at the front of a free gate, passes the wakeup on to
//! the next waiter so the grant is never lost. Once the permit is granted,
//! cancellation has no effect.

use parking_lot::Mutex as ParkingMutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Waker};

use crate::cancel::CancelToken;
use crate::park::Parker;

/// Error returned when gate acquisition fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    /// The cancellation signal fired before the permit was granted.
    Cancelled,
    /// The gate was torn down.
    Disposed,
}

impl std::fmt::Display for AcquireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "gate acquire cancelled"),
            Self::Disposed => write!(f, "gate disposed"),
        }
    }
}

impl std::error::Error for AcquireError {}

/// Error returned when trying to acquire without waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryAcquireError {
    /// The permit is held, or earlier waiters are queued ahead.
    Unavailable,
    /// The gate was torn down.
    Disposed,
}

impl std::fmt::Display for TryAcquireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable => write!(f, "gate permit unavailable"),
            Self::Disposed => write!(f, "gate disposed"),
        }
    }
}

impl std::error::Error for TryAcquireError {}

/// Error returned when releasing the permit fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseError {
    /// No acquisition is outstanding; the permit is already available.
    /// Over-release never inflates the permit past capacity one.
    NotHeld,
    /// The gate was torn down.
    Disposed,
}

impl std::fmt::Display for ReleaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotHeld => write!(f, "release without matching acquire"),
            Self::Disposed => write!(f, "gate disposed"),
        }
    }
}

impl std::error::Error for ReleaseError {}

/// A single-permit gate supporting blocking and suspending waits.
#[derive(Debug)]
pub struct Gate {
    /// Internal state for the permit and waiters.
    state: ParkingMutex<GateState>,
    /// Lock-free shadow of permit availability for diagnostics.
    available_shadow: AtomicBool,
    /// Lock-free shadow of the closed flag for read-heavy checks.
    closed_shadow: AtomicBool,
}

#[derive(Debug)]
struct GateState {
    /// Whether the permit is available (true) or taken (false).
    available: bool,
    /// Whether the gate has been torn down.
    closed: bool,
    /// FIFO queue of waiters.
    waiters: VecDeque<Waiter>,
    /// Next waiter id for targeted removal.
    next_waiter_id: u64,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    waker: Waker,
}

fn front_waiter_waker(state: &GateState) -> Option<Waker> {
    state.waiters.front().map(|waiter| waiter.waker.clone())
}

/// Removes `waiter_id` from the queue. If it was at the front, returns the
/// next waiter's waker so the caller can pass the baton when the permit is
/// free; a non-front removal never needs to wake anyone.
fn remove_waiter_and_take_next_waker(state: &mut GateState, waiter_id: u64) -> Option<Waker> {
    if state
        .waiters
        .front()
        .is_some_and(|waiter| waiter.id == waiter_id)
    {
        state.waiters.pop_front();
        front_waiter_waker(state)
    } else {
        if let Some(pos) = state.waiters.iter().position(|w| w.id == waiter_id) {
            state.waiters.remove(pos);
        }
        None
    }
}

impl Gate {
    /// Creates a new gate with the permit available.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ParkingMutex::new(GateState {
                available: true,
                closed: false,
                waiters: VecDeque::with_capacity(4),
                next_waiter_id: 0,
            }),
            available_shadow: AtomicBool::new(true),
            closed_shadow: AtomicBool::new(false),
        }
    }

    /// Returns true if the permit is currently available.
    ///
    /// Advisory: the answer may be stale by the time the caller acts on it.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available_shadow.load(Ordering::Relaxed)
    }

    /// Returns true if the gate has been torn down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed_shadow.load(Ordering::Acquire)
    }

    /// Returns the number of queued waiters.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Acquires the permit, suspending until it is granted, the token fires,
    /// or the gate is torn down.
    pub fn acquire<'a, 'b>(&'a self, token: &'b CancelToken) -> AcquireFuture<'a, 'b> {
        AcquireFuture {
            gate: self,
            token,
            waiter_id: None,
            watch_slot: None,
        }
    }

    /// Acquires the permit, blocking the calling thread until it is granted,
    /// the token fires, or the gate is torn down.
    ///
    /// Drives the same future as [`Gate::acquire`] with a thread-unparking
    /// waker, so blocking and suspending waiters share one queue.
    pub fn acquire_blocking(&self, token: &CancelToken) -> Result<(), AcquireError> {
        let parker = Parker::new();
        let waker = parker.waker();
        let mut context = Context::from_waker(&waker);
        let mut future = self.acquire(token);
        loop {
            match Pin::new(&mut future).poll(&mut context) {
                Poll::Ready(result) => return result,
                Poll::Pending => parker.park(),
            }
        }
    }

    /// Takes the permit without waiting.
    ///
    /// Fails if the permit is taken, if earlier waiters are queued (no queue
    /// jumping), or if the gate is torn down.
    pub fn try_acquire(&self) -> Result<(), TryAcquireError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TryAcquireError::Disposed);
        }
        if !state.available || !state.waiters.is_empty() {
            return Err(TryAcquireError::Unavailable);
        }
        state.available = false;
        // Relaxed: the shadow is an advisory hint; the mutex guards the
        // real flag.
        self.available_shadow.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Returns the permit, waking the front waiter if any is queued.
    ///
    /// Releasing when no acquisition is outstanding is an error; the permit
    /// count is clamped at capacity one by refusing the release.
    pub fn release(&self) -> Result<(), ReleaseError> {
        let waker_to_wake = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ReleaseError::Disposed);
            }
            if state.available {
                return Err(ReleaseError::NotHeld);
            }
            state.available = true;
            self.available_shadow.store(true, Ordering::Relaxed);
            // Wake only the front waiter; FIFO means only it can take the
            // permit, and it passes the baton if it leaves instead.
            front_waiter_waker(&state)
        };
        if let Some(waker) = waker_to_wake {
            waker.wake();
        }
        Ok(())
    }

    /// Tears the gate down.
    ///
    /// All queued waiters are woken and observe [`AcquireError::Disposed`];
    /// every subsequent operation fails with a disposed error. Idempotent.
    pub fn close(&self) {
        let taken = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            self.closed_shadow.store(true, Ordering::Release);
            std::mem::take(&mut state.waiters)
        };
        if !taken.is_empty() {
            log::debug!("gate closed with {} queued waiters", taken.len());
        }
        for waiter in taken {
            waiter.waker.wake();
        }
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

/// Future returned by [`Gate::acquire`].
pub struct AcquireFuture<'a, 'b> {
    gate: &'a Gate,
    token: &'b CancelToken,
    waiter_id: Option<u64>,
    watch_slot: Option<u64>,
}

impl AcquireFuture<'_, '_> {
    /// Leaves the wait set: removes our queue entry and, if we were at the
    /// front of a free gate, hands the wakeup to the next waiter.
    fn leave_wait_set(&mut self) {
        self.token.unwatch(&mut self.watch_slot);
        if let Some(waiter_id) = self.waiter_id.take() {
            let next_waker = {
                let mut state = self.gate.state.lock();
                let waker = remove_waiter_and_take_next_waker(&mut state, waiter_id);
                if state.available { waker } else { None }
            };
            if let Some(next) = next_waker {
                next.wake();
            }
        }
    }
}

impl Drop for AcquireFuture<'_, '_> {
    fn drop(&mut self) {
        self.leave_wait_set();
    }
}

impl Future for AcquireFuture<'_, '_> {
    type Output = Result<(), AcquireError>;

    fn poll(self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);

        if this.token.is_fired() {
            this.leave_wait_set();
            return Poll::Ready(Err(AcquireError::Cancelled));
        }

        let mut state = this.gate.state.lock();

        let waiter_id = if let Some(id) = this.waiter_id {
            id
        } else {
            let id = state.next_waiter_id;
            state.next_waiter_id = state.next_waiter_id.wrapping_add(1);
            this.waiter_id = Some(id);
            id
        };

        if state.closed {
            if let Some(pos) = state.waiters.iter().position(|w| w.id == waiter_id) {
                state.waiters.remove(pos);
            }
            drop(state);
            this.waiter_id = None;
            this.token.unwatch(&mut this.watch_slot);
            return Poll::Ready(Err(AcquireError::Disposed));
        }

        // FIFO fairness: only take the permit if the queue is empty or we
        // are at the front. Prevents a fresh arrival from jumping earlier
        // waiters.
        let is_next_in_line = state.waiters.front().is_none_or(|w| w.id == waiter_id);

        if is_next_in_line && state.available {
            state.available = false;
            this.gate.available_shadow.store(false, Ordering::Relaxed);
            if !state.waiters.is_empty() {
                // We verified we are the front; O(1) removal.
                state.waiters.pop_front();
            }
            drop(state);
            this.waiter_id = None;
            this.token.unwatch(&mut this.watch_slot);
            return Poll::Ready(Ok(()));
        }

        // Register as a waiter or refresh the stored waker; some executors
        // hand out a different waker on every poll.
        if let Some(existing) = state
            .waiters
            .iter_mut()
            .find(|waiter| waiter.id == waiter_id)
        {
            if !existing.waker.will_wake(context.waker()) {
                existing.waker.clone_from(context.waker());
            }
        } else {
            state.waiters.push_back(Waiter {
                id: waiter_id,
                waker: context.waker().clone(),
            });
        }
        drop(state);

        // Register with the token after queueing; watch() observes a
        // concurrent fire atomically, so a signal landing between the check
        // at the top of poll and this point is not lost.
        if this.token.watch(&mut this.watch_slot, context.waker()) {
            this.leave_wait_set();
            return Poll::Ready(Err(AcquireError::Cancelled));
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn init_test_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn poll_once<T, F>(future: &mut F) -> Option<T>
    where
        F: Future<Output = T> + Unpin,
    {
        let waker = Waker::noop();
        let mut cx = Context::from_waker(waker);
        match Pin::new(future).poll(&mut cx) {
            Poll::Ready(v) => Some(v),
            Poll::Pending => None,
        }
    }

    fn poll_once_with_waker<T, F>(future: &mut F, waker: &Waker) -> Option<T>
    where
        F: Future<Output = T> + Unpin,
    {
        let mut cx = Context::from_waker(waker);
        match Pin::new(future).poll(&mut cx) {
            Poll::Ready(v) => Some(v),
            Poll::Pending => None,
        }
    }

    #[derive(Debug)]
    struct CountingWaker(AtomicUsize);

    impl CountingWaker {
        fn new() -> Arc<Self> {
            Arc::new(Self(AtomicUsize::new(0)))
        }

        fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl std::task::Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }

        fn wake_by_ref(self: &Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn new_gate_has_permit_available() {
        init_test_logging();
        let gate = Gate::new();
        assert!(gate.is_available());
        assert!(!gate.is_closed());
        assert_eq!(gate.waiters(), 0);
    }

    #[test]
    fn try_acquire_takes_the_permit() {
        init_test_logging();
        let gate = Gate::new();
        gate.try_acquire().expect("first try_acquire");
        assert!(!gate.is_available());
        assert_eq!(gate.try_acquire(), Err(TryAcquireError::Unavailable));
    }

    #[test]
    fn acquire_resolves_immediately_when_available() {
        init_test_logging();
        let gate = Gate::new();
        let token = CancelToken::new();
        let mut fut = gate.acquire(&token);
        let result = poll_once(&mut fut).expect("ready");
        assert_eq!(result, Ok(()));
        assert!(!gate.is_available());
    }

    #[test]
    fn acquire_pends_while_permit_is_held() {
        init_test_logging();
        let gate = Gate::new();
        gate.try_acquire().expect("hold permit");

        let token = CancelToken::new();
        let mut fut = gate.acquire(&token);
        assert!(poll_once(&mut fut).is_none());
        assert_eq!(gate.waiters(), 1);
    }

    #[test]
    fn release_wakes_front_waiter() {
        init_test_logging();
        let gate = Gate::new();
        gate.try_acquire().expect("hold permit");

        let token = CancelToken::new();
        let counting = CountingWaker::new();
        let waker = Waker::from(Arc::clone(&counting));
        let mut fut = gate.acquire(&token);
        assert!(poll_once_with_waker(&mut fut, &waker).is_none());

        gate.release().expect("release");
        assert!(counting.count() > 0);

        let result = poll_once_with_waker(&mut fut, &waker).expect("ready");
        assert_eq!(result, Ok(()));
        assert!(!gate.is_available());
    }

    #[test]
    fn fired_token_cancels_and_removes_waiter() {
        init_test_logging();
        let gate = Gate::new();
        gate.try_acquire().expect("hold permit");

        let token = CancelToken::new();
        let mut fut = gate.acquire(&token);
        assert!(poll_once(&mut fut).is_none());
        assert_eq!(gate.waiters(), 1);

        token.fire();
        let result = poll_once(&mut fut).expect("cancel poll");
        assert_eq!(result, Err(AcquireError::Cancelled));
        assert_eq!(gate.waiters(), 0);
    }

    #[test]
    fn cancelled_attempt_leaves_state_untouched() {
        init_test_logging();
        let gate = Gate::new();
        gate.try_acquire().expect("hold permit");

        let token = CancelToken::new();
        let mut fut = gate.acquire(&token);
        assert!(poll_once(&mut fut).is_none());
        token.fire();
        let _ = poll_once(&mut fut);
        drop(fut);

        // Still held by the original acquirer.
        assert!(!gate.is_available());
        gate.release().expect("release");

        // A fresh attempt succeeds.
        let token2 = CancelToken::new();
        let mut fut2 = gate.acquire(&token2);
        assert_eq!(poll_once(&mut fut2), Some(Ok(())));
    }

    #[test]
    fn drop_removes_waiter() {
        init_test_logging();
        let gate = Gate::new();
        gate.try_acquire().expect("hold permit");

        let token = CancelToken::new();
        let mut fut = gate.acquire(&token);
        assert!(poll_once(&mut fut).is_none());
        assert_eq!(gate.waiters(), 1);

        drop(fut);
        assert_eq!(gate.waiters(), 0);
    }

    #[test]
    fn cancel_front_waiter_passes_baton() {
        init_test_logging();
        let gate = Gate::new();
        gate.try_acquire().expect("hold permit");

        let token1 = CancelToken::new();
        let token2 = CancelToken::new();
        let w2 = CountingWaker::new();
        let waker2 = Waker::from(Arc::clone(&w2));

        let mut fut1 = gate.acquire(&token1);
        let mut fut2 = gate.acquire(&token2);
        assert!(poll_once(&mut fut1).is_none());
        assert!(poll_once_with_waker(&mut fut2, &waker2).is_none());

        // Free the permit; the front waiter is woken but cancels instead of
        // taking it. It must pass the wakeup to the second waiter.
        gate.release().expect("release");
        token1.fire();
        let result = poll_once(&mut fut1).expect("cancel poll");
        assert_eq!(result, Err(AcquireError::Cancelled));
        assert!(w2.count() > 0, "second waiter woken by baton pass");

        let result2 = poll_once_with_waker(&mut fut2, &waker2).expect("ready");
        assert_eq!(result2, Ok(()));
    }

    #[test]
    fn drop_front_waiter_passes_baton() {
        init_test_logging();
        let gate = Gate::new();
        gate.try_acquire().expect("hold permit");

        let token1 = CancelToken::new();
        let token2 = CancelToken::new();
        let w2 = CountingWaker::new();
        let waker2 = Waker::from(Arc::clone(&w2));

        let mut fut1 = gate.acquire(&token1);
        let mut fut2 = gate.acquire(&token2);
        assert!(poll_once(&mut fut1).is_none());
        assert!(poll_once_with_waker(&mut fut2, &waker2).is_none());

        gate.release().expect("release");
        drop(fut1);
        assert!(w2.count() > 0, "second waiter woken when front drops");
    }

    #[test]
    fn waker_refresh_on_repoll() {
        init_test_logging();
        let gate = Gate::new();
        gate.try_acquire().expect("hold permit");

        let token = CancelToken::new();
        let w1 = CountingWaker::new();
        let w2 = CountingWaker::new();
        let waker1 = Waker::from(Arc::clone(&w1));
        let waker2 = Waker::from(Arc::clone(&w2));

        let mut fut = gate.acquire(&token);
        assert!(poll_once_with_waker(&mut fut, &waker1).is_none());
        assert!(poll_once_with_waker(&mut fut, &waker2).is_none());

        gate.release().expect("release");
        assert_eq!(w1.count(), 0);
        assert!(w2.count() > 0, "stored waker was refreshed");
    }

    #[test]
    fn try_acquire_refuses_to_jump_queue() {
        init_test_logging();
        let gate = Gate::new();
        gate.try_acquire().expect("hold permit");

        let token = CancelToken::new();
        let mut fut = gate.acquire(&token);
        assert!(poll_once(&mut fut).is_none());

        gate.release().expect("release");
        // The permit is free but a waiter is queued ahead.
        assert_eq!(gate.try_acquire(), Err(TryAcquireError::Unavailable));

        assert_eq!(poll_once(&mut fut), Some(Ok(())));
    }

    #[test]
    fn release_without_acquire_is_an_error() {
        init_test_logging();
        let gate = Gate::new();
        assert_eq!(gate.release(), Err(ReleaseError::NotHeld));
        // The permit did not drift past capacity.
        gate.try_acquire().expect("acquire");
        gate.release().expect("matched release");
        assert_eq!(gate.release(), Err(ReleaseError::NotHeld));
    }

    #[test]
    fn close_wakes_all_waiters_with_disposed() {
        init_test_logging();
        let gate = Gate::new();
        gate.try_acquire().expect("hold permit");

        let token1 = CancelToken::new();
        let token2 = CancelToken::new();
        let mut fut1 = gate.acquire(&token1);
        let mut fut2 = gate.acquire(&token2);
        assert!(poll_once(&mut fut1).is_none());
        assert!(poll_once(&mut fut2).is_none());

        gate.close();
        assert_eq!(poll_once(&mut fut1), Some(Err(AcquireError::Disposed)));
        assert_eq!(poll_once(&mut fut2), Some(Err(AcquireError::Disposed)));
    }

    #[test]
    fn operations_after_close_fail_disposed() {
        init_test_logging();
        let gate = Gate::new();
        gate.try_acquire().expect("hold permit");
        gate.close();

        assert_eq!(gate.try_acquire(), Err(TryAcquireError::Disposed));
        assert_eq!(gate.release(), Err(ReleaseError::Disposed));

        let token = CancelToken::new();
        let mut fut = gate.acquire(&token);
        assert_eq!(poll_once(&mut fut), Some(Err(AcquireError::Disposed)));
        assert_eq!(
            gate.acquire_blocking(&token),
            Err(AcquireError::Disposed),
            "blocking path fails without blocking"
        );
    }

    #[test]
    fn close_is_idempotent() {
        init_test_logging();
        let gate = Gate::new();
        gate.close();
        gate.close();
        assert!(gate.is_closed());
    }

    #[test]
    fn acquire_blocking_succeeds_when_available() {
        init_test_logging();
        let gate = Gate::new();
        let token = CancelToken::new();
        gate.acquire_blocking(&token).expect("immediate grant");
        assert!(!gate.is_available());
    }

    #[test]
    fn acquire_blocking_deadline_cancels() {
        init_test_logging();
        let gate = Gate::new();
        gate.try_acquire().expect("hold permit");

        let start = Instant::now();
        let token = CancelToken::after(Duration::from_millis(100));
        let result = gate.acquire_blocking(&token);
        assert_eq!(result, Err(AcquireError::Cancelled));
        assert!(start.elapsed() >= Duration::from_millis(50));
        // The holder's permit is untouched and no phantom waiter remains.
        assert!(!gate.is_available());
        assert_eq!(gate.waiters(), 0);
    }

    #[test]
    fn acquire_blocking_unblocked_by_release() {
        init_test_logging();
        let gate = Arc::new(Gate::new());
        gate.try_acquire().expect("hold permit");

        let releaser = Arc::clone(&gate);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            releaser.release().expect("release");
        });

        let token = CancelToken::new();
        gate.acquire_blocking(&token).expect("granted after release");
        handle.join().expect("releaser join");
        assert!(!gate.is_available());
    }

    #[test]
    fn blocking_waiter_woken_by_close() {
        init_test_logging();
        let gate = Arc::new(Gate::new());
        gate.try_acquire().expect("hold permit");

        let closer = Arc::clone(&gate);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            closer.close();
        });

        let token = CancelToken::new();
        let result = gate.acquire_blocking(&token);
        assert_eq!(result, Err(AcquireError::Disposed));
        handle.join().expect("closer join");
    }

    #[test]
    fn mixed_waiters_served_in_fifo_order() {
        init_test_logging();
        let gate = Gate::new();
        gate.try_acquire().expect("hold permit");

        let token1 = CancelToken::new();
        let token2 = CancelToken::new();
        let mut fut1 = gate.acquire(&token1);
        let mut fut2 = gate.acquire(&token2);
        assert!(poll_once(&mut fut1).is_none());
        assert!(poll_once(&mut fut2).is_none());

        gate.release().expect("release");

        // Second waiter cannot take the permit while the first is queued
        // ahead of it.
        assert!(poll_once(&mut fut2).is_none());
        assert_eq!(poll_once(&mut fut1), Some(Ok(())));
        assert!(poll_once(&mut fut2).is_none());

        gate.release().expect("release again");
        assert_eq!(poll_once(&mut fut2), Some(Ok(())));
    }
}

//! This module provides the blocking primitives used by the executors and the
//! wait bridge, called latches.
//!
//! A latch begins "closed" and blocks some logic from progressing until it is
//! "opened". The exact meaning of "closed" and "open" depends on the latch.
//!
//! Latches implement one or both of two traits:
//!
//! [`Latch`] is the write side. Its single function, [`Latch::set`], (possibly)
//! opens the latch.
//!
//! [`Probe`] is the read side. [`Probe::probe`] returns `true` once the latch is
//! open, which lets a thread spin on it or do something else while it waits.
//!
//! # Safety
//!
//! Once a latch opens, the logic it unblocks often deallocates the latch
//! itself. Refer to the safety comments on [`Latch::set`].

use std::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    sync::Arc,
    task::Wake,
    time::{Duration, Instant},
};

use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};

// -----------------------------------------------------------------------------
// Latches and probes

/// The write side of the latch api.
pub trait Latch {
    /// Possibly opens the latch.
    ///
    /// # Safety
    ///
    /// Opening a latch can cause another thread to wake up, return, and free
    /// the memory the latch lives in. This function therefore takes
    /// `*const Self` rather than `&self`: the pointer must be valid on entry
    /// and must not be invalidated during the call by anything other than the
    /// side effects of `set` itself. Implementations must read every field they
    /// need *before* the side effect that opens the latch.
    unsafe fn set(this: *const Self);
}

/// The read side of the latch api.
pub trait Probe {
    /// Returns `true` if the latch is open, and `false` if it is closed.
    fn probe(&self) -> bool;
}

// -----------------------------------------------------------------------------
// Atomic latch

/// A latch backed by a single atomic flag. Region workers poll it to learn
/// that their executor is shutting down.
pub struct AtomicLatch {
    state: AtomicBool,
}

impl AtomicLatch {
    /// Creates a new closed latch.
    #[inline]
    pub const fn new() -> Self {
        Self {
            state: AtomicBool::new(false),
        }
    }

    /// Resets the latch back to closed.
    #[inline]
    pub fn reset(&self) {
        self.state.store(false, Ordering::Release);
    }
}

impl Default for AtomicLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch for AtomicLatch {
    #[inline]
    unsafe fn set(this: *const Self) {
        // SAFETY: The pointer is valid on entry and the store is the last
        // access, so it may dangle afterwards.
        unsafe { (*this).state.store(true, Ordering::Release) };
    }
}

impl Probe for AtomicLatch {
    #[inline]
    fn probe(&self) -> bool {
        self.state.load(Ordering::Acquire)
    }
}

// -----------------------------------------------------------------------------
// Mutex-lock latch

/// A latch that blocks the thread with a mutex and a condition variable. This
/// works from any thread, whether or not it belongs to an executor.
pub struct LockLatch {
    mutex: Mutex<bool>,
    cond: Condvar,
}

impl LockLatch {
    /// Creates a new closed latch.
    #[inline]
    pub const fn new() -> LockLatch {
        LockLatch {
            mutex: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Blocks the thread until the latch opens.
    pub fn wait(&self) {
        let mut guard = self.mutex.lock();
        while !*guard {
            self.cond.wait(&mut guard);
        }
    }

    /// Blocks the thread until the latch opens, then closes it again.
    pub fn wait_and_reset(&self) {
        let mut guard = self.mutex.lock();
        while !*guard {
            self.cond.wait(&mut guard);
        }
        *guard = false;
    }

    /// Blocks until the latch opens or the deadline passes. Returns `true` if
    /// the latch is open.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut guard = self.mutex.lock();
        while !*guard {
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                return *guard;
            }
        }
        true
    }
}

impl Default for LockLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch for LockLatch {
    #[inline]
    unsafe fn set(this: *const Self) {
        // SAFETY: The waiter cannot observe the flag until the guard is
        // released, and it cannot return before that, so the pointer stays
        // valid for the whole block.
        unsafe {
            let mut guard = (*this).mutex.lock();
            *guard = true;
            (*this).cond.notify_all();
        }
    }
}

impl Probe for LockLatch {
    fn probe(&self) -> bool {
        *self.mutex.lock()
    }
}

// -----------------------------------------------------------------------------
// Counting latch

/// A counting latch opens once `set` has been called as many times as its
/// count. The participants of a parallel region each set it once when they
/// finish their share of the work.
///
/// The decrement is the last access a setter makes, so the waiter may free the
/// latch as soon as it observes zero. For the same reason waiting never blocks
/// on a lock: it spins, then yields.
pub struct CountLatch {
    counter: AtomicUsize,
}

impl CountLatch {
    /// Creates a new latch that opens after `count` calls to `set`. A count of
    /// zero creates an open latch.
    #[inline]
    pub fn with_count(count: usize) -> Self {
        Self {
            counter: AtomicUsize::new(count),
        }
    }

    /// Returns the number of `set` calls still needed to open the latch.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.counter.load(Ordering::Acquire)
    }

    /// Spins until the latch opens, yielding the thread once spinning stops
    /// paying off.
    pub fn wait(&self) {
        let backoff = Backoff::new();
        while !self.probe() {
            if backoff.is_completed() {
                std::thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
    }
}

impl Latch for CountLatch {
    #[inline]
    unsafe fn set(this: *const Self) {
        // SAFETY: The decrement is the only access.
        unsafe {
            (*this).counter.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Probe for CountLatch {
    #[inline]
    fn probe(&self) -> bool {
        self.counter.load(Ordering::Acquire) == 0
    }
}

// -----------------------------------------------------------------------------
// Spinning with a deadline

/// Spins on a probe until it opens or `delay` elapses. Returns `true` if the
/// probe opened. Parked region workers use this before going to sleep.
pub fn spin_for<P: Probe + ?Sized>(probe: &P, delay: Duration) -> bool {
    let backoff = Backoff::new();
    let start = Instant::now();
    loop {
        if probe.probe() {
            return true;
        }
        if start.elapsed() >= delay {
            return false;
        }
        if backoff.is_completed() {
            std::thread::yield_now();
        } else {
            backoff.snooze();
        }
    }
}

// -----------------------------------------------------------------------------
// Async set-on-wake

/// An async task waker that sets a latch on wake.
pub struct SetOnWake<L>
where
    L: Latch,
{
    latch: L,
}

impl<L> SetOnWake<L>
where
    L: Latch,
{
    /// Wraps a latch in a waker.
    pub fn new(latch: L) -> Arc<Self> {
        Arc::new(Self { latch })
    }

    /// Returns the latch this waker sets.
    pub fn latch(&self) -> &L {
        &self.latch
    }
}

impl<L> Wake for SetOnWake<L>
where
    L: Latch,
{
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        // SAFETY: The latch cannot be freed while the arc is held.
        unsafe { Latch::set(&self.latch) };
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;

    #[test]
    fn count_latch_opens_after_every_participant() {
        let latch = Arc::new(CountLatch::with_count(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let latch = Arc::clone(&latch);
                thread::spawn(move || unsafe { Latch::set(&*latch) })
            })
            .collect();
        latch.wait();
        assert!(latch.probe());
        assert_eq!(latch.remaining(), 0);
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn zero_count_latch_is_open() {
        let latch = CountLatch::with_count(0);
        assert!(latch.probe());
        latch.wait();
    }

    #[test]
    fn lock_latch_wakes_a_blocked_thread() {
        let latch = Arc::new(LockLatch::new());
        let setter = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                unsafe { Latch::set(&*latch) };
            })
        };
        latch.wait_and_reset();
        assert!(!latch.probe());
        setter.join().unwrap();
    }

    #[test]
    fn lock_latch_deadline() {
        let latch = LockLatch::new();
        assert!(!latch.wait_until(Instant::now() + Duration::from_millis(5)));
        unsafe { Latch::set(&latch) };
        assert!(latch.wait_until(Instant::now()));
    }

    #[test]
    fn spin_for_gives_up_after_the_delay() {
        let latch = AtomicLatch::new();
        assert!(!spin_for(&latch, Duration::from_millis(1)));
        unsafe { Latch::set(&latch) };
        assert!(spin_for(&latch, Duration::ZERO));
        latch.reset();
        assert!(!latch.probe());
    }

    #[test]
    fn set_on_wake_opens_the_latch() {
        let wake = SetOnWake::new(AtomicLatch::new());
        let waker = std::task::Waker::from(Arc::clone(&wake));
        waker.wake_by_ref();
        assert!(wake.latch().probe());
    }
}

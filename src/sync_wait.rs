//! Blocking on asynchronous work.
//!
//! [`sync_wait`] connects a sender to a receiver backed by a shared completion
//! state, starts it, and blocks the calling thread until the receiver is
//! signalled. It works from any thread: blocking uses a mutex and a condition
//! variable, not a cooperative suspend.
//!
//! The completion state is a one-shot cell. Its state machine only moves
//! forward, `PENDING -> WRITING -> COMPLETE`, and the first transition is a
//! compare-and-swap, so a second signal is detected and rejected with a panic
//! instead of overwriting the first.

use std::{
    any::Any,
    future::Future,
    marker::PhantomData,
    panic,
    pin::pin,
    sync::atomic::{AtomicU8, Ordering},
    sync::Arc,
    task::{Context, Poll, Waker},
};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::{
    execution::{Completion, OperationState, Panic, Receiver, Sender},
    latch::{LockLatch, SetOnWake},
};

// -----------------------------------------------------------------------------
// Raising errors

/// Hands an error signal to the caller of [`sync_wait`]. Errors are returned
/// by value, except for a captured [`Panic`], which is resumed so that the
/// original payload reaches the caller unchanged.
fn raise<T, E: 'static>(error: E) -> Result<T, E> {
    let mut error = Some(error);
    let slot: &mut dyn Any = &mut error;
    if let Some(panic) = slot.downcast_mut::<Option<Panic>>().and_then(Option::take) {
        panic.resume();
    }
    match error {
        Some(error) => Err(error),
        None => unreachable!("only a panic is taken out of the slot"),
    }
}

// -----------------------------------------------------------------------------
// Wait modes

/// Shapes the value returned by a wait.
pub trait WaitMode<V> {
    type Output;

    fn output(value: V) -> Self::Output;
}

/// Returns the sender's value as is.
pub struct Single;

impl<V> WaitMode<V> for Single {
    type Output = V;

    fn output(value: V) -> V {
        value
    }
}

/// Converts the sender's value into one alternative of `T`, usually an enum
/// covering every value a family of senders may produce.
pub struct Variant<T>(PhantomData<fn() -> T>);

impl<V, T> WaitMode<V> for Variant<T>
where
    V: Into<T>,
{
    type Output = T;

    fn output(value: V) -> T {
        value.into()
    }
}

// -----------------------------------------------------------------------------
// Shared completion state

const PENDING: u8 = 0;
const WRITING: u8 = 1;
const COMPLETE: u8 = 2;

/// What the waiter finds once the state is complete.
enum Outcome<V, E> {
    Signal(Completion<V, E>),
    /// A panic raised on the way to the receiver, see [`Receiver::set_panic`].
    Panicked(Box<dyn Any + Send>),
}

struct SharedState<V, E> {
    state: AtomicU8,
    payload: Mutex<Option<Outcome<V, E>>>,
    cond: Condvar,
}

impl<V, E> SharedState<V, E> {
    fn new() -> SharedState<V, E> {
        SharedState {
            state: AtomicU8::new(PENDING),
            payload: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// Stores the signal and wakes the waiter.
    ///
    /// # Panics
    ///
    /// Panics if the state was already signalled.
    fn complete(&self, outcome: Outcome<V, E>) {
        if self
            .state
            .compare_exchange(PENDING, WRITING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            panic!("a completion state was signalled more than once");
        }
        let mut payload = self.payload.lock();
        *payload = Some(outcome);
        // Flipped under the lock, so a waiter that saw `PENDING` and is about
        // to sleep cannot miss the notification.
        self.state.store(COMPLETE, Ordering::Release);
        self.cond.notify_one();
    }

    /// Blocks until the state is signalled and takes the payload.
    fn wait(&self) -> Option<Outcome<V, E>> {
        if self.state.load(Ordering::Acquire) != COMPLETE {
            let mut payload = self.payload.lock();
            while self.state.load(Ordering::Acquire) != COMPLETE {
                self.cond.wait(&mut payload);
            }
            return payload.take();
        }
        self.payload.lock().take()
    }
}

struct WaitReceiver<V, E> {
    shared: Arc<SharedState<V, E>>,
}

impl<V, E> Receiver<V, E> for WaitReceiver<V, E> {
    fn set_value(self, value: V) {
        self.shared.complete(Outcome::Signal(Completion::Value(value)));
    }

    fn set_error(self, error: E) {
        self.shared.complete(Outcome::Signal(Completion::Error(error)));
    }

    fn set_stopped(self) {
        self.shared.complete(Outcome::Signal(Completion::Stopped));
    }

    fn set_panic(self, payload: Box<dyn Any + Send>) {
        self.shared.complete(Outcome::Panicked(payload));
    }
}

fn wait_with<M, S>(sender: S) -> Result<Option<M::Output>, S::Error>
where
    S: Sender,
    S::Value: Send + 'static,
    S::Error: Send + 'static,
    M: WaitMode<S::Value>,
{
    let shared = Arc::new(SharedState::new());
    let mut operation = sender.connect(WaitReceiver {
        shared: Arc::clone(&shared),
    });
    operation.start();
    trace!("waiting for completion");

    match shared.wait() {
        Some(Outcome::Signal(Completion::Value(value))) => Ok(Some(M::output(value))),
        Some(Outcome::Signal(Completion::Stopped)) => Ok(None),
        Some(Outcome::Signal(Completion::Error(error))) => raise(error),
        Some(Outcome::Panicked(payload)) => panic::resume_unwind(payload),
        None => unreachable!("a completed state always holds its signal"),
    }
}

/// Starts a sender and blocks the calling thread until it completes.
///
/// Returns `Ok(Some(value))` for the value signal and `Ok(None)` for the
/// stopped signal. Errors of any type come back as `Err`, except for a
/// captured [`Panic`], which resumes unwinding on the calling thread.
///
/// # Panics
///
/// Panics if the sender signals its receiver more than once, and resumes any
/// panic raised while a value was mapped on its way here.
pub fn sync_wait<S>(sender: S) -> Result<Option<S::Value>, S::Error>
where
    S: Sender,
    S::Value: Send + 'static,
    S::Error: Send + 'static,
{
    wait_with::<Single, S>(sender)
}

/// Like [`sync_wait`], but converts the value into `V`. Senders producing
/// different value types can be waited on into one common enum this way.
pub fn sync_wait_with_variant<V, S>(sender: S) -> Result<Option<V>, S::Error>
where
    S: Sender,
    S::Value: Into<V> + Send + 'static,
    S::Error: Send + 'static,
{
    wait_with::<Variant<V>, S>(sender)
}

// -----------------------------------------------------------------------------
// Futures

/// Polls a future on the calling thread until it completes, sleeping while it
/// is pending.
pub fn block_on<F>(future: F) -> F::Output
where
    F: Future,
{
    let mut future = pin!(future);
    // The latch is set when the future is woken, and reset before each poll.
    let wake = SetOnWake::new(LockLatch::new());
    let waker = Waker::from(Arc::clone(&wake));
    let mut cx = Context::from_waker(&waker);
    loop {
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(output) => return output,
            Poll::Pending => wake.latch().wait_and_reset(),
        }
    }
}

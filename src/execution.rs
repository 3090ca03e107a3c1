//! The completion signal protocol.
//!
//! An asynchronous operation is described by a [`Sender`]. Connecting a sender
//! to a [`Receiver`] yields an [`OperationState`], and starting the operation
//! eventually delivers exactly one of three signals to the receiver: a value,
//! an error, or "stopped". Receivers are consumed by the signal they receive,
//! so a second signal through the same receiver cannot be expressed.
//!
//! Starting an operation may complete it right away on the calling thread, or
//! hand it off to another thread. Nothing in this module assumes either.

use std::{
    any::Any,
    cell::RefCell,
    collections::VecDeque,
    fmt,
    future::Future,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    task::{Context, Poll},
    thread,
};

use async_task::Runnable;

use crate::{
    sync_wait::{sync_wait, sync_wait_with_variant},
    util::{panic_message, CallOnDrop},
};

// -----------------------------------------------------------------------------
// Core traits

/// The consumer of a completion signal.
pub trait Receiver<V, E> {
    fn set_value(self, value: V);

    fn set_error(self, error: E);

    fn set_stopped(self);

    /// Reports a panic raised while a value was being mapped on its way to
    /// this receiver. The receiver is consumed without any other signal.
    ///
    /// The default resumes the panic on the delivering thread. Receivers with
    /// a waiter on another thread override it to hand the payload over.
    fn set_panic(self, payload: Box<dyn Any + Send>)
    where
        Self: Sized,
    {
        panic::resume_unwind(payload)
    }
}

/// A connected operation, ready to be started.
pub trait OperationState {
    /// Starts the operation. Each operation is started at most once.
    fn start(&mut self);
}

/// A description of asynchronous work that signals a receiver on completion.
pub trait Sender: Sized {
    /// The payload of the value signal.
    type Value;

    /// The payload of the error signal.
    type Error;

    /// Connects this sender to a receiver. Nothing runs until the returned
    /// operation is started.
    fn connect<R>(self, receiver: R) -> impl OperationState
    where
        R: Receiver<Self::Value, Self::Error> + Send + 'static;
}

/// The three terminal signals, as a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion<V, E> {
    Value(V),
    Error(E),
    Stopped,
}

impl<V, E> Completion<V, E> {
    /// Delivers this completion to a receiver.
    pub fn deliver<R: Receiver<V, E>>(self, receiver: R) {
        match self {
            Completion::Value(value) => receiver.set_value(value),
            Completion::Error(error) => receiver.set_error(error),
            Completion::Stopped => receiver.set_stopped(),
        }
    }
}

// -----------------------------------------------------------------------------
// Panics

/// A panic captured at an asynchronous boundary. The payload is kept intact,
/// so resuming it reproduces the original panic.
pub struct Panic {
    payload: Box<dyn Any + Send>,
}

impl Panic {
    pub fn new(payload: Box<dyn Any + Send>) -> Panic {
        Panic { payload }
    }

    /// Returns the panic message, if the payload carries one.
    pub fn message(&self) -> String {
        panic_message(&*self.payload)
    }

    pub fn into_inner(self) -> Box<dyn Any + Send> {
        self.payload
    }

    /// Resumes unwinding with the original payload.
    pub fn resume(self) -> ! {
        panic::resume_unwind(self.payload)
    }
}

impl fmt::Debug for Panic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Panic").field(&self.message()).finish()
    }
}

impl fmt::Display for Panic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panicked: {}", self.message())
    }
}

impl std::error::Error for Panic {}

// -----------------------------------------------------------------------------
// Ready

/// A sender that completes immediately with a stored signal.
#[derive(Debug)]
pub struct Ready<V, E> {
    completion: Completion<V, E>,
}

/// A sender that completes with `value`.
pub fn just<V, E>(value: V) -> Ready<V, E> {
    Ready {
        completion: Completion::Value(value),
    }
}

/// A sender that fails with `error`.
pub fn just_error<V, E>(error: E) -> Ready<V, E> {
    Ready {
        completion: Completion::Error(error),
    }
}

/// A sender that completes with the stopped signal.
pub fn just_stopped<V, E>() -> Ready<V, E> {
    Ready {
        completion: Completion::Stopped,
    }
}

impl<V, E> Ready<V, E> {
    /// Returns the stored signal without going through a receiver.
    pub fn into_completion(self) -> Completion<V, E> {
        self.completion
    }
}

impl<V, E> Sender for Ready<V, E> {
    type Value = V;
    type Error = E;

    fn connect<R>(self, receiver: R) -> impl OperationState
    where
        R: Receiver<V, E> + Send + 'static,
    {
        ReadyOperation {
            completion: Some(self.completion),
            receiver: Some(receiver),
        }
    }
}

struct ReadyOperation<V, E, R> {
    completion: Option<Completion<V, E>>,
    receiver: Option<R>,
}

impl<V, E, R> OperationState for ReadyOperation<V, E, R>
where
    R: Receiver<V, E>,
{
    fn start(&mut self) {
        if let (Some(completion), Some(receiver)) = (self.completion.take(), self.receiver.take()) {
            completion.deliver(receiver);
        }
    }
}

// -----------------------------------------------------------------------------
// Then

/// A sender that maps the value of another sender. Errors and the stopped
/// signal pass through untouched.
///
/// The function runs on whichever thread delivers the value. A panic in it is
/// passed on with [`Receiver::set_panic`].
pub struct Then<S, F> {
    sender: S,
    func: F,
}

impl<S, F, U> Sender for Then<S, F>
where
    S: Sender,
    F: FnOnce(S::Value) -> U + Send + 'static,
{
    type Value = U;
    type Error = S::Error;

    fn connect<R>(self, receiver: R) -> impl OperationState
    where
        R: Receiver<U, S::Error> + Send + 'static,
    {
        self.sender.connect(ThenReceiver {
            receiver,
            func: self.func,
        })
    }
}

struct ThenReceiver<R, F> {
    receiver: R,
    func: F,
}

impl<R, F, V, U, E> Receiver<V, E> for ThenReceiver<R, F>
where
    R: Receiver<U, E>,
    F: FnOnce(V) -> U,
{
    fn set_value(self, value: V) {
        let ThenReceiver { receiver, func } = self;
        match panic::catch_unwind(AssertUnwindSafe(|| func(value))) {
            Ok(mapped) => receiver.set_value(mapped),
            Err(payload) => receiver.set_panic(payload),
        }
    }

    fn set_error(self, error: E) {
        self.receiver.set_error(error);
    }

    fn set_stopped(self) {
        self.receiver.set_stopped();
    }

    fn set_panic(self, payload: Box<dyn Any + Send>) {
        self.receiver.set_panic(payload);
    }
}

// -----------------------------------------------------------------------------
// On a new thread

/// A sender that runs a closure on a fresh OS thread when started. A panic in
/// the closure is delivered as the error signal.
pub struct OnThread<F> {
    func: F,
}

/// Creates a sender that runs `func` on a new thread.
pub fn spawn_thread<F, T>(func: F) -> OnThread<F>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    OnThread { func }
}

impl<F, T> Sender for OnThread<F>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    type Value = T;
    type Error = Panic;

    fn connect<R>(self, receiver: R) -> impl OperationState
    where
        R: Receiver<T, Panic> + Send + 'static,
    {
        OnThreadOperation {
            func: Some(self.func),
            receiver: Some(receiver),
        }
    }
}

struct OnThreadOperation<F, R> {
    func: Option<F>,
    receiver: Option<R>,
}

impl<F, T, R> OperationState for OnThreadOperation<F, R>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
    R: Receiver<T, Panic> + Send + 'static,
{
    fn start(&mut self) {
        let (Some(func), Some(receiver)) = (self.func.take(), self.receiver.take()) else {
            return;
        };
        thread::spawn(move || match panic::catch_unwind(AssertUnwindSafe(func)) {
            Ok(value) => receiver.set_value(value),
            Err(payload) => receiver.set_error(Panic::new(payload)),
        });
    }
}

// -----------------------------------------------------------------------------
// Futures

/// A sender that drives a future to completion. The future is polled on
/// whichever thread wakes it, starting with the thread that starts the
/// operation. A panic while polling is delivered as the error signal.
pub struct FutureSender<Fut> {
    future: Fut,
}

/// Creates a sender from a future.
pub fn from_future<Fut>(future: Fut) -> FutureSender<Fut>
where
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    FutureSender { future }
}

impl<Fut> Sender for FutureSender<Fut>
where
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    type Value = Fut::Output;
    type Error = Panic;

    fn connect<R>(self, receiver: R) -> impl OperationState
    where
        R: Receiver<Fut::Output, Panic> + Send + 'static,
    {
        FutureOperation {
            deliver: Some(Deliver {
                future: Box::pin(self.future),
                receiver: Some(receiver),
            }),
        }
    }
}

struct FutureOperation<Fut, R> {
    deliver: Option<Deliver<Fut, R>>,
}

impl<Fut, R> OperationState for FutureOperation<Fut, R>
where
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
    R: Receiver<Fut::Output, Panic> + Send + 'static,
{
    fn start(&mut self) {
        let Some(deliver) = self.deliver.take() else {
            return;
        };
        let (runnable, task) = async_task::spawn(deliver, schedule_local);
        // Completion is reported through the receiver, not the task handle.
        task.detach();
        runnable.schedule();
    }
}

/// Polls the inner future and signals the receiver with its outcome.
struct Deliver<Fut, R> {
    future: Pin<Box<Fut>>,
    receiver: Option<R>,
}

// The future is boxed and the receiver is never pinned.
impl<Fut, R> Unpin for Deliver<Fut, R> {}

impl<Fut, R> Future for Deliver<Fut, R>
where
    Fut: Future,
    R: Receiver<Fut::Output, Panic>,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let polled = panic::catch_unwind(AssertUnwindSafe(|| this.future.as_mut().poll(cx)));
        let outcome = match polled {
            Ok(Poll::Pending) => return Poll::Pending,
            Ok(Poll::Ready(value)) => Completion::Value(value),
            Err(payload) => Completion::Error(Panic::new(payload)),
        };
        if let Some(receiver) = this.receiver.take() {
            outcome.deliver(receiver);
        }
        Poll::Ready(())
    }
}

thread_local! {
    /// Runnables woken while this thread is already running one.
    static LOCAL_RUNNABLES: RefCell<Option<VecDeque<Runnable>>> = const { RefCell::new(None) };
}

/// Runs a woken task on the waking thread. A task woken from inside another
/// task's poll is queued and run once that poll returns, so wake-ups never
/// recurse.
fn schedule_local(runnable: Runnable) {
    let runnable = LOCAL_RUNNABLES.with(|local| match local.borrow_mut().as_mut() {
        Some(queue) => {
            queue.push_back(runnable);
            None
        }
        None => Some(runnable),
    });
    let Some(runnable) = runnable else {
        return;
    };

    LOCAL_RUNNABLES.with(|local| *local.borrow_mut() = Some(VecDeque::new()));
    let _reset = CallOnDrop(|| LOCAL_RUNNABLES.with(|local| *local.borrow_mut() = None));

    let mut next = Some(runnable);
    while let Some(runnable) = next {
        runnable.run();
        next = LOCAL_RUNNABLES.with(|local| local.borrow_mut().as_mut().and_then(VecDeque::pop_front));
    }
}

// -----------------------------------------------------------------------------
// Combinators

/// Adapters available on every sender.
pub trait SenderExt: Sender {
    /// Maps the value signal of this sender.
    fn then<F, U>(self, func: F) -> Then<Self, F>
    where
        F: FnOnce(Self::Value) -> U + Send + 'static,
    {
        Then { sender: self, func }
    }

    /// Blocks until this sender completes. See [`sync_wait`].
    fn sync_wait(self) -> Result<Option<Self::Value>, Self::Error>
    where
        Self::Value: Send + 'static,
        Self::Error: Send + 'static,
    {
        sync_wait(self)
    }

    /// Blocks until this sender completes, converting the value into `V`. See
    /// [`sync_wait_with_variant`].
    fn sync_wait_with_variant<V>(self) -> Result<Option<V>, Self::Error>
    where
        Self::Value: Into<V> + Send + 'static,
        Self::Error: Send + 'static,
    {
        sync_wait_with_variant(self)
    }
}

impl<S: Sender> SenderExt for S {}

//! All-reduce: every site contributes a value, and every site receives the
//! values of all sites folded together.
//!
//! Deposits may arrive in any order. The deposit that fills the last slot
//! folds slots `1..n` into slot `0` in site order, so the result does not
//! depend on arrival order. Which site performs the fold is not specified, so
//! the operator must not have observable side effects that depend on it.

use std::{
    any::Any,
    fmt,
    future::Future,
    marker::PhantomData,
    mem,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
};

use tracing::{debug, warn};

use super::communicator::{Communicator, Generation};
use crate::{
    error::{Error, Result},
    execution::{OperationState, Receiver, Sender},
    sync_wait::sync_wait,
    util::panic_message,
};

// -----------------------------------------------------------------------------
// Exchange buffer

/// The typed state of one generation.
struct Exchange<T> {
    /// One slot per site. Slots are emptied by the fold.
    slots: Vec<Option<T>>,
    deposited: Vec<bool>,
    arrived: usize,
    /// The folded value, or the message of a panic raised by the operator.
    /// Set once; its presence means the data is available.
    result: Option<std::result::Result<T, String>>,
    /// The handle of each site waiting for the result.
    waiters: Vec<Option<Waiter<T>>>,
}

enum Waiter<T> {
    Task(Waker),
    Receiver(Box<dyn FnOnce(Result<T>) + Send>),
}

impl<T: Clone> Exchange<T> {
    fn new(num_sites: usize) -> Exchange<T> {
        Exchange {
            slots: (0..num_sites).map(|_| None).collect(),
            deposited: vec![false; num_sites],
            arrived: 0,
            result: None,
            waiters: (0..num_sites).map(|_| None).collect(),
        }
    }

    fn result(&self) -> Option<Result<T>> {
        self.result.as_ref().map(|result| match result {
            Ok(value) => Ok(value.clone()),
            Err(message) => Err(Error::OperatorPanicked {
                message: message.clone(),
            }),
        })
    }

    /// Folds every slot into the first one, in site order.
    fn finalize<F>(&mut self, mut op: F)
    where
        F: FnMut(T, T) -> T,
    {
        let mut values = mem::take(&mut self.slots).into_iter().flatten();
        let folded = panic::catch_unwind(AssertUnwindSafe(|| {
            let first = values.next();
            first.map(|first| values.fold(first, &mut op))
        }));
        self.result = Some(match folded {
            Ok(Some(value)) => Ok(value),
            Ok(None) => unreachable!("a finished generation holds every deposit"),
            Err(payload) => Err(panic_message(&*payload)),
        });
    }
}

/// Runs `f` on the exchange of a generation, which must hold values of type
/// `T`.
fn with_exchange<T, R>(
    generation: &Generation,
    f: impl FnOnce(&mut Exchange<T>) -> R,
) -> Option<R>
where
    T: Send + 'static,
{
    let mut state = generation.state.lock();
    let exchange = state.exchange.as_mut()?.downcast_mut::<Exchange<T>>()?;
    Some(f(exchange))
}

// -----------------------------------------------------------------------------
// Deposits

impl Communicator {
    /// Records `value` as the contribution of `site` to `generation`. The
    /// deposit that completes the generation folds all values with `op`
    /// before returning, and wakes every waiting site.
    ///
    /// Fails without depositing if the generation is zero, if the site is out
    /// of range or already deposited, or if the generation holds values of
    /// another type.
    pub fn deposit_and_maybe_finalize<T, F>(
        &self,
        site: usize,
        generation: u64,
        value: T,
        op: F,
    ) -> Result<AllReduce<T>>
    where
        T: Clone + Send + 'static,
        F: FnMut(T, T) -> T,
    {
        if generation == 0 {
            return Err(Error::bad_parameter(
                "all_reduce",
                "the generation number shouldn't be zero",
            ));
        }
        let num_sites = self.num_sites();
        if site >= num_sites {
            return Err(Error::SiteOutOfRange { site, num_sites });
        }

        let live = self.rendezvous.generation(generation);
        let woken = {
            let mut state = live.state.lock();
            let exchange = state.exchange.get_or_insert_with(|| {
                Box::new(Exchange::<T>::new(num_sites)) as Box<dyn Any + Send>
            });
            let Some(exchange) = exchange.downcast_mut::<Exchange<T>>() else {
                return Err(Error::TypeMismatch {
                    basename: self.basename().to_owned(),
                    generation,
                });
            };
            if exchange.deposited[site] {
                return Err(Error::DuplicateDeposit { site, generation });
            }

            exchange.deposited[site] = true;
            exchange.slots[site] = Some(value);
            exchange.arrived += 1;

            if exchange.arrived == num_sites {
                exchange.finalize(op);
                match &exchange.result {
                    Some(Ok(_)) => {
                        debug!(basename = self.basename(), generation, site, "generation reduced")
                    }
                    Some(Err(message)) => warn!(
                        basename = self.basename(),
                        generation,
                        site,
                        message = %message,
                        "reduction operator panicked"
                    ),
                    None => {}
                }
                let waiters: Vec<_> = exchange.waiters.iter_mut().filter_map(Option::take).collect();
                waiters
                    .into_iter()
                    .map(|waiter| (waiter, exchange.result()))
                    .collect()
            } else {
                Vec::new()
            }
        };

        // Waiters run user code, so they are fired outside of the lock.
        for (waiter, result) in woken {
            match waiter {
                Waiter::Task(waker) => waker.wake(),
                Waiter::Receiver(deliver) => {
                    if let Some(result) = result {
                        deliver(result);
                    }
                }
            }
        }

        Ok(AllReduce {
            communicator: self.clone(),
            generation: live,
            site,
            _marker: PhantomData,
        })
    }
}

// -----------------------------------------------------------------------------
// Result handle

/// The pending result of an all-reduce for one site.
///
/// The handle can be awaited as a future, waited on with [`AllReduce::get`],
/// or used as a [`Sender`]. It keeps the communicator alive, and the
/// generation is released once every site's handle is dropped.
#[must_use = "the result of an all-reduce is only available through its handle"]
pub struct AllReduce<T> {
    communicator: Communicator,
    generation: Arc<Generation>,
    site: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AllReduce<T>
where
    T: Clone + Send + 'static,
{
    /// Blocks the calling thread until every site has deposited, then returns
    /// the reduced value.
    pub fn get(self) -> Result<T> {
        match sync_wait(self)? {
            Some(value) => Ok(value),
            None => unreachable!("an all-reduce never completes with the stopped signal"),
        }
    }

    /// Returns the reduced value if it is already available.
    pub fn try_get(&self) -> Option<Result<T>> {
        with_exchange(&self.generation, |exchange: &mut Exchange<T>| exchange.result()).flatten()
    }

    pub fn generation(&self) -> u64 {
        self.generation.number
    }

    pub fn site(&self) -> usize {
        self.site
    }

    pub fn communicator(&self) -> &Communicator {
        &self.communicator
    }

    /// Returns the result, or registers `waiter` to be fired once it exists.
    fn result_or_wait(&self, waiter: impl FnOnce() -> Waiter<T>) -> Option<Result<T>> {
        with_exchange(&self.generation, |exchange: &mut Exchange<T>| {
            let result = exchange.result();
            if result.is_none() {
                exchange.waiters[self.site] = Some(waiter());
            }
            result
        })
        .flatten()
    }
}

impl<T> fmt::Debug for AllReduce<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllReduce")
            .field("basename", &self.communicator.basename())
            .field("generation", &self.generation.number)
            .field("site", &self.site)
            .finish()
    }
}

impl<T> Drop for AllReduce<T> {
    fn drop(&mut self) {
        self.communicator.rendezvous.release(&self.generation);
    }
}

impl<T> Future for AllReduce<T>
where
    T: Clone + Send + 'static,
{
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<T>> {
        match self.result_or_wait(|| Waiter::Task(cx.waker().clone())) {
            Some(result) => Poll::Ready(result),
            None => Poll::Pending,
        }
    }
}

impl<T> Sender for AllReduce<T>
where
    T: Clone + Send + 'static,
{
    type Value = T;
    type Error = Error;

    fn connect<R>(self, receiver: R) -> impl OperationState
    where
        R: Receiver<T, Error> + Send + 'static,
    {
        AllReduceOperation {
            handle: self,
            receiver: Some(receiver),
        }
    }
}

struct AllReduceOperation<T, R> {
    handle: AllReduce<T>,
    receiver: Option<R>,
}

impl<T, R> OperationState for AllReduceOperation<T, R>
where
    T: Clone + Send + 'static,
    R: Receiver<T, Error> + Send + 'static,
{
    fn start(&mut self) {
        let Some(receiver) = self.receiver.take() else {
            return;
        };
        // The receiver moves into the waiter only if the result is pending.
        let mut receiver = Some(receiver);
        let ready = self.handle.result_or_wait(|| {
            let receiver = receiver.take();
            Waiter::Receiver(Box::new(move |result: Result<T>| {
                if let Some(receiver) = receiver {
                    deliver(receiver, result);
                }
            }))
        });
        if let (Some(result), Some(receiver)) = (ready, receiver) {
            deliver(receiver, result);
        }
    }
}

fn deliver<T, R: Receiver<T, Error>>(receiver: R, result: Result<T>) {
    match result {
        Ok(value) => receiver.set_value(value),
        Err(error) => receiver.set_error(error),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::collectives::{CollectiveArgs, Fabric};

    fn communicators(num_sites: usize, basename: &str) -> Vec<Communicator> {
        Fabric::new(num_sites)
            .unwrap()
            .sites()
            .iter()
            .map(|site| {
                site.create_communicator(basename, CollectiveArgs::default())
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn the_fold_runs_in_site_order() {
        let comms = communicators(3, "order");
        let c = comms[2].deposit_and_maybe_finalize(2, 1, "c".to_owned(), |a, b| a + &b).unwrap();
        let a = comms[0].deposit_and_maybe_finalize(0, 1, "a".to_owned(), |a, b| a + &b).unwrap();
        assert!(a.try_get().is_none());
        let b = comms[1].deposit_and_maybe_finalize(1, 1, "b".to_owned(), |a, b| a + &b).unwrap();
        for handle in [a, b, c] {
            assert_eq!(handle.get().unwrap(), "abc");
        }
    }

    #[test]
    fn a_single_site_gets_its_own_value() {
        let comms = communicators(1, "single");
        let folded = AtomicBool::new(false);
        let handle = comms[0]
            .all_reduce(
                5,
                |a, b| {
                    folded.store(true, Ordering::Relaxed);
                    a + b
                },
                CollectiveArgs::default(),
            )
            .unwrap();
        assert_eq!(handle.get().unwrap(), 5);
        assert!(!folded.load(Ordering::Relaxed));
    }

    #[test]
    fn deposit_errors() {
        let comms = communicators(2, "errors");
        let add = |a: u32, b: u32| a + b;
        assert!(comms[0]
            .deposit_and_maybe_finalize(0, 0, 1, add)
            .unwrap_err()
            .is_bad_parameter());
        assert!(matches!(
            comms[0].deposit_and_maybe_finalize(2, 1, 1, add),
            Err(Error::SiteOutOfRange { site: 2, num_sites: 2 })
        ));
        let first = comms[0].deposit_and_maybe_finalize(0, 1, 1u32, add).unwrap();
        assert!(matches!(
            comms[0].deposit_and_maybe_finalize(0, 1, 1u32, add),
            Err(Error::DuplicateDeposit { site: 0, generation: 1 })
        ));
        assert!(matches!(
            comms[1].deposit_and_maybe_finalize(1, 1, 1u64, |a, b| a + b),
            Err(Error::TypeMismatch { generation: 1, .. })
        ));
        let second = comms[1].deposit_and_maybe_finalize(1, 1, 2u32, add).unwrap();
        assert_eq!(first.get().unwrap(), 3);
        assert_eq!(second.get().unwrap(), 3);
    }

    #[test]
    fn operator_panics_reach_every_site() {
        let comms = communicators(2, "panics");
        let overflow = |_: i32, _: i32| -> i32 { panic!("overflow") };
        let first = comms[0].all_reduce(1, overflow, CollectiveArgs::default()).unwrap();
        let second = comms[1].all_reduce(2, overflow, CollectiveArgs::default()).unwrap();
        for handle in [first, second] {
            match handle.get() {
                Err(Error::OperatorPanicked { message }) => assert_eq!(message, "overflow"),
                other => panic!("unexpected result {other:?}"),
            }
        }
    }

    #[test]
    fn generations_close_after_every_handle_is_dropped() {
        let comms = communicators(2, "teardown");
        let first = comms[0].all_reduce(1, |a, b| a + b, CollectiveArgs::default()).unwrap();
        assert_eq!(comms[0].active_generations(), 1);
        let second = comms[1].all_reduce(2, |a, b| a + b, CollectiveArgs::default()).unwrap();
        assert_eq!(first.get().unwrap(), 3);
        assert_eq!(comms[0].active_generations(), 1);
        drop(second);
        assert_eq!(comms[0].active_generations(), 0);
    }
}

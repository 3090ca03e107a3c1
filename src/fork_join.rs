//! A fork-join executor: a parallel region over a fixed set of processing
//! units.
//!
//! The executor spawns one worker thread for every processing unit in its mask
//! except the caller's own. The thread that runs a bulk operation takes part in
//! it as one more participant, so a bulk call returns only once every
//! participant has finished its share.
//!
//! Between bulk calls the workers stay parked on their unit. They spin for the
//! configured yield delay waiting for the next region, then go to sleep until
//! they are woken up by new work or by the executor being dropped. Starting
//! threads is slow, so an executor should be reused for many adjacent bulk
//! operations.

use std::{
    borrow::Cow,
    cell::UnsafeCell,
    fmt,
    ops::Range,
    panic::{self, AssertUnwindSafe},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::{
    error::{Error, Result},
    execution::{just, just_error, Panic, Ready},
    job::{JobRef, RegionJob},
    latch::{spin_for, AtomicLatch, CountLatch, Latch, Probe},
    shape::block_range,
    topology::{default_topology, CpuMask, Topology},
    util::CallOnDrop,
};

// -----------------------------------------------------------------------------
// Parameters

/// The scheduling priority requested for worker threads. Priorities are passed
/// on to the topology layer as placement hints; this crate does not change
/// operating system priorities itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadPriority {
    Default,
    Low,
    Normal,
    High,
    /// Workers stay on their processing unit for the executor's lifetime.
    #[default]
    Bound,
}

/// The stack size of worker threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StackSize {
    #[default]
    Small,
    Medium,
    Large,
    Huge,
    /// Stackless execution. Parallel regions cannot run on stackless threads,
    /// so executors reject it.
    NoStack,
}

impl StackSize {
    /// Returns the stack size in bytes, or `None` for [`StackSize::NoStack`].
    pub fn bytes(self) -> Option<usize> {
        match self {
            StackSize::Small => Some(512 * 1024),
            StackSize::Medium => Some(1024 * 1024),
            StackSize::Large => Some(2 * 1024 * 1024),
            StackSize::Huge => Some(8 * 1024 * 1024),
            StackSize::NoStack => None,
        }
    }
}

/// How the indices of a bulk operation are spread over the participants of a
/// region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopSchedule {
    /// Each participant runs one contiguous, balanced block of the shape.
    #[default]
    Static,
    /// Participants claim indices one at a time from a shared cursor.
    Dynamic,
}

/// Construction parameters for fork-join executors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkJoinParams {
    pub priority: ThreadPriority,
    pub stack_size: StackSize,
    pub schedule: LoopSchedule,
    /// How long an idle worker spins waiting for the next region before it
    /// goes to sleep.
    pub yield_delay: Duration,
}

impl Default for ForkJoinParams {
    fn default() -> Self {
        ForkJoinParams {
            priority: ThreadPriority::Bound,
            stack_size: StackSize::Small,
            schedule: LoopSchedule::Static,
            yield_delay: Duration::from_millis(1),
        }
    }
}

impl ForkJoinParams {
    pub fn priority(mut self, priority: ThreadPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn stack_size(mut self, stack_size: StackSize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn schedule(mut self, schedule: LoopSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn yield_delay(mut self, yield_delay: Duration) -> Self {
        self.yield_delay = yield_delay;
        self
    }
}

// -----------------------------------------------------------------------------
// Annotations

/// Executors that carry a human readable label for diagnostics.
pub trait Annotate: Sized {
    /// Returns a copy of the executor carrying the given annotation. The copy
    /// shares the worker threads of the original.
    fn with_annotation(&self, annotation: impl Into<Cow<'static, str>>) -> Self;

    /// Returns the annotation, if any.
    fn annotation(&self) -> Option<&str>;
}

// -----------------------------------------------------------------------------
// Region types

/// A fork-join executor. Cloning it produces another view of the same worker
/// threads; the threads are stopped when the last view is dropped.
///
/// Bulk operations on one executor must not overlap. Starting a bulk operation
/// while another one is running on the same executor panics.
#[derive(Clone)]
pub struct ForkJoinExecutor {
    owner: Arc<RegionOwner>,
    annotation: Option<Arc<str>>,
}

/// Stops the region when the last executor view goes away. Worker threads
/// hold the region itself, so the region cannot do this from its own `Drop`.
struct RegionOwner {
    region: Arc<Region>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

struct Region {
    topology: Arc<dyn Topology>,
    params: ForkJoinParams,
    /// The processing unit of each participant, in participant order.
    pus: Box<[usize]>,
    /// The participant slot taken by the thread that runs a bulk operation.
    /// It has no worker thread.
    main_index: usize,
    /// Per-participant control data. The slot at `main_index` is unused.
    threads: Box<[CachePadded<ThreadControl>]>,
    /// Incremented each time a region is published.
    epoch: CachePadded<AtomicUsize>,
    /// The region published under the current epoch.
    dispatch: UnsafeCell<Option<Dispatch>>,
    /// Set while a bulk operation runs.
    busy: AtomicBool,
    /// Tells the workers to exit their main loop.
    should_terminate: AtomicLatch,
}

/// A published region: the job every worker runs, and the latch each worker
/// sets when it is done.
#[derive(Clone, Copy)]
struct Dispatch {
    job: JobRef,
    completed: *const CountLatch,
}

// SAFETY: `dispatch` is written only by the thread holding `busy`, and only
// while no worker is reading it: workers read it after observing a new epoch
// and finish reading before they set the completion latch, which the writer
// waits on before it can publish again.
unsafe impl Sync for Region {}
unsafe impl Send for Region {}

/// Sleep and wake-up controls for one worker thread.
struct ThreadControl {
    /// Set to true when the worker is sleeping.
    is_sleeping: Mutex<bool>,
    /// Used to wake a sleeping worker.
    awakened: Condvar,
    /// Set to true once the worker has entered its main loop.
    is_running: Mutex<bool>,
    /// Used to tell the constructor the worker is ready.
    synchronized: Condvar,
}

impl ThreadControl {
    fn new() -> ThreadControl {
        ThreadControl {
            is_sleeping: Mutex::new(false),
            awakened: Condvar::new(),
            is_running: Mutex::new(false),
            synchronized: Condvar::new(),
        }
    }

    /// The constructor calls this to wait until the worker is parked.
    fn await_ready(&self) {
        let mut is_running = self.is_running.lock();
        while !*is_running {
            self.synchronized.wait(&mut is_running);
        }
    }

    /// The worker calls this as it enters its main loop.
    fn post_ready_status(&self) {
        let mut is_running = self.is_running.lock();
        *is_running = true;
        self.synchronized.notify_all();
    }

    /// Wakes the worker if it is asleep. Returns `true` if it was.
    fn wake(&self) -> bool {
        let mut is_sleeping = self.is_sleeping.lock();
        if *is_sleeping {
            *is_sleeping = false;
            self.awakened.notify_one();
            true
        } else {
            false
        }
    }

    /// Puts the worker to sleep until it is woken, unless the probe opens
    /// first. The probe is re-checked under the lock so that a wake-up sent
    /// between the last check and going to sleep is not lost.
    fn sleep_unless<P: Probe>(&self, probe: &P) {
        let mut is_sleeping = self.is_sleeping.lock();
        if probe.probe() {
            return;
        }
        *is_sleeping = true;
        while *is_sleeping {
            self.awakened.wait(&mut is_sleeping);
        }
    }
}

/// Opens when a new region is published or the executor shuts down.
struct WorkProbe<'a> {
    region: &'a Region,
    seen_epoch: usize,
}

impl Probe for WorkProbe<'_> {
    fn probe(&self) -> bool {
        self.region.epoch.load(Ordering::Acquire) != self.seen_epoch
            || self.region.should_terminate.probe()
    }
}

// -----------------------------------------------------------------------------
// Construction

impl ForkJoinExecutor {
    /// Creates an executor over the processing units in `mask`, using the
    /// default topology. The calling thread must run on one of those units.
    pub fn new(mask: &CpuMask, params: ForkJoinParams) -> Result<ForkJoinExecutor> {
        ForkJoinExecutor::with_topology(default_topology(), mask, params)
    }

    /// Creates an executor over the processing units in `mask`.
    pub fn with_topology(
        topology: Arc<dyn Topology>,
        mask: &CpuMask,
        params: ForkJoinParams,
    ) -> Result<ForkJoinExecutor> {
        if mask.is_empty() {
            return Err(Error::bad_parameter(
                "ForkJoinExecutor::new",
                "the mask must contain at least one processing unit",
            ));
        }
        ForkJoinExecutor::with_placement(topology, mask.iter().collect(), params)
    }

    /// Creates an executor whose participants run on `pus`, in that order.
    /// Participant `i` of a static schedule always runs on `pus[i]`.
    pub(crate) fn with_placement(
        topology: Arc<dyn Topology>,
        pus: Vec<usize>,
        params: ForkJoinParams,
    ) -> Result<ForkJoinExecutor> {
        const OPERATION: &str = "ForkJoinExecutor::new";

        let Some(stack_bytes) = params.stack_size.bytes() else {
            return Err(Error::bad_parameter(
                OPERATION,
                "worker threads need a stack, StackSize::NoStack is not supported",
            ));
        };

        let this_pu = topology.current_pu();
        let Some(main_index) = pus.iter().position(|&pu| pu == this_pu) else {
            return Err(Error::bad_parameter(
                OPERATION,
                format!(
                    "the thread used to initialize the executor (processing unit {this_pu}) \
                     should be part of the given mask"
                ),
            ));
        };

        let region = Arc::new(Region {
            topology,
            params,
            threads: pus
                .iter()
                .map(|_| CachePadded::new(ThreadControl::new()))
                .collect(),
            pus: pus.into_boxed_slice(),
            main_index,
            epoch: CachePadded::new(AtomicUsize::new(0)),
            dispatch: UnsafeCell::new(None),
            busy: AtomicBool::new(false),
            should_terminate: AtomicLatch::new(),
        });

        let owner = RegionOwner {
            region: Arc::clone(&region),
            handles: Mutex::new(Vec::with_capacity(region.pus.len())),
        };

        for (index, &pu) in region.pus.iter().enumerate() {
            if index == main_index {
                continue;
            }
            let worker_region = Arc::clone(&region);
            let spawned = thread::Builder::new()
                .name(format!("tutti-worker-{pu}"))
                .stack_size(stack_bytes)
                .spawn(move || worker_loop(worker_region, index));
            match spawned {
                Ok(handle) => owner.handles.lock().push(handle),
                Err(err) => {
                    warn!(pu, error = %err, "failed to spawn region worker");
                    // Dropping the owner stops the workers spawned so far.
                    return Err(Error::Spawn(err));
                }
            }
        }

        for (index, control) in region.threads.iter().enumerate() {
            if index != main_index {
                control.await_ready();
            }
        }

        debug!(
            threads = region.pus.len(),
            main_pu = this_pu,
            priority = ?params.priority,
            schedule = ?params.schedule,
            "fork-join region started"
        );

        Ok(ForkJoinExecutor {
            owner: Arc::new(owner),
            annotation: None,
        })
    }
}

// -----------------------------------------------------------------------------
// Bulk execution

impl ForkJoinExecutor {
    /// Runs `f(i)` for every index `i` of `shape` across the region and blocks
    /// until all of them have returned.
    ///
    /// If any invocation panics, the remaining participants still finish their
    /// share, then the first panic is resumed on the caller.
    pub fn bulk_execute<F>(&self, f: F, shape: Range<usize>)
    where
        F: Fn(usize) + Sync,
    {
        let region = &*self.owner.region;
        if region
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            panic!("bulk operations on one fork-join executor must not overlap");
        }
        let _busy = CallOnDrop(|| region.busy.store(false, Ordering::Release));

        trace!(
            annotation = self.annotation(),
            start = shape.start,
            end = shape.end,
            "bulk execute"
        );

        let num_threads = region.pus.len();
        if num_threads == 1 {
            shape.for_each(f);
            return;
        }
        if shape.is_empty() {
            return;
        }

        let cursor = AtomicUsize::new(shape.start);
        let schedule = region.params.schedule;
        let job = RegionJob::new(|participant| match schedule {
            LoopSchedule::Static => block_range(&shape, participant, num_threads).for_each(&f),
            LoopSchedule::Dynamic => loop {
                let index = cursor.fetch_add(1, Ordering::Relaxed);
                if index >= shape.end {
                    break;
                }
                f(index);
            },
        });
        let completed = CountLatch::with_count(num_threads - 1);

        // SAFETY: The job and the latch live until the end of this function,
        // which does not return before every worker has set the latch, and
        // workers never touch either after that.
        unsafe { region.publish(job.as_job_ref(), &completed) };
        job.run_inline(region.main_index);
        completed.wait();

        if let Some(payload) = job.take_panic() {
            panic::resume_unwind(payload);
        }
    }

    /// The asynchronous form of [`ForkJoinExecutor::bulk_execute`].
    ///
    /// The calling thread is a participant of the region, so no pending handle
    /// can be returned before the work is done. The region runs to completion
    /// and the outcome is returned as an already completed sender, with a
    /// panic reported as its error.
    pub fn bulk_async_execute<F>(&self, f: F, shape: Range<usize>) -> Ready<(), Panic>
    where
        F: Fn(usize) + Sync,
    {
        match panic::catch_unwind(AssertUnwindSafe(|| self.bulk_execute(f, shape))) {
            Ok(()) => just(()),
            Err(payload) => just_error(Panic::new(payload)),
        }
    }

    /// Returns the number of participants in a region, including the caller.
    pub fn num_threads(&self) -> usize {
        self.owner.region.pus.len()
    }

    /// Returns the processing unit of each participant.
    pub fn pus(&self) -> &[usize] {
        &self.owner.region.pus
    }

    pub fn params(&self) -> &ForkJoinParams {
        &self.owner.region.params
    }
}

impl Region {
    /// Publishes a region and wakes sleeping workers.
    ///
    /// # Safety
    ///
    /// The caller must hold `busy`, and `job` and `completed` must stay valid
    /// until `completed` opens.
    unsafe fn publish(&self, job: JobRef, completed: &CountLatch) {
        // SAFETY: Holding `busy` and having waited out the previous region
        // means no worker reads `dispatch` right now.
        unsafe {
            *self.dispatch.get() = Some(Dispatch {
                job,
                completed: completed as *const CountLatch,
            });
        }
        self.epoch.fetch_add(1, Ordering::Release);
        for (index, control) in self.threads.iter().enumerate() {
            if index != self.main_index {
                control.wake();
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Worker main loop

/// The main loop of a region worker: wait for a region to be published, run
/// this participant's share of it, repeat until terminated.
fn worker_loop(region: Arc<Region>, index: usize) {
    let pu = region.pus[index];
    region.topology.bind_current_thread(pu);

    let control = &region.threads[index];
    control.post_ready_status();
    debug!(pu, index, "region worker parked");

    let mut seen_epoch = 0;
    loop {
        let probe = WorkProbe {
            region: &region,
            seen_epoch,
        };
        if !spin_for(&probe, region.params.yield_delay) {
            control.sleep_unless(&probe);
        }

        if region.should_terminate.probe() {
            break;
        }

        let epoch = region.epoch.load(Ordering::Acquire);
        if epoch == seen_epoch {
            // Woken without new work.
            continue;
        }
        seen_epoch = epoch;

        // SAFETY: A new epoch was published with release ordering after the
        // dispatch was written, and the publisher waits for our latch before
        // writing it again.
        let Some(dispatch) = (unsafe { *region.dispatch.get() }) else {
            continue;
        };
        // SAFETY: The publisher keeps the job and the latch alive until every
        // worker has set the latch, and the latch is the last thing we touch.
        unsafe {
            dispatch.job.execute(index);
            Latch::set(dispatch.completed);
        }
    }

    debug!(pu, index, "region worker stopped");
}

// -----------------------------------------------------------------------------
// Teardown

impl Drop for RegionOwner {
    fn drop(&mut self) {
        // SAFETY: The latch is owned by the region, which we keep alive.
        unsafe { Latch::set(&self.region.should_terminate) };
        for (index, control) in self.region.threads.iter().enumerate() {
            if index != self.region.main_index {
                control.wake();
            }
        }
        let current = thread::current().id();
        for handle in self.handles.get_mut().drain(..) {
            // A worker dropping the last view of its own region cannot join
            // itself. It exits its loop on its own once the closure returns.
            if handle.thread().id() != current && handle.join().is_err() {
                warn!("region worker panicked outside of a region");
            }
        }
        debug!(threads = self.region.pus.len(), "fork-join region stopped");
    }
}

// -----------------------------------------------------------------------------
// Identity and annotations

impl PartialEq for ForkJoinExecutor {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.owner, &other.owner)
    }
}

impl Eq for ForkJoinExecutor {}

impl Annotate for ForkJoinExecutor {
    fn with_annotation(&self, annotation: impl Into<Cow<'static, str>>) -> Self {
        ForkJoinExecutor {
            owner: Arc::clone(&self.owner),
            annotation: Some(Arc::from(annotation.into())),
        }
    }

    fn annotation(&self) -> Option<&str> {
        self.annotation.as_deref()
    }
}

impl fmt::Debug for ForkJoinExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForkJoinExecutor")
            .field("pus", &self.pus())
            .field("params", self.params())
            .field("annotation", &self.annotation)
            .finish()
    }
}

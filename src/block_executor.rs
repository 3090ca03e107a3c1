//! A hierarchical fork-join executor that spans several hardware targets.
//!
//! The executor owns one [`ForkJoinExecutor`] per target, plus an *outer*
//! executor with exactly one participant per target. A bulk operation is split
//! into one contiguous block per target, and the outer executor hands each
//! block to the matching inner executor in parallel.
//!
//! With a single target there is no hierarchy: the outer executor spans the
//! whole target and bulk operations are forwarded to it directly.

use std::{borrow::Cow, fmt, ops::Range, panic, sync::Arc};

use tracing::debug;

use crate::{
    error::{Error, Result},
    execution::{just, just_error, Panic, Ready},
    fork_join::{Annotate, ForkJoinExecutor, ForkJoinParams, LoopSchedule},
    shape::block_range,
    topology::{default_topology, CpuMask, Target, Topology},
    util::Slot,
};

const CONSTRUCTION: &str = "BlockForkJoinExecutor::new";

/// A fork-join executor over a set of targets, usually NUMA domains.
///
/// Cloning produces another view of the same worker threads. Views compare
/// equal when they share their executors. Bulk operations on one executor must
/// not overlap.
#[derive(Clone)]
pub struct BlockForkJoinExecutor {
    outer: ForkJoinExecutor,
    /// One executor per target, empty when there is only one target.
    inner: Arc<[ForkJoinExecutor]>,
    targets: Arc<[Target]>,
}

impl BlockForkJoinExecutor {
    /// Creates an executor with one target per NUMA domain of the default
    /// topology.
    pub fn new(params: ForkJoinParams) -> Result<BlockForkJoinExecutor> {
        let topology = default_topology();
        let targets = topology.numa_domains();
        BlockForkJoinExecutor::with_topology(topology, targets, params)
    }

    /// Creates an executor over the given targets, using the default topology.
    pub fn with_targets(
        targets: Vec<Target>,
        params: ForkJoinParams,
    ) -> Result<BlockForkJoinExecutor> {
        BlockForkJoinExecutor::with_topology(default_topology(), targets, params)
    }

    /// Creates an executor over the given targets.
    ///
    /// The calling thread must run on a processing unit of one of the targets.
    /// It becomes a participant of every bulk operation, as a member of that
    /// target.
    pub fn with_topology(
        topology: Arc<dyn Topology>,
        targets: Vec<Target>,
        params: ForkJoinParams,
    ) -> Result<BlockForkJoinExecutor> {
        if params.stack_size.bytes().is_none() {
            return Err(Error::bad_parameter(
                CONSTRUCTION,
                "worker threads need a stack, StackSize::NoStack is not supported",
            ));
        }
        if targets.is_empty() {
            return Err(Error::bad_parameter(
                CONSTRUCTION,
                "at least one target is required",
            ));
        }

        let this_pu = topology.current_pu();
        let all = targets
            .iter()
            .fold(CpuMask::default(), |all, target| all.union(target.mask()));
        if !all.test(this_pu) {
            return Err(Error::bad_parameter(
                CONSTRUCTION,
                format!(
                    "the thread used to initialize the executor (processing unit {this_pu}) \
                     should be part of the given targets"
                ),
            ));
        }

        let targets: Arc<[Target]> = targets.into();

        if let [target] = &*targets {
            let outer = ForkJoinExecutor::with_topology(topology, target.mask(), params)?;
            debug!(targets = 1, "block executor started without hierarchy");
            return Ok(BlockForkJoinExecutor {
                outer,
                inner: Arc::from([]),
                targets,
            });
        }

        let pus = representative_pus(&targets, this_pu)?;
        let outer = ForkJoinExecutor::with_placement(
            Arc::clone(&topology),
            pus,
            params.schedule(LoopSchedule::Static),
        )?;

        // Each inner executor is built by the outer participant that runs on
        // its target, so that participant becomes the inner region's caller.
        let slots: Vec<Slot<Result<ForkJoinExecutor>>> =
            targets.iter().map(|_| Slot::empty()).collect();
        outer.bulk_execute(
            |index| {
                let inner = ForkJoinExecutor::with_topology(
                    Arc::clone(&topology),
                    targets[index].mask(),
                    params,
                );
                let _ = slots[index].put(inner);
            },
            0..targets.len(),
        );

        let mut inner = Vec::with_capacity(targets.len());
        for slot in slots {
            match slot.into_inner() {
                Some(executor) => inner.push(executor?),
                None => unreachable!("every target is initialized by the outer region"),
            }
        }

        debug!(
            targets = targets.len(),
            threads = inner.iter().map(ForkJoinExecutor::num_threads).sum::<usize>(),
            "block executor started"
        );

        Ok(BlockForkJoinExecutor {
            outer,
            inner: inner.into(),
            targets,
        })
    }

    /// Runs `f(i)` for every index `i` of `shape` and blocks until all of them
    /// have returned.
    ///
    /// Target `t` of `P` runs the block `block_range(shape, t, P)` on its own
    /// executor. The first panic raised by `f` is resumed on the caller once
    /// every target has finished.
    pub fn bulk_execute<F>(&self, f: F, shape: Range<usize>)
    where
        F: Fn(usize) + Sync,
    {
        if self.inner.is_empty() {
            return self.outer.bulk_execute(f, shape);
        }

        let parts = self.inner.len();
        self.outer.bulk_execute(
            |index| self.inner[index].bulk_execute(&f, block_range(&shape, index, parts)),
            0..parts,
        );
    }

    /// The asynchronous form of [`BlockForkJoinExecutor::bulk_execute`]. The
    /// caller takes part in the work, so the returned sender is already
    /// complete, with a panic reported as its error.
    pub fn bulk_async_execute<F>(&self, f: F, shape: Range<usize>) -> Ready<(), Panic>
    where
        F: Fn(usize) + Sync,
    {
        match panic::catch_unwind(panic::AssertUnwindSafe(|| self.bulk_execute(f, shape))) {
            Ok(()) => just(()),
            Err(payload) => just_error(Panic::new(payload)),
        }
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn num_targets(&self) -> usize {
        self.targets.len()
    }

    /// Returns `true` if bulk operations are split across targets.
    pub fn is_hierarchical(&self) -> bool {
        !self.inner.is_empty()
    }

    /// Returns the per-target executors. Empty for a single target.
    pub fn inner_executors(&self) -> &[ForkJoinExecutor] {
        &self.inner
    }
}

/// Picks one processing unit per target: the caller's own unit for the first
/// target that contains it, and the lowest unit for every other target.
fn representative_pus(targets: &[Target], this_pu: usize) -> Result<Vec<usize>> {
    let home = targets.iter().position(|target| target.mask().test(this_pu));
    let mut pus = Vec::with_capacity(targets.len());
    for (index, target) in targets.iter().enumerate() {
        let pu = if Some(index) == home {
            this_pu
        } else {
            target.mask().find_first().ok_or_else(|| {
                Error::bad_parameter(CONSTRUCTION, format!("target {index} is empty"))
            })?
        };
        if pus.contains(&pu) {
            return Err(Error::bad_parameter(
                CONSTRUCTION,
                format!("targets overlap on processing unit {pu}"),
            ));
        }
        pus.push(pu);
    }
    Ok(pus)
}

impl PartialEq for BlockForkJoinExecutor {
    fn eq(&self, other: &Self) -> bool {
        self.outer == other.outer && Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for BlockForkJoinExecutor {}

impl Annotate for BlockForkJoinExecutor {
    fn with_annotation(&self, annotation: impl Into<Cow<'static, str>>) -> Self {
        BlockForkJoinExecutor {
            outer: self.outer.with_annotation(annotation),
            inner: Arc::clone(&self.inner),
            targets: Arc::clone(&self.targets),
        }
    }

    fn annotation(&self) -> Option<&str> {
        self.outer.annotation()
    }
}

impl fmt::Debug for BlockForkJoinExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockForkJoinExecutor")
            .field("targets", &self.targets)
            .field("hierarchical", &self.is_hierarchical())
            .field("annotation", &self.annotation())
            .finish()
    }
}

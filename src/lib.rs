//! Parallel regions pinned to hardware, a blocking bridge out of asynchronous
//! work, and all-reduce across sites.
//!
//! Tutti is made of three pieces that are meant to be used together:
//!
//! + [`BlockForkJoinExecutor`] runs bulk operations across several hardware
//!   targets (usually NUMA domains). It keeps one parked [`ForkJoinExecutor`]
//!   per target and splits every bulk operation into one contiguous block per
//!   target. Worker threads are started once and reused, so re-entering a
//!   parallel region is cheap.
//!
//! + [`sync_wait`] connects a [`Sender`] to a receiver, starts it, and blocks
//!   the calling thread until it signals a value, an error or "stopped". It is
//!   the one way back from asynchronous work to an ordinary blocking call, and
//!   it works from any thread.
//!
//! + [`collectives`] lets a fixed number of sites combine one value each. Every
//!   site deposits its value into a shared rendezvous, and the last deposit
//!   folds them all, in site order, for everyone.
//!
//! # Example
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use tutti::prelude::*;
//!
//! let topology = std::sync::Arc::new(LogicalTopology::with_domains(2, 2));
//! let targets = topology.numa_domains();
//! let exec = BlockForkJoinExecutor::with_topology(topology, targets, ForkJoinParams::default())?;
//!
//! let sum = AtomicUsize::new(0);
//! exec.bulk_execute(|i| { sum.fetch_add(i, Ordering::Relaxed); }, 0..100);
//! assert_eq!(sum.load(Ordering::Relaxed), 4950);
//!
//! let value = just::<_, tutti::Error>(6).then(|v| v * 7).sync_wait()?;
//! assert_eq!(value, Some(42));
//! # Ok::<(), tutti::Error>(())
//! ```

pub mod block_executor;
pub mod collectives;
pub mod error;
pub mod execution;
pub mod fork_join;
pub mod job;
pub mod latch;
pub mod shape;
pub mod sync_wait;
pub mod topology;

mod util;

pub use block_executor::BlockForkJoinExecutor;
pub use error::{Error, Result};
pub use execution::{Completion, OperationState, Panic, Receiver, Sender, SenderExt};
pub use fork_join::{
    Annotate, ForkJoinExecutor, ForkJoinParams, LoopSchedule, StackSize, ThreadPriority,
};
pub use sync_wait::{block_on, sync_wait, sync_wait_with_variant};

pub mod prelude {
    pub use crate::{
        block_executor::BlockForkJoinExecutor,
        collectives::{AllReduce, CollectiveArgs, Communicator, Fabric, Site},
        execution::{
            from_future, just, just_error, just_stopped, spawn_thread, Completion, Panic, Sender,
            SenderExt,
        },
        fork_join::{
            Annotate, ForkJoinExecutor, ForkJoinParams, LoopSchedule, StackSize, ThreadPriority,
        },
        sync_wait::{block_on, sync_wait, sync_wait_with_variant},
        topology::{CpuMask, LogicalTopology, Target, Topology},
    };
}

//! This module defines the unit of work that a parallel region broadcasts to
//! its participants.
//!
//! A region job lives on the stack of the thread that starts the region. A
//! type-erased [`JobRef`] to it is handed to every worker, and each worker
//! executes it once with its own participant index. The job itself is
//! therefore executed *once per participant*, not once overall.
//!
//! When using a job, one must be extremely careful to ensure that:
//! (a) The job does not outlive anything it closes over.
//! (b) The job remains valid until every participant has finished executing it.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
};

use crate::util::Slot;

// -----------------------------------------------------------------------------
// Job

/// A job is a unit of work that may be executed by the participants of a
/// parallel region.
pub trait Job {
    /// Runs the job on behalf of participant `index`.
    ///
    /// # Safety
    ///
    /// This is called from several threads at once, so the implementer must
    /// be `Sync`. The pointer must point to a live `Self`.
    unsafe fn execute(this: *const (), index: usize);
}

// -----------------------------------------------------------------------------
// JobRef

/// Effectively a `&dyn Job` without the lifetime. Job refs are `Copy` so that
/// a region can hand the same job to each of its workers.
#[derive(Clone, Copy)]
pub struct JobRef {
    /// Points to the job, usually a [`RegionJob`] on the caller's stack.
    pointer: *const (),
    /// Executes the job stored at `pointer`.
    execute_fn: unsafe fn(*const (), usize),
}

impl JobRef {
    /// Creates a new `JobRef` from a `Job`.
    ///
    /// # Safety
    ///
    /// Caller must ensure `job` remains valid until every execution of the
    /// returned reference (and of its copies) has returned.
    pub unsafe fn new<J>(job: *const J) -> JobRef
    where
        J: Job,
    {
        JobRef {
            pointer: job as *const (),
            execute_fn: <J as Job>::execute,
        }
    }

    /// Executes the job on behalf of participant `index`.
    ///
    /// # Safety
    ///
    /// Caller must ensure that the job pointer is still valid.
    #[inline]
    pub unsafe fn execute(self, index: usize) {
        (self.execute_fn)(self.pointer, index)
    }
}

// SAFETY: !Send for raw pointers is not for safety, just as a lint
unsafe impl Send for JobRef {}

// SAFETY: !Sync for raw pointers is not for safety, just as a lint
unsafe impl Sync for JobRef {}

// -----------------------------------------------------------------------------
// Region job

/// A stack-allocated job that runs a closure once per participant.
///
/// Panics do not escape `execute`. The first panic raised by any participant
/// is kept, and the rest are dropped. The owner retrieves it with
/// [`RegionJob::take_panic`] after the region completes.
pub struct RegionJob<F>
where
    F: Fn(usize) + Sync,
{
    func: F,
    panic: Slot<Box<dyn Any + Send>>,
}

impl<F> RegionJob<F>
where
    F: Fn(usize) + Sync,
{
    pub fn new(func: F) -> RegionJob<F> {
        RegionJob {
            func,
            panic: Slot::empty(),
        }
    }

    /// Runs the closure for participant `index` on the current thread,
    /// skipping the indirection through a `JobRef`.
    #[inline]
    pub fn run_inline(&self, index: usize) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| (self.func)(index))) {
            // Only the first panic is reported.
            let _ = self.panic.put(payload);
        }
    }

    /// Creates a `JobRef` pointing to this job.
    ///
    /// # Safety
    ///
    /// Caller must ensure the `RegionJob` outlives every execution of the
    /// returned reference. In practice the owner waits for all participants
    /// to finish before the stack frame is popped.
    pub unsafe fn as_job_ref(&self) -> JobRef {
        JobRef::new(self)
    }

    /// Returns the first panic raised by a participant, if any.
    pub fn take_panic(&self) -> Option<Box<dyn Any + Send>> {
        self.panic.take()
    }
}

impl<F> Job for RegionJob<F>
where
    F: Fn(usize) + Sync,
{
    unsafe fn execute(this: *const (), index: usize) {
        // SAFETY: The caller guarantees the pointer refers to a live job.
        let this = unsafe { &*(this as *const Self) };
        this.run_inline(index);
    }
}

//! Error types shared by the executors and the collectives.
//!
//! Panics raised by user work functions are not represented here. They are
//! carried as [`Panic`](crate::execution::Panic) payloads so that their
//! identity survives the trip back to whoever is waiting.

use std::io;

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid construction or call arguments. Raised before any work starts.
    #[error("bad parameter in {operation}: {reason}")]
    BadParameter {
        operation: &'static str,
        reason: String,
    },

    /// The reduction operator panicked while folding a generation. Every site
    /// of that generation observes this error.
    #[error("reduction operator panicked: {message}")]
    OperatorPanicked { message: String },

    /// Two sites used the same rendezvous with different value types.
    #[error("value type mismatch for {basename} generation {generation}")]
    TypeMismatch { basename: String, generation: u64 },

    #[error("site {site} is out of range for a collective of {num_sites} sites")]
    SiteOutOfRange { site: usize, num_sites: usize },

    #[error("site {site} already deposited a value for generation {generation}")]
    DuplicateDeposit { site: usize, generation: u64 },

    /// The operating system refused to spawn a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),
}

impl Error {
    pub(crate) fn bad_parameter(operation: &'static str, reason: impl Into<String>) -> Error {
        Error::BadParameter {
            operation,
            reason: reason.into(),
        }
    }

    /// Returns `true` for errors caused by invalid arguments.
    pub fn is_bad_parameter(&self) -> bool {
        matches!(self, Error::BadParameter { .. })
    }
}

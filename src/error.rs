//! Error types for the reclamation managers and the pool.

use thiserror::Error;

/// Errors surfaced by the managers and the pool.
///
/// Contention on any hot path is retried internally and never surfaces here;
/// precondition violations (out-of-range core id, zero cores) are debug
/// assertions instead.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The underlying allocator could not satisfy a chunk allocation. The
    /// pool cannot make progress.
    #[error("memory allocation exhausted")]
    AllocationExhausted,

    /// The manager is shutting down: `signal_exit` has been called, so new
    /// joins and retirements are rejected.
    #[error("manager has been signalled to exit")]
    Exited,

    /// A collector task is already running for this manager.
    #[error("collector already running")]
    CollectorRunning,
}

//! Error types for the OS adaptation layer and the sampling controller.
//! Each variant carries a context string plus the wrapped platform error
//! rather than just a bare message, so callers can decide per-variant
//! whether a failure is fatal to the whole process or ignorable at round
//! or thread granularity.

use thiserror::Error;

/// Failures from the OS adaptation layer. These are always reported with
/// the syscall or operation that produced them, for the diagnostic trace
/// categories in `config::Verbosity`.
#[derive(Debug, Error)]
pub enum OsError {
    #[error("{0} failed: {1}")]
    Os(&'static str, std::io::Error),

    #[error("thread {0} no longer exists")]
    ThreadGone(u64),

    #[error("enumeration of {0} failed: {1}")]
    Enumeration(&'static str, std::io::Error),
}

/// Round-level and per-thread failures from the sampling controller.
#[derive(Debug, Error)]
pub enum SamplingError {
    #[error("platform is not supported by this sampler")]
    UnsupportedPlatform,

    #[error("failed to allocate rendezvous resources for the round: {0}")]
    ResourceExhausted(#[from] OsError),

    #[error("thread enumeration failed for this round: {0}")]
    EnumerationFailed(OsError),
}

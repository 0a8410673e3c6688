//! Shared error type for the raster-lazy runtime.
//!
//! One flat enum covers all three subsystems (window pool, buffer pool,
//! region, operation cache) rather than a per-crate error per crate, since
//! callers routinely need to propagate a window-pool failure through a
//! region operation through an operation build.

use thiserror::Error;

/// Errors produced by the runtime core.
#[derive(Debug, Error)]
pub enum RasterError {
    /// Buffer or window allocation failed (OS allocation or mmap returned an error).
    #[error("allocation failure: {0}")]
    AllocFailure(String),

    /// The image's generator callback reported failure while filling a buffer.
    #[error("generator error: {0}")]
    GeneratorError(String),

    /// A prepare rectangle fell entirely outside the image, or a required
    /// operation input was left unset.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// An operation's `build` returned failure.
    #[error("build error: {0}")]
    BuildError(String),

    /// Debug-only: an operation's hash changed across `build`. Compiled
    /// out in release builds, where the same condition surfaces as
    /// `BuildError` instead (see `RasterError::hash_contract_violation`).
    #[error("hash contract violation: {0}")]
    HashContract(String),

    /// Debug-only: a region was used from a thread other than its owner.
    #[error("thread misuse: {0}")]
    ThreadMisuse(String),
}

impl RasterError {
    /// Construct the hash-contract-violation condition, downgrading to a
    /// `BuildError` outside debug builds per the error-kind table.
    pub fn hash_contract_violation(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        if cfg!(debug_assertions) {
            RasterError::HashContract(msg)
        } else {
            RasterError::BuildError(msg)
        }
    }
}

pub type RasterResult<T> = Result<T, RasterError>;

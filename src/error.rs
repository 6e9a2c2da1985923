//! Error types for the profiling core.
//!
//! The error taxonomy is deliberately small. Anything that can go wrong
//! during initialization is an [`ProfilingError::InvalidConfig`] and is
//! raised before any sampling starts. Faults that escape the sampling path
//! are captured by the worker supervisor as [`ProfilingError::SamplingFault`]
//! and re-surfaced on the worker thread. Serialization problems come back as
//! tagged [`ProfilingError::SerializeError`] results rather than panics, so
//! that profile state can always be reset. Conditions that indicate a broken
//! internal invariant (they should never happen) are
//! [`ProfilingError::InvariantViolated`].
//!
//! Non-fatal conditions -- a GC event arriving for a thread we never sampled,
//! a heap recording dropped because interning failed -- are counters on the
//! relevant stats structs, not errors.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ProfilingError>;

/// Primary error type for all gilscope operations.
#[derive(Debug, Clone, Error)]
pub enum ProfilingError {
    /// Configuration was rejected at initialization time.
    ///
    /// Never raised during sampling; all option validation happens before
    /// the first sample is taken.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A fault escaped the stack collector or recorder during sampling.
    ///
    /// Captured by the sampler worker's supervisor, which stops the
    /// sampling loop and re-raises the fault on the worker thread.
    #[error("sampling fault: {0}")]
    SamplingFault(String),

    /// The pprof encoder reported an error during serialization.
    ///
    /// Profile state is still reset when this is returned.
    #[error("failed to serialize profile: {0}")]
    SerializeError(String),

    /// An internal invariant did not hold. This is a bug in gilscope.
    #[error("BUG: {0}")]
    InvariantViolated(String),
}

impl ProfilingError {
    /// Build an [`ProfilingError::InvalidConfig`] from anything displayable.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        ProfilingError::InvalidConfig(message.into())
    }

    /// Build a [`ProfilingError::SamplingFault`] from anything displayable.
    pub fn sampling_fault(message: impl Into<String>) -> Self {
        ProfilingError::SamplingFault(message.into())
    }

    /// True if this error indicates a broken internal invariant.
    pub fn is_bug(&self) -> bool {
        matches!(self, ProfilingError::InvariantViolated(_))
    }
}

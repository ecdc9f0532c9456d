//! Error taxonomy for the policy engine.
//!
//! Construction errors are fatal to the call that raised them; evaluation
//! failures surface to the caller of the access check and are never
//! converted into a default grant or deny.

use thiserror::Error;

/// Errors produced by policy construction and evaluation.
#[derive(Debug, Error)]
pub enum Error {
    /// A malformed entity, lock, flow, or policy specification.
    ///
    /// Raised synchronously from constructors: missing required fields,
    /// unregistered types, kinds, or operations.
    #[error("validation error: {0}")]
    Validation(String),

    /// A registry was consulted before it was populated.
    #[error("engine not initialized: {0}")]
    NotInitialized(String),

    /// A lock predicate did not provide a required method.
    ///
    /// This signals a registration bug, not a runtime condition.
    #[error("lock kind '{kind}' does not implement '{method}'")]
    UnsupportedOperation {
        /// The predicate kind that is missing the method.
        kind: String,
        /// The method that was called.
        method: &'static str,
    },

    /// A lock's `is_open` evaluation failed.
    ///
    /// Callers must treat this as "decision unavailable", distinct from a
    /// denial. The engine does not retry.
    #[error("lock evaluation failed: {0}")]
    Evaluation(String),
}

impl Error {
    /// Shorthand for a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Shorthand for an evaluation failure.
    pub fn evaluation(msg: impl Into<String>) -> Self {
        Self::Evaluation(msg.into())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

//! Error taxonomy for the engine.
//!
//! Mirrors the four buckets from the error-handling design: validation,
//! illegal state, foreign substrate, and user callback failure, plus
//! `Closed` and `Internal` for resource lifecycle and unexpected conditions.

use thiserror::Error;

/// Errors raised anywhere in the engine.
#[derive(Error, Debug, Clone)]
pub enum SubstratesError {
    /// Malformed path, negative sample/limit, probability outside `[0,1]`,
    /// empty iterator, null where forbidden.
    #[error("validation error: {0}")]
    Validation(String),

    /// Await on the owning circuit's worker thread, use of a closed
    /// circuit/scope/subscription, Registrar use outside its callback,
    /// Flow/Sift use outside its configurer.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// An instance produced by a different provider was passed where this
    /// provider's own instances are required.
    #[error("foreign substrate: {0}")]
    ForeignSubstrate(String),

    /// A composer, subscriber callback, flow operator body, or scope
    /// resource close panicked or returned an error.
    #[error("callback failure: {0}")]
    CallbackFailure(String),

    /// Operation attempted against a circuit, conduit, scope, or
    /// subscription that has already been closed.
    #[error("closed: {0}")]
    Closed(String),

    /// Anything else that should not normally happen.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SubstratesError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    pub fn foreign_substrate(msg: impl Into<String>) -> Self {
        Self::ForeignSubstrate(msg.into())
    }

    pub fn callback_failure(msg: impl Into<String>) -> Self {
        Self::CallbackFailure(msg.into())
    }

    pub fn closed(msg: impl Into<String>) -> Self {
        Self::Closed(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Convenience alias used throughout the crate.
pub type SubstratesResult<T> = Result<T, SubstratesError>;

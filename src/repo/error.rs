//! # Repository Error Types
//!
//! Errors raised by [`super::FlowContextRepo`] implementations.

use thiserror::Error;

/// Error type for context repository operations
///
/// - `NotFound`: no context with the requested id
/// - `Duplicate`: a save tried to insert an id that already exists
/// - `ActiveContext`: a delete hit a context that still owes work
/// - `LockError`: the backing store's lock is poisoned or unavailable
/// - `Generic`: anything else
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepoError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("Refusing to delete active context: {0}")]
    ActiveContext(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Repository error: {0}")]
    Generic(String),
}

impl RepoError {
    /// Create a new not found error
    pub fn not_found<S: Into<String>>(id: S) -> Self {
        RepoError::NotFound(format!("context '{}' not found", id.into()))
    }

    /// Create a new duplicate id error
    pub fn duplicate<S: Into<String>>(id: S) -> Self {
        RepoError::Duplicate(format!("context '{}' already exists", id.into()))
    }

    /// Create a new active context error
    pub fn active_context<S: Into<String>>(msg: S) -> Self {
        RepoError::ActiveContext(msg.into())
    }

    /// Create a new lock error
    pub fn lock_error<S: Into<String>>(msg: S) -> Self {
        RepoError::LockError(msg.into())
    }

    /// Create a new generic repository error
    pub fn generic<S: Into<String>>(msg: S) -> Self {
        RepoError::Generic(msg.into())
    }
}

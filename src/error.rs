//! # Error Handling - Categorized Engine Errors
//!
//! Every fallible operation in waterflow returns [`FlowResult<T>`]. The single error enum,
//! [`FlowError`], separates four families of failure so callers can react differently:
//!
//! | Family | Variants | Reaction |
//! |--------|----------|----------|
//! | Build-time validation | `Definition`, `Configuration` | Fix the flow definition; fatal |
//! | Transient execution | `NodeExecution`, `Timeout` | Handled by a node or flow error handler |
//! | Unrecoverable execution | `NodeFailure` | Context parked in `ERROR`, reported to `close` |
//! | Engine invariant | `InvalidTransition`, `TimestampOrder`, `InvalidExecution`, `Batch`, `NoMatchingBranch`, `Aborted` | Surfaced immediately, never retried |
//!
//! Port failures (`Repository`, `Lock`, `Messenger`, `Scheduler`) come from the storage,
//! locking, notification and timer collaborators.
//!
//! ## 🔗 Repository Error Integration
//!
//! [`RepoError`] converts into [`FlowError::Repository`] so repository calls compose with `?`:
//!
//! ```rust
//! use waterflow::{FlowResult, repo::RepoError};
//!
//! fn lookup() -> FlowResult<()> {
//!     let missing: Result<(), RepoError> = Err(RepoError::not_found("ctx-1"));
//!     missing?;
//!     Ok(())
//! }
//!
//! assert_eq!(lookup().unwrap_err().category(), "repository");
//! ```

use crate::context::FlowStatus;
use crate::repo::RepoError;
use thiserror::Error;

/// Error type for every waterflow operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    /// A node's business logic failed.
    ///
    /// Returned by closures and [`crate::NodeExecutor`] implementations. The runtime wraps
    /// it into a [`FlowError::NodeFailure`] once the owning node is known.
    #[error("Node execution error: {0}")]
    NodeExecution(String),

    /// The flow graph is malformed (unknown alias, dangling branch, empty flow).
    #[error("Definition error: {0}")]
    Definition(String),

    /// A context was asked to move between two statuses that are not adjacent.
    #[error("Invalid transition for context {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: FlowStatus,
        to: FlowStatus,
    },

    /// A lifecycle timestamp was set twice or before its predecessor.
    #[error("Timestamp order violation: {0}")]
    TimestampOrder(String),

    /// A scheduled task timeline was advanced out of order.
    #[error("Invalid execution state: {0}")]
    InvalidExecution(String),

    /// No `when` predicate matched and the conditions node has no `others` branch.
    #[error("No matching branch at {stream_id}/{position}")]
    NoMatchingBranch { stream_id: String, position: String },

    /// Batch membership is missing or inconsistent at a barrier.
    #[error("Batch error: {0}")]
    Batch(String),

    /// A claim could not be carried through; its contexts were failed by the engine.
    #[error("Aborted: {0}")]
    Aborted(String),

    /// A node failed and no handler recovered it.
    #[error("{stream_id}/{position}/{node}: {cause}")]
    NodeFailure {
        stream_id: String,
        position: String,
        node: String,
        cause: String,
    },

    /// The context repository failed.
    #[error("Repository error: {0}")]
    Repository(#[from] RepoError),

    /// A lock could not be acquired or released.
    #[error("Lock error: {0}")]
    Lock(String),

    /// The notification bus failed.
    #[error("Messenger error: {0}")]
    Messenger(String),

    /// The task scheduler rejected or lost a task.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Invalid runtime, node or scheduler settings.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A flow id was referenced but never published.
    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    /// Waiting on a trace, lock or shutdown exceeded its deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Payload or scratch data could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Anything else.
    #[error("Error: {0}")]
    Generic(String),
}

impl FlowError {
    /// Create a new node execution error
    pub fn node_execution<S: Into<String>>(msg: S) -> Self {
        FlowError::NodeExecution(msg.into())
    }

    /// Create a new definition error
    pub fn definition<S: Into<String>>(msg: S) -> Self {
        FlowError::Definition(msg.into())
    }

    /// Create a new timestamp order error
    pub fn timestamp_order<S: Into<String>>(msg: S) -> Self {
        FlowError::TimestampOrder(msg.into())
    }

    /// Create a new execution state error
    pub fn invalid_execution<S: Into<String>>(msg: S) -> Self {
        FlowError::InvalidExecution(msg.into())
    }

    /// Create a new batch error
    pub fn batch<S: Into<String>>(msg: S) -> Self {
        FlowError::Batch(msg.into())
    }

    /// Create a new aborted-claim error
    pub fn aborted<S: Into<String>>(msg: S) -> Self {
        FlowError::Aborted(msg.into())
    }

    /// Create a new lock error
    pub fn lock<S: Into<String>>(msg: S) -> Self {
        FlowError::Lock(msg.into())
    }

    /// Create a new messenger error
    pub fn messenger<S: Into<String>>(msg: S) -> Self {
        FlowError::Messenger(msg.into())
    }

    /// Create a new scheduler error
    pub fn scheduler<S: Into<String>>(msg: S) -> Self {
        FlowError::Scheduler(msg.into())
    }

    /// Create a new configuration error
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        FlowError::Configuration(msg.into())
    }

    /// Create a new flow not found error
    pub fn flow_not_found<S: Into<String>>(flow_id: S) -> Self {
        FlowError::FlowNotFound(flow_id.into())
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        FlowError::Timeout(msg.into())
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(msg: S) -> Self {
        FlowError::Generic(msg.into())
    }

    /// Get the human readable message without the category prefix
    pub fn message(&self) -> String {
        match self {
            FlowError::NodeExecution(msg)
            | FlowError::Definition(msg)
            | FlowError::TimestampOrder(msg)
            | FlowError::InvalidExecution(msg)
            | FlowError::Batch(msg)
            | FlowError::Aborted(msg)
            | FlowError::Lock(msg)
            | FlowError::Messenger(msg)
            | FlowError::Scheduler(msg)
            | FlowError::Configuration(msg)
            | FlowError::FlowNotFound(msg)
            | FlowError::Timeout(msg)
            | FlowError::Serialization(msg)
            | FlowError::Generic(msg) => msg.clone(),
            FlowError::Repository(err) => err.to_string(),
            other => other.to_string(),
        }
    }

    /// Get the error category as a string
    pub fn category(&self) -> &'static str {
        match self {
            FlowError::NodeExecution(_) => "node_execution",
            FlowError::Definition(_) => "definition",
            FlowError::InvalidTransition { .. } => "invalid_transition",
            FlowError::TimestampOrder(_) => "timestamp_order",
            FlowError::InvalidExecution(_) => "invalid_execution",
            FlowError::NoMatchingBranch { .. } => "no_matching_branch",
            FlowError::Batch(_) => "batch",
            FlowError::Aborted(_) => "aborted",
            FlowError::NodeFailure { .. } => "node_failure",
            FlowError::Repository(_) => "repository",
            FlowError::Lock(_) => "lock",
            FlowError::Messenger(_) => "messenger",
            FlowError::Scheduler(_) => "scheduler",
            FlowError::Configuration(_) => "configuration",
            FlowError::FlowNotFound(_) => "flow_not_found",
            FlowError::Timeout(_) => "timeout",
            FlowError::Serialization(_) => "serialization",
            FlowError::Generic(_) => "generic",
        }
    }

    /// True for broken engine invariants: illegal transitions, timestamp order,
    /// execution timeline order and barrier bookkeeping.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            FlowError::InvalidTransition { .. }
                | FlowError::TimestampOrder(_)
                | FlowError::InvalidExecution(_)
                | FlowError::Batch(_)
        )
    }

    /// True for errors raised by the engine itself rather than by user code.
    ///
    /// Engine errors bypass error handlers and are never retried.
    pub fn is_engine_error(&self) -> bool {
        self.is_invariant_violation()
            || matches!(
                self,
                FlowError::NoMatchingBranch { .. }
                    | FlowError::Aborted(_)
                    | FlowError::Definition(_)
                    | FlowError::FlowNotFound(_)
            )
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        FlowError::Serialization(err.to_string())
    }
}

impl From<&str> for FlowError {
    fn from(err: &str) -> Self {
        FlowError::Generic(err.to_string())
    }
}

impl From<String> for FlowError {
    fn from(err: String) -> Self {
        FlowError::Generic(err)
    }
}

/// Result alias used throughout waterflow.
pub type FlowResult<T> = Result<T, FlowError>;

//! # Waterflow: Persistent Dataflow Execution in Rust
//!
//! Waterflow runs graphs of small processing steps over data that is tracked as it moves.
//! Every item offered to a flow becomes a [`FlowContext`]: a persisted record of where
//! the item is, what status it is in and which batch it belongs to. Workers claim READY
//! contexts node by node, run the node's operator and write the successors back, so a
//! trace can be inspected, paused, amended, retried or resumed at any point.
//!
//! ## 🚀 Quick Start
//!
//! ```rust
//! use waterflow::prelude::*;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> FlowResult<()> {
//!     let runtime = FlowRuntime::<i64>::in_memory();
//!     runtime.publish(
//!         FlowBuilder::<i64>::new("orders")
//!             .map("validate", |total| Ok(total.max(0)))
//!             .parallel("price", JoinMode::All)
//!             .fork(|b| b.map("tax", |x| Ok(x / 10)))
//!             .fork(|b| b.map("net", Ok))
//!             .join_with("sum", |parts| Ok(parts.iter().sum()))
//!             .close()?,
//!     )?;
//!
//!     let handle = runtime.offer("orders", vec![100]).await?;
//!     handle.wait(Duration::from_secs(5)).await?;
//!     assert_eq!(handle.results().await?, vec![110]);
//!
//!     runtime.shutdown().await
//! }
//! ```
//!
//! ## 🎯 Core Concepts
//!
//! ### Contexts and Traces
//!
//! A [`FlowContext`] moves through `READY → SCHEDULED → EXECUTING → ARCHIVED`, detouring
//! through `PENDING` at block nodes and `ERROR` on failure. Contexts started by one
//! offer share a trace id, and every step is recorded as a new context, so the trace is
//! the full history of the offer.
//!
//! ### Operators
//!
//! Nodes are built from a closed set of operators: map, just, produce, reduce, custom
//! executors, parallel/join, conditions, block, relay and end. See [`node`].
//!
//! ### Ports
//!
//! The runtime reaches storage through [`FlowContextRepo`], mutual exclusion through
//! [`FlowLocks`] and wake-ups through [`FlowContextMessenger`]. The in-memory
//! implementations are complete; runtimes sharing them behave like separate processes
//! of one deployment.
//!
//! ### Failures and Retries
//!
//! Failed contexts land in `ERROR` with a [`context::ContextFault`]. Node and flow
//! [`ErrorHandler`]s decide whether to retry them; see [`retry`].
//!
//! ## 📚 Module Overview
//!
//! - **[`context`]**: contexts, statuses, batches and the persisted record
//! - **[`flow`]** and **[`node`]**: graph building and operators
//! - **[`runtime`]**: publishing, offering, blocks, retries and trace queries
//! - **[`scheduler`]** and **[`policy`]**: self-rescheduling tasks and when they fire
//! - **[`retry`]**: in-node retry modes and error handlers
//! - **[`repo`]**, **[`lock`]**, **[`messenger`]**: ports and in-memory adapters
//! - **[`error`]**: [`FlowError`] and [`FlowResult`]
//!
//! ## 🔍 Logging
//!
//! Everything logs through `tracing`. Install any subscriber to see claims, failures and
//! retries; `RUST_LOG=waterflow=debug` shows every step.

pub mod context;
pub mod error;
pub mod flow;
pub mod lock;
pub mod messenger;
pub mod node;
pub mod policy;
pub mod registry;
pub mod repo;
pub mod retry;
pub mod runtime;
pub mod scheduler;

#[cfg(test)]
mod scenario_tests;

// Core public API
pub use context::{Batch, FlowContext, FlowData, FlowStatus};
pub use error::{FlowError, FlowResult};
pub use flow::{Flow, FlowBuilder};
pub use lock::{FlowLocks, MemoryLocks};
pub use messenger::{FlowContextMessenger, FlowEvent, LocalMessenger};
pub use node::{JoinMode, NodeConfig, NodeExecutor};
pub use policy::ExecutePolicy;
pub use repo::{FlowContextRepo, MemoryContextRepo};
pub use retry::{ErrorDecision, ErrorHandler, RetryDecision, RetryHandler, RetryMode};
pub use runtime::{FlowHandle, FlowRuntime, RuntimeBuilder, RuntimeConfig, TraceSummary};
pub use scheduler::Scheduler;

pub mod prelude {
    //! Simplified imports for common usage patterns
    //!
    //! Use `use waterflow::prelude::*;` to import the most commonly used types and traits.

    pub use crate::{
        ErrorDecision, ErrorHandler, Flow, FlowBuilder, FlowContext, FlowData, FlowError,
        FlowHandle, FlowResult, FlowRuntime, FlowStatus, JoinMode, NodeConfig, NodeExecutor,
        RetryDecision, RetryHandler, RetryMode, RuntimeBuilder, RuntimeConfig,
    };

    // Re-export async_trait for convenience
    pub use async_trait::async_trait;
}

//! # Nodes and Operators
//!
//! A published flow is a list of [`FlowNode`]s. Each node sits at a position (`n0`,
//! `n1`, ...), carries one [`Operator`] and a list of outgoing [`Edge`]s. Operators are a
//! closed set dispatched by a single `match` in the runtime:
//!
//! | Operator | Consumes | Emits |
//! |----------|----------|-------|
//! | `Map` | one context | one context with a transformed payload |
//! | `Just` | one context | the same payload, after a side effect on the context |
//! | `Produce` | a complete batch | any number of contexts, in a fresh batch |
//! | `Reduce` | a complete batch | one context |
//! | `Execute` | all claimed contexts | what the [`NodeExecutor`] returns |
//! | `Parallel` | one context | one context per fork, sharing a fork batch |
//! | `Join` | the fork batch (or its first arrival) | one context |
//! | `Conditions` | one context | one context on the first matching edge |
//! | `Block` | one context | one context, once resumed from outside |
//! | `Relay` | one context | one context in another flow |
//! | `End` | one context | nothing; the context is archived as a result |
//!
//! ## 🔌 Custom Executors
//!
//! Anything heavier than a closure implements [`NodeExecutor`]:
//!
//! ```rust
//! use waterflow::prelude::*;
//!
//! struct Uppercase;
//!
//! #[async_trait]
//! impl NodeExecutor<String> for Uppercase {
//!     fn config(&self) -> NodeConfig {
//!         NodeConfig::new().with_fixed_retry(2, std::time::Duration::from_millis(10))
//!     }
//!
//!     async fn execute(
//!         &self,
//!         _config: &NodeConfig,
//!         mut contexts: Vec<FlowContext<String>>,
//!     ) -> FlowResult<Vec<FlowContext<String>>> {
//!         for ctx in &mut contexts {
//!             let upper = ctx.data().to_uppercase();
//!             ctx.set_data(upper);
//!         }
//!         Ok(contexts)
//!     }
//! }
//! ```

use crate::context::FlowContext;
use crate::error::FlowResult;
use crate::retry::{ErrorHandler, RetryMode};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Simple key-value parameters for node configuration
pub type DefaultParams = HashMap<String, String>;

/// 1-to-1 payload transform.
pub type MapFn<D> = Arc<dyn Fn(D) -> FlowResult<D> + Send + Sync>;
/// Side effect on a context; may read and write scratch values.
pub type JustFn<D> = Arc<dyn Fn(&mut FlowContext<D>) -> FlowResult<()> + Send + Sync>;
/// 1-to-N payload expansion.
pub type ProduceFn<D> = Arc<dyn Fn(Vec<D>) -> FlowResult<Vec<D>> + Send + Sync>;
/// N-to-1 fold, also used as a join combiner.
pub type ReduceFn<D> = Arc<dyn Fn(Vec<D>) -> FlowResult<D> + Send + Sync>;
/// Routing predicate for conditions and block validators.
pub type Predicate<D> = Arc<dyn Fn(&D) -> bool + Send + Sync>;

/// Per-node execution settings.
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    pub params: DefaultParams,
    /// In-node attempts before the error handler is consulted.
    pub retry_mode: RetryMode,
}

impl NodeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_retry(mut self, retry_mode: RetryMode) -> Self {
        self.retry_mode = retry_mode;
        self
    }

    pub fn with_fixed_retry(self, retries: usize, delay: Duration) -> Self {
        self.with_retry(RetryMode::fixed(retries, delay))
    }

    pub fn with_exponential_retry(self, max_retries: usize) -> Self {
        self.with_retry(RetryMode::exponential(max_retries))
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

/// Port for node implementations that do real work (HTTP, SQL, model calls).
///
/// `execute` receives the claimed contexts in `EXECUTING` status and returns the
/// contexts to forward, usually the same ones with updated payloads. Returning fewer
/// contexts drops the missing ones; an error fails the whole claim.
#[async_trait]
pub trait NodeExecutor<D>: Send + Sync {
    /// Settings used when the node is added to a flow.
    fn config(&self) -> NodeConfig {
        NodeConfig::default()
    }

    async fn execute(
        &self,
        config: &NodeConfig,
        contexts: Vec<FlowContext<D>>,
    ) -> FlowResult<Vec<FlowContext<D>>>;
}

/// How a join decides it has seen enough branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    /// Wait for every fork.
    All,
    /// Continue with the first fork to arrive; later arrivals are superseded.
    Either,
}

/// The work a node performs.
pub enum Operator<D> {
    Map(MapFn<D>),
    Just(JustFn<D>),
    Produce(ProduceFn<D>),
    Reduce(ReduceFn<D>),
    Execute(Arc<dyn NodeExecutor<D>>),
    Parallel,
    Join {
        mode: JoinMode,
        branches: usize,
        combiner: Option<ReduceFn<D>>,
    },
    Conditions,
    Block,
    Relay {
        flow_id: String,
    },
    End,
}

impl<D> Operator<D> {
    pub fn kind(&self) -> OperatorKind {
        match self {
            Operator::Map(_) => OperatorKind::Map,
            Operator::Just(_) => OperatorKind::Just,
            Operator::Produce(_) => OperatorKind::Produce,
            Operator::Reduce(_) => OperatorKind::Reduce,
            Operator::Execute(_) => OperatorKind::Execute,
            Operator::Parallel => OperatorKind::Parallel,
            Operator::Join { .. } => OperatorKind::Join,
            Operator::Conditions => OperatorKind::Conditions,
            Operator::Block => OperatorKind::Block,
            Operator::Relay { .. } => OperatorKind::Relay,
            Operator::End => OperatorKind::End,
        }
    }

    /// Barrier operators wait for batch members instead of processing one claim.
    pub fn is_barrier(&self) -> bool {
        matches!(
            self,
            Operator::Join { .. } | Operator::Reduce(_) | Operator::Produce(_)
        )
    }
}

/// Operator tag, used in logs and graph descriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorKind {
    Map,
    Just,
    Produce,
    Reduce,
    Execute,
    Parallel,
    Join,
    Conditions,
    Block,
    Relay,
    End,
}

impl OperatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatorKind::Map => "map",
            OperatorKind::Just => "just",
            OperatorKind::Produce => "produce",
            OperatorKind::Reduce => "reduce",
            OperatorKind::Execute => "execute",
            OperatorKind::Parallel => "parallel",
            OperatorKind::Join => "join",
            OperatorKind::Conditions => "conditions",
            OperatorKind::Block => "block",
            OperatorKind::Relay => "relay",
            OperatorKind::End => "end",
        }
    }
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Edge guard.
pub enum Guard<D> {
    Always,
    When(Predicate<D>),
    /// Taken by a conditions node when no `When` matched.
    Otherwise,
}

impl<D> Clone for Guard<D> {
    fn clone(&self) -> Self {
        match self {
            Guard::Always => Guard::Always,
            Guard::When(p) => Guard::When(Arc::clone(p)),
            Guard::Otherwise => Guard::Otherwise,
        }
    }
}

impl<D> fmt::Debug for Guard<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Guard::Always => f.write_str("Always"),
            Guard::When(_) => f.write_str("When(..)"),
            Guard::Otherwise => f.write_str("Otherwise"),
        }
    }
}

/// Outgoing edge to the node at `target`.
pub struct Edge<D> {
    pub target: String,
    pub guard: Guard<D>,
}

impl<D> Clone for Edge<D> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            guard: self.guard.clone(),
        }
    }
}

impl<D> fmt::Debug for Edge<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-> {} ({:?})", self.target, self.guard)
    }
}

/// A node of a published flow.
pub struct FlowNode<D> {
    pub position: String,
    pub name: String,
    pub alias: Option<String>,
    pub operator: Operator<D>,
    pub edges: Vec<Edge<D>>,
    pub config: NodeConfig,
    pub error_handler: Option<Arc<dyn ErrorHandler<D>>>,
}

impl<D> FlowNode<D> {
    pub fn new(position: impl Into<String>, name: impl Into<String>, operator: Operator<D>) -> Self {
        Self {
            position: position.into(),
            name: name.into(),
            alias: None,
            operator,
            edges: Vec::new(),
            config: NodeConfig::default(),
            error_handler: None,
        }
    }

    pub fn kind(&self) -> OperatorKind {
        self.operator.kind()
    }

    /// Unconditional successor, if any.
    pub fn next(&self) -> Option<&str> {
        self.edges
            .iter()
            .find(|e| matches!(e.guard, Guard::Always))
            .map(|e| e.target.as_str())
    }

    /// Edge chosen for `data`: the first `When` that holds, else `Otherwise`, else `Always`.
    pub fn route(&self, data: &D) -> Option<&str> {
        self.edges
            .iter()
            .find(|e| matches!(&e.guard, Guard::When(p) if p(data)))
            .or_else(|| {
                self.edges
                    .iter()
                    .find(|e| matches!(e.guard, Guard::Otherwise))
            })
            .or_else(|| self.edges.iter().find(|e| matches!(e.guard, Guard::Always)))
            .map(|e| e.target.as_str())
    }

    /// Fork targets of a parallel node, in declaration order.
    pub fn forks(&self) -> Vec<&str> {
        self.edges.iter().map(|e| e.target.as_str()).collect()
    }

    /// Does `key` name this node, by alias or by name?
    pub fn answers_to(&self, key: &str) -> bool {
        self.alias.as_deref() == Some(key) || self.name == key || self.position == key
    }
}

impl<D> fmt::Debug for FlowNode<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowNode")
            .field("position", &self.position)
            .field("name", &self.name)
            .field("alias", &self.alias)
            .field("kind", &self.operator.kind())
            .field("edges", &self.edges)
            .finish()
    }
}

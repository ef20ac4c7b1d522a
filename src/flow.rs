//! # Flow API - Build Process Graphs
//!
//! A [`Flow`] is an immutable graph of [`FlowNode`]s built with the fluent
//! [`FlowBuilder`]. Every builder call appends a node at the next position (`n0`, `n1`,
//! ...) and wires the previous node's dangling edges to it. Fan-out and branching use
//! nested builders so forks and branches read top to bottom:
//!
//! ```rust
//! use waterflow::prelude::*;
//!
//! let flow = FlowBuilder::<i64>::new("pricing")
//!     .map("normalize", |cents| Ok(cents.max(0)))
//!     .parallel("quote", JoinMode::All)
//!     .fork(|b| b.map("tax", |x| Ok(x / 5)))
//!     .fork(|b| b.map("shipping", |_| Ok(499)))
//!     .join_with("total", |parts| Ok(parts.iter().sum()))
//!     .conditions("size")
//!     .when(|total| *total > 10_000, |b| b.block("review"))
//!     .others(|b| b)
//!     .done()
//!     .close()
//!     .unwrap();
//!
//! assert_eq!(flow.start(), "n0");
//! ```
//!
//! ## ✅ Validation
//!
//! Problems found while building (unknown jump aliases, parallel sections without
//! forks, conditions without predicates, nodes after a terminal node) are collected
//! and reported together by [`FlowBuilder::close`] as a [`FlowError::Definition`].
//! Flows that close successfully never fail for structural reasons at runtime.

use crate::context::{FlowContext, FlowData};
use crate::error::{FlowError, FlowResult};
use crate::node::{Edge, FlowNode, Guard, JoinMode, NodeConfig, NodeExecutor, Operator};
use crate::retry::{ErrorDecision, ErrorHandler, FnErrorHandler, RetryMode};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

/// Called with each context that reaches an end node.
pub type SuccessCallback<D> = Arc<dyn Fn(&FlowContext<D>) + Send + Sync>;
/// Called with the failure of each context that ends in `ERROR`.
pub type FailureCallback = Arc<dyn Fn(&FlowError) + Send + Sync>;

/// A closed, validated process graph.
pub struct Flow<D> {
    id: String,
    nodes: Vec<FlowNode<D>>,
    index: HashMap<String, usize>,
    error_handler: Option<Arc<dyn ErrorHandler<D>>>,
    on_success: Option<SuccessCallback<D>>,
    on_failure: Option<FailureCallback>,
}

impl<D> Flow<D> {
    /// Stream id shared by every context of this flow.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Position of the entry node.
    pub fn start(&self) -> &str {
        // close() guarantees at least one node
        self.nodes
            .first()
            .map(|n| n.position.as_str())
            .unwrap_or("n0")
    }

    pub fn nodes(&self) -> &[FlowNode<D>] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, position: &str) -> Option<&FlowNode<D>> {
        self.index.get(position).map(|&i| &self.nodes[i])
    }

    /// Look a node up by alias, then name, then position.
    pub fn find(&self, key: &str) -> Option<&FlowNode<D>> {
        self.nodes
            .iter()
            .find(|n| n.alias.as_deref() == Some(key))
            .or_else(|| self.nodes.iter().find(|n| n.answers_to(key)))
    }

    pub fn error_handler(&self) -> Option<&Arc<dyn ErrorHandler<D>>> {
        self.error_handler.as_ref()
    }

    pub(crate) fn notify_success(&self, ctx: &FlowContext<D>) {
        if let Some(callback) = &self.on_success {
            callback(ctx);
        }
    }

    pub(crate) fn notify_failure(&self, error: &FlowError) {
        if let Some(callback) = &self.on_failure {
            callback(error);
        }
    }

    /// One line per node: position, operator, name and edges.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for node in &self.nodes {
            let _ = write!(out, "{} {} '{}'", node.position, node.kind(), node.name);
            if let Some(alias) = &node.alias {
                let _ = write!(out, " #{alias}");
            }
            for edge in &node.edges {
                let _ = write!(out, " {edge:?}");
            }
            out.push('\n');
        }
        out
    }
}

impl<D> std::fmt::Debug for Flow<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("id", &self.id)
            .field("nodes", &self.nodes)
            .finish()
    }
}

struct Tail<D> {
    from: usize,
    guard: Guard<D>,
}

struct Jump<D> {
    from: usize,
    guard: Guard<D>,
    alias: String,
}

/// Fluent builder for [`Flow`].
pub struct FlowBuilder<D> {
    id: String,
    nodes: Vec<FlowNode<D>>,
    tails: Vec<Tail<D>>,
    jumps: Vec<Jump<D>>,
    errors: Vec<String>,
    error_handler: Option<Arc<dyn ErrorHandler<D>>>,
}

impl<D: FlowData> FlowBuilder<D> {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let mut errors = Vec::new();
        if id.trim().is_empty() {
            errors.push("flow id must not be empty".to_string());
        }
        Self {
            id,
            nodes: Vec::new(),
            tails: Vec::new(),
            jumps: Vec::new(),
            errors,
            error_handler: None,
        }
    }

    fn push(&mut self, name: &str, operator: Operator<D>) -> usize {
        let index = self.nodes.len();
        let position = format!("n{index}");
        if !self.nodes.is_empty() && self.tails.is_empty() {
            self.errors
                .push(format!("node '{name}' at {position} is unreachable"));
        }
        for tail in self.tails.drain(..) {
            self.nodes[tail.from].edges.push(Edge {
                target: position.clone(),
                guard: tail.guard,
            });
        }
        self.nodes.push(FlowNode::new(position, name, operator));
        self.tails.push(Tail {
            from: index,
            guard: Guard::Always,
        });
        index
    }

    fn last_mut(&mut self, what: &str) -> Option<&mut FlowNode<D>> {
        if self.nodes.is_empty() {
            self.errors.push(format!("{what} used before any node"));
        }
        self.nodes.last_mut()
    }

    /// 1-to-1 transform.
    pub fn map<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(D) -> FlowResult<D> + Send + Sync + 'static,
    {
        self.push(name, Operator::Map(Arc::new(f)));
        self
    }

    /// Side effect on the context; the payload may be changed in place.
    pub fn just<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&mut FlowContext<D>) -> FlowResult<()> + Send + Sync + 'static,
    {
        self.push(name, Operator::Just(Arc::new(f)));
        self
    }

    /// Expand the payloads of a complete batch into any number of outputs.
    pub fn produce<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Vec<D>) -> FlowResult<Vec<D>> + Send + Sync + 'static,
    {
        self.push(name, Operator::Produce(Arc::new(f)));
        self
    }

    /// Fold a complete batch into one payload.
    pub fn reduce<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Vec<D>) -> FlowResult<D> + Send + Sync + 'static,
    {
        self.push(name, Operator::Reduce(Arc::new(f)));
        self
    }

    /// Hand claimed contexts to a [`NodeExecutor`].
    pub fn execute<E>(mut self, name: &str, executor: E) -> Self
    where
        E: NodeExecutor<D> + 'static,
    {
        let config = executor.config();
        let index = self.push(name, Operator::Execute(Arc::new(executor)));
        self.nodes[index].config = config;
        self
    }

    /// Hold contexts as `PENDING` until they are resumed from outside.
    pub fn block(mut self, name: &str) -> Self {
        self.push(name, Operator::Block);
        self
    }

    /// Continue the trace in another published flow.
    pub fn relay(mut self, name: &str, flow_id: impl Into<String>) -> Self {
        self.push(
            name,
            Operator::Relay {
                flow_id: flow_id.into(),
            },
        );
        self.tails.clear();
        self
    }

    /// Terminate this path.
    pub fn end(mut self) -> Self {
        self.push("end", Operator::End);
        self.tails.clear();
        self
    }

    /// Name the last node so [`FlowBuilder::to`] can jump to it.
    pub fn id(mut self, alias: &str) -> Self {
        if self.nodes.iter().any(|n| n.alias.as_deref() == Some(alias)) {
            self.errors.push(format!("alias '{alias}' is used twice"));
            return self;
        }
        if let Some(node) = self.last_mut("id()") {
            node.alias = Some(alias.to_string());
        }
        self
    }

    /// Jump to the node named `alias`. Ends the current path.
    pub fn to(mut self, alias: &str) -> Self {
        if self.tails.is_empty() {
            self.errors
                .push(format!("to('{alias}') has no path to continue"));
        }
        for tail in self.tails.drain(..) {
            self.jumps.push(Jump {
                from: tail.from,
                guard: tail.guard,
                alias: alias.to_string(),
            });
        }
        self
    }

    /// Replace the last node's configuration.
    pub fn configure(mut self, config: NodeConfig) -> Self {
        if let Some(node) = self.last_mut("configure()") {
            node.config = config;
        }
        self
    }

    /// In-node retry attempts for the last node.
    pub fn retry(mut self, mode: RetryMode) -> Self {
        if let Some(node) = self.last_mut("retry()") {
            node.config.retry_mode = mode;
        }
        self
    }

    /// Error handler for the last node.
    pub fn on_error<H>(mut self, handler: H) -> Self
    where
        H: ErrorHandler<D> + 'static,
    {
        if let Some(node) = self.last_mut("on_error()") {
            node.error_handler = Some(Arc::new(handler));
        }
        self
    }

    /// Closure error handler for the last node.
    pub fn on_error_fn<F>(self, f: F) -> Self
    where
        F: Fn(&FlowError, Vec<FlowContext<D>>) -> ErrorDecision<D> + Send + Sync + 'static,
    {
        self.on_error(FnErrorHandler::new(f))
    }

    /// Fallback error handler for nodes without their own.
    pub fn with_error_handler<H>(mut self, handler: H) -> Self
    where
        H: ErrorHandler<D> + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn with_error_handler_fn<F>(self, f: F) -> Self
    where
        F: Fn(&FlowError, Vec<FlowContext<D>>) -> ErrorDecision<D> + Send + Sync + 'static,
    {
        self.with_error_handler(FnErrorHandler::new(f))
    }

    /// Start a parallel section.
    pub fn parallel(mut self, name: &str, mode: JoinMode) -> ParallelBuilder<D> {
        let node = self.push(name, Operator::Parallel);
        self.tails.clear();
        ParallelBuilder {
            builder: self,
            node,
            mode,
            forks: 0,
            branch_tails: Vec::new(),
        }
    }

    /// Start a conditional section.
    pub fn conditions(mut self, name: &str) -> ConditionsBuilder<D> {
        let node = self.push(name, Operator::Conditions);
        self.tails.clear();
        ConditionsBuilder {
            builder: self,
            node,
            whens: 0,
            has_others: false,
            branch_tails: Vec::new(),
        }
    }

    /// Run `branch` on a builder whose path starts at `from` via `guard`.
    fn branch<F>(mut self, from: usize, guard: Guard<D>, branch: F) -> (Self, Vec<Tail<D>>)
    where
        F: FnOnce(FlowBuilder<D>) -> FlowBuilder<D>,
    {
        self.tails = vec![Tail { from, guard }];
        let mut builder = branch(self);
        let tails = std::mem::take(&mut builder.tails);
        (builder, tails)
    }

    /// Validate and publish-ready the graph. Open paths are terminated with an end node.
    pub fn close(self) -> FlowResult<Flow<D>> {
        self.finish(None, None)
    }

    /// Like [`FlowBuilder::close`], registering result and failure callbacks.
    pub fn close_with<S, E>(self, on_success: S, on_failure: E) -> FlowResult<Flow<D>>
    where
        S: Fn(&FlowContext<D>) + Send + Sync + 'static,
        E: Fn(&FlowError) + Send + Sync + 'static,
    {
        self.finish(Some(Arc::new(on_success)), Some(Arc::new(on_failure)))
    }

    fn finish(
        mut self,
        on_success: Option<SuccessCallback<D>>,
        on_failure: Option<FailureCallback>,
    ) -> FlowResult<Flow<D>> {
        if self.nodes.is_empty() {
            return Err(FlowError::definition(format!(
                "flow '{}' has no nodes",
                self.id
            )));
        }
        if !self.tails.is_empty() {
            self.push("end", Operator::End);
            self.tails.clear();
        }

        for jump in std::mem::take(&mut self.jumps) {
            match self
                .nodes
                .iter()
                .find(|n| n.alias.as_deref() == Some(jump.alias.as_str()))
            {
                Some(target) => {
                    let target = target.position.clone();
                    self.nodes[jump.from].edges.push(Edge {
                        target,
                        guard: jump.guard,
                    });
                }
                None => self
                    .errors
                    .push(format!("to('{}') names no node", jump.alias)),
            }
        }

        if !self.errors.is_empty() {
            return Err(FlowError::definition(format!(
                "flow '{}': {}",
                self.id,
                self.errors.join("; ")
            )));
        }

        let index = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.position.clone(), i))
            .collect();

        Ok(Flow {
            id: self.id,
            nodes: self.nodes,
            index,
            error_handler: self.error_handler,
            on_success,
            on_failure,
        })
    }
}

/// Builder for the forks of a parallel section. Finish with [`ParallelBuilder::join`].
pub struct ParallelBuilder<D> {
    builder: FlowBuilder<D>,
    node: usize,
    mode: JoinMode,
    forks: usize,
    branch_tails: Vec<Tail<D>>,
}

impl<D: FlowData> ParallelBuilder<D> {
    /// Add a fork. Each input context is copied into every fork.
    pub fn fork<F>(mut self, branch: F) -> Self
    where
        F: FnOnce(FlowBuilder<D>) -> FlowBuilder<D>,
    {
        let first = self.builder.nodes.len();
        let (mut builder, tails) = self.builder.branch(self.node, Guard::Always, branch);
        self.forks += 1;
        if tails.is_empty() {
            builder.errors.push(format!(
                "fork {} of '{}' never reaches its join",
                self.forks, builder.nodes[self.node].name
            ));
        }
        // produce and reduce re-batch their outputs, which would hide them from the join
        let rebatching: Vec<String> = builder.nodes[first..]
            .iter()
            .filter(|n| matches!(n.operator, Operator::Produce(_) | Operator::Reduce(_)))
            .map(|n| n.name.clone())
            .collect();
        for name in rebatching {
            builder.errors.push(format!(
                "'{name}' cannot run inside a fork of '{}'",
                builder.nodes[self.node].name
            ));
        }
        self.builder = builder;
        self.branch_tails.extend(tails);
        self
    }

    /// Close the section; the first fork to arrive supplies the payload.
    pub fn join(self, name: &str) -> FlowBuilder<D> {
        self.finish(name, None)
    }

    /// Close the section, combining the fork payloads in arrival order.
    pub fn join_with<F>(self, name: &str, combiner: F) -> FlowBuilder<D>
    where
        F: Fn(Vec<D>) -> FlowResult<D> + Send + Sync + 'static,
    {
        self.finish(name, Some(Arc::new(combiner)))
    }

    fn finish(self, name: &str, combiner: Option<crate::node::ReduceFn<D>>) -> FlowBuilder<D> {
        let mut builder = self.builder;
        if self.forks == 0 {
            builder.errors.push(format!(
                "parallel '{}' has no forks",
                builder.nodes[self.node].name
            ));
        }
        builder.tails = self.branch_tails;
        builder.push(
            name,
            Operator::Join {
                mode: self.mode,
                branches: self.forks,
                combiner,
            },
        );
        builder
    }
}

/// Builder for the branches of a conditions node. Finish with [`ConditionsBuilder::done`].
pub struct ConditionsBuilder<D> {
    builder: FlowBuilder<D>,
    node: usize,
    whens: usize,
    has_others: bool,
    branch_tails: Vec<Tail<D>>,
}

impl<D: FlowData> ConditionsBuilder<D> {
    /// Branch taken when `predicate` holds and no earlier predicate did.
    pub fn when<P, F>(mut self, predicate: P, branch: F) -> Self
    where
        P: Fn(&D) -> bool + Send + Sync + 'static,
        F: FnOnce(FlowBuilder<D>) -> FlowBuilder<D>,
    {
        let guard = Guard::When(Arc::new(predicate));
        let (builder, tails) = self.builder.branch(self.node, guard, branch);
        self.builder = builder;
        self.branch_tails.extend(tails);
        self.whens += 1;
        self
    }

    /// Branch taken when no predicate holds.
    pub fn others<F>(mut self, branch: F) -> Self
    where
        F: FnOnce(FlowBuilder<D>) -> FlowBuilder<D>,
    {
        if self.has_others {
            let name = self.builder.nodes[self.node].name.clone();
            self.builder
                .errors
                .push(format!("conditions '{name}' has two others branches"));
        }
        self.has_others = true;
        let (builder, tails) = self.builder.branch(self.node, Guard::Otherwise, branch);
        self.builder = builder;
        self.branch_tails.extend(tails);
        self
    }

    /// Close the section; open branch ends continue into the next node.
    pub fn done(self) -> FlowBuilder<D> {
        let mut builder = self.builder;
        if self.whens == 0 {
            let name = builder.nodes[self.node].name.clone();
            builder
                .errors
                .push(format!("conditions '{name}' has no when branch"));
        }
        builder.tails = self.branch_tails;
        builder
    }
}

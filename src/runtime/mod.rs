//! # Runtime - Publish Flows, Offer Data, Watch Traces
//!
//! [`FlowRuntime`] ties the pieces together. It owns a [`FlowRegistry`] of published
//! flows and talks to storage, locking and notification only through their ports, so
//! several runtimes sharing one repository, lock table and messenger behave like several
//! processes of one deployment.
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
//!         FlowBuilder::<i64>::new("calc")
//!             .map("inc", |x| Ok(x + 1))
//!             .map("double", |x| Ok(x * 2))
//!             .close()?,
//!     )?;
//!
//!     let handle = runtime.offer("calc", vec![1]).await?;
//!     handle.wait(Duration::from_secs(5)).await?;
//!     assert_eq!(handle.results().await?, vec![4]);
//!
//!     runtime.shutdown().await
//! }
//! ```
//!
//! ## ⚙️ How Work Moves
//!
//! Publishing a flow registers `workers_per_node` fixed-delay tasks per node with the
//! [`Scheduler`] and subscribes each node to READY events for its position. `offer`
//! persists the new contexts and publishes such an event, so the entry node wakes at
//! once; the poll interval only matters when an event is lost.
//!
//! ## 🔧 Configuration
//!
//! | Setting | Default | Meaning |
//! |---------|---------|---------|
//! | `batch_size` | 64 | Contexts per claim |
//! | `workers_per_node` | 1 | Concurrent drain tasks per node |
//! | `poll_interval` | 200 ms | Fallback wake-up when no event arrives |
//! | `lock_timeout` | 5 s | Wait for claim, batch and context locks |
//! | `shutdown_timeout` | 30 s | Wait for running drains on shutdown |
//! | `claim_lease` | 10 min | Age at which a SCHEDULED or EXECUTING claim counts as abandoned |
//!
//! ## 🩹 Recovery
//!
//! A claim that cannot be finished, because a port failed or a write broke an invariant,
//! fails its contexts with an `aborted` engine fault and reports them to the flow's
//! `close` callback. Contexts whose worker disappeared without doing that are failed the
//! same way once they are older than `claim_lease`.

mod worker;

use crate::context::{Batch, ContextFault, ContextRecord, FlowContext, FlowData, FlowStatus};
use crate::error::{FlowError, FlowResult};
use crate::flow::Flow;
use crate::lock::{FlowLocks, MemoryLocks};
use crate::messenger::{EventKind, FlowContextMessenger, FlowEvent, LocalMessenger, SubscriptionId};
use crate::node::{Operator, OperatorKind};
use crate::registry::FlowRegistry;
use crate::repo::{FlowContextRepo, MemoryContextRepo};
use crate::retry::RetryDecision;
use crate::scheduler::Scheduler;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Runtime settings.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Maximum contexts taken by one claim.
    pub batch_size: usize,
    /// Drain tasks registered per node.
    pub workers_per_node: usize,
    /// Fixed delay between drains when no event wakes a node.
    pub poll_interval: Duration,
    /// How long to wait for any lock before the drain gives up.
    pub lock_timeout: Duration,
    /// How long [`FlowRuntime::shutdown`] waits for running drains.
    pub shutdown_timeout: Duration,
    /// Claims older than this are treated as abandoned and failed.
    pub claim_lease: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            workers_per_node: 1,
            poll_interval: Duration::from_millis(200),
            lock_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
            claim_lease: Duration::from_secs(600),
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_workers_per_node(mut self, workers: usize) -> Self {
        self.workers_per_node = workers;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    /// Reject settings that would stall the runtime.
    pub fn validate(&self) -> FlowResult<()> {
        let zero = [
            ("batch_size", self.batch_size == 0),
            ("workers_per_node", self.workers_per_node == 0),
            ("poll_interval", self.poll_interval.is_zero()),
            ("lock_timeout", self.lock_timeout.is_zero()),
            ("claim_lease", self.claim_lease.is_zero()),
        ];
        match zero.iter().find(|(_, is_zero)| *is_zero) {
            Some((name, _)) => Err(FlowError::configuration(format!(
                "{name} must be greater than zero"
            ))),
            None => Ok(()),
        }
    }
}

struct Inner<D> {
    this: Weak<Inner<D>>,
    registry: FlowRegistry<D>,
    repo: Arc<dyn FlowContextRepo>,
    locks: Arc<dyn FlowLocks>,
    messenger: Arc<dyn FlowContextMessenger>,
    scheduler: Scheduler,
    config: RuntimeConfig,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

/// Assembles a [`FlowRuntime`] from its ports. Unset ports default to the in-memory ones.
#[derive(Default)]
pub struct RuntimeBuilder {
    repo: Option<Arc<dyn FlowContextRepo>>,
    locks: Option<Arc<dyn FlowLocks>>,
    messenger: Option<Arc<dyn FlowContextMessenger>>,
    scheduler: Option<Scheduler>,
    config: RuntimeConfig,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_repo(mut self, repo: Arc<dyn FlowContextRepo>) -> Self {
        self.repo = Some(repo);
        self
    }

    pub fn with_locks(mut self, locks: Arc<dyn FlowLocks>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn with_messenger(mut self, messenger: Arc<dyn FlowContextMessenger>) -> Self {
        self.messenger = Some(messenger);
        self
    }

    pub fn with_scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build<D: FlowData>(self) -> FlowResult<FlowRuntime<D>> {
        self.config.validate()?;
        Ok(FlowRuntime::from_parts(
            self.repo
                .unwrap_or_else(|| Arc::new(MemoryContextRepo::new())),
            self.locks.unwrap_or_else(|| Arc::new(MemoryLocks::new())),
            self.messenger
                .unwrap_or_else(|| Arc::new(LocalMessenger::new())),
            self.scheduler.unwrap_or_default(),
            self.config,
        ))
    }
}

/// Executes published flows over offered data.
pub struct FlowRuntime<D> {
    inner: Arc<Inner<D>>,
}

impl<D> Clone for FlowRuntime<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: FlowData> FlowRuntime<D> {
    /// A runtime with in-memory ports and default settings.
    pub fn in_memory() -> Self {
        Self::from_parts(
            Arc::new(MemoryContextRepo::new()),
            Arc::new(MemoryLocks::new()),
            Arc::new(LocalMessenger::new()),
            Scheduler::new(),
            RuntimeConfig::default(),
        )
    }

    fn from_parts(
        repo: Arc<dyn FlowContextRepo>,
        locks: Arc<dyn FlowLocks>,
        messenger: Arc<dyn FlowContextMessenger>,
        scheduler: Scheduler,
        config: RuntimeConfig,
    ) -> Self {
        let inner = Arc::new_cyclic(|this| Inner {
            this: this.clone(),
            registry: FlowRegistry::new(),
            repo,
            locks,
            messenger,
            scheduler,
            config,
            subscriptions: Mutex::new(Vec::new()),
        });
        Self { inner }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// The scheduler driving node workers and delayed retries.
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn repo(&self) -> Arc<dyn FlowContextRepo> {
        Arc::clone(&self.inner.repo)
    }

    pub fn flow(&self, flow_id: &str) -> FlowResult<Arc<Flow<D>>> {
        self.inner.registry.get(flow_id)
    }

    pub fn flow_ids(&self) -> Vec<String> {
        self.inner.registry.ids()
    }

    /// Register a flow and start its node workers.
    #[instrument(skip(self, flow), fields(flow = %flow.id(), nodes = flow.len()))]
    pub fn publish(&self, flow: Flow<D>) -> FlowResult<Arc<Flow<D>>> {
        let flow = self.inner.registry.register(flow)?;
        let config = &self.inner.config;

        for node in flow.nodes() {
            let names: Vec<String> = (0..config.workers_per_node)
                .map(|i| format!("{}/{}/w{i}", flow.id(), node.position))
                .collect();

            for name in &names {
                let weak = Arc::downgrade(&self.inner);
                let stream = flow.id().to_string();
                let position = node.position.clone();
                self.inner
                    .scheduler
                    .fixed_delay(name, config.poll_interval, move || {
                        let weak = weak.clone();
                        let stream = stream.clone();
                        let position = position.clone();
                        async move {
                            match weak.upgrade() {
                                Some(inner) => inner.drain(&stream, &position).await,
                                None => Ok(()),
                            }
                        }
                    })?;
            }

            let scheduler = self.inner.scheduler.clone();
            let stream = flow.id().to_string();
            let position = node.position.clone();
            let subscription = self.inner.messenger.subscribe(
                Arc::new(move |event: &FlowEvent| {
                    event.kind == EventKind::Ready
                        && event.stream_id == stream
                        && event.position == position
                }),
                Arc::new(move |_: &FlowEvent| {
                    for name in &names {
                        let _ = scheduler.trigger(name);
                    }
                }),
            )?;
            self.inner
                .subscriptions
                .lock()
                .map_err(|_| FlowError::generic("Failed to acquire subscription list"))?
                .push(subscription);
        }

        info!("Flow published");
        Ok(flow)
    }

    /// Start one trace holding `items`, all in one batch at the entry node.
    #[instrument(skip(self, items), fields(flow = flow_id, count = items.len()))]
    pub async fn offer(&self, flow_id: &str, items: Vec<D>) -> FlowResult<FlowHandle<D>> {
        let flow = self.inner.registry.get(flow_id)?;
        let trace_id = Uuid::new_v4();
        let batch = Batch::new(items.len());
        let parks = flow
            .node(flow.start())
            .is_some_and(|n| matches!(n.operator, Operator::Block));

        let mut contexts = Vec::with_capacity(items.len());
        for data in items {
            let mut ctx = FlowContext::with_trace(flow.id(), flow.start(), trace_id, data);
            ctx.to_batch(batch);
            if parks {
                ctx.park()?;
            }
            contexts.push(ctx);
        }

        if !contexts.is_empty() {
            let records = contexts
                .iter()
                .map(|ctx| ctx.to_record())
                .collect::<FlowResult<Vec<_>>>()?;
            self.inner.repo.save(records).await?;
            self.inner.announce(&contexts).await;
        }
        debug!(trace = %trace_id, "Offered");

        Ok(FlowHandle {
            runtime: self.clone(),
            stream_id: flow.id().to_string(),
            trace_id,
            context_ids: contexts.iter().map(|ctx| ctx.id()).collect(),
        })
    }

    pub async fn offer_one(&self, flow_id: &str, item: D) -> FlowResult<FlowHandle<D>> {
        self.offer(flow_id, vec![item]).await
    }

    /// Resume the contexts parked at block node `block` whose payload passes `select`.
    ///
    /// Returns how many were resumed. Contexts resumed concurrently by someone else are
    /// skipped, so each parked context advances once.
    #[instrument(skip(self, select))]
    pub async fn process_block<P>(&self, flow_id: &str, block: &str, select: P) -> FlowResult<usize>
    where
        P: Fn(&D) -> bool,
    {
        let flow = self.inner.registry.get(flow_id)?;
        let node = flow
            .find(block)
            .filter(|n| matches!(n.operator, Operator::Block))
            .ok_or_else(|| {
                FlowError::definition(format!("flow '{flow_id}' has no block node '{block}'"))
            })?;

        let parked = self
            .inner
            .repo
            .get_by_position(flow_id, &node.position, &[FlowStatus::Pending], None)
            .await?;
        let mut ids = Vec::new();
        for record in parked {
            let ctx: FlowContext<D> = record.into_context()?;
            if select(ctx.data()) {
                ids.push(ctx.id());
            }
        }

        let resumed = self.inner.resume(&ids).await?;
        info!(count = resumed.len(), "Block processed");
        Ok(resumed.len())
    }

    /// Resume specific PENDING contexts by id.
    pub async fn resume(&self, ids: &[Uuid]) -> FlowResult<usize> {
        Ok(self.inner.resume(ids).await?.len())
    }

    /// Apply a retry decision to contexts in ERROR.
    ///
    /// Fails with an invalid transition if a context is no longer in ERROR. Delayed
    /// decisions are scheduled and report zero.
    pub async fn retry(&self, decision: RetryDecision<D>) -> FlowResult<usize> {
        self.inner.apply_retry(decision).await
    }

    /// Overwrite the stored payload and scratch values of a PENDING context.
    pub async fn amend(&self, ctx: &FlowContext<D>) -> FlowResult<()> {
        let lock = self
            .inner
            .locks
            .lock(&format!("ctx/{}", ctx.id()), self.inner.config.lock_timeout)
            .await?;
        let stored = self.inner.repo.get(ctx.id()).await?;
        if stored.status != FlowStatus::Pending {
            return Err(FlowError::generic(format!(
                "context {} is {}; only PENDING contexts can be amended",
                ctx.id(),
                stored.status
            )));
        }
        let record = ctx.to_record()?;
        self.inner
            .repo
            .update_flow_data(ctx.id(), record.data_json, record.scratch_json)
            .await?;
        lock.release();
        Ok(())
    }

    pub async fn contexts_by_trace(&self, trace_id: Uuid) -> FlowResult<Vec<FlowContext<D>>> {
        self.inner
            .repo
            .get_by_trace(trace_id)
            .await?
            .into_iter()
            .map(|record| record.into_context())
            .collect()
    }

    /// Contexts at the node named `node` (alias, name or position), filtered by status.
    pub async fn contexts_at(
        &self,
        flow_id: &str,
        node: &str,
        statuses: &[FlowStatus],
    ) -> FlowResult<Vec<FlowContext<D>>> {
        let flow = self.inner.registry.get(flow_id)?;
        let position = flow
            .find(node)
            .map(|n| n.position.clone())
            .ok_or_else(|| FlowError::definition(format!("flow '{flow_id}' has no node '{node}'")))?;
        self.inner
            .repo
            .get_by_position(flow_id, &position, statuses, None)
            .await?
            .into_iter()
            .map(|record| record.into_context())
            .collect()
    }

    pub async fn trace_summary(&self, trace_id: Uuid) -> FlowResult<TraceSummary> {
        let records = self.inner.repo.get_by_trace(trace_id).await?;
        Ok(TraceSummary::from_records(trace_id, &records))
    }

    /// Poll until the trace has no READY, SCHEDULED or EXECUTING context and no failed
    /// context is waiting on its error handler's retry.
    pub async fn wait_for_trace(&self, trace_id: Uuid, timeout: Duration) -> FlowResult<TraceSummary> {
        let deadline = Instant::now() + timeout;
        loop {
            let summary = self.trace_summary(trace_id).await?;
            if summary.is_settled() {
                return Ok(summary);
            }
            if Instant::now() >= deadline {
                return Err(FlowError::timeout(format!(
                    "{summary} still active after {timeout:?}"
                )));
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    /// Payloads that reached an end node, in arrival order.
    pub async fn results(&self, trace_id: Uuid) -> FlowResult<Vec<D>> {
        let mut results = Vec::new();
        for record in self.inner.repo.get_by_trace(trace_id).await? {
            if record.status != FlowStatus::Archived || record.superseded {
                continue;
            }
            let at_end = self
                .inner
                .registry
                .get(&record.stream_id)
                .ok()
                .and_then(|flow| flow.node(&record.position).map(|n| n.kind()))
                == Some(OperatorKind::End);
            if at_end {
                results.push(record.into_context::<D>()?.into_data());
            }
        }
        Ok(results)
    }

    /// Faults of the trace's contexts that are in ERROR.
    pub async fn failures(&self, trace_id: Uuid) -> FlowResult<Vec<ContextFault>> {
        Ok(self
            .inner
            .repo
            .get_by_trace(trace_id)
            .await?
            .into_iter()
            .filter(|record| record.status == FlowStatus::Error)
            .filter_map(|record| record.fault)
            .collect())
    }

    /// Remove a trace's contexts. Active contexts need `force`.
    pub async fn delete_trace(&self, trace_id: Uuid, force: bool) -> FlowResult<usize> {
        let deleted = self.inner.repo.delete_trace(trace_id, force).await?;
        info!(trace = %trace_id, deleted, force, "Trace deleted");
        Ok(deleted)
    }

    /// Stop listening for events and wait for running drains to finish.
    pub async fn shutdown(&self) -> FlowResult<()> {
        let subscriptions = self
            .inner
            .subscriptions
            .lock()
            .map(|mut subs| std::mem::take(&mut *subs))
            .map_err(|_| FlowError::generic("Failed to acquire subscription list"))?;
        for subscription in subscriptions {
            self.inner.messenger.unsubscribe(subscription)?;
        }
        self.inner
            .scheduler
            .stop_with_timeout(self.inner.config.shutdown_timeout)
            .await?;
        info!("Runtime stopped");
        Ok(())
    }
}

impl<D> fmt::Debug for FlowRuntime<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowRuntime")
            .field("flows", &self.inner.registry.ids())
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Returned by [`FlowRuntime::offer`]; follows one trace.
pub struct FlowHandle<D> {
    runtime: FlowRuntime<D>,
    stream_id: String,
    trace_id: Uuid,
    context_ids: Vec<Uuid>,
}

impl<D: FlowData> FlowHandle<D> {
    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Ids of the contexts created by the offer.
    pub fn context_ids(&self) -> &[Uuid] {
        &self.context_ids
    }

    pub async fn wait(&self, timeout: Duration) -> FlowResult<TraceSummary> {
        self.runtime.wait_for_trace(self.trace_id, timeout).await
    }

    pub async fn summary(&self) -> FlowResult<TraceSummary> {
        self.runtime.trace_summary(self.trace_id).await
    }

    pub async fn contexts(&self) -> FlowResult<Vec<FlowContext<D>>> {
        self.runtime.contexts_by_trace(self.trace_id).await
    }

    pub async fn results(&self) -> FlowResult<Vec<D>> {
        self.runtime.results(self.trace_id).await
    }

    pub async fn failures(&self) -> FlowResult<Vec<ContextFault>> {
        self.runtime.failures(self.trace_id).await
    }
}

impl<D> fmt::Debug for FlowHandle<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowHandle")
            .field("stream_id", &self.stream_id)
            .field("trace_id", &self.trace_id)
            .field("contexts", &self.context_ids.len())
            .finish()
    }
}

/// Status counts for one trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceSummary {
    pub trace_id: Uuid,
    pub counts: BTreeMap<FlowStatus, usize>,
    /// Archived contexts that lost an either-mode join.
    pub superseded: usize,
    /// Failed contexts whose error handler decided to retry them later.
    pub retry_pending: usize,
}

impl TraceSummary {
    fn from_records(trace_id: Uuid, records: &[ContextRecord]) -> Self {
        let mut counts = BTreeMap::new();
        let mut superseded = 0;
        let mut retry_pending = 0;
        for record in records {
            *counts.entry(record.status).or_insert(0) += 1;
            if record.superseded {
                superseded += 1;
            }
            if record.retry_pending && record.status == FlowStatus::Error {
                retry_pending += 1;
            }
        }
        Self {
            trace_id,
            counts,
            superseded,
            retry_pending,
        }
    }

    pub fn count(&self, status: FlowStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    /// Nothing is waiting to be claimed, running or about to be retried. Parked
    /// contexts may remain.
    pub fn is_settled(&self) -> bool {
        self.retry_pending == 0
            && [FlowStatus::Ready, FlowStatus::Scheduled, FlowStatus::Executing]
                .iter()
                .all(|status| self.count(*status) == 0)
    }
}

impl fmt::Display for TraceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trace {}:", self.trace_id)?;
        for (status, count) in &self.counts {
            write!(f, " {status}={count}")?;
        }
        if self.retry_pending > 0 {
            write!(f, " (retry pending: {})", self.retry_pending)?;
        }
        Ok(())
    }
}

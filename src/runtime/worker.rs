//! Node workers: recover, claim, run, settle.
//!
//! Every node of a published flow gets `workers_per_node` scheduler tasks. One run drains
//! the node's READY queue in claims of up to `batch_size` contexts:
//!
//! 1. **recover** under `claim/{stream}/{position}`: contexts claimed longer than the claim
//!    lease ago are failed, and barrier batches that waited past the lock timeout are
//!    converged again.
//! 2. **claim** under the same lock: READY -> SCHEDULED, written back.
//! 3. **advance** for plain operators: SCHEDULED -> EXECUTING, run the operator, then
//!    **settle**: save successors, archive the sources, publish events.
//! 4. **converge** for produce, join and reduce, under `batch/{stream}/{position}/{batch}`:
//!    reload the batch members and fire only when enough of them are waiting.
//!
//! Failed contexts go through **fail**: they enter ERROR with a fault, then the node's or
//! the flow's error handler decides whether they are retried. A claim that cannot be
//! carried through (a port failed, a write broke an invariant) is **aborted**: whatever
//! it left SCHEDULED or EXECUTING enters ERROR with an engine fault.

use super::Inner;
use crate::context::{Batch, ContextFault, ContextRecord, FlowContext, FlowData, FlowStatus};
use crate::error::{FlowError, FlowResult};
use crate::flow::Flow;
use crate::messenger::{EventKind, FlowEvent};
use crate::node::{FlowNode, JoinMode, Operator};
use crate::retry::{ErrorDecision, RetryDecision, run_with_retries};
use chrono::{DateTime, TimeDelta, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// What one operator run produced.
struct Outcome<D> {
    /// Sources that finished and get archived.
    done: Vec<FlowContext<D>>,
    /// Successors, READY until parked.
    next: Vec<FlowContext<D>>,
    /// Failed groups; each group reaches the error handler together.
    failed: Vec<(FlowError, Vec<FlowContext<D>>)>,
}

impl<D> Default for Outcome<D> {
    fn default() -> Self {
        Self {
            done: Vec::new(),
            next: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<D> Outcome<D> {
    fn fail(&mut self, error: FlowError, contexts: Vec<FlowContext<D>>) {
        if !contexts.is_empty() {
            self.failed.push((error, contexts));
        }
    }
}

/// Wall-clock time, never earlier than the context's last recorded timestamp.
fn stamp<D>(ctx: &FlowContext<D>) -> DateTime<Utc> {
    Utc::now().max(ctx.last_touched())
}

fn records<D: Serialize>(contexts: &[FlowContext<D>]) -> FlowResult<Vec<ContextRecord>> {
    contexts.iter().map(|ctx| ctx.to_record()).collect()
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_string()
    }
}

/// Run user code, turning a panic into a node error.
fn guarded<T>(f: impl FnOnce() -> FlowResult<T>) -> FlowResult<T> {
    std::panic::catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|panic| Err(FlowError::node_execution(panic_message(panic))))
}

fn ids<D>(contexts: &[FlowContext<D>]) -> Vec<Uuid> {
    contexts.iter().map(FlowContext::id).collect()
}

fn age_limit(name: &str, limit: Duration) -> FlowResult<TimeDelta> {
    TimeDelta::from_std(limit)
        .map_err(|e| FlowError::configuration(format!("{name} out of range: {e}")))
}

fn missing_successor<D>(flow: &Flow<D>, node: &FlowNode<D>) -> FlowError {
    FlowError::definition(format!(
        "node '{}' at {}/{} has no successor",
        node.name,
        flow.id(),
        node.position
    ))
}

impl<D: FlowData> Inner<D> {
    /// Process everything READY at one node.
    #[instrument(level = "debug", skip(self))]
    pub(super) async fn drain(&self, stream_id: &str, position: &str) -> FlowResult<()> {
        let flow = self.registry.get(stream_id)?;
        let node = flow.node(position).ok_or_else(|| {
            FlowError::definition(format!("flow '{stream_id}' has no node at {position}"))
        })?;

        self.recover(&flow, node).await?;
        loop {
            let claimed = self.claim(&flow, node).await?;
            let count = claimed.len();
            if count == 0 {
                break;
            }
            debug!(stream = stream_id, position, node = %node.name, count, "Claimed contexts");

            if node.operator.is_barrier() {
                self.converge(&flow, node, claimed).await?;
            } else {
                let claimed_ids = ids(&claimed);
                if let Err(cause) = self.advance(&flow, node, claimed).await {
                    let stuck = self.repo.get_many(&claimed_ids).await.map_err(FlowError::from);
                    self.abort(&flow, node, stuck, &cause).await;
                    return Err(cause);
                }
            }
            if count < self.config.batch_size {
                break;
            }
        }
        Ok(())
    }

    /// Fail contexts whose claim outlived the lease, then re-converge barrier batches
    /// that have been waiting longer than the lock timeout.
    async fn recover(&self, flow: &Flow<D>, node: &FlowNode<D>) -> FlowResult<()> {
        let lease = age_limit("claim_lease", self.config.claim_lease)?;
        let recheck = age_limit("lock_timeout", self.config.lock_timeout)?;
        let barrier = node.operator.is_barrier();
        let now = Utc::now();

        let lock = self
            .locks
            .lock(
                &format!("claim/{}/{}", flow.id(), node.position),
                self.config.lock_timeout,
            )
            .await?;
        let active = self
            .repo
            .get_by_position(
                flow.id(),
                &node.position,
                &[FlowStatus::Scheduled, FlowStatus::Executing],
                None,
            )
            .await?;

        let mut expired = Vec::new();
        let mut waiting: Vec<Batch> = Vec::new();
        for record in active {
            let since = match record.status {
                FlowStatus::Executing => record.executed_at,
                _ => record.scheduled_at,
            }
            .unwrap_or(record.created_at);
            let age = now - since;

            if barrier && record.status == FlowStatus::Scheduled {
                if age > recheck {
                    if let Some(batch) = record.batch() {
                        if !waiting.iter().any(|b| b.id == batch.id) {
                            waiting.push(batch);
                        }
                    }
                }
            } else if age > lease {
                expired.push(record);
            }
        }

        if !expired.is_empty() {
            warn!(stream = flow.id(), position = %node.position, count = expired.len(), "Claim lease expired");
            let error = FlowError::aborted(format!(
                "claim lease of {:?} expired",
                self.config.claim_lease
            ));
            self.fail_stuck(flow, node, &error, expired).await?;
        }
        lock.release();

        for batch in waiting {
            if let Err(e) = self.converge_batch(flow, node, batch).await {
                warn!(stream = flow.id(), position = %node.position, batch = %batch.id, error = %e, "Recheck of waiting batch failed");
            }
        }
        Ok(())
    }

    async fn claim(&self, flow: &Flow<D>, node: &FlowNode<D>) -> FlowResult<Vec<FlowContext<D>>> {
        let lock = self
            .locks
            .lock(
                &format!("claim/{}/{}", flow.id(), node.position),
                self.config.lock_timeout,
            )
            .await?;

        let ready = self
            .repo
            .get_by_position(
                flow.id(),
                &node.position,
                &[FlowStatus::Ready],
                Some(self.config.batch_size),
            )
            .await?;
        let mut claimed = Vec::with_capacity(ready.len());
        let mut rejected = Vec::new();
        for record in ready {
            match record.clone().into_context::<D>() {
                Ok(mut ctx) => {
                    let at = stamp(&ctx);
                    ctx.schedule(at)?;
                    claimed.push(ctx);
                }
                Err(cause) => {
                    let error = FlowError::aborted(format!("undecodable context: {cause}"));
                    let fault =
                        ContextFault::from_error(flow.id(), &node.position, &node.name, &error);
                    let mut record = record;
                    record.reject(fault, Utc::now())?;
                    rejected.push(record);
                }
            }
        }

        let mut rows = records(&claimed)?;
        rows.extend(rejected.iter().cloned());
        if !rows.is_empty() {
            self.repo.update(rows).await?;
        }
        lock.release();

        for record in &rejected {
            error!(stream = flow.id(), position = %node.position, context = %record.id, "Rejected undecodable context");
            if let Some(fault) = &record.fault {
                flow.notify_failure(&fault.to_error());
            }
        }
        Ok(claimed)
    }

    async fn start_executing(
        &self,
        mut contexts: Vec<FlowContext<D>>,
    ) -> FlowResult<Vec<FlowContext<D>>> {
        for ctx in &mut contexts {
            let at = stamp(ctx);
            ctx.execute(at)?;
        }
        if !contexts.is_empty() {
            self.repo.update(records(&contexts)?).await?;
        }
        Ok(contexts)
    }

    async fn advance(
        &self,
        flow: &Flow<D>,
        node: &FlowNode<D>,
        claimed: Vec<FlowContext<D>>,
    ) -> FlowResult<()> {
        let running = self.start_executing(claimed).await?;
        let outcome = self.run_operator(flow, node, running).await;
        self.settle(flow, node, outcome).await
    }

    /// Fail what an interrupted claim left SCHEDULED or EXECUTING and report it to `close`.
    ///
    /// When even that fails the contexts stay claimed until their lease expires.
    async fn abort(
        &self,
        flow: &Flow<D>,
        node: &FlowNode<D>,
        stuck: FlowResult<Vec<ContextRecord>>,
        cause: &FlowError,
    ) {
        error!(stream = flow.id(), position = %node.position, node = %node.name, error = %cause, "Claim aborted");
        let error = FlowError::aborted(cause.to_string());
        let result = match stuck {
            Ok(records) => {
                let stuck = records
                    .into_iter()
                    .filter(|r| matches!(r.status, FlowStatus::Scheduled | FlowStatus::Executing))
                    .collect();
                self.fail_stuck(flow, node, &error, stuck).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(stream = flow.id(), position = %node.position, error = %e, "Aborted claim left to lease expiry");
        }
    }

    /// SCHEDULED or EXECUTING -> ERROR with an engine fault, bypassing error handlers.
    async fn fail_stuck(
        &self,
        flow: &Flow<D>,
        node: &FlowNode<D>,
        error: &FlowError,
        stuck: Vec<ContextRecord>,
    ) -> FlowResult<usize> {
        if stuck.is_empty() {
            return Ok(0);
        }
        let fault = ContextFault::from_error(flow.id(), &node.position, &node.name, error);
        let mut failed = Vec::with_capacity(stuck.len());
        for record in stuck {
            let mut ctx: FlowContext<D> = record.into_context()?;
            if ctx.status() == FlowStatus::Scheduled {
                let at = stamp(&ctx);
                ctx.execute(at)?;
            }
            ctx.fail(fault.clone())?;
            failed.push(ctx);
        }

        for _ in &failed {
            flow.notify_failure(&fault.to_error());
        }
        self.repo.update(records(&failed)?).await?;
        self.announce(&failed).await;
        Ok(failed.len())
    }

    async fn run_operator(
        &self,
        flow: &Flow<D>,
        node: &FlowNode<D>,
        contexts: Vec<FlowContext<D>>,
    ) -> Outcome<D> {
        let mut out = Outcome::default();
        let retry_mode = &node.config.retry_mode;
        let needs_next = matches!(
            node.operator,
            Operator::Map(_) | Operator::Just(_) | Operator::Execute(_) | Operator::Block
        );
        let next = match node.next() {
            Some(next) => next.to_string(),
            None if needs_next => {
                out.fail(missing_successor(flow, node), contexts);
                return out;
            }
            None => String::new(),
        };

        match &node.operator {
            Operator::Map(f) => {
                for ctx in contexts {
                    let result = run_with_retries(retry_mode, || {
                        let data = ctx.data().clone();
                        async move { guarded(|| f(data)) }
                    })
                    .await;
                    match result {
                        Ok(data) => {
                            out.next.push(ctx.derive(&next, data));
                            out.done.push(ctx);
                        }
                        Err(e) => out.fail(e, vec![ctx]),
                    }
                }
            }
            Operator::Just(f) => {
                for ctx in contexts {
                    let result = run_with_retries(retry_mode, || {
                        let mut work = ctx.clone();
                        async move { guarded(|| f(&mut work)).map(|()| work) }
                    })
                    .await;
                    match result {
                        Ok(work) => {
                            let data = work.data().clone();
                            out.next.push(work.derive(&next, data));
                            out.done.push(ctx);
                        }
                        Err(e) => out.fail(e, vec![ctx]),
                    }
                }
            }
            Operator::Execute(executor) => {
                let config = &node.config;
                let result = run_with_retries(retry_mode, || {
                    let input = contexts.clone();
                    async move {
                        AssertUnwindSafe(executor.execute(config, input))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|panic| {
                                Err(FlowError::node_execution(panic_message(panic)))
                            })
                    }
                })
                .await;
                match result {
                    Ok(returned) => {
                        for ctx in returned {
                            let data = ctx.data().clone();
                            out.next.push(ctx.derive(&next, data));
                        }
                        out.done.extend(contexts);
                    }
                    Err(e) => out.fail(e, contexts),
                }
            }
            Operator::Parallel => {
                let forks = node.forks();
                for ctx in contexts {
                    let batch = Batch::new(forks.len());
                    for target in &forks {
                        let mut branch = ctx.derive(*target, ctx.data().clone());
                        branch.push_batch(batch);
                        out.next.push(branch);
                    }
                    out.done.push(ctx);
                }
            }
            Operator::Conditions => {
                for ctx in contexts {
                    match guarded(|| Ok(node.route(ctx.data()).map(str::to_string))) {
                        Ok(Some(target)) => {
                            let data = ctx.data().clone();
                            out.next.push(ctx.derive(target, data));
                            out.done.push(ctx);
                        }
                        Ok(None) => out.fail(
                            FlowError::NoMatchingBranch {
                                stream_id: flow.id().to_string(),
                                position: node.position.clone(),
                            },
                            vec![ctx],
                        ),
                        Err(e) => out.fail(e, vec![ctx]),
                    }
                }
            }
            Operator::Block => {
                for ctx in contexts {
                    let data = ctx.data().clone();
                    out.next.push(ctx.derive(&next, data));
                    out.done.push(ctx);
                }
            }
            Operator::Relay { flow_id } => match self.registry.get(flow_id) {
                Ok(target) => {
                    for ctx in contexts {
                        let data = ctx.data().clone();
                        out.next
                            .push(ctx.derive(target.start(), data).into_stream(target.id()));
                        out.done.push(ctx);
                    }
                }
                Err(e) => out.fail(e, contexts),
            },
            Operator::End => out.done.extend(contexts),
            Operator::Join { .. } | Operator::Reduce(_) | Operator::Produce(_) => out.fail(
                FlowError::batch(format!(
                    "barrier '{}' reached without its batch lock",
                    node.name
                )),
                contexts,
            ),
        }
        out
    }

    async fn converge(
        &self,
        flow: &Flow<D>,
        node: &FlowNode<D>,
        claimed: Vec<FlowContext<D>>,
    ) -> FlowResult<()> {
        let mut batches: Vec<Batch> = Vec::new();
        let mut unbatched = Vec::new();
        for ctx in claimed {
            match ctx.batch() {
                Some(batch) => {
                    if !batches.iter().any(|b| b.id == batch.id) {
                        batches.push(batch);
                    }
                }
                None => unbatched.push(ctx),
            }
        }

        if !unbatched.is_empty() {
            let running = self.start_executing(unbatched).await?;
            let error = FlowError::batch(format!(
                "{} context(s) reached barrier {}/{} without a batch",
                running.len(),
                flow.id(),
                node.position
            ));
            self.fail(flow, node, error, running).await?;
        }

        let mut first_error = None;
        for batch in batches {
            if let Err(e) = self.converge_batch(flow, node, batch).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Acquire the batch lock, fire if complete, release.
    ///
    /// A busy lock is not an error: the arrivals stay SCHEDULED and the batch is
    /// converged again once they wait longer than the lock timeout. Failures after the
    /// lock was taken abort the members left EXECUTING.
    async fn converge_batch(
        &self,
        flow: &Flow<D>,
        node: &FlowNode<D>,
        batch: Batch,
    ) -> FlowResult<()> {
        let key = format!("batch/{}/{}/{}", flow.id(), node.position, batch.id);
        let lock = match self.locks.lock(&key, self.config.lock_timeout).await {
            Ok(lock) => lock,
            Err(e) => {
                warn!(stream = flow.id(), position = %node.position, batch = %batch.id, error = %e, "Batch busy, deferring");
                return Ok(());
            }
        };

        let result = self.fire(flow, node, batch).await;
        if let Err(cause) = &result {
            let stuck = self
                .repo
                .get_by_batch(flow.id(), &node.position, batch.id)
                .await
                .map(|members| {
                    members
                        .into_iter()
                        .filter(|m| m.status == FlowStatus::Executing)
                        .collect()
                })
                .map_err(FlowError::from);
            self.abort(flow, node, stuck, cause).await;
        }
        lock.release();
        result
    }

    /// Read membership, decide, write back. Runs under the batch lock.
    async fn fire(&self, flow: &Flow<D>, node: &FlowNode<D>, batch: Batch) -> FlowResult<()> {
        let members = self
            .repo
            .get_by_batch(flow.id(), &node.position, batch.id)
            .await?
            .into_iter()
            .map(|record| record.into_context())
            .collect::<FlowResult<Vec<FlowContext<D>>>>()?;
        let advanced = members
            .iter()
            .any(|m| m.status() == FlowStatus::Archived && !m.is_superseded());
        let mut waiting: Vec<FlowContext<D>> = members
            .into_iter()
            .filter(|m| m.status() == FlowStatus::Scheduled)
            .collect();

        if advanced {
            if !waiting.is_empty() {
                debug!(stream = flow.id(), position = %node.position, batch = %batch.id, count = waiting.len(), "Superseding late arrivals");
                self.supersede(&mut waiting).await?;
            }
            return Ok(());
        }

        let expected = match &node.operator {
            Operator::Join {
                mode: JoinMode::Either,
                ..
            } => 1,
            Operator::Join {
                mode: JoinMode::All,
                branches,
                ..
            } => {
                if batch.size != *branches {
                    let error = FlowError::batch(format!(
                        "join '{}' has {branches} branches but batch {} expects {}",
                        node.name, batch.id, batch.size
                    ));
                    let running = self.start_executing(waiting).await?;
                    return self.fail(flow, node, error, running).await;
                }
                *branches
            }
            _ => batch.size.max(1),
        };
        if waiting.len() < expected {
            debug!(stream = flow.id(), position = %node.position, batch = %batch.id, arrived = waiting.len(), expected, "Barrier waiting");
            return Ok(());
        }

        let mut losers = waiting.split_off(expected);
        let used = self.start_executing(waiting).await?;
        let outcome = self.fold(flow, node, used).await;
        let fired = outcome.failed.is_empty();
        self.settle(flow, node, outcome).await?;
        if fired && !losers.is_empty() {
            self.supersede(&mut losers).await?;
        }
        if fired {
            info!(stream = flow.id(), position = %node.position, batch = %batch.id, members = expected, "Barrier advanced");
        }
        Ok(())
    }

    async fn fold(&self, flow: &Flow<D>, node: &FlowNode<D>, used: Vec<FlowContext<D>>) -> Outcome<D> {
        let mut out = Outcome::default();
        let Some(next) = node.next() else {
            out.fail(missing_successor(flow, node), used);
            return out;
        };

        let payloads: Vec<D> = used.iter().map(|c| c.data().clone()).collect();
        let retry_mode = &node.config.retry_mode;

        if let Operator::Produce(f) = &node.operator {
            let produced = run_with_retries(retry_mode, || {
                let payloads = payloads.clone();
                async move { guarded(|| f(payloads)) }
            })
            .await;
            match (produced, used.first()) {
                (Ok(outputs), Some(first)) => {
                    let batch = Batch::new(outputs.len());
                    for data in outputs {
                        let mut child = first.derive(next, data);
                        child.to_batch(batch);
                        out.next.push(child);
                    }
                    out.done = used;
                }
                (Ok(_), None) => {}
                (Err(e), _) => out.fail(e, used),
            }
            return out;
        }

        let folded = match &node.operator {
            Operator::Reduce(f)
            | Operator::Join {
                combiner: Some(f), ..
            } => {
                run_with_retries(retry_mode, || {
                    let payloads = payloads.clone();
                    async move { guarded(|| f(payloads)) }
                })
                .await
            }
            Operator::Join { combiner: None, .. } => payloads
                .first()
                .cloned()
                .ok_or_else(|| FlowError::batch("join fired without arrivals")),
            _ => Err(FlowError::batch(format!(
                "'{}' is not a barrier",
                node.name
            ))),
        };

        let successor = folded.and_then(|value| {
            let first = used
                .first()
                .ok_or_else(|| FlowError::batch("barrier fired without members"))?;
            let mut successor = first.derive(next, value);
            match &node.operator {
                Operator::Reduce(_) => successor.to_batch(Batch::new(1)),
                _ => {
                    successor.pop_batch()?;
                }
            }
            Ok(successor)
        });

        match successor {
            Ok(successor) => {
                out.next.push(successor);
                out.done = used;
            }
            Err(e) => out.fail(e, used),
        }
        out
    }

    async fn supersede(&self, contexts: &mut [FlowContext<D>]) -> FlowResult<()> {
        for ctx in contexts.iter_mut() {
            let at = stamp(ctx);
            ctx.supersede(at)?;
        }
        self.repo.update(records(contexts)?).await?;
        Ok(())
    }

    /// Park successors that land on a block node.
    fn park_blocked(&self, contexts: &mut [FlowContext<D>]) -> FlowResult<()> {
        for ctx in contexts.iter_mut() {
            let target = self.registry.get(ctx.stream_id())?;
            if target
                .node(ctx.position())
                .is_some_and(|n| matches!(n.operator, Operator::Block))
            {
                ctx.park()?;
            }
        }
        Ok(())
    }

    async fn settle(&self, flow: &Flow<D>, node: &FlowNode<D>, outcome: Outcome<D>) -> FlowResult<()> {
        let Outcome {
            mut done,
            mut next,
            failed,
        } = outcome;

        // Successors first: the trace never looks settled while work is in flight.
        self.park_blocked(&mut next)?;
        if !next.is_empty() {
            self.repo.save(records(&next)?).await?;
        }
        for ctx in &mut done {
            let at = stamp(ctx);
            ctx.complete(at)?;
        }
        // Callbacks run before the write that lets the trace settle.
        let at_end = matches!(node.operator, Operator::End) && !done.is_empty();
        if at_end {
            for ctx in &done {
                flow.notify_success(ctx);
            }
        }
        if !done.is_empty() {
            self.repo.update(records(&done)?).await?;
        }
        self.announce(&next).await;

        if at_end {
            self.announce(&done).await;
            info!(stream = flow.id(), count = done.len(), "Contexts reached the end");
        }

        for (error, contexts) in failed {
            self.fail(flow, node, error, contexts).await?;
        }
        Ok(())
    }

    /// Publish one event per (stream, position, status) group.
    pub(super) async fn announce(&self, contexts: &[FlowContext<D>]) {
        let mut groups: HashMap<(String, String, FlowStatus), (Vec<Uuid>, usize)> = HashMap::new();
        for ctx in contexts {
            let entry = groups
                .entry((
                    ctx.stream_id().to_string(),
                    ctx.position().to_string(),
                    ctx.status(),
                ))
                .or_default();
            if !entry.0.contains(&ctx.trace_id()) {
                entry.0.push(ctx.trace_id());
            }
            entry.1 += 1;
        }

        for ((stream_id, position, status), (traces, count)) in groups {
            let Some(kind) = EventKind::for_status(status) else {
                continue;
            };
            let event = FlowEvent::new(stream_id, position, kind, traces, count);
            if let Err(e) = self.messenger.publish(event).await {
                warn!(error = %e, "Failed to publish flow event");
            }
        }
    }

    async fn fail(
        &self,
        flow: &Flow<D>,
        node: &FlowNode<D>,
        error: FlowError,
        mut contexts: Vec<FlowContext<D>>,
    ) -> FlowResult<()> {
        let fault = ContextFault::from_error(flow.id(), &node.position, &node.name, &error);
        let handler = if error.is_engine_error() {
            None
        } else {
            node.error_handler
                .as_ref()
                .or(flow.error_handler())
                .cloned()
        };

        for ctx in &mut contexts {
            ctx.fail(fault.clone())?;
            if handler.is_some() {
                ctx.await_retry();
            }
        }
        if error.is_engine_error() {
            error!(stream = flow.id(), position = %node.position, node = %node.name, error = %error, count = contexts.len(), "Engine error");
        } else {
            warn!(stream = flow.id(), position = %node.position, node = %node.name, error = %error, count = contexts.len(), "Node failed");
        }

        let Some(handler) = handler else {
            for _ in &contexts {
                flow.notify_failure(&fault.to_error());
            }
            self.repo.update(records(&contexts)?).await?;
            self.announce(&contexts).await;
            return Ok(());
        };

        // The retry marker keeps the trace unsettled until the handler's decision lands.
        self.repo.update(records(&contexts)?).await?;
        self.announce(&contexts).await;

        let decision = match AssertUnwindSafe(handler.handle(&error, contexts.clone()))
            .catch_unwind()
            .await
        {
            Ok(decision) => decision,
            Err(panic) => {
                error!(node = %node.name, cause = %panic_message(panic), "Error handler panicked");
                ErrorDecision::Terminate
            }
        };

        let failed = ids(&contexts);
        match decision {
            ErrorDecision::Retry(decision) => {
                let retried = ids(&decision.contexts);
                let dropped: Vec<Uuid> = failed
                    .into_iter()
                    .filter(|id| !retried.contains(id))
                    .collect();
                self.give_up(&dropped).await?;
                if let Err(e) = self.apply_retry(decision).await {
                    error!(stream = flow.id(), node = %node.name, error = %e, "Retry could not be applied");
                    self.give_up(&retried).await?;
                }
            }
            ErrorDecision::Terminate => self.give_up(&failed).await?,
        }
        Ok(())
    }

    /// Clear the retry marker of contexts nobody will retry and report them to `close`.
    pub(super) async fn give_up(&self, ids: &[Uuid]) -> FlowResult<()> {
        for id in ids {
            let lock = self
                .locks
                .lock(&format!("ctx/{id}"), self.config.lock_timeout)
                .await?;
            let mut current: FlowContext<D> = self.repo.get(*id).await?.into_context()?;
            if current.status() == FlowStatus::Error && current.is_retry_pending() {
                current.release_retry();
                if let (Ok(flow), Some(fault)) =
                    (self.registry.get(current.stream_id()), current.error())
                {
                    flow.notify_failure(&fault.to_error());
                }
                self.repo.update(vec![current.to_record()?]).await?;
            }
            lock.release();
        }
        Ok(())
    }

    /// Put contexts back to READY now, or schedule that after the decision's delay.
    ///
    /// Returns the number of contexts reset right away.
    pub(super) async fn apply_retry(&self, decision: RetryDecision<D>) -> FlowResult<usize> {
        let RetryDecision { contexts, delay } = decision;
        match delay {
            Some(delay) if !delay.is_zero() => {
                let name = format!("retry/{}", Uuid::new_v4());
                let weak = self.this.clone();
                let count = contexts.len();
                self.scheduler.disposable(&name, delay, move || {
                    let weak = weak.clone();
                    let contexts = contexts.clone();
                    async move {
                        let Some(inner) = weak.upgrade() else {
                            return Ok(());
                        };
                        let retried = ids(&contexts);
                        match inner.reset_for_retry(contexts).await {
                            Ok(_) => Ok(()),
                            Err(e) => {
                                inner.give_up(&retried).await?;
                                Err(e)
                            }
                        }
                    }
                })?;
                debug!(task = %name, count, delay_ms = delay.as_millis() as u64, "Retry scheduled");
                Ok(0)
            }
            _ => self.reset_for_retry(contexts).await,
        }
    }

    /// ERROR -> READY for each context, taking the patched payload and scratch values.
    ///
    /// The stored context must still be in ERROR, so applying the same decision twice
    /// fails with an invalid transition instead of running the work twice.
    pub(super) async fn reset_for_retry(&self, patched: Vec<FlowContext<D>>) -> FlowResult<usize> {
        let mut ready = Vec::with_capacity(patched.len());
        for patch in patched {
            let lock = self
                .locks
                .lock(&format!("ctx/{}", patch.id()), self.config.lock_timeout)
                .await?;
            let mut current: FlowContext<D> = self.repo.get(patch.id()).await?.into_context()?;
            current.retry()?;
            current.adopt(patch);
            self.repo.update(vec![current.to_record()?]).await?;
            lock.release();
            ready.push(current);
        }

        self.announce(&ready).await;
        info!(count = ready.len(), "Contexts retried");
        Ok(ready.len())
    }

    /// PENDING -> READY. Contexts that are no longer PENDING are skipped.
    pub(super) async fn resume(&self, ids: &[Uuid]) -> FlowResult<Vec<FlowContext<D>>> {
        let mut resumed = Vec::with_capacity(ids.len());
        for id in ids {
            let lock = self
                .locks
                .lock(&format!("ctx/{id}"), self.config.lock_timeout)
                .await?;
            let mut current: FlowContext<D> = self.repo.get(*id).await?.into_context()?;
            if current.status() != FlowStatus::Pending {
                debug!(context = %id, status = %current.status(), "Skipping resume");
                lock.release();
                continue;
            }
            current.resume()?;
            self.repo.update(vec![current.to_record()?]).await?;
            lock.release();
            resumed.push(current);
        }

        self.announce(&resumed).await;
        Ok(resumed)
    }
}

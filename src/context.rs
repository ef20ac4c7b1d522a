//! # Flow Contexts - The Persistent Unit of Work
//!
//! A [`FlowContext`] is one data item sitting before one node of one flow. Every node
//! archives the contexts it consumed and emits fresh successor contexts for the next
//! position, so the full history of a trace stays queryable in the repository.
//!
//! ## 🔄 Lifecycle
//!
//! ```text
//! PENDING --resume--> READY --schedule--> SCHEDULED --execute--> EXECUTING
//!                       ^                     |                   |      |
//!                       |                 supersede           complete  fail
//!                       |                     v                   v      v
//!                       +------retry------ ERROR              ARCHIVED  ERROR
//! ```
//!
//! Every transition checks the single legal predecessor status and that the new
//! timestamp is not earlier than the previous one. Violations return
//! [`FlowError::InvalidTransition`] or [`FlowError::TimestampOrder`] and leave the
//! context untouched.
//!
//! ## 📦 Batches
//!
//! A [`Batch`] groups contexts that a barrier (join or reduce) must see together. Forks
//! push a new batch on top of the current one and joins pop it, so nested parallel
//! sections keep their outer grouping.

use crate::error::{FlowError, FlowResult};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Payload types that can travel through a flow.
///
/// Payloads are serialized into the persisted record, so they must round-trip through
/// `serde_json`. Implemented automatically for every qualifying type.
pub trait FlowData: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> FlowData for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Processing status of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStatus {
    /// Parked before a block node until an external resume.
    Pending,
    /// Waiting to be claimed by a worker.
    Ready,
    /// Claimed by a worker, or waiting at a barrier.
    Scheduled,
    /// Inside a node.
    Executing,
    /// Finished. Terminal.
    Archived,
    /// Failed. Terminal unless retried.
    Error,
}

impl FlowStatus {
    /// Statuses that still owe work; such contexts are protected from deletion.
    pub const ACTIVE: [FlowStatus; 4] = [
        FlowStatus::Pending,
        FlowStatus::Ready,
        FlowStatus::Scheduled,
        FlowStatus::Executing,
    ];

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowStatus::Archived | FlowStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowStatus::Pending => "PENDING",
            FlowStatus::Ready => "READY",
            FlowStatus::Scheduled => "SCHEDULED",
            FlowStatus::Executing => "EXECUTING",
            FlowStatus::Archived => "ARCHIVED",
            FlowStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Barrier grouping: an id plus the number of members a barrier should expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub size: usize,
}

impl Batch {
    pub fn new(size: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            size,
        }
    }
}

/// Whether a fault came from user code or from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Raised by a node closure or executor.
    Execution,
    /// Raised by the engine (routing, barrier bookkeeping).
    Engine,
}

/// Diagnostics recorded on a context that entered `ERROR`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextFault {
    pub stream_id: String,
    pub position: String,
    pub node_name: String,
    pub kind: FaultKind,
    pub category: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ContextFault {
    /// Build a fault from the error that stopped a node.
    pub fn from_error(stream_id: &str, position: &str, node_name: &str, error: &FlowError) -> Self {
        let kind = if error.is_engine_error() {
            FaultKind::Engine
        } else {
            FaultKind::Execution
        };
        Self {
            stream_id: stream_id.to_string(),
            position: position.to_string(),
            node_name: node_name.to_string(),
            kind,
            category: error.category().to_string(),
            message: error.message(),
            at: Utc::now(),
        }
    }

    /// The error handed to `close` callbacks for this fault.
    pub fn to_error(&self) -> FlowError {
        FlowError::NodeFailure {
            stream_id: self.stream_id.clone(),
            position: self.position.clone(),
            node: self.node_name.clone(),
            cause: self.message.clone(),
        }
    }
}

impl fmt::Display for ContextFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}: {}",
            self.stream_id, self.position, self.node_name, self.message
        )
    }
}

/// One data item at one position of one flow.
#[derive(Debug, Clone)]
pub struct FlowContext<D> {
    id: Uuid,
    trace_id: Uuid,
    stream_id: String,
    position: String,
    prev_position: Option<String>,
    batch: Option<Batch>,
    batch_stack: Vec<Batch>,
    status: FlowStatus,
    data: D,
    scratch: Map<String, Value>,
    attempt: u32,
    superseded: bool,
    retry_pending: bool,
    created_at: DateTime<Utc>,
    scheduled_at: Option<DateTime<Utc>>,
    executed_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error: Option<ContextFault>,
}

impl<D> FlowContext<D> {
    /// Create a READY context that starts a new trace.
    pub fn new(stream_id: impl Into<String>, position: impl Into<String>, data: D) -> Self {
        Self::with_trace(stream_id, position, Uuid::new_v4(), data)
    }

    /// Create a READY context that joins an existing trace.
    pub fn with_trace(
        stream_id: impl Into<String>,
        position: impl Into<String>,
        trace_id: Uuid,
        data: D,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            trace_id,
            stream_id: stream_id.into(),
            position: position.into(),
            prev_position: None,
            batch: None,
            batch_stack: Vec::new(),
            status: FlowStatus::Ready,
            data,
            scratch: Map::new(),
            attempt: 0,
            superseded: false,
            retry_pending: false,
            created_at: Utc::now(),
            scheduled_at: None,
            executed_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Emit a successor at `position`, keeping trace, stream, batches and scratch values.
    pub fn derive<E>(&self, position: impl Into<String>, data: E) -> FlowContext<E> {
        FlowContext {
            id: Uuid::new_v4(),
            trace_id: self.trace_id,
            stream_id: self.stream_id.clone(),
            position: position.into(),
            prev_position: Some(self.position.clone()),
            batch: self.batch,
            batch_stack: self.batch_stack.clone(),
            status: FlowStatus::Ready,
            data,
            scratch: self.scratch.clone(),
            attempt: 0,
            superseded: false,
            retry_pending: false,
            created_at: Utc::now(),
            scheduled_at: None,
            executed_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Move this (not yet persisted) context to another stream, e.g. for a relay.
    ///
    /// Batches do not cross flows: the context starts a single-member batch there.
    pub fn into_stream(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = stream_id.into();
        self.batch = Some(Batch::new(1));
        self.batch_stack.clear();
        self
    }

    /// Take payload and scratch values from a patched copy of this context.
    pub(crate) fn adopt(&mut self, patched: FlowContext<D>) {
        self.data = patched.data;
        self.scratch = patched.scratch;
    }

    /// Park a fresh context as PENDING. Only valid before it was first scheduled.
    pub fn park(&mut self) -> FlowResult<()> {
        self.transition(FlowStatus::Ready, FlowStatus::Pending)?;
        Ok(())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn position(&self) -> &str {
        &self.position
    }

    pub fn previous_position(&self) -> Option<&str> {
        self.prev_position.as_deref()
    }

    pub fn batch(&self) -> Option<Batch> {
        self.batch
    }

    /// Enclosing batches, outermost first.
    pub fn batch_stack(&self) -> &[Batch] {
        &self.batch_stack
    }

    pub fn status(&self) -> FlowStatus {
        self.status
    }

    pub fn data(&self) -> &D {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut D {
        &mut self.data
    }

    pub fn set_data(&mut self, data: D) {
        self.data = data;
    }

    pub fn into_data(self) -> D {
        self.data
    }

    /// Number of explicit retries this context went through.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// True when the context lost an either-mode join.
    pub fn is_superseded(&self) -> bool {
        self.superseded
    }

    /// True while an error handler's retry decision for this context is outstanding.
    pub fn is_retry_pending(&self) -> bool {
        self.retry_pending
    }

    /// Mark a failed context as waiting on its error handler.
    pub(crate) fn await_retry(&mut self) {
        self.retry_pending = self.status == FlowStatus::Error;
    }

    /// Clear the marker once the handler gave up on this context.
    pub(crate) fn release_retry(&mut self) {
        self.retry_pending = false;
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn scheduled_at(&self) -> Option<DateTime<Utc>> {
        self.scheduled_at
    }

    pub fn executed_at(&self) -> Option<DateTime<Utc>> {
        self.executed_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Most recent lifecycle timestamp.
    pub fn last_touched(&self) -> DateTime<Utc> {
        self.completed_at
            .or(self.executed_at)
            .or(self.scheduled_at)
            .unwrap_or(self.created_at)
    }

    pub fn error(&self) -> Option<&ContextFault> {
        self.error.as_ref()
    }

    /// Store a value in the scratch map shared with downstream contexts.
    pub fn put_value<T: Serialize>(&mut self, key: &str, value: T) -> FlowResult<()> {
        self.scratch
            .insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Read a scratch value written by this or an upstream node.
    pub fn value<T: DeserializeOwned>(&self, key: &str) -> FlowResult<Option<T>> {
        match self.scratch.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    pub fn remove_value(&mut self, key: &str) -> Option<Value> {
        self.scratch.remove(key)
    }

    /// Replace the current batch.
    pub fn to_batch(&mut self, batch: Batch) {
        self.batch = Some(batch);
    }

    /// Enter a nested batch, remembering the current one.
    pub fn push_batch(&mut self, batch: Batch) {
        if let Some(current) = self.batch.take() {
            self.batch_stack.push(current);
        }
        self.batch = Some(batch);
    }

    /// Leave the current batch and restore the enclosing one.
    pub fn pop_batch(&mut self) -> FlowResult<Batch> {
        let current = self.batch.take().ok_or_else(|| {
            FlowError::batch(format!("context {} has no batch to leave", self.id))
        })?;
        self.batch = self.batch_stack.pop();
        Ok(current)
    }

    /// PENDING -> READY.
    pub fn resume(&mut self) -> FlowResult<()> {
        self.transition(FlowStatus::Pending, FlowStatus::Ready)?;
        Ok(())
    }

    /// READY -> SCHEDULED, setting the scheduled time.
    pub fn schedule(&mut self, at: DateTime<Utc>) -> FlowResult<()> {
        self.check_once("scheduled", self.scheduled_at)?;
        self.check_after("scheduled", self.created_at, at)?;
        self.transition(FlowStatus::Ready, FlowStatus::Scheduled)?;
        self.scheduled_at = Some(at);
        Ok(())
    }

    /// SCHEDULED -> EXECUTING, setting the execute time.
    pub fn execute(&mut self, at: DateTime<Utc>) -> FlowResult<()> {
        self.check_once("executed", self.executed_at)?;
        self.check_after("executed", self.last_touched(), at)?;
        self.transition(FlowStatus::Scheduled, FlowStatus::Executing)?;
        self.executed_at = Some(at);
        Ok(())
    }

    /// EXECUTING -> ARCHIVED, setting the complete time.
    pub fn complete(&mut self, at: DateTime<Utc>) -> FlowResult<()> {
        self.check_once("completed", self.completed_at)?;
        self.check_after("completed", self.last_touched(), at)?;
        self.transition(FlowStatus::Executing, FlowStatus::Archived)?;
        self.completed_at = Some(at);
        Ok(())
    }

    /// EXECUTING -> ERROR, recording the fault.
    pub fn fail(&mut self, fault: ContextFault) -> FlowResult<()> {
        self.transition(FlowStatus::Executing, FlowStatus::Error)?;
        self.error = Some(fault);
        Ok(())
    }

    /// SCHEDULED -> ARCHIVED for a context made redundant by an either-mode join.
    pub fn supersede(&mut self, at: DateTime<Utc>) -> FlowResult<()> {
        self.check_once("completed", self.completed_at)?;
        self.check_after("completed", self.last_touched(), at)?;
        self.transition(FlowStatus::Scheduled, FlowStatus::Archived)?;
        self.completed_at = Some(at);
        self.superseded = true;
        Ok(())
    }

    /// ERROR -> READY. Clears the fault and lifecycle timestamps so the context can run again.
    pub fn retry(&mut self) -> FlowResult<()> {
        self.transition(FlowStatus::Error, FlowStatus::Ready)?;
        self.attempt += 1;
        self.retry_pending = false;
        self.scheduled_at = None;
        self.executed_at = None;
        self.completed_at = None;
        self.error = None;
        Ok(())
    }

    fn transition(&mut self, from: FlowStatus, to: FlowStatus) -> FlowResult<()> {
        if self.status != from {
            return Err(FlowError::InvalidTransition {
                id: self.id.to_string(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    fn check_once(&self, label: &str, slot: Option<DateTime<Utc>>) -> FlowResult<()> {
        match slot {
            Some(existing) => Err(FlowError::timestamp_order(format!(
                "context {} already {label} at {existing}",
                self.id
            ))),
            None => Ok(()),
        }
    }

    fn check_after(
        &self,
        label: &str,
        previous: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> FlowResult<()> {
        if at < previous {
            return Err(FlowError::timestamp_order(format!(
                "context {} {label} at {at}, before {previous}",
                self.id
            )));
        }
        Ok(())
    }
}

impl<D: Serialize> FlowContext<D> {
    /// Flatten into the persisted layout.
    pub fn to_record(&self) -> FlowResult<ContextRecord> {
        Ok(ContextRecord {
            id: self.id,
            trace_id: self.trace_id,
            stream_id: self.stream_id.clone(),
            position: self.position.clone(),
            prev_position: self.prev_position.clone(),
            batch_id: self.batch.map(|b| b.id),
            batch_size: self.batch.map(|b| b.size),
            batch_stack: self.batch_stack.clone(),
            status: self.status,
            data_json: serde_json::to_string(&self.data)?,
            scratch_json: serde_json::to_string(&self.scratch)?,
            attempt: self.attempt,
            superseded: self.superseded,
            retry_pending: self.retry_pending,
            created_at: self.created_at,
            scheduled_at: self.scheduled_at,
            executed_at: self.executed_at,
            completed_at: self.completed_at,
            error_message: self.error.as_ref().map(|f| f.to_string()),
            fault: self.error.clone(),
        })
    }
}

/// Persisted row for a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRecord {
    pub id: Uuid,
    pub trace_id: Uuid,
    pub stream_id: String,
    pub position: String,
    pub prev_position: Option<String>,
    pub batch_id: Option<Uuid>,
    pub batch_size: Option<usize>,
    pub batch_stack: Vec<Batch>,
    pub status: FlowStatus,
    pub data_json: String,
    pub scratch_json: String,
    pub attempt: u32,
    pub superseded: bool,
    /// Failed and waiting on an error handler's retry; the trace is not settled yet.
    #[serde(default)]
    pub retry_pending: bool,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub fault: Option<ContextFault>,
}

impl ContextRecord {
    pub fn batch(&self) -> Option<Batch> {
        match (self.batch_id, self.batch_size) {
            (Some(id), Some(size)) => Some(Batch { id, size }),
            _ => None,
        }
    }

    /// Fail a READY row whose payload no longer decodes, without going through the typed
    /// context. The row still passes SCHEDULED and EXECUTING on its way to ERROR.
    pub fn reject(&mut self, fault: ContextFault, at: DateTime<Utc>) -> FlowResult<()> {
        if self.status != FlowStatus::Ready {
            return Err(FlowError::InvalidTransition {
                id: self.id.to_string(),
                from: self.status,
                to: FlowStatus::Error,
            });
        }
        let at = at.max(self.created_at);
        self.status = FlowStatus::Error;
        self.scheduled_at = Some(at);
        self.executed_at = Some(at);
        self.error_message = Some(fault.to_string());
        self.fault = Some(fault);
        Ok(())
    }

    /// Rebuild the typed context.
    pub fn into_context<D: DeserializeOwned>(self) -> FlowResult<FlowContext<D>> {
        let batch = self.batch();
        Ok(FlowContext {
            id: self.id,
            trace_id: self.trace_id,
            stream_id: self.stream_id,
            position: self.position,
            prev_position: self.prev_position,
            batch,
            batch_stack: self.batch_stack,
            status: self.status,
            data: serde_json::from_str(&self.data_json)?,
            scratch: serde_json::from_str(&self.scratch_json)?,
            attempt: self.attempt,
            superseded: self.superseded,
            retry_pending: self.retry_pending,
            created_at: self.created_at,
            scheduled_at: self.scheduled_at,
            executed_at: self.executed_at,
            completed_at: self.completed_at,
            error: self.fault,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn executing() -> FlowContext<i32> {
        let mut ctx = FlowContext::new("orders", "n0", 1);
        let now = Utc::now();
        ctx.schedule(now).unwrap();
        ctx.execute(now).unwrap();
        ctx
    }

    #[test]
    fn test_happy_path_lifecycle() {
        let mut ctx = FlowContext::new("orders", "n0", 7);
        assert_eq!(ctx.status(), FlowStatus::Ready);

        let t0 = Utc::now();
        ctx.schedule(t0).unwrap();
        ctx.execute(t0 + Duration::milliseconds(5)).unwrap();
        ctx.complete(t0 + Duration::milliseconds(10)).unwrap();

        assert_eq!(ctx.status(), FlowStatus::Archived);
        assert!(ctx.status().is_terminal());
        assert_eq!(ctx.scheduled_at(), Some(t0));
        assert!(ctx.completed_at().unwrap() >= ctx.executed_at().unwrap());
    }

    #[test]
    fn test_execute_requires_scheduled() {
        let mut ctx = FlowContext::new("orders", "n0", 1);
        let err = ctx.execute(Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            FlowError::InvalidTransition {
                from: FlowStatus::Ready,
                to: FlowStatus::Executing,
                ..
            }
        ));
        assert_eq!(ctx.status(), FlowStatus::Ready);
        assert!(ctx.executed_at().is_none());
    }

    #[test]
    fn test_out_of_order_timestamp_rejected() {
        let mut ctx = FlowContext::new("orders", "n0", 1);
        let t0 = Utc::now();
        ctx.schedule(t0).unwrap();
        let err = ctx.execute(t0 - Duration::seconds(1)).unwrap_err();
        assert_eq!(err.category(), "timestamp_order");
        assert_eq!(ctx.status(), FlowStatus::Scheduled);
    }

    #[test]
    fn test_schedule_before_creation_rejected() {
        let mut ctx = FlowContext::new("orders", "n0", 1);
        let err = ctx
            .schedule(ctx.created_at() - Duration::seconds(5))
            .unwrap_err();
        assert!(err.is_invariant_violation());
    }

    #[test]
    fn test_fail_and_retry() {
        let mut ctx = executing();
        let fault = ContextFault::from_error("orders", "n0", "charge", &FlowError::node_execution("declined"));
        ctx.fail(fault).unwrap();
        assert_eq!(ctx.status(), FlowStatus::Error);
        assert_eq!(
            ctx.error().unwrap().to_string(),
            "orders/n0/charge: declined"
        );

        ctx.retry().unwrap();
        assert_eq!(ctx.status(), FlowStatus::Ready);
        assert_eq!(ctx.attempt(), 1);
        assert!(ctx.error().is_none());
        assert!(ctx.scheduled_at().is_none());

        // A READY context cannot be retried again.
        assert!(ctx.retry().unwrap_err().is_invariant_violation());
    }

    #[test]
    fn test_retry_marker_follows_the_record() {
        let mut ctx = executing();
        ctx.await_retry();
        assert!(!ctx.is_retry_pending(), "only failed contexts wait on a retry");

        ctx.fail(ContextFault::from_error("orders", "n0", "charge", &FlowError::node_execution("declined")))
            .unwrap();
        ctx.await_retry();
        let stored: FlowContext<i32> = ctx.to_record().unwrap().into_context().unwrap();
        assert!(stored.is_retry_pending());

        let mut released = stored.clone();
        released.release_retry();
        assert!(!released.is_retry_pending());

        let mut retried = stored;
        retried.retry().unwrap();
        assert!(!retried.is_retry_pending());
    }

    #[test]
    fn test_reject_undecodable_record() {
        let mut record = FlowContext::new("orders", "n0", 1).to_record().unwrap();
        record.data_json = "not json".to_string();
        assert!(record.clone().into_context::<i32>().is_err());

        let fault = ContextFault::from_error("orders", "n0", "charge", &FlowError::aborted("bad payload"));
        record.reject(fault.clone(), Utc::now()).unwrap();
        assert_eq!(record.status, FlowStatus::Error);
        assert!(record.scheduled_at.is_some() && record.executed_at.is_some());
        assert_eq!(record.fault, Some(fault.clone()));
        assert!(record.reject(fault, Utc::now()).is_err());
    }

    #[test]
    fn test_pending_resume() {
        let mut ctx = FlowContext::new("orders", "n3", 1);
        ctx.park().unwrap();
        assert_eq!(ctx.status(), FlowStatus::Pending);
        assert!(ctx.schedule(Utc::now()).is_err());
        ctx.resume().unwrap();
        assert_eq!(ctx.status(), FlowStatus::Ready);
        assert!(ctx.resume().is_err());
    }

    #[test]
    fn test_supersede() {
        let mut ctx = FlowContext::new("orders", "n4", 1);
        ctx.schedule(Utc::now()).unwrap();
        ctx.supersede(Utc::now()).unwrap();
        assert!(ctx.is_superseded());
        assert_eq!(ctx.status(), FlowStatus::Archived);
    }

    #[test]
    fn test_derive_keeps_trace_and_batches() {
        let mut parent = FlowContext::new("orders", "n0", 1);
        let outer = Batch::new(3);
        parent.to_batch(outer);
        parent.put_value("customer", "acme").unwrap();

        let mut child = parent.derive("n1", "one".to_string());
        assert_ne!(child.id(), parent.id());
        assert_eq!(child.trace_id(), parent.trace_id());
        assert_eq!(child.previous_position(), Some("n0"));
        assert_eq!(child.batch(), Some(outer));
        assert_eq!(
            child.value::<String>("customer").unwrap().as_deref(),
            Some("acme")
        );

        let fork = Batch::new(2);
        child.push_batch(fork);
        assert_eq!(child.batch(), Some(fork));
        assert_eq!(child.batch_stack(), &[outer]);
        assert_eq!(child.pop_batch().unwrap(), fork);
        assert_eq!(child.batch(), Some(outer));
        child.pop_batch().unwrap();
        assert!(child.pop_batch().is_err());
    }

    #[test]
    fn test_record_roundtrip_preserves_fault() {
        let mut ctx = executing();
        ctx.put_value("note", 3).unwrap();
        ctx.fail(ContextFault::from_error(
            "orders",
            "n0",
            "charge",
            &FlowError::node_execution("declined"),
        ))
        .unwrap();

        let record = ctx.to_record().unwrap();
        assert_eq!(record.status, FlowStatus::Error);
        assert_eq!(record.data_json, "1");
        assert_eq!(
            record.error_message.as_deref(),
            Some("orders/n0/charge: declined")
        );

        let restored: FlowContext<i32> = record.into_context().unwrap();
        assert_eq!(restored.id(), ctx.id());
        assert_eq!(restored.value::<i32>("note").unwrap(), Some(3));
        assert_eq!(restored.error().unwrap().kind, FaultKind::Execution);
    }

    #[test]
    fn test_status_serde_names() {
        assert_eq!(
            serde_json::to_string(&FlowStatus::Executing).unwrap(),
            "\"EXECUTING\""
        );
        assert!(FlowStatus::Pending.is_active());
        assert!(!FlowStatus::Error.is_active());
    }
}

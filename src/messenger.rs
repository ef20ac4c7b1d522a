//! # Messenger - Wake-ups Between Workers
//!
//! After a worker writes contexts back it publishes a [`FlowEvent`] describing where
//! they landed. Subscribers (the runtime registers one per node) react by waking the
//! node's drain task instead of waiting for the next poll. Events are hints: losing one
//! delays work by at most a poll interval, it never loses contexts.

use crate::context::FlowStatus;
use crate::error::{FlowError, FlowResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// What happened to the contexts an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// New or resumed contexts are waiting to be claimed.
    Ready,
    /// Contexts were parked before a block node.
    Pending,
    /// Contexts reached an end node.
    Archived,
    /// Contexts entered `ERROR`.
    Failed,
}

impl EventKind {
    pub fn for_status(status: FlowStatus) -> Option<Self> {
        match status {
            FlowStatus::Ready => Some(EventKind::Ready),
            FlowStatus::Pending => Some(EventKind::Pending),
            FlowStatus::Archived => Some(EventKind::Archived),
            FlowStatus::Error => Some(EventKind::Failed),
            FlowStatus::Scheduled | FlowStatus::Executing => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEvent {
    pub stream_id: String,
    pub position: String,
    pub kind: EventKind,
    pub trace_ids: Vec<Uuid>,
    pub count: usize,
    pub at: DateTime<Utc>,
}

impl FlowEvent {
    pub fn new(
        stream_id: impl Into<String>,
        position: impl Into<String>,
        kind: EventKind,
        trace_ids: Vec<Uuid>,
        count: usize,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            position: position.into(),
            kind,
            trace_ids,
            count,
            at: Utc::now(),
        }
    }
}

pub type EventFilter = Arc<dyn Fn(&FlowEvent) -> bool + Send + Sync>;
pub type EventHandler = Arc<dyn Fn(&FlowEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Notification port.
#[async_trait]
pub trait FlowContextMessenger: Send + Sync {
    async fn publish(&self, event: FlowEvent) -> FlowResult<()>;

    /// Call `handler` for every published event accepted by `filter`.
    fn subscribe(&self, filter: EventFilter, handler: EventHandler) -> FlowResult<SubscriptionId>;

    /// Returns false when the subscription was already gone.
    fn unsubscribe(&self, id: SubscriptionId) -> FlowResult<bool>;
}

struct Subscriber {
    id: SubscriptionId,
    filter: EventFilter,
    handler: EventHandler,
}

/// In-process messenger; handlers run synchronously on the publishing task.
#[derive(Default, Clone)]
pub struct LocalMessenger {
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
    next_id: Arc<AtomicU64>,
}

impl LocalMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl FlowContextMessenger for LocalMessenger {
    async fn publish(&self, event: FlowEvent) -> FlowResult<()> {
        let handlers: Vec<EventHandler> = {
            let subscribers = self
                .subscribers
                .read()
                .map_err(|_| FlowError::messenger("Failed to acquire subscriber list"))?;
            subscribers
                .iter()
                .filter(|s| (s.filter)(&event))
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };
        for handler in handlers {
            handler(&event);
        }
        Ok(())
    }

    fn subscribe(&self, filter: EventFilter, handler: EventHandler) -> FlowResult<SubscriptionId> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.subscribers
            .write()
            .map_err(|_| FlowError::messenger("Failed to acquire subscriber list"))?
            .push(Subscriber {
                id,
                filter,
                handler,
            });
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> FlowResult<bool> {
        let mut subscribers = self
            .subscribers
            .write()
            .map_err(|_| FlowError::messenger("Failed to acquire subscriber list"))?;
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        Ok(subscribers.len() != before)
    }
}

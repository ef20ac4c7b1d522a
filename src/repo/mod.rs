//! # Context Repository - Durable Context State
//!
//! The repository exclusively owns persisted context state. Workers hold a transient,
//! lock-scoped view of the contexts they claimed and write every change back here
//! before releasing any lock.
//!
//! Implementations store [`ContextRecord`]s, the flat row layout
//! `(id, trace_id, stream_id, position, batch_id, status, data_json, scheduled_at,
//! executed_at, completed_at, error_message, ...)`, so a SQL or key-value backend can
//! implement the trait without knowing payload types.
//!
//! ## 📋 Method Reference
//!
//! | Method | Purpose |
//! |--------|---------|
//! | `save` | Insert new contexts; ids must be unused |
//! | `update` | Replace existing contexts |
//! | `update_flow_data` | Patch payload and scratch values only |
//! | `get` / `get_many` | Fetch by id |
//! | `get_by_trace` | Everything descending from one offer |
//! | `get_by_position` | Work queue of one node, filtered by status |
//! | `get_by_batch` | Barrier membership at one node |
//! | `delete` / `delete_trace` | Cleanup; active contexts need `force` |
//!
//! Results come back in insertion order.

pub mod error;
pub mod memory;

pub use error::RepoError;
pub use memory::MemoryContextRepo;

use crate::context::{ContextRecord, FlowStatus};
use async_trait::async_trait;
use uuid::Uuid;

/// Type alias for repository operation results
pub type RepoResult<T> = Result<T, RepoError>;

/// Storage port for context records.
#[async_trait]
pub trait FlowContextRepo: Send + Sync {
    /// Insert new records. Fails without writing anything if an id already exists.
    async fn save(&self, records: Vec<ContextRecord>) -> RepoResult<()>;

    /// Replace existing records. Fails without writing anything if an id is unknown.
    async fn update(&self, records: Vec<ContextRecord>) -> RepoResult<()>;

    /// Overwrite the payload and scratch values of one record.
    async fn update_flow_data(
        &self,
        id: Uuid,
        data_json: String,
        scratch_json: String,
    ) -> RepoResult<()>;

    async fn get(&self, id: Uuid) -> RepoResult<ContextRecord>;

    /// Fetch the records that exist among `ids`.
    async fn get_many(&self, ids: &[Uuid]) -> RepoResult<Vec<ContextRecord>>;

    async fn get_by_trace(&self, trace_id: Uuid) -> RepoResult<Vec<ContextRecord>>;

    /// Records at one node whose status is in `statuses` (any status when empty).
    async fn get_by_position(
        &self,
        stream_id: &str,
        position: &str,
        statuses: &[FlowStatus],
        limit: Option<usize>,
    ) -> RepoResult<Vec<ContextRecord>>;

    /// Records at one node that belong to `batch_id`, in any status.
    async fn get_by_batch(
        &self,
        stream_id: &str,
        position: &str,
        batch_id: Uuid,
    ) -> RepoResult<Vec<ContextRecord>>;

    /// Delete records. Unless `force`, fails if any of them is still active.
    async fn delete(&self, ids: &[Uuid], force: bool) -> RepoResult<usize>;

    async fn delete_trace(&self, trace_id: Uuid, force: bool) -> RepoResult<usize> {
        let ids: Vec<Uuid> = self
            .get_by_trace(trace_id)
            .await?
            .into_iter()
            .map(|r| r.id)
            .collect();
        self.delete(&ids, force).await
    }

    async fn len(&self) -> RepoResult<usize>;

    async fn is_empty(&self) -> RepoResult<bool> {
        Ok(self.len().await? == 0)
    }
}

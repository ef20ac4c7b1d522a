use super::{FlowContextRepo, RepoResult, error::RepoError};
use crate::context::{ContextRecord, FlowStatus};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

struct Row {
    seq: u64,
    record: ContextRecord,
}

type Index = BTreeMap<u64, Uuid>;

const ALL_STATUSES: [FlowStatus; 6] = [
    FlowStatus::Pending,
    FlowStatus::Ready,
    FlowStatus::Scheduled,
    FlowStatus::Executing,
    FlowStatus::Archived,
    FlowStatus::Error,
];

fn link<K: Eq + Hash>(indexes: &mut HashMap<K, Index>, key: K, seq: u64, id: Uuid) {
    indexes.entry(key).or_default().insert(seq, id);
}

fn unlink<K: Eq + Hash>(indexes: &mut HashMap<K, Index>, key: &K, seq: u64) {
    if let Some(index) = indexes.get_mut(key) {
        index.remove(&seq);
        if index.is_empty() {
            indexes.remove(key);
        }
    }
}

fn status_key(record: &ContextRecord) -> (String, String, FlowStatus) {
    (
        record.stream_id.clone(),
        record.position.clone(),
        record.status,
    )
}

#[derive(Default)]
struct Table {
    rows: HashMap<Uuid, Row>,
    /// Per node and status, so a claim only walks the live queue and never the archive.
    by_status: HashMap<(String, String, FlowStatus), Index>,
    by_batch: HashMap<Uuid, Index>,
    by_trace: HashMap<Uuid, Index>,
    next_seq: u64,
}

impl Table {
    fn collect<'a>(&self, ids: impl Iterator<Item = &'a Uuid>) -> Vec<ContextRecord> {
        ids.filter_map(|id| self.rows.get(id))
            .map(|row| row.record.clone())
            .collect()
    }

    fn index(&mut self, seq: u64, record: &ContextRecord) {
        link(&mut self.by_status, status_key(record), seq, record.id);
        link(&mut self.by_trace, record.trace_id, seq, record.id);
        if let Some(batch_id) = record.batch_id {
            link(&mut self.by_batch, batch_id, seq, record.id);
        }
    }

    fn unindex(&mut self, seq: u64, record: &ContextRecord) {
        unlink(&mut self.by_status, &status_key(record), seq);
        unlink(&mut self.by_trace, &record.trace_id, seq);
        if let Some(batch_id) = record.batch_id {
            unlink(&mut self.by_batch, &batch_id, seq);
        }
    }

    fn remove(&mut self, id: &Uuid) -> bool {
        let Some(row) = self.rows.remove(id) else {
            return false;
        };
        self.unindex(row.seq, &row.record);
        true
    }
}

/// Thread-safe in-memory context repository
///
/// Records live in a `HashMap` behind `Arc<RwLock<_>>`, with secondary indexes by
/// node and status, by batch and by trace that keep insertion order. Clones share the same table, so
/// several runtimes can be pointed at one repository to simulate separate processes.
#[derive(Default, Clone)]
pub struct MemoryContextRepo {
    table: Arc<RwLock<Table>>,
}

impl MemoryContextRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlowContextRepo for MemoryContextRepo {
    async fn save(&self, records: Vec<ContextRecord>) -> RepoResult<()> {
        let mut table = self
            .table
            .write()
            .map_err(|_| RepoError::lock_error("Failed to acquire write lock on repository"))?;

        for record in &records {
            if table.rows.contains_key(&record.id) {
                return Err(RepoError::duplicate(record.id.to_string()));
            }
        }
        for record in records {
            let seq = table.next_seq;
            table.next_seq += 1;
            table.index(seq, &record);
            table.rows.insert(record.id, Row { seq, record });
        }
        Ok(())
    }

    async fn update(&self, records: Vec<ContextRecord>) -> RepoResult<()> {
        let mut table = self
            .table
            .write()
            .map_err(|_| RepoError::lock_error("Failed to acquire write lock on repository"))?;

        for record in &records {
            match table.rows.get(&record.id) {
                Some(row)
                    if row.record.stream_id == record.stream_id
                        && row.record.position == record.position
                        && row.record.trace_id == record.trace_id => {}
                Some(_) => {
                    return Err(RepoError::generic(format!(
                        "context '{}' cannot change stream, position or trace",
                        record.id
                    )));
                }
                None => return Err(RepoError::not_found(record.id.to_string())),
            }
        }
        for record in records {
            let Some((seq, previous)) = table
                .rows
                .get(&record.id)
                .map(|row| (row.seq, row.record.clone()))
            else {
                continue;
            };
            table.unindex(seq, &previous);
            table.index(seq, &record);
            if let Some(row) = table.rows.get_mut(&record.id) {
                row.record = record;
            }
        }
        Ok(())
    }

    async fn update_flow_data(
        &self,
        id: Uuid,
        data_json: String,
        scratch_json: String,
    ) -> RepoResult<()> {
        let mut table = self
            .table
            .write()
            .map_err(|_| RepoError::lock_error("Failed to acquire write lock on repository"))?;

        let row = table
            .rows
            .get_mut(&id)
            .ok_or_else(|| RepoError::not_found(id.to_string()))?;
        row.record.data_json = data_json;
        row.record.scratch_json = scratch_json;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> RepoResult<ContextRecord> {
        let table = self
            .table
            .read()
            .map_err(|_| RepoError::lock_error("Failed to acquire read lock on repository"))?;

        table
            .rows
            .get(&id)
            .map(|row| row.record.clone())
            .ok_or_else(|| RepoError::not_found(id.to_string()))
    }

    async fn get_many(&self, ids: &[Uuid]) -> RepoResult<Vec<ContextRecord>> {
        let table = self
            .table
            .read()
            .map_err(|_| RepoError::lock_error("Failed to acquire read lock on repository"))?;

        let mut rows: Vec<&Row> = ids.iter().filter_map(|id| table.rows.get(id)).collect();
        rows.sort_by_key(|row| row.seq);
        rows.dedup_by_key(|row| row.seq);
        Ok(rows.into_iter().map(|row| row.record.clone()).collect())
    }

    async fn get_by_trace(&self, trace_id: Uuid) -> RepoResult<Vec<ContextRecord>> {
        let table = self
            .table
            .read()
            .map_err(|_| RepoError::lock_error("Failed to acquire read lock on repository"))?;

        Ok(match table.by_trace.get(&trace_id) {
            Some(index) => table.collect(index.values()),
            None => Vec::new(),
        })
    }

    async fn get_by_position(
        &self,
        stream_id: &str,
        position: &str,
        statuses: &[FlowStatus],
        limit: Option<usize>,
    ) -> RepoResult<Vec<ContextRecord>> {
        let table = self
            .table
            .read()
            .map_err(|_| RepoError::lock_error("Failed to acquire read lock on repository"))?;

        let statuses = if statuses.is_empty() {
            &ALL_STATUSES[..]
        } else {
            statuses
        };
        let mut hits: Vec<(u64, Uuid)> = statuses
            .iter()
            .filter_map(|status| {
                table
                    .by_status
                    .get(&(stream_id.to_string(), position.to_string(), *status))
            })
            .flat_map(|index| index.iter().map(|(seq, id)| (*seq, *id)))
            .collect();
        hits.sort_unstable_by_key(|(seq, _)| *seq);
        hits.dedup_by_key(|(seq, _)| *seq);
        hits.truncate(limit.unwrap_or(usize::MAX));
        Ok(table.collect(hits.iter().map(|(_, id)| id)))
    }

    async fn get_by_batch(
        &self,
        stream_id: &str,
        position: &str,
        batch_id: Uuid,
    ) -> RepoResult<Vec<ContextRecord>> {
        let table = self
            .table
            .read()
            .map_err(|_| RepoError::lock_error("Failed to acquire read lock on repository"))?;

        let Some(index) = table.by_batch.get(&batch_id) else {
            return Ok(Vec::new());
        };
        Ok(index
            .values()
            .filter_map(|id| table.rows.get(id))
            .filter(|row| row.record.stream_id == stream_id && row.record.position == position)
            .map(|row| row.record.clone())
            .collect())
    }

    async fn delete(&self, ids: &[Uuid], force: bool) -> RepoResult<usize> {
        let mut table = self
            .table
            .write()
            .map_err(|_| RepoError::lock_error("Failed to acquire write lock on repository"))?;

        if !force {
            let active: Vec<String> = ids
                .iter()
                .filter_map(|id| table.rows.get(id))
                .filter(|row| row.record.status.is_active())
                .map(|row| format!("{} ({})", row.record.id, row.record.status))
                .collect();
            if !active.is_empty() {
                return Err(RepoError::active_context(active.join(", ")));
            }
        }
        Ok(ids.iter().filter(|id| table.remove(id)).count())
    }

    async fn len(&self) -> RepoResult<usize> {
        let table = self
            .table
            .read()
            .map_err(|_| RepoError::lock_error("Failed to acquire read lock on repository"))?;

        Ok(table.rows.len())
    }
}

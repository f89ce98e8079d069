//! In-memory backend with the same contract as the SQLite one.
//!
//! Snapshots stage their operations and apply them under the store lock on
//! commit, so readers never observe a half-applied ingestion.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::StorageError;
use crate::record::{CallFilter, CallId, CallRecord, Candidate, Claim, StoredCall};
use crate::schema::validate_table_name;
use crate::traits::ReplayStorage;

/// Uniqueness key of a stored call.
type UniqueKey = (String, String, String, String);

fn unique_key(record: &CallRecord) -> UniqueKey {
    (
        record.instance_uuid.clone(),
        record.activity_uuid.clone(),
        record.endpoint_name.clone(),
        record.input_params_json(),
    )
}

struct MemRow {
    row: i64,
    record: CallRecord,
    signature: String,
    consumed_by: Option<String>,
    consumed_at: Option<OffsetDateTime>,
}

#[derive(Default)]
struct MemTable {
    generation: u64,
    next_row: i64,
    rows: Vec<MemRow>,
    keys: HashSet<UniqueKey>,
}

impl MemTable {
    fn contains(&self, key: &UniqueKey) -> bool {
        self.keys.contains(key)
    }

    fn push(&mut self, record: CallRecord) -> bool {
        if !self.keys.insert(unique_key(&record)) {
            return false;
        }
        self.next_row += 1;
        self.rows.push(MemRow {
            row: self.next_row,
            signature: record.signature(),
            record,
            consumed_by: None,
            consumed_at: None,
        });
        true
    }

    fn owner_of(&self, instance_uuid: &str) -> Option<&str> {
        self.rows
            .iter()
            .filter(|r| r.record.instance_uuid == instance_uuid)
            .find_map(|r| r.consumed_by.as_deref())
    }

    fn stored(&self, row: &MemRow) -> StoredCall {
        StoredCall {
            id: CallId {
                generation: self.generation,
                row: row.row,
            },
            record: row.record.clone(),
            consumed_by: row.consumed_by.clone(),
            consumed_at: row.consumed_at,
        }
    }
}

#[derive(Default)]
struct Inner {
    settings: HashMap<String, String>,
    tables: BTreeMap<String, MemTable>,
}

/// In-memory Event Store.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<Inner>>,
}

enum StagedOp {
    Ensure(String),
    Clear(String),
    Insert(String, Vec<CallRecord>),
}

/// What a snapshot has staged for one table so far.
#[derive(Default)]
struct StagedView {
    exists: bool,
    cleared: bool,
    keys: HashSet<UniqueKey>,
}

/// Staged writes of an in-memory snapshot.
#[derive(Default)]
pub struct MemorySnapshot {
    ops: Vec<StagedOp>,
    views: HashMap<String, StagedView>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StorageError> {
        self.inner
            .lock()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".to_string()))
    }
}

fn table_ref<'a>(inner: &'a Inner, table: &str) -> Result<&'a MemTable, StorageError> {
    inner
        .tables
        .get(table)
        .ok_or_else(|| StorageError::TableNotFound(table.to_string()))
}

#[async_trait]
impl ReplayStorage for MemoryStorage {
    type Snapshot = MemorySnapshot;

    async fn begin_snapshot(&self) -> Result<MemorySnapshot, StorageError> {
        Ok(MemorySnapshot::default())
    }

    async fn commit_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        for op in snapshot.ops {
            match op {
                StagedOp::Ensure(table) => {
                    inner.tables.entry(table).or_default();
                }
                StagedOp::Clear(table) => {
                    let t = inner.tables.entry(table).or_default();
                    t.rows.clear();
                    t.keys.clear();
                    t.generation += 1;
                }
                StagedOp::Insert(table, records) => {
                    let t = inner.tables.entry(table).or_default();
                    for record in records {
                        t.push(record);
                    }
                }
            }
        }
        Ok(())
    }

    async fn abort_snapshot(&self, _snapshot: MemorySnapshot) -> Result<(), StorageError> {
        Ok(())
    }

    async fn ensure_table(
        &self,
        snapshot: &mut MemorySnapshot,
        table: &str,
    ) -> Result<(), StorageError> {
        validate_table_name(table)?;
        let committed = self.lock()?.tables.contains_key(table);
        let view = snapshot.views.entry(table.to_string()).or_default();
        if !committed && !view.exists {
            snapshot.ops.push(StagedOp::Ensure(table.to_string()));
        }
        view.exists = true;
        Ok(())
    }

    async fn clear_table(
        &self,
        snapshot: &mut MemorySnapshot,
        table: &str,
    ) -> Result<u64, StorageError> {
        let committed_rows = self.lock()?.tables.get(table).map(|t| t.rows.len());
        let view = snapshot.views.entry(table.to_string()).or_default();
        if committed_rows.is_none() && !view.exists {
            return Err(StorageError::TableNotFound(table.to_string()));
        }
        let mut removed = view.keys.len() as u64;
        if !view.cleared {
            removed += committed_rows.unwrap_or(0) as u64;
        }
        view.cleared = true;
        view.keys.clear();
        snapshot.ops.push(StagedOp::Clear(table.to_string()));
        Ok(removed)
    }

    async fn insert_call_records(
        &self,
        snapshot: &mut MemorySnapshot,
        table: &str,
        records: &[CallRecord],
    ) -> Result<usize, StorageError> {
        let inner = self.lock()?;
        let committed = inner.tables.get(table);
        let view = snapshot.views.entry(table.to_string()).or_default();
        if committed.is_none() && !view.exists {
            return Err(StorageError::TableNotFound(table.to_string()));
        }
        let mut accepted = Vec::new();
        for record in records {
            let key = unique_key(record);
            let in_committed = !view.cleared && committed.is_some_and(|t| t.contains(&key));
            if in_committed || !view.keys.insert(key) {
                continue;
            }
            accepted.push(record.clone());
        }
        let inserted = accepted.len();
        if inserted > 0 {
            snapshot
                .ops
                .push(StagedOp::Insert(table.to_string(), accepted));
        }
        Ok(inserted)
    }

    async fn table_exists(&self, table: &str) -> Result<bool, StorageError> {
        Ok(self.lock()?.tables.contains_key(table))
    }

    async fn list_tables(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.lock()?.tables.keys().cloned().collect())
    }

    async fn table_generation(&self, table: &str) -> Result<u64, StorageError> {
        let inner = self.lock()?;
        Ok(table_ref(&inner, table)?.generation)
    }

    async fn find_candidates(
        &self,
        table: &str,
        signature: &str,
    ) -> Result<Vec<Candidate>, StorageError> {
        let inner = self.lock()?;
        let t = table_ref(&inner, table)?;
        let mut candidates: Vec<Candidate> = t
            .rows
            .iter()
            .filter(|r| r.signature == signature && r.consumed_by.is_none())
            .map(|r| Candidate {
                id: CallId {
                    generation: t.generation,
                    row: r.row,
                },
                instance_uuid: r.record.instance_uuid.clone(),
                call_timestamp: r.record.call_timestamp,
                event_type: r.record.event_type,
                bound_to: t.owner_of(&r.record.instance_uuid).map(str::to_string),
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.call_timestamp
                .cmp(&b.call_timestamp)
                .then(a.id.row.cmp(&b.id.row))
        });
        Ok(candidates)
    }

    async fn claim_call(&self, table: &str, claim: &Claim) -> Result<StoredCall, StorageError> {
        let mut inner = self.lock()?;
        let t = inner
            .tables
            .get_mut(table)
            .ok_or_else(|| StorageError::TableNotFound(table.to_string()))?;
        if t.generation != claim.id.generation {
            return Err(StorageError::StaleGeneration {
                table: table.to_string(),
                expected: claim.id.generation,
                found: t.generation,
            });
        }
        let idx = t
            .rows
            .iter()
            .position(|r| r.row == claim.id.row)
            .ok_or_else(|| StorageError::CallNotFound {
                table: table.to_string(),
                row: claim.id.row,
            })?;
        if t.rows[idx].consumed_by.is_some() {
            return Err(StorageError::AlreadyClaimed {
                table: table.to_string(),
                row: claim.id.row,
            });
        }
        let instance_uuid = t.rows[idx].record.instance_uuid.clone();
        if let Some(owner) = t.owner_of(&instance_uuid) {
            if owner != claim.caller {
                return Err(StorageError::InstanceBound {
                    table: table.to_string(),
                    instance_uuid,
                });
            }
        }
        t.rows[idx].consumed_by = Some(claim.caller.clone());
        t.rows[idx].consumed_at = Some(claim.claimed_at);
        Ok(t.stored(&t.rows[idx]))
    }

    async fn list_calls(
        &self,
        table: &str,
        limit: usize,
    ) -> Result<Vec<StoredCall>, StorageError> {
        let inner = self.lock()?;
        let t = table_ref(&inner, table)?;
        let take = if limit == 0 { usize::MAX } else { limit };
        Ok(t.rows.iter().take(take).map(|r| t.stored(r)).collect())
    }

    async fn count_calls(&self, table: &str, filter: CallFilter) -> Result<u64, StorageError> {
        let inner = self.lock()?;
        let t = table_ref(&inner, table)?;
        let count = t
            .rows
            .iter()
            .filter(|r| match filter.consumed {
                Some(consumed) => r.consumed_by.is_some() == consumed,
                None => true,
            })
            .filter(|r| match filter.event_type {
                Some(event_type) => r.record.event_type == event_type,
                None => true,
            })
            .count();
        Ok(count as u64)
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.lock()?.settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.lock()?
            .settings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

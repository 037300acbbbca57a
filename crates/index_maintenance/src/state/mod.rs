//! Persisted maintenance state: one record per secondary index that needs
//! work and one per table pending deletion.

use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    sync::Arc,
};

use anyhow::Context;
use errors::ErrorMetadata;
use serde::{
    de::DeserializeOwned,
    Deserialize,
    Serialize,
};

use crate::{
    schema::SchemaSnapshot,
    types::{
        IndexEntry,
        IndexName,
        PartitionId,
        SchemaSeq,
        TableId,
        TableName,
    },
};

mod store;

pub use self::store::{
    InMemoryStateStore,
    MaintenanceStateStore,
    StoredRecord,
};

const INDEX_PREFIX: &str = "index/";
const TABLE_PREFIX: &str = "table/";
const OWNERSHIP_KEY: &str = "node/owned_partitions";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum IndexPhase {
    /// Population hit an unexpected error. Nothing happens until the index
    /// is dropped.
    Failed,
    Populating,
    Cleaning,
    Idle,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryIndexState {
    pub index: IndexName,
    pub table_id: TableId,
    pub populating: bool,
    /// Partition being scanned. Only set while `populating`.
    pub current_partition: Option<PartitionId>,
    /// Last primary key processed in `current_partition`.
    pub last_key: Vec<u8>,
    pub completed_partitions: BTreeSet<PartitionId>,
    pub last_pass_time_ms: u64,
    pub needs_cleaning: bool,
    pub cleaning_cursor: Option<IndexEntry>,
    pub error: Option<String>,
    pub rebuild_generation: u64,
    pub corruption_resets: u32,
}

impl SecondaryIndexState {
    pub fn new_populating(index: IndexName, table_id: TableId, now_ms: u64) -> Self {
        Self {
            index,
            table_id,
            populating: true,
            current_partition: None,
            last_key: vec![],
            completed_partitions: BTreeSet::new(),
            last_pass_time_ms: now_ms,
            needs_cleaning: false,
            cleaning_cursor: None,
            error: None,
            rebuild_generation: 0,
            corruption_resets: 0,
        }
    }

    pub fn new_cleaning(index: IndexName, table_id: TableId, now_ms: u64) -> Self {
        Self {
            populating: false,
            needs_cleaning: true,
            ..Self::new_populating(index, table_id, now_ms)
        }
    }

    pub fn phase(&self) -> IndexPhase {
        if self.error.is_some() {
            IndexPhase::Failed
        } else if self.populating {
            IndexPhase::Populating
        } else if self.needs_cleaning {
            IndexPhase::Cleaning
        } else {
            IndexPhase::Idle
        }
    }

    /// Record that the scan of `partition` reached `last_key`.
    pub fn advance(&mut self, partition: PartitionId, last_key: Vec<u8>) {
        self.current_partition = Some(partition);
        self.last_key = last_key;
    }

    pub fn finish_partition(&mut self, partition: PartitionId) {
        self.completed_partitions.insert(partition);
        self.current_partition = None;
        self.last_key.clear();
    }

    pub fn finish_population(&mut self, needs_cleaning: bool) {
        self.populating = false;
        self.current_partition = None;
        self.last_key.clear();
        // Cleaning may already have been requested while populating.
        self.needs_cleaning |= needs_cleaning;
        self.cleaning_cursor = None;
    }

    /// Schedule a cleaning pass over the whole index. Applies in any phase
    /// except `Failed`; a populating index cleans once population finishes.
    /// Returns whether anything changed.
    pub fn request_cleaning(&mut self, restart: bool) -> bool {
        if self.error.is_some() {
            return false;
        }
        let before = (self.needs_cleaning, self.cleaning_cursor.is_some());
        self.needs_cleaning = true;
        if restart {
            self.cleaning_cursor = None;
        }
        before != (self.needs_cleaning, self.cleaning_cursor.is_some())
    }

    pub fn finish_cleaning(&mut self) {
        self.needs_cleaning = false;
        self.cleaning_cursor = None;
    }

    pub fn mark_failed(&mut self, error: String) {
        self.error = Some(error);
        self.current_partition = None;
    }

    /// Discard all progress and start over under a new rebuild generation.
    /// Once `retry_limit` (if nonzero) rebuilds have happened the index is
    /// marked failed instead.
    pub fn reset_for_rebuild(&mut self, now_ms: u64, retry_limit: u32) {
        self.rebuild_generation += 1;
        self.corruption_resets += 1;
        self.populating = true;
        self.current_partition = None;
        self.last_key.clear();
        self.completed_partitions.clear();
        self.needs_cleaning = false;
        self.cleaning_cursor = None;
        self.last_pass_time_ms = now_ms;
        if retry_limit > 0 && self.corruption_resets > retry_limit {
            self.error = Some(format!(
                "Index {} was corrupted {} times, giving up",
                self.index, self.corruption_resets
            ));
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedTableState {
    pub table_id: TableId,
    pub table: TableName,
    pub marked_at: SchemaSeq,
    pub completed_partitions: BTreeSet<PartitionId>,
    pub done: bool,
}

impl DeletedTableState {
    pub fn new(table_id: TableId, table: TableName, marked_at: SchemaSeq) -> Self {
        Self {
            table_id,
            table,
            marked_at,
            completed_partitions: BTreeSet::new(),
            done: false,
        }
    }

    /// Table names may be reused after a drop, so the key carries the id.
    pub fn state_key(&self) -> String {
        format!("{}/{}", self.table.state_key(), self.table_id)
    }
}

/// The partitions this node owned when maintenance state was last
/// reconciled. Partitions missing from the current set were lost, possibly
/// before a restart.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedPartitionsState {
    pub partitions: BTreeSet<PartitionId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

/// Typed view over a `MaintenanceStateStore`.
#[derive(Clone)]
pub struct MaintenanceStateModel {
    store: Arc<dyn MaintenanceStateStore>,
}

impl MaintenanceStateModel {
    pub fn new(store: Arc<dyn MaintenanceStateStore>) -> Self {
        Self { store }
    }

    pub async fn load_indexes(
        &self,
    ) -> anyhow::Result<BTreeMap<IndexName, Versioned<SecondaryIndexState>>> {
        let mut out = BTreeMap::new();
        for record in self.store.scan(INDEX_PREFIX).await? {
            let state: Versioned<SecondaryIndexState> = decode(record)?;
            out.insert(state.value.index.clone(), state);
        }
        Ok(out)
    }

    pub async fn load_tables(
        &self,
    ) -> anyhow::Result<BTreeMap<TableId, Versioned<DeletedTableState>>> {
        let mut out = BTreeMap::new();
        for record in self.store.scan(TABLE_PREFIX).await? {
            let state: Versioned<DeletedTableState> = decode(record)?;
            out.insert(state.value.table_id, state);
        }
        Ok(out)
    }

    pub async fn get_index(
        &self,
        index: &IndexName,
    ) -> anyhow::Result<Option<Versioned<SecondaryIndexState>>> {
        self.store
            .get(&index.state_key())
            .await?
            .map(decode)
            .transpose()
    }

    pub async fn create_index(&self, state: &SecondaryIndexState) -> anyhow::Result<u64> {
        self.store
            .put(&state.index.state_key(), encode(state)?, None)
            .await
    }

    /// Write `state` over the record at `version`.
    pub async fn put_index(
        &self,
        state: &SecondaryIndexState,
        version: u64,
    ) -> anyhow::Result<u64> {
        self.store
            .put(&state.index.state_key(), encode(state)?, Some(version))
            .await
    }

    /// Read-modify-write one index record under optimistic locking. Returns
    /// the updated state, or `None` if the record no longer exists.
    pub async fn update_index(
        &self,
        index: &IndexName,
        f: impl FnOnce(&mut SecondaryIndexState) -> anyhow::Result<()> + Send,
    ) -> anyhow::Result<Option<SecondaryIndexState>> {
        let Some(Versioned { mut value, version }) = self.get_index(index).await? else {
            return Ok(None);
        };
        f(&mut value)?;
        self.put_index(&value, version).await?;
        Ok(Some(value))
    }

    pub async fn delete_index(&self, index: &IndexName, version: u64) -> anyhow::Result<()> {
        self.store.delete(&index.state_key(), version).await
    }

    pub async fn get_table(
        &self,
        table_id: TableId,
    ) -> anyhow::Result<Option<Versioned<DeletedTableState>>> {
        Ok(self.load_tables().await?.remove(&table_id))
    }

    pub async fn create_table(&self, state: &DeletedTableState) -> anyhow::Result<u64> {
        self.store.put(&state.state_key(), encode(state)?, None).await
    }

    pub async fn update_table(
        &self,
        current: Versioned<DeletedTableState>,
        f: impl FnOnce(&mut DeletedTableState) + Send,
    ) -> anyhow::Result<DeletedTableState> {
        let Versioned { mut value, version } = current;
        f(&mut value);
        self.store
            .put(&value.state_key(), encode(&value)?, Some(version))
            .await?;
        Ok(value)
    }

    pub async fn delete_table(&self, state: &Versioned<DeletedTableState>) -> anyhow::Result<()> {
        self.store
            .delete(&state.value.state_key(), state.version)
            .await
    }

    pub async fn get_owned_partitions(
        &self,
    ) -> anyhow::Result<Option<Versioned<OwnedPartitionsState>>> {
        self.store
            .get(OWNERSHIP_KEY)
            .await?
            .map(decode)
            .transpose()
    }

    /// Create the record when `version` is `None`, otherwise overwrite it.
    pub async fn put_owned_partitions(
        &self,
        state: &OwnedPartitionsState,
        version: Option<u64>,
    ) -> anyhow::Result<u64> {
        self.store.put(OWNERSHIP_KEY, encode(state)?, version).await
    }

    /// Whether `index` can serve reads. An index with no record is complete
    /// once the schema marks it ready. Fails if the build failed permanently.
    pub async fn index_build_complete(
        &self,
        schema: &SchemaSnapshot,
        index: &IndexName,
    ) -> anyhow::Result<bool> {
        let Some(Versioned { value: state, .. }) = self.get_index(index).await? else {
            return Ok(schema.indexes.get(index).is_some_and(|i| i.ready));
        };
        match state.phase() {
            IndexPhase::Failed => anyhow::bail!(ErrorMetadata::bad_request(
                "IndexBuildFailed",
                format!(
                    "Index {index} failed to build: {}",
                    state.error.unwrap_or_default()
                ),
            )),
            IndexPhase::Populating => Ok(false),
            IndexPhase::Cleaning | IndexPhase::Idle => Ok(true),
        }
    }

    /// Whether every record of the dropped `table` has been extinguished.
    pub async fn table_data_removed(
        &self,
        schema: &SchemaSnapshot,
        table: TableId,
    ) -> anyhow::Result<bool> {
        match self.get_table(table).await? {
            Some(record) => Ok(record.value.done),
            None => Ok(!schema.dropped.contains_key(&table)),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> anyhow::Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(record: StoredRecord) -> anyhow::Result<Versioned<T>> {
    let value = serde_json::from_slice(&record.value)
        .with_context(|| format!("Failed to decode maintenance record {}", record.key))?;
    Ok(Versioned {
        value,
        version: record.version,
    })
}

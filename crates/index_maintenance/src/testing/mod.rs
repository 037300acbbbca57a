//! In-memory collaborators with fault injection, for tests of the engine and
//! of code embedding it.

use std::{
    collections::{
        BTreeMap,
        BTreeSet,
        VecDeque,
    },
    sync::{
        atomic::{
            AtomicBool,
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
};

use async_trait::async_trait;
use errors::ErrorMetadata;
use parking_lot::Mutex;

use crate::{
    migration::MigrationInterlock,
    schema::IndexSchema,
    store::{
        IndexHandle,
        PartitionStore,
    },
    types::{
        IndexEntry,
        IndexName,
        KeyOnlyRecord,
        PartitionId,
        Row,
        RowKind,
        TableId,
    },
};

/// Primary keys are `partition (u32 BE) ++ table (u64 BE) ++ user key`, so a
/// partition scan interleaves every table stored in it.
pub fn primary_key(partition: PartitionId, table: TableId, user_key: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(12 + user_key.len());
    key.extend_from_slice(&partition.0.to_be_bytes());
    key.extend_from_slice(&table.0.to_be_bytes());
    key.extend_from_slice(user_key);
    key
}

fn partition_prefix(partition: PartitionId) -> [u8; 4] {
    partition.0.to_be_bytes()
}

/// Index function used by `InMemoryIndex`: one entry per row, keyed by the
/// row's value. Rows with an empty value are not indexed.
pub fn index_keys(row: &Row) -> Vec<Vec<u8>> {
    if row.value.is_empty() {
        return vec![];
    }
    vec![row.value.clone()]
}

pub struct InMemoryIndex {
    name: IndexName,
    table: TableId,
    entries: Mutex<BTreeSet<IndexEntry>>,
    incremental: AtomicBool,
    faults: Mutex<VecDeque<anyhow::Error>>,
    active_populates: AtomicUsize,
    max_concurrent_populates: AtomicUsize,
    populate_calls: AtomicUsize,
}

impl InMemoryIndex {
    fn new(name: IndexName, table: TableId) -> Self {
        Self {
            name,
            table,
            entries: Mutex::new(BTreeSet::new()),
            incremental: AtomicBool::new(false),
            faults: Mutex::new(VecDeque::new()),
            active_populates: AtomicUsize::new(0),
            max_concurrent_populates: AtomicUsize::new(0),
            populate_calls: AtomicUsize::new(0),
        }
    }

    pub fn entries(&self) -> Vec<IndexEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn insert_entry(&self, entry: IndexEntry) {
        self.entries.lock().insert(entry);
    }

    /// Fail the next `populate` call with `fault`.
    pub fn inject_populate_fault(&self, fault: anyhow::Error) {
        self.faults.lock().push_back(fault);
    }

    pub fn incremental_population(&self) -> bool {
        self.incremental.load(Ordering::SeqCst)
    }

    pub fn populate_calls(&self) -> usize {
        self.populate_calls.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_populates(&self) -> usize {
        self.max_concurrent_populates.load(Ordering::SeqCst)
    }

    fn apply_write(&self, old: Option<&Row>, new: Option<&Row>) {
        let mut entries = self.entries.lock();
        if let Some(old) = old {
            for index_key in index_keys(old) {
                entries.remove(&IndexEntry {
                    index_key,
                    primary_key: old.primary_key.clone(),
                });
            }
        }
        if let Some(new) = new {
            for index_key in index_keys(new) {
                entries.insert(IndexEntry {
                    index_key,
                    primary_key: new.primary_key.clone(),
                });
            }
        }
    }
}

#[async_trait]
impl IndexHandle for InMemoryIndex {
    fn name(&self) -> &IndexName {
        &self.name
    }

    fn set_incremental_population(&self, enabled: bool) {
        self.incremental.store(enabled, Ordering::SeqCst);
    }

    async fn populate(&self, rows: &[Row]) -> anyhow::Result<()> {
        self.populate_calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active_populates.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_populates
            .fetch_max(active, Ordering::SeqCst);
        tokio::task::yield_now().await;
        let result = match self.faults.lock().pop_front() {
            Some(fault) => Err(fault),
            None => {
                for row in rows {
                    self.apply_write(None, Some(row));
                }
                Ok(())
            },
        };
        self.active_populates.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn scan_entries(
        &self,
        after: Option<&IndexEntry>,
        limit: usize,
    ) -> anyhow::Result<Vec<IndexEntry>> {
        let entries = self.entries.lock();
        Ok(entries
            .iter()
            .filter(|entry| after.map_or(true, |after| *entry > after))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete_entries(&self, entries: &[IndexEntry]) -> anyhow::Result<()> {
        let mut stored = self.entries.lock();
        for entry in entries {
            stored.remove(entry);
        }
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        self.entries.lock().clear();
        Ok(())
    }
}

#[derive(Clone)]
struct StoredRow {
    table: TableId,
    value: Vec<u8>,
    kind: RowKind,
}

#[derive(Default)]
struct StoreInner {
    rows: BTreeMap<Vec<u8>, StoredRow>,
    indexes: BTreeMap<IndexName, Arc<InMemoryIndex>>,
    open: BTreeSet<IndexName>,
    unavailable_tables: BTreeSet<TableId>,
    scan_faults: VecDeque<anyhow::Error>,
    extinguished: Vec<(TableId, BTreeSet<PartitionId>)>,
    scans: usize,
}

/// `PartitionStore` over ordered in-memory maps. Ownership checks are
/// delegated to the node's migration interlock.
pub struct InMemoryPartitionStore {
    inner: Mutex<StoreInner>,
    interlock: Arc<dyn MigrationInterlock>,
}

impl InMemoryPartitionStore {
    pub fn new(interlock: Arc<dyn MigrationInterlock>) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            interlock,
        }
    }

    fn write(&self, key: Vec<u8>, row: StoredRow) {
        let mut inner = self.inner.lock();
        let old = inner.rows.insert(key.clone(), row.clone());
        let old_live = old
            .filter(|r| r.kind == RowKind::Live)
            .map(|r| Row {
                primary_key: key.clone(),
                table: r.table,
                value: r.value,
            });
        let new_live = (row.kind == RowKind::Live).then(|| Row {
            primary_key: key.clone(),
            table: row.table,
            value: row.value.clone(),
        });
        for (name, index) in &inner.indexes {
            if index.table == row.table && inner.open.contains(name) {
                index.apply_write(old_live.as_ref(), new_live.as_ref());
            }
        }
    }

    /// Ordinary write. Open indexes on the table are maintained.
    pub fn put_row(
        &self,
        partition: PartitionId,
        table: TableId,
        user_key: &[u8],
        value: &[u8],
    ) -> Vec<u8> {
        let key = primary_key(partition, table, user_key);
        self.write(
            key.clone(),
            StoredRow {
                table,
                value: value.to_vec(),
                kind: RowKind::Live,
            },
        );
        key
    }

    /// Ordinary delete: leaves a tombstone.
    pub fn delete_row(&self, partition: PartitionId, table: TableId, user_key: &[u8]) {
        self.write(
            primary_key(partition, table, user_key),
            StoredRow {
                table,
                value: vec![],
                kind: RowKind::Tombstone,
            },
        );
    }

    /// A record left behind by an aborted transaction.
    pub fn put_orphan(&self, partition: PartitionId, table: TableId, user_key: &[u8], value: &[u8]) {
        self.write(
            primary_key(partition, table, user_key),
            StoredRow {
                table,
                value: value.to_vec(),
                kind: RowKind::Orphan,
            },
        );
    }

    pub fn live_rows(&self, table: TableId) -> Vec<Row> {
        self.inner
            .lock()
            .rows
            .iter()
            .filter(|(_, r)| r.table == table && r.kind == RowKind::Live)
            .map(|(key, r)| Row {
                primary_key: key.clone(),
                table,
                value: r.value.clone(),
            })
            .collect()
    }

    /// Entries a fully populated index over `table` would hold.
    pub fn expected_entries(&self, table: TableId) -> Vec<IndexEntry> {
        let mut entries: Vec<_> = self
            .live_rows(table)
            .iter()
            .flat_map(|row| {
                index_keys(row).into_iter().map(|index_key| IndexEntry {
                    index_key,
                    primary_key: row.primary_key.clone(),
                })
            })
            .collect();
        entries.sort();
        entries
    }

    pub fn index(&self, name: &IndexName) -> Option<Arc<InMemoryIndex>> {
        self.inner.lock().indexes.get(name).cloned()
    }

    pub fn is_open(&self, name: &IndexName) -> bool {
        self.inner.lock().open.contains(name)
    }

    pub fn set_table_unavailable(&self, table: TableId, unavailable: bool) {
        let mut inner = self.inner.lock();
        if unavailable {
            inner.unavailable_tables.insert(table);
        } else {
            inner.unavailable_tables.remove(&table);
        }
    }

    /// Fail the next `scan_keys` call with `fault`.
    pub fn inject_scan_fault(&self, fault: anyhow::Error) {
        self.inner.lock().scan_faults.push_back(fault);
    }

    pub fn extinguished(&self) -> Vec<(TableId, BTreeSet<PartitionId>)> {
        self.inner.lock().extinguished.clone()
    }

    pub fn scans(&self) -> usize {
        self.inner.lock().scans
    }

    pub fn has_rows(&self, table: TableId) -> bool {
        self.inner.lock().rows.values().any(|r| r.table == table)
    }
}

#[async_trait]
impl PartitionStore for InMemoryPartitionStore {
    async fn open_index(&self, index: &IndexSchema) -> anyhow::Result<Arc<dyn IndexHandle>> {
        let mut inner = self.inner.lock();
        if inner.unavailable_tables.contains(&index.table) {
            anyhow::bail!(ErrorMetadata::table_unavailable(format!(
                "Table {} is not established on this node",
                index.table
            )));
        }
        let handle = inner
            .indexes
            .entry(index.name.clone())
            .or_insert_with(|| Arc::new(InMemoryIndex::new(index.name.clone(), index.table)))
            .clone();
        inner.open.insert(index.name.clone());
        Ok(handle)
    }

    async fn close_index(&self, index: &IndexName) -> anyhow::Result<()> {
        self.inner.lock().open.remove(index);
        Ok(())
    }

    async fn remove_index(&self, index: &IndexName) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        inner.open.remove(index);
        inner.indexes.remove(index);
        Ok(())
    }

    async fn scan_keys(
        &self,
        partition: PartitionId,
        after: &[u8],
        limit: usize,
    ) -> anyhow::Result<Vec<KeyOnlyRecord>> {
        if !self.interlock.owned_partitions().contains(&partition) {
            anyhow::bail!(ErrorMetadata::partition_not_owned(partition));
        }
        let mut inner = self.inner.lock();
        inner.scans += 1;
        if let Some(fault) = inner.scan_faults.pop_front() {
            return Err(fault);
        }
        let prefix = partition_prefix(partition);
        let start = if after.is_empty() {
            prefix.to_vec()
        } else {
            after.to_vec()
        };
        Ok(inner
            .rows
            .range(start..)
            .filter(|(key, _)| after.is_empty() || key.as_slice() > after)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .take(limit)
            .map(|(key, row)| KeyOnlyRecord {
                primary_key: key.clone(),
                table: row.table,
                kind: row.kind,
            })
            .collect())
    }

    async fn read_locked(
        &self,
        _partition: PartitionId,
        keys: &[Vec<u8>],
    ) -> anyhow::Result<Vec<Row>> {
        let inner = self.inner.lock();
        Ok(keys
            .iter()
            .filter_map(|key| {
                let row = inner.rows.get(key)?;
                (row.kind == RowKind::Live).then(|| Row {
                    primary_key: key.clone(),
                    table: row.table,
                    value: row.value.clone(),
                })
            })
            .collect())
    }

    async fn extinguish_records(
        &self,
        table: TableId,
        segments: &BTreeSet<PartitionId>,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        inner.rows.retain(|key, row| {
            !(row.table == table && segments.contains(&self.partition_of(key)))
        });
        inner.extinguished.push((table, segments.clone()));
        Ok(())
    }

    fn partition_of(&self, primary_key: &[u8]) -> PartitionId {
        match primary_key.get(..4).and_then(|b| <[u8; 4]>::try_from(b).ok()) {
            Some(bytes) => PartitionId(u32::from_be_bytes(bytes)),
            None => PartitionId(0),
        }
    }
}

//! Schema snapshots and the registry that ingests them in three phases:
//! stage a candidate, then either commit it (atomically replacing the visible
//! snapshot and waking subscribers) or abort it.

use std::{
    collections::BTreeMap,
    sync::Arc,
};

use errors::ErrorMetadata;
use parking_lot::Mutex;
use serde::{
    Deserialize,
    Serialize,
};
use tokio::sync::watch;

use crate::types::{
    IndexName,
    SchemaSeq,
    TableId,
    TableName,
};

/// Limits a top-level table places on itself and on its child tables.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub read_kb_per_sec: Option<u64>,
    pub write_kb_per_sec: Option<u64>,
    pub table_size_bytes: Option<u64>,
    /// Limit on the bytes stored under one shard key (partition).
    pub partition_size_bytes: Option<u64>,
    pub read_allowed: bool,
    pub write_allowed: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            read_kb_per_sec: None,
            write_kb_per_sec: None,
            table_size_bytes: None,
            partition_size_bytes: None,
            read_allowed: true,
            write_allowed: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableSchema {
    pub id: TableId,
    pub name: TableName,
    pub parent: Option<TableId>,
    pub limits: Option<ResourceLimits>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexSchema {
    pub name: IndexName,
    pub table: TableId,
    /// Set by schema orchestration once `add_index_complete` reported the
    /// build finished. Ready indexes only need maintenance for cleaning or
    /// corruption rebuilds.
    pub ready: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DroppedTable {
    pub id: TableId,
    pub name: TableName,
    pub dropped_at: SchemaSeq,
}

#[derive(Clone, Debug, Default)]
pub struct SchemaSnapshot {
    pub seq: SchemaSeq,
    pub tables: BTreeMap<TableId, Arc<TableSchema>>,
    pub indexes: BTreeMap<IndexName, IndexSchema>,
    pub dropped: BTreeMap<TableId, DroppedTable>,
}

impl SchemaSnapshot {
    pub fn new(seq: SchemaSeq) -> Self {
        Self {
            seq,
            ..Default::default()
        }
    }

    /// Copy of this snapshot at a newer sequence number. Table schema objects
    /// keep their identity.
    pub fn next(&self) -> Self {
        Self {
            seq: SchemaSeq(self.seq.0 + 1),
            ..self.clone()
        }
    }

    pub fn with_table(mut self, table: TableSchema) -> Self {
        self.tables.insert(table.id, Arc::new(table));
        self
    }

    pub fn with_index(mut self, index: IndexSchema) -> Self {
        self.indexes.insert(index.name.clone(), index);
        self
    }

    /// Remove `table` and its indexes, recording the drop at this snapshot's
    /// sequence number.
    pub fn with_dropped(mut self, table: TableId) -> Self {
        if let Some(schema) = self.tables.remove(&table) {
            self.indexes.retain(|_, index| index.table != table);
            self.dropped.insert(
                table,
                DroppedTable {
                    id: table,
                    name: schema.name.clone(),
                    dropped_at: self.seq,
                },
            );
        }
        self
    }

    pub fn table(&self, id: TableId) -> Option<&Arc<TableSchema>> {
        self.tables.get(&id)
    }

    /// Walk parent links up to the top-level table. Returns `None` for an
    /// unknown table or a dangling or cyclic parent chain.
    pub fn top_level(&self, id: TableId) -> Option<&Arc<TableSchema>> {
        let mut current = self.tables.get(&id)?;
        for _ in 0..=self.tables.len() {
            match current.parent {
                None => return Some(current),
                Some(parent) => current = self.tables.get(&parent)?,
            }
        }
        None
    }
}

pub struct SchemaRegistry {
    staged: Mutex<Option<Arc<SchemaSnapshot>>>,
    visible: watch::Sender<Arc<SchemaSnapshot>>,
}

impl SchemaRegistry {
    pub fn new(initial: SchemaSnapshot) -> Self {
        let (visible, _) = watch::channel(Arc::new(initial));
        Self {
            staged: Mutex::new(None),
            visible,
        }
    }

    /// Stage a candidate snapshot. Its sequence number must be newer than the
    /// visible one and nothing else may already be staged.
    pub fn stage(&self, snapshot: SchemaSnapshot) -> anyhow::Result<()> {
        let mut staged = self.staged.lock();
        let visible_seq = self.visible.borrow().seq;
        if snapshot.seq <= visible_seq {
            anyhow::bail!(ErrorMetadata::bad_request(
                "StaleSchema",
                format!(
                    "Staged schema {} is not newer than visible schema {visible_seq}",
                    snapshot.seq
                ),
            ));
        }
        if let Some(ref pending) = *staged {
            anyhow::bail!(ErrorMetadata::bad_request(
                "SchemaAlreadyStaged",
                format!("Schema {} is already staged", pending.seq),
            ));
        }
        *staged = Some(Arc::new(snapshot));
        Ok(())
    }

    /// Make the staged snapshot visible and notify subscribers.
    pub fn commit(&self) -> anyhow::Result<Arc<SchemaSnapshot>> {
        let mut staged = self.staged.lock();
        let Some(snapshot) = staged.take() else {
            anyhow::bail!(ErrorMetadata::bad_request(
                "NoStagedSchema",
                "There is no staged schema to commit",
            ));
        };
        self.visible.send_replace(snapshot.clone());
        tracing::info!("Committed schema {}", snapshot.seq);
        Ok(snapshot)
    }

    /// Discard the staged snapshot, if any.
    pub fn abort(&self) -> bool {
        self.staged.lock().take().is_some()
    }

    /// Stage and commit in one step.
    pub fn apply(&self, snapshot: SchemaSnapshot) -> anyhow::Result<Arc<SchemaSnapshot>> {
        self.stage(snapshot)?;
        self.commit()
    }

    pub fn current(&self) -> Arc<SchemaSnapshot> {
        self.visible.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<SchemaSnapshot>> {
        self.visible.subscribe()
    }
}

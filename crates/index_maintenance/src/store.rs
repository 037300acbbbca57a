//! Capabilities the engine drives on the underlying transactional partition
//! store. The store owns the data and the index machinery; maintenance only
//! decides what to scan, populate, delete and extinguish.

use std::{
    collections::BTreeSet,
    sync::Arc,
};

use async_trait::async_trait;

use crate::{
    schema::IndexSchema,
    types::{
        IndexEntry,
        IndexName,
        KeyOnlyRecord,
        PartitionId,
        Row,
        TableId,
    },
};

#[async_trait]
pub trait PartitionStore: Send + Sync {
    /// Open (or create) the index. Fails with a table-unavailable error when
    /// the table is not yet established on this node.
    async fn open_index(&self, index: &IndexSchema) -> anyhow::Result<Arc<dyn IndexHandle>>;

    async fn close_index(&self, index: &IndexName) -> anyhow::Result<()>;

    /// Drop the index and all of its entries.
    async fn remove_index(&self, index: &IndexName) -> anyhow::Result<()>;

    /// Uncommitted, key-only scan of up to `limit` records in `partition`
    /// strictly after `after`. Covers every table stored in the partition.
    /// Fails with a partition-not-owned error if the partition left the node.
    async fn scan_keys(
        &self,
        partition: PartitionId,
        after: &[u8],
        limit: usize,
    ) -> anyhow::Result<Vec<KeyOnlyRecord>>;

    /// Fetch the live rows for `keys` under a read lock. Keys that no longer
    /// refer to a live row are omitted.
    async fn read_locked(
        &self,
        partition: PartitionId,
        keys: &[Vec<u8>],
    ) -> anyhow::Result<Vec<Row>>;

    /// Logically delete every record of `table` in `segments`. Physical
    /// reclamation happens later.
    async fn extinguish_records(
        &self,
        table: TableId,
        segments: &BTreeSet<PartitionId>,
    ) -> anyhow::Result<()>;

    fn partition_of(&self, primary_key: &[u8]) -> PartitionId;
}

#[async_trait]
pub trait IndexHandle: Send + Sync {
    fn name(&self) -> &IndexName;

    /// While on, ordinary writes maintain the index even though population
    /// has not caught up yet.
    fn set_incremental_population(&self, enabled: bool);

    /// Feed rows through the index function. Fails with an index-corrupted
    /// error if the index detects inconsistent contents.
    async fn populate(&self, rows: &[Row]) -> anyhow::Result<()>;

    /// Up to `limit` entries in index order strictly after `after`.
    async fn scan_entries(
        &self,
        after: Option<&IndexEntry>,
        limit: usize,
    ) -> anyhow::Result<Vec<IndexEntry>>;

    async fn delete_entries(&self, entries: &[IndexEntry]) -> anyhow::Result<()>;

    /// Remove every entry.
    async fn clear(&self) -> anyhow::Result<()>;
}

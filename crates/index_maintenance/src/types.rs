use std::{
    borrow::Cow,
    fmt,
};

use serde::{
    Deserialize,
    Serialize,
};

/// Stable numeric id of a table. Survives renames; never reused.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
    derive_more::From,
)]
pub struct TableId(pub u64);

/// A contiguous shard of the keyspace and the unit of migration.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
    derive_more::From,
)]
pub struct PartitionId(pub u32);

/// Monotonically increasing version of the schema metadata.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
    derive_more::From,
)]
pub struct SchemaSeq(pub u64);

const NO_NAMESPACE: &str = "-";

/// Escapes one component of a state key so distinct names never share a key:
/// `%` and `/` are percent-encoded, and a component that is exactly the
/// missing-namespace marker is encoded too.
fn key_segment(segment: &str) -> Cow<'_, str> {
    if segment == NO_NAMESPACE {
        return Cow::Borrowed("%2D");
    }
    if !segment.contains(['%', '/']) {
        return Cow::Borrowed(segment);
    }
    Cow::Owned(
        segment
            .replace('%', "%25")
            .replace('/', "%2F"),
    )
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableName {
    pub namespace: Option<String>,
    pub name: String,
}

impl TableName {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    fn namespace_segment(&self) -> Cow<'_, str> {
        match &self.namespace {
            Some(ns) => key_segment(ns),
            None => Cow::Borrowed(NO_NAMESPACE),
        }
    }

    /// Key of this table's deletion record in the maintenance state store.
    pub fn state_key(&self) -> String {
        format!(
            "table/{}/{}",
            self.namespace_segment(),
            key_segment(&self.name)
        )
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}.{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexName {
    pub table: TableName,
    pub index: String,
}

impl IndexName {
    pub fn new(table: TableName, index: impl Into<String>) -> Self {
        Self {
            table,
            index: index.into(),
        }
    }

    /// Key of this index's record in the maintenance state store.
    pub fn state_key(&self) -> String {
        format!(
            "index/{}/{}/{}",
            self.table.namespace_segment(),
            key_segment(&self.table.name),
            key_segment(&self.index)
        )
    }
}

impl fmt::Display for IndexName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.index)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowKind {
    Live,
    /// Deleted, awaiting compaction.
    Tombstone,
    /// Left behind by an aborted transaction or migration.
    Orphan,
}

/// Result of an uncommitted key-only scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyOnlyRecord {
    pub primary_key: Vec<u8>,
    pub table: TableId,
    pub kind: RowKind,
}

/// A live primary row read under lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Row {
    pub primary_key: Vec<u8>,
    pub table: TableId,
    pub value: Vec<u8>,
}

/// One secondary index entry. Ordered the way the index stores it.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexEntry {
    pub index_key: Vec<u8>,
    pub primary_key: Vec<u8>,
}

use std::collections::BTreeMap;

use async_trait::async_trait;
use errors::ErrorMetadata;
use parking_lot::Mutex;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredRecord {
    pub key: String,
    pub value: Vec<u8>,
    pub version: u64,
}

/// Versioned byte records, stored in the same transactional mechanism as
/// ordinary data. Every write names the version it expects to replace; a
/// mismatch fails with an OCC error and writes nothing.
#[async_trait]
pub trait MaintenanceStateStore: Send + Sync {
    /// All records whose key starts with `prefix`, in key order.
    async fn scan(&self, prefix: &str) -> anyhow::Result<Vec<StoredRecord>>;

    async fn get(&self, key: &str) -> anyhow::Result<Option<StoredRecord>>;

    /// Write `value` under `key`. `expected_version` is `None` to create a
    /// record that must not exist yet. Returns the new version.
    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        expected_version: Option<u64>,
    ) -> anyhow::Result<u64>;

    async fn delete(&self, key: &str, expected_version: u64) -> anyhow::Result<()>;
}

#[derive(Default)]
struct Inner {
    records: BTreeMap<String, (Vec<u8>, u64)>,
    next_version: u64,
    #[cfg(any(test, feature = "testing"))]
    injected_conflicts: usize,
    #[cfg(any(test, feature = "testing"))]
    injected_faults: Vec<ErrorMetadata>,
}

/// Process-local `MaintenanceStateStore`.
#[derive(Default)]
pub struct InMemoryStateStore {
    inner: Mutex<Inner>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` writes with an OCC error.
    #[cfg(any(test, feature = "testing"))]
    pub fn inject_conflicts(&self, count: usize) {
        self.inner.lock().injected_conflicts += count;
    }

    /// Fail the next operation (read or write) with `fault`.
    #[cfg(any(test, feature = "testing"))]
    pub fn inject_fault(&self, fault: ErrorMetadata) {
        self.inner.lock().injected_faults.push(fault);
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().records.keys().cloned().collect()
    }
}

impl Inner {
    #[cfg(any(test, feature = "testing"))]
    fn take_fault(&mut self, is_write: bool) -> anyhow::Result<()> {
        if let Some(fault) = self.injected_faults.pop() {
            return Err(fault.into());
        }
        if is_write && self.injected_conflicts > 0 {
            self.injected_conflicts -= 1;
            return Err(ErrorMetadata::system_occ().into());
        }
        Ok(())
    }

    #[cfg(not(any(test, feature = "testing")))]
    fn take_fault(&mut self, _is_write: bool) -> anyhow::Result<()> {
        Ok(())
    }

    fn check_version(&self, key: &str, expected_version: Option<u64>) -> anyhow::Result<()> {
        let current = self.records.get(key).map(|(_, version)| *version);
        if current != expected_version {
            tracing::debug!(
                "Version mismatch on {key}: expected {expected_version:?}, found {current:?}"
            );
            anyhow::bail!(ErrorMetadata::system_occ());
        }
        Ok(())
    }
}

#[async_trait]
impl MaintenanceStateStore for InMemoryStateStore {
    async fn scan(&self, prefix: &str) -> anyhow::Result<Vec<StoredRecord>> {
        let mut inner = self.inner.lock();
        inner.take_fault(false)?;
        Ok(inner
            .records
            .range(prefix.to_owned()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, (value, version))| StoredRecord {
                key: key.clone(),
                value: value.clone(),
                version: *version,
            })
            .collect())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<StoredRecord>> {
        let mut inner = self.inner.lock();
        inner.take_fault(false)?;
        Ok(inner.records.get(key).map(|(value, version)| StoredRecord {
            key: key.to_owned(),
            value: value.clone(),
            version: *version,
        }))
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        expected_version: Option<u64>,
    ) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock();
        inner.take_fault(true)?;
        inner.check_version(key, expected_version)?;
        inner.next_version += 1;
        let version = inner.next_version;
        inner.records.insert(key.to_owned(), (value, version));
        Ok(version)
    }

    async fn delete(&self, key: &str, expected_version: u64) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        inner.take_fault(true)?;
        inner.check_version(key, Some(expected_version))?;
        inner.records.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use errors::ErrorMetadataAnyhowExt;

    use super::{
        InMemoryStateStore,
        MaintenanceStateStore,
    };

    #[tokio::test]
    async fn test_versions_are_checked() -> anyhow::Result<()> {
        let store = InMemoryStateStore::new();
        let v1 = store.put("index/-/t/a", b"1".to_vec(), None).await?;
        assert!(store
            .put("index/-/t/a", b"x".to_vec(), None)
            .await
            .unwrap_err()
            .is_occ());
        let v2 = store.put("index/-/t/a", b"2".to_vec(), Some(v1)).await?;
        assert!(store.delete("index/-/t/a", v1).await.unwrap_err().is_occ());
        store.put("index/-/t/b", b"3".to_vec(), None).await?;
        store.put("table/-/t/1", b"4".to_vec(), None).await?;

        let scanned = store.scan("index/").await?;
        assert_eq!(
            scanned.iter().map(|r| r.key.as_str()).collect::<Vec<_>>(),
            vec!["index/-/t/a", "index/-/t/b"]
        );
        store.delete("index/-/t/a", v2).await?;
        assert!(store.get("index/-/t/a").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_injected_conflicts_only_hit_writes() -> anyhow::Result<()> {
        let store = InMemoryStateStore::new();
        store.inject_conflicts(1);
        store.scan("").await?;
        assert!(store.put("k", vec![], None).await.unwrap_err().is_occ());
        store.put("k", vec![], None).await?;
        Ok(())
    }
}

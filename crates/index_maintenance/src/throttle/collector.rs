use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    sync::{
        atomic::{
            AtomicI64,
            AtomicU64,
            Ordering,
        },
        Arc,
    },
    time::{
        Duration,
        SystemTime,
        UNIX_EPOCH,
    },
};

use errors::ErrorMetadata;
use parking_lot::RwLock;

use super::{
    bucket::RateBuckets,
    CapInputs,
    OperationKind,
    TableUsageReport,
};
use crate::{
    config::ThrottleConfig,
    metrics::log_operation_throttled,
    schema::{
        ResourceLimits,
        TableSchema,
    },
    types::{
        PartitionId,
        TableId,
        TableName,
    },
};

/// Cap a node may use out of a table-wide `limit_kb` shared by `factor` peers.
/// Under no load the node may use the whole limit; under full load only its
/// fair share. Never below `min_cap_kb`.
pub fn compute_cap(limit_kb: u64, factor: u64, load_percent: u64, min_cap_kb: u64) -> u64 {
    let local = (limit_kb / factor.max(1)).max(min_cap_kb);
    let headroom = limit_kb.saturating_sub(local);
    let unused_share = headroom as u128 * (100 - load_percent.min(100)) as u128 / 100;
    local.saturating_add(unused_share as u64).max(min_cap_kb)
}

/// Cap after a cluster-wide usage report: move toward closing the gap between
/// `actual_kb` and `limit_kb`, split across `factor` peers.
pub fn nudge_cap(limit_kb: u64, actual_kb: u64, factor: u64, min_cap_kb: u64) -> u64 {
    let limit = limit_kb as i128;
    let next = (limit + (limit - actual_kb as i128)) / factor.max(1) as i128;
    let ceiling = limit_kb.max(min_cap_kb) as i128;
    next.clamp(min_cap_kb as i128, ceiling) as u64
}

pub(crate) fn epoch_millis(now: SystemTime) -> u64 {
    now.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

pub(crate) fn epoch_second(now: SystemTime) -> u64 {
    epoch_millis(now) / 1000
}

const UNLIMITED: u64 = u64::MAX;

/// Counters for one table hierarchy. Only the top-level table's collector
/// owns a set.
struct TableCounters {
    limits: ResourceLimits,
    min_cap_kb: u64,
    cap_validity: Duration,
    buckets: RateBuckets,
    read_cap_kb: AtomicU64,
    write_cap_kb: AtomicU64,
    caps_valid_until_ms: AtomicU64,
    read_bytes_since_collect: AtomicU64,
    write_bytes_since_collect: AtomicU64,
    size_deltas: RwLock<BTreeMap<PartitionId, Arc<AtomicI64>>>,
    over_limit: RwLock<BTreeSet<PartitionId>>,
    table_size_bytes: AtomicU64,
}

impl TableCounters {
    fn new(limits: ResourceLimits, config: &ThrottleConfig) -> Self {
        Self {
            limits,
            min_cap_kb: config.min_cap_kb,
            cap_validity: config.cap_validity,
            buckets: RateBuckets::new(config.bucket_count),
            read_cap_kb: AtomicU64::new(UNLIMITED),
            write_cap_kb: AtomicU64::new(UNLIMITED),
            caps_valid_until_ms: AtomicU64::new(0),
            read_bytes_since_collect: AtomicU64::new(0),
            write_bytes_since_collect: AtomicU64::new(0),
            size_deltas: RwLock::new(BTreeMap::new()),
            over_limit: RwLock::new(BTreeSet::new()),
            table_size_bytes: AtomicU64::new(0),
        }
    }

    fn caps_valid(&self, now: SystemTime) -> bool {
        epoch_millis(now) < self.caps_valid_until_ms.load(Ordering::Acquire)
    }

    fn set_caps(&self, read_cap_kb: u64, write_cap_kb: u64, now: SystemTime) {
        self.read_cap_kb.store(read_cap_kb, Ordering::Release);
        self.write_cap_kb.store(write_cap_kb, Ordering::Release);
        self.caps_valid_until_ms.store(
            epoch_millis(now + self.cap_validity),
            Ordering::Release,
        );
    }

    fn refresh_caps(&self, inputs: CapInputs, now: SystemTime) {
        let cap = |limit: Option<u64>, factor: u64| {
            limit.map_or(UNLIMITED, |limit| {
                compute_cap(limit, factor, inputs.load_percent, self.min_cap_kb)
            })
        };
        self.set_caps(
            cap(self.limits.read_kb_per_sec, inputs.read_factor),
            cap(self.limits.write_kb_per_sec, inputs.write_factor),
            now,
        );
    }

    fn pending_size_bytes(&self) -> i128 {
        let deltas: i128 = self
            .size_deltas
            .read()
            .values()
            .map(|d| d.load(Ordering::Acquire) as i128)
            .sum();
        self.table_size_bytes.load(Ordering::Acquire) as i128 + deltas
    }

    fn read_over_cap(&self, second: u64) -> Option<(u64, u64)> {
        self.limits.read_kb_per_sec?;
        let used = self.buckets.read_kb(second);
        let cap = self.read_cap_kb.load(Ordering::Acquire);
        (used > cap).then_some((used, cap))
    }

    fn write_over_cap(&self, second: u64) -> Option<(u64, u64)> {
        self.limits.write_kb_per_sec?;
        let used = self.buckets.write_kb(second);
        let cap = self.write_cap_kb.load(Ordering::Acquire);
        (used > cap).then_some((used, cap))
    }
}

enum ChargeTarget {
    Owned(Box<TableCounters>),
    /// Child tables charge their top-level ancestor.
    Ancestor(Arc<ResourceCollector>),
}

/// Throughput and size accounting for one table with limits.
pub struct ResourceCollector {
    schema: Arc<TableSchema>,
    target: ChargeTarget,
}

impl ResourceCollector {
    pub(crate) fn new_top_level(
        schema: Arc<TableSchema>,
        limits: ResourceLimits,
        config: &ThrottleConfig,
        inputs: CapInputs,
        now: SystemTime,
    ) -> Self {
        let counters = TableCounters::new(limits, config);
        counters.refresh_caps(inputs, now);
        Self {
            schema,
            target: ChargeTarget::Owned(Box::new(counters)),
        }
    }

    pub(crate) fn new_child(schema: Arc<TableSchema>, ancestor: Arc<ResourceCollector>) -> Self {
        Self {
            schema,
            target: ChargeTarget::Ancestor(ancestor),
        }
    }

    pub fn table_id(&self) -> TableId {
        self.schema.id
    }

    pub fn table_name(&self) -> &TableName {
        &self.schema.name
    }

    pub(crate) fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    pub(crate) fn ancestor(&self) -> Option<&Arc<ResourceCollector>> {
        match &self.target {
            ChargeTarget::Owned(_) => None,
            ChargeTarget::Ancestor(ancestor) => Some(ancestor),
        }
    }

    /// The table whose counters this collector charges.
    pub fn charged_table(&self) -> TableId {
        match &self.target {
            ChargeTarget::Owned(_) => self.schema.id,
            ChargeTarget::Ancestor(ancestor) => ancestor.charged_table(),
        }
    }

    fn counters(&self) -> &TableCounters {
        match &self.target {
            ChargeTarget::Owned(counters) => counters,
            ChargeTarget::Ancestor(ancestor) => ancestor.counters(),
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.counters().limits
    }

    pub fn read_cap_kb(&self) -> Option<u64> {
        let cap = self.counters().read_cap_kb.load(Ordering::Acquire);
        (cap != UNLIMITED).then_some(cap)
    }

    pub fn write_cap_kb(&self) -> Option<u64> {
        let cap = self.counters().write_cap_kb.load(Ordering::Acquire);
        (cap != UNLIMITED).then_some(cap)
    }

    /// Verify that an operation of kind `op` touching `partition` is within
    /// this table's access flags, size limits and throughput caps.
    pub fn check_operation(
        &self,
        op: OperationKind,
        partition: PartitionId,
        inputs: CapInputs,
        now: SystemTime,
    ) -> anyhow::Result<()> {
        let result = self.check_operation_inner(op, partition, inputs, now);
        if result.is_err() {
            log_operation_throttled(op);
        }
        result
    }

    fn check_operation_inner(
        &self,
        op: OperationKind,
        partition: PartitionId,
        inputs: CapInputs,
        now: SystemTime,
    ) -> anyhow::Result<()> {
        let counters = self.counters();
        let limits = &counters.limits;
        let table = &self.schema.name;
        match op {
            OperationKind::Read => {
                if !limits.read_allowed {
                    anyhow::bail!(ErrorMetadata::read_access_denied(table));
                }
            },
            OperationKind::Write | OperationKind::Delete => {
                if !limits.write_allowed {
                    anyhow::bail!(ErrorMetadata::write_access_denied(table));
                }
            },
        }
        if op == OperationKind::Write {
            if let Some(limit) = limits.table_size_bytes {
                let size = counters.pending_size_bytes();
                if size >= limit as i128 {
                    anyhow::bail!(ErrorMetadata::table_size_limit_exceeded(
                        table,
                        size.max(0) as u64,
                        limit
                    ));
                }
            }
            if limits.partition_size_bytes.is_some()
                && counters.over_limit.read().contains(&partition)
            {
                anyhow::bail!(ErrorMetadata::partition_size_limit_exceeded(
                    table, partition
                ));
            }
        }

        if !counters.caps_valid(now) {
            // Expired window: recompute instead of faulting so a table that
            // was throttled gets a grace period.
            counters.refresh_caps(inputs, now);
            return Ok(());
        }
        let second = epoch_second(now);
        match op {
            OperationKind::Read => {
                if let Some((used, cap)) = counters.read_over_cap(second) {
                    anyhow::bail!(ErrorMetadata::read_throttled(table, used, cap));
                }
            },
            OperationKind::Write | OperationKind::Delete => {
                if let Some((used, cap)) = counters.write_over_cap(second) {
                    anyhow::bail!(ErrorMetadata::write_throttled(table, used, cap));
                }
            },
        }
        Ok(())
    }

    pub fn add_read_bytes(&self, bytes: u64, now: SystemTime) {
        let counters = self.counters();
        counters.buckets.add_read(epoch_second(now), bytes);
        counters
            .read_bytes_since_collect
            .fetch_add(bytes, Ordering::AcqRel);
    }

    /// Charge a write of `bytes` that changed the stored size of `partition`
    /// by `size_delta` bytes.
    pub fn add_write_bytes(
        &self,
        bytes: u64,
        size_delta: i64,
        partition: PartitionId,
        now: SystemTime,
    ) {
        let counters = self.counters();
        counters.buckets.add_write(epoch_second(now), bytes);
        counters
            .write_bytes_since_collect
            .fetch_add(bytes, Ordering::AcqRel);
        if size_delta == 0 {
            return;
        }
        let existing = counters.size_deltas.read().get(&partition).cloned();
        let delta = match existing {
            Some(delta) => delta,
            None => counters
                .size_deltas
                .write()
                .entry(partition)
                .or_default()
                .clone(),
        };
        delta.fetch_add(size_delta, Ordering::AcqRel);
    }

    /// When the table is over a throughput cap, the time at which the
    /// current second's bucket stops counting.
    pub fn throttle_deadline(&self, now: SystemTime) -> Option<SystemTime> {
        let counters = self.counters();
        if !counters.caps_valid(now) {
            return None;
        }
        let second = epoch_second(now);
        if counters.read_over_cap(second).is_some() || counters.write_over_cap(second).is_some() {
            return Some(UNIX_EPOCH + Duration::from_secs(second + 1));
        }
        None
    }

    /// Read and reset the per-partition size deltas accumulated since the
    /// last call.
    pub fn take_size_deltas(&self) -> BTreeMap<PartitionId, i64> {
        self.counters()
            .size_deltas
            .read()
            .iter()
            .map(|(partition, delta)| (*partition, delta.swap(0, Ordering::AcqRel)))
            .filter(|(_, delta)| *delta != 0)
            .collect()
    }

    pub fn set_table_size(&self, bytes: u64) {
        self.counters()
            .table_size_bytes
            .store(bytes, Ordering::Release);
    }

    pub fn table_size(&self) -> u64 {
        self.counters().table_size_bytes.load(Ordering::Acquire)
    }

    pub fn set_partition_over_limit(&self, partition: PartitionId, over: bool) {
        let mut over_limit = self.counters().over_limit.write();
        if over {
            over_limit.insert(partition);
        } else {
            over_limit.remove(&partition);
        }
    }

    /// Bytes read and written since the previous call.
    pub(crate) fn take_usage(&self) -> (u64, u64) {
        let counters = self.counters();
        (
            counters.read_bytes_since_collect.swap(0, Ordering::AcqRel),
            counters.write_bytes_since_collect.swap(0, Ordering::AcqRel),
        )
    }

    pub(crate) fn apply_report(&self, report: &TableUsageReport, inputs: CapInputs, now: SystemTime) {
        let counters = self.counters();
        let cap = |limit: Option<u64>, actual: u64, factor: u64| {
            limit.map_or(UNLIMITED, |limit| {
                nudge_cap(limit, actual, factor, counters.min_cap_kb)
            })
        };
        counters.set_caps(
            cap(
                counters.limits.read_kb_per_sec,
                report.read_kb_per_sec,
                inputs.read_factor,
            ),
            cap(
                counters.limits.write_kb_per_sec,
                report.write_kb_per_sec,
                inputs.write_factor,
            ),
            now,
        );
        if let Some(size) = report.table_size_bytes {
            counters.table_size_bytes.store(size, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{
        compute_cap,
        nudge_cap,
    };

    proptest! {
        #![proptest_config(ProptestConfig { failure_persistence: None, ..ProptestConfig::default() })]

        #[test]
        fn test_cap_endpoints(limit in 2u64..1_000_000, factor in 1u64..64) {
            prop_assert_eq!(compute_cap(limit, factor, 0, 2), limit);
            prop_assert_eq!(compute_cap(limit, factor, 100, 2), (limit / factor).max(2));
        }

        #[test]
        fn test_cap_is_monotone_in_load(
            limit in 0u64..1_000_000,
            factor in 1u64..64,
            low in 0u64..=100,
            high in 0u64..=100,
        ) {
            let (low, high) = (low.min(high), low.max(high));
            prop_assert!(compute_cap(limit, factor, low, 2) >= compute_cap(limit, factor, high, 2));
            prop_assert!(compute_cap(limit, factor, high, 2) >= 2);
        }

        #[test]
        fn test_nudge_stays_in_range(
            limit in 0u64..1_000_000,
            actual in 0u64..10_000_000,
            factor in 1u64..64,
        ) {
            let next = nudge_cap(limit, actual, factor, 2);
            prop_assert!(next >= 2);
            prop_assert!(next <= limit.max(2));
        }
    }

    #[test]
    fn test_nudge_examples() {
        // Under-used table on two nodes: each node may use the full limit.
        assert_eq!(nudge_cap(100, 0, 2, 2), 100);
        // Exactly at the limit: fair share.
        assert_eq!(nudge_cap(100, 100, 2, 2), 50);
        // Over the limit: squeezed toward the floor.
        assert_eq!(nudge_cap(100, 150, 2, 2), 25);
        assert_eq!(nudge_cap(100, 400, 2, 2), 2);
    }
}

//! Per-table throughput and size limits. Ordinary operations are checked and
//! charged here on the request path; the populator consults it to pace
//! itself.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::SystemTime,
};

use parking_lot::{
    Mutex,
    RwLock,
};

use crate::{
    config::ThrottleConfig,
    schema::SchemaSnapshot,
    types::{
        PartitionId,
        TableId,
    },
};

mod bucket;
mod collector;

pub use self::{
    bucket::RateBuckets,
    collector::{
        compute_cap,
        nudge_cap,
        ResourceCollector,
    },
};

#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Read,
    Write,
    /// Checked like a write, but exempt from size limits so an over-limit
    /// table can always shrink.
    Delete,
}

impl OperationKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
        }
    }
}

/// How many peers share each table-wide limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Topology {
    /// Fan-out for reads.
    pub replica_nodes: u64,
    /// Fan-out for writes.
    pub shards: u64,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            replica_nodes: 1,
            shards: 1,
        }
    }
}

/// Everything a cap computation depends on besides the limit itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CapInputs {
    pub read_factor: u64,
    pub write_factor: u64,
    pub load_percent: u64,
}

#[derive(Default)]
struct ClusterSignals {
    topology: Topology,
    load: Option<(u64, SystemTime)>,
}

impl ClusterSignals {
    fn cap_inputs(&self, now: SystemTime, config: &ThrottleConfig) -> CapInputs {
        let load_percent = match self.load {
            Some((percent, sampled_at)) => {
                let age = now.duration_since(sampled_at).unwrap_or_default();
                if age > config.load_max_staleness {
                    100
                } else {
                    percent
                }
            },
            // No signal: assume the cluster is saturated and take the fair share.
            None => 100,
        };
        CapInputs {
            read_factor: self.topology.replica_nodes.max(1),
            write_factor: self.topology.shards.max(1),
            load_percent,
        }
    }
}

/// Bytes charged to one top-level table since the previous collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableUsageRecord {
    pub table_id: TableId,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// Periodic usage report handed to the cluster-wide aggregator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterUsageRecord {
    pub collected_at: SystemTime,
    pub tables: Vec<TableUsageRecord>,
}

/// Cluster-wide usage for one table, pushed back by the aggregator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableUsageReport {
    pub table_id: TableId,
    pub read_kb_per_sec: u64,
    pub write_kb_per_sec: u64,
    pub table_size_bytes: Option<u64>,
}

pub struct ResourceTracker {
    config: ThrottleConfig,
    collectors: RwLock<BTreeMap<TableId, Arc<ResourceCollector>>>,
    signals: Mutex<ClusterSignals>,
}

impl ResourceTracker {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            collectors: RwLock::new(BTreeMap::new()),
            signals: Mutex::new(ClusterSignals::default()),
        }
    }

    pub fn cap_inputs(&self, now: SystemTime) -> CapInputs {
        self.signals.lock().cap_inputs(now, &self.config)
    }

    /// Rebuild collectors for `snapshot`. A collector survives only if its
    /// table's schema object (and, for child tables, its ancestor's
    /// collector) is the same instance as before.
    pub fn update_schema(&self, snapshot: &SchemaSnapshot, now: SystemTime) {
        let inputs = self.cap_inputs(now);
        let previous = self.collectors.read().clone();
        let mut next = BTreeMap::new();

        for (id, schema) in &snapshot.tables {
            let (None, Some(limits)) = (schema.parent, &schema.limits) else {
                continue;
            };
            let collector = match previous.get(id) {
                Some(existing)
                    if existing.ancestor().is_none() && Arc::ptr_eq(existing.schema(), schema) =>
                {
                    existing.clone()
                },
                _ => Arc::new(ResourceCollector::new_top_level(
                    schema.clone(),
                    limits.clone(),
                    &self.config,
                    inputs,
                    now,
                )),
            };
            next.insert(*id, collector);
        }

        for (id, schema) in &snapshot.tables {
            if schema.parent.is_none() {
                continue;
            }
            let Some(ancestor) = snapshot
                .top_level(*id)
                .and_then(|root| next.get(&root.id))
                .cloned()
            else {
                continue;
            };
            let collector = match previous.get(id) {
                Some(existing)
                    if Arc::ptr_eq(existing.schema(), schema)
                        && existing
                            .ancestor()
                            .is_some_and(|a| Arc::ptr_eq(a, &ancestor)) =>
                {
                    existing.clone()
                },
                _ => Arc::new(ResourceCollector::new_child(schema.clone(), ancestor)),
            };
            next.insert(*id, collector);
        }

        tracing::debug!(
            "Tracking resource limits for {} tables at schema {}",
            next.len(),
            snapshot.seq
        );
        *self.collectors.write() = next;
    }

    pub fn get_resource_collector(&self, table: TableId) -> Option<Arc<ResourceCollector>> {
        self.collectors.read().get(&table).cloned()
    }

    /// Tables without limits always pass.
    pub fn check_operation(
        &self,
        table: TableId,
        op: OperationKind,
        partition: PartitionId,
        now: SystemTime,
    ) -> anyhow::Result<()> {
        let Some(collector) = self.get_resource_collector(table) else {
            return Ok(());
        };
        collector.check_operation(op, partition, self.cap_inputs(now), now)
    }

    pub fn add_read_bytes(&self, table: TableId, bytes: u64, now: SystemTime) {
        if let Some(collector) = self.get_resource_collector(table) {
            collector.add_read_bytes(bytes, now);
        }
    }

    pub fn add_write_bytes(
        &self,
        table: TableId,
        bytes: u64,
        size_delta: i64,
        partition: PartitionId,
        now: SystemTime,
    ) {
        if let Some(collector) = self.get_resource_collector(table) {
            collector.add_write_bytes(bytes, size_delta, partition, now);
        }
    }

    pub fn throttle_deadline(&self, table: TableId, now: SystemTime) -> Option<SystemTime> {
        self.get_resource_collector(table)?.throttle_deadline(now)
    }

    /// Drain per-table usage for the cluster-wide aggregator.
    pub fn collect_usage(&self, now: SystemTime) -> ClusterUsageRecord {
        let collectors = self.collectors.read().clone();
        let tables = collectors
            .values()
            .filter(|c| c.ancestor().is_none())
            .map(|c| {
                let (read_bytes, write_bytes) = c.take_usage();
                TableUsageRecord {
                    table_id: c.table_id(),
                    read_bytes,
                    write_bytes,
                }
            })
            .collect();
        ClusterUsageRecord {
            collected_at: now,
            tables,
        }
    }

    /// Apply aggregated cluster-wide usage. Each report resets its table's
    /// cap validity window.
    pub fn report(&self, reports: &[TableUsageReport], now: SystemTime) {
        let inputs = self.cap_inputs(now);
        for report in reports {
            match self.get_resource_collector(report.table_id) {
                Some(collector) if collector.ancestor().is_none() => {
                    collector.apply_report(report, inputs, now);
                },
                _ => tracing::debug!("Ignoring usage report for untracked table {}", report.table_id),
            }
        }
    }

    pub fn set_topology(&self, topology: Topology) {
        self.signals.lock().topology = topology;
    }

    /// Latest cluster load sample from admission control, in percent.
    pub fn record_load(&self, percent: u64, now: SystemTime) {
        self.signals.lock().load = Some((percent.min(100), now));
    }
}

use std::{
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use errors::{
    ErrorCode,
    ErrorMetadataAnyhowExt,
};
use maplit::btreemap;
use pretty_assertions::assert_eq;

use super::{
    table,
    EVENTS,
    USERS,
};
use crate::{
    config::ThrottleConfig,
    runtime::{
        testing::{
            TestRuntime,
            TEST_EPOCH,
        },
        Runtime,
    },
    schema::{
        ResourceLimits,
        SchemaSnapshot,
        TableSchema,
    },
    throttle::{
        OperationKind,
        ResourceTracker,
        TableUsageRecord,
        TableUsageReport,
        Topology,
    },
    types::{
        PartitionId,
        SchemaSeq,
        TableId,
    },
};

const KB: u64 = 1024;
const P1: PartitionId = PartitionId(1);
const COMMENTS: TableId = TableId(3);

fn throttle_config() -> ThrottleConfig {
    ThrottleConfig {
        cap_validity: Duration::from_secs(7),
        min_cap_kb: 2,
        bucket_count: 10,
        load_max_staleness: Duration::from_secs(30),
    }
}

fn limited(id: TableId, name: &str, limits: ResourceLimits) -> TableSchema {
    TableSchema {
        limits: Some(limits),
        ..table(id, name)
    }
}

fn write_limited(kb_per_sec: u64) -> ResourceLimits {
    ResourceLimits {
        write_kb_per_sec: Some(kb_per_sec),
        ..ResourceLimits::default()
    }
}

fn error_code(result: anyhow::Result<()>) -> Option<ErrorCode> {
    result.err().and_then(|e| {
        e.downcast_ref::<errors::ErrorMetadata>()
            .map(|em| em.code)
    })
}

#[test]
fn test_fair_share_write_throttling() -> anyhow::Result<()> {
    let t0 = *TEST_EPOCH;
    let tracker = ResourceTracker::new(throttle_config());
    tracker.set_topology(Topology {
        replica_nodes: 3,
        shards: 2,
    });
    let snapshot = SchemaSnapshot::new(SchemaSeq(1))
        .with_table(limited(USERS, "users", write_limited(100)))
        .with_table(table(EVENTS, "events"));
    tracker.update_schema(&snapshot, t0);

    // No load signal yet: the node gets its fair share of 100 KB/s over two
    // shards.
    let collector = tracker.get_resource_collector(USERS).context("collector")?;
    assert_eq!(collector.write_cap_kb(), Some(50));
    assert_eq!(collector.read_cap_kb(), None);
    assert!(tracker.get_resource_collector(EVENTS).is_none());

    tracker.add_write_bytes(USERS, 50 * KB, 0, P1, t0);
    tracker.check_operation(USERS, OperationKind::Write, P1, t0)?;
    tracker.add_write_bytes(USERS, KB, 0, P1, t0);
    assert_eq!(
        error_code(tracker.check_operation(USERS, OperationKind::Write, P1, t0)),
        Some(ErrorCode::WriteThrottled)
    );
    assert_eq!(
        error_code(tracker.check_operation(USERS, OperationKind::Delete, P1, t0)),
        Some(ErrorCode::WriteThrottled)
    );
    assert!(tracker
        .check_operation(USERS, OperationKind::Write, P1, t0)
        .unwrap_err()
        .is_resource_limit());
    tracker.check_operation(USERS, OperationKind::Read, P1, t0)?;
    tracker.check_operation(EVENTS, OperationKind::Write, P1, t0)?;
    assert_eq!(
        tracker.throttle_deadline(USERS, t0 + Duration::from_millis(300)),
        Some(t0 + Duration::from_secs(1))
    );

    // The next second starts a fresh bucket.
    let t1 = t0 + Duration::from_secs(1);
    tracker.check_operation(USERS, OperationKind::Write, P1, t1)?;
    assert_eq!(tracker.throttle_deadline(USERS, t1), None);
    Ok(())
}

/// 60 KB/s against a 100 KB/s limit split over two shards, sustained for
/// eight seconds, which outlasts the seven second cap window.
#[tokio::test(start_paused = true)]
async fn test_sustained_burst_across_cap_window() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let tracker = ResourceTracker::new(throttle_config());
    tracker.set_topology(Topology {
        replica_nodes: 1,
        shards: 2,
    });
    let snapshot =
        SchemaSnapshot::new(SchemaSeq(1)).with_table(limited(USERS, "users", write_limited(100)));
    tracker.update_schema(&snapshot, rt.system_time());
    let collector = tracker.get_resource_collector(USERS).context("collector")?;

    let mut throttled_seconds = vec![];
    for second in 0..8 {
        let now = rt.system_time();
        tracker.add_write_bytes(USERS, 60 * KB, 0, P1, now);
        match error_code(tracker.check_operation(USERS, OperationKind::Write, P1, now)) {
            Some(ErrorCode::WriteThrottled) => throttled_seconds.push(second),
            None => {},
            other => anyhow::bail!("Unexpected fault {other:?} at second {second}"),
        }
        assert_eq!(collector.write_cap_kb(), Some(50));
        rt.advance(Duration::from_secs(1)).await;
    }
    // Every second over the fair share throttles, except the request that
    // found the window expired at second seven and renewed it.
    assert_eq!(throttled_seconds, vec![0, 1, 2, 3, 4, 5, 6]);

    // The renewed window throttles again.
    let now = rt.system_time();
    tracker.add_write_bytes(USERS, 60 * KB, 0, P1, now);
    assert_eq!(
        error_code(tracker.check_operation(USERS, OperationKind::Write, P1, now)),
        Some(ErrorCode::WriteThrottled)
    );
    assert_eq!(
        tracker.throttle_deadline(USERS, now),
        Some(now + Duration::from_secs(1))
    );

    // Once the burst stops the next second is clear.
    rt.advance(Duration::from_secs(1)).await;
    let now = rt.system_time();
    tracker.check_operation(USERS, OperationKind::Write, P1, now)?;
    assert_eq!(tracker.throttle_deadline(USERS, now), None);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_sustained_burst_released_when_load_drops() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let tracker = ResourceTracker::new(throttle_config());
    tracker.set_topology(Topology {
        replica_nodes: 1,
        shards: 2,
    });
    let snapshot =
        SchemaSnapshot::new(SchemaSeq(1)).with_table(limited(USERS, "users", write_limited(100)));
    tracker.update_schema(&snapshot, rt.system_time());
    let collector = tracker.get_resource_collector(USERS).context("collector")?;

    let mut throttled_seconds = vec![];
    for second in 0..10 {
        let now = rt.system_time();
        // The cluster goes quiet early on, but current caps hold until the
        // window expires.
        if second == 2 {
            tracker.record_load(0, now);
        }
        tracker.add_write_bytes(USERS, 60 * KB, 0, P1, now);
        if tracker
            .check_operation(USERS, OperationKind::Write, P1, now)
            .is_err()
        {
            throttled_seconds.push(second);
        }
        rt.advance(Duration::from_secs(1)).await;
    }
    assert_eq!(throttled_seconds, vec![0, 1, 2, 3, 4, 5, 6]);
    assert_eq!(collector.write_cap_kb(), Some(100));
    Ok(())
}

#[test]
fn test_expired_caps_are_recomputed_with_grace() -> anyhow::Result<()> {
    let t0 = *TEST_EPOCH;
    let tracker = ResourceTracker::new(throttle_config());
    tracker.set_topology(Topology {
        replica_nodes: 1,
        shards: 2,
    });
    let snapshot =
        SchemaSnapshot::new(SchemaSeq(1)).with_table(limited(USERS, "users", write_limited(100)));
    tracker.update_schema(&snapshot, t0);
    let collector = tracker.get_resource_collector(USERS).context("collector")?;
    assert_eq!(collector.write_cap_kb(), Some(50));

    // An idle cluster lets the node use the whole limit, once the current
    // caps expire.
    let t8 = t0 + Duration::from_secs(8);
    tracker.record_load(0, t8);
    tracker.add_write_bytes(USERS, 80 * KB, 0, P1, t8);
    tracker.check_operation(USERS, OperationKind::Write, P1, t8)?;
    assert_eq!(collector.write_cap_kb(), Some(100));
    tracker.check_operation(USERS, OperationKind::Write, P1, t8)?;

    // A stale load sample counts as full load.
    let t40 = t8 + Duration::from_secs(32);
    assert_eq!(tracker.cap_inputs(t40).load_percent, 100);
    tracker.check_operation(USERS, OperationKind::Write, P1, t40)?;
    assert_eq!(collector.write_cap_kb(), Some(50));
    Ok(())
}

#[test]
fn test_usage_reports_nudge_caps() -> anyhow::Result<()> {
    let t0 = *TEST_EPOCH;
    let tracker = ResourceTracker::new(throttle_config());
    tracker.set_topology(Topology {
        replica_nodes: 1,
        shards: 2,
    });
    let snapshot =
        SchemaSnapshot::new(SchemaSeq(1)).with_table(limited(USERS, "users", write_limited(100)));
    tracker.update_schema(&snapshot, t0);
    let collector = tracker.get_resource_collector(USERS).context("collector")?;

    let report = |write_kb_per_sec, table_size_bytes| TableUsageReport {
        table_id: USERS,
        read_kb_per_sec: 0,
        write_kb_per_sec,
        table_size_bytes,
    };
    tracker.report(&[report(0, None)], t0);
    assert_eq!(collector.write_cap_kb(), Some(100));
    tracker.report(&[report(100, None)], t0);
    assert_eq!(collector.write_cap_kb(), Some(50));
    tracker.report(&[report(150, Some(4096))], t0);
    assert_eq!(collector.write_cap_kb(), Some(25));
    assert_eq!(collector.table_size(), 4096);
    tracker.report(&[report(400, None)], t0);
    assert_eq!(collector.write_cap_kb(), Some(2));

    // The report opened a fresh validity window, so the small cap applies.
    let t5 = t0 + Duration::from_secs(5);
    tracker.add_write_bytes(USERS, 3 * KB, 0, P1, t5);
    assert_eq!(
        error_code(tracker.check_operation(USERS, OperationKind::Write, P1, t5)),
        Some(ErrorCode::WriteThrottled)
    );
    Ok(())
}

#[test]
fn test_size_limits_exempt_deletes() -> anyhow::Result<()> {
    let t0 = *TEST_EPOCH;
    let tracker = ResourceTracker::new(throttle_config());
    let snapshot = SchemaSnapshot::new(SchemaSeq(1)).with_table(limited(
        USERS,
        "users",
        ResourceLimits {
            table_size_bytes: Some(10_000),
            partition_size_bytes: Some(4_000),
            ..ResourceLimits::default()
        },
    ));
    tracker.update_schema(&snapshot, t0);
    let collector = tracker.get_resource_collector(USERS).context("collector")?;

    collector.set_table_size(9_000);
    tracker.check_operation(USERS, OperationKind::Write, P1, t0)?;
    tracker.add_write_bytes(USERS, 600, 600, P1, t0);
    tracker.add_write_bytes(USERS, 400, 400, PartitionId(2), t0);
    assert_eq!(
        error_code(tracker.check_operation(USERS, OperationKind::Write, P1, t0)),
        Some(ErrorCode::TableSizeLimitExceeded)
    );
    tracker.check_operation(USERS, OperationKind::Delete, P1, t0)?;
    tracker.check_operation(USERS, OperationKind::Read, P1, t0)?;

    // The size scanner folds the deltas into a new table size.
    assert_eq!(
        collector.take_size_deltas(),
        btreemap! {P1 => 600, PartitionId(2) => 400}
    );
    assert!(collector.take_size_deltas().is_empty());
    collector.set_table_size(5_000);
    tracker.check_operation(USERS, OperationKind::Write, P1, t0)?;

    collector.set_partition_over_limit(P1, true);
    assert_eq!(
        error_code(tracker.check_operation(USERS, OperationKind::Write, P1, t0)),
        Some(ErrorCode::PartitionSizeLimitExceeded)
    );
    tracker.check_operation(USERS, OperationKind::Write, PartitionId(2), t0)?;
    tracker.check_operation(USERS, OperationKind::Delete, P1, t0)?;
    collector.set_partition_over_limit(P1, false);
    tracker.check_operation(USERS, OperationKind::Write, P1, t0)?;
    Ok(())
}

#[test]
fn test_access_flags() -> anyhow::Result<()> {
    let t0 = *TEST_EPOCH;
    let tracker = ResourceTracker::new(throttle_config());
    let snapshot = SchemaSnapshot::new(SchemaSeq(1))
        .with_table(limited(
            USERS,
            "users",
            ResourceLimits {
                read_allowed: false,
                ..ResourceLimits::default()
            },
        ))
        .with_table(limited(
            EVENTS,
            "events",
            ResourceLimits {
                write_allowed: false,
                ..ResourceLimits::default()
            },
        ));
    tracker.update_schema(&snapshot, t0);

    assert_eq!(
        error_code(tracker.check_operation(USERS, OperationKind::Read, P1, t0)),
        Some(ErrorCode::ReadAccessDenied)
    );
    tracker.check_operation(USERS, OperationKind::Write, P1, t0)?;
    tracker.check_operation(EVENTS, OperationKind::Read, P1, t0)?;
    for op in [OperationKind::Write, OperationKind::Delete] {
        assert_eq!(
            error_code(tracker.check_operation(EVENTS, op, P1, t0)),
            Some(ErrorCode::WriteAccessDenied)
        );
    }
    Ok(())
}

#[test]
fn test_child_tables_charge_their_ancestor() -> anyhow::Result<()> {
    let t0 = *TEST_EPOCH;
    let tracker = ResourceTracker::new(throttle_config());
    let snapshot = SchemaSnapshot::new(SchemaSeq(1))
        .with_table(limited(USERS, "users", write_limited(10)))
        .with_table(TableSchema {
            parent: Some(USERS),
            ..table(EVENTS, "events")
        })
        .with_table(TableSchema {
            parent: Some(EVENTS),
            ..table(COMMENTS, "comments")
        });
    tracker.update_schema(&snapshot, t0);

    let comments = tracker
        .get_resource_collector(COMMENTS)
        .context("child collector")?;
    assert_eq!(comments.charged_table(), USERS);
    assert_eq!(comments.write_cap_kb(), Some(10));

    tracker.add_write_bytes(COMMENTS, 11 * KB, 0, P1, t0);
    assert_eq!(
        error_code(tracker.check_operation(USERS, OperationKind::Write, P1, t0)),
        Some(ErrorCode::WriteThrottled)
    );
    assert_eq!(
        error_code(tracker.check_operation(EVENTS, OperationKind::Write, P1, t0)),
        Some(ErrorCode::WriteThrottled)
    );

    let usage = tracker.collect_usage(t0);
    assert_eq!(
        usage.tables,
        vec![TableUsageRecord {
            table_id: USERS,
            read_bytes: 0,
            write_bytes: 11 * KB,
        }]
    );
    assert_eq!(tracker.collect_usage(t0).tables[0].write_bytes, 0);
    Ok(())
}

#[test]
fn test_collectors_survive_only_unchanged_schemas() -> anyhow::Result<()> {
    let t0 = *TEST_EPOCH;
    let tracker = ResourceTracker::new(throttle_config());
    let snapshot = SchemaSnapshot::new(SchemaSeq(1))
        .with_table(limited(USERS, "users", write_limited(100)))
        .with_table(TableSchema {
            parent: Some(USERS),
            ..table(EVENTS, "events")
        });
    tracker.update_schema(&snapshot, t0);
    let users = tracker.get_resource_collector(USERS).context("users")?;
    let events = tracker.get_resource_collector(EVENTS).context("events")?;

    // Same schema objects: collectors and their counters are kept.
    let next = snapshot.next();
    tracker.update_schema(&next, t0);
    assert!(Arc::ptr_eq(
        &users,
        &tracker.get_resource_collector(USERS).context("users")?
    ));
    assert!(Arc::ptr_eq(
        &events,
        &tracker.get_resource_collector(EVENTS).context("events")?
    ));

    // A new schema object for the parent rebuilds the parent and its child.
    let changed = next
        .next()
        .with_table(limited(USERS, "users", write_limited(200)));
    tracker.update_schema(&changed, t0);
    let new_users = tracker.get_resource_collector(USERS).context("users")?;
    let new_events = tracker.get_resource_collector(EVENTS).context("events")?;
    assert!(!Arc::ptr_eq(&users, &new_users));
    assert!(!Arc::ptr_eq(&events, &new_events));
    assert_eq!(new_events.write_cap_kb(), Some(200));

    // Dropping limits stops tracking the table.
    let unlimited = changed.next().with_table(table(USERS, "users"));
    tracker.update_schema(&unlimited, t0);
    assert!(tracker.get_resource_collector(USERS).is_none());
    assert!(tracker.get_resource_collector(EVENTS).is_none());
    tracker.check_operation(USERS, OperationKind::Write, P1, t0)?;
    Ok(())
}

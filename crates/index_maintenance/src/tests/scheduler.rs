use std::{
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

use super::{
    base_schema,
    building,
    table,
    users_by_email,
    TestNode,
    USERS,
};
use crate::{
    config::MaintenanceConfig,
    manager::MaintenanceManager,
    runtime::testing::TestRuntime,
    scheduler::{
        MaintenanceScheduler,
        SchedulerState,
    },
    schema::{
        IndexSchema,
        ResourceLimits,
        TableSchema,
    },
    shutdown::ShutdownSignal,
    state::IndexPhase,
    throttle::TableUsageReport,
    types::{
        IndexName,
        PartitionId,
    },
};

fn scheduler(node: &TestNode, shutdown: ShutdownSignal) -> MaintenanceScheduler<TestRuntime> {
    scheduler_with_config(node, node.config.clone(), shutdown)
}

fn scheduler_with_config(
    node: &TestNode,
    config: MaintenanceConfig,
    shutdown: ShutdownSignal,
) -> MaintenanceScheduler<TestRuntime> {
    MaintenanceScheduler::new(
        node.rt.clone(),
        config,
        node.schema.clone(),
        node.services.clone(),
        shutdown,
    )
}

async fn wait_for_build(
    manager: &MaintenanceManager<TestRuntime>,
    index: &IndexName,
) -> anyhow::Result<()> {
    for _ in 0..100 {
        if manager.add_index_complete(index).await? {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    anyhow::bail!("Index {index} was never built")
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_builds_index_and_parks() -> anyhow::Result<()> {
    let node = TestNode::new([1, 2], base_schema());
    node.write_users(&[1, 2], 3);
    node.update_schema(|s| s.with_index(building(users_by_email(), USERS)))?;

    let scheduler = scheduler(&node, ShutdownSignal::panic());
    scheduler.start();
    scheduler.wait_for_quiescence().await?;

    let state = scheduler
        .index_status(&users_by_email())
        .await?
        .context("index record")?;
    assert_eq!(state.phase(), IndexPhase::Idle);
    assert!(scheduler.add_index_complete(&users_by_email()).await?);
    let index = node.store.index(&users_by_email()).context("index opened")?;
    assert_eq!(index.entries(), node.store.expected_entries(USERS));
    assert_eq!(index.max_concurrent_populates(), 1);
    let status = *scheduler.subscribe().borrow();
    assert_eq!(status.state, SchedulerState::Idle);
    assert_eq!(status.idle_passes, 1);

    // Orchestration flips the index to ready; the next pass drops its record.
    node.update_schema(|mut s| {
        if let Some(index) = s.indexes.get_mut(&users_by_email()) {
            index.ready = true;
        }
        s
    })?;
    assert!(scheduler.request_update());
    scheduler.wait_for_quiescence().await?;
    assert!(scheduler.index_status(&users_by_email()).await?.is_none());
    assert!(scheduler.add_index_complete(&users_by_email()).await?);
    assert_eq!(scheduler.subscribe().borrow().idle_passes, 2);

    scheduler.shutdown().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_requests() -> anyhow::Result<()> {
    let node = TestNode::new([1], base_schema());
    let scheduler = scheduler(&node, ShutdownSignal::panic());
    scheduler.start();
    scheduler.wait_for_quiescence().await?;

    scheduler.shutdown().await?;
    assert!(!scheduler.request_update());
    assert!(!scheduler.request_secondary_cleaning());
    assert_eq!(scheduler.subscribe().borrow().state, SchedulerState::Stopped);
    assert!(scheduler.wait_for_quiescence().await.is_err());
    // Shutting down twice is harmless.
    scheduler.shutdown().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_disabled_scheduler_does_not_start() -> anyhow::Result<()> {
    let node = TestNode::new([1], base_schema());
    node.update_schema(|s| s.with_index(building(users_by_email(), USERS)))?;
    let config = MaintenanceConfig {
        enabled: false,
        ..node.config.clone()
    };
    let scheduler = scheduler_with_config(&node, config, ShutdownSignal::no_op());
    scheduler.start();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(node.store.index(&users_by_email()).is_none());
    assert!(scheduler.index_status(&users_by_email()).await?.is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_transient_conflicts_are_retried() -> anyhow::Result<()> {
    let node = TestNode::new([1], base_schema());
    node.write_users(&[1], 5);
    node.update_schema(|s| s.with_index(building(users_by_email(), USERS)))?;
    node.state_store.inject_conflicts(4);

    let scheduler = scheduler(&node, ShutdownSignal::panic());
    scheduler.start();
    scheduler.wait_for_quiescence().await?;

    let state = scheduler
        .index_status(&users_by_email())
        .await?
        .context("index record")?;
    assert_eq!(state.phase(), IndexPhase::Idle);
    let index = node.store.index(&users_by_email()).context("index opened")?;
    assert_eq!(index.entries(), node.store.expected_entries(USERS));
    scheduler.shutdown().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_unexpected_error_is_fatal() -> anyhow::Result<()> {
    let node = TestNode::new([1], base_schema());
    node.state_store.inject_fault(ErrorMetadata::bad_request(
        "UndecodableRecord",
        "Maintenance record is not valid",
    ));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let scheduler = scheduler(&node, ShutdownSignal::new(tx, "node-1".to_owned()));
    scheduler.start();

    let message = rx.recv().await.context("shutdown message")?;
    assert_eq!(message.node_name, "node-1");
    assert!(message.error.is_bad_request());
    assert_eq!(scheduler.subscribe().borrow().state, SchedulerState::Stopped);
    assert!(scheduler.wait_for_quiescence().await.is_err());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_corruption_report_rebuilds_ready_index() -> anyhow::Result<()> {
    let node = TestNode::new([1], base_schema());
    node.write_users(&[1], 3);
    node.update_schema(|s| {
        s.with_index(IndexSchema {
            ready: true,
            ..building(users_by_email(), USERS)
        })
    })?;

    let scheduler = scheduler(&node, ShutdownSignal::panic());
    scheduler.start();
    scheduler.wait_for_quiescence().await?;
    let index = node.store.index(&users_by_email()).context("index opened")?;
    // Rows written before the index was opened are missing.
    assert!(index.entries().is_empty());
    assert!(scheduler.index_status(&users_by_email()).await?.is_none());

    assert!(scheduler.report_index_corruption(users_by_email()));
    assert!(scheduler.report_index_corruption(users_by_email()));
    scheduler.wait_for_quiescence().await?;

    let state = scheduler
        .index_status(&users_by_email())
        .await?
        .context("index record")?;
    assert_eq!(state.rebuild_generation, 1);
    assert_eq!(state.corruption_resets, 1);
    assert_eq!(state.phase(), IndexPhase::Idle);
    assert_eq!(index.entries(), node.store.expected_entries(USERS));
    scheduler.shutdown().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_dropped_table_is_cleaned_by_scheduler() -> anyhow::Result<()> {
    let node = TestNode::new([1, 2], base_schema());
    node.write_users(&[1, 2], 2);
    let scheduler = scheduler(&node, ShutdownSignal::panic());
    scheduler.start();
    scheduler.wait_for_quiescence().await?;

    node.update_schema(|s| s.with_dropped(USERS))?;
    assert!(!scheduler.remove_table_data_complete(USERS).await?);
    scheduler.request_update();
    scheduler.wait_for_quiescence().await?;
    assert!(scheduler.remove_table_data_complete(USERS).await?);
    assert!(!node.store.has_rows(USERS));
    scheduler.shutdown().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_finished_migration_wakes_scheduler() -> anyhow::Result<()> {
    let node = TestNode::new([1, 2], base_schema());
    node.write_users(&[1, 2], 3);
    node.update_schema(|s| s.with_index(building(users_by_email(), USERS)))?;
    let scheduler = scheduler(&node, ShutdownSignal::panic());
    scheduler.start();
    scheduler.wait_for_quiescence().await?;
    let index = node.store.index(&users_by_email()).context("index opened")?;
    assert_eq!(index.entries().len(), 6);

    // Starting a migration is not a loss; finishing one is.
    node.migration.start_source(PartitionId(2))?;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(scheduler.subscribe().borrow().idle_passes, 1);
    node.migration.finish_source(PartitionId(2))?;
    tokio::time::sleep(Duration::from_millis(10)).await;
    scheduler.wait_for_quiescence().await?;

    assert_eq!(scheduler.subscribe().borrow().idle_passes, 2);
    let remaining = index.entries();
    assert_eq!(remaining.len(), 3);
    assert!(remaining
        .iter()
        .all(|e| node.services.store.partition_of(&e.primary_key) == PartitionId(1)));
    let state = scheduler
        .index_status(&users_by_email())
        .await?
        .context("index record")?;
    assert_eq!(state.phase(), IndexPhase::Idle);
    scheduler.shutdown().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_restarted_scheduler_cleans_partitions_lost_while_stopped() -> anyhow::Result<()> {
    let node = TestNode::new([1, 2], base_schema());
    node.write_users(&[1, 2], 2);
    node.update_schema(|s| s.with_index(building(users_by_email(), USERS)))?;
    let first = scheduler(&node, ShutdownSignal::panic());
    first.start();
    first.wait_for_quiescence().await?;
    first.shutdown().await?;

    node.migration.start_source(PartitionId(2))?;
    node.migration.finish_source(PartitionId(2))?;

    let second = scheduler(&node, ShutdownSignal::panic());
    second.start();
    second.wait_for_quiescence().await?;
    let index = node.store.index(&users_by_email()).context("index opened")?;
    let remaining = index.entries();
    assert_eq!(remaining.len(), 2);
    assert!(remaining
        .iter()
        .all(|e| node.services.store.partition_of(&e.primary_key) == PartitionId(1)));
    assert!(second.add_index_complete(&users_by_email()).await?);
    second.shutdown().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_manager_follows_schema_and_hands_off() -> anyhow::Result<()> {
    let node = TestNode::new([1], base_schema());
    node.write_users(&[1], 3);
    let manager = MaintenanceManager::new(
        node.rt.clone(),
        node.config.clone(),
        node.schema.clone(),
        node.services.clone(),
        ShutdownSignal::panic(),
    );
    assert!(manager.scheduler().is_none());
    manager.become_master().await?;
    let first = manager.scheduler().context("scheduler")?;
    first.wait_for_quiescence().await?;

    // Committed schemas wake the scheduler without an explicit request.
    node.update_schema(|s| s.with_index(building(users_by_email(), USERS)))?;
    wait_for_build(&manager, &users_by_email()).await?;
    let index = node.store.index(&users_by_email()).context("index opened")?;
    assert_eq!(index.entries(), node.store.expected_entries(USERS));

    // ... and reach the rate tracker.
    assert!(manager.get_resource_collector(USERS).is_none());
    node.update_schema(|s| {
        s.with_table(TableSchema {
            limits: Some(ResourceLimits {
                write_kb_per_sec: Some(100),
                ..ResourceLimits::default()
            }),
            ..table(USERS, "users")
        })
    })?;
    tokio::time::sleep(Duration::from_millis(10)).await;
    let collector = manager
        .get_resource_collector(USERS)
        .context("users collector")?;
    manager.report(&[TableUsageReport {
        table_id: USERS,
        read_kb_per_sec: 0,
        write_kb_per_sec: 100,
        table_size_bytes: None,
    }]);
    assert_eq!(collector.write_cap_kb(), Some(100));
    assert_eq!(manager.collect_usage().tables.len(), 1);

    // A second election fully stops the first scheduler before starting the
    // next one.
    let first_status = first.subscribe();
    manager.become_master().await?;
    assert_eq!(first_status.borrow().state, SchedulerState::Stopped);
    assert!(!first.request_update());
    let second = manager.scheduler().context("scheduler")?;
    assert!(!Arc::ptr_eq(&first, &second));
    second.wait_for_quiescence().await?;
    assert!(!manager.is_busy_maintenance());

    manager.step_down().await?;
    assert!(manager.scheduler().is_none());
    assert!(!second.request_update());
    manager.shutdown().await?;
    Ok(())
}

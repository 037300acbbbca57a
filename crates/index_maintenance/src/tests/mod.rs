use std::{
    sync::Arc,
    time::Duration,
};

use crate::{
    barrier::OperationBarrier,
    config::MaintenanceConfig,
    context::{
        MaintenanceContext,
        MaintenanceServices,
    },
    migration::{
        BusyMaintenance,
        MigrationTracker,
    },
    permits::MaintenancePermits,
    reconcile::Reconciler,
    runtime::testing::TestRuntime,
    schema::{
        IndexSchema,
        SchemaRegistry,
        SchemaSnapshot,
        TableSchema,
    },
    state::{
        InMemoryStateStore,
        MaintenanceStateModel,
    },
    testing::InMemoryPartitionStore,
    throttle::ResourceTracker,
    types::{
        IndexName,
        PartitionId,
        SchemaSeq,
        TableId,
        TableName,
    },
};

mod scheduler;
mod throttle;

pub(crate) const USERS: TableId = TableId(1);
pub(crate) const EVENTS: TableId = TableId(2);

pub(crate) fn users_by_email() -> IndexName {
    IndexName::new(TableName::new("users"), "by_email")
}

pub(crate) fn events_by_kind() -> IndexName {
    IndexName::new(TableName::new("events"), "by_kind")
}

pub(crate) fn table(id: TableId, name: &str) -> TableSchema {
    TableSchema {
        id,
        name: TableName::new(name),
        parent: None,
        limits: None,
    }
}

pub(crate) fn building(name: IndexName, table: TableId) -> IndexSchema {
    IndexSchema {
        name,
        table,
        ready: false,
    }
}

/// Schema at sequence 1 with `users` and `events`, and no indexes.
pub(crate) fn base_schema() -> SchemaSnapshot {
    SchemaSnapshot::new(SchemaSeq(1))
        .with_table(table(USERS, "users"))
        .with_table(table(EVENTS, "events"))
}

pub(crate) fn test_config() -> MaintenanceConfig {
    MaintenanceConfig {
        populate_batch_size: 2,
        clean_secondary_batch_size: 2,
        short_retry: Duration::from_millis(100),
        long_retry: Duration::from_secs(1),
        very_long_retry: Duration::from_secs(5),
        permit_timeout: Duration::from_secs(1),
        permits: 2,
        corruption_retry_limit: 3,
        enabled: true,
        ..MaintenanceConfig::default()
    }
}

/// One storage node's worth of in-memory collaborators.
pub(crate) struct TestNode {
    pub rt: TestRuntime,
    pub config: MaintenanceConfig,
    pub schema: Arc<SchemaRegistry>,
    pub migration: Arc<MigrationTracker>,
    pub store: Arc<InMemoryPartitionStore>,
    pub state_store: Arc<InMemoryStateStore>,
    pub services: MaintenanceServices,
}

impl TestNode {
    pub fn new(owned: impl IntoIterator<Item = u32>, schema: SchemaSnapshot) -> Self {
        cmd_util::env::config_test();
        let rt = TestRuntime::new();
        let config = test_config();
        let busy = BusyMaintenance::new();
        let migration = Arc::new(MigrationTracker::new(
            owned.into_iter().map(PartitionId),
            busy.clone(),
        ));
        let store = Arc::new(InMemoryPartitionStore::new(migration.clone()));
        let state_store = Arc::new(InMemoryStateStore::new());
        let services = MaintenanceServices {
            store: store.clone(),
            interlock: migration.clone(),
            state_store: state_store.clone(),
            tracker: Arc::new(ResourceTracker::new(config.throttle.clone())),
            permits: MaintenancePermits::new(config.permits),
            busy,
            barrier: OperationBarrier::new(),
        };
        Self {
            rt,
            config,
            schema: Arc::new(SchemaRegistry::new(schema)),
            migration,
            store,
            state_store,
            services,
        }
    }

    pub fn context(&self) -> Arc<MaintenanceContext<TestRuntime>> {
        self.context_with(self.services.clone())
    }

    pub fn context_with(
        &self,
        services: MaintenanceServices,
    ) -> Arc<MaintenanceContext<TestRuntime>> {
        Arc::new(MaintenanceContext::new(
            self.rt.clone(),
            self.config.clone(),
            services,
        ))
    }

    pub fn reconciler(&self, ctx: &Arc<MaintenanceContext<TestRuntime>>) -> Reconciler<TestRuntime> {
        Reconciler::new(ctx.clone(), self.schema.clone())
    }

    pub fn state(&self) -> MaintenanceStateModel {
        MaintenanceStateModel::new(self.state_store.clone())
    }

    /// Commit the next schema built from the visible one.
    pub fn update_schema(&self, f: impl FnOnce(SchemaSnapshot) -> SchemaSnapshot) -> anyhow::Result<()> {
        let next = f(self.schema.current().next());
        self.schema.apply(next)?;
        Ok(())
    }

    /// Write `per_partition` users into each of `partitions`, each with a
    /// distinct email.
    pub fn write_users(&self, partitions: &[u32], per_partition: usize) {
        for p in partitions {
            for i in 0..per_partition {
                self.store.put_row(
                    PartitionId(*p),
                    USERS,
                    format!("user{i:03}").as_bytes(),
                    format!("p{p}-user{i}@example.com").as_bytes(),
                );
            }
        }
    }
}

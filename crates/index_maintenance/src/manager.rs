//! Ties the scheduler's lifetime to this node's replica role. Only a master
//! runs maintenance, and a new scheduler never starts before the previous
//! one has fully stopped.

use std::{
    sync::Arc,
    time::SystemTime,
};

use parking_lot::Mutex;

use crate::{
    config::MaintenanceConfig,
    context::MaintenanceServices,
    runtime::{
        Runtime,
        SpawnHandle,
    },
    scheduler::MaintenanceScheduler,
    schema::SchemaRegistry,
    shutdown::ShutdownSignal,
    state::MaintenanceStateModel,
    throttle::{
        ClusterUsageRecord,
        ResourceCollector,
        TableUsageReport,
    },
    types::{
        IndexName,
        TableId,
    },
};

pub struct MaintenanceManager<RT: Runtime> {
    rt: RT,
    config: MaintenanceConfig,
    schema: Arc<SchemaRegistry>,
    services: MaintenanceServices,
    state: MaintenanceStateModel,
    shutdown_signal: ShutdownSignal,
    scheduler: Arc<Mutex<Option<Arc<MaintenanceScheduler<RT>>>>>,
    role_change: tokio::sync::Mutex<()>,
    schema_listener: Mutex<Option<SpawnHandle>>,
}

impl<RT: Runtime> MaintenanceManager<RT> {
    /// Start following schema commits. Every committed schema is pushed into
    /// the rate tracker and wakes the scheduler, if one is running.
    pub fn new(
        rt: RT,
        config: MaintenanceConfig,
        schema: Arc<SchemaRegistry>,
        services: MaintenanceServices,
        shutdown_signal: ShutdownSignal,
    ) -> Self {
        let scheduler: Arc<Mutex<Option<Arc<MaintenanceScheduler<RT>>>>> =
            Arc::new(Mutex::new(None));
        services
            .tracker
            .update_schema(&schema.current(), rt.system_time());

        let listener = {
            let mut schema_rx = schema.subscribe();
            let tracker = services.tracker.clone();
            let scheduler = scheduler.clone();
            let rt_ = rt.clone();
            rt.spawn("index_maintenance_schema_listener", async move {
                while schema_rx.changed().await.is_ok() {
                    let snapshot = schema_rx.borrow_and_update().clone();
                    tracker.update_schema(&snapshot, rt_.system_time());
                    let current = scheduler.lock().clone();
                    if let Some(current) = current {
                        current.request_update();
                    }
                }
            })
        };

        Self {
            state: MaintenanceStateModel::new(services.state_store.clone()),
            rt,
            config,
            schema,
            services,
            shutdown_signal,
            scheduler,
            role_change: tokio::sync::Mutex::new(()),
            schema_listener: Mutex::new(Some(listener)),
        }
    }

    /// Start a scheduler for this node, stopping any previous one first.
    pub async fn become_master(&self) -> anyhow::Result<()> {
        let _role_change = self.role_change.lock().await;
        let previous = self.scheduler.lock().take();
        if let Some(previous) = previous {
            previous.shutdown().await?;
        }
        let scheduler = Arc::new(MaintenanceScheduler::new(
            self.rt.clone(),
            self.config.clone(),
            self.schema.clone(),
            self.services.clone(),
            self.shutdown_signal.clone(),
        ));
        scheduler.start();
        *self.scheduler.lock() = Some(scheduler);
        tracing::info!("Became master, index maintenance started");
        Ok(())
    }

    pub async fn step_down(&self) -> anyhow::Result<()> {
        let _role_change = self.role_change.lock().await;
        let previous = self.scheduler.lock().take();
        if let Some(previous) = previous {
            previous.shutdown().await?;
            tracing::info!("Stepped down, index maintenance stopped");
        }
        Ok(())
    }

    /// Stop maintenance and stop following schema commits.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.step_down().await?;
        let listener = self.schema_listener.lock().take();
        if let Some(listener) = listener {
            crate::runtime::shutdown_and_join(listener).await?;
        }
        Ok(())
    }

    pub fn scheduler(&self) -> Option<Arc<MaintenanceScheduler<RT>>> {
        self.scheduler.lock().clone()
    }

    pub async fn add_index_complete(&self, index: &IndexName) -> anyhow::Result<bool> {
        self.state
            .index_build_complete(&self.schema.current(), index)
            .await
    }

    pub async fn remove_table_data_complete(&self, table: TableId) -> anyhow::Result<bool> {
        self.state
            .table_data_removed(&self.schema.current(), table)
            .await
    }

    pub fn get_resource_collector(&self, table: TableId) -> Option<Arc<ResourceCollector>> {
        self.services.tracker.get_resource_collector(table)
    }

    pub fn collect_usage(&self) -> ClusterUsageRecord {
        self.services.tracker.collect_usage(self.rt.system_time())
    }

    pub fn report(&self, reports: &[TableUsageReport]) {
        self.services.tracker.report(reports, self.now());
    }

    pub fn is_busy_maintenance(&self) -> bool {
        self.services.busy.is_busy()
    }

    fn now(&self) -> SystemTime {
        self.rt.system_time()
    }
}

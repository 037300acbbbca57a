use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;

use crate::{
    barrier::OperationBarrier,
    config::MaintenanceConfig,
    migration::{
        BusyMaintenance,
        MigrationInterlock,
    },
    permits::MaintenancePermits,
    runtime::Runtime,
    state::{
        MaintenanceStateModel,
        MaintenanceStateStore,
    },
    store::{
        IndexHandle,
        PartitionStore,
    },
    throttle::ResourceTracker,
    types::IndexName,
};

/// Result of one step of a maintenance operation.
#[derive(Debug)]
pub enum Outcome {
    /// One batch committed. Call again.
    Progress,
    /// Nothing can be done before `delay` elapses.
    Retry(Duration),
    /// Handles must be reconciled before any operation continues.
    Restart,
    /// No outstanding work.
    Done,
    Fatal(anyhow::Error),
}

/// Read-only view of the open index handles handed to operations for one
/// pass. Only reconciliation replaces it.
pub type HandleSnapshot = Arc<BTreeMap<IndexName, Arc<dyn IndexHandle>>>;

/// Collaborators shared by the scheduler and its operations. Built once per
/// node and reused across schedulers.
#[derive(Clone)]
pub struct MaintenanceServices {
    pub store: Arc<dyn PartitionStore>,
    pub interlock: Arc<dyn MigrationInterlock>,
    pub state_store: Arc<dyn MaintenanceStateStore>,
    pub tracker: Arc<ResourceTracker>,
    pub permits: MaintenancePermits,
    pub busy: BusyMaintenance,
    pub barrier: OperationBarrier,
}

/// Work requested from outside the scheduler task and picked up by the next
/// reconciliation.
#[derive(Default)]
pub(crate) struct PendingRequests {
    resets: Mutex<BTreeSet<IndexName>>,
    cleaning_epoch: AtomicU64,
}

impl PendingRequests {
    /// Returns false if a reset for `index` was already queued.
    pub fn request_reset(&self, index: IndexName) -> bool {
        self.resets.lock().insert(index)
    }

    pub fn resets(&self) -> BTreeSet<IndexName> {
        self.resets.lock().clone()
    }

    pub fn has_resets(&self) -> bool {
        !self.resets.lock().is_empty()
    }

    pub fn complete_reset(&self, index: &IndexName) {
        self.resets.lock().remove(index);
    }

    pub fn request_cleaning(&self) {
        self.cleaning_epoch.fetch_add(1, Ordering::SeqCst);
    }

    pub fn cleaning_epoch(&self) -> u64 {
        self.cleaning_epoch.load(Ordering::SeqCst)
    }
}

pub(crate) struct MaintenanceContext<RT: Runtime> {
    pub rt: RT,
    pub config: MaintenanceConfig,
    pub store: Arc<dyn PartitionStore>,
    pub interlock: Arc<dyn MigrationInterlock>,
    pub state: MaintenanceStateModel,
    pub tracker: Arc<ResourceTracker>,
    pub permits: MaintenancePermits,
    pub busy: BusyMaintenance,
    pub barrier: OperationBarrier,
    pub requests: PendingRequests,
}

impl<RT: Runtime> MaintenanceContext<RT> {
    pub fn new(rt: RT, config: MaintenanceConfig, services: MaintenanceServices) -> Self {
        Self {
            rt,
            config,
            store: services.store,
            interlock: services.interlock,
            state: MaintenanceStateModel::new(services.state_store),
            tracker: services.tracker,
            permits: services.permits,
            busy: services.busy,
            barrier: services.barrier,
            requests: PendingRequests::default(),
        }
    }
}

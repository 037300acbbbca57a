//! Background maintenance of secondary indexes and dropped-table data on a
//! storage node, plus the per-table throughput and size limits enforced on
//! the request path.

mod barrier;
mod clean_primary;
mod clean_secondary;
pub mod config;
mod context;
pub mod knobs;
mod manager;
mod metrics;
pub mod migration;
mod permits;
mod populate;
mod reconcile;
pub mod retry;
pub mod runtime;
mod scheduler;
pub mod schema;
pub mod shutdown;
pub mod state;
pub mod store;
pub mod throttle;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
#[cfg(test)]
mod tests;

pub use barrier::{
    OperationBarrier,
    OperationPin,
};
pub use config::{
    MaintenanceConfig,
    ThrottleConfig,
};
pub use context::{
    MaintenanceServices,
    Outcome,
};
pub use manager::MaintenanceManager;
pub use migration::{
    BusyMaintenance,
    MigrationInterlock,
    MigrationTracker,
};
pub use permits::MaintenancePermits;
pub use scheduler::{
    MaintenanceOp,
    MaintenanceScheduler,
    SchedulerState,
    SchedulerStatus,
};
pub use schema::{
    SchemaRegistry,
    SchemaSnapshot,
};
pub use shutdown::{
    ShutdownMessage,
    ShutdownSignal,
};
pub use throttle::{
    OperationKind,
    ResourceCollector,
    ResourceTracker,
};

use std::time::Duration;

use crate::knobs::{
    CLEAN_SECONDARY_BATCH_SIZE,
    ENABLE_INDEX_MAINTENANCE,
    INDEX_CORRUPTION_RETRY_LIMIT,
    LOAD_SIGNAL_MAX_STALENESS,
    MAINTENANCE_LONG_RETRY,
    MAINTENANCE_PERMITS,
    MAINTENANCE_PERMIT_TIMEOUT,
    MAINTENANCE_SHORT_RETRY,
    MAINTENANCE_VERY_LONG_RETRY,
    POPULATE_BATCH_SIZE,
    RATE_BUCKET_COUNT,
    RATE_CAP_VALIDITY,
    RATE_MIN_CAP_KB,
};

/// Snapshot of the maintenance knobs. `Default` reads the process-wide knobs;
/// tests and embedders override individual fields.
#[derive(Clone, Debug)]
pub struct MaintenanceConfig {
    pub populate_batch_size: usize,
    pub clean_secondary_batch_size: usize,
    pub throttle: ThrottleConfig,
    pub short_retry: Duration,
    pub long_retry: Duration,
    pub very_long_retry: Duration,
    pub permit_timeout: Duration,
    pub permits: usize,
    /// 0 disables the ceiling.
    pub corruption_retry_limit: u32,
    pub enabled: bool,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            populate_batch_size: *POPULATE_BATCH_SIZE,
            clean_secondary_batch_size: *CLEAN_SECONDARY_BATCH_SIZE,
            throttle: ThrottleConfig::default(),
            short_retry: *MAINTENANCE_SHORT_RETRY,
            long_retry: *MAINTENANCE_LONG_RETRY,
            very_long_retry: *MAINTENANCE_VERY_LONG_RETRY,
            permit_timeout: *MAINTENANCE_PERMIT_TIMEOUT,
            permits: *MAINTENANCE_PERMITS,
            corruption_retry_limit: *INDEX_CORRUPTION_RETRY_LIMIT,
            enabled: *ENABLE_INDEX_MAINTENANCE,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ThrottleConfig {
    pub cap_validity: Duration,
    pub min_cap_kb: u64,
    pub bucket_count: usize,
    pub load_max_staleness: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            cap_validity: *RATE_CAP_VALIDITY,
            min_cap_kb: *RATE_MIN_CAP_KB,
            bucket_count: (*RATE_BUCKET_COUNT).max(1),
            load_max_staleness: *LOAD_SIGNAL_MAX_STALENESS,
        }
    }
}

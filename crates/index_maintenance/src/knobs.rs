//! Tunable limits and parameters for secondary index maintenance.
//!
//! Every knob can be overridden with an environment variable of the name
//! passed to `env_config`. Each one documents its unit and safe range so an
//! oncall engineer can adjust it on a live node.
#![deny(missing_docs)]

use std::{
    sync::LazyLock,
    time::Duration,
};

use cmd_util::env::env_config;

/// Number of primary keys scanned per secondary population batch. Larger
/// batches finish a build sooner but hold the admission permit longer.
pub static POPULATE_BATCH_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("INDEX_POPULATE_BATCH_SIZE", 500));

/// Number of index entries inspected per secondary cleaning batch.
pub static CLEAN_SECONDARY_BATCH_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("INDEX_CLEAN_SECONDARY_BATCH_SIZE", 100));

/// How long a locally computed read/write cap stays valid before it is
/// recomputed from the latest topology and load signal.
pub static RATE_CAP_VALIDITY: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("RATE_CAP_VALIDITY_SECS", 7)));

/// Floor for every computed throughput cap, in KB/s. Keeps a table usable
/// on a heavily fanned-out cluster.
pub static RATE_MIN_CAP_KB: LazyLock<u64> = LazyLock::new(|| env_config("RATE_MIN_CAP_KB", 2));

/// Number of one-second buckets in each table's rate ring.
pub static RATE_BUCKET_COUNT: LazyLock<usize> =
    LazyLock::new(|| env_config("RATE_BUCKET_COUNT", 10));

/// A cluster load sample older than this is ignored and the node falls back
/// to its fair share of each limit.
pub static LOAD_SIGNAL_MAX_STALENESS: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("LOAD_SIGNAL_MAX_STALENESS_SECS", 30)));

/// Retry delay after a lock conflict or an index whose table is not yet
/// available.
pub static MAINTENANCE_SHORT_RETRY: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("MAINTENANCE_SHORT_RETRY_MS", 100)));

/// Retry delay while the store is overloaded or this replica is not master.
pub static MAINTENANCE_LONG_RETRY: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("MAINTENANCE_LONG_RETRY_MS", 1000)));

/// Retry delay while the node is short on disk space.
pub static MAINTENANCE_VERY_LONG_RETRY: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_millis(env_config("MAINTENANCE_VERY_LONG_RETRY_MS", 10_000))
});

/// How long a population batch waits for a node-wide admission permit before
/// proceeding without one.
pub static MAINTENANCE_PERMIT_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("MAINTENANCE_PERMIT_TIMEOUT_MS", 1000)));

/// Size of the node-wide admission budget shared by background housekeeping.
pub static MAINTENANCE_PERMITS: LazyLock<usize> =
    LazyLock::new(|| env_config("MAINTENANCE_PERMITS", 4));

/// Number of corruption-triggered rebuilds after which an index is marked
/// permanently failed. 0 means rebuild forever.
pub static INDEX_CORRUPTION_RETRY_LIMIT: LazyLock<u32> =
    LazyLock::new(|| env_config("INDEX_CORRUPTION_RETRY_LIMIT", 0));

/// Kill switch for the maintenance scheduler. When false, `start` logs and
/// leaves the scheduler stopped.
pub static ENABLE_INDEX_MAINTENANCE: LazyLock<bool> =
    LazyLock::new(|| env_config("INDEX_MAINTENANCE_ENABLE", true));

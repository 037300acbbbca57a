use metrics::{
    log_counter,
    log_counter_with_labels,
    log_gauge,
    register_maintenance_counter,
    register_maintenance_gauge,
    register_maintenance_histogram,
    StaticMetricLabel,
    StatusTimer,
    Timer,
    STATUS_LABEL,
};

use crate::{
    retry::RetryTier,
    throttle::OperationKind,
};

register_maintenance_gauge!(
    INDEX_MAINTENANCE_POPULATING_INDEXES,
    "Number of secondary indexes waiting on population"
);
pub fn log_num_indexes_populating(num_indexes: usize) {
    log_gauge(&INDEX_MAINTENANCE_POPULATING_INDEXES, num_indexes as f64);
}

register_maintenance_counter!(
    INDEX_MAINTENANCE_POPULATED_ROWS,
    "Number of primary rows fed into secondary index population"
);
pub fn log_rows_populated(rows: usize) {
    log_counter(&INDEX_MAINTENANCE_POPULATED_ROWS, rows as u64);
}

register_maintenance_counter!(
    INDEX_MAINTENANCE_INDEXES_POPULATED_TOTAL,
    "Number of secondary indexes that finished population"
);
pub fn log_index_populated() {
    log_counter(&INDEX_MAINTENANCE_INDEXES_POPULATED_TOTAL, 1);
}

register_maintenance_histogram!(
    INDEX_MAINTENANCE_POPULATE_BATCH_SECONDS,
    "Time to scan, read and index one population batch"
);
pub fn populate_batch_timer() -> Timer {
    Timer::new(&INDEX_MAINTENANCE_POPULATE_BATCH_SECONDS)
}

register_maintenance_counter!(
    INDEX_MAINTENANCE_CLEANED_ENTRIES,
    "Number of stale secondary index entries removed"
);
pub fn log_entries_cleaned(entries: usize) {
    log_counter(&INDEX_MAINTENANCE_CLEANED_ENTRIES, entries as u64);
}

register_maintenance_counter!(
    INDEX_MAINTENANCE_EXTINGUISHED_TABLES,
    "Number of dropped tables whose records were extinguished"
);
pub fn log_table_extinguished() {
    log_counter(&INDEX_MAINTENANCE_EXTINGUISHED_TABLES, 1);
}

register_maintenance_counter!(
    INDEX_MAINTENANCE_CORRUPTION_RESETS_TOTAL,
    "Number of secondary index rebuilds triggered by corruption"
);
pub fn log_corruption_reset() {
    log_counter(&INDEX_MAINTENANCE_CORRUPTION_RESETS_TOTAL, 1);
}

register_maintenance_counter!(
    INDEX_MAINTENANCE_PERMANENT_FAILURES_TOTAL,
    "Number of secondary indexes whose population failed permanently"
);
pub fn log_permanent_failure() {
    log_counter(&INDEX_MAINTENANCE_PERMANENT_FAILURES_TOTAL, 1);
}

register_maintenance_counter!(
    INDEX_MAINTENANCE_UNAVAILABLE_TABLE_SKIPS_TOTAL,
    "Number of population attempts skipped because the index handle was not open"
);
pub fn log_unavailable_table_skip() {
    log_counter(&INDEX_MAINTENANCE_UNAVAILABLE_TABLE_SKIPS_TOTAL, 1);
}

register_maintenance_counter!(
    INDEX_MAINTENANCE_PERMIT_TIMEOUTS_TOTAL,
    "Number of population batches that ran without an admission permit"
);
pub fn log_permit_timeout() {
    log_counter(&INDEX_MAINTENANCE_PERMIT_TIMEOUTS_TOTAL, 1);
}

register_maintenance_counter!(
    INDEX_MAINTENANCE_THROTTLED_OPERATIONS,
    "Number of operations rejected by a table's resource limits",
    &["kind"]
);
pub fn log_operation_throttled(kind: OperationKind) {
    log_counter_with_labels(
        &INDEX_MAINTENANCE_THROTTLED_OPERATIONS,
        1,
        vec![StaticMetricLabel::new("kind", kind.as_label())],
    );
}

register_maintenance_counter!(
    INDEX_MAINTENANCE_RETRIES,
    "Number of maintenance steps retried after a transient fault",
    &["tier"]
);
pub fn log_retry(tier: RetryTier) {
    log_counter_with_labels(
        &INDEX_MAINTENANCE_RETRIES,
        1,
        vec![StaticMetricLabel::new("tier", tier.as_label())],
    );
}

register_maintenance_histogram!(
    INDEX_MAINTENANCE_RECONCILE_SECONDS,
    "Time to reconcile persisted maintenance state against the schema",
    &STATUS_LABEL
);
pub fn reconcile_timer() -> StatusTimer {
    StatusTimer::new(&INDEX_MAINTENANCE_RECONCILE_SECONDS)
}

use metrics::register_maintenance_counter;

register_maintenance_counter!(pub LOCK_CONFLICT_TOTAL, "Count of lock conflicts on maintenance records");
register_maintenance_counter!(pub INDEX_CORRUPTION_ERROR_TOTAL, "Count of index corruption errors");
register_maintenance_counter!(pub THROUGHPUT_LIMIT_ERROR_TOTAL, "Count of read or write throttling errors");
register_maintenance_counter!(pub SIZE_LIMIT_ERROR_TOTAL, "Count of table or shard key size limit errors");
register_maintenance_counter!(pub ACCESS_DENIED_ERROR_TOTAL, "Count of table access errors");

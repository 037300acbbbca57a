use std::borrow::Cow;

use prometheus::IntCounter;

mod metrics;

/// ErrorMetadata object can be attached to an anyhow error chain via
/// `.context(e /*ErrorMetadata*/)`. It is a generic object to be used
/// across the codebase to tag errors with information that is used to classify.
///
/// The msg is conveyed as a user facing error message if it makes it to the
/// caller of a checked operation.
///
/// The short_msg is used as a tag - available for tests and for metrics
/// logging - to have a message that is resilient to changes in copy.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    /// The error code associated with this ErrorMetadata
    pub code: ErrorCode,
    /// short ScreamingCamelCase. Usable in tests for string matching
    /// w/ a standard test helper.
    /// Eg WriteThrottled
    pub short_msg: Cow<'static, str>,
    /// human readable - operator or developer facing. Should be longer and
    /// descriptive.
    pub msg: Cow<'static, str>,
}

#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadRequest,
    NotFound,

    // Transient environment faults. Retried by the maintenance scheduler.
    OCC,
    Overloaded,
    NotMaster,
    InsufficientDiskSpace,

    // Secondary index maintenance faults.
    IndexCorrupted,
    TableUnavailable,
    PartitionNotOwned,

    // Resource limit faults, surfaced to the caller of a checked operation.
    ReadThrottled,
    WriteThrottled,
    TableSizeLimitExceeded,
    PartitionSizeLimitExceeded,
    ReadAccessDenied,
    WriteAccessDenied,

    OperationalInternalServerError,
}

impl ErrorMetadata {
    /// Bad Request. The caller asked for something that can never succeed.
    ///
    /// The short_msg should be a CapitalCamelCased describing the error.
    /// The msg should be a descriptive message targeted toward the operator.
    pub fn bad_request(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::BadRequest,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Resource not found.
    pub fn not_found(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::NotFound,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Operational Internal Server Error
    ///
    /// Produces a very general error message. Should be used in situations
    /// where the error is caused by a known operational source of downtime.
    pub fn operational_internal_server_error() -> Self {
        Self {
            code: ErrorCode::OperationalInternalServerError,
            short_msg: INTERNAL_SERVER_ERROR.into(),
            msg: INTERNAL_SERVER_ERROR_MSG.into(),
        }
    }

    /// The storage layer is temporarily unable to serve the request (e.g.
    /// replication lag, environment restarting). Safe to retry later.
    pub fn overloaded(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Overloaded,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Optimistic Concurrency Control / lock conflict on a system record.
    pub fn system_occ() -> Self {
        Self {
            code: ErrorCode::OCC,
            short_msg: OCC_ERROR.into(),
            msg: OCC_ERROR_MSG.into(),
        }
    }

    /// The local replica is not (or no longer) the master of its shard, so
    /// it may not write.
    pub fn not_master() -> Self {
        Self {
            code: ErrorCode::NotMaster,
            short_msg: NOT_MASTER_ERROR.into(),
            msg: NOT_MASTER_ERROR_MSG.into(),
        }
    }

    /// Writes are refused because the node is low on disk space.
    pub fn insufficient_disk_space(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::InsufficientDiskSpace,
            short_msg: "InsufficientDiskSpace".into(),
            msg: msg.into(),
        }
    }

    /// A secondary index was found to be corrupt while it was being built or
    /// read. The index must be reset and rebuilt from primary data.
    pub fn index_corrupted(index: impl std::fmt::Display, detail: impl std::fmt::Display) -> Self {
        Self {
            code: ErrorCode::IndexCorrupted,
            short_msg: "IndexCorrupted".into(),
            msg: format!("Secondary index {index} is corrupt: {detail}").into(),
        }
    }

    /// The table or index handle is not yet (or no longer) available on this
    /// node, typically right after a schema change.
    pub fn table_unavailable(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::TableUnavailable,
            short_msg: "TableUnavailable".into(),
            msg: msg.into(),
        }
    }

    /// The partition moved off this node while it was being scanned.
    pub fn partition_not_owned(partition: impl std::fmt::Display) -> Self {
        Self {
            code: ErrorCode::PartitionNotOwned,
            short_msg: "PartitionNotOwned".into(),
            msg: format!("Partition {partition} is not owned by this node").into(),
        }
    }

    pub fn read_throttled(table: impl std::fmt::Display, used_kb: u64, cap_kb: u64) -> Self {
        Self {
            code: ErrorCode::ReadThrottled,
            short_msg: "ReadThrottled".into(),
            msg: format!(
                "Read throughput for table {table} is {used_kb} KB/s, exceeding the current \
                 limit of {cap_kb} KB/s. Retry with backoff or raise the table's read limit."
            )
            .into(),
        }
    }

    pub fn write_throttled(table: impl std::fmt::Display, used_kb: u64, cap_kb: u64) -> Self {
        Self {
            code: ErrorCode::WriteThrottled,
            short_msg: "WriteThrottled".into(),
            msg: format!(
                "Write throughput for table {table} is {used_kb} KB/s, exceeding the current \
                 limit of {cap_kb} KB/s. Retry with backoff or raise the table's write limit."
            )
            .into(),
        }
    }

    pub fn table_size_limit_exceeded(
        table: impl std::fmt::Display,
        size_bytes: u64,
        limit_bytes: u64,
    ) -> Self {
        Self {
            code: ErrorCode::TableSizeLimitExceeded,
            short_msg: "TableSizeLimitExceeded".into(),
            msg: format!(
                "Table {table} is {size_bytes} bytes, over its size limit of {limit_bytes} \
                 bytes. Delete data or raise the limit."
            )
            .into(),
        }
    }

    pub fn partition_size_limit_exceeded(
        table: impl std::fmt::Display,
        partition: impl std::fmt::Display,
    ) -> Self {
        Self {
            code: ErrorCode::PartitionSizeLimitExceeded,
            short_msg: "PartitionSizeLimitExceeded".into(),
            msg: format!(
                "Shard key size limit exceeded for table {table} in partition {partition}. \
                 Delete data under this shard key or raise the limit."
            )
            .into(),
        }
    }

    pub fn read_access_denied(table: impl std::fmt::Display) -> Self {
        Self {
            code: ErrorCode::ReadAccessDenied,
            short_msg: "ReadAccessDenied".into(),
            msg: format!("Reads are disabled for table {table}").into(),
        }
    }

    pub fn write_access_denied(table: impl std::fmt::Display) -> Self {
        Self {
            code: ErrorCode::WriteAccessDenied,
            short_msg: "WriteAccessDenied".into(),
            msg: format!("Writes are disabled for table {table}").into(),
        }
    }

    pub fn is_occ(&self) -> bool {
        self.code == ErrorCode::OCC
    }

    pub fn is_overloaded(&self) -> bool {
        self.code == ErrorCode::Overloaded
    }

    pub fn is_not_master(&self) -> bool {
        self.code == ErrorCode::NotMaster
    }

    pub fn is_disk_limit(&self) -> bool {
        self.code == ErrorCode::InsufficientDiskSpace
    }

    pub fn is_index_corrupted(&self) -> bool {
        self.code == ErrorCode::IndexCorrupted
    }

    pub fn is_table_unavailable(&self) -> bool {
        self.code == ErrorCode::TableUnavailable
    }

    pub fn is_partition_not_owned(&self) -> bool {
        self.code == ErrorCode::PartitionNotOwned
    }

    pub fn is_bad_request(&self) -> bool {
        self.code == ErrorCode::BadRequest
    }

    /// Environment faults that go away on their own. The scheduler sleeps and
    /// retries the current step; they are never surfaced.
    pub fn is_transient(&self) -> bool {
        match self.code {
            ErrorCode::OCC
            | ErrorCode::Overloaded
            | ErrorCode::NotMaster
            | ErrorCode::InsufficientDiskSpace => true,
            ErrorCode::BadRequest
            | ErrorCode::NotFound
            | ErrorCode::IndexCorrupted
            | ErrorCode::TableUnavailable
            | ErrorCode::PartitionNotOwned
            | ErrorCode::ReadThrottled
            | ErrorCode::WriteThrottled
            | ErrorCode::TableSizeLimitExceeded
            | ErrorCode::PartitionSizeLimitExceeded
            | ErrorCode::ReadAccessDenied
            | ErrorCode::WriteAccessDenied
            | ErrorCode::OperationalInternalServerError => false,
        }
    }

    /// Faults raised synchronously to the caller of a checked operation.
    /// Each is actionable by the user (back off, delete data, raise a limit).
    pub fn is_resource_limit(&self) -> bool {
        match self.code {
            ErrorCode::ReadThrottled
            | ErrorCode::WriteThrottled
            | ErrorCode::TableSizeLimitExceeded
            | ErrorCode::PartitionSizeLimitExceeded
            | ErrorCode::ReadAccessDenied
            | ErrorCode::WriteAccessDenied => true,
            ErrorCode::BadRequest
            | ErrorCode::NotFound
            | ErrorCode::OCC
            | ErrorCode::Overloaded
            | ErrorCode::NotMaster
            | ErrorCode::InsufficientDiskSpace
            | ErrorCode::IndexCorrupted
            | ErrorCode::TableUnavailable
            | ErrorCode::PartitionNotOwned
            | ErrorCode::OperationalInternalServerError => false,
        }
    }

    pub fn custom_metric(&self) -> Option<&'static IntCounter> {
        match self.code {
            ErrorCode::OCC => Some(&crate::metrics::LOCK_CONFLICT_TOTAL),
            ErrorCode::IndexCorrupted => Some(&crate::metrics::INDEX_CORRUPTION_ERROR_TOTAL),
            ErrorCode::ReadThrottled | ErrorCode::WriteThrottled => {
                Some(&crate::metrics::THROUGHPUT_LIMIT_ERROR_TOTAL)
            },
            ErrorCode::TableSizeLimitExceeded | ErrorCode::PartitionSizeLimitExceeded => {
                Some(&crate::metrics::SIZE_LIMIT_ERROR_TOTAL)
            },
            ErrorCode::ReadAccessDenied | ErrorCode::WriteAccessDenied => {
                Some(&crate::metrics::ACCESS_DENIED_ERROR_TOTAL)
            },
            ErrorCode::BadRequest
            | ErrorCode::NotFound
            | ErrorCode::Overloaded
            | ErrorCode::NotMaster
            | ErrorCode::InsufficientDiskSpace
            | ErrorCode::TableUnavailable
            | ErrorCode::PartitionNotOwned
            | ErrorCode::OperationalInternalServerError => None,
        }
    }
}

pub trait ErrorMetadataAnyhowExt {
    fn is_occ(&self) -> bool;
    fn is_overloaded(&self) -> bool;
    fn is_not_master(&self) -> bool;
    fn is_disk_limit(&self) -> bool;
    fn is_index_corrupted(&self) -> bool;
    fn is_table_unavailable(&self) -> bool;
    fn is_partition_not_owned(&self) -> bool;
    fn is_bad_request(&self) -> bool;
    fn is_transient(&self) -> bool;
    fn is_resource_limit(&self) -> bool;
    fn short_msg(&self) -> &str;
    fn msg(&self) -> &str;
    fn error_code(&self) -> Option<ErrorCode>;
    fn log_custom_metric(&self);
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    /// Returns true if error is tagged as OCC
    fn is_occ(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_occ();
        }
        false
    }

    /// Returns true if error is tagged as Overloaded
    fn is_overloaded(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_overloaded();
        }
        false
    }

    /// Returns true if error is tagged as NotMaster
    fn is_not_master(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_not_master();
        }
        false
    }

    /// Returns true if error is tagged as InsufficientDiskSpace
    fn is_disk_limit(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_disk_limit();
        }
        false
    }

    fn is_index_corrupted(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_index_corrupted();
        }
        false
    }

    fn is_table_unavailable(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_table_unavailable();
        }
        false
    }

    fn is_partition_not_owned(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_partition_not_owned();
        }
        false
    }

    fn is_bad_request(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_bad_request();
        }
        false
    }

    /// Untagged errors are never transient: an unclassified failure is a bug
    /// and should not be retried forever.
    fn is_transient(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_transient();
        }
        false
    }

    fn is_resource_limit(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_resource_limit();
        }
        false
    }

    /// Return the short_msg associated with this Error
    fn short_msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.short_msg;
        }
        INTERNAL_SERVER_ERROR
    }

    /// Return the descriptive msg associated with this Error
    fn msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.msg;
        }
        INTERNAL_SERVER_ERROR_MSG
    }

    fn error_code(&self) -> Option<ErrorCode> {
        self.downcast_ref::<ErrorMetadata>().map(|e| e.code)
    }

    fn log_custom_metric(&self) {
        if let Some(counter) = self
            .downcast_ref::<ErrorMetadata>()
            .and_then(|e| e.custom_metric())
        {
            counter.inc();
        }
    }
}

pub const INTERNAL_SERVER_ERROR_MSG: &str = "Your request couldn't be completed. Try again later.";
pub const INTERNAL_SERVER_ERROR: &str = "InternalServerError";
pub const OCC_ERROR_MSG: &str =
    "A maintenance record was modified concurrently while it was being updated.";
pub const OCC_ERROR: &str = "OptimisticConcurrencyControlFailure";
const NOT_MASTER_ERROR_MSG: &str = "This replica is not the master of its shard.";
const NOT_MASTER_ERROR: &str = "NotMaster";

#[cfg(any(test, feature = "testing"))]
mod proptest {
    use proptest::prelude::*;

    use super::{
        ErrorCode,
        ErrorMetadata,
    };

    impl Arbitrary for ErrorMetadata {
        type Parameters = ();

        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
            any::<ErrorCode>()
                .prop_map(|ec| match ec {
                    ErrorCode::BadRequest => ErrorMetadata::bad_request("bad", "request"),
                    ErrorCode::NotFound => ErrorMetadata::not_found("not", "found"),
                    ErrorCode::OCC => ErrorMetadata::system_occ(),
                    ErrorCode::Overloaded => ErrorMetadata::overloaded("overloaded", "error"),
                    ErrorCode::NotMaster => ErrorMetadata::not_master(),
                    ErrorCode::InsufficientDiskSpace => {
                        ErrorMetadata::insufficient_disk_space("disk")
                    },
                    ErrorCode::IndexCorrupted => ErrorMetadata::index_corrupted("idx", "bad"),
                    ErrorCode::TableUnavailable => ErrorMetadata::table_unavailable("table"),
                    ErrorCode::PartitionNotOwned => ErrorMetadata::partition_not_owned(1),
                    ErrorCode::ReadThrottled => ErrorMetadata::read_throttled("t", 3, 2),
                    ErrorCode::WriteThrottled => ErrorMetadata::write_throttled("t", 3, 2),
                    ErrorCode::TableSizeLimitExceeded => {
                        ErrorMetadata::table_size_limit_exceeded("t", 3, 2)
                    },
                    ErrorCode::PartitionSizeLimitExceeded => {
                        ErrorMetadata::partition_size_limit_exceeded("t", 1)
                    },
                    ErrorCode::ReadAccessDenied => ErrorMetadata::read_access_denied("t"),
                    ErrorCode::WriteAccessDenied => ErrorMetadata::write_access_denied("t"),
                    ErrorCode::OperationalInternalServerError => {
                        ErrorMetadata::operational_internal_server_error()
                    },
                })
                .boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::{
        ErrorCode,
        ErrorMetadata,
        ErrorMetadataAnyhowExt,
        INTERNAL_SERVER_ERROR,
    };

    proptest! {
        #![proptest_config(
            ProptestConfig { failure_persistence: None, ..ProptestConfig::default() }
        )]

        #[test]
        fn test_transient_and_resource_limit_are_disjoint(err in any::<ErrorMetadata>()) {
            assert!(!(err.is_transient() && err.is_resource_limit()));
            // Every user-facing limit fault is counted.
            if err.is_resource_limit() {
                assert!(err.custom_metric().is_some());
            }
        }

        #[test]
        fn test_classification_survives_context(err in any::<ErrorMetadata>()) {
            let code = err.code;
            let transient = err.is_transient();
            let e = anyhow::Error::from(err).context("while running maintenance");
            assert_eq!(e.error_code(), Some(code));
            assert_eq!(e.is_transient(), transient);
        }
    }

    #[test]
    fn test_untagged_error_is_not_transient() {
        let e = anyhow::anyhow!("disk on fire");
        assert!(!e.is_transient());
        assert!(!e.is_resource_limit());
        assert_eq!(e.short_msg(), INTERNAL_SERVER_ERROR);
        assert_eq!(e.error_code(), None);
    }

    #[test]
    fn test_tagged_context() {
        let e = anyhow::anyhow!("lock conflict on maintenance record")
            .context(ErrorMetadata::system_occ());
        assert!(e.is_occ());
        assert!(e.is_transient());
        assert_eq!(e.error_code(), Some(ErrorCode::OCC));
    }
}

//! Failure taxonomy for the ingestion pipeline.
//!
//! Every failure a unit can hit maps onto one of these variants, and the
//! orchestrator's retry policy is driven entirely by [`IngestError::is_retryable`]:
//! transient network/storage faults are retried with backoff, structural
//! faults (stale mapping tables, format changes upstream) are terminal and
//! need a configuration fix instead.

use thiserror::Error;

use crate::models::DataType;

// ---

#[derive(Debug, Error)]
pub enum IngestError {
    /// No profile is registered for the requested operator id.
    #[error("unknown operator `{0}`")]
    UnknownOperator(String),

    /// The operator exists but has no URL template for this data type.
    #[error("operator `{operator}` has no {data_type} template")]
    UnsupportedDataType {
        operator: String,
        data_type: DataType,
    },

    /// The source server answered with a non-2xx status, timed out, or was
    /// unreachable. `status` is `None` for transport-level failures.
    #[error("remote unavailable for {url} (status: {status:?})")]
    RemoteUnavailable { url: String, status: Option<u16> },

    /// The payload claimed to be a ZIP archive but could not be read.
    #[error("archive corrupt: {0}")]
    ArchiveCorrupt(String),

    /// A multi-entry archive with no date-bearing entry names; there is no
    /// defensible way to pick one.
    #[error("ambiguous archive content, entries: {entries:?}")]
    AmbiguousArchiveContent { entries: Vec<String> },

    /// The file's column layout no longer matches the operator's mapping
    /// table. This means the mapping is stale, not that one row is bad.
    #[error("schema mismatch for `{operator}`: expected {expected} columns, found {found}")]
    SchemaMismatch {
        operator: String,
        expected: usize,
        found: usize,
    },

    /// A slot index outside the operator's declared granularity.
    #[error("slot {slot} out of range 1..={max}")]
    SlotOutOfRange { slot: u16, max: u16 },

    /// The storage backend rejected or aborted a batch; the transaction was
    /// rolled back and the same batch can be re-submitted safely.
    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(#[from] sqlx::Error),
}

impl IngestError {
    /// Whether the orchestrator should retry the failed stage with backoff.
    ///
    /// Configuration errors and structural/data-quality errors are never
    /// retried: re-running them cannot change the outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestError::RemoteUnavailable { .. }
                | IngestError::ArchiveCorrupt(_)
                | IngestError::PersistenceUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn transient_failures_are_retryable() {
        // ---
        let remote = IngestError::RemoteUnavailable {
            url: "https://example.jp/a.csv".into(),
            status: Some(503),
        };
        assert!(remote.is_retryable());
        assert!(IngestError::ArchiveCorrupt("truncated".into()).is_retryable());
    }

    #[test]
    fn structural_failures_are_not_retryable() {
        // ---
        assert!(!IngestError::UnknownOperator("nowhere".into()).is_retryable());
        assert!(!IngestError::SchemaMismatch {
            operator: "tepco".into(),
            expected: 20,
            found: 22,
        }
        .is_retryable());
        assert!(!IngestError::SlotOutOfRange { slot: 49, max: 48 }.is_retryable());
        assert!(!IngestError::AmbiguousArchiveContent {
            entries: vec!["a.csv".into(), "b.csv".into()],
        }
        .is_retryable());
    }
}

//! Pipeline error taxonomy.
//!
//! Only [`PipelineError::StoreUnavailable`] is fatal. Row errors are
//! recovered inside the batch, lookup errors inside the fetcher, and file
//! errors at the file boundary of the orchestrator.

use thiserror::Error;

use crate::models::CoordKey;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Mapping or cache backing store unreachable.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A single record failed correction or enrichment.
    #[error("row {row}: {reason}")]
    RowProcessing { row: usize, reason: String },

    #[error("geocode lookup timed out for {0}")]
    LookupTimeout(CoordKey),

    #[error("geocode lookup failed for {coord}: {reason}")]
    LookupTransport { coord: CoordKey, reason: String },

    /// Anything that went wrong while processing or finalizing one input file.
    #[error("failed to process {file}: {reason}")]
    FileProcessing { file: String, reason: String },
}

impl PipelineError {
    pub fn row(row: usize, reason: impl Into<String>) -> Self {
        PipelineError::RowProcessing {
            row,
            reason: reason.into(),
        }
    }

    pub fn store(err: impl std::fmt::Display) -> Self {
        PipelineError::StoreUnavailable(err.to_string())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::StoreUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_store_errors_are_fatal() {
        assert!(PipelineError::store("connection refused").is_fatal());
        assert!(!PipelineError::row(3, "bad date").is_fatal());
        assert_eq!(
            PipelineError::row(3, "bad date").to_string(),
            "row 3: bad date"
        );
    }
}

//! Error taxonomy for the disclosure pipeline.
//!
//! Recoverable conditions (a quarter that was never published, an archive
//! entry that cannot be decoded) are absorbed by the owning stage and only
//! logged; fatal conditions (a missing upstream file, an unreachable
//! registry) propagate out of the stage and end the run with a non-zero
//! exit.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The remote answered non-200 for one quarter. The backward scan
    /// moves on to the previous quarter.
    #[error("archive not available: {url} (status {status})")]
    FetchUnavailable { url: String, status: u16 },

    /// Transport-level failure for one quarter. Treated like "not
    /// available": logged and skipped.
    #[error("network error fetching {url}: {source}")]
    FetchNetworkError {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// No encoding in the configured chain decoded the entry bytes. The
    /// permissive last encoding makes this unreachable in practice.
    #[error("could not decode '{entry}' with any configured encoding")]
    DecodeFailure { entry: String },

    /// No delimiter in the configured chain produced a table with more
    /// than one column.
    #[error("could not parse '{entry}' as delimited text")]
    ParseFailure { entry: String },

    /// Required canonical columns are absent after renaming. The entry is
    /// discarded whole; there are no partial records.
    #[error("'{entry}' is missing required columns: {missing:?}")]
    SchemaMismatch { entry: String, missing: Vec<String> },

    /// Every row of the entry fell outside the monitored expense
    /// categories.
    #[error("'{entry}' has no rows in the monitored categories")]
    NoRelevantRows { entry: String },

    /// A monetary cell parsed under no known convention. Recovered at
    /// the call site by defaulting the amount to 0.0, never propagated
    /// past it.
    #[error("unparseable monetary value: {value:?}")]
    ValueParseFailure { value: String },

    /// A required input from an earlier stage does not exist. Fatal.
    #[error("missing upstream file: {path}")]
    MissingUpstreamFile { path: PathBuf },

    /// The registry could not be discovered, fetched, or understood.
    /// Fatal: enrichment is impossible without identity data.
    #[error("registry unavailable: {reason}")]
    RegistryUnavailable { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("database error: {0}")]
    Sql(#[from] sqlx::Error),
}

impl PipelineError {
    /// True for conditions a stage absorbs per entry or per quarter
    /// instead of failing the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::FetchUnavailable { .. }
                | PipelineError::FetchNetworkError { .. }
                | PipelineError::DecodeFailure { .. }
                | PipelineError::ParseFailure { .. }
                | PipelineError::SchemaMismatch { .. }
                | PipelineError::NoRelevantRows { .. }
                | PipelineError::ValueParseFailure { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

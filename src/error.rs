use std::path::PathBuf;
use thiserror::Error;

/// Structural failures that abort a run.
///
/// Data-quality issues (failed casts, unmatched join keys) are never
/// reported through this type; they are counted in
/// [`crate::quality::QualityReport`] instead.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("raw source `{source_name}` not found at {}", path.display())]
    MissingSource { source_name: String, path: PathBuf },

    #[error("column `{column}` missing from {dataset}")]
    MissingColumn { dataset: String, column: String },

    #[error("grain column `{0}` is not a column of the conformed table")]
    InvalidGrain(String),

    #[error("no committed table at {}", .0.display())]
    TableNotFound(PathBuf),

    #[error("version {version} of table at {} was committed by another writer", location.display())]
    ConcurrentWrite { location: PathBuf, version: u64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PipelineError {
    /// Finds the first `PipelineError` in an `anyhow` chain.
    pub fn find(err: &anyhow::Error) -> Option<&PipelineError> {
        err.chain().find_map(|cause| cause.downcast_ref::<PipelineError>())
    }
}

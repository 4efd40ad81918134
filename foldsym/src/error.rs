use std::{io, path::PathBuf};

use thiserror::Error;

/// Conditions that abort a run. Everything else degrades output quality and
/// is reported through [`crate::diagnostics::Diagnostics`].
#[derive(Debug, Error)]
pub enum FoldError {
    /// No sample survived parsing, there is nothing to fold
    #[error("no samples could be parsed from {path}")]
    NoSamples { path: PathBuf },
    /// A required input could not be read
    #[error("failed to read {path}")]
    ReadInput {
        path: PathBuf,
        source: io::Error,
    },
    /// The folded output could not be written
    #[error("failed to write folded stacks to {path}")]
    WriteOutput {
        path: PathBuf,
        source: io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("worker task failed")]
    Worker(#[from] tokio::task::JoinError),
    /// The run was stopped before folding completed; no output was written
    #[error("run cancelled")]
    Cancelled,
}

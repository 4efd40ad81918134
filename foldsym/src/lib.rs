pub mod args;
pub mod capture;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod folder;
pub mod fs;
pub mod pipeline;
pub mod symbolication;

#[cfg(test)]
mod testutil;

pub use crate::error::FoldError;
pub use crate::pipeline::{Pipeline, RunInputs, RunSummary};

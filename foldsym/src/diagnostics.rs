//! Non-fatal problems met during a run.
//!
//! Every per-address and per-artifact failure lands here instead of
//! interrupting the run; the totals end up in the run summary.

use std::{fmt, path::PathBuf};

use fnv::FnvHashSet;
use foldsym_common::BuildId;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

/// Which input a malformed line came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    Capture,
    Manifest,
    JitMap,
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InputKind::Capture => "capture",
            InputKind::Manifest => "manifest",
            InputKind::JitMap => "jit map",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Diagnostic {
    /// no binary anywhere for a module referenced by the capture
    MissingArtifact {
        build_id: Option<BuildId>,
        module: String,
    },
    /// two artifacts claim the same symfs path, the first one was kept
    AmbiguousPath {
        path: String,
        kept: BuildId,
        dropped: BuildId,
    },
    /// the line-table tool failed or timed out
    ExternalResolverFailure { module: String, reason: String },
    MalformedInput {
        input: InputKind,
        line_no: usize,
        line: String,
    },
    /// an optional input (manifest, JIT map) could not be read or used
    UnreadableInput {
        input: InputKind,
        path: PathBuf,
        reason: String,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::MissingArtifact { build_id: Some(id), module } => {
                write!(f, "no binary for {module} ({id})")
            }
            Diagnostic::MissingArtifact { build_id: None, module } => {
                write!(f, "no binary for {module}")
            }
            Diagnostic::AmbiguousPath {
                path,
                kept,
                dropped,
            } => write!(f, "{path} claimed by {kept} and {dropped}, keeping {kept}"),
            Diagnostic::ExternalResolverFailure { module, reason } => {
                write!(f, "line-table lookup failed for {module}: {reason}")
            }
            Diagnostic::MalformedInput {
                input,
                line_no,
                line,
            } => write!(f, "skipped malformed {input} line {line_no}: {line:?}"),
            Diagnostic::UnreadableInput {
                input,
                path,
                reason,
            } => write!(f, "ignoring {input} {}: {reason}", path.display()),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticCounts {
    pub missing_artifact: usize,
    pub ambiguous_path: usize,
    pub external_resolver_failure: usize,
    pub malformed_input: usize,
    pub unreadable_input: usize,
}

impl DiagnosticCounts {
    pub fn total(&self) -> usize {
        self.missing_artifact
            + self.ambiguous_path
            + self.external_resolver_failure
            + self.malformed_input
            + self.unreadable_input
    }
}

/// Malformed lines kept as examples; the rest are only counted
pub const MAX_MALFORMED_EXAMPLES: usize = 64;

/// Shared sink for diagnostics, safe to record into from worker threads.
#[derive(Debug, Default)]
pub struct Diagnostics {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    recorded: Vec<Diagnostic>,
    counts: DiagnosticCounts,
    missing_modules: FnvHashSet<String>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, diagnostic: Diagnostic) {
        let mut inner = self.inner.lock();
        match &diagnostic {
            Diagnostic::MissingArtifact { module, .. } => {
                // one report per module is enough, frames repeat a lot
                if !inner.missing_modules.insert(module.clone()) {
                    return;
                }
                inner.counts.missing_artifact += 1;
                warn!("{diagnostic}");
            }
            Diagnostic::AmbiguousPath { .. } => {
                inner.counts.ambiguous_path += 1;
                warn!("{diagnostic}");
            }
            Diagnostic::ExternalResolverFailure { .. } => {
                inner.counts.external_resolver_failure += 1;
                debug!("{diagnostic}");
            }
            Diagnostic::MalformedInput { .. } => {
                inner.counts.malformed_input += 1;
                debug!("{diagnostic}");
                if inner.counts.malformed_input > MAX_MALFORMED_EXAMPLES {
                    return;
                }
            }
            Diagnostic::UnreadableInput { .. } => {
                inner.counts.unreadable_input += 1;
                warn!("{diagnostic}");
            }
        }
        inner.recorded.push(diagnostic);
    }

    pub fn counts(&self) -> DiagnosticCounts {
        self.inner.lock().counts
    }

    pub fn snapshot(&self) -> Vec<Diagnostic> {
        self.inner.lock().recorded.clone()
    }
}

/// Line accounting for one parsed input
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LineStats {
    pub total: usize,
    pub skipped: usize,
}

impl LineStats {
    pub fn skipped_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.skipped as f64 / self.total as f64
        }
    }

    /// Log a warning when too large a share of `input` was unusable.
    /// Returns whether the warning fired.
    pub fn warn_if_above(&self, input: InputKind, ratio: f64) -> bool {
        let above = self.skipped > 0 && self.skipped_ratio() > ratio;
        if above {
            warn!(
                "{input}: skipped {} of {} lines as malformed, output is best-effort",
                self.skipped, self.total
            );
        }
        above
    }
}

//! Parsers for the text inputs of a run: the sample capture and the
//! build-id manifest.

pub mod blocks;
pub mod manifest;
pub mod report_sample;

use clap::ValueEnum;
use foldsym_common::{BinaryIdentity, BuildId, Capture};
use serde::{Deserialize, Serialize};

use crate::diagnostics::{Diagnostic, Diagnostics, InputKind, LineStats};

#[derive(Deserialize, Serialize, ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureFormat {
    /// `report-sample` when the first line is `sample:`, blocks otherwise
    #[default]
    Auto,
    /// blank-line separated frame blocks
    Blocks,
    /// `simpleperf report-sample` output
    ReportSample,
}

impl CaptureFormat {
    pub fn detect(text: &str) -> CaptureFormat {
        let first = text.lines().map(str::trim).find(|l| !l.is_empty());
        match first {
            Some("sample:") => CaptureFormat::ReportSample,
            _ => CaptureFormat::Blocks,
        }
    }
}

#[derive(Debug, Default)]
pub struct CaptureImport {
    pub capture: Capture,
    pub stats: LineStats,
}

pub fn parse_capture(text: &str, format: CaptureFormat, diagnostics: &Diagnostics) -> CaptureImport {
    let format = match format {
        CaptureFormat::Auto => CaptureFormat::detect(text),
        format => format,
    };
    match format {
        CaptureFormat::ReportSample => report_sample::parse(text, diagnostics),
        _ => blocks::parse(text, diagnostics),
    }
}

/// `buildid:<hex>` names a build id, anything else is a path or module name
pub fn parse_module(token: &str) -> Option<BinaryIdentity> {
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    match token.strip_prefix("buildid:") {
        Some(hex) => BuildId::parse(hex).ok().map(BinaryIdentity::BuildId),
        None => Some(BinaryIdentity::Path(token.to_owned())),
    }
}

pub(crate) fn parse_hex(s: &str) -> Option<u64> {
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(s, 16).ok()
}

/// Counts lines and reports the ones that had to be skipped
pub(crate) struct LineTracker<'a> {
    input: InputKind,
    diagnostics: &'a Diagnostics,
    pub stats: LineStats,
}

impl<'a> LineTracker<'a> {
    pub fn new(input: InputKind, diagnostics: &'a Diagnostics) -> Self {
        Self {
            input,
            diagnostics,
            stats: LineStats::default(),
        }
    }

    pub fn line(&mut self) {
        self.stats.total += 1;
    }

    pub fn skip(&mut self, line_no: usize, line: &str) {
        self.stats.skipped += 1;
        self.diagnostics.record(Diagnostic::MalformedInput {
            input: self.input,
            line_no,
            line: line.to_owned(),
        });
    }
}

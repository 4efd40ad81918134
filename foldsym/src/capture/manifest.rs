//! Build-id manifest written next to the pulled binaries:
//! `0x<build id>=<relative dir>/<file name>`, one binary per line.

use foldsym_common::BuildId;
use indexmap::IndexMap;

use crate::{
    diagnostics::{Diagnostics, InputKind, LineStats},
    symbolication::binary_store::RemoteHint,
};

use super::LineTracker;

#[derive(Debug, Default)]
pub struct Manifest {
    /// first line wins for a repeated build id
    pub entries: IndexMap<BuildId, RemoteHint>,
    pub stats: LineStats,
}

impl Manifest {
    pub fn parse(text: &str, diagnostics: &Diagnostics) -> Self {
        let mut lines = LineTracker::new(InputKind::Manifest, diagnostics);
        let mut entries = IndexMap::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            lines.line();
            match parse_line(line) {
                Some((build_id, hint)) => {
                    entries.entry(build_id).or_insert(hint);
                }
                None => lines.skip(idx + 1, line),
            }
        }

        Self {
            entries,
            stats: lines.stats,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_line(line: &str) -> Option<(BuildId, RemoteHint)> {
    let (id, path) = line.split_once('=')?;
    let build_id = BuildId::parse(id).ok()?;
    let path = path.trim().trim_start_matches('/');
    if path.is_empty() || path.ends_with('/') {
        return None;
    }
    Some((build_id, RemoteHint::new(path)))
}

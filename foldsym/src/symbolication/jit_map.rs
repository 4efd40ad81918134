//! Per-process JIT method maps (`perf-<pid>.map`).
//!
//! Example:
//! 7f1c2a000000 1c0 void com.example.FFT.transform(double[])
//! 7f1c2a0001c0 88 int java.lang.String.hashCode()

use std::path::Path;

use fnv::FnvHashMap;
use foldsym_common::JitMapEntry;

use crate::diagnostics::{Diagnostic, Diagnostics, InputKind, LineStats};

#[derive(Debug, Default)]
pub struct JitImport {
    /// sorted by start, non-overlapping
    pub entries: Vec<JitMapEntry>,
    pub stats: LineStats,
}

/// Parse the map text of one process.
///
/// Overlapping ranges mean a method was recompiled: the entry with the larger
/// start wins and the older range is cut short where the newer one begins.
/// With equal starts, the later line wins.
pub fn import_map(pid: u32, text: &str, diagnostics: &Diagnostics) -> JitImport {
    let mut stats = LineStats::default();
    let mut parsed = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        stats.total += 1;
        match parse_line(pid, line) {
            Some(entry) => parsed.push(entry),
            None => {
                stats.skipped += 1;
                diagnostics.record(Diagnostic::MalformedInput {
                    input: InputKind::JitMap,
                    line_no: idx + 1,
                    line: line.to_owned(),
                });
            }
        }
    }

    JitImport {
        entries: normalize(parsed),
        stats,
    }
}

fn parse_line(pid: u32, line: &str) -> Option<JitMapEntry> {
    let (start, rest) = line.split_once(char::is_whitespace)?;
    let (size, name) = rest.trim_start().split_once(char::is_whitespace)?;
    let start = parse_hex(start)?;
    let size = parse_hex(size)?;
    let name = name.trim();
    if size == 0 || name.is_empty() {
        return None;
    }
    let end = start.checked_add(size)?;
    Some(JitMapEntry {
        pid,
        start,
        end,
        name: name.to_owned(),
    })
}

fn parse_hex(s: &str) -> Option<u64> {
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u64::from_str_radix(s, 16).ok()
}

/// `entries` in file order in, sorted non-overlapping ranges out
fn normalize(mut entries: Vec<JitMapEntry>) -> Vec<JitMapEntry> {
    // stable: equal starts keep file order, so the later line comes last
    entries.sort_by_key(|e| e.start);
    let mut out: Vec<JitMapEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        while let Some(last) = out.last_mut() {
            if last.start == entry.start {
                out.pop();
                continue;
            }
            if last.end > entry.start {
                last.end = entry.start;
            }
            break;
        }
        out.push(entry);
    }
    out
}

/// JIT ranges of one process
#[derive(Debug, Default)]
pub struct JitMap {
    entries: Vec<JitMapEntry>,
}

impl JitMap {
    pub fn lookup(&self, address: u64) -> Option<&JitMapEntry> {
        let idx = self.entries.partition_point(|e| e.start <= address);
        self.entries[..idx].last().filter(|e| e.contains(address))
    }
}

/// JIT maps of every process in one capture. Never reused across captures.
#[derive(Debug, Default)]
pub struct JitMaps {
    maps: FnvHashMap<u32, JitMap>,
}

impl JitMaps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an import for `pid`; a second file for the same process is merged
    /// as if it had been appended to the first.
    pub fn insert(&mut self, pid: u32, import: JitImport) {
        let map = self.maps.entry(pid).or_default();
        let mut entries = std::mem::take(&mut map.entries);
        entries.extend(import.entries);
        map.entries = normalize(entries);
    }

    pub fn lookup(&self, pid: u32, address: u64) -> Option<&JitMapEntry> {
        self.maps.get(&pid)?.lookup(address)
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}

/// `/data/local/tmp/perf-1234.map` -> 1234
pub fn pid_from_map_path(path: &Path) -> Option<u32> {
    path.file_name()?
        .to_str()?
        .strip_prefix("perf-")?
        .strip_suffix(".map")?
        .parse()
        .ok()
}

//! Aggregation of resolved call chains into folded stacks.

use std::io::{self, Write};

use foldsym_common::{FoldedStackEntry, RawFrame, ResolutionSource, ResolvedFrame, Sample, UNKNOWN_FRAME};
use indexmap::IndexMap;
use serde::Serialize;

use crate::{
    config::{CountMode, OutputOrder},
    symbolication::resolver::AddressResolver,
};

/// How many frames each resolution step named
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FrameSources {
    pub symbol_table: u64,
    pub jit_map: u64,
    pub line_table: u64,
    pub unresolved: u64,
}

impl FrameSources {
    fn add(&mut self, source: ResolutionSource) {
        match source {
            ResolutionSource::PrimarySymbolTable => self.symbol_table += 1,
            ResolutionSource::JitMap => self.jit_map += 1,
            ResolutionSource::FallbackLineTable => self.line_table += 1,
            ResolutionSource::Unresolved => self.unresolved += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.symbol_table + self.jit_map + self.line_table + self.unresolved
    }
}

#[derive(Debug, Default)]
pub struct Folded {
    pub entries: Vec<FoldedStackEntry>,
    pub sources: FrameSources,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StackFolder {
    count: CountMode,
    order: OutputOrder,
}

impl StackFolder {
    pub fn new(count: CountMode, order: OutputOrder) -> Self {
        Self { count, order }
    }

    pub fn fold(&self, samples: &[Sample], resolver: &AddressResolver) -> Folded {
        self.fold_with(samples, |frame, pid| resolver.resolve(frame, pid))
    }

    /// Fold with any frame resolver, called once per frame
    pub fn fold_with<F>(&self, samples: &[Sample], mut resolve: F) -> Folded
    where
        F: FnMut(&RawFrame, u32) -> ResolvedFrame,
    {
        let mut sources = FrameSources::default();
        let mut stacks: IndexMap<Vec<String>, u64> = IndexMap::new();

        for sample in samples {
            // innermost first in the capture, outermost first in the output
            let mut frames: Vec<String> = sample
                .call_chain
                .iter()
                .rev()
                .map(|frame| {
                    let resolved = resolve(frame, sample.pid);
                    sources.add(resolved.source);
                    sanitize(&resolved.name)
                })
                .collect();
            if frames.is_empty() {
                frames.push(UNKNOWN_FRAME.to_owned());
            }

            let increment = match self.count {
                CountMode::Samples => 1,
                CountMode::Weight => sample.weight.max(1),
            };
            *stacks.entry(frames).or_insert(0) += increment;
        }

        let mut entries: Vec<FoldedStackEntry> = stacks
            .into_iter()
            .map(|(frames, count)| FoldedStackEntry::new(frames, count))
            .collect();
        if self.order == OutputOrder::Count {
            // stable, so ties keep first-seen order
            entries.sort_by(|a, b| b.count.cmp(&a.count));
        }

        Folded { entries, sources }
    }
}

/// Frame names must not break the `a;b;c N` line format
pub fn sanitize(name: &str) -> String {
    let name = name.trim();
    if name.is_empty() {
        return UNKNOWN_FRAME.to_owned();
    }
    name.chars()
        .map(|c| match c {
            ';' => ':',
            '\n' | '\r' => ' ',
            c => c,
        })
        .collect()
}

pub fn write_folded<W: Write>(entries: &[FoldedStackEntry], out: &mut W) -> io::Result<()> {
    for entry in entries {
        writeln!(out, "{entry}")?;
    }
    out.flush()
}

//! Address to name resolution.
//!
//! Each frame goes through an ordered list of strategies: the JIT map of its
//! process, the artifact's symbol table, an external line-table tool, and
//! finally a `<module>+0x<offset>` placeholder. Everything after the JIT step
//! is memoized per (module, generation, address); the JIT step is not, since
//! its answer depends on the process and not on the binary.

use std::{
    collections::BTreeSet,
    fmt::Debug,
    path::{Path, PathBuf},
    sync::Arc,
};

use foldsym_common::{BinaryIdentity, BuildId, RawFrame, ResolutionSource, ResolvedFrame, Sample};
use indexmap::IndexMap;
use tracing::debug;

use crate::diagnostics::{Diagnostic, Diagnostics};

use super::{
    binary_store::{BinaryArtifact, BinaryStore},
    jit_map::JitMaps,
    line_table::LineTableResolver,
    memo::SingleFlight,
    symfs::SymbolView,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(ResolvedFrame),
    NotResolved,
}

/// One frame to resolve, with the artifact it maps to if any
#[derive(Debug, Clone, Copy)]
pub struct Query<'a> {
    pub pid: u32,
    pub frame: &'a RawFrame,
    pub artifact: Option<&'a BinaryArtifact>,
}

pub trait ResolveStrategy: Send + Sync + Debug {
    /// source reported for frames this step names
    fn source(&self) -> ResolutionSource;
    fn resolve(&self, query: &Query<'_>) -> Resolution;
}

#[derive(Debug)]
pub struct JitMapStrategy {
    maps: Arc<JitMaps>,
}

impl JitMapStrategy {
    pub fn new(maps: Arc<JitMaps>) -> Self {
        Self { maps }
    }

    pub fn covers(&self, pid: u32, address: u64) -> bool {
        self.maps.lookup(pid, address).is_some()
    }
}

impl ResolveStrategy for JitMapStrategy {
    fn source(&self) -> ResolutionSource {
        ResolutionSource::JitMap
    }

    fn resolve(&self, query: &Query<'_>) -> Resolution {
        if !query.frame.has_address {
            return Resolution::NotResolved;
        }
        match self.maps.lookup(query.pid, query.frame.virtual_address) {
            Some(entry) => Resolution::Resolved(ResolvedFrame::new(&entry.name, self.source())),
            None => Resolution::NotResolved,
        }
    }
}

#[derive(Debug)]
pub struct SymbolTableStrategy;

impl ResolveStrategy for SymbolTableStrategy {
    fn source(&self) -> ResolutionSource {
        ResolutionSource::PrimarySymbolTable
    }

    fn resolve(&self, query: &Query<'_>) -> Resolution {
        let name = query
            .artifact
            .and_then(|a| a.symbols.as_ref())
            .and_then(|symbols| symbols.find(query.frame.virtual_address));
        match name {
            Some(name) => Resolution::Resolved(ResolvedFrame::new(name, self.source())),
            None => Resolution::NotResolved,
        }
    }
}

type LineKey = (BuildId, u64, u64);

/// Asks a [`LineTableResolver`] about artifacts that have a debuggable copy.
///
/// Copies are tried in order: the artifact's own bytes (when debuggable),
/// then copies below the local symbol directories. An address keeps the
/// first answer found; later copies are only asked about what is left.
#[derive(Debug)]
pub struct LineTableStrategy {
    tool: Arc<dyn LineTableResolver>,
    store: Arc<BinaryStore>,
    view: Arc<SymbolView>,
    symbol_dirs: Vec<PathBuf>,
    diagnostics: Arc<Diagnostics>,
    copies: SingleFlight<(BuildId, u64), Arc<Vec<PathBuf>>>,
    answers: SingleFlight<LineKey, Option<String>>,
}

impl LineTableStrategy {
    pub fn new(
        tool: Arc<dyn LineTableResolver>,
        store: Arc<BinaryStore>,
        view: Arc<SymbolView>,
        symbol_dirs: Vec<PathBuf>,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            tool,
            store,
            view,
            symbol_dirs,
            diagnostics,
            copies: SingleFlight::new(),
            answers: SingleFlight::new(),
        }
    }

    fn key(artifact: &BinaryArtifact, address: u64) -> LineKey {
        (artifact.build_id.clone(), artifact.generation, address)
    }

    /// Files the tool may be pointed at for `artifact`
    pub fn copies_of(&self, artifact: &BinaryArtifact) -> Arc<Vec<PathBuf>> {
        let key = (artifact.build_id.clone(), artifact.generation);
        self.copies.get_or_init(&key, || {
            let mut copies = Vec::new();
            if artifact.is_present() && artifact.debuggable {
                let own = self
                    .view
                    .local_path(&artifact.build_id)
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| artifact.cache_path.clone());
                copies.push(own);
            }
            for copy in self.store.local_copies(artifact, &self.symbol_dirs) {
                // an adopted copy is already the artifact's own bytes
                if artifact.source_path.as_ref() != Some(&copy) && !copies.contains(&copy) {
                    copies.push(copy);
                }
            }
            Arc::new(copies)
        })
    }

    fn lookup_copies(&self, artifact: &BinaryArtifact, copies: &[PathBuf], addresses: &[u64]) -> Vec<Option<String>> {
        let mut answers = vec![None; addresses.len()];
        for copy in copies {
            let pending: Vec<usize> = (0..addresses.len()).filter(|i| answers[*i].is_none()).collect();
            if pending.is_empty() {
                break;
            }
            let query: Vec<u64> = pending.iter().map(|i| addresses[*i]).collect();
            match self.tool.lookup(copy, &query) {
                Ok(names) => {
                    for (idx, name) in pending.into_iter().zip(names) {
                        answers[idx] = name;
                    }
                }
                Err(e) => self.diagnostics.record(Diagnostic::ExternalResolverFailure {
                    module: artifact.canonical_path.clone(),
                    reason: format!("{}: {e}", copy.display()),
                }),
            }
        }
        answers
    }

    /// Ask about all of `addresses` in one batch per copy and remember the
    /// answers. Returns how many addresses got a name.
    pub fn prefetch(&self, artifact: &BinaryArtifact, addresses: &[u64]) -> usize {
        let copies = self.copies_of(artifact);
        if copies.is_empty() {
            return 0;
        }
        let pending: Vec<u64> = addresses
            .iter()
            .copied()
            .filter(|a| self.answers.get(&Self::key(artifact, *a)).is_none())
            .collect();
        if pending.is_empty() {
            return 0;
        }

        let names = self.lookup_copies(artifact, &copies, &pending);
        let mut named = 0;
        for (address, name) in pending.into_iter().zip(names) {
            if self
                .answers
                .get_or_init(&Self::key(artifact, address), || name)
                .is_some()
            {
                named += 1;
            }
        }
        debug!(
            "{}: line table named {named} of {} addresses",
            artifact.canonical_path,
            addresses.len()
        );
        named
    }
}

impl ResolveStrategy for LineTableStrategy {
    fn source(&self) -> ResolutionSource {
        ResolutionSource::FallbackLineTable
    }

    fn resolve(&self, query: &Query<'_>) -> Resolution {
        let Some(artifact) = query.artifact else {
            return Resolution::NotResolved;
        };
        if !query.frame.has_address {
            return Resolution::NotResolved;
        }
        let copies = self.copies_of(artifact);
        if copies.is_empty() {
            return Resolution::NotResolved;
        }

        let address = query.frame.virtual_address;
        let name = self.answers.get_or_init(&Self::key(artifact, address), || {
            self.lookup_copies(artifact, &copies, &[address])
                .pop()
                .flatten()
        });
        match name {
            Some(name) => Resolution::Resolved(ResolvedFrame::new(name, self.source())),
            None => Resolution::NotResolved,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MemoKey {
    /// build id when the artifact is known, the frame's identity otherwise
    module: BinaryIdentity,
    generation: u64,
    address: u64,
    offset: u64,
}

/// Addresses of one artifact that only the line-table step can name
#[derive(Debug, Clone)]
pub struct PrefetchGroup {
    pub artifact: Arc<BinaryArtifact>,
    /// sorted, unique
    pub addresses: Vec<u64>,
}

#[derive(Debug)]
pub struct AddressResolver {
    store: Arc<BinaryStore>,
    view: Arc<SymbolView>,
    jit: JitMapStrategy,
    strategies: Vec<Arc<dyn ResolveStrategy>>,
    line_table: Option<Arc<LineTableStrategy>>,
    memo: SingleFlight<MemoKey, ResolvedFrame>,
    diagnostics: Arc<Diagnostics>,
}

impl AddressResolver {
    pub fn new(
        store: Arc<BinaryStore>,
        view: Arc<SymbolView>,
        jit_maps: Arc<JitMaps>,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            store,
            view,
            jit: JitMapStrategy::new(jit_maps),
            strategies: vec![Arc::new(SymbolTableStrategy)],
            line_table: None,
            memo: SingleFlight::new(),
            diagnostics,
        }
    }

    /// Enable the line-table step, searching `symbol_dirs` for alternate copies
    pub fn with_line_table(mut self, tool: Arc<dyn LineTableResolver>, symbol_dirs: Vec<PathBuf>) -> Self {
        let strategy = Arc::new(LineTableStrategy::new(
            tool,
            Arc::clone(&self.store),
            Arc::clone(&self.view),
            symbol_dirs,
            Arc::clone(&self.diagnostics),
        ));
        self.strategies.push(Arc::clone(&strategy) as Arc<dyn ResolveStrategy>);
        self.line_table = Some(strategy);
        self
    }

    /// Current artifact behind a frame's binary identity
    pub fn artifact_for(&self, binary: &BinaryIdentity) -> Option<Arc<BinaryArtifact>> {
        let artifact = match binary {
            BinaryIdentity::BuildId(id) => self.store.get(id),
            BinaryIdentity::Path(path) => self
                .view
                .lookup(path)
                .and_then(|entry| self.store.get(&entry.build_id)),
        };
        if artifact.is_none() {
            let build_id = match binary {
                BinaryIdentity::BuildId(id) => Some(id.clone()),
                BinaryIdentity::Path(_) => None,
            };
            self.diagnostics.record(Diagnostic::MissingArtifact {
                build_id,
                module: binary.to_string(),
            });
        }
        artifact
    }

    pub fn resolve(&self, frame: &RawFrame, pid: u32) -> ResolvedFrame {
        let jit_query = Query {
            pid,
            frame,
            artifact: None,
        };
        if let Resolution::Resolved(resolved) = self.jit.resolve(&jit_query) {
            return resolved;
        }

        let artifact = self.artifact_for(&frame.binary);
        let artifact = artifact.as_deref();
        let resolved = if frame.has_address {
            let key = MemoKey {
                module: match artifact {
                    Some(a) => BinaryIdentity::BuildId(a.build_id.clone()),
                    None => frame.binary.clone(),
                },
                generation: artifact.map_or(0, |a| a.generation),
                address: frame.virtual_address,
                offset: frame.module_offset,
            };
            self.memo
                .get_or_init(&key, || self.resolve_static(pid, frame, artifact))
        } else {
            placeholder(frame, artifact)
        };

        match (&resolved.source, &frame.reported_symbol) {
            // the device already named it from its own symbol table
            (ResolutionSource::Unresolved, Some(symbol)) => {
                ResolvedFrame::new(symbol, ResolutionSource::PrimarySymbolTable)
            }
            _ => resolved,
        }
    }

    fn resolve_static(&self, pid: u32, frame: &RawFrame, artifact: Option<&BinaryArtifact>) -> ResolvedFrame {
        let query = Query {
            pid,
            frame,
            artifact,
        };
        for strategy in &self.strategies {
            if let Resolution::Resolved(resolved) = strategy.resolve(&query) {
                return resolved;
            }
        }
        placeholder(frame, artifact)
    }

    /// Group the addresses of `samples` that neither the JIT maps nor a
    /// symbol table can name, one group per artifact.
    pub fn plan_prefetch(&self, samples: &[Sample]) -> Vec<PrefetchGroup> {
        if self.line_table.is_none() {
            return Vec::new();
        }

        let mut groups: IndexMap<(BuildId, u64), (Arc<BinaryArtifact>, BTreeSet<u64>)> = IndexMap::new();
        for sample in samples {
            for frame in &sample.call_chain {
                if !frame.has_address || self.jit.covers(sample.pid, frame.virtual_address) {
                    continue;
                }
                let Some(artifact) = self.artifact_for(&frame.binary) else {
                    continue;
                };
                let named = artifact
                    .symbols
                    .as_ref()
                    .map_or(false, |s| s.find(frame.virtual_address).is_some());
                if named {
                    continue;
                }
                groups
                    .entry((artifact.build_id.clone(), artifact.generation))
                    .or_insert_with(|| (Arc::clone(&artifact), BTreeSet::new()))
                    .1
                    .insert(frame.virtual_address);
            }
        }

        groups
            .into_values()
            .map(|(artifact, addresses)| PrefetchGroup {
                artifact,
                addresses: addresses.into_iter().collect(),
            })
            .collect()
    }

    /// Run the line-table tool once for a group. Returns how many addresses
    /// got a name.
    pub fn prefetch_group(&self, group: &PrefetchGroup) -> usize {
        match &self.line_table {
            Some(line_table) => line_table.prefetch(&group.artifact, &group.addresses),
            None => 0,
        }
    }

    /// Serial prefetch of every group, for callers without a runtime
    pub fn prefetch(&self, samples: &[Sample]) -> usize {
        self.plan_prefetch(samples)
            .iter()
            .map(|group| self.prefetch_group(group))
            .sum()
    }
}

fn placeholder(frame: &RawFrame, artifact: Option<&BinaryArtifact>) -> ResolvedFrame {
    let module = match artifact {
        Some(artifact) => artifact.file_name(),
        None => frame.binary.module_name(),
    };
    ResolvedFrame::placeholder(module, frame.module_offset)
}

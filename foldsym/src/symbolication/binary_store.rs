//! Build-id keyed cache of binaries pulled from the profiled device.
//!
//! On disk every artifact lives at `<cache_dir>/<build_id>/<filename>`; in
//! memory the registry hands out `Arc<BinaryArtifact>` snapshots. An override
//! swaps the `Arc` after the new bytes have been renamed into place, so a
//! resolver either sees the old artifact or the new one.

use std::{
    fmt::Debug,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use foldsym_common::{module_basename, BuildId};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use symbolic::common::ByteView;
use tracing::{debug, info, warn};

use crate::{
    config::StoreConfig,
    diagnostics::{Diagnostic, Diagnostics},
    fs::ArtifactFs,
};

use super::elf::{ElfInfo, ElfSymbols};

/// Where the device transport put a binary, relative to its pull root.
/// Same as the path part of a manifest line, e.g. `system/lib64/libc.so`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHint {
    pub relative_path: String,
}

impl RemoteHint {
    pub fn new(relative_path: impl Into<String>) -> Self {
        Self {
            relative_path: relative_path.into(),
        }
    }

    pub fn file_name(&self) -> &str {
        module_basename(&self.relative_path)
    }
}

/// Provides bytes for binaries not yet in the cache
pub trait ArtifactSource: Send + Sync + Debug {
    fn fetch(&self, fs: &dyn ArtifactFs, hint: &RemoteHint) -> io::Result<(PathBuf, ByteView<'static>)>;
}

/// Binaries already pulled from the device into a local directory
#[derive(Debug)]
pub struct PulledDirectory {
    root: PathBuf,
}

impl PulledDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ArtifactSource for PulledDirectory {
    fn fetch(&self, fs: &dyn ArtifactFs, hint: &RemoteHint) -> io::Result<(PathBuf, ByteView<'static>)> {
        let path = self.root.join(hint.relative_path.trim_start_matches('/'));
        let data = fs.read(&path)?;
        Ok((path, data))
    }
}

#[derive(Debug)]
struct NoSource;

impl ArtifactSource for NoSource {
    fn fetch(&self, _fs: &dyn ArtifactFs, hint: &RemoteHint) -> io::Result<(PathBuf, ByteView<'static>)> {
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no pull directory configured for {}", hint.relative_path),
        ))
    }
}

#[derive(Debug, Clone)]
pub struct BinaryArtifact {
    pub build_id: BuildId,
    /// device path without the leading `/`, e.g. `system/lib64/libfoo.so`
    pub canonical_path: String,
    /// where the cached bytes came from, `None` if no copy was found
    pub source_path: Option<PathBuf>,
    pub cache_path: PathBuf,
    pub stripped: bool,
    pub debuggable: bool,
    pub symbols: Option<Arc<ElfSymbols>>,
    /// bumped every time the artifact is replaced
    pub generation: u64,
}

impl BinaryArtifact {
    pub fn file_name(&self) -> &str {
        module_basename(&self.canonical_path)
    }

    pub fn is_present(&self) -> bool {
        self.source_path.is_some()
    }
}

#[derive(Debug)]
struct Slot {
    /// serializes overrides of one build id
    write_lock: Mutex<()>,
    artifact: RwLock<Arc<BinaryArtifact>>,
}

impl Slot {
    fn new(artifact: BinaryArtifact) -> Self {
        Self {
            write_lock: Mutex::new(()),
            artifact: RwLock::new(Arc::new(artifact)),
        }
    }

    fn current(&self) -> Arc<BinaryArtifact> {
        Arc::clone(&self.artifact.read())
    }
}

#[derive(Debug)]
pub struct BinaryStore {
    cache_dir: PathBuf,
    fs: Arc<dyn ArtifactFs>,
    source: Box<dyn ArtifactSource>,
    demangle: bool,
    slots: RwLock<IndexMap<BuildId, Arc<Slot>>>,
    diagnostics: Arc<Diagnostics>,
}

impl BinaryStore {
    pub fn new(
        config: &StoreConfig,
        demangle: bool,
        fs: Arc<dyn ArtifactFs>,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        let source: Box<dyn ArtifactSource> = match &config.pulled_dir {
            Some(dir) => Box::new(PulledDirectory::new(dir)),
            None => Box::new(NoSource),
        };
        Self {
            cache_dir: config.cache_dir.clone(),
            fs,
            source,
            demangle,
            slots: Default::default(),
            diagnostics,
        }
    }

    pub fn cache_path(&self, build_id: &BuildId, file_name: &str) -> PathBuf {
        self.cache_dir.join(build_id.as_str()).join(file_name)
    }

    fn slot(&self, build_id: &BuildId) -> Option<Arc<Slot>> {
        self.slots.read().get(build_id).map(Arc::clone)
    }

    fn register(&self, artifact: BinaryArtifact) -> Arc<BinaryArtifact> {
        let mut slots = self.slots.write();
        let slot = slots
            .entry(artifact.build_id.clone())
            .or_insert_with(|| Arc::new(Slot::new(artifact)));
        slot.current()
    }

    pub fn get(&self, build_id: &BuildId) -> Option<Arc<BinaryArtifact>> {
        self.slot(build_id).map(|s| s.current())
    }

    /// Current snapshot of every artifact, in registration order
    pub fn artifacts(&self) -> Vec<Arc<BinaryArtifact>> {
        self.slots.read().values().map(|s| s.current()).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Make `build_id` available locally, fetching it if the cache does not
    /// have it yet. Never fails: without any copy the artifact simply has no
    /// symbol table.
    pub fn ensure(&self, build_id: &BuildId, hint: &RemoteHint) -> Arc<BinaryArtifact> {
        if let Some(slot) = self.slot(build_id) {
            return slot.current();
        }

        let cache_path = self.cache_path(build_id, hint.file_name());
        let mut artifact = BinaryArtifact {
            build_id: build_id.clone(),
            canonical_path: hint.relative_path.trim_start_matches('/').to_owned(),
            source_path: None,
            cache_path: cache_path.clone(),
            stripped: true,
            debuggable: false,
            symbols: None,
            generation: 0,
        };

        let loaded = match self.fs.read(&cache_path) {
            Ok(data) => Some((cache_path.clone(), data)),
            Err(_) => self.fetch(hint, &cache_path),
        };

        match loaded {
            Some((source_path, data)) => {
                self.inspect_into(&mut artifact, &data);
                debug!(
                    "{} {}: stripped={} symbols={}",
                    build_id,
                    artifact.canonical_path,
                    artifact.stripped,
                    artifact.symbols.as_ref().map_or(0, |s| s.len())
                );
                artifact.source_path = Some(source_path);
            }
            None => self.diagnostics.record(Diagnostic::MissingArtifact {
                build_id: Some(build_id.clone()),
                module: artifact.canonical_path.clone(),
            }),
        }

        self.register(artifact)
    }

    fn fetch(&self, hint: &RemoteHint, cache_path: &Path) -> Option<(PathBuf, ByteView<'static>)> {
        let (from, data) = match self.source.fetch(self.fs.as_ref(), hint) {
            Ok(fetched) => fetched,
            Err(e) => {
                debug!("unable to fetch {}: {e}", hint.relative_path);
                return None;
            }
        };
        // still usable from where it was fetched if caching fails
        if let Err(e) = self.fs.write_atomic(cache_path, &data) {
            warn!("unable to cache {}: {e}", cache_path.display());
        }
        Some((from, data))
    }

    fn inspect_into(&self, artifact: &mut BinaryArtifact, data: &[u8]) {
        match ElfInfo::parse(data, self.demangle) {
            Ok(info) => {
                if let Some(id) = info.build_id.as_ref().filter(|id| **id != artifact.build_id) {
                    warn!(
                        "{} carries build id {id}, expected {}",
                        artifact.canonical_path, artifact.build_id
                    );
                }
                artifact.stripped = info.stripped;
                artifact.debuggable = info.debuggable;
                artifact.symbols = Some(Arc::new(info.symbols));
            }
            Err(e) => {
                warn!("{} is not a readable object file: {e}", artifact.canonical_path);
            }
        }
    }

    /// Install `candidate` for `build_id` if it is unstripped and the current
    /// copy is stripped or missing. Returns whether the artifact was replaced.
    pub fn override_if_better(&self, build_id: &BuildId, candidate: &Path) -> bool {
        let slot = match self.slot(build_id) {
            Some(slot) => slot,
            None => {
                let file_name = candidate
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| build_id.to_string());
                self.register(BinaryArtifact {
                    build_id: build_id.clone(),
                    canonical_path: file_name.clone(),
                    source_path: None,
                    cache_path: self.cache_path(build_id, &file_name),
                    stripped: true,
                    debuggable: false,
                    symbols: None,
                    generation: 0,
                });
                match self.slot(build_id) {
                    Some(slot) => slot,
                    None => return false,
                }
            }
        };

        let _guard = slot.write_lock.lock();
        let current = slot.current();
        if current.is_present() && !current.stripped {
            return false;
        }

        let data = match self.fs.read(candidate) {
            Ok(data) => data,
            Err(e) => {
                debug!("cannot read candidate {}: {e}", candidate.display());
                return false;
            }
        };
        let info = match ElfInfo::parse(&data, self.demangle) {
            Ok(info) => info,
            Err(e) => {
                debug!("candidate {} is not an object file: {e}", candidate.display());
                return false;
            }
        };
        if info.stripped {
            return false;
        }
        if let Some(id) = info.build_id.as_ref().filter(|id| *id != build_id) {
            warn!(
                "not using {}: build id {id} does not match {build_id}",
                candidate.display()
            );
            return false;
        }
        if let Err(e) = self.fs.write_atomic(&current.cache_path, &data) {
            warn!("unable to install {}: {e}", candidate.display());
            return false;
        }

        let replacement = BinaryArtifact {
            source_path: Some(candidate.to_path_buf()),
            stripped: false,
            debuggable: true,
            symbols: Some(Arc::new(info.symbols)),
            generation: current.generation + 1,
            ..(*current).clone()
        };
        *slot.artifact.write() = Arc::new(replacement);
        info!(
            "using unstripped {} for {} ({build_id})",
            candidate.display(),
            current.canonical_path
        );
        true
    }

    /// Local copies of `artifact` below `symbol_dirs`: the same relative path
    /// first, then any file with the same name.
    pub fn local_copies(&self, artifact: &BinaryArtifact, symbol_dirs: &[PathBuf]) -> Vec<PathBuf> {
        let mut found: Vec<PathBuf> = Vec::new();
        for dir in symbol_dirs {
            let direct = dir.join(&artifact.canonical_path);
            if self.fs.exists(&direct) && !found.contains(&direct) {
                found.push(direct);
            }
        }
        for dir in symbol_dirs {
            for path in self.fs.find_by_name(dir, artifact.file_name()) {
                if !found.contains(&path) {
                    found.push(path);
                }
            }
        }
        found
    }

    /// Try every local copy of every artifact. Returns how many were replaced.
    pub fn adopt_local_copies(&self, symbol_dirs: &[PathBuf]) -> usize {
        if symbol_dirs.is_empty() {
            return 0;
        }
        let mut replaced = 0;
        for artifact in self.artifacts() {
            if artifact.is_present() && !artifact.stripped {
                continue;
            }
            for candidate in self.local_copies(&artifact, symbol_dirs) {
                if self.override_if_better(&artifact.build_id, &candidate) {
                    replaced += 1;
                    break;
                }
            }
        }
        replaced
    }
}

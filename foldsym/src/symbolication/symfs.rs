//! Path-addressable view over the artifact cache.
//!
//! Every artifact is linked under the runtime path it would have on the
//! device, e.g. `<root>/apex/com.android.art/lib64/libart.so`. Links point at
//! the cache entry, so an override that renames new bytes into the cache is
//! visible through the view without rebuilding it.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use fnv::FnvHashMap;
use foldsym_common::{module_basename, BuildId};
use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::{
    diagnostics::{Diagnostic, Diagnostics},
    fs::ArtifactFs,
};

use super::binary_store::BinaryArtifact;

pub const RUNTIME_LIB_DIR: &str = "apex/com.android.art/lib64";
pub const RUNTIME_BIN_DIR: &str = "apex/com.android.art/bin";
pub const SYSTEM_BIN_DIR: &str = "system/bin";
pub const SYSTEM_LIB_DIR: &str = "system/lib64";

#[derive(Debug, Clone, Copy)]
enum Pattern {
    Exact(&'static str),
    Prefix(&'static str),
}

impl Pattern {
    fn matches(&self, file_name: &str) -> bool {
        match self {
            Pattern::Exact(s) => file_name == *s,
            Pattern::Prefix(s) => file_name.starts_with(s),
        }
    }
}

/// First match wins; anything not listed is a general shared library.
const CLASSIFICATION: &[(Pattern, &str)] = &[
    // runtime core
    (Pattern::Prefix("libart"), RUNTIME_LIB_DIR),
    (Pattern::Prefix("libdexfile"), RUNTIME_LIB_DIR),
    (Pattern::Prefix("libopenjdkjvm"), RUNTIME_LIB_DIR),
    (Pattern::Prefix("libvixl"), RUNTIME_LIB_DIR),
    (Pattern::Exact("libelffile.so"), RUNTIME_LIB_DIR),
    (Pattern::Exact("libjavacore.so"), RUNTIME_LIB_DIR),
    (Pattern::Exact("libnativebridge.so"), RUNTIME_LIB_DIR),
    (Pattern::Exact("libnativehelper.so"), RUNTIME_LIB_DIR),
    (Pattern::Exact("libnativeloader.so"), RUNTIME_LIB_DIR),
    (Pattern::Exact("libopenjdk.so"), RUNTIME_LIB_DIR),
    (Pattern::Exact("libprofile.so"), RUNTIME_LIB_DIR),
    (Pattern::Exact("libsigchain.so"), RUNTIME_LIB_DIR),
    // runtime executables
    (Pattern::Prefix("dalvikvm"), RUNTIME_BIN_DIR),
    (Pattern::Prefix("dex2oat"), RUNTIME_BIN_DIR),
    (Pattern::Exact("dexdump"), RUNTIME_BIN_DIR),
    (Pattern::Exact("dexoptanalyzer"), RUNTIME_BIN_DIR),
    (Pattern::Exact("oatdump"), RUNTIME_BIN_DIR),
    (Pattern::Exact("odrefresh"), RUNTIME_BIN_DIR),
    (Pattern::Exact("profman"), RUNTIME_BIN_DIR),
    // system executables
    (Pattern::Prefix("app_process"), SYSTEM_BIN_DIR),
    (Pattern::Prefix("linker"), SYSTEM_BIN_DIR),
    (Pattern::Exact("simpleperf"), SYSTEM_BIN_DIR),
    (Pattern::Exact("toybox"), SYSTEM_BIN_DIR),
];

/// Runtime directory a binary called `file_name` would live in
pub fn classify(file_name: &str) -> &'static str {
    CLASSIFICATION
        .iter()
        .find(|(pattern, _)| pattern.matches(file_name))
        .map(|(_, dir)| *dir)
        .unwrap_or(SYSTEM_LIB_DIR)
}

/// Canonical paths of `artifact`, relative to the view root: the classified
/// path, then the manifest path when it is a different one.
pub fn canonical_paths(artifact: &BinaryArtifact) -> Vec<String> {
    let file_name = artifact.file_name();
    let mut paths = vec![format!("{}/{}", classify(file_name), file_name)];
    let manifest_path = artifact.canonical_path.trim_start_matches('/');
    if manifest_path.contains('/') && !paths.iter().any(|p| p == manifest_path) {
        paths.push(manifest_path.to_owned());
    }
    paths
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewEntry {
    pub build_id: BuildId,
    /// the symlink inside the view
    pub link: PathBuf,
    /// the cache entry it points at
    pub target: PathBuf,
}

#[derive(Debug)]
pub struct SymbolView {
    root: PathBuf,
    entries: IndexMap<String, ViewEntry>,
    by_name: FnvHashMap<String, String>,
    by_build_id: FnvHashMap<BuildId, String>,
}

impl SymbolView {
    pub fn build_view(
        root: &Path,
        artifacts: &[Arc<BinaryArtifact>],
        fs: &dyn ArtifactFs,
        diagnostics: &Diagnostics,
    ) -> Self {
        let mut view = Self {
            root: root.to_path_buf(),
            entries: IndexMap::new(),
            by_name: FnvHashMap::default(),
            by_build_id: FnvHashMap::default(),
        };

        for artifact in artifacts {
            for path in canonical_paths(artifact) {
                if let Some(existing) = view.entries.get(&path) {
                    if existing.build_id != artifact.build_id {
                        diagnostics.record(Diagnostic::AmbiguousPath {
                            path,
                            kept: existing.build_id.clone(),
                            dropped: artifact.build_id.clone(),
                        });
                    }
                    continue;
                }

                let link = root.join(&path);
                if let Err(e) = fs.symlink(&artifact.cache_path, &link) {
                    warn!("unable to link {}: {e}", link.display());
                }
                debug!("{} -> {}", link.display(), artifact.cache_path.display());

                view.by_name
                    .entry(artifact.file_name().to_owned())
                    .or_insert_with(|| path.clone());
                view.by_build_id
                    .entry(artifact.build_id.clone())
                    .or_insert_with(|| path.clone());
                view.entries.insert(
                    path,
                    ViewEntry {
                        build_id: artifact.build_id.clone(),
                        link,
                        target: artifact.cache_path.clone(),
                    },
                );
            }
        }

        view
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Find the view entry for a runtime path as printed by a profiler.
    /// Falls back to the first artifact with the same file name.
    pub fn lookup(&self, path: &str) -> Option<&ViewEntry> {
        let relative = path.trim().trim_start_matches('/');
        if let Some(entry) = self.entries.get(relative) {
            return Some(entry);
        }
        let by_name = self.by_name.get(module_basename(relative))?;
        self.entries.get(by_name)
    }

    /// Path inside the view through which `build_id` can be opened
    pub fn local_path(&self, build_id: &BuildId) -> Option<&Path> {
        let path = self.by_build_id.get(build_id)?;
        self.entries.get(path).map(|e| e.link.as_path())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

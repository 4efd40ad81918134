//! One fold run, from manifest to folded output.

use std::{
    fs, io,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use foldsym_common::{Capture, FoldedStackEntry};
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    capture::{manifest::Manifest, parse_capture},
    config::FoldConfig,
    diagnostics::{Diagnostic, DiagnosticCounts, Diagnostics, InputKind, LineStats},
    error::FoldError,
    folder::{write_folded, FrameSources, StackFolder},
    fs::{ArtifactFs, StdFs},
    symbolication::{
        jit_map::{import_map, pid_from_map_path, JitMaps},
        line_table::{LineTableResolver, LlvmSymbolizer},
        resolver::AddressResolver,
        symfs::SymbolView,
        BinaryStore,
    },
};

/// A JIT map file and the process it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitMapInput {
    /// taken from a `perf-<pid>.map` file name when not given
    pub pid: Option<u32>,
    pub path: PathBuf,
}

impl JitMapInput {
    /// `<pid>=<path>` or a plain path
    pub fn parse(s: &str) -> Self {
        if let Some((pid, path)) = s.split_once('=') {
            if let Ok(pid) = pid.parse() {
                return Self {
                    pid: Some(pid),
                    path: PathBuf::from(path),
                };
            }
        }
        Self {
            pid: None,
            path: PathBuf::from(s),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunInputs {
    pub capture: PathBuf,
    pub manifest: Option<PathBuf>,
    /// files, or directories holding `perf-<pid>.map` files
    pub jit_maps: Vec<JitMapInput>,
    /// stdout when `None`
    pub output: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct InputLines {
    pub capture: LineStats,
    pub manifest: LineStats,
    pub jit_map: LineStats,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub samples: usize,
    pub folded_entries: usize,
    pub artifacts: usize,
    /// artifacts replaced by a local unstripped copy
    pub overrides: usize,
    pub jit_processes: usize,
    /// addresses named by the batched line-table prefetch
    pub prefetched: usize,
    pub frames: FrameSources,
    pub diagnostics: DiagnosticCounts,
    pub lines: InputLines,
}

impl RunSummary {
    pub fn log(&self) {
        info!(
            "folded {} samples into {} stacks ({} artifacts, {} overridden)",
            self.samples, self.folded_entries, self.artifacts, self.overrides
        );
        info!(
            "frames: {} symbol table, {} jit map, {} line table, {} unresolved",
            self.frames.symbol_table, self.frames.jit_map, self.frames.line_table, self.frames.unresolved
        );
        if self.diagnostics.total() > 0 {
            warn!(
                "{} missing artifacts, {} ambiguous paths, {} line-table failures, {} malformed lines, {} unreadable inputs",
                self.diagnostics.missing_artifact,
                self.diagnostics.ambiguous_path,
                self.diagnostics.external_resolver_failure,
                self.diagnostics.malformed_input,
                self.diagnostics.unreadable_input
            );
        }
    }

    pub fn write_json(&self, path: &Path) -> Result<(), FoldError> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
            .map_err(|source| FoldError::WriteOutput {
                path: path.to_path_buf(),
                source,
            })?;
        StdFs
            .write_atomic(path, &json)
            .map_err(|source| FoldError::WriteOutput {
                path: path.to_path_buf(),
                source,
            })
    }
}

#[derive(Debug)]
pub struct FoldOutcome {
    pub entries: Vec<FoldedStackEntry>,
    pub summary: RunSummary,
    pub diagnostics: Arc<Diagnostics>,
}

#[derive(Debug)]
pub struct Pipeline {
    config: FoldConfig,
    fs: Arc<dyn ArtifactFs>,
    line_table: Option<Arc<dyn LineTableResolver>>,
}

impl Pipeline {
    pub fn new(mut config: FoldConfig) -> Result<Self, FoldError> {
        config.validate()?;
        // symfs links must not depend on the working directory of the reader
        config.store.cache_dir = absolute(&config.store.cache_dir)?;
        config.symfs.root = absolute(&config.symfs.root)?;
        let line_table = LlvmSymbolizer::from_config(&config.resolver)?
            .map(|s| Arc::new(s) as Arc<dyn LineTableResolver>);
        Ok(Self {
            config,
            fs: Arc::new(StdFs),
            line_table,
        })
    }

    pub fn with_fs(mut self, fs: Arc<dyn ArtifactFs>) -> Self {
        self.fs = fs;
        self
    }

    pub fn with_line_table(mut self, line_table: Option<Arc<dyn LineTableResolver>>) -> Self {
        self.line_table = line_table;
        self
    }

    pub fn config(&self) -> &FoldConfig {
        &self.config
    }

    /// Resolve and fold the capture. Nothing is written.
    ///
    /// Only an unreadable capture, or one without samples, fails the run;
    /// problems with the other inputs end up in the diagnostics.
    pub async fn fold(&self, inputs: &RunInputs, stop_rx: watch::Receiver<()>) -> Result<FoldOutcome, FoldError> {
        let diagnostics = Arc::new(Diagnostics::new());
        let warn_ratio = self.config.input.malformed_warn_ratio;
        let mut summary = RunSummary::default();

        let store = Arc::new(BinaryStore::new(
            &self.config.store,
            self.config.resolver.demangle,
            Arc::clone(&self.fs),
            Arc::clone(&diagnostics),
        ));
        let manifest_text = inputs
            .manifest
            .as_deref()
            .and_then(|path| read_optional(path, InputKind::Manifest, &diagnostics));
        if let Some(text) = manifest_text {
            let manifest = Manifest::parse(&text, &diagnostics);
            manifest.stats.warn_if_above(InputKind::Manifest, warn_ratio);
            summary.lines.manifest = manifest.stats;
            for (build_id, hint) in &manifest.entries {
                store.ensure(build_id, hint);
            }
        }
        check_stop(&stop_rx)?;

        summary.overrides = store.adopt_local_copies(&self.config.store.symbol_dirs);
        summary.artifacts = store.len();
        let present = store.artifacts().iter().filter(|a| a.is_present()).count();
        info!(
            "{} artifacts, {present} available locally, {} replaced by unstripped copies",
            summary.artifacts, summary.overrides
        );

        let view = SymbolView::build_view(
            &self.config.symfs.root,
            &store.artifacts(),
            self.fs.as_ref(),
            &diagnostics,
        );
        debug!("symfs view at {} with {} paths", view.root().display(), view.len());

        let jit_maps = self.import_jit_maps(&inputs.jit_maps, &diagnostics, &mut summary);

        let import = parse_capture(&read_text(&inputs.capture)?, self.config.input.format, &diagnostics);
        import.stats.warn_if_above(InputKind::Capture, warn_ratio);
        summary.lines.capture = import.stats;
        if import.capture.is_empty() {
            return Err(FoldError::NoSamples {
                path: inputs.capture.clone(),
            });
        }
        let capture = Arc::new(import.capture);
        summary.samples = capture.len();
        info!("parsed {} samples", capture.len());
        check_stop(&stop_rx)?;

        let mut resolver = AddressResolver::new(
            store,
            Arc::new(view),
            Arc::new(jit_maps),
            Arc::clone(&diagnostics),
        );
        if let Some(line_table) = &self.line_table {
            resolver = resolver.with_line_table(Arc::clone(line_table), self.config.store.symbol_dirs.clone());
        }
        let resolver = Arc::new(resolver);

        summary.prefetched = self.prefetch(&resolver, &capture, stop_rx.clone()).await?;
        check_stop(&stop_rx)?;

        let folder = StackFolder::new(self.config.output.count, self.config.output.order);
        let folded = {
            let resolver = Arc::clone(&resolver);
            let capture = Arc::clone(&capture);
            tokio::task::spawn_blocking(move || folder.fold(capture.samples(), &resolver))
                .await?
        };
        check_stop(&stop_rx)?;

        summary.folded_entries = folded.entries.len();
        summary.frames = folded.sources;
        summary.diagnostics = diagnostics.counts();
        Ok(FoldOutcome {
            entries: folded.entries,
            summary,
            diagnostics,
        })
    }

    /// Fold and write the result to `inputs.output`
    pub async fn run(&self, inputs: &RunInputs, stop_rx: watch::Receiver<()>) -> Result<RunSummary, FoldError> {
        let outcome = self.fold(inputs, stop_rx).await?;
        write_output(inputs.output.as_deref(), &outcome.entries)?;
        outcome.summary.log();
        Ok(outcome.summary)
    }

    /// Unreadable or unattributable map files are reported and skipped, the
    /// process then simply has no JIT coverage
    fn import_jit_maps(&self, inputs: &[JitMapInput], diagnostics: &Diagnostics, summary: &mut RunSummary) -> JitMaps {
        let mut files = Vec::new();
        for input in inputs {
            if !input.path.is_dir() {
                files.push(input.clone());
                continue;
            }
            match map_files_in(&input.path) {
                Ok(found) => files.extend(found),
                Err(e) => diagnostics.record(Diagnostic::UnreadableInput {
                    input: InputKind::JitMap,
                    path: input.path.clone(),
                    reason: e.to_string(),
                }),
            }
        }

        let mut maps = JitMaps::new();
        for file in files {
            let Some(pid) = file.pid.or_else(|| pid_from_map_path(&file.path)) else {
                diagnostics.record(Diagnostic::UnreadableInput {
                    input: InputKind::JitMap,
                    path: file.path,
                    reason: "unknown process, name it perf-<pid>.map or pass <pid>=<path>".into(),
                });
                continue;
            };
            let Some(text) = read_optional(&file.path, InputKind::JitMap, diagnostics) else {
                continue;
            };
            let import = import_map(pid, &text, diagnostics);
            import.stats.warn_if_above(InputKind::JitMap, self.config.input.malformed_warn_ratio);
            summary.lines.jit_map.total += import.stats.total;
            summary.lines.jit_map.skipped += import.stats.skipped;
            debug!("{}: {} jit ranges for pid {pid}", file.path.display(), import.entries.len());
            maps.insert(pid, import);
        }
        summary.jit_processes = maps.len();
        maps
    }

    /// Batch line-table lookups per artifact, `resolver.concurrency` at a time
    async fn prefetch(
        &self,
        resolver: &Arc<AddressResolver>,
        capture: &Arc<Capture>,
        mut stop_rx: watch::Receiver<()>,
    ) -> Result<usize, FoldError> {
        let groups = resolver.plan_prefetch(capture.samples());
        if groups.is_empty() {
            return Ok(0);
        }
        info!("prefetching line tables for {} artifacts", groups.len());

        let work = futures_util::stream::iter(groups.into_iter().map(|group| {
            let resolver = Arc::clone(resolver);
            tokio::task::spawn_blocking(move || resolver.prefetch_group(&group))
        }))
        .buffer_unordered(self.config.resolver.concurrency)
        .fold(0, |named, result| async move {
            match result {
                Ok(n) => named + n,
                Err(e) => {
                    warn!("prefetch task failed: {e}");
                    named
                }
            }
        });

        tokio::select! {
            named = work => Ok(named),
            Ok(()) = stop_rx.changed() => {
                info!("stopping, in-flight symbolizer calls finish on their own");
                Err(FoldError::Cancelled)
            }
        }
    }
}

fn check_stop(stop_rx: &watch::Receiver<()>) -> Result<(), FoldError> {
    if stop_rx.has_changed().unwrap_or(false) {
        return Err(FoldError::Cancelled);
    }
    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf, FoldError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|e| FoldError::Config(format!("no working directory: {e}")))?;
    Ok(cwd.join(path))
}

fn read_text(path: &Path) -> Result<String, FoldError> {
    let bytes = fs::read(path).map_err(|source| FoldError::ReadInput {
        path: path.to_path_buf(),
        source,
    })?;
    // device tools do not promise valid UTF-8 in symbol names
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Optional inputs degrade to a diagnostic when they cannot be read
fn read_optional(path: &Path, input: InputKind, diagnostics: &Diagnostics) -> Option<String> {
    match fs::read(path) {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) => {
            diagnostics.record(Diagnostic::UnreadableInput {
                input,
                path: path.to_path_buf(),
                reason: e.to_string(),
            });
            None
        }
    }
}

/// `perf-<pid>.map` files directly inside `dir`, sorted by name
fn map_files_in(dir: &Path) -> io::Result<Vec<JitMapInput>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(pid) = pid_from_map_path(&path) {
            files.push(JitMapInput { pid: Some(pid), path });
        }
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

/// Write folded lines to `path` through a temporary file renamed into place,
/// or to stdout
pub fn write_output(path: Option<&Path>, entries: &[FoldedStackEntry]) -> Result<(), FoldError> {
    let Some(path) = path else {
        let stdout = io::stdout();
        let mut out = io::BufWriter::new(stdout.lock());
        return write_folded(entries, &mut out).map_err(|source| FoldError::WriteOutput {
            path: PathBuf::from("<stdout>"),
            source,
        });
    };

    let write = || -> io::Result<()> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        {
            let mut out = io::BufWriter::new(tmp.as_file_mut());
            write_folded(entries, &mut out)?;
            out.flush()?;
        }
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    };
    write().map_err(|source| FoldError::WriteOutput {
        path: path.to_path_buf(),
        source,
    })?;
    info!("wrote {} folded stacks to {}", entries.len(), path.display());
    Ok(())
}

//! External line-table lookup, the last resort before a placeholder.

use std::{
    fmt::Debug,
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command, runtime};
use tracing::debug;

use crate::{config::ResolverConfig, error::FoldError};

#[derive(Debug, Error)]
pub enum LineTableError {
    #[error("failed to run {program}: {source}")]
    Spawn { program: PathBuf, source: io::Error },
    #[error("i/o error talking to the symbolizer: {0}")]
    Io(#[from] io::Error),
    #[error("symbolizer exited with {0}")]
    NonZeroExit(ExitStatus),
    #[error("symbolizer timed out after {0:?}")]
    Timeout(Duration),
    #[error("expected {expected} answers, symbolizer printed {got}")]
    Misaligned { expected: usize, got: usize },
}

/// A tool that names addresses of a binary on disk
pub trait LineTableResolver: Send + Sync + Debug {
    /// One answer per address, `None` where the tool does not know either.
    fn lookup(&self, object: &Path, addresses: &[u64]) -> Result<Vec<Option<String>>, LineTableError>;
}

/// `llvm-symbolizer --obj=<binary>`, addresses on stdin
#[derive(Debug, Clone)]
pub struct LlvmSymbolizer {
    program: PathBuf,
    extra_args: Vec<String>,
    timeout: Duration,
}

impl LlvmSymbolizer {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
            timeout,
        }
    }

    /// `None` when the config disables the line-table step
    pub fn from_config(config: &ResolverConfig) -> Result<Option<Self>, FoldError> {
        let Some(program) = &config.symbolizer else {
            return Ok(None);
        };
        let mut symbolizer = Self::new(program, config.timeout());
        symbolizer.extra_args = config.extra_args()?;
        Ok(Some(symbolizer))
    }
}

impl LlvmSymbolizer {
    async fn run(&self, object: &Path, addresses: &[u64]) -> Result<Vec<Option<String>>, LineTableError> {
        let mut child = Command::new(&self.program)
            .arg(format!("--obj={}", object.display()))
            .args(["--inlining=false", "--functions=linkage", "--demangle"])
            .args(&self.extra_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LineTableError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let input: String = addresses.iter().map(|a| format!("0x{a:x}\n")).collect();
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "no stdin"))?;
        let feed = async move {
            stdin.write_all(input.as_bytes()).await?;
            // closing stdin tells the tool there is nothing more to read
            drop(stdin);
            Ok::<_, io::Error>(())
        };

        // dropping the child on timeout kills it
        let (fed, output) = tokio::time::timeout(self.timeout, async { tokio::join!(feed, child.wait_with_output()) })
            .await
            .map_err(|_| LineTableError::Timeout(self.timeout))?;
        let output = output?;
        if !output.status.success() {
            return Err(LineTableError::NonZeroExit(output.status));
        }
        fed?;

        let answers = parse_symbolizer_output(&String::from_utf8_lossy(&output.stdout), addresses.len())?;
        debug!(
            "{}: {} of {} addresses named",
            object.display(),
            answers.iter().filter(|a| a.is_some()).count(),
            addresses.len()
        );
        Ok(answers)
    }
}

impl LineTableResolver for LlvmSymbolizer {
    /// Blocks the calling thread. Inside the runtime call it from a blocking
    /// task, as the resolver's prefetch and fold do.
    fn lookup(&self, object: &Path, addresses: &[u64]) -> Result<Vec<Option<String>>, LineTableError> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }
        match runtime::Handle::try_current() {
            Ok(handle) => handle.block_on(self.run(object, addresses)),
            Err(_) => runtime::Builder::new_current_thread()
                .enable_io()
                .enable_time()
                .build()?
                .block_on(self.run(object, addresses)),
        }
    }
}

/// Split llvm-symbolizer output into one answer per address.
///
/// Each address produces a function line and a location line, records are
/// separated by a blank line:
/// art::Thread::Run()
/// art/runtime/thread.cc:42:3
///
/// ??
/// ??:0:0
pub fn parse_symbolizer_output(out: &str, expected: usize) -> Result<Vec<Option<String>>, LineTableError> {
    let mut answers = Vec::with_capacity(expected);
    let mut in_record = false;
    for line in out.lines() {
        let line = line.trim();
        if line.is_empty() {
            in_record = false;
            continue;
        }
        if in_record {
            // location and inlined-frame lines
            continue;
        }
        in_record = true;
        answers.push(match line {
            "??" => None,
            name => Some(name.to_owned()),
        });
    }

    if answers.len() != expected {
        return Err(LineTableError::Misaligned {
            expected,
            got: answers.len(),
        });
    }
    Ok(answers)
}

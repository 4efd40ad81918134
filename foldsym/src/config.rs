use anyhow::{Context, Result};
use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::{capture::CaptureFormat, error::FoldError};

/// Run configuration, threaded through every component constructor.
///
/// ```toml
/// [store]
/// cache_dir = "binary_cache"
/// pulled_dir = "pulled"
/// symbol_dirs = ["out/target/product/generic/symbols"]
///
/// [resolver]
/// symbolizer = "llvm-symbolizer"
/// timeout_ms = 10000
/// concurrency = 8
/// ```
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(default)]
pub struct FoldConfig {
    pub store: StoreConfig,
    pub symfs: SymfsConfig,
    pub resolver: ResolverConfig,
    pub input: InputConfig,
    pub output: OutputConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct StoreConfig {
    /// build-id keyed artifact cache, reused across runs
    pub cache_dir: PathBuf,
    /// where the device transport left pulled binaries
    pub pulled_dir: Option<PathBuf>,
    /// roots of locally built, unstripped binaries
    pub symbol_dirs: Vec<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("binary_cache"),
            pulled_dir: None,
            symbol_dirs: Vec::new(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct SymfsConfig {
    pub root: PathBuf,
}

impl Default for SymfsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("symfs"),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct ResolverConfig {
    /// line-table tool, `None` disables the fallback step
    pub symbolizer: Option<PathBuf>,
    /// extra arguments, shell-quoted
    pub symbolizer_args: String,
    pub timeout_ms: u64,
    pub concurrency: usize,
    pub demangle: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            symbolizer: Some(PathBuf::from("llvm-symbolizer")),
            symbolizer_args: String::new(),
            timeout_ms: 10_000,
            concurrency: 4,
            demangle: true,
        }
    }
}

impl ResolverConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn extra_args(&self) -> Result<Vec<String>, FoldError> {
        shlex::split(&self.symbolizer_args).ok_or_else(|| {
            FoldError::Config(format!(
                "unbalanced quotes in symbolizer_args: {}",
                self.symbolizer_args
            ))
        })
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct InputConfig {
    pub format: CaptureFormat,
    /// share of skipped lines above which a warning is logged
    pub malformed_warn_ratio: f64,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            format: CaptureFormat::Auto,
            malformed_warn_ratio: 0.05,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(default)]
pub struct OutputConfig {
    pub count: CountMode,
    pub order: OutputOrder,
}

/// What a folded entry counts
#[derive(Deserialize, Serialize, ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CountMode {
    /// one per sample
    Samples,
    /// the sample's weight (event count), 1 when the capture has none
    #[default]
    Weight,
}

#[derive(Deserialize, Serialize, ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum OutputOrder {
    /// order of first occurrence in the capture
    #[default]
    FirstSeen,
    /// descending count
    Count,
}

impl FoldConfig {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config_file =
            File::open(path).with_context(|| format!("config file {path:?} not found"))?;
        let mut contents = String::new();
        config_file
            .read_to_string(&mut contents)
            .with_context(|| format!("something went wrong reading {path:?}"))?;
        let config: FoldConfig = toml::from_str(&contents)
            .with_context(|| format!("invalid config in {path:?}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FoldError> {
        if self.resolver.concurrency == 0 {
            return Err(FoldError::Config("resolver.concurrency must be at least 1".into()));
        }
        if self.resolver.timeout_ms == 0 {
            return Err(FoldError::Config("resolver.timeout_ms must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.input.malformed_warn_ratio) {
            return Err(FoldError::Config(
                "input.malformed_warn_ratio must be within 0..=1".into(),
            ));
        }
        self.resolver.extra_args()?;
        Ok(())
    }
}

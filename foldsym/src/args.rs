use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use crate::{
    capture::CaptureFormat,
    config::{CountMode, FoldConfig, OutputOrder},
    pipeline::{JitMapInput, RunInputs},
};

#[derive(Debug, Parser)]
#[clap(version, about = "Symbolicate sampled call chains and fold them for flame graphs")]
pub struct Opt {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Resolve a capture and write folded stacks
    Fold(FoldArgs),
    /// Print what symbolication sees in ELF files
    Symbols {
        paths: Vec<PathBuf>,
    },
}

#[derive(Args, Debug, Default)]
pub struct FoldArgs {
    /// raw sample capture
    pub capture: PathBuf,
    /// build-id manifest of the pulled binaries
    #[clap(short, long)]
    pub manifest: Option<PathBuf>,
    /// JIT map: `perf-<pid>.map`, `<pid>=<path>`, or a directory of map files
    #[clap(short, long = "jit-map")]
    pub jit_maps: Vec<String>,
    /// folded output, stdout if not given
    #[clap(short, long)]
    pub output: Option<PathBuf>,
    /// TOML config, flags below override it
    #[clap(short, long)]
    pub config: Option<PathBuf>,
    /// write a JSON run summary here
    #[clap(long)]
    pub summary: Option<PathBuf>,

    #[clap(long)]
    pub cache_dir: Option<PathBuf>,
    /// where the device transport left pulled binaries
    #[clap(long)]
    pub pulled_dir: Option<PathBuf>,
    /// root of locally built unstripped binaries, repeatable
    #[clap(long = "symbol-dir")]
    pub symbol_dirs: Vec<PathBuf>,
    #[clap(long)]
    pub symfs: Option<PathBuf>,
    /// line-table tool, e.g. a prebuilt llvm-symbolizer
    #[clap(long)]
    pub symbolizer: Option<PathBuf>,
    /// skip the line-table step
    #[clap(long, conflicts_with = "symbolizer")]
    pub no_symbolizer: bool,
    #[clap(long)]
    pub concurrency: Option<usize>,
    #[clap(long)]
    pub timeout_ms: Option<u64>,
    #[clap(long)]
    pub format: Option<CaptureFormat>,
    #[clap(long)]
    pub count: Option<CountMode>,
    #[clap(long)]
    pub order: Option<OutputOrder>,
}

impl FoldArgs {
    /// Config file (or defaults) with flags applied on top
    pub fn config(&self) -> Result<FoldConfig> {
        let mut config = match &self.config {
            Some(path) => FoldConfig::from_path(path)?,
            None => FoldConfig::default(),
        };

        if let Some(dir) = &self.cache_dir {
            config.store.cache_dir = dir.clone();
        }
        if let Some(dir) = &self.pulled_dir {
            config.store.pulled_dir = Some(dir.clone());
        }
        config.store.symbol_dirs.extend(self.symbol_dirs.iter().cloned());
        if let Some(root) = &self.symfs {
            config.symfs.root = root.clone();
        }
        if let Some(symbolizer) = &self.symbolizer {
            config.resolver.symbolizer = Some(symbolizer.clone());
        }
        if self.no_symbolizer {
            config.resolver.symbolizer = None;
        }
        if let Some(n) = self.concurrency {
            config.resolver.concurrency = n;
        }
        if let Some(ms) = self.timeout_ms {
            config.resolver.timeout_ms = ms;
        }
        if let Some(format) = self.format {
            config.input.format = format;
        }
        if let Some(count) = self.count {
            config.output.count = count;
        }
        if let Some(order) = self.order {
            config.output.order = order;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn inputs(&self) -> RunInputs {
        RunInputs {
            capture: self.capture.clone(),
            manifest: self.manifest.clone(),
            jit_maps: self.jit_maps.iter().map(|s| JitMapInput::parse(s)).collect(),
            output: self.output.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let opt = Opt::parse_from([
            "foldsym",
            "fold",
            "capture.txt",
            "-m",
            "manifest.txt",
            "-j",
            "4242=jit.map",
            "-j",
            "maps/",
            "--symbol-dir",
            "/symbols",
            "--no-symbolizer",
            "--count",
            "samples",
            "--order",
            "count",
            "--format",
            "report-sample",
        ]);
        let Commands::Fold(args) = opt.command else {
            panic!("expected fold");
        };
        let config = args.config().unwrap();
        assert_eq!(config.store.symbol_dirs, vec![PathBuf::from("/symbols")]);
        assert_eq!(config.resolver.symbolizer, None);
        assert_eq!(config.output.count, CountMode::Samples);
        assert_eq!(config.output.order, OutputOrder::Count);
        assert_eq!(config.input.format, CaptureFormat::ReportSample);

        let inputs = args.inputs();
        assert_eq!(inputs.manifest, Some(PathBuf::from("manifest.txt")));
        assert_eq!(inputs.jit_maps[0].pid, Some(4242));
        assert_eq!(inputs.jit_maps[1].path, PathBuf::from("maps/"));
        assert_eq!(inputs.output, None);
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let args = FoldArgs {
            capture: PathBuf::from("capture.txt"),
            concurrency: Some(0),
            ..Default::default()
        };
        assert!(args.config().is_err());
    }
}

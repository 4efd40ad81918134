use std::fmt;

use serde::{Deserialize, Serialize};

use crate::BuildId;

/// How a frame names the binary it was sampled in
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryIdentity {
    BuildId(BuildId),
    /// runtime path or bare module name as printed by the profiler
    Path(String),
}

impl BinaryIdentity {
    /// Short module name used in placeholders, e.g. `libfoo.so`
    pub fn module_name(&self) -> &str {
        match self {
            BinaryIdentity::BuildId(id) => id.as_str(),
            BinaryIdentity::Path(p) => module_basename(p),
        }
    }
}

impl fmt::Display for BinaryIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinaryIdentity::BuildId(id) => write!(f, "buildid:{id}"),
            BinaryIdentity::Path(p) => f.write_str(p),
        }
    }
}

/// Last path component, tolerant of trailing annotations such as
/// `/memfd:jit-cache (deleted)`.
pub fn module_basename(path: &str) -> &str {
    let path = path.trim_end_matches('/');
    path.rsplit('/').next().unwrap_or(path)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFrame {
    pub binary: BinaryIdentity,
    /// address as used by the binary's symbol table (vaddr in file)
    pub virtual_address: u64,
    /// offset printed in placeholders
    pub module_offset: u64,
    /// false for frames printed with a symbol but no address
    pub has_address: bool,
    /// name the on-device profiler already attached to the frame
    pub reported_symbol: Option<String>,
}

impl RawFrame {
    pub fn new(binary: BinaryIdentity, address: u64) -> Self {
        Self {
            binary,
            virtual_address: address,
            module_offset: address,
            has_address: true,
            reported_symbol: None,
        }
    }

    pub fn symbol_only(binary: BinaryIdentity, symbol: impl Into<String>) -> Self {
        Self {
            binary,
            virtual_address: 0,
            module_offset: 0,
            has_address: false,
            reported_symbol: Some(symbol.into()),
        }
    }

    pub fn with_reported_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.reported_symbol = Some(symbol.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub pid: u32,
    pub tid: u32,
    pub timestamp: u64,
    /// per-sample weight, 1 unless the capture carries event counts
    pub weight: u64,
    /// innermost frame first
    pub call_chain: Vec<RawFrame>,
}

impl Sample {
    pub fn new(pid: u32, call_chain: Vec<RawFrame>) -> Self {
        Self {
            pid,
            tid: pid,
            timestamp: 0,
            weight: 1,
            call_chain,
        }
    }
}

/// Samples in capture order. Never mutated after parsing.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Capture {
    samples: Vec<Sample>,
}

impl Capture {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

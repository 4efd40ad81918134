use std::fmt;

use serde::{Deserialize, Serialize};

/// Which step of the resolution chain produced a name
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    PrimarySymbolTable,
    JitMap,
    FallbackLineTable,
    Unresolved,
}

impl ResolutionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionSource::PrimarySymbolTable => "symbol_table",
            ResolutionSource::JitMap => "jit_map",
            ResolutionSource::FallbackLineTable => "line_table",
            ResolutionSource::Unresolved => "unresolved",
        }
    }
}

impl fmt::Display for ResolutionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolvedFrame {
    pub name: String,
    pub source: ResolutionSource,
}

impl ResolvedFrame {
    pub fn new(name: impl Into<String>, source: ResolutionSource) -> Self {
        Self {
            name: name.into(),
            source,
        }
    }

    /// `<module>+0x<offset>`, used when nothing else knows the address
    pub fn placeholder(module: &str, offset: u64) -> Self {
        Self::new(format!("{module}+0x{offset:x}"), ResolutionSource::Unresolved)
    }
}

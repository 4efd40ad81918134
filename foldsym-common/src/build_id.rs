use std::{fmt, str::FromStr};

use debugid::CodeId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Content derived identifier of a binary (the ELF `NT_GNU_BUILD_ID` note).
///
/// Always stored as lowercase hex without the `0x` prefix, so ids coming from
/// a manifest and ids read out of an ELF note compare equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildId(CodeId);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildIdError {
    #[error("empty build id")]
    Empty,
    #[error("build id is not hex: {0}")]
    NotHex(String),
    #[error("build id has an odd number of digits: {0}")]
    OddLength(String),
}

impl BuildId {
    pub fn parse(s: &str) -> Result<Self, BuildIdError> {
        let s = s.trim();
        let hex = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        if hex.is_empty() {
            return Err(BuildIdError::Empty);
        }
        if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(BuildIdError::NotHex(s.to_owned()));
        }
        if hex.len() % 2 != 0 {
            return Err(BuildIdError::OddLength(s.to_owned()));
        }
        Ok(Self(CodeId::new(hex.to_ascii_lowercase())))
    }

    /// Build id from the raw bytes of an ELF note
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(CodeId::from_binary(bytes))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl FromStr for BuildId {
    type Err = BuildIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

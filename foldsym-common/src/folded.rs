use std::fmt;

use serde::{Deserialize, Serialize};

/// One line of folded-stack output
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoldedStackEntry {
    /// outermost frame first
    pub frames: Vec<String>,
    pub count: u64,
}

impl FoldedStackEntry {
    pub fn new(frames: Vec<String>, count: u64) -> Self {
        Self { frames, count }
    }
}

/// `a;b;c 482`, the line format flame-graph renderers consume
impl fmt::Display for FoldedStackEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, frame) in self.frames.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            f.write_str(frame)?;
        }
        write!(f, " {}", self.count)
    }
}

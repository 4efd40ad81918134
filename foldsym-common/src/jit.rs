use serde::{Deserialize, Serialize};

/// One JIT-compiled method, `[start, end)` in the address space of `pid`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitMapEntry {
    pub pid: u32,
    pub start: u64,
    pub end: u64,
    pub name: String,
}

impl JitMapEntry {
    pub fn new(pid: u32, start: u64, size: u64, name: impl Into<String>) -> Self {
        Self {
            pid,
            start,
            end: start.saturating_add(size),
            name: name.into(),
        }
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

pub mod build_id;
pub mod folded;
pub mod frame;
pub mod jit;
pub mod sample;

pub use build_id::{BuildId, BuildIdError};
pub use folded::FoldedStackEntry;
pub use frame::{ResolutionSource, ResolvedFrame};
pub use jit::JitMapEntry;
pub use sample::{module_basename, BinaryIdentity, Capture, RawFrame, Sample};

/// Frame name used for samples whose call chain is empty
pub const UNKNOWN_FRAME: &str = "unknown";

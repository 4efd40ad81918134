pub mod binary_store;
pub mod dump_elf;
pub mod elf;
pub mod jit_map;
pub mod line_table;
pub mod memo;
pub mod resolver;
pub mod symfs;

pub use binary_store::{BinaryArtifact, BinaryStore, RemoteHint};
pub use jit_map::{JitMaps, pid_from_map_path};
pub use line_table::{LineTableResolver, LlvmSymbolizer};
pub use resolver::AddressResolver;
pub use symfs::SymbolView;

//! Fixtures shared by the scenario binary and the integration tests.

use std::{
    fs,
    path::{Path, PathBuf},
};

use foldsym::config::FoldConfig;
use object::{
    write::{Object, StandardSection, Symbol, SymbolSection},
    Architecture, BinaryFormat, Endianness, SectionKind, SymbolFlags, SymbolKind, SymbolScope,
};
use tempfile::TempDir;

/// ELF file builder, stripped unless symbols are added
#[derive(Debug, Default, Clone)]
pub struct ElfFixture {
    symbols: Vec<(String, u64, u64)>,
    build_id: Option<Vec<u8>>,
    debug_info: bool,
}

impl ElfFixture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn symbol(mut self, name: &str, address: u64, size: u64) -> Self {
        self.symbols.push((name.to_owned(), address, size));
        self
    }

    pub fn build_id(mut self, bytes: &[u8]) -> Self {
        self.build_id = Some(bytes.to_vec());
        self
    }

    /// add a `.debug_info` section so a line-table tool may answer
    pub fn debug_info(mut self) -> Self {
        self.debug_info = true;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut obj = Object::new(BinaryFormat::Elf, Architecture::Aarch64, Endianness::Little);
        let text = obj.section_id(StandardSection::Text);
        obj.append_section_data(text, &[0u8; 0x4000], 16);

        for (name, address, size) in &self.symbols {
            obj.add_symbol(Symbol {
                name: name.as_bytes().to_vec(),
                value: *address,
                size: *size,
                kind: SymbolKind::Text,
                scope: SymbolScope::Linkage,
                weak: false,
                section: SymbolSection::Section(text),
                flags: SymbolFlags::None,
            });
        }

        if let Some(build_id) = &self.build_id {
            let mut note = Vec::new();
            note.extend_from_slice(&4u32.to_le_bytes());
            note.extend_from_slice(&(build_id.len() as u32).to_le_bytes());
            note.extend_from_slice(&object::elf::NT_GNU_BUILD_ID.to_le_bytes());
            note.extend_from_slice(b"GNU\0");
            note.extend_from_slice(build_id);
            while note.len() % 4 != 0 {
                note.push(0);
            }
            let section = obj.add_section(Vec::new(), b".note.gnu.build-id".to_vec(), SectionKind::Note);
            obj.append_section_data(section, &note, 4);
        }

        if self.debug_info {
            let section = obj.add_section(Vec::new(), b".debug_info".to_vec(), SectionKind::Debug);
            obj.append_section_data(section, &[0u8; 16], 1);
        }

        obj.write().expect("fixture object must serialize")
    }
}

/// Temporary directory laid out like a run: `pulled/`, `cache/`, `symfs/`,
/// `symbols/`, plus whatever inputs a test writes.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("temp dir"),
        }
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Write `data` at `relative`, creating parent directories
    pub fn write(&self, relative: &str, data: impl AsRef<[u8]>) -> PathBuf {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create fixture dir");
        }
        fs::write(&path, data).expect("write fixture");
        path
    }

    pub fn config(&self) -> FoldConfig {
        let mut config = FoldConfig::default();
        config.store.cache_dir = self.path("cache");
        config.store.pulled_dir = Some(self.path("pulled"));
        config.symfs.root = self.path("symfs");
        config.resolver.symbolizer = None;
        config
    }

    pub fn with_symbol_dir(&self, mut config: FoldConfig) -> FoldConfig {
        config.store.symbol_dirs = vec![self.path("symbols")];
        config
    }
}

impl Default for Workspace {
    fn default() -> Self {
        Self::new()
    }
}

pub const B1: &[u8] = &[0xb1, 0xb1, 0xb1, 0xb1];
pub const LIBFOO: &str = "system/lib64/libfoo.so";

/// The stripped `libfoo.so` pulled from the device, and its manifest
pub fn pulled_libfoo(ws: &Workspace) {
    ws.write(&format!("pulled/{LIBFOO}"), ElfFixture::new().build_id(B1).build());
    ws.write("manifest.txt", format!("0xb1b1b1b1={LIBFOO}\n"));
}

/// The locally built, unstripped `libfoo.so`
pub fn local_libfoo(ws: &Workspace) {
    ws.write(
        &format!("symbols/{LIBFOO}"),
        ElfFixture::new()
            .symbol("foo_compute", 0x1000, 0x100)
            .symbol("_ZN3foo4mainEv", 0x2000, 0x80)
            .build_id(B1)
            .build(),
    );
}

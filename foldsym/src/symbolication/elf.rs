use std::collections::BTreeMap;

use foldsym_common::BuildId;
use object::{Object, ObjectSection, ObjectSymbol, SymbolKind};
use symbolic::demangle::demangle;

/// Sections that let a line-table tool name addresses even without `.symtab`
const DEBUG_SECTIONS: &[&str] = &[".debug_info", ".debug_line", ".gnu_debugdata"];

/// What a binary offers for symbolication
#[derive(Debug)]
pub struct ElfInfo {
    pub build_id: Option<BuildId>,
    /// no defined function in `.symtab`
    pub stripped: bool,
    /// unstripped, or carries debug sections a line-table tool can use
    pub debuggable: bool,
    pub symbols: ElfSymbols,
}

impl ElfInfo {
    pub fn parse(data: &[u8], demangle_names: bool) -> Result<Self, object::Error> {
        let obj_file = object::File::parse(data)?;
        let build_id = obj_file
            .build_id()
            .ok()
            .flatten()
            .filter(|id| !id.is_empty())
            .map(BuildId::from_bytes);
        let stripped = !obj_file.symbols().any(|sym| is_function(&sym));
        let debuggable =
            !stripped || DEBUG_SECTIONS.iter().any(|s| obj_file.section_by_name(s).is_some());
        let symbols = ElfSymbols::build(&obj_file, demangle_names);

        Ok(Self {
            build_id,
            stripped,
            debuggable,
            symbols,
        })
    }
}

fn is_function<'data, S: ObjectSymbol<'data>>(sym: &S) -> bool {
    sym.kind() == SymbolKind::Text && sym.is_definition()
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SymbolEntry {
    name: String,
    /// 0 when the symbol table does not say
    size: u64,
}

/// Function symbols of one binary, keyed by start address
#[derive(Debug, Default)]
pub struct ElfSymbols {
    map: BTreeMap<u64, SymbolEntry>,
}

impl ElfSymbols {
    fn build(obj_file: &object::File<'_>, demangle_names: bool) -> Self {
        let mut map = BTreeMap::new();
        for sym in obj_file.symbols().chain(obj_file.dynamic_symbols()) {
            if !is_function(&sym) {
                continue;
            }
            let Ok(name) = sym.name() else { continue };
            if name.is_empty() {
                continue;
            }
            let name = if demangle_names {
                demangle(name).into_owned()
            } else {
                name.to_owned()
            };
            // .symtab comes first and wins over .dynsym for the same address
            map.entry(sym.address()).or_insert(SymbolEntry {
                name,
                size: sym.size(),
            });
        }

        Self { map }
    }

    /// Nearest symbol at or before `addr` that covers it
    pub fn find(&self, addr: u64) -> Option<&str> {
        self.map
            .range(..=addr)
            .next_back()
            .filter(|(start, s)| s.size == 0 || addr - **start < s.size)
            .map(|(_, s)| s.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &str)> {
        self.map.iter().map(|(addr, s)| (*addr, s.name.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{elf_with_debug_info, elf_with_symbols, stripped_elf};

    #[test]
    fn test_find_nearest_covering() {
        let data = elf_with_symbols(&[("foo_compute", 0x1000, 0x100), ("bar", 0x1200, 0)]);
        let info = ElfInfo::parse(&data, true).unwrap();
        assert!(!info.stripped);
        assert!(info.debuggable);
        assert_eq!(info.symbols.find(0x1000), Some("foo_compute"));
        assert_eq!(info.symbols.find(0x10ff), Some("foo_compute"));
        // past the end of foo_compute, before bar
        assert_eq!(info.symbols.find(0x1100), None);
        assert_eq!(info.symbols.find(0xfff), None);
        // unknown size covers up to the next symbol
        assert_eq!(info.symbols.find(0x5000), Some("bar"));
    }

    #[test]
    fn test_stripped() {
        let info = ElfInfo::parse(&stripped_elf(), true).unwrap();
        assert!(info.stripped);
        assert!(!info.debuggable);
        assert!(info.symbols.is_empty());
        assert_eq!(info.build_id, None);
    }

    #[test]
    fn test_debug_sections_make_stripped_debuggable() {
        let info = ElfInfo::parse(&elf_with_debug_info(), true).unwrap();
        assert!(info.stripped);
        assert!(info.debuggable);
    }

    #[test]
    fn test_demangles() {
        let data = elf_with_symbols(&[("_ZN3art6Thread3RunEv", 0x2000, 0x40)]);
        let info = ElfInfo::parse(&data, true).unwrap();
        assert_eq!(info.symbols.find(0x2010), Some("art::Thread::Run()"));
        let info = ElfInfo::parse(&data, false).unwrap();
        assert_eq!(info.symbols.find(0x2010), Some("_ZN3art6Thread3RunEv"));
    }

    #[test]
    fn test_not_an_elf() {
        assert!(ElfInfo::parse(b"definitely not an object file", true).is_err());
    }
}

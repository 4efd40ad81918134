//! ELF fixtures built with `object::write`.

use object::{
    write::{Object, StandardSection, Symbol, SymbolSection},
    Architecture, BinaryFormat, Endianness, SectionKind, SymbolFlags, SymbolKind, SymbolScope,
};

fn base_object() -> (Object<'static>, object::write::SectionId) {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::Aarch64, Endianness::Little);
    let text = obj.section_id(StandardSection::Text);
    obj.append_section_data(text, &[0u8; 0x4000], 16);
    (obj, text)
}

fn add_functions(obj: &mut Object<'static>, text: object::write::SectionId, symbols: &[(&str, u64, u64)]) {
    for (name, address, size) in symbols {
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
}

/// Unstripped binary with the given `(name, address, size)` functions
pub fn elf_with_symbols(symbols: &[(&str, u64, u64)]) -> Vec<u8> {
    let (mut obj, text) = base_object();
    add_functions(&mut obj, text, symbols);
    obj.write().unwrap()
}

/// Binary with code but no function symbols
pub fn stripped_elf() -> Vec<u8> {
    let (obj, _) = base_object();
    obj.write().unwrap()
}

/// Same as [`elf_with_symbols`] plus a GNU build-id note
pub fn elf_with_build_id(symbols: &[(&str, u64, u64)], build_id: &[u8]) -> Vec<u8> {
    let (mut obj, text) = base_object();
    add_functions(&mut obj, text, symbols);

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
    obj.write().unwrap()
}

/// No function symbols, but a `.debug_info` section a line-table tool could use
pub fn elf_with_debug_info() -> Vec<u8> {
    let (mut obj, _) = base_object();
    let section = obj.add_section(Vec::new(), b".debug_info".to_vec(), SectionKind::Debug);
    obj.append_section_data(section, &[0u8; 16], 1);
    obj.write().unwrap()
}

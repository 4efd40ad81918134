use std::{io::Write, path::Path};

use anyhow::{Context, Result};
use symbolic::{common::ByteView, debuginfo::elf::ElfObject, demangle::demangle};

use super::elf::ElfInfo;

/// Print what symbolication would get out of the binary at `path`
pub fn dump_elf<P: AsRef<Path>, W: Write>(path: P, out: &mut W) -> Result<()> {
    let path = path.as_ref();
    let buffer = ByteView::open(path).with_context(|| format!("unable to open {}", path.display()))?;
    let obj = ElfObject::parse(&buffer).with_context(|| format!("{} is not an ELF file", path.display()))?;
    let info = ElfInfo::parse(&buffer, true)?;

    writeln!(out, "{}", path.display())?;
    writeln!(out, "\tarch: {}", obj.arch())?;
    writeln!(out, "\tkind: {:?}", obj.kind())?;
    writeln!(out, "\tdebug_id: {}", obj.debug_id())?;
    match &info.build_id {
        Some(id) => writeln!(out, "\tbuild_id: {id}")?,
        None => writeln!(out, "\tbuild_id: none")?,
    }
    writeln!(out, "\tstripped: {}", info.stripped)?;
    writeln!(out, "\tdebuggable: {}", info.debuggable)?;
    writeln!(out, "\tsymbols: ")?;
    for sym in obj.symbol_map() {
        let name = sym.name().map(demangle).unwrap_or_default();
        writeln!(out, "\t\t0x{:x}\t{}", sym.address, name)?;
    }

    Ok(())
}

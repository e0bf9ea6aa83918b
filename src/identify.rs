//! Who is this pc? The nearest function symbol, if the module has symbols.

use core::mem::offset_of;

use arrayvec::ArrayString;
use libc::Elf64_Sym as Sym;

use crate::elf::{ModuleImage, SymbolTable};
use crate::memory::MemoryView;
use crate::{Result, NAME_CAPACITY};

const STT_FUNC: u8 = 2;
const SHN_UNDEF: u16 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInfo {
    pub name: ArrayString<NAME_CAPACITY>,
    /// How far into the function the pc is.
    pub offset: usize,
}

struct Symbol {
    name: u32,
    info: u8,
    shndx: u16,
    value: usize,
    size: usize,
}

impl Symbol {
    fn read(view: MemoryView<'_>, addr: usize) -> Result<Self> {
        Ok(Self {
            name: view.read_u32(addr + offset_of!(Sym, st_name))?,
            info: view.read_u8(addr + offset_of!(Sym, st_info))?,
            shndx: view.read_u16(addr + offset_of!(Sym, st_shndx))?,
            value: view.read_u64(addr + offset_of!(Sym, st_value))? as usize,
            size: view.read_u64(addr + offset_of!(Sym, st_size))? as usize,
        })
    }

    fn is_defined_function(&self) -> bool {
        self.info & 0xf == STT_FUNC && self.shndx != SHN_UNDEF
    }
}

/// Finds the function containing `rel_pc` by scanning every symbol table of
/// the image. Symbol values are virtual addresses, so they are moved into
/// relative pc space through the executable segment's bias first.
///
/// No match is not an error, the function is just unknown.
pub fn identify(image: &ModuleImage<'_>, rel_pc: usize) -> Option<FunctionInfo> {
    let view = image.view();
    image
        .symbol_tables()
        .iter()
        .find_map(|table| match lookup(view, table, image.exec_bias(), rel_pc) {
            Ok(found) => found,
            Err(err) => {
                debug!(?err, "symbol table lookup failed");
                None
            }
        })
}

fn lookup(view: MemoryView<'_>, table: &SymbolTable, exec_bias: usize, rel_pc: usize) -> Result<Option<FunctionInfo>> {
    let count = table.symbols.size / table.entry_size;
    for i in 0..count {
        let symbol = Symbol::read(view, table.symbols.addr + i * table.entry_size)?;
        if !symbol.is_defined_function() {
            continue;
        }
        let start = symbol.value.wrapping_sub(exec_bias);
        if rel_pc < start || rel_pc - start >= symbol.size {
            continue;
        }

        let name = symbol_name(view, table, symbol.name)?;
        trace!(%name, "found symbol for {rel_pc:#x}");
        return Ok(Some(FunctionInfo {
            name,
            offset: rel_pc - start,
        }));
    }
    Ok(None)
}

fn symbol_name(view: MemoryView<'_>, table: &SymbolTable, offset: u32) -> Result<ArrayString<NAME_CAPACITY>> {
    let mut name = ArrayString::new();
    if offset as usize >= table.strings.size {
        return Ok(name);
    }
    let strings = view.subview(table.strings.addr, table.strings.size)?;
    let mut buf = [0u8; NAME_CAPACITY];
    let bytes = match strings.read_cstring(table.strings.addr + offset as usize, &mut buf) {
        Ok(bytes) => bytes,
        Err(_) => return Ok(name),
    };
    let valid = match core::str::from_utf8(bytes) {
        Ok(s) => s,
        // cut at the last char boundary, which also handles a multibyte
        // character we truncated in half
        Err(e) => core::str::from_utf8(&bytes[..e.valid_up_to()]).unwrap_or_default(),
    };
    for c in valid.chars() {
        if name.try_push(c).is_err() {
            break;
        }
    }
    Ok(name)
}

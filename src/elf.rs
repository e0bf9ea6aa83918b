//! Just enough ELF to find a module's unwind data and its symbols.
//!
//! A module comes in one of two shapes:
//! - a file image, the whole ELF file mapped somewhere. Headers are found
//!   through file offsets and everything is in the image's own address
//!   space.
//! - a live image, the module as the dynamic linker loaded it into this
//!   process. There are no section headers to speak of, only the program
//!   headers the linker hands us.
//!
//! Callers talk to both in terms of *relative pcs*, `pc - load_bias`, and
//! [`ModuleImage::cfi_address`] maps those into wherever the image has its
//! `.eh_frame` bytes.


use core::mem::{offset_of, size_of};

use arrayvec::ArrayVec;
use libc::{Elf64_Ehdr as Ehdr, Elf64_Phdr as Phdr, Elf64_Shdr as Shdr, Elf64_Sym as Sym};

use crate::identify::{identify, FunctionInfo};
use crate::memory::MemoryView;
use crate::{Error, Result, MAX_SYMBOL_TABLES};

const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHT_NOTE: u32 = 7;
const SHT_DYNSYM: u32 = 11;

const NT_GNU_BUILD_ID: u32 = 3;

/// Longest build-id we hand out. GNU ld uses 20 bytes (SHA-1).
pub const MAX_BUILD_ID_LEN: usize = 64;

/// Section names we care about are all shorter than this.
const SECTION_NAME_LEN: usize = 24;

/// A piece of the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Where the bytes are in the image's memory view.
    pub addr: usize,
    pub size: usize,
    /// Virtual address minus file offset of the segment holding it.
    pub bias: usize,
}

/// A `.symtab` or `.dynsym` with the string table it names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolTable {
    pub symbols: Region,
    pub entry_size: usize,
    pub strings: Region,
}

#[derive(Debug, Clone)]
pub struct ModuleImage<'m> {
    view: MemoryView<'m>,
    /// What relative pcs are relative to, in the view's address space.
    origin: usize,
    /// Virtual address minus file offset of the first executable segment.
    exec_bias: usize,
    eh_frame_hdr: Option<Region>,
    eh_frame: Option<Region>,
    dynamic: Option<Region>,
    build_id: Option<Region>,
    symbol_tables: ArrayVec<SymbolTable, MAX_SYMBOL_TABLES>,
}

struct ProgramHeader {
    kind: u32,
    flags: u32,
    offset: usize,
    vaddr: usize,
    filesz: usize,
    memsz: usize,
}

impl ProgramHeader {
    fn read(view: MemoryView<'_>, addr: usize) -> Result<Self> {
        Ok(Self {
            kind: view.read_u32(addr + offset_of!(Phdr, p_type))?,
            flags: view.read_u32(addr + offset_of!(Phdr, p_flags))?,
            offset: view.read_u64(addr + offset_of!(Phdr, p_offset))? as usize,
            vaddr: view.read_u64(addr + offset_of!(Phdr, p_vaddr))? as usize,
            filesz: view.read_u64(addr + offset_of!(Phdr, p_filesz))? as usize,
            memsz: view.read_u64(addr + offset_of!(Phdr, p_memsz))? as usize,
        })
    }

    fn from_libc(phdr: &Phdr) -> Self {
        Self {
            kind: phdr.p_type,
            flags: phdr.p_flags,
            offset: phdr.p_offset as usize,
            vaddr: phdr.p_vaddr as usize,
            filesz: phdr.p_filesz as usize,
            memsz: phdr.p_memsz as usize,
        }
    }

    fn bias(&self) -> usize {
        self.vaddr.wrapping_sub(self.offset)
    }
}

struct SectionHeader {
    name: u32,
    kind: u32,
    addr: usize,
    offset: usize,
    size: usize,
    link: u32,
    entsize: usize,
}

impl SectionHeader {
    fn read(view: MemoryView<'_>, addr: usize) -> Result<Self> {
        Ok(Self {
            name: view.read_u32(addr + offset_of!(Shdr, sh_name))?,
            kind: view.read_u32(addr + offset_of!(Shdr, sh_type))?,
            addr: view.read_u64(addr + offset_of!(Shdr, sh_addr))? as usize,
            offset: view.read_u64(addr + offset_of!(Shdr, sh_offset))? as usize,
            size: view.read_u64(addr + offset_of!(Shdr, sh_size))? as usize,
            link: view.read_u32(addr + offset_of!(Shdr, sh_link))?,
            entsize: view.read_u64(addr + offset_of!(Shdr, sh_entsize))? as usize,
        })
    }

    fn bias(&self) -> usize {
        self.addr.wrapping_sub(self.offset)
    }
}

/// The address of entry `index` of a header table, checked to lie entirely
/// inside the image.
fn table_entry(view: MemoryView<'_>, table_offset: usize, index: usize, entry_size: usize) -> Result<usize> {
    let offset = index
        .checked_mul(entry_size)
        .and_then(|o| o.checked_add(table_offset))
        .ok_or(Error::HeaderOutOfRange)?;
    view.addr_of_offset(offset, entry_size)
        .map_err(|_| Error::HeaderOutOfRange)
}

fn region_at(view: MemoryView<'_>, offset: usize, size: usize, bias: usize) -> Result<Region> {
    let addr = view
        .addr_of_offset(offset, size)
        .map_err(|_| Error::HeaderOutOfRange)?;
    Ok(Region { addr, size, bias })
}

impl<'m> ModuleImage<'m> {
    /// Parses a whole ELF file mapped at `view`.
    #[instrument(level = "debug", skip(view), fields(base = view.base(), size = view.size()))]
    pub fn load(view: MemoryView<'m>) -> Result<Self> {
        let base = view.base();
        if !view.contains(base, size_of::<Ehdr>()) {
            return Err(Error::BadMagic);
        }

        let ident: [u8; libc::EI_NIDENT] = view.read_array(base)?;
        if ident[..4] != [libc::ELFMAG0, libc::ELFMAG1, libc::ELFMAG2, libc::ELFMAG3] {
            return Err(Error::BadMagic);
        }
        if ident[libc::EI_CLASS] != libc::ELFCLASS64 || ident[libc::EI_DATA] != libc::ELFDATA2LSB {
            debug!(class = ident[libc::EI_CLASS], data = ident[libc::EI_DATA], "not a 64-bit LE ELF");
            return Err(Error::UnsupportedElf);
        }

        let phoff = view.read_u64(base + offset_of!(Ehdr, e_phoff))? as usize;
        let phentsize = view.read_u16(base + offset_of!(Ehdr, e_phentsize))? as usize;
        let phnum = view.read_u16(base + offset_of!(Ehdr, e_phnum))? as usize;
        let shoff = view.read_u64(base + offset_of!(Ehdr, e_shoff))? as usize;
        let shentsize = view.read_u16(base + offset_of!(Ehdr, e_shentsize))? as usize;
        let shnum = view.read_u16(base + offset_of!(Ehdr, e_shnum))? as usize;
        let shstrndx = view.read_u16(base + offset_of!(Ehdr, e_shstrndx))? as usize;

        if (phnum > 0 && phentsize != size_of::<Phdr>()) || (shnum > 0 && shentsize != size_of::<Shdr>()) {
            return Err(Error::UnsupportedElf);
        }

        let mut image = ModuleImage {
            view,
            origin: base,
            exec_bias: 0,
            eh_frame_hdr: None,
            eh_frame: None,
            dynamic: None,
            build_id: None,
            symbol_tables: ArrayVec::new(),
        };

        let mut found_exec = false;
        for i in 0..phnum {
            let ph = ProgramHeader::read(view, table_entry(view, phoff, i, phentsize)?)?;
            match ph.kind {
                libc::PT_LOAD if ph.flags & libc::PF_X != 0 && !found_exec => {
                    found_exec = true;
                    image.exec_bias = ph.bias();
                }
                libc::PT_GNU_EH_FRAME => {
                    image.eh_frame_hdr = Some(region_at(view, ph.offset, ph.filesz, ph.bias())?);
                }
                libc::PT_DYNAMIC => {
                    image.dynamic = Some(region_at(view, ph.offset, ph.filesz, ph.bias())?);
                }
                _ => {}
            }
        }

        if shnum > 0 {
            image.load_sections(shoff, shnum, shstrndx)?;
        }

        debug!(
            exec_bias = image.exec_bias,
            eh_frame_hdr = ?image.eh_frame_hdr,
            symbol_tables = image.symbol_tables.len(),
            "loaded ELF image"
        );
        Ok(image)
    }

    fn load_sections(&mut self, shoff: usize, shnum: usize, shstrndx: usize) -> Result<()> {
        let view = self.view;
        let section = |index: usize| -> Result<SectionHeader> {
            if index >= shnum {
                return Err(Error::HeaderOutOfRange);
            }
            SectionHeader::read(view, table_entry(view, shoff, index, size_of::<Shdr>())?)
        };

        let names = section(shstrndx)?;
        let names = region_at(view, names.offset, names.size, 0)?;

        for i in 0..shnum {
            let sh = section(i)?;
            let mut buf = [0u8; SECTION_NAME_LEN];
            let name: &[u8] = match names.addr.checked_add(sh.name as usize) {
                Some(addr) if sh.name as usize <= names.size => {
                    let names_view = view.subview(names.addr, names.size)?;
                    names_view.read_cstring(addr, &mut buf).unwrap_or(&[])
                }
                _ => &[],
            };

            match (sh.kind, name) {
                (SHT_NOTE, b".note.gnu.build-id") => {
                    let note = region_at(view, sh.offset, sh.size, sh.bias())?;
                    self.build_id = find_build_id(view, note)?;
                }
                (SHT_SYMTAB | SHT_DYNSYM, _) => {
                    let strings = section(sh.link as usize)?;
                    if strings.kind != SHT_STRTAB || sh.entsize < size_of::<Sym>() {
                        trace!(section = i, "symbol table without a usable string table");
                        continue;
                    }
                    let table = SymbolTable {
                        symbols: region_at(view, sh.offset, sh.size, sh.bias())?,
                        entry_size: sh.entsize,
                        strings: region_at(view, strings.offset, strings.size, 0)?,
                    };
                    if self.symbol_tables.try_push(table).is_err() {
                        debug!(section = i, "too many symbol tables, ignoring");
                    }
                }
                (SHT_PROGBITS, b".eh_frame_hdr") if self.eh_frame_hdr.is_none() => {
                    self.eh_frame_hdr = Some(region_at(view, sh.offset, sh.size, sh.bias())?);
                }
                (SHT_PROGBITS, b".eh_frame") if self.eh_frame.is_none() => {
                    self.eh_frame = Some(region_at(view, sh.offset, sh.size, sh.bias())?);
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Builds an image from the program headers of an object loaded into
    /// this process, as `dl_iterate_phdr` reports them. Relative pcs are
    /// virtual addresses.
    ///
    /// # Safety
    /// The object must stay loaded while the image is in use, and
    /// `load_bias` and `phdrs` must describe it.
    pub unsafe fn from_loaded_object(load_bias: usize, phdrs: &[Phdr]) -> Result<ModuleImage<'static>> {
        let headers = || phdrs.iter().map(ProgramHeader::from_libc);

        let eh = headers()
            .find(|ph| ph.kind == libc::PT_GNU_EH_FRAME)
            .ok_or(Error::NoUnwindInfo)?;
        let segment = headers()
            .find(|ph| {
                ph.kind == libc::PT_LOAD
                    && eh.vaddr >= ph.vaddr
                    && eh.vaddr - ph.vaddr < ph.memsz
            })
            .ok_or(Error::NoUnwindInfo)?;

        let start = load_bias.checked_add(segment.vaddr).ok_or(Error::AddressOverflow)?;
        // SAFETY: the dynamic linker mapped this segment and the caller
        // promised it stays mapped.
        let view = unsafe { MemoryView::local(start, segment.memsz) };
        let eh_frame_hdr = Region {
            addr: load_bias.wrapping_add(eh.vaddr),
            size: eh.memsz,
            bias: 0,
        };
        let dynamic = headers().find(|ph| ph.kind == libc::PT_DYNAMIC).map(|ph| Region {
            addr: load_bias.wrapping_add(ph.vaddr),
            size: ph.memsz,
            bias: 0,
        });

        Ok(ModuleImage {
            view,
            origin: load_bias,
            exec_bias: 0,
            eh_frame_hdr: Some(eh_frame_hdr),
            eh_frame: None,
            dynamic,
            build_id: None,
            symbol_tables: ArrayVec::new(),
        })
    }

    pub fn view(&self) -> MemoryView<'m> {
        self.view
    }

    pub fn exec_bias(&self) -> usize {
        self.exec_bias
    }

    pub fn eh_frame_hdr(&self) -> Option<Region> {
        self.eh_frame_hdr
    }

    pub fn eh_frame(&self) -> Option<Region> {
        self.eh_frame
    }

    pub fn dynamic(&self) -> Option<Region> {
        self.dynamic
    }

    pub fn symbol_tables(&self) -> &[SymbolTable] {
        &self.symbol_tables
    }

    /// Maps a relative pc to the address space `.eh_frame` lives in, which is
    /// what FDE locations are expressed in.
    pub fn cfi_address(&self, rel_pc: usize) -> usize {
        let eh_bias = self.eh_frame_hdr.map_or(0, |hdr| hdr.bias);
        self.origin
            .wrapping_add(rel_pc)
            .wrapping_add(self.exec_bias)
            .wrapping_sub(eh_bias)
    }

    /// The function containing `rel_pc`, if the image has symbols for it.
    pub fn function_info(&self, rel_pc: usize) -> Option<FunctionInfo> {
        identify(self, rel_pc)
    }

    pub fn build_id(&self) -> Option<ArrayVec<u8, MAX_BUILD_ID_LEN>> {
        let region = self.build_id?;
        let mut id = ArrayVec::new();
        for i in 0..region.size.min(MAX_BUILD_ID_LEN) {
            id.push(self.view.read_u8(region.addr + i).ok()?);
        }
        Some(id)
    }
}

fn align4(n: usize) -> Option<usize> {
    n.checked_add(3).map(|n| n & !3)
}

/// Walks the notes in `section` for the GNU build-id and returns where its
/// descriptor is.
fn find_build_id(view: MemoryView<'_>, section: Region) -> Result<Option<Region>> {
    let end = section.addr + section.size;
    let mut at = section.addr;
    while at.checked_add(12).is_some_and(|header_end| header_end <= end) {
        let namesz = view.read_u32(at)? as usize;
        let descsz = view.read_u32(at + 4)? as usize;
        let kind = view.read_u32(at + 8)?;
        let name = at + 12;
        let desc = align4(namesz)
            .and_then(|n| name.checked_add(n))
            .ok_or(Error::AddressOverflow)?;
        let next = align4(descsz)
            .and_then(|d| desc.checked_add(d))
            .ok_or(Error::AddressOverflow)?;
        if next > end {
            break;
        }

        if kind == NT_GNU_BUILD_ID && namesz == 4 && view.read_array::<4>(name)? == *b"GNU\0" {
            return Ok(Some(Region {
                addr: desc,
                size: descsz,
                bias: section.bias,
            }));
        }
        at = next;
    }
    trace!("no build-id note");
    Ok(None)
}

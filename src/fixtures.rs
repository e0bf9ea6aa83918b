//! Synthetic unwind data, ELF images and stacks for tests.
//!
//! Everything is built with position independent encodings (`pcrel` and
//! `datarel`), so the bytes work wherever the `Vec` ends up.

use crate::arch;

pub(crate) fn uleb(mut value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

pub(crate) fn sleb(mut value: i64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

/// Call frame instructions, assembled.
pub(crate) mod cfa {
    use super::{sleb, uleb};

    pub(crate) fn def_cfa(register: usize, offset: u64) -> Vec<u8> {
        [vec![0x0c], uleb(register as u64), uleb(offset)].concat()
    }

    pub(crate) fn def_cfa_offset(offset: u64) -> Vec<u8> {
        [vec![0x0e], uleb(offset)].concat()
    }

    pub(crate) fn def_cfa_expression(expr: &[u8]) -> Vec<u8> {
        [vec![0x0f], uleb(expr.len() as u64), expr.to_vec()].concat()
    }

    /// `DW_CFA_offset` for small registers, `DW_CFA_offset_extended` otherwise.
    pub(crate) fn offset(register: usize, factored: u64) -> Vec<u8> {
        if register < 64 {
            [vec![0x80 | register as u8], uleb(factored)].concat()
        } else {
            offset_extended(register, factored)
        }
    }

    pub(crate) fn offset_extended(register: usize, factored: u64) -> Vec<u8> {
        [vec![0x05], uleb(register as u64), uleb(factored)].concat()
    }

    pub(crate) fn offset_extended_sf(register: usize, factored: i64) -> Vec<u8> {
        [vec![0x11], uleb(register as u64), sleb(factored)].concat()
    }

    pub(crate) fn undefined(register: usize) -> Vec<u8> {
        [vec![0x07], uleb(register as u64)].concat()
    }

    pub(crate) fn register(target: usize, from: usize) -> Vec<u8> {
        [vec![0x09], uleb(target as u64), uleb(from as u64)].concat()
    }

    pub(crate) fn expression(register: usize, expr: &[u8]) -> Vec<u8> {
        [vec![0x10], uleb(register as u64), uleb(expr.len() as u64), expr.to_vec()].concat()
    }

    pub(crate) fn val_expression(register: usize, expr: &[u8]) -> Vec<u8> {
        [vec![0x16], uleb(register as u64), uleb(expr.len() as u64), expr.to_vec()].concat()
    }

    pub(crate) fn advance_loc(delta: u8) -> Vec<u8> {
        assert!(delta < 64);
        vec![0x40 | delta]
    }

    pub(crate) fn restore(register: usize) -> Vec<u8> {
        assert!(register < 64);
        vec![0xc0 | register as u8]
    }

    pub(crate) fn restore_extended(register: usize) -> Vec<u8> {
        [vec![0x06], uleb(register as u64)].concat()
    }

    pub(crate) const REMEMBER_STATE: u8 = 0x0a;
    pub(crate) const RESTORE_STATE: u8 = 0x0b;
}

pub(crate) struct CieSpec {
    /// Only `z`, `R` and `S` are understood by the builder.
    pub(crate) augmentation: &'static str,
    pub(crate) code_alignment: u64,
    pub(crate) data_alignment: i64,
    pub(crate) return_address_register: u8,
    pub(crate) instructions: Vec<u8>,
}

impl Default for CieSpec {
    /// What a compiler emits for an ordinary function right at its entry:
    /// the CFA is the stack pointer before the call, and the return address
    /// is the word just below it.
    fn default() -> Self {
        let word = core::mem::size_of::<usize>();
        Self {
            augmentation: "zR",
            code_alignment: 1,
            data_alignment: -(word as i64),
            return_address_register: arch::RETURN_ADDRESS as u8,
            instructions: [
                cfa::def_cfa(arch::SP, word as u64),
                cfa::offset(arch::RETURN_ADDRESS, 1),
            ]
            .concat(),
        }
    }
}

/// A function covered by an FDE. Offsets are from the start of the image.
pub(crate) struct FunctionCfi {
    pub(crate) start: usize,
    pub(crate) len: usize,
    pub(crate) instructions: Vec<u8>,
}

impl FunctionCfi {
    pub(crate) fn new(start: usize, len: usize, instructions: Vec<u8>) -> Self {
        Self {
            start,
            len,
            instructions,
        }
    }
}

/// Where [`push_unwind_sections`] put things, as offsets into the image.
pub(crate) struct UnwindSections {
    pub(crate) hdr: usize,
    pub(crate) hdr_len: usize,
    pub(crate) eh_frame: usize,
    pub(crate) eh_frame_len: usize,
    pub(crate) cie: usize,
    /// In the order the functions were passed.
    pub(crate) fdes: Vec<usize>,
}

fn align(image: &mut Vec<u8>, to: usize) {
    while image.len() % to != 0 {
        image.push(0);
    }
}

fn put_u32(image: &mut [u8], at: usize, value: u32) {
    image[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_i32(image: &mut [u8], at: usize, value: i64) {
    let value = i32::try_from(value).expect("fixture offset fits in i32");
    image[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u16(image: &mut [u8], at: usize, value: u16) {
    image[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(image: &mut [u8], at: usize, value: u64) {
    image[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

/// Appends an entry body (everything after the length field), padded with
/// `DW_CFA_nop` so the next entry is aligned.
fn push_entry(image: &mut Vec<u8>, mut body: Vec<u8>) -> usize {
    while (body.len() + 4) % 8 != 0 {
        body.push(0);
    }
    let at = image.len();
    image.extend_from_slice(&(body.len() as u32).to_le_bytes());
    image.extend_from_slice(&body);
    at
}

/// Appends an `.eh_frame_hdr` followed by an `.eh_frame` with one CIE and an
/// FDE per function. Without `search_table` the header says the table is
/// omitted.
pub(crate) fn push_unwind_sections(
    image: &mut Vec<u8>,
    cie: &CieSpec,
    functions: &[FunctionCfi],
    search_table: bool,
) -> UnwindSections {
    align(image, 8);
    let hdr = image.len();
    let hdr_len = if search_table { 12 + 8 * functions.len() } else { 8 };
    image.resize(hdr + hdr_len, 0);
    align(image, 8);

    let eh_frame = image.len();

    let mut body = Vec::new();
    body.extend_from_slice(&0u32.to_le_bytes());
    body.push(1);
    body.extend_from_slice(cie.augmentation.as_bytes());
    body.push(0);
    body.extend(uleb(cie.code_alignment));
    body.extend(sleb(cie.data_alignment));
    body.push(cie.return_address_register);
    let has_z = cie.augmentation.starts_with('z');
    if has_z {
        let data: Vec<u8> = cie
            .augmentation
            .bytes()
            .filter(|&c| c == b'R')
            .map(|_| 0x1b) // DW_EH_PE_pcrel | DW_EH_PE_sdata4
            .collect();
        body.extend(uleb(data.len() as u64));
        body.extend(data);
    }
    body.extend_from_slice(&cie.instructions);
    let cie_at = push_entry(image, body);

    let mut fdes = Vec::new();
    for function in functions {
        let fde = image.len();
        let mut body = Vec::new();
        body.extend_from_slice(&((fde + 4 - cie_at) as u32).to_le_bytes());
        body.extend_from_slice(&(function.start as i64 - (fde + 8) as i64).to_le_bytes()[..4]);
        body.extend_from_slice(&(function.len as u32).to_le_bytes());
        if has_z {
            body.push(0);
        }
        body.extend_from_slice(&function.instructions);
        push_entry(image, body);
        fdes.push(fde);
    }
    image.extend_from_slice(&0u32.to_le_bytes());
    let eh_frame_len = image.len() - eh_frame;

    image[hdr] = 1;
    image[hdr + 1] = 0x1b; // eh_frame_ptr: pcrel sdata4
    if search_table {
        image[hdr + 2] = 0x03; // fde_count: udata4
        image[hdr + 3] = 0x3b; // table: datarel sdata4
    } else {
        image[hdr + 2] = 0xff;
        image[hdr + 3] = 0xff;
    }
    put_i32(image, hdr + 4, eh_frame as i64 - (hdr + 4) as i64);
    if search_table {
        put_u32(image, hdr + 8, functions.len() as u32);
        let mut sorted: Vec<_> = functions.iter().zip(&fdes).collect();
        sorted.sort_by_key(|(f, _)| f.start);
        for (i, (function, &fde)) in sorted.into_iter().enumerate() {
            let entry = hdr + 12 + 8 * i;
            put_i32(image, entry, function.start as i64 - hdr as i64);
            put_i32(image, entry + 4, fde as i64 - hdr as i64);
        }
    }

    UnwindSections {
        hdr,
        hdr_len,
        eh_frame,
        eh_frame_len,
        cie: cie_at,
        fdes,
    }
}

/// Start of the fake `.text` in images from [`elf_image`].
pub(crate) const TEXT_START: usize = 0x1000;
pub(crate) const TEXT_END: usize = 0x2000;
/// Difference between virtual addresses and file offsets in images from
/// [`elf_image`].
pub(crate) const VADDR_BIAS: usize = 0x20_0000;

pub(crate) struct ElfSpec {
    pub(crate) cie: CieSpec,
    pub(crate) functions: Vec<FunctionCfi>,
    pub(crate) search_table: bool,
    /// Emit `PT_GNU_EH_FRAME`; without it only the section headers say where
    /// the unwind data is.
    pub(crate) eh_frame_segment: bool,
    /// `(name, start offset, size)`
    pub(crate) symbols: Vec<(&'static str, usize, usize)>,
    pub(crate) build_id: Option<Vec<u8>>,
}

impl Default for ElfSpec {
    fn default() -> Self {
        Self {
            cie: CieSpec::default(),
            functions: Vec::new(),
            search_table: true,
            eh_frame_segment: true,
            symbols: Vec::new(),
            build_id: None,
        }
    }
}

const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHT_NOTE: u32 = 7;

/// A little ELF64 shared object: headers, unwind data, `TEXT_START..TEXT_END`
/// of `int3`, a symbol table and optionally a build-id note.
pub(crate) fn elf_image(spec: &ElfSpec) -> Vec<u8> {
    let mut image = vec![0u8; 0x200];
    let unwind = push_unwind_sections(&mut image, &spec.cie, &spec.functions, spec.search_table);
    assert!(image.len() <= TEXT_START, "unwind data runs into .text");
    image.resize(TEXT_START, 0);
    image.resize(TEXT_END, 0xcc);

    // symbol table: the null symbol, the requested functions, an import and
    // a data object that must both be ignored
    align(&mut image, 8);
    let mut strtab = vec![0u8];
    let mut symbols = vec![[0u8; 24]];
    let mut push_symbol = |name: &str, info: u8, shndx: u16, value: usize, size: usize| {
        let mut sym = [0u8; 24];
        sym[0..4].copy_from_slice(&(strtab.len() as u32).to_le_bytes());
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);
        sym[4] = info;
        sym[6..8].copy_from_slice(&shndx.to_le_bytes());
        sym[8..16].copy_from_slice(&(value as u64).to_le_bytes());
        sym[16..24].copy_from_slice(&(size as u64).to_le_bytes());
        symbols.push(sym);
    };
    for &(name, start, size) in &spec.symbols {
        // STB_GLOBAL | STT_FUNC, defined in some section
        push_symbol(name, 0x12, 7, start + VADDR_BIAS, size);
    }
    push_symbol("imported", 0x12, 0, TEXT_START + VADDR_BIAS, 0x1000);
    // STT_OBJECT
    push_symbol("some_data", 0x11, 7, TEXT_START + VADDR_BIAS, 0x1000);

    let symtab = image.len();
    for sym in &symbols {
        image.extend_from_slice(sym);
    }
    let symtab_len = image.len() - symtab;

    let strtab_at = image.len();
    image.extend_from_slice(&strtab);
    let strtab_len = strtab.len();

    align(&mut image, 4);
    let note = image.len();
    if let Some(id) = &spec.build_id {
        image.extend_from_slice(&4u32.to_le_bytes());
        image.extend_from_slice(&(id.len() as u32).to_le_bytes());
        image.extend_from_slice(&3u32.to_le_bytes()); // NT_GNU_BUILD_ID
        image.extend_from_slice(b"GNU\0");
        image.extend_from_slice(id);
        align(&mut image, 4);
    }
    let note_len = image.len() - note;

    let names = b"\0.symtab\0.strtab\0.shstrtab\0.note.gnu.build-id\0.eh_frame_hdr\0.eh_frame\0";
    let name = |n: &str| {
        let needle = format!("{n}\0");
        names
            .windows(needle.len())
            .position(|w| w == needle.as_bytes())
            .unwrap() as u32
    };
    let shstrtab = image.len();
    image.extend_from_slice(names);

    // (name, type, offset, size, link, entsize, alloc)
    let mut sections = vec![
        (0, 0, 0, 0, 0, 0, false),
        (name(".symtab"), SHT_SYMTAB, symtab, symtab_len, 2, 24, false),
        (name(".strtab"), SHT_STRTAB, strtab_at, strtab_len, 0, 0, false),
        (name(".shstrtab"), SHT_STRTAB, shstrtab, names.len(), 0, 0, false),
        (name(".eh_frame_hdr"), SHT_PROGBITS, unwind.hdr, unwind.hdr_len, 0, 0, true),
        (name(".eh_frame"), SHT_PROGBITS, unwind.eh_frame, unwind.eh_frame_len, 0, 0, true),
    ];
    if spec.build_id.is_some() {
        sections.push((name(".note.gnu.build-id"), SHT_NOTE, note, note_len, 0, 0, true));
    }

    align(&mut image, 8);
    let shoff = image.len();
    for &(name, ty, offset, size, link, entsize, alloc) in &sections {
        let mut sh = [0u8; 64];
        sh[0..4].copy_from_slice(&name.to_le_bytes());
        sh[4..8].copy_from_slice(&ty.to_le_bytes());
        if alloc {
            sh[8..16].copy_from_slice(&2u64.to_le_bytes()); // SHF_ALLOC
            sh[16..24].copy_from_slice(&((offset + VADDR_BIAS) as u64).to_le_bytes());
        }
        sh[24..32].copy_from_slice(&(offset as u64).to_le_bytes());
        sh[32..40].copy_from_slice(&(size as u64).to_le_bytes());
        sh[40..44].copy_from_slice(&(link as u32).to_le_bytes());
        sh[56..64].copy_from_slice(&(entsize as u64).to_le_bytes());
        image.extend_from_slice(&sh);
    }

    // program headers: the whole file as one r-x segment, plus the header
    let mut phdrs = vec![(1u32, 5u32, 0usize, image.len())]; // PT_LOAD, PF_R | PF_X
    if spec.eh_frame_segment {
        phdrs.push((0x6474e550, 4, unwind.hdr, unwind.hdr_len)); // PT_GNU_EH_FRAME
    }
    for (i, &(ty, flags, offset, size)) in phdrs.iter().enumerate() {
        let at = 64 + 56 * i;
        put_u32(&mut image, at, ty);
        put_u32(&mut image, at + 4, flags);
        put_u64(&mut image, at + 8, offset as u64);
        put_u64(&mut image, at + 16, (offset + VADDR_BIAS) as u64);
        put_u64(&mut image, at + 24, (offset + VADDR_BIAS) as u64);
        put_u64(&mut image, at + 32, size as u64);
        put_u64(&mut image, at + 40, size as u64);
        put_u64(&mut image, at + 48, 0x1000);
    }

    image[0..4].copy_from_slice(b"\x7fELF");
    image[4] = 2; // ELFCLASS64
    image[5] = 1; // ELFDATA2LSB
    image[6] = 1; // EV_CURRENT
    put_u16(&mut image, 16, 3); // ET_DYN
    put_u16(&mut image, 18, 62); // EM_X86_64, not checked
    put_u32(&mut image, 20, 1);
    put_u64(&mut image, 32, 64); // e_phoff
    put_u64(&mut image, 40, shoff as u64);
    put_u16(&mut image, 52, 64); // e_ehsize
    put_u16(&mut image, 54, 56); // e_phentsize
    put_u16(&mut image, 56, phdrs.len() as u16);
    put_u16(&mut image, 58, 64); // e_shentsize
    put_u16(&mut image, 60, sections.len() as u16);
    put_u16(&mut image, 62, 3); // e_shstrndx

    image
}

/// A fake stack: a zeroed buffer that tests fill with words at known
/// addresses.
pub(crate) struct FakeStack {
    bytes: Vec<u8>,
}

impl FakeStack {
    pub(crate) fn new(words: usize) -> Self {
        Self {
            bytes: vec![0; words * core::mem::size_of::<usize>()],
        }
    }

    pub(crate) fn base(&self) -> usize {
        self.bytes.as_ptr().expose_provenance()
    }

    pub(crate) fn end(&self) -> usize {
        self.base() + self.bytes.len()
    }

    /// Address of the `index`th word.
    pub(crate) fn addr(&self, index: usize) -> usize {
        self.base() + index * core::mem::size_of::<usize>()
    }

    pub(crate) fn put(&mut self, addr: usize, value: usize) {
        let at = addr - self.base();
        self.bytes[at..at + core::mem::size_of::<usize>()].copy_from_slice(&value.to_ne_bytes());
    }

    pub(crate) fn bounds(&self) -> crate::memory::StackBounds {
        crate::memory::StackBounds::new(self.base(), self.end())
    }

    pub(crate) fn view(&self) -> crate::memory::MemoryView<'_> {
        crate::memory::MemoryView::for_slice(&self.bytes)
    }
}

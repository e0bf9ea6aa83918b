//! Implements parsing of DWARF call frame information.
//!
//! Source: https://dwarfstd.org/doc/DWARF5.pdf §6.4 Call Frame Information
//!
//! The CFI is a very large table of the following structure:
//! ```text
//! LOC CFA R0 R1 ... RN
//! L0
//! L1
//! ...
//! LN
//! ```
//!
//! The first column is the address for every location that contains code in a
//! program (a relative offset in shared object files). The remaining columns
//! contain unwinding rules that are associated with the indicated location.
//!
//! The table is never stored. Instead, each CIE and FDE carries a small
//! program that builds the rows, and this module decodes those records and
//! programs. Running them is [`super::cfi`]'s job.
//!
//! Nothing in here dereferences a pointer: every byte comes through a
//! [`Cursor`] that refuses to leave its entry.
#![allow(non_upper_case_globals)]

#[cfg(test)]
mod tests;

use core::fmt;
use core::mem::size_of;

use super::CodeRange;
use crate::memory::MemoryView;
use crate::{Error, Result};

/// Reads a DWARF entry front to back without leaving `[pos, end)`.
#[derive(Debug, Clone, Copy)]
pub struct Cursor<'a> {
    view: MemoryView<'a>,
    pos: usize,
    end: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(view: MemoryView<'a>, start: usize, end: usize) -> Self {
        Self {
            view,
            pos: start,
            end,
        }
    }

    pub fn view(&self) -> MemoryView<'a> {
        self.view
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.end
    }

    /// Moves to `pos`, which must not be past the end.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.end {
            return Err(Error::UnexpectedEnd { addr: pos });
        }
        self.pos = pos;
        Ok(())
    }

    /// Claims the next `amount` bytes and returns their address.
    fn take(&mut self, amount: usize) -> Result<usize> {
        let at = self.pos;
        match at.checked_add(amount) {
            Some(next) if next <= self.end => {
                self.pos = next;
                Ok(at)
            }
            _ => Err(Error::UnexpectedEnd { addr: at }),
        }
    }

    pub fn skip(&mut self, amount: usize) -> Result<()> {
        self.take(amount).map(drop)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let at = self.take(1)?;
        self.view.read_u8(at)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let at = self.take(2)?;
        self.view.read_u16(at)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let at = self.take(4)?;
        self.view.read_u32(at)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let at = self.take(8)?;
        self.view.read_u64(at)
    }

    pub fn read_usize(&mut self) -> Result<usize> {
        let at = self.take(size_of::<usize>())?;
        self.view.read_usize(at)
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        self.read_u8().map(|v| v as i8)
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        self.read_u16().map(|v| v as i16)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.read_u32().map(|v| v as i32)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.read_u64().map(|v| v as i64)
    }

    /// Bits past the 64th are dropped, but the bytes carrying them are still
    /// consumed.
    pub fn read_uleb128(&mut self) -> Result<u64> {
        let mut result = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift < 64 {
                result |= u64::from(byte & 0b0111_1111) << shift;
            }
            shift = shift.saturating_add(7);
            if (byte >> 7) == 0 {
                return Ok(result);
            }
        }
    }

    pub fn read_sleb128(&mut self) -> Result<i64> {
        let mut result = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift < 64 {
                result |= i64::from(byte & 0b0111_1111) << shift;
            }
            shift = shift.saturating_add(7);
            if (byte >> 7) == 0 {
                let sign_bit_set = ((byte >> 6) & 1) == 1;
                if shift < 64 && sign_bit_set {
                    result |= -1 << shift;
                }
                return Ok(result);
            }
        }
    }

    /// Reads a pointer in the given `DW_EH_PE_*` encoding. `datarel_base` is
    /// the base for `DW_EH_PE_datarel`, which only `.eh_frame_hdr` uses.
    ///
    /// Returns `None` for `DW_EH_PE_omit`, in which case nothing is consumed.
    pub fn read_encoded(
        &mut self,
        encoding: Encoding,
        datarel_base: Option<usize>,
    ) -> Result<Option<usize>> {
        if encoding.is_omit() {
            return Ok(None);
        }

        let field = self.pos;
        let value = self.read_encoded_raw(encoding)?;

        let value = match encoding.application()? {
            ValueApplication::DW_EH_PE_absptr => value,
            ValueApplication::DW_EH_PE_pcrel => field.wrapping_add(value),
            ValueApplication::DW_EH_PE_datarel => datarel_base
                .ok_or(Error::InvalidEncoding(encoding.0))?
                .wrapping_add(value),
            ValueApplication::DW_EH_PE_textrel
            | ValueApplication::DW_EH_PE_funcrel
            | ValueApplication::DW_EH_PE_aligned => {
                return Err(Error::InvalidEncoding(encoding.0))
            }
        };

        if encoding.is_indirect() {
            return self.view.read_usize(value).map(Some);
        }
        Ok(Some(value))
    }

    /// Steps over an encoded pointer without applying or dereferencing it.
    pub fn skip_encoded(&mut self, encoding: Encoding) -> Result<()> {
        if encoding.is_omit() {
            return Ok(());
        }
        self.read_encoded_raw(encoding).map(drop)
    }

    fn read_encoded_raw(&mut self, encoding: Encoding) -> Result<usize> {
        Ok(match encoding.format()? {
            ValueFormat::DW_EH_PE_absptr => self.read_usize()?,
            ValueFormat::DW_EH_PE_uleb128 => self.read_uleb128()? as usize,
            ValueFormat::DW_EH_PE_udata2 => self.read_u16()? as usize,
            ValueFormat::DW_EH_PE_udata4 => self.read_u32()? as usize,
            ValueFormat::DW_EH_PE_udata8 => self.read_u64()? as usize,
            ValueFormat::DW_EH_PE_sleb128 => self.read_sleb128()? as isize as usize,
            ValueFormat::DW_EH_PE_sdata2 => self.read_i16()? as isize as usize,
            ValueFormat::DW_EH_PE_sdata4 => self.read_i32()? as isize as usize,
            ValueFormat::DW_EH_PE_sdata8 => self.read_i64()? as isize as usize,
        })
    }
}

const DW_EH_PE_omit: u8 = 0xff;
const DW_EH_PE_indirect: u8 = 0x80;

/// A `DW_EH_PE_*` pointer encoding byte: the low nibble is the format of the
/// stored value, bits 4..7 say what it is relative to, and bit 7 says the
/// result is the address of the real value.
#[derive(PartialEq, Eq, Clone, Copy)]
#[repr(transparent)]
pub struct Encoding(pub u8);

impl Encoding {
    pub const OMIT: Encoding = Encoding(DW_EH_PE_omit);

    pub fn is_omit(self) -> bool {
        self.0 == DW_EH_PE_omit
    }

    pub fn is_indirect(self) -> bool {
        self.0 & DW_EH_PE_indirect != 0
    }

    /// The same format, stored as a plain absolute value. FDE address ranges
    /// are read this way.
    pub fn format_only(self) -> Encoding {
        Encoding(self.0 & 0x0f)
    }

    pub fn format(self) -> Result<ValueFormat> {
        Ok(match self.0 & 0x0f {
            0x00 => ValueFormat::DW_EH_PE_absptr,
            0x01 => ValueFormat::DW_EH_PE_uleb128,
            0x02 => ValueFormat::DW_EH_PE_udata2,
            0x03 => ValueFormat::DW_EH_PE_udata4,
            0x04 => ValueFormat::DW_EH_PE_udata8,
            0x09 => ValueFormat::DW_EH_PE_sleb128,
            0x0A => ValueFormat::DW_EH_PE_sdata2,
            0x0B => ValueFormat::DW_EH_PE_sdata4,
            0x0C => ValueFormat::DW_EH_PE_sdata8,
            _ => return Err(Error::InvalidEncoding(self.0)),
        })
    }

    pub fn application(self) -> Result<ValueApplication> {
        Ok(match self.0 & 0x70 {
            0x00 => ValueApplication::DW_EH_PE_absptr,
            0x10 => ValueApplication::DW_EH_PE_pcrel,
            0x20 => ValueApplication::DW_EH_PE_textrel,
            0x30 => ValueApplication::DW_EH_PE_datarel,
            0x40 => ValueApplication::DW_EH_PE_funcrel,
            0x50 => ValueApplication::DW_EH_PE_aligned,
            _ => return Err(Error::InvalidEncoding(self.0)),
        })
    }

    /// Size of a value in this encoding, if it has a fixed one.
    pub fn size(self) -> Option<usize> {
        match self.format().ok()? {
            ValueFormat::DW_EH_PE_absptr => Some(size_of::<usize>()),
            ValueFormat::DW_EH_PE_udata2 | ValueFormat::DW_EH_PE_sdata2 => Some(2),
            ValueFormat::DW_EH_PE_udata4 | ValueFormat::DW_EH_PE_sdata4 => Some(4),
            ValueFormat::DW_EH_PE_udata8 | ValueFormat::DW_EH_PE_sdata8 => Some(8),
            ValueFormat::DW_EH_PE_uleb128 | ValueFormat::DW_EH_PE_sleb128 => None,
        }
    }
}

impl fmt::Debug for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_omit() {
            return f.write_str("DW_EH_PE_omit");
        }
        match (self.application(), self.format()) {
            (Ok(app), Ok(format)) => {
                write!(f, "{app:?} | {format:?}")?;
                if self.is_indirect() {
                    f.write_str(" | DW_EH_PE_indirect")?;
                }
                Ok(())
            }
            _ => write!(f, "Encoding({:#04x})", self.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(non_camel_case_types)]
pub enum ValueFormat {
    /// A pointer-sized unsigned value.
    DW_EH_PE_absptr = 0x00,
    /// Unsigned value is encoded using the Little Endian Base 128 (LEB128) as
    /// defined by DWARF Debugging Information Format, Revision 2.0.0 (July 27,
    /// 1993).
    DW_EH_PE_uleb128 = 0x01,
    /// A 2 bytes unsigned value.
    DW_EH_PE_udata2 = 0x02,
    /// A 4 bytes unsigned value.
    DW_EH_PE_udata4 = 0x03,
    /// An 8 bytes unsigned value.
    DW_EH_PE_udata8 = 0x04,
    /// Signed value is encoded using the Little Endian Base 128 (LEB128) as
    /// defined by DWARF Debugging Information Format, Revision 2.0.0 (July 27,
    /// 1993).
    DW_EH_PE_sleb128 = 0x09,
    /// A 2 bytes signed value.
    DW_EH_PE_sdata2 = 0x0A,
    /// A 4 bytes signed value.
    DW_EH_PE_sdata4 = 0x0B,
    /// An 8 bytes signed value.
    DW_EH_PE_sdata8 = 0x0C,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(non_camel_case_types)]
pub enum ValueApplication {
    DW_EH_PE_absptr = 0x00,
    ///	Value is relative to the address it was read from.
    DW_EH_PE_pcrel = 0x10,
    ///	Value is relative to the beginning of the .text section.
    DW_EH_PE_textrel = 0x20,
    ///	Value is relative to the beginning of the .got or .eh_frame_hdr
    /// section.
    DW_EH_PE_datarel = 0x30,
    ///	Value is relative to the beginning of the function.
    DW_EH_PE_funcrel = 0x40,
    ///	Value is aligned to an address unit sized boundary.
    DW_EH_PE_aligned = 0x50,
}

/// Common Information Entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cie {
    /// 1 for GCC-style `.eh_frame`, 3 or 4 for newer producers.
    pub version: u8,
    /// The augmentation string started with `z`: a length-prefixed block of
    /// augmentation data follows in the CIE and in every FDE using it, so
    /// letters we do not understand can be skipped.
    pub has_augmentation_data: bool,
    /// From the `R` augmentation: how `pc_begin`/`pc_range` and
    /// `DW_CFA_set_loc` operands are encoded. Without it they are plain
    /// pointers.
    pub pointer_encoding: Option<Encoding>,
    /// From the `S` augmentation: the FDEs describe signal trampolines, so
    /// the recovered pc is not a return address.
    pub signal_frame: bool,
    /// A constant that is factored out of all advance location instructions.
    /// The resulting value is (operand * code_alignment_factor).
    pub code_alignment_factor: u64,
    /// A constant that is factored out of certain offset instructions. The
    /// resulting value is (operand * data_alignment_factor).
    pub data_alignment_factor: i64,
    /// Which column in the rule table represents the return address of the
    /// function. Note that this column might not correspond to an actual
    /// machine register.
    pub return_address_register: u64,
    /// Rules that are interpreted to create the initial setting of each
    /// column in the table.
    pub initial_instructions: CodeRange,
}

/// Frame Description Entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fde {
    /// Address of the CIE this FDE belongs to.
    pub cie_addr: usize,
    pub cie: Cie,
    /// The first address covered by this entry.
    pub pc_begin: usize,
    /// The number of bytes of program instructions described by this entry.
    pub pc_range: usize,
    /// Table defining instructions, run after the CIE's.
    pub instructions: CodeRange,
}

impl Fde {
    /// Whether `pc` falls into this FDE. The end is inclusive: the return
    /// address of a call to a `noreturn` function at the very end of a
    /// function points one past it.
    pub fn covers(&self, pc: usize) -> bool {
        pc >= self.pc_begin && pc - self.pc_begin <= self.pc_range
    }
}

/// Longest augmentation string we accept, without the NUL.
const MAX_AUGMENTATION_LEN: usize = 8;

/// Reads the length and id that every CIE and FDE starts with. The returned
/// cursor spans the rest of the entry.
fn parse_entry_head(view: MemoryView<'_>, addr: usize) -> Result<(Cursor<'_>, u32)> {
    let len = view.read_u32(addr)?;
    if len == 0xffffffff {
        // be careful, if you handle this you need to adjust the callers offsets lol lmao
        return Err(Error::Dwarf64);
    }
    if len == 0 {
        // the terminator of the section
        return Err(Error::UnexpectedEnd { addr });
    }

    let start = addr.checked_add(4).ok_or(Error::AddressOverflow)?;
    let end = start
        .checked_add(len as usize)
        .ok_or(Error::AddressOverflow)?;
    let mut data = Cursor::new(view, start, end);
    let id = data.read_u32()?;
    Ok((data, id))
}

fn read_augmentation<'b>(
    data: &mut Cursor<'_>,
    buf: &'b mut [u8; MAX_AUGMENTATION_LEN],
) -> Result<&'b [u8]> {
    for i in 0..=MAX_AUGMENTATION_LEN {
        let byte = data.read_u8()?;
        if byte == 0 {
            return Ok(&buf[..i]);
        }
        match buf.get_mut(i) {
            Some(slot) => *slot = byte,
            None => return Err(Error::UnknownAugmentation(byte)),
        }
    }
    Err(Error::UnknownAugmentation(0))
}

#[instrument(level = "trace", skip(view))]
pub fn parse_cie(view: MemoryView<'_>, cie_addr: usize) -> Result<Cie> {
    let (mut data, cie_id) = parse_entry_head(view, cie_addr)?;
    if cie_id != 0 {
        trace!(cie_id, "CIE must have cie_id=0");
        return Err(Error::InvalidCieId);
    }

    let version = data.read_u8()?;
    if !matches!(version, 1 | 3 | 4) {
        return Err(Error::UnsupportedVersion(version));
    }

    let mut buf = [0; MAX_AUGMENTATION_LEN];
    let mut augmentation = read_augmentation(&mut data, &mut buf)?;

    // old GCC stored the address of its exception table here
    if let [b'e', b'h', rest @ ..] = augmentation {
        data.skip(size_of::<usize>())?;
        augmentation = rest;
    }

    if version == 4 {
        let _address_size = data.read_u8()?;
        let _segment_selector_size = data.read_u8()?;
    }

    let code_alignment_factor = data.read_uleb128()?;
    let data_alignment_factor = data.read_sleb128()?;
    let return_address_register = if version == 1 {
        u64::from(data.read_u8()?)
    } else {
        data.read_uleb128()?
    };

    let mut cie = Cie {
        version,
        has_augmentation_data: false,
        pointer_encoding: None,
        signal_frame: false,
        code_alignment_factor,
        data_alignment_factor,
        return_address_register,
        initial_instructions: CodeRange::default(),
    };

    let mut instructions_start = None;
    if let [b'z', rest @ ..] = augmentation {
        let aug_len = data.read_uleb128()? as usize;
        let after = data.pos().checked_add(aug_len).ok_or(Error::AddressOverflow)?;
        instructions_start = Some(after);
        cie.has_augmentation_data = true;
        augmentation = rest;
    }

    for &code in augmentation {
        match code {
            // The LSDA pointer encoding. Exception tables are not our business.
            b'L' => data.skip(1)?,
            // The personality routine, also not our business, but we have to
            // know how big it is to get past it.
            b'P' => {
                let encoding = Encoding(data.read_u8()?);
                data.skip_encoded(encoding)?;
            }
            b'R' => cie.pointer_encoding = Some(Encoding(data.read_u8()?)),
            b'S' => cie.signal_frame = true,
            _ if cie.has_augmentation_data => {
                trace!(code, "skipping unknown augmentation");
                break;
            }
            _ => return Err(Error::UnknownAugmentation(code)),
        }
    }

    let start = instructions_start.unwrap_or(data.pos());
    if start > data.end() {
        return Err(Error::UnexpectedEnd { addr: start });
    }
    cie.initial_instructions = CodeRange::new(start, data.end());

    trace!(?cie, "parsed CIE");
    Ok(cie)
}

#[instrument(level = "trace", skip(view))]
pub fn parse_fde(view: MemoryView<'_>, fde_addr: usize) -> Result<Fde> {
    let (mut data, cie_pointer) = parse_entry_head(view, fde_addr)?;
    if cie_pointer == 0 {
        trace!("FDE's CIE Pointer is 0, this is a CIE");
        return Err(Error::InvalidCieId);
    }

    // relative to the CIE pointer field itself
    let cie_addr = (fde_addr + 4)
        .checked_sub(cie_pointer as usize)
        .ok_or(Error::AddressOverflow)?;
    let cie = parse_cie(view, cie_addr)?;

    let (pc_begin, pc_range) = match cie.pointer_encoding {
        Some(encoding) => {
            let pc_begin = data
                .read_encoded(encoding, None)?
                .ok_or(Error::InvalidEncoding(encoding.0))?;
            let pc_range = data
                .read_encoded(encoding.format_only(), None)?
                .ok_or(Error::InvalidEncoding(encoding.0))?;
            (pc_begin, pc_range)
        }
        None => (data.read_usize()?, data.read_usize()?),
    };

    if cie.has_augmentation_data {
        let augmentation_len = data.read_uleb128()?;
        data.skip(augmentation_len as usize)?;
    }

    let fde = Fde {
        cie_addr,
        cie,
        pc_begin,
        pc_range,
        instructions: CodeRange::new(data.pos(), data.end()),
    };
    trace!(?fde, "parsed FDE");
    Ok(fde)
}

/// One decoded call frame instruction. Operands are still factored; the
/// interpreter applies the CIE's alignment factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    //-------- 6.4.2.1 Row Creation Instructions
    //
    /// Start a new row at the given address, encoded like `pc_begin`.
    SetLoc(usize),
    /// Start a new row `delta * code_alignment_factor` bytes further. Covers
    /// `DW_CFA_advance_loc` and its 1, 2 and 4 byte variants.
    AdvanceLoc(u32),
    //
    //-------- 6.4.2.2 CFA Definition Instructions
    //
    /// CFA = register + offset.
    DefCfa { register: u64, offset: u64 },
    /// Like `DefCfa`, but the offset is signed and factored.
    DefCfaSf { register: u64, factored_offset: i64 },
    /// Use a new register but keep the old offset. Only valid when the CFA
    /// rule is register+offset.
    DefCfaRegister(u64),
    /// Use a new offset but keep the old register. Only valid when the CFA
    /// rule is register+offset.
    DefCfaOffset(u64),
    /// Like `DefCfaOffset`, but signed and factored.
    DefCfaOffsetSf(i64),
    /// The CFA is the value of this expression.
    DefCfaExpression(CodeRange),
    //
    //-------- 6.4.2.3 Register Rule Instructions
    //
    Undefined(u64),
    SameValue(u64),
    /// `DW_CFA_offset` and `DW_CFA_offset_extended`: saved at
    /// CFA + factored_offset * data_alignment_factor.
    Offset { register: u64, factored_offset: u64 },
    OffsetExtendedSf { register: u64, factored_offset: i64 },
    /// The old GNU way of spelling a negative `offset_extended`.
    GnuNegativeOffsetExtended { register: u64, factored_offset: u64 },
    ValOffset { register: u64, factored_offset: u64 },
    ValOffsetSf { register: u64, factored_offset: i64 },
    /// The previous value of `target_register` lives in `from_register`.
    Register { target_register: u64, from_register: u64 },
    /// The expression computes the address the register is saved at.
    Expression { register: u64, expr: CodeRange },
    /// The expression computes the value of the register.
    ValExpression { register: u64, expr: CodeRange },
    /// `DW_CFA_restore` and `DW_CFA_restore_extended`.
    Restore(u64),
    //
    //-------- 6.4.2.4 Row State Instructions
    //
    RememberState,
    RestoreState,
    //
    //-------- GNU extensions
    //
    /// SPARC register windows, also (ab)used as `DW_CFA_AARCH64_negate_ra_state`.
    GnuWindowSave,
    GnuArgsSize(u64),
    //
    //-------- 6.4.2.5 Padding Instruction
    //
    Nop,
}

pub struct InstrIter<'a> {
    data: Cursor<'a>,
    pointer_encoding: Encoding,
}

impl<'a> InstrIter<'a> {
    /// Decodes the instructions in `range`. `pointer_encoding` is the CIE's
    /// `R` augmentation, used by `DW_CFA_set_loc`.
    pub fn new(view: MemoryView<'a>, range: CodeRange, pointer_encoding: Option<Encoding>) -> Self {
        Self {
            data: Cursor::new(view, range.start, range.end),
            pointer_encoding: pointer_encoding.unwrap_or(Encoding(0)),
        }
    }

    fn expression(&mut self) -> Result<CodeRange> {
        let len = self.data.read_uleb128()? as usize;
        let start = self.data.pos();
        self.data.skip(len)?;
        Ok(CodeRange::new(start, self.data.pos()))
    }

    fn decode(&mut self) -> Result<Instruction> {
        let b = self.data.read_u8()?;
        let low_6 = b & (u8::MAX >> 2);
        Ok(match b >> 6 {
            DW_CFA_advance_loc_hi => Instruction::AdvanceLoc(u32::from(low_6)),
            DW_CFA_offset_hi => Instruction::Offset {
                register: u64::from(low_6),
                factored_offset: self.data.read_uleb128()?,
            },
            DW_CFA_restore_hi => Instruction::Restore(u64::from(low_6)),
            _ => match b {
                DW_CFA_nop => Instruction::Nop,
                DW_CFA_set_loc => Instruction::SetLoc(
                    self.data
                        .read_encoded(self.pointer_encoding, None)?
                        .ok_or(Error::InvalidEncoding(self.pointer_encoding.0))?,
                ),
                DW_CFA_advance_loc1 => Instruction::AdvanceLoc(self.data.read_u8()?.into()),
                DW_CFA_advance_loc2 => Instruction::AdvanceLoc(self.data.read_u16()?.into()),
                DW_CFA_advance_loc4 => Instruction::AdvanceLoc(self.data.read_u32()?),
                DW_CFA_offset_extended => Instruction::Offset {
                    register: self.data.read_uleb128()?,
                    factored_offset: self.data.read_uleb128()?,
                },
                DW_CFA_restore_extended => Instruction::Restore(self.data.read_uleb128()?),
                DW_CFA_undefined => Instruction::Undefined(self.data.read_uleb128()?),
                DW_CFA_same_value => Instruction::SameValue(self.data.read_uleb128()?),
                DW_CFA_register => Instruction::Register {
                    target_register: self.data.read_uleb128()?,
                    from_register: self.data.read_uleb128()?,
                },
                DW_CFA_remember_state => Instruction::RememberState,
                DW_CFA_restore_state => Instruction::RestoreState,
                DW_CFA_def_cfa => Instruction::DefCfa {
                    register: self.data.read_uleb128()?,
                    offset: self.data.read_uleb128()?,
                },
                DW_CFA_def_cfa_register => Instruction::DefCfaRegister(self.data.read_uleb128()?),
                DW_CFA_def_cfa_offset => Instruction::DefCfaOffset(self.data.read_uleb128()?),
                DW_CFA_def_cfa_expression => Instruction::DefCfaExpression(self.expression()?),
                DW_CFA_expression => Instruction::Expression {
                    register: self.data.read_uleb128()?,
                    expr: self.expression()?,
                },
                DW_CFA_offset_extended_sf => Instruction::OffsetExtendedSf {
                    register: self.data.read_uleb128()?,
                    factored_offset: self.data.read_sleb128()?,
                },
                DW_CFA_def_cfa_sf => Instruction::DefCfaSf {
                    register: self.data.read_uleb128()?,
                    factored_offset: self.data.read_sleb128()?,
                },
                DW_CFA_def_cfa_offset_sf => Instruction::DefCfaOffsetSf(self.data.read_sleb128()?),
                DW_CFA_val_offset => Instruction::ValOffset {
                    register: self.data.read_uleb128()?,
                    factored_offset: self.data.read_uleb128()?,
                },
                DW_CFA_val_offset_sf => Instruction::ValOffsetSf {
                    register: self.data.read_uleb128()?,
                    factored_offset: self.data.read_sleb128()?,
                },
                DW_CFA_val_expression => Instruction::ValExpression {
                    register: self.data.read_uleb128()?,
                    expr: self.expression()?,
                },
                DW_CFA_GNU_window_save => Instruction::GnuWindowSave,
                DW_CFA_GNU_args_size => Instruction::GnuArgsSize(self.data.read_uleb128()?),
                DW_CFA_GNU_negative_offset_extended => Instruction::GnuNegativeOffsetExtended {
                    register: self.data.read_uleb128()?,
                    factored_offset: self.data.read_uleb128()?,
                },
                other => return Err(Error::UnknownCfaOpcode(other)),
            },
        })
    }
}

impl Iterator for InstrIter<'_> {
    type Item = Result<(usize, Instruction)>;

    /// Yields each instruction with the address it was decoded from. Stops
    /// after the first error.
    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        let at = self.data.pos();
        let instruction = self.decode();
        if instruction.is_err() {
            self.data.pos = self.data.end;
        }
        Some(instruction.map(|i| (at, i)))
    }
}

const DW_CFA_advance_loc_hi: u8 = 0x01;
const DW_CFA_offset_hi: u8 = 0x02;
const DW_CFA_restore_hi: u8 = 0x03;

const DW_CFA_nop: u8 = 0;
const DW_CFA_set_loc: u8 = 0x01;
const DW_CFA_advance_loc1: u8 = 0x02;
const DW_CFA_advance_loc2: u8 = 0x03;
const DW_CFA_advance_loc4: u8 = 0x04;
const DW_CFA_offset_extended: u8 = 0x05;
const DW_CFA_restore_extended: u8 = 0x06;
const DW_CFA_undefined: u8 = 0x07;
const DW_CFA_same_value: u8 = 0x08;
const DW_CFA_register: u8 = 0x09;
const DW_CFA_remember_state: u8 = 0x0a;
const DW_CFA_restore_state: u8 = 0x0b;
const DW_CFA_def_cfa: u8 = 0x0c;
const DW_CFA_def_cfa_register: u8 = 0x0d;
const DW_CFA_def_cfa_offset: u8 = 0x0e;
const DW_CFA_def_cfa_expression: u8 = 0x0f;
const DW_CFA_expression: u8 = 0x10;
const DW_CFA_offset_extended_sf: u8 = 0x11;
const DW_CFA_def_cfa_sf: u8 = 0x12;
const DW_CFA_def_cfa_offset_sf: u8 = 0x13;
const DW_CFA_val_offset: u8 = 0x14;
const DW_CFA_val_offset_sf: u8 = 0x15;
const DW_CFA_val_expression: u8 = 0x16;
const DW_CFA_GNU_window_save: u8 = 0x2d;
const DW_CFA_GNU_args_size: u8 = 0x2e;
const DW_CFA_GNU_negative_offset_extended: u8 = 0x2f;

//! The `.eh_frame_hdr` lookup table.
//!
//! The header holds a table of `(initial location, FDE address)` pairs
//! sorted by location, so finding the FDE for a pc is a binary search
//! instead of a walk over all of `.eh_frame` (which we never do).
//!
//! See <https://refspecs.linuxfoundation.org/LSB_1.3.0/gLSB/gLSB/ehframehdr.html>
//! and <https://refspecs.linuxbase.org/LSB_5.0.0/LSB-Core-generic/LSB-Core-generic/ehframechpt.html>.


use super::parse::{Cursor, Encoding};
use crate::memory::MemoryView;
use crate::{Error, Result};

/// The only table encoding we binary search: `DW_EH_PE_datarel |
/// DW_EH_PE_sdata4`, which is what every linker emits.
const TABLE_ENCODING: Encoding = Encoding(0x3b);

/// Fixed part of the header: version and three encodings, then
/// `eh_frame_ptr`.
const HEADER_LEN: usize = 4;

/// The parsed `.eh_frame_hdr` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindTableInfo {
    /// Address of the header itself, the base for `datarel` values.
    pub hdr_addr: usize,
    pub version: u8,
    pub ptr_encoding: Encoding,
    pub fde_count_encoding: Encoding,
    pub table_encoding: Encoding,
    pub has_search_table: bool,
    /// Start of `.eh_frame`.
    pub frame_addr: usize,
    pub fde_count: usize,
    /// Start of the binary search table, right after the FDE count.
    pub table_addr: usize,
}

/// One row of the search table. Both offsets are relative to the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdeTableEntry {
    pub initial_location_offset: i32,
    pub fde_offset: i32,
}

impl FdeTableEntry {
    const SIZE: usize = 8;

    pub fn initial_location(&self, info: &UnwindTableInfo) -> Result<usize> {
        offset_from(info.hdr_addr, self.initial_location_offset)
    }

    pub fn fde_addr(&self, info: &UnwindTableInfo) -> Result<usize> {
        offset_from(info.hdr_addr, self.fde_offset)
    }
}

fn offset_from(base: usize, offset: i32) -> Result<usize> {
    base.checked_add_signed(offset as isize)
        .ok_or(Error::AddressOverflow)
}

#[instrument(level = "trace", skip(view))]
pub fn parse_header(view: MemoryView<'_>, hdr_addr: usize) -> Result<UnwindTableInfo> {
    let mut data = Cursor::new(view, hdr_addr, view.base().saturating_add(view.size()));

    let version = data.read_u8()?;
    if version != 1 {
        trace!(version, "eh_frame_hdr version is not 1");
        return Err(Error::UnsupportedVersion(version));
    }

    let ptr_encoding = Encoding(data.read_u8()?);
    let fde_count_encoding = Encoding(data.read_u8()?);
    let table_encoding = Encoding(data.read_u8()?);
    debug_assert_eq!(data.pos(), hdr_addr + HEADER_LEN);

    let frame_addr = data
        .read_encoded(ptr_encoding, Some(hdr_addr))?
        .ok_or(Error::InvalidEncoding(ptr_encoding.0))?;

    let mut info = UnwindTableInfo {
        hdr_addr,
        version,
        ptr_encoding,
        fde_count_encoding,
        table_encoding,
        has_search_table: false,
        frame_addr,
        fde_count: 0,
        table_addr: 0,
    };

    if fde_count_encoding.is_omit() || table_encoding != TABLE_ENCODING {
        debug!(?fde_count_encoding, ?table_encoding, "eh_frame_hdr has no usable search table");
        return Ok(info);
    }

    let fde_count = data
        .read_encoded(fde_count_encoding, Some(hdr_addr))?
        .ok_or(Error::InvalidEncoding(fde_count_encoding.0))?;
    if fde_count == 0 {
        return Err(Error::EmptySearchTable);
    }

    info.has_search_table = true;
    info.fde_count = fde_count;
    info.table_addr = data.pos();
    trace!(?info, "eh_frame_hdr");
    Ok(info)
}

fn read_entry(view: MemoryView<'_>, info: &UnwindTableInfo, index: usize) -> Result<FdeTableEntry> {
    let addr = index
        .checked_mul(FdeTableEntry::SIZE)
        .and_then(|offset| info.table_addr.checked_add(offset))
        .ok_or(Error::AddressOverflow)?;
    let fde_offset_addr = addr.checked_add(4).ok_or(Error::AddressOverflow)?;
    Ok(FdeTableEntry {
        initial_location_offset: view.read_u32(addr)? as i32,
        fde_offset: view.read_u32(fde_offset_addr)? as i32,
    })
}

/// Finds the last entry whose initial location is at or below `pc`.
///
/// This is a floor search: the entry found is the only one that *could*
/// cover `pc`, but the caller still has to check the FDE's range. A `pc`
/// below every entry yields the first one.
#[instrument(level = "debug", skip(view, info))]
pub fn search(view: MemoryView<'_>, info: &UnwindTableInfo, pc: usize) -> Result<FdeTableEntry> {
    if !info.has_search_table {
        return Err(Error::NoSearchTable);
    }

    let mut left = 0;
    let mut right = info.fde_count;
    while left < right {
        let mid = left + (right - left) / 2;
        let entry = read_entry(view, info, mid)?;
        let location = entry.initial_location(info)?;

        debug!(left, right, mid, "binary searching: {location:#x}");

        match pc.cmp(&location) {
            core::cmp::Ordering::Less => right = mid,
            core::cmp::Ordering::Equal => return Ok(entry),
            core::cmp::Ordering::Greater => left = mid + 1,
        }
    }

    let found = right.saturating_sub(1);
    debug!(found, "found FDE idx in binary search");
    read_entry(view, info, found)
}

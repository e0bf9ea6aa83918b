//! this implements the stuff necessary to get the unwind tables for actual unwinding
//!
//! # how it works
//! every module that can be unwound carries a `.eh_frame` section with DWARF
//! call frame information and, next to it, an `.eh_frame_hdr` with a sorted
//! table mapping function start addresses to their FDEs.
//!
//! 1. [`table`] parses `.eh_frame_hdr` and binary searches it for the pc.
//! 2. [`parse`] decodes the FDE it points at and the CIE behind that.
//! 3. [`cfi`] runs the CIE's and the FDE's instructions (yes, that shit is
//!    basically a programming language) up to the pc, which yields a rule for
//!    the CFA and one rule per register.
//! 4. [`expr`] evaluates the DWARF expressions some of those rules contain.
//!
//! See https://dwarfstd.org/doc/DWARF5.pdf §6.4 and the LSB's `.eh_frame`
//! chapter for more information if more information is desired.

pub mod cfi;
pub mod expr;
pub mod parse;
pub mod table;

/// A byte range of DWARF bytecode (CFI instructions or an expression), in the
/// address space of the memory view it was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodeRange {
    pub start: usize,
    pub end: usize,
}

impl CodeRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

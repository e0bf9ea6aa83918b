//! Frame pointer walker, for when the CFI gives up.
//!
//! Both x86-64 and AArch64 keep the caller's frame pointer at `[fp]` and the
//! return address right above it. That only holds for code compiled with
//! frame pointers, so this is a fallback and not a strategy.

use core::mem::size_of;

use crate::arch::Registers;
use crate::memory::{MemoryView, StackBounds};
use crate::{Error, Result};

const WORD: usize = size_of::<usize>();

pub fn step_fp(regs: &Registers, stack: MemoryView<'_>, bounds: StackBounds) -> Result<Registers> {
    let fp = regs.fp();
    trace!("walk...   fp={fp:#x}");
    if fp == 0 {
        return Err(Error::NullFramePointer);
    }
    if !bounds.contains_range(fp, 2 * WORD) {
        return Err(Error::OutOfBounds { addr: fp, len: 2 * WORD });
    }

    let caller_fp = stack.read_usize(fp)?;
    let return_address = stack.read_usize(fp + WORD)?;
    trace!("walk... return_addr={return_address:#x}");
    // the outermost frame has a null frame pointer, anything else must be
    // further up the stack
    if caller_fp != 0 && caller_fp <= fp {
        return Err(Error::FramePointerMovedBackwards);
    }

    let mut caller = *regs;
    caller.set_fp(caller_fp);
    caller.set_sp(fp + 2 * WORD);
    caller.set_pc(return_address);
    Ok(caller)
}

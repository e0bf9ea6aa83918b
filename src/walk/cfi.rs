//! One step through the call frame information of a module.

use crate::arch::{Registers, SP};
use crate::dwarf::cfi::{self, CfaRule, FrameState, RegisterRule};
use crate::dwarf::expr::Machine;
use crate::dwarf::{parse, table};
use crate::elf::ModuleImage;
use crate::memory::{MemoryView, StackBounds};
use crate::{Error, Result};

/// The caller's registers after a successful step.
#[derive(Debug, Clone, Copy)]
pub struct Step {
    pub regs: Registers,
    /// The frame we stepped out of was a signal trampoline, so the caller's pc
    /// is the interrupted instruction and not a return address.
    pub signal_frame: bool,
}

/// Recovers the caller of the frame described by `regs`. `rel_pc` is the
/// module-relative pc to look the unwind rules up for.
#[instrument(level = "debug", skip(image, regs, stack))]
pub fn step_cfi(
    image: &ModuleImage<'_>,
    regs: &Registers,
    stack: MemoryView<'_>,
    bounds: StackBounds,
    rel_pc: usize,
) -> Result<Step> {
    let hdr = image.eh_frame_hdr().ok_or(Error::NoUnwindInfo)?;
    let view = image.view();

    let info = table::parse_header(view, hdr.addr)?;
    let pc = image.cfi_address(rel_pc);
    let entry = table::search(view, &info, pc)?;
    let fde = parse::parse_fde(view, entry.fde_addr(&info)?)?;
    if !fde.covers(pc) {
        return Err(Error::PcOutsideFde { pc });
    }

    let state = cfi::rules_for(view, &fde, pc)?;
    let regs = apply(&state, view, regs, stack, bounds)?;
    Ok(Step {
        regs,
        signal_frame: state.signal_frame,
    })
}

fn offset_from(cfa: usize, offset: i64) -> Result<usize> {
    isize::try_from(offset)
        .ok()
        .and_then(|offset| cfa.checked_add_signed(offset))
        .ok_or(Error::AddressOverflow)
}

/// Turns the rules of the callee's row into the caller's registers. All rules
/// see the callee's registers, not the partially updated ones.
fn apply(
    state: &FrameState,
    code: MemoryView<'_>,
    regs: &Registers,
    stack: MemoryView<'_>,
    bounds: StackBounds,
) -> Result<Registers> {
    let machine = Machine {
        code,
        regs,
        stack,
        bounds,
    };

    let cfa = match state.rules.cfa {
        CfaRule::RegisterOffset { register, offset } => {
            let base = regs.get(register)?;
            if base == 0 {
                return Err(Error::NoCfaRule);
            }
            offset_from(base, offset)?
        }
        CfaRule::Expression(expr) => machine.evaluate(expr, 0)?,
        CfaRule::Unset => return Err(Error::NoCfaRule),
    };
    if !bounds.contains(cfa) {
        return Err(Error::CfaOutOfStack { cfa });
    }
    trace!("cfa = {cfa:#x}");

    let mut caller = *regs;
    for (register, rule) in (0u64..).zip(state.rules.registers) {
        let value = match rule {
            RegisterRule::Unsaved => continue,
            RegisterRule::Undefined => {
                if register != state.return_address_register {
                    continue;
                }
                0
            }
            RegisterRule::SavedAtOffsetFromCfa(offset) => stack.read_usize(offset_from(cfa, offset)?)?,
            RegisterRule::SavedRegisterValue(from) => regs.get(from)?,
            RegisterRule::SavedAtExpression(expr) => {
                if register == SP as u64 {
                    continue;
                }
                let addr = machine.evaluate(expr, cfa)?;
                if addr == 0 {
                    continue;
                }
                stack.read_usize(addr)?
            }
            RegisterRule::SavedValueAtOffset(offset) => offset_from(cfa, offset)?,
            RegisterRule::SavedValueOfExpression(expr) => machine.evaluate(expr, cfa)?,
        };
        caller.set(register, value)?;
    }
    caller.set_sp(cfa);

    let mut return_address = caller.get(state.return_address_register)?;
    if state.rules.return_address_signed {
        return_address = strip_pointer_authentication(return_address);
    }
    caller.set_pc(return_address);
    Ok(caller)
}

/// Drops the signature a `paciasp` put into the unused top bits.
#[cfg(target_arch = "aarch64")]
fn strip_pointer_authentication(addr: usize) -> usize {
    const VA_BITS: u32 = 48;
    addr & ((1 << VA_BITS) - 1)
}

#[cfg(not(target_arch = "aarch64"))]
fn strip_pointer_authentication(addr: usize) -> usize {
    addr
}

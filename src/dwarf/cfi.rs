//! Runs CFI programs to build the row of the unwind table for one pc.
//!
//! Nobody stores the table described in [`super::parse`]. The CIE's initial
//! instructions set up the first row, the FDE's instructions modify it while
//! advancing the location, and we stop once the location passes the pc we
//! care about. What is left is a [`RuleTable`]: how to find the CFA and how
//! to recover each register of the caller.


use super::parse::{Encoding, Fde, InstrIter, Instruction};
use super::CodeRange;
use crate::arch::REGISTER_COUNT;
use crate::memory::MemoryView;
use crate::{Error, Result};

/// How to recover one register of the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegisterRule {
    /// The register is callee-saved and was not touched: same value.
    #[default]
    Unsaved,
    /// The value cannot be recovered.
    Undefined,
    /// Saved in memory at CFA + offset.
    SavedAtOffsetFromCfa(i64),
    /// Saved in this other register.
    SavedRegisterValue(u64),
    /// Saved in memory at the address the expression computes.
    SavedAtExpression(CodeRange),
    /// The value is CFA + offset.
    SavedValueAtOffset(i64),
    /// The value is what the expression computes.
    SavedValueOfExpression(CodeRange),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CfaRule {
    /// No CFA instruction ran yet, which no sane CIE allows.
    #[default]
    Unset,
    RegisterOffset { register: u64, offset: i64 },
    Expression(CodeRange),
}

/// One row of the unwind table, minus the location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleTable {
    pub cfa: CfaRule,
    pub registers: [RegisterRule; REGISTER_COUNT],
    /// AArch64 pointer authentication: the return address carries a
    /// signature in its upper bits that has to be stripped.
    pub return_address_signed: bool,
}

impl Default for RuleTable {
    fn default() -> Self {
        Self {
            cfa: CfaRule::Unset,
            registers: [RegisterRule::Unsaved; REGISTER_COUNT],
            return_address_signed: false,
        }
    }
}

impl RuleTable {
    pub fn register(&self, register: u64) -> RegisterRule {
        usize::try_from(register)
            .ok()
            .and_then(|r| self.registers.get(r))
            .copied()
            .unwrap_or_default()
    }

    fn set(&mut self, register: u64, rule: RegisterRule) {
        match usize::try_from(register).ok().and_then(|r| self.registers.get_mut(r)) {
            Some(slot) => *slot = rule,
            // vector and floating point registers, nothing we restore
            None => trace!(register, "ignoring rule for untracked register"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// The CIE's initial instructions, run to the end.
    Cie,
    /// The FDE's instructions, run until the location passes the target pc.
    Fde,
}

/// Everything the interpreter tracks while running a CIE and FDE.
#[derive(Debug, Clone, Copy)]
pub struct FrameState {
    pub rules: RuleTable,
    /// The location of the current row.
    pub pc: usize,
    /// The pc being unwound. Rows past it have not happened yet.
    pub return_address: usize,
    pub code_alignment: u64,
    pub data_alignment: i64,
    pub pointer_encoding: Option<Encoding>,
    pub return_address_register: u64,
    pub signal_frame: bool,
    /// `DW_CFA_remember_state` keeps one row, not a stack.
    remembered: RuleTable,
}

impl FrameState {
    pub fn new(fde: &Fde, return_address: usize) -> Self {
        Self {
            rules: RuleTable::default(),
            pc: fde.pc_begin,
            return_address,
            code_alignment: fde.cie.code_alignment_factor,
            data_alignment: fde.cie.data_alignment_factor,
            pointer_encoding: fde.cie.pointer_encoding,
            return_address_register: fde.cie.return_address_register,
            signal_frame: fde.cie.signal_frame,
            remembered: RuleTable::default(),
        }
    }

    fn factored(&self, factored_offset: i64) -> i64 {
        factored_offset.wrapping_mul(self.data_alignment)
    }

    /// Runs the instructions in `range`.
    pub fn run(&mut self, view: MemoryView<'_>, range: CodeRange, pass: Pass) -> Result<()> {
        for instruction in InstrIter::new(view, range, self.pointer_encoding) {
            if pass == Pass::Fde && self.pc > self.return_address {
                trace!("reached {:#x}, past {:#x}", self.pc, self.return_address);
                break;
            }
            let (at, instruction) = instruction?;
            trace!("{at:#x}: {instruction:?}");
            self.execute(instruction)?;
        }
        Ok(())
    }

    fn execute(&mut self, instruction: Instruction) -> Result<()> {
        match instruction {
            Instruction::SetLoc(pc) => self.pc = pc,
            Instruction::AdvanceLoc(delta) => {
                let delta = u64::from(delta).wrapping_mul(self.code_alignment);
                self.pc = self.pc.wrapping_add(delta as usize);
            }

            Instruction::DefCfa { register, offset } => {
                self.rules.cfa = CfaRule::RegisterOffset {
                    register,
                    offset: offset as i64,
                };
            }
            Instruction::DefCfaSf {
                register,
                factored_offset,
            } => {
                self.rules.cfa = CfaRule::RegisterOffset {
                    register,
                    offset: self.factored(factored_offset),
                };
            }
            Instruction::DefCfaRegister(register) => {
                let offset = match self.rules.cfa {
                    CfaRule::RegisterOffset { offset, .. } => offset,
                    _ => 0,
                };
                self.rules.cfa = CfaRule::RegisterOffset { register, offset };
            }
            Instruction::DefCfaOffset(offset) => self.set_cfa_offset(offset as i64)?,
            Instruction::DefCfaOffsetSf(factored_offset) => {
                self.set_cfa_offset(self.factored(factored_offset))?
            }
            Instruction::DefCfaExpression(expr) => self.rules.cfa = CfaRule::Expression(expr),

            Instruction::Undefined(register) => self.rules.set(register, RegisterRule::Undefined),
            Instruction::SameValue(register) => self.rules.set(register, RegisterRule::Unsaved),
            Instruction::Offset {
                register,
                factored_offset,
            } => {
                let offset = self.factored(factored_offset as i64);
                self.rules.set(register, RegisterRule::SavedAtOffsetFromCfa(offset));
            }
            Instruction::OffsetExtendedSf {
                register,
                factored_offset,
            } => {
                let offset = self.factored(factored_offset);
                self.rules.set(register, RegisterRule::SavedAtOffsetFromCfa(offset));
            }
            Instruction::GnuNegativeOffsetExtended {
                register,
                factored_offset,
            } => {
                let offset = self.factored(factored_offset as i64).wrapping_neg();
                self.rules.set(register, RegisterRule::SavedAtOffsetFromCfa(offset));
            }
            Instruction::ValOffset {
                register,
                factored_offset,
            } => {
                let offset = self.factored(factored_offset as i64);
                self.rules.set(register, RegisterRule::SavedValueAtOffset(offset));
            }
            Instruction::ValOffsetSf {
                register,
                factored_offset,
            } => {
                let offset = self.factored(factored_offset);
                self.rules.set(register, RegisterRule::SavedValueAtOffset(offset));
            }
            Instruction::Register {
                target_register,
                from_register,
            } => self
                .rules
                .set(target_register, RegisterRule::SavedRegisterValue(from_register)),
            Instruction::Expression { register, expr } => {
                self.rules.set(register, RegisterRule::SavedAtExpression(expr))
            }
            Instruction::ValExpression { register, expr } => {
                self.rules.set(register, RegisterRule::SavedValueOfExpression(expr))
            }
            Instruction::Restore(register) => self.rules.set(register, RegisterRule::Unsaved),

            Instruction::RememberState => self.remembered = self.rules,
            Instruction::RestoreState => self.rules = self.remembered,

            Instruction::GnuWindowSave => self.window_save(),
            Instruction::GnuArgsSize(_) | Instruction::Nop => {}
        }
        Ok(())
    }

    fn set_cfa_offset(&mut self, new_offset: i64) -> Result<()> {
        match &mut self.rules.cfa {
            CfaRule::RegisterOffset { offset, .. } => {
                *offset = new_offset;
                Ok(())
            }
            _ => Err(Error::NoCfaRule),
        }
    }

    /// On AArch64 this opcode is `DW_CFA_AARCH64_negate_ra_state`.
    #[cfg(target_arch = "aarch64")]
    fn window_save(&mut self) {
        self.rules.return_address_signed = !self.rules.return_address_signed;
    }

    /// SPARC: the in and local registers of the caller's window are spilled
    /// right at the CFA.
    #[cfg(not(target_arch = "aarch64"))]
    fn window_save(&mut self) {
        let word = core::mem::size_of::<usize>() as i64;
        for register in 16..32 {
            let rule = RegisterRule::SavedAtOffsetFromCfa((register - 16) * word);
            self.rules.set(register as u64, rule);
        }
    }
}

/// Runs the CIE's initial instructions and then the FDE's up to `pc`.
#[instrument(level = "trace", skip(view, fde))]
pub fn rules_for(view: MemoryView<'_>, fde: &Fde, pc: usize) -> Result<FrameState> {
    let mut state = FrameState::new(fde, pc);
    state.run(view, fde.cie.initial_instructions, Pass::Cie)?;
    state.run(view, fde.instructions, Pass::Fde)?;
    trace!(cfa = ?state.rules.cfa, "rules at {pc:#x}");
    Ok(state)
}

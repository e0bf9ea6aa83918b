//! DWARF expressions, the stack machine hiding inside CFI.
//!
//! Source: https://dwarfstd.org/doc/DWARF5.pdf §2.5 DWARF Expressions
//!
//! Compilers only emit these for frames whose CFA or saved registers cannot
//! be described as "register plus offset": PLT stubs, signal trampolines,
//! realigned stacks. We implement the opcodes that make sense for computing
//! an address or a value from registers and stack memory, and nothing that
//! needs debug info (`DW_OP_fbreg`, pieces, TLS).
#![allow(non_upper_case_globals)]


use arrayvec::ArrayVec;

use super::parse::{Cursor, Encoding};
use super::CodeRange;
use crate::arch::Registers;
use crate::memory::{MemoryView, StackBounds};
use crate::{Error, Result};

/// Slots on the evaluation stack.
pub const EXPR_STACK_DEPTH: usize = 64;

/// Opcodes we execute before assuming the expression loops forever. Real
/// expressions are a handful of ops; `DW_OP_bra` is the only way to get here.
const MAX_STEPS: usize = 1024;

const WORD: usize = core::mem::size_of::<usize>();

/// Where an expression runs: the bytes it is made of, the registers of the
/// frame it describes, and the stack it may dereference into.
#[derive(Debug, Clone, Copy)]
pub struct Machine<'a> {
    pub code: MemoryView<'a>,
    pub regs: &'a Registers,
    pub stack: MemoryView<'a>,
    pub bounds: StackBounds,
}

struct Stack {
    values: ArrayVec<usize, EXPR_STACK_DEPTH>,
}

impl Stack {
    fn push(&mut self, value: usize) -> Result<()> {
        self.values
            .try_push(value)
            .map_err(|_| Error::ExpressionStackOverflow)
    }

    fn pop(&mut self) -> Result<usize> {
        self.values.pop().ok_or(Error::ExpressionStackUnderflow)
    }

    fn top(&self) -> Result<usize> {
        self.values
            .last()
            .copied()
            .ok_or(Error::ExpressionStackUnderflow)
    }

    /// The value `depth` entries below the top, 0 being the top.
    fn pick(&self, depth: usize) -> Result<usize> {
        self.values
            .len()
            .checked_sub(depth + 1)
            .map(|i| self.values[i])
            .ok_or(Error::ExpressionStackUnderflow)
    }

    fn binary(&mut self, op: impl FnOnce(usize, usize) -> Result<usize>) -> Result<()> {
        let top = self.pop()?;
        let second = self.pop()?;
        self.push(op(second, top)?)
    }

    fn unary(&mut self, op: impl FnOnce(usize) -> usize) -> Result<()> {
        let value = self.pop()?;
        self.push(op(value))
    }

    fn compare(&mut self, op: impl FnOnce(isize, isize) -> bool) -> Result<()> {
        self.binary(|a, b| Ok(usize::from(op(a as isize, b as isize))))
    }
}

impl<'a> Machine<'a> {
    /// Runs `expr` with `initial` as the only value on the stack and returns
    /// whatever ends up on top.
    ///
    /// `initial` is the CFA for register rules and 0 for the CFA rule itself.
    #[instrument(level = "trace", skip(self))]
    pub fn evaluate(&self, expr: CodeRange, initial: usize) -> Result<usize> {
        let mut stack = Stack {
            values: ArrayVec::new(),
        };
        stack.push(initial)?;

        let mut code = Cursor::new(self.code, expr.start, expr.end);
        let mut steps = 0;
        while !code.is_empty() {
            steps += 1;
            if steps > MAX_STEPS {
                return Err(Error::ExpressionTooLong);
            }
            let op = code.read_u8()?;
            self.step(op, &mut code, &mut stack, expr)?;
        }

        let result = stack.pop().map_err(|_| Error::EmptyExpressionStack)?;
        trace!("expression result: {result:#x}");
        Ok(result)
    }

    fn register(&self, register: u64) -> Result<usize> {
        self.regs.get(register)
    }

    fn deref(&self, addr: usize, size: usize) -> Result<usize> {
        if !self.bounds.contains_range(addr, size) {
            trace!("refusing to dereference {addr:#x}, not on the stack");
            return Err(Error::OutOfBounds { addr, len: size });
        }
        Ok(match size {
            1 => self.stack.read_u8(addr)? as usize,
            2 => self.stack.read_u16(addr)? as usize,
            4 => self.stack.read_u32(addr)? as usize,
            8 => self.stack.read_u64(addr)? as usize,
            _ => return Err(Error::InvalidDerefSize(size as u8)),
        })
    }

    fn jump(code: &mut Cursor<'_>, expr: CodeRange, offset: i16) -> Result<()> {
        let target = code
            .pos()
            .checked_add_signed(offset as isize)
            .ok_or(Error::AddressOverflow)?;
        if target < expr.start {
            return Err(Error::UnexpectedEnd { addr: target });
        }
        code.seek(target)
    }

    fn step(&self, op: u8, code: &mut Cursor<'_>, stack: &mut Stack, expr: CodeRange) -> Result<()> {
        match op {
            DW_OP_addr => stack.push(code.read_usize()?)?,
            DW_OP_deref => {
                let addr = stack.pop()?;
                stack.push(self.deref(addr, WORD)?)?;
            }
            DW_OP_const1u => stack.push(code.read_u8()? as usize)?,
            DW_OP_const1s => stack.push(code.read_i8()? as usize)?,
            DW_OP_const2u => stack.push(code.read_u16()? as usize)?,
            DW_OP_const2s => stack.push(code.read_i16()? as usize)?,
            DW_OP_const4u => stack.push(code.read_u32()? as usize)?,
            DW_OP_const4s => stack.push(code.read_i32()? as usize)?,
            DW_OP_const8u => stack.push(code.read_u64()? as usize)?,
            DW_OP_const8s => stack.push(code.read_i64()? as usize)?,
            DW_OP_constu => stack.push(code.read_uleb128()? as usize)?,
            DW_OP_consts => stack.push(code.read_sleb128()? as usize)?,
            DW_OP_dup => stack.push(stack.top()?)?,
            DW_OP_drop => {
                stack.pop()?;
            }
            DW_OP_over => stack.push(stack.pick(1)?)?,
            DW_OP_pick => {
                let depth = code.read_u8()?;
                stack.push(stack.pick(depth as usize)?)?;
            }
            DW_OP_swap => {
                let a = stack.pop()?;
                let b = stack.pop()?;
                stack.push(a)?;
                stack.push(b)?;
            }
            DW_OP_rot => {
                // (c b a -- a c b) with a on top
                let a = stack.pop()?;
                let b = stack.pop()?;
                let c = stack.pop()?;
                stack.push(a)?;
                stack.push(c)?;
                stack.push(b)?;
            }
            DW_OP_abs => stack.unary(|v| (v as isize).unsigned_abs())?,
            DW_OP_and => stack.binary(|a, b| Ok(a & b))?,
            DW_OP_div => stack.binary(|a, b| {
                if b == 0 {
                    return Err(Error::DivisionByZero);
                }
                Ok((a as isize).wrapping_div(b as isize) as usize)
            })?,
            DW_OP_minus => stack.binary(|a, b| Ok(a.wrapping_sub(b)))?,
            DW_OP_mod => stack.binary(|a, b| a.checked_rem(b).ok_or(Error::DivisionByZero))?,
            DW_OP_mul => stack.binary(|a, b| Ok(a.wrapping_mul(b)))?,
            DW_OP_neg => stack.unary(|v| (v as isize).wrapping_neg() as usize)?,
            DW_OP_not => stack.unary(|v| !v)?,
            DW_OP_or => stack.binary(|a, b| Ok(a | b))?,
            DW_OP_plus => stack.binary(|a, b| Ok(a.wrapping_add(b)))?,
            DW_OP_plus_uconst => {
                let addend = code.read_uleb128()? as usize;
                stack.unary(|v| v.wrapping_add(addend))?;
            }
            DW_OP_shl => stack.binary(|a, b| Ok(shift(b).map_or(0, |s| a << s)))?,
            DW_OP_shr => stack.binary(|a, b| Ok(shift(b).map_or(0, |s| a >> s)))?,
            DW_OP_shra => stack.binary(|a, b| {
                let s = shift(b).unwrap_or(usize::BITS - 1);
                Ok(((a as isize) >> s) as usize)
            })?,
            DW_OP_xor => stack.binary(|a, b| Ok(a ^ b))?,
            DW_OP_bra => {
                let offset = code.read_i16()?;
                if stack.pop()? != 0 {
                    Self::jump(code, expr, offset)?;
                }
            }
            DW_OP_eq => stack.compare(|a, b| a == b)?,
            DW_OP_ge => stack.compare(|a, b| a >= b)?,
            DW_OP_gt => stack.compare(|a, b| a > b)?,
            DW_OP_le => stack.compare(|a, b| a <= b)?,
            DW_OP_lt => stack.compare(|a, b| a < b)?,
            DW_OP_ne => stack.compare(|a, b| a != b)?,
            DW_OP_skip => {
                let offset = code.read_i16()?;
                Self::jump(code, expr, offset)?;
            }
            DW_OP_lit0..=DW_OP_lit31 => stack.push((op - DW_OP_lit0) as usize)?,
            // in CFI there is nothing to "locate" in a register, so the value
            // is what we want
            DW_OP_reg0..=DW_OP_reg31 => stack.push(self.register(u64::from(op - DW_OP_reg0))?)?,
            DW_OP_breg0..=DW_OP_breg31 => {
                let offset = code.read_sleb128()?;
                let value = self.register(u64::from(op - DW_OP_breg0))?;
                stack.push(value.wrapping_add_signed(offset as isize))?;
            }
            DW_OP_regx => {
                let register = code.read_uleb128()?;
                stack.push(self.register(register)?)?;
            }
            DW_OP_bregx => {
                let register = code.read_uleb128()?;
                let offset = code.read_sleb128()?;
                stack.push(self.register(register)?.wrapping_add_signed(offset as isize))?;
            }
            DW_OP_deref_size => {
                let size = code.read_u8()?;
                let addr = stack.pop()?;
                if !matches!(size, 1 | 2 | 4 | 8) {
                    return Err(Error::InvalidDerefSize(size));
                }
                stack.push(self.deref(addr, size as usize)?)?;
            }
            DW_OP_nop => {}
            DW_OP_GNU_encoded_addr => {
                let encoding = Encoding(code.read_u8()?);
                let value = code
                    .read_encoded(encoding, None)?
                    .ok_or(Error::InvalidEncoding(encoding.0))?;
                stack.push(value)?;
            }
            other => {
                trace!("unsupported expression opcode {other:#x}");
                return Err(Error::UnknownExprOpcode(other));
            }
        }
        Ok(())
    }
}

/// Shift amounts of a word or more shift everything out.
fn shift(amount: usize) -> Option<u32> {
    u32::try_from(amount).ok().filter(|&s| s < usize::BITS)
}

const DW_OP_addr: u8 = 0x03;
const DW_OP_deref: u8 = 0x06;
const DW_OP_const1u: u8 = 0x08;
const DW_OP_const1s: u8 = 0x09;
const DW_OP_const2u: u8 = 0x0a;
const DW_OP_const2s: u8 = 0x0b;
const DW_OP_const4u: u8 = 0x0c;
const DW_OP_const4s: u8 = 0x0d;
const DW_OP_const8u: u8 = 0x0e;
const DW_OP_const8s: u8 = 0x0f;
const DW_OP_constu: u8 = 0x10;
const DW_OP_consts: u8 = 0x11;
const DW_OP_dup: u8 = 0x12;
const DW_OP_drop: u8 = 0x13;
const DW_OP_over: u8 = 0x14;
const DW_OP_pick: u8 = 0x15;
const DW_OP_swap: u8 = 0x16;
const DW_OP_rot: u8 = 0x17;
const DW_OP_abs: u8 = 0x19;
const DW_OP_and: u8 = 0x1a;
const DW_OP_div: u8 = 0x1b;
const DW_OP_minus: u8 = 0x1c;
const DW_OP_mod: u8 = 0x1d;
const DW_OP_mul: u8 = 0x1e;
const DW_OP_neg: u8 = 0x1f;
const DW_OP_not: u8 = 0x20;
const DW_OP_or: u8 = 0x21;
const DW_OP_plus: u8 = 0x22;
const DW_OP_plus_uconst: u8 = 0x23;
const DW_OP_shl: u8 = 0x24;
const DW_OP_shr: u8 = 0x25;
const DW_OP_shra: u8 = 0x26;
const DW_OP_xor: u8 = 0x27;
const DW_OP_bra: u8 = 0x28;
const DW_OP_eq: u8 = 0x29;
const DW_OP_ge: u8 = 0x2a;
const DW_OP_gt: u8 = 0x2b;
const DW_OP_le: u8 = 0x2c;
const DW_OP_lt: u8 = 0x2d;
const DW_OP_ne: u8 = 0x2e;
const DW_OP_skip: u8 = 0x2f;
const DW_OP_lit0: u8 = 0x30;
const DW_OP_lit31: u8 = 0x4f;
const DW_OP_reg0: u8 = 0x50;
const DW_OP_reg31: u8 = 0x6f;
const DW_OP_breg0: u8 = 0x70;
const DW_OP_breg31: u8 = 0x8f;
const DW_OP_regx: u8 = 0x90;
const DW_OP_bregx: u8 = 0x92;
const DW_OP_deref_size: u8 = 0x94;
const DW_OP_nop: u8 = 0x96;
const DW_OP_GNU_encoded_addr: u8 = 0xf1;

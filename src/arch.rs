//! Register files of the architectures we unwind, numbered the way DWARF
//! numbers them so CFI rules can index them directly.

#[cfg(test)]
mod tests;

use core::arch::asm;
use core::fmt;

use crate::{Error, Result};

/// Slots in a [`Registers`]. Enough for the x86-64 GPRs plus `rip` and for
/// the AArch64 GPRs plus `sp` and `pc`.
pub const REGISTER_COUNT: usize = 34;

/// DWARF register numbers for x86-64 (System V psABI, figure 3.36).
pub mod x86_64 {
    pub const RAX: usize = 0;
    pub const RDX: usize = 1;
    pub const RCX: usize = 2;
    pub const RBX: usize = 3;
    pub const RSI: usize = 4;
    pub const RDI: usize = 5;
    pub const RBP: usize = 6;
    pub const RSP: usize = 7;
    /// The return address column. There is no real register here, but the
    /// caller's `rip` ends up in it.
    pub const RIP: usize = 16;
}

/// DWARF register numbers for AArch64 (DWARF for the Arm 64-bit
/// Architecture, section 4.1).
pub mod aarch64 {
    pub const FP: usize = 29;
    pub const LR: usize = 30;
    pub const SP: usize = 31;
    /// Not a DWARF register; we keep the program counter in the first free
    /// slot after `sp`.
    pub const PC: usize = 32;
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub const PC: usize = x86_64::RIP;
        pub const SP: usize = x86_64::RSP;
        pub const FP: usize = x86_64::RBP;
        pub const RETURN_ADDRESS: usize = x86_64::RIP;
    } else if #[cfg(target_arch = "aarch64")] {
        pub const PC: usize = aarch64::PC;
        pub const SP: usize = aarch64::SP;
        pub const FP: usize = aarch64::FP;
        pub const RETURN_ADDRESS: usize = aarch64::LR;
    } else {
        compile_error!("only x86_64 and aarch64 are supported");
    }
}

/// A snapshot of one thread's registers.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Registers {
    regs: [usize; REGISTER_COUNT],
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registers")
            .field("pc", &format_args!("{:#x}", self.pc()))
            .field("sp", &format_args!("{:#x}", self.sp()))
            .field("fp", &format_args!("{:#x}", self.fp()))
            .finish_non_exhaustive()
    }
}

impl Registers {
    pub const fn new() -> Self {
        Self {
            regs: [0; REGISTER_COUNT],
        }
    }

    pub fn get(&self, register: u64) -> Result<usize> {
        usize::try_from(register)
            .ok()
            .and_then(|r| self.regs.get(r))
            .copied()
            .ok_or(Error::InvalidRegister(register))
    }

    pub fn set(&mut self, register: u64, value: usize) -> Result<()> {
        let slot = usize::try_from(register)
            .ok()
            .and_then(|r| self.regs.get_mut(r))
            .ok_or(Error::InvalidRegister(register))?;
        *slot = value;
        Ok(())
    }

    pub fn as_array(&self) -> &[usize; REGISTER_COUNT] {
        &self.regs
    }

    pub fn pc(&self) -> usize {
        self.regs[PC]
    }

    pub fn set_pc(&mut self, value: usize) {
        self.regs[PC] = value;
    }

    pub fn sp(&self) -> usize {
        self.regs[SP]
    }

    pub fn set_sp(&mut self, value: usize) {
        self.regs[SP] = value;
    }

    pub fn fp(&self) -> usize {
        self.regs[FP]
    }

    pub fn set_fp(&mut self, value: usize) {
        self.regs[FP] = value;
    }

    /// The value in the return address column.
    pub fn return_address(&self) -> usize {
        self.regs[RETURN_ADDRESS]
    }
}

#[cfg(target_arch = "x86_64")]
impl Registers {
    /// Loads the registers a signal handler was handed.
    pub fn from_ucontext(context: &libc::ucontext_t) -> Self {
        let g = &context.uc_mcontext.gregs;
        let r = |index: libc::c_int| g[index as usize] as usize;

        let mut regs = Self::new();
        regs.regs[x86_64::RAX] = r(libc::REG_RAX);
        regs.regs[x86_64::RDX] = r(libc::REG_RDX);
        regs.regs[x86_64::RCX] = r(libc::REG_RCX);
        regs.regs[x86_64::RBX] = r(libc::REG_RBX);
        regs.regs[x86_64::RSI] = r(libc::REG_RSI);
        regs.regs[x86_64::RDI] = r(libc::REG_RDI);
        regs.regs[x86_64::RBP] = r(libc::REG_RBP);
        regs.regs[x86_64::RSP] = r(libc::REG_RSP);
        regs.regs[8] = r(libc::REG_R8);
        regs.regs[9] = r(libc::REG_R9);
        regs.regs[10] = r(libc::REG_R10);
        regs.regs[11] = r(libc::REG_R11);
        regs.regs[12] = r(libc::REG_R12);
        regs.regs[13] = r(libc::REG_R13);
        regs.regs[14] = r(libc::REG_R14);
        regs.regs[15] = r(libc::REG_R15);
        regs.regs[x86_64::RIP] = r(libc::REG_RIP);
        regs
    }

    /// Loads a `PTRACE_GETREGS` block. The kernel orders it by push order in
    /// the syscall entry path, not by DWARF number.
    pub fn from_user_regs(user: &libc::user_regs_struct) -> Self {
        let mut regs = Self::new();
        regs.regs[x86_64::RAX] = user.rax as usize;
        regs.regs[x86_64::RDX] = user.rdx as usize;
        regs.regs[x86_64::RCX] = user.rcx as usize;
        regs.regs[x86_64::RBX] = user.rbx as usize;
        regs.regs[x86_64::RSI] = user.rsi as usize;
        regs.regs[x86_64::RDI] = user.rdi as usize;
        regs.regs[x86_64::RBP] = user.rbp as usize;
        regs.regs[x86_64::RSP] = user.rsp as usize;
        regs.regs[8] = user.r8 as usize;
        regs.regs[9] = user.r9 as usize;
        regs.regs[10] = user.r10 as usize;
        regs.regs[11] = user.r11 as usize;
        regs.regs[12] = user.r12 as usize;
        regs.regs[13] = user.r13 as usize;
        regs.regs[14] = user.r14 as usize;
        regs.regs[15] = user.r15 as usize;
        regs.regs[x86_64::RIP] = user.rip as usize;
        regs
    }

    /// Reads the registers of a stopped tracee.
    pub fn from_ptrace(tid: libc::pid_t) -> Result<Self> {
        // SAFETY: all zeroes is a valid register block.
        let mut user: libc::user_regs_struct = unsafe { core::mem::zeroed() };
        // SAFETY: GETREGS writes exactly one user_regs_struct.
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGS,
                tid,
                core::ptr::null_mut::<libc::c_void>(),
                &mut user as *mut libc::user_regs_struct,
            )
        };
        if ret == -1 {
            return Err(Error::Os(crate::stdext::errno()));
        }
        Ok(Self::from_user_regs(&user))
    }
}

#[cfg(target_arch = "aarch64")]
impl Registers {
    /// Loads the registers a signal handler was handed.
    pub fn from_ucontext(context: &libc::ucontext_t) -> Self {
        let m = &context.uc_mcontext;
        Self::from_parts(&m.regs, m.sp, m.pc)
    }

    /// Loads a `PTRACE_GETREGSET`/`NT_PRSTATUS` block, which is already in
    /// DWARF order.
    pub fn from_user_regs(user: &libc::user_regs_struct) -> Self {
        Self::from_parts(&user.regs, user.sp, user.pc)
    }

    fn from_parts(x: &[u64; 31], sp: u64, pc: u64) -> Self {
        let mut regs = Self::new();
        for (slot, value) in regs.regs.iter_mut().zip(x) {
            *slot = *value as usize;
        }
        regs.regs[aarch64::SP] = sp as usize;
        regs.regs[aarch64::PC] = pc as usize;
        regs
    }

    /// Reads the registers of a stopped tracee.
    pub fn from_ptrace(tid: libc::pid_t) -> Result<Self> {
        // SAFETY: all zeroes is a valid register block.
        let mut user: libc::user_regs_struct = unsafe { core::mem::zeroed() };
        let mut iov = libc::iovec {
            iov_base: (&mut user as *mut libc::user_regs_struct).cast(),
            iov_len: core::mem::size_of::<libc::user_regs_struct>(),
        };
        // SAFETY: the iovec describes exactly one user_regs_struct.
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGSET,
                tid,
                libc::NT_PRSTATUS as usize as *mut libc::c_void,
                &mut iov as *mut libc::iovec,
            )
        };
        if ret == -1 {
            return Err(Error::Os(crate::stdext::errno()));
        }
        Ok(Self::from_user_regs(&user))
    }
}

/// Captures the registers of the calling function.
///
/// Inlined so that `pc`, `sp` and the callee-saved registers describe the
/// caller's frame, which is where the walk starts. `rdi` carries the
/// buffer into the asm and reads back as zero; no unwind rule needs it.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn capture_context() -> Registers {
    let mut context = Registers::new();

    unsafe {
        asm!(
            "mov [rdi+0*8], rax",
            "mov [rdi+1*8], rdx",
            "mov [rdi+2*8], rcx",
            "mov [rdi+3*8], rbx", // required callee-saved
            "mov [rdi+4*8], rsi",
            // rdi holds `regs`, its slot stays zero
            "mov [rdi+6*8], rbp", // required callee-saved
            "mov [rdi+7*8], rsp", // required callee-saved
            "mov [rdi+8*8], r8",
            "mov [rdi+9*8], r9",
            "mov [rdi+10*8], r10",
            "mov [rdi+11*8], r11",
            "mov [rdi+12*8], r12", // required callee-saved
            "mov [rdi+13*8], r13", // required callee-saved
            "mov [rdi+14*8], r14", // required callee-saved
            "mov [rdi+15*8], r15", // required callee-saved

            "lea {tmp}, [rip + 0]", // must use rip as a base register
            "mov [rdi+16*8], {tmp}",

            tmp = out(reg) _,
            in("rdi") context.regs.as_mut_ptr(),
            options(nostack, preserves_flags),
        );
    }

    context
}

/// Captures the registers of the calling function.
///
/// Inlined so that `pc`, `sp` and the callee-saved registers describe the
/// caller's frame, which is where the walk starts. `x16` carries the
/// buffer into the asm and reads back as zero; no unwind rule needs it.
#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub fn capture_context() -> Registers {
    let mut context = Registers::new();

    unsafe {
        asm!(
            "stp x0, x1, [x16, #0]",
            "stp x2, x3, [x16, #16]",
            "stp x4, x5, [x16, #32]",
            "stp x6, x7, [x16, #48]",
            "stp x8, x9, [x16, #64]",
            "stp x10, x11, [x16, #80]",
            "stp x12, x13, [x16, #96]",
            "stp x14, x15, [x16, #112]",
            // x16 holds `regs`, its slot stays zero
            "str x17, [x16, #136]",
            "stp x18, x19, [x16, #144]",
            "stp x20, x21, [x16, #160]",
            "stp x22, x23, [x16, #176]",
            "stp x24, x25, [x16, #192]",
            "stp x26, x27, [x16, #208]",
            "stp x28, x29, [x16, #224]",
            "str x30, [x16, #240]",
            "mov {tmp}, sp",
            "str {tmp}, [x16, #248]",
            "adr {tmp}, .",
            "str {tmp}, [x16, #256]",

            tmp = out(reg) _,
            in("x16") context.regs.as_mut_ptr(),
            options(nostack, preserves_flags),
        );
    }

    context
}

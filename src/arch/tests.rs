use super::{capture_context, Registers, FP, PC, REGISTER_COUNT, SP};
use crate::Error;

#[test]
fn named_slots_alias_numbered_ones() {
    let mut regs = Registers::new();
    regs.set_pc(0x1000);
    regs.set_sp(0x7ff0);
    regs.set_fp(0x7ff8);

    assert_eq!(regs.get(PC as u64).unwrap(), 0x1000);
    assert_eq!(regs.get(SP as u64).unwrap(), 0x7ff0);
    assert_eq!(regs.get(FP as u64).unwrap(), 0x7ff8);

    regs.set(SP as u64, 0x6000).unwrap();
    assert_eq!(regs.sp(), 0x6000);
}

#[test]
fn out_of_range_registers() {
    let mut regs = Registers::new();
    let last = REGISTER_COUNT as u64 - 1;
    assert!(regs.set(last, 1).is_ok());
    assert_eq!(regs.get(last), Ok(1));
    assert_eq!(regs.get(last + 1), Err(Error::InvalidRegister(last + 1)));
    assert_eq!(regs.set(u64::MAX, 1), Err(Error::InvalidRegister(u64::MAX)));
}

#[test]
fn captures_this_frame() {
    let local = 0u64;
    let regs = capture_context();

    let here = captures_this_frame as usize;
    assert_ne!(regs.pc(), 0);
    // the stack pointer of this frame sits just below its locals
    let local_addr = &local as *const u64 as usize;
    assert!(regs.sp() <= local_addr);
    assert!(local_addr - regs.sp() < 64 * 1024);
    // the captured pc is inside this function, somewhere after its start
    assert!(regs.pc() > here);
}

#[test]
fn buffer_register_reads_back_as_zero() {
    let regs = capture_context();

    #[cfg(target_arch = "x86_64")]
    let scratch = super::x86_64::RDI;
    #[cfg(target_arch = "aarch64")]
    let scratch = 16;

    // the asm never stores the register that points at the buffer
    assert_eq!(regs.get(scratch as u64), Ok(0));
    assert_ne!(regs.sp(), 0);
}

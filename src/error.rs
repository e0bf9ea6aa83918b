/// Everything that can stop a single unwind step.
///
/// None of these are fatal for a walk as a whole: the walker turns a failed
/// step into a frame-pointer fallback or a truncated backtrace.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    // malformed images and unwind data
    #[error("not an ELF image")]
    BadMagic,
    #[error("unsupported ELF image (only native 64-bit little endian is handled)")]
    UnsupportedElf,
    #[error("ELF header index or offset is out of range")]
    HeaderOutOfRange,
    #[error("unwind data ended unexpectedly at {addr:#x}")]
    UnexpectedEnd { addr: usize },
    #[error("invalid pointer encoding {0:#x}")]
    InvalidEncoding(u8),
    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),
    #[error("64-bit DWARF entries are not supported")]
    Dwarf64,
    #[error("unknown augmentation {:?}", char::from(*.0))]
    UnknownAugmentation(u8),
    #[error("unknown call frame instruction {0:#x}")]
    UnknownCfaOpcode(u8),
    #[error("unknown expression opcode {0:#x}")]
    UnknownExprOpcode(u8),
    #[error("module has no unwind information")]
    NoUnwindInfo,
    #[error(".eh_frame_hdr has no binary search table")]
    NoSearchTable,
    #[error(".eh_frame_hdr binary search table is empty")]
    EmptySearchTable,
    #[error("entry does not have the expected CIE id")]
    InvalidCieId,
    #[error("pc {pc:#x} is not covered by the FDE found for it")]
    PcOutsideFde { pc: usize },
    #[error("expression stack underflow")]
    ExpressionStackUnderflow,
    #[error("expression stack overflow")]
    ExpressionStackOverflow,
    #[error("expression finished with an empty stack")]
    EmptyExpressionStack,
    #[error("expression did not finish within its step limit")]
    ExpressionTooLong,
    #[error("division by zero in expression")]
    DivisionByZero,
    #[error("invalid dereference size {0}")]
    InvalidDerefSize(u8),
    #[error("no usable CFA rule")]
    NoCfaRule,
    #[error("register {0} is out of range")]
    InvalidRegister(u64),

    // addresses that point somewhere they must not
    #[error("{len} bytes at {addr:#x} are outside the memory view")]
    OutOfBounds { addr: usize, len: usize },
    #[error("CFA {cfa:#x} is outside the stack")]
    CfaOutOfStack { cfa: usize },
    #[error("address arithmetic overflowed")]
    AddressOverflow,
    #[error("frame pointer is null")]
    NullFramePointer,
    #[error("frame pointer did not move towards the stack base")]
    FramePointerMovedBackwards,

    // reading memory and talking to the kernel
    #[error("could not read memory at {addr:#x}")]
    ReadFailed { addr: usize },
    #[error("os error {0}")]
    Os(i32),
    #[error("remote memory has no directly addressable file offsets")]
    NotMapped,
    #[error("path does not fit its buffer")]
    PathTooLong,

    // walker bookkeeping
    #[error("no module contains pc {pc:#x}")]
    NoModule { pc: usize },
    #[error("fixed-capacity table is full")]
    TableFull,
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

//! A DWARF call frame information unwinder for Linux on x86-64 and AArch64.
//!
//! It walks the stack of a thread of this process (say, from a signal handler
//! after a crash) or of a stopped tracee, without trusting frame pointers.
//! Nothing here allocates, so it is fine to run where `malloc` is not.
//!
//! ```no_run
//! use eh_unwind::{arch, walk, ModuleTable, StackBounds, WalkOptions};
//! use eh_unwind::memory::Reader;
//!
//! # fn stack_bounds() -> StackBounds { unimplemented!() }
//! let mut modules = ModuleTable::new();
//! modules.rebuild_from_loaded_objects().unwrap();
//!
//! let regs = arch::capture_context();
//! let bounds = stack_bounds();
//! let stack = unsafe { bounds.view(Reader::Local) };
//! let backtrace = walk(&mut modules, stack, bounds, 0, &regs, &WalkOptions::default());
//! ```

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate tracing;

mod stdext;

pub mod arch;
pub mod dwarf;
pub mod elf;
mod error;
pub mod identify;
pub mod maps;
pub mod memory;
pub mod module;
pub mod walk;

#[cfg(test)]
mod fixtures;

pub use arch::Registers;
pub use error::{Error, Result};
pub use memory::{MemoryView, StackBounds};
pub use module::ModuleTable;
pub use walk::{walk, Backtrace, Frame, WalkOptions};

pub const MAX_MODULES: usize = 256;
/// `.symtab` and `.dynsym` is all anyone has, but be generous.
pub const MAX_SYMBOL_TABLES: usize = 4;
pub const MAX_FRAMES: usize = 64;
/// Function names are cut at this many bytes.
pub const NAME_CAPACITY: usize = 128;
/// Module paths are cut at this many bytes.
pub const PATH_CAPACITY: usize = 256;

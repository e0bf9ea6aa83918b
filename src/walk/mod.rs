//! The frame walker: pc to module to unwind rules to the caller's registers,
//! and again, until the stack runs out.
//!
//! A frame that the CFI cannot step through is retried with the frame pointer
//! walker. When that fails too the walk ends early and the backtrace records
//! why; a short backtrace is still a backtrace.


mod cfi;
mod fp;

use core::fmt;

use arrayvec::{ArrayString, ArrayVec};

pub use self::cfi::{step_cfi, Step};
pub use self::fp::step_fp;
use crate::arch::Registers;
use crate::memory::{MemoryView, StackBounds};
use crate::module::{ModuleRef, ModuleTable};
use crate::{Error, MAX_FRAMES, NAME_CAPACITY, PATH_CAPACITY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkOptions {
    /// Clamped to [`MAX_FRAMES`].
    pub max_depth: usize,
    /// Try the frame pointer when a frame has no usable CFI.
    pub frame_pointer_fallback: bool,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            max_depth: 32,
            frame_pointer_fallback: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub module: Option<ModuleRef>,
    pub sequence_number: usize,
    pub thread_id: libc::pid_t,
    pub pc: usize,
    /// `pc` minus the load bias of its module.
    pub relative_pc: usize,
    pub stack_pointer: usize,
    pub frame_pointer: usize,
    pub module_base: usize,
    pub module_name: ArrayString<PATH_CAPACITY>,
    /// Empty if the module has no symbol for the pc.
    pub function_name: ArrayString<NAME_CAPACITY>,
    pub function_offset: usize,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02} pc {:#018x}", self.sequence_number, self.pc)?;
        if self.module.is_none() {
            return f.write_str(" <unknown>");
        }
        write!(f, " (rel {:#x}) {}", self.relative_pc, self.module_name)?;
        if !self.function_name.is_empty() {
            write!(f, " ({}+{:#x})", self.function_name, self.function_offset)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Backtrace {
    pub thread_id: libc::pid_t,
    pub frames: ArrayVec<Frame, MAX_FRAMES>,
    /// Why the walk stopped before the outermost frame, if it did.
    pub truncated_by: Option<Error>,
}

impl fmt::Display for Backtrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "thread {}:", self.thread_id)?;
        for frame in &self.frames {
            writeln!(f, "  {frame}")?;
        }
        if let Some(err) = self.truncated_by {
            writeln!(f, "  (truncated: {err})")?;
        }
        Ok(())
    }
}

/// Walks the stack of `thread_id`, starting from `regs`.
///
/// `stack` is where saved registers are read from and `bounds` is the window
/// every CFA and dereference has to stay in. Modules of `modules` are loaded
/// as the walk runs into them.
#[instrument(level = "debug", skip(modules, stack, regs), fields(pc = regs.pc(), sp = regs.sp()))]
pub fn walk(
    modules: &mut ModuleTable,
    stack: MemoryView<'_>,
    bounds: StackBounds,
    thread_id: libc::pid_t,
    regs: &Registers,
    options: &WalkOptions,
) -> Backtrace {
    let mut backtrace = Backtrace {
        thread_id,
        frames: ArrayVec::new(),
        truncated_by: None,
    };
    let max_depth = options.max_depth.min(MAX_FRAMES);

    let mut regs = *regs;
    // the innermost pc is exact, the others are return addresses that may
    // already point at the next function
    let mut exact_pc = true;

    for depth in 0..max_depth {
        let pc = regs.pc();
        let mut frame = Frame {
            module: None,
            sequence_number: depth,
            thread_id,
            pc,
            relative_pc: 0,
            stack_pointer: regs.sp(),
            frame_pointer: regs.fp(),
            module_base: 0,
            module_name: ArrayString::new(),
            function_name: ArrayString::new(),
            function_offset: 0,
        };

        let Some(module_ref) = modules.resolve(pc) else {
            warn!(pc, depth, "no module for pc, stopping");
            backtrace.frames.push(frame);
            backtrace.truncated_by = Some(Error::NoModule { pc });
            break;
        };
        let Some(module) = modules.get(module_ref) else {
            break;
        };

        let relative_pc = module.relative_pc(pc);
        let lookup_pc = if exact_pc { relative_pc } else { relative_pc.wrapping_sub(1) };
        frame.module = Some(module_ref);
        frame.relative_pc = relative_pc;
        frame.module_base = module.load_bias;
        frame.module_name = module.name;
        if let Some(function) = module.image().and_then(|image| image.function_info(lookup_pc)) {
            frame.function_name = function.name;
            frame.function_offset = function.offset.wrapping_add(relative_pc.wrapping_sub(lookup_pc));
        }
        backtrace.frames.push(frame);

        let step = match module.image() {
            Some(image) => step_cfi(image, &regs, stack, bounds, lookup_pc),
            None => Err(Error::NoUnwindInfo),
        };
        let caller = match step {
            Ok(step) => {
                exact_pc = step.signal_frame;
                step.regs
            }
            Err(err) => {
                debug!(module = %module.name, pc, ?err, "cannot step through CFI");
                let fallback = if options.frame_pointer_fallback {
                    step_fp(&regs, stack, bounds)
                } else {
                    Err(err)
                };
                match fallback {
                    Ok(caller) => {
                        exact_pc = false;
                        caller
                    }
                    Err(fp_err) => {
                        warn!(module = %module.name, pc, ?err, ?fp_err, "cannot unwind frame, stopping");
                        backtrace.truncated_by = Some(fp_err);
                        break;
                    }
                }
            }
        };

        if caller.pc() == 0 {
            trace!(depth, "reached the outermost frame");
            break;
        }
        if depth > 0 && caller.pc() == regs.pc() && caller.sp() == regs.sp() {
            debug!(pc, depth, "unwinding does not advance, stopping");
            break;
        }
        regs = caller;
    }

    backtrace
}

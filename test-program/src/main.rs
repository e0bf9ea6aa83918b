//! Prints backtraces: of this process, or of a traced child stopped a few
//! calls deep.
//!
//! ```text
//! cargo run -p test-program          # walk ourselves
//! cargo run -p test-program -- child # walk a stopped child
//! RUST_LOG=eh_unwind=trace cargo run -p test-program
//! ```

use std::{fs, hint::black_box, ptr};

use eh_unwind::{arch, maps::MapEntry, memory::Reader, walk, ModuleTable, Registers, StackBounds, WalkOptions};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() {
    let registry = tracing_subscriber::Registry::default().with(
        EnvFilter::builder()
            .with_default_directive(tracing::Level::INFO.into())
            .from_env()
            .unwrap(),
    );

    let tree_layer = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);

    registry.with(tree_layer).init();

    match std::env::args().nth(1).as_deref() {
        Some("child") => walk_child(),
        _ => recurse(3, walk_self),
    }
}

#[inline(never)]
fn recurse(depth: usize, at_the_bottom: fn()) {
    if depth == 0 {
        at_the_bottom();
    } else {
        recurse(black_box(depth - 1), at_the_bottom);
    }
    // keep this from becoming a tail call
    black_box(depth);
}

/// The `[stack]` mapping of `pid`, which is the main thread's stack.
fn main_thread_stack(pid: &str) -> StackBounds {
    let maps = fs::read_to_string(format!("/proc/{pid}/maps")).unwrap();
    maps.lines()
        .filter_map(MapEntry::parse)
        .find(|entry| entry.path.as_str() == "[stack]")
        .map(|entry| StackBounds::new(entry.start, entry.end))
        .expect("no [stack] mapping")
}

#[inline(never)]
fn walk_self() {
    let mut modules = Box::new(ModuleTable::new());
    modules.rebuild_from_loaded_objects().unwrap();

    let regs = arch::capture_context();
    let bounds = main_thread_stack("self");
    // SAFETY: this is our own stack, it is mapped.
    let stack = unsafe { bounds.view(Reader::Local) };
    // SAFETY: gettid has no preconditions.
    let tid = unsafe { libc::gettid() };

    let backtrace = walk(&mut modules, stack, bounds, tid, &regs, &WalkOptions::default());
    print!("{backtrace}");
}

fn stop_self() {
    // SAFETY: stopping ourselves is fine, the parent is waiting for it.
    unsafe { libc::raise(libc::SIGSTOP) };
}

fn walk_child() {
    // SAFETY: the child only calls async-signal-safe functions.
    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");
    if pid == 0 {
        // SAFETY: TRACEME takes no pointers.
        unsafe {
            libc::ptrace(
                libc::PTRACE_TRACEME,
                0,
                ptr::null_mut::<libc::c_void>(),
                ptr::null_mut::<libc::c_void>(),
            );
        }
        recurse(3, stop_self);
        // SAFETY: we are a forked child.
        unsafe { libc::_exit(0) };
    }

    let mut status = 0;
    // SAFETY: status is a valid pointer.
    unsafe { libc::waitpid(pid, &mut status, 0) };
    assert!(libc::WIFSTOPPED(status), "child did not stop: {status:#x}");

    let regs = Registers::from_ptrace(pid).unwrap();
    let mut modules = Box::new(ModuleTable::new());
    modules.rebuild_from_proc_maps(pid).unwrap();
    let bounds = main_thread_stack(&pid.to_string());
    // SAFETY: remote views never touch our memory.
    let stack = unsafe { bounds.view(Reader::Remote { pid }) };

    let backtrace = walk(&mut modules, stack, bounds, pid, &regs, &WalkOptions::default());
    print!("{backtrace}");

    // SAFETY: the child is ours to kill.
    unsafe {
        libc::kill(pid, libc::SIGKILL);
        libc::waitpid(pid, &mut status, 0);
    }
}

//! saturnia, a small preemptive multitasking kernel core
//!
//! this crate is the machine-independent heart of the kernel: paging and
//! address spaces, per-process heaps, the scheduler and task lifecycle,
//! semaphore/pipe IPC, and the trap-based system call interface. bootstrap,
//! descriptor tables, the interrupt controller, the timer chip, and the text
//! mode display all live in the platform layer outside this crate- the core
//! only consumes a periodic tick, a trap installer, a kernel stack setter,
//! and a character sink (see [Platform]).
//!
//! on `x86` targets the `arch::i586` module drives the real MMU and performs
//! the actual register and stack switching. on any other target the
//! `arch::hosted` module substitutes a software MMU so the whole kernel state
//! machine can be exercised by `cargo test` on a development machine.

#![cfg_attr(not(test), no_std)]
#![allow(static_mut_refs)]

extern crate alloc;

pub mod arch;
pub mod console;
pub mod ipc;
pub mod kernel;
pub mod mm;
pub mod syscall;
pub mod task;
#[cfg(test)]
pub(crate) mod testutil;
pub mod util;

pub use console::Console;
pub use kernel::{kernel, Kernel, KernelError, Platform};
pub use mm::MemoryLayout;

pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// initializes the kernel singleton and hands control of trap vector 0x80 to
/// the syscall dispatcher. the platform must have set up its own allocator,
/// descriptor tables, and interrupt controller first, and must call
/// [timer_interrupt] from its timer IRQ handler from here on out
pub fn init(platform: Platform, layout: MemoryLayout) {
    let k = Kernel::bootstrap(platform, layout);

    log::info!("{} v{}, pid {} is the idle task", NAME, VERSION, k.idle_pid());

    unsafe {
        kernel::install(k);
    }
}

/// the platform's timer IRQ handler calls this once per tick
/// ([task::sched::TIME_QUANTUM] ms)
pub fn timer_interrupt() {
    unsafe {
        kernel().schedule(true, true, true);
    }
}

//! architecture support
//!
//! `i586` drives the real hardware: cr3 loads, TLB flushes, the page copy
//! windows, and the register/stack juggling behind context switches. every
//! other build target gets `hosted`, a software stand-in that keeps the same
//! interface but models physical memory in ordinary allocations so the rest
//! of the kernel can run under a test harness

use core::fmt;

// architecture specific modules
#[cfg(target_arch = "x86")]
pub mod i586;
#[cfg(target_arch = "x86")]
pub use self::i586 as target;

#[cfg(not(target_arch = "x86"))]
pub mod hosted;
#[cfg(not(target_arch = "x86"))]
pub use self::hosted as target;

pub use self::target::{capture_context, enter_cleanup_stack, restore_context, Mmu};

/// size of a page (and of a page frame) in bytes
pub const PAGE_SIZE: usize = 0x1000;

/// size of a machine word in bytes, the granularity of heap blocks
pub const WORD_SIZE: usize = core::mem::size_of::<usize>();

/// a physical memory address. same width as a virtual address on i586
pub type PhysicalAddress = usize;

/// the register file a trap pushes before entering the kernel, in stub push
/// order. the syscall dispatcher reads arguments out of this and writes the
/// result back into it, and fork clones it wholesale for the child
#[repr(C)]
#[derive(Default, Copy, Clone, PartialEq, Eq)]
pub struct Registers {
    pub ds: usize,
    pub edi: usize,
    pub esi: usize,
    pub ebp: usize,
    pub esp: usize,
    pub ebx: usize,
    pub edx: usize,
    pub ecx: usize,
    pub eax: usize,
    pub error_code: usize,
    pub eip: usize,
    pub cs: usize,
    pub eflags: usize,
    pub useresp: usize,
    pub ss: usize,
}

impl fmt::Debug for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Registers {{ eax: {:#x}, ebx: {:#x}, ecx: {:#x}, edx: {:#x}, esi: {:#x}, edi: {:#x}, ebp: {:#x}, eip: {:#x}, useresp: {:#x} }}",
            self.eax, self.ebx, self.ecx, self.edx, self.esi, self.edi, self.ebp, self.eip, self.useresp
        )
    }
}

/// the saved execution state of a parked task: where it was, and where its
/// kernel stack and frame were. restoring these three (plus the directory
/// register) is all it takes to resume
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub struct Context {
    pub eip: usize,
    pub esp: usize,
    pub ebp: usize,
}

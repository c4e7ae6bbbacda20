//! software MMU for non-x86 builds
//!
//! keeps the same surface as `arch::i586` but models physical frames as
//! ordinary allocations keyed by address, so directory clones really copy
//! bytes and tests can inspect them. "physical" addresses of page tables are
//! simply their host addresses. there is no real register state to capture
//! or restore here- context operations degrade to no-ops and the scheduler's
//! bookkeeping is exercised without the actual jump

use super::{Context, PhysicalAddress, PAGE_SIZE};
use alloc::{alloc::alloc_zeroed, boxed::Box, collections::BTreeMap};
use core::{alloc::Layout, ptr::NonNull};

/// the software MMU. frame contents live in a map so only frames that are
/// ever written cost memory
pub struct Mmu {
    frames: BTreeMap<PhysicalAddress, Box<[u8; PAGE_SIZE]>>,
    active: PhysicalAddress,
}

impl Mmu {
    pub fn new() -> Self {
        Self {
            frames: BTreeMap::new(),
            active: 0,
        }
    }

    /// the contents of the frame at `phys`, materialized zero-filled on
    /// first touch
    pub fn frame_bytes(&mut self, phys: PhysicalAddress) -> &mut [u8; PAGE_SIZE] {
        debug_assert!(phys % PAGE_SIZE == 0);
        self.frames.entry(phys).or_insert_with(|| Box::new([0; PAGE_SIZE]))
    }

    /// which directory was last activated
    pub fn active_directory(&self) -> PhysicalAddress {
        self.active
    }
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new()
    }
}

impl crate::mm::paging::Mmu for Mmu {
    fn page_alloc(&mut self, size: usize) -> (NonNull<u8>, PhysicalAddress) {
        let layout = Layout::from_size_align(size, PAGE_SIZE).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).expect("kernel heap exhausted");

        (ptr, ptr.as_ptr() as PhysicalAddress)
    }

    unsafe fn copy_frame(&mut self, dest: PhysicalAddress, src: PhysicalAddress) {
        let contents = *self.frame_bytes(src);
        *self.frame_bytes(dest) = contents;
    }

    unsafe fn activate(&mut self, dir_phys: PhysicalAddress) {
        self.active = dir_phys;
    }
}

/// no kernel-stack snapshots off hardware
pub fn capture_context() -> Option<Context> {
    None
}

/// nothing to restore; the caller simply keeps running
///
/// # Safety
///
/// trivially safe here, unsafe for parity with the hardware signature
pub unsafe fn restore_context(_ctx: &Context, _dir_phys: PhysicalAddress, _fresh: bool) {}

/// nothing to switch
///
/// # Safety
///
/// trivially safe here, unsafe for parity with the hardware signature
pub unsafe fn enter_cleanup_stack(_stack_top: usize) {}

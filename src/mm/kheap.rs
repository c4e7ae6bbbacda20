//! the kernel's own heap
//!
//! kernel-side `Box`/`Vec` allocations (task records, page tables, queues)
//! go through `linked_list_allocator` over the kernel heap window. the
//! platform maps the window and calls [init] before anything here allocates.
//! user processes never see this heap- they get the best-fit allocator in
//! [super::heap]

use linked_list_allocator::LockedHeap;

#[cfg_attr(all(target_arch = "x86", not(test)), global_allocator)]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// hands the kernel heap window to the allocator
///
/// # Safety
///
/// `start..start + size` must be mapped, writable, and used for nothing
/// else; call this exactly once
pub unsafe fn init(start: usize, size: usize) {
    ALLOCATOR.lock().init(start as *mut u8, size);
}

/// bytes the allocator still has available, for the exit/fork accounting
/// lines
pub fn free_space() -> usize {
    ALLOCATOR.lock().free()
}

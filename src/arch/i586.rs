//! i586 MMU and context switching
//!
//! everything in here touches real hardware state: cr3 and cr0, the TLB, and
//! the stack/instruction pointers themselves. the two page copy windows are
//! reserved virtual pages in the kernel directory that get retargeted at
//! whichever frames a directory clone is currently copying between

use super::{Context, PhysicalAddress, PAGE_SIZE, WORD_SIZE};
use crate::mm::paging::{Page, PageDir};
use alloc::alloc::alloc_zeroed;
use core::{alloc::Layout, arch::asm, ptr::NonNull};
use log::trace;
use x86::controlregs::{self, Cr0};

/// virtual address the source frame of a page copy is mapped at
const SRC_COPY_WINDOW: usize = 0xffbf_e000;

/// virtual address the destination frame of a page copy is mapped at
const DEST_COPY_WINDOW: usize = 0xffbf_f000;

struct CopyWindows {
    src_entry: NonNull<Page>,
    dest_entry: NonNull<Page>,
}

/// the hardware MMU driver
pub struct Mmu {
    /// the kernel directory, used to translate fresh kernel-heap allocations
    /// to physical addresses once paging is live. until it is attached,
    /// kernel memory is identity mapped and translation is trivial
    kernel_dir: Option<NonNull<PageDir>>,

    windows: Option<CopyWindows>,
}

impl Mmu {
    pub fn new() -> Self {
        Self {
            kernel_dir: None,
            windows: None,
        }
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

        let virt = ptr.as_ptr() as usize;
        let phys = match self.kernel_dir {
            // paging is not up yet, kernel memory is identity mapped
            None => virt,
            Some(dir) => unsafe { dir.as_ref() }
                .virt_to_phys(virt)
                .expect("kernel allocation not mapped in the kernel directory"),
        };

        (ptr, phys)
    }

    unsafe fn copy_frame(&mut self, dest: PhysicalAddress, src: PhysicalAddress) {
        let windows = self.windows.as_mut().expect("copy windows not attached");

        windows.src_entry.as_mut().set_frame((src / PAGE_SIZE) as u32);
        windows.dest_entry.as_mut().set_frame((dest / PAGE_SIZE) as u32);

        // rewriting cr3 flushes the whole TLB, which takes the stale window
        // mappings with it
        controlregs::cr3_write(controlregs::cr3());

        core::ptr::copy_nonoverlapping(SRC_COPY_WINDOW as *const u8, DEST_COPY_WINDOW as *mut u8, PAGE_SIZE);
    }

    unsafe fn activate(&mut self, dir_phys: PhysicalAddress) {
        trace!("switching to page directory @ {:#x}", dir_phys);

        controlregs::cr3_write(dir_phys as u64);
        controlregs::cr0_write(controlregs::cr0() | Cr0::CR0_ENABLE_PAGING);
    }

    fn attach_kernel_dir(&mut self, dir: &mut PageDir) {
        let src_entry = {
            let page = dir.get_page(SRC_COPY_WINDOW, true, self).unwrap();
            page.set_present(true);
            page.set_writable(true);
            NonNull::from(page)
        };
        let dest_entry = {
            let page = dir.get_page(DEST_COPY_WINDOW, true, self).unwrap();
            page.set_present(true);
            page.set_writable(true);
            NonNull::from(page)
        };

        self.windows = Some(CopyWindows { src_entry, dest_entry });
        self.kernel_dir = Some(NonNull::from(dir));
    }
}

/// returns the address of the instruction right after the call to this
/// function- which is simply the return address sitting on top of the stack
#[unsafe(naked)]
pub extern "C" fn read_ip() -> usize {
    core::arch::naked_asm!("mov eax, [esp]", "ret")
}

/// snapshots the caller's instruction, stack, and base pointers. a task
/// resumed from this snapshot continues right here, so callers distinguish
/// the two returns by state they can observe (fork compares the current pid
/// against the one captured before the snapshot)
#[inline(always)]
pub fn capture_context() -> Option<Context> {
    let eip = read_ip();
    let esp: usize;
    let ebp: usize;
    unsafe {
        asm!("mov {0}, esp", out(reg) esp, options(nomem, nostack));
        asm!("mov {0}, ebp", out(reg) ebp, options(nomem, nostack));
    }

    Some(Context { eip, esp, ebp })
}

/// switches execution to `ctx` in the address space named by `dir_phys`
///
/// a task parked by the scheduler left its own scheduler invocation on its
/// stack, so restoring its stack and frame pointers and falling through lets
/// it return normally. a fresh task (the child half of a fork) instead needs
/// a jump to its saved instruction pointer, since nothing below it on the
/// copied stack has run yet in this address space
///
/// # Safety
///
/// `ctx` must be a snapshot taken on a live kernel stack of this kernel, and
/// `dir_phys` must map it
#[inline(always)]
pub unsafe fn restore_context(ctx: &Context, dir_phys: PhysicalAddress, fresh: bool) {
    if fresh {
        asm!(
            "mov esp, {esp}",
            "mov ebp, {ebp}",
            "mov cr3, {dir}",
            "jmp ecx",
            in("ecx") ctx.eip,
            esp = in(reg) ctx.esp,
            ebp = in(reg) ctx.ebp,
            dir = in(reg) dir_phys,
            options(noreturn),
        );
    } else {
        asm!(
            "mov esp, {esp}",
            "mov ebp, {ebp}",
            "mov cr3, {dir}",
            esp = in(reg) ctx.esp,
            ebp = in(reg) ctx.ebp,
            dir = in(reg) dir_phys,
        );
    }
}

/// moves execution onto the reserved cleanup stack so a dying task can free
/// the stack it was just running on. the token frame at the top keeps the
/// frame pointer sane for anything that looks at it
///
/// # Safety
///
/// `stack_top` must be the top of a committed stack that nothing else is
/// using; the current stack's contents are unreachable afterwards
#[inline(always)]
pub unsafe fn enter_cleanup_stack(stack_top: usize) {
    asm!(
        "mov esp, {esp}",
        "mov ebp, {ebp}",
        esp = in(reg) stack_top - 64,
        ebp = in(reg) stack_top - WORD_SIZE,
    );
}

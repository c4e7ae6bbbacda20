//! task records and lifecycle
//!
//! a task is the kernel-side object for one user process: its address
//! space, its user heap, its kernel-mode stack, the saved context that
//! resumes it, and the lists of resources it owns

pub mod sched;
pub mod stack;

use crate::arch::{Context, PAGE_SIZE};
use crate::mm::{Heap, PageDir};
use crate::ipc::{PipeId, SemId};
use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::vec::Vec;
use core::ptr::NonNull;
use self::sched::PRIORITY_NORMAL;

pub type Pid = u32;

/// bytes of kernel-mode stack per task
pub const KERNEL_STACK_SIZE: usize = 0x10000;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// created by fork but never scheduled; resuming one means jumping into
    /// its copied stack rather than returning through it
    New,
    Ready,
    Running,
    Waiting,
    Terminating,
}

/// a registered interior pointer into the current trap frame, recorded so
/// fork's stack copy can rewrite it in the child
#[derive(Debug, Copy, Clone)]
pub struct PointerFixup {
    /// where on the kernel stack the pointer itself lives
    pub location: usize,

    /// what it points at
    pub target: usize,
}

/// a task's kernel-mode stack, page aligned and fixed size
pub struct KernelStack {
    base: NonNull<u8>,
}

impl KernelStack {
    pub fn new() -> Self {
        let ptr = unsafe { alloc_zeroed(Self::layout()) };
        Self {
            base: NonNull::new(ptr).expect("kernel heap exhausted"),
        }
    }

    fn layout() -> Layout {
        Layout::from_size_align(KERNEL_STACK_SIZE, PAGE_SIZE).unwrap()
    }

    /// lowest address of the stack block
    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// the address the stack grows down from
    pub fn top(&self) -> usize {
        self.base() + KERNEL_STACK_SIZE
    }
}

impl Default for KernelStack {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.base.as_ptr(), Self::layout());
        }
    }
}

pub struct Task {
    pub id: Pid,

    /// effective priority, 1 highest through 10 lowest (11 is the idle
    /// task's); aging lowers this number until the task gets picked
    pub priority: u32,

    /// what `priority` resets to whenever the task is picked
    pub initial_priority: u32,

    /// scheduler passes spent in the ready queue since the last aging step
    pub time_slice_count: u32,

    /// timer ticks left to sleep
    pub sleep_ticks: u32,

    /// saved instruction/stack/frame pointers
    pub context: Context,

    /// this task's page directory
    pub dir: PageDir,

    pub kernel_stack: KernelStack,

    /// the user heap; `None` only during construction
    pub heap: Option<Heap>,

    pub state: TaskState,

    /// interior pointers registered for the current trap frame
    pub pointers: Vec<PointerFixup>,

    /// pids blocked in join on this task
    pub joiners: Vec<Pid>,

    /// semaphore ids this task holds a reference to
    pub semaphores: Vec<SemId>,

    /// pipe ids this task holds a reference to
    pub pipes: Vec<PipeId>,
}

impl Task {
    /// a fresh task record over the given address space
    pub fn new(id: Pid, dir: PageDir) -> Self {
        Self {
            id,
            priority: PRIORITY_NORMAL,
            initial_priority: PRIORITY_NORMAL,
            time_slice_count: 0,
            sleep_ticks: 0,
            context: Context::default(),
            dir,
            kernel_stack: KernelStack::new(),
            heap: None,
            state: TaskState::New,
            pointers: Vec::new(),
            joiners: Vec::new(),
            semaphores: Vec::new(),
            pipes: Vec::new(),
        }
    }
}

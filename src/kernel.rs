//! the kernel singleton
//!
//! every piece of process-wide state lives in one [Kernel] value: the frame
//! set, the kernel directory, the task table and its queues, the IPC tables,
//! and the id generators. it is built once by [Kernel::bootstrap] and
//! installed into a global for the trap handlers; nothing ever tears it
//! down. tests build their own `Kernel` values directly and skip the global

use crate::arch::{self, Context, Registers, PAGE_SIZE, WORD_SIZE};
use crate::console::{self, Console};
use crate::ipc::{Pipe, Semaphore};
use crate::mm::{
    kheap,
    paging::{clone_directory, destroy_directory, Mmu as _},
    AddressSpace, FrameSet, Heap, MemoryLayout, PageDir,
};
use crate::syscall;
use crate::task::{
    sched::{IDLE_PRIORITY, TICKS_PER_SECOND},
    stack, KernelStack, Pid, PointerFixup, Task, TaskState, KERNEL_STACK_SIZE,
};
use alloc::{boxed::Box, collections::VecDeque, vec::Vec};
use core::fmt;
use log::debug;

/// what the outside world (bootstrap assembly, descriptor tables, display
/// driver) provides to the core
pub struct Platform {
    /// installs a handler on an interrupt vector
    pub install_trap: fn(u8, unsafe fn(&mut Registers)),

    /// points the CPU's privilege-switch stack (TSS esp0) at a task's
    /// kernel stack top
    pub set_kernel_stack: fn(usize),

    /// where the write/paint syscalls go
    pub console: &'static dyn Console,
}

/// kernel-internal failures that surface to user code as the sentinel
/// values in the syscall table
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum KernelError {
    InvalidArgument,
    NotOwner,
    NoSuchSemaphore,
    NoSuchPipe,
    NoSuchTask,
    PipeFull,
    /// a blocked wait was abandoned because the semaphore was closed
    Cancelled,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", match self {
            Self::InvalidArgument => "invalid argument",
            Self::NotOwner => "caller does not own this resource",
            Self::NoSuchSemaphore => "no such semaphore",
            Self::NoSuchPipe => "no such pipe",
            Self::NoSuchTask => "no such task",
            Self::PipeFull => "pipe has no room for this write",
            Self::Cancelled => "wait cancelled by close",
        })
    }
}

pub struct Kernel {
    pub(crate) frames: FrameSet,

    /// boxed so its address stays put for the MMU driver's translation root
    pub(crate) kernel_dir: Box<PageDir>,

    pub(crate) mmu: arch::Mmu,

    pub(crate) tasks: Vec<Task>,
    pub(crate) ready_queue: VecDeque<Pid>,
    pub(crate) sleep_queue: Vec<Pid>,

    pub(crate) semaphores: Vec<Semaphore>,
    pub(crate) pipes: Vec<Pipe>,

    pub(crate) next_pid: Pid,
    pub(crate) next_sem_id: u32,
    pub(crate) next_pipe_id: u32,

    pub(crate) current: Pid,
    pub(crate) idle_pid: Pid,

    /// always-committed stack for teardown, when a dying task can no longer
    /// stand on its own
    pub(crate) cleanup_stack: KernelStack,

    pub(crate) user_heap_window: crate::mm::HeapWindow,

    pub(crate) set_kernel_stack: fn(usize),
}

static mut KERNEL: Option<Kernel> = None;

/// the installed kernel singleton
///
/// # Safety
///
/// only call from trap context on the single CPU; the returned borrow is
/// exclusive by convention, not by the type system
pub unsafe fn kernel() -> &'static mut Kernel {
    KERNEL.as_mut().expect("kernel not initialized")
}

/// moves the bootstrapped kernel into the global slot
///
/// # Safety
///
/// call once, before the first trap can fire
pub unsafe fn install(k: Kernel) {
    if KERNEL.is_some() {
        panic!("can't install the kernel twice");
    }
    KERNEL = Some(k);
}

impl Kernel {
    /// builds the kernel: frame set, kernel directory (identity mapping and
    /// kernel heap window), the MMU attachments, the idle task with its
    /// address space and user heap, and the trap gate
    pub fn bootstrap(platform: Platform, layout: MemoryLayout) -> Self {
        let mut mmu = arch::Mmu::new();
        let mut frames = FrameSet::new(layout.physical_memory);
        let mut kernel_dir = Box::new(PageDir::new(&mut mmu));

        if let Some(window) = layout.kernel_heap {
            // page tables for the whole kernel heap window have to exist
            // before the first fork, so that every directory links the same
            // tables and later kernel mappings show up everywhere at once
            let mut addr = window.start;
            while addr < window.max {
                let _ = kernel_dir.get_page(addr, true, &mut mmu);
                addr += PAGE_SIZE;
            }

            // the boot image is identity mapped, readable from user space
            // but not writable
            let mut addr = 0;
            while addr < layout.identity_map_end {
                let page = kernel_dir.get_page(addr, true, &mut mmu).unwrap();
                frames.alloc(page, false, false);
                addr += PAGE_SIZE;
            }

            // frames under the committed part of the kernel heap
            let mut addr = window.start;
            while addr < window.initial_end {
                let page = kernel_dir.get_page(addr, true, &mut mmu).unwrap();
                frames.alloc(page, true, true);
                addr += PAGE_SIZE;
            }

            // the window the platform parks its boot stack in
            let mut addr = crate::mm::KSTACK_START - crate::mm::KSTACK_SIZE;
            while addr <= crate::mm::KSTACK_START {
                let page = kernel_dir.get_page(addr, true, &mut mmu).unwrap();
                frames.alloc(page, false, true);
                addr += PAGE_SIZE;
            }
        }

        mmu.attach_kernel_dir(&mut kernel_dir);
        unsafe {
            mmu.activate(kernel_dir.physical_addr);
        }

        // the idle task: links every kernel slot, owns nothing yet
        let idle_dir = clone_directory(&kernel_dir, &kernel_dir, &mut frames, &mut mmu);

        let mut kernel = Self {
            frames,
            kernel_dir,
            mmu,
            tasks: Vec::new(),
            ready_queue: VecDeque::new(),
            sleep_queue: Vec::new(),
            semaphores: Vec::new(),
            pipes: Vec::new(),
            next_pid: 1,
            next_sem_id: 1,
            next_pipe_id: 1,
            current: 0,
            idle_pid: 0,
            cleanup_stack: KernelStack::new(),
            user_heap_window: layout.user_heap,
            set_kernel_stack: platform.set_kernel_stack,
        };

        let idle_pid = kernel.spawn(idle_dir);
        kernel.idle_pid = idle_pid;
        kernel.current = idle_pid;
        {
            let task = kernel.task_mut(idle_pid).unwrap();
            task.priority = IDLE_PRIORITY;
            task.initial_priority = IDLE_PRIORITY;
            task.state = TaskState::Ready;
        }
        kernel.create_heap(idle_pid);

        let (dir_phys, stack_top) = {
            let task = kernel.task(idle_pid).unwrap();
            (task.dir.physical_addr, task.kernel_stack.top())
        };
        unsafe {
            kernel.mmu.activate(dir_phys);
        }
        (kernel.set_kernel_stack)(stack_top);

        console::set_console(platform.console);
        (platform.install_trap)(syscall::SYSCALL_VECTOR, syscall::trap_entry);

        kernel
    }

    /// allocates a task record with a fresh pid over `dir` and enters it in
    /// the task table
    pub(crate) fn spawn(&mut self, dir: PageDir) -> Pid {
        let id = self.next_pid;
        self.next_pid += 1;

        self.tasks.push(Task::new(id, dir));
        id
    }

    /// commits the user heap window in `pid`'s address space (plus the
    /// first index frame) and lays the heap out over it
    fn create_heap(&mut self, pid: Pid) {
        let window = self.user_heap_window;
        let Self { tasks, frames, mmu, .. } = self;
        let task = tasks.iter_mut().find(|task| task.id == pid).expect("no such task");
        let Task { dir, heap, .. } = task;

        let mut space = AddressSpace { dir, frames, mmu };
        space.commit(window.start, window.initial_end, false, true);

        // one frame under the index; it commits more itself as it grows
        let index_page = (window.max - WORD_SIZE) & !(PAGE_SIZE - 1);
        space.commit(index_page, index_page + PAGE_SIZE, false, true);

        *heap = Some(unsafe { Heap::new(window.start, window.initial_end, window.max, false, false, &mut space) });
    }

    pub(crate) fn task(&self, pid: Pid) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == pid)
    }

    pub(crate) fn task_mut(&mut self, pid: Pid) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|task| task.id == pid)
    }

    pub(crate) fn current_task(&self) -> &Task {
        self.task(self.current).expect("no current task")
    }

    pub(crate) fn current_task_mut(&mut self) -> &mut Task {
        let current = self.current;
        self.task_mut(current).expect("no current task")
    }

    /// distinct mutable borrows of two tasks
    fn task_pair_mut(&mut self, a: Pid, b: Pid) -> (&mut Task, &mut Task) {
        let ia = self.tasks.iter().position(|task| task.id == a).expect("no such task");
        let ib = self.tasks.iter().position(|task| task.id == b).expect("no such task");
        assert_ne!(ia, ib);

        if ia < ib {
            let (left, right) = self.tasks.split_at_mut(ib);
            (&mut left[ia], &mut right[0])
        } else {
            let (left, right) = self.tasks.split_at_mut(ia);
            (&mut right[0], &mut left[ib])
        }
    }

    pub fn current_pid(&self) -> Pid {
        self.current
    }

    pub fn idle_pid(&self) -> Pid {
        self.idle_pid
    }

    pub fn free_frames(&self) -> usize {
        self.frames.count_free()
    }

    pub fn used_frames(&self) -> usize {
        self.frames.count_used()
    }

    /// effective priority of `pid`, if it is alive
    pub fn priority_of(&self, pid: Pid) -> Option<u32> {
        self.task(pid).map(|task| task.priority)
    }

    /// state of `pid`, if it is alive
    pub fn state_of(&self, pid: Pid) -> Option<TaskState> {
        self.task(pid).map(|task| task.state)
    }

    /// records an interior pointer into the current trap frame so a fork in
    /// this trap can rewrite it in the child's stack image
    pub(crate) fn register_stack_pointer(&mut self, location: usize, target: usize) {
        self.current_task_mut().pointers.push(PointerFixup { location, target });
    }

    pub(crate) fn clear_stack_pointers(&mut self) {
        self.current_task_mut().pointers.clear();
    }

    pub fn getpid(&self) -> Pid {
        self.current
    }

    /// gives up the CPU voluntarily
    pub fn yield_now(&mut self) {
        self.schedule(true, true, false);
    }

    /// allocates from the current task's user heap
    pub fn alloc(&mut self, size: usize, page_aligned: bool) -> usize {
        let current = self.current;
        let Self { tasks, frames, mmu, .. } = self;
        let task = tasks.iter_mut().find(|task| task.id == current).expect("no current task");
        let Task { dir, heap, .. } = task;

        let mut space = AddressSpace { dir, frames, mmu };
        heap.as_mut().expect("current task has no heap").alloc(size, page_aligned, &mut space)
    }

    /// returns a block to the current task's user heap
    pub fn free(&mut self, address: usize) {
        let current = self.current;
        let Self { tasks, frames, mmu, .. } = self;
        let task = tasks.iter_mut().find(|task| task.id == current).expect("no current task");
        let Task { dir, heap, .. } = task;

        let mut space = AddressSpace { dir, frames, mmu };
        heap.as_mut().expect("current task has no heap").free(address, &mut space);
    }

    /// duplicates the calling task: address space (kernel mappings linked,
    /// user pages deep-copied), kernel stack image with pointer fix-ups,
    /// heap metadata, priority, and IPC references. returns the child's pid
    /// to the parent and 0 to the child
    pub fn fork(&mut self) -> Pid {
        let parent_pid = self.current;

        debug!(
            "[fork pid {}] {} free frames, {} kernel heap bytes free",
            parent_pid,
            self.frames.count_free(),
            kheap::free_space()
        );

        let child_dir = {
            let Self { tasks, frames, mmu, kernel_dir, .. } = self;
            let parent = tasks.iter().find(|task| task.id == parent_pid).expect("no current task");
            clone_directory(&parent.dir, kernel_dir, frames, mmu)
        };

        let child_pid = self.spawn(child_dir);
        self.ready_queue.push_back(child_pid);

        // both halves pass through this point: the parent right now, the
        // child when it is first scheduled and jumps back in here
        let snapshot = arch::capture_context();

        if self.current != parent_pid {
            // child half; the bookkeeping below already happened
            return 0;
        }

        if let Some(snap) = snapshot {
            let (parent, child) = self.task_pair_mut(parent_pid, child_pid);

            let offset_esp = snap.esp.wrapping_sub(parent.kernel_stack.base());
            let offset_ebp = snap.ebp.wrapping_sub(parent.kernel_stack.base());
            assert!(offset_esp < KERNEL_STACK_SIZE && offset_ebp < KERNEL_STACK_SIZE);

            child.context = Context {
                eip: snap.eip,
                esp: child.kernel_stack.base() + offset_esp,
                ebp: child.kernel_stack.base() + offset_ebp,
            };

            unsafe {
                stack::copy_stack(
                    child.kernel_stack.base(),
                    parent.kernel_stack.base(),
                    KERNEL_STACK_SIZE,
                    snap.ebp,
                    &parent.pointers,
                );
            }
        }

        {
            let idle_pid = self.idle_pid;
            let (parent, child) = self.task_pair_mut(parent_pid, child_pid);

            // the child inherits the parent's priorities, except that
            // children of the idle task start from the defaults
            if parent.id != idle_pid {
                child.priority = parent.priority;
                child.initial_priority = parent.initial_priority;
            }

            // heap metadata only; the blocks themselves came along with the
            // address space copy, at the same virtual addresses
            child.heap = parent.heap.clone();
        }

        // inherited IPC references
        let sem_ids = self.task(parent_pid).unwrap().semaphores.clone();
        for id in sem_ids {
            if let Some(sem) = self.semaphore_mut(id) {
                sem.refcount += 1;
                self.task_mut(child_pid).unwrap().semaphores.push(id);
            }
        }
        let pipe_ids = self.task(parent_pid).unwrap().pipes.clone();
        for id in pipe_ids {
            if let Some(pipe) = self.pipe_mut(id) {
                pipe.refcount += 1;
                self.task_mut(child_pid).unwrap().pipes.push(id);
            }
        }

        child_pid
    }

    /// tears the calling task down and schedules away forever. on hardware
    /// this never returns
    pub fn exit(&mut self) {
        let pid = self.current;
        let position = self.tasks.iter().position(|task| task.id == pid).expect("no current task");
        self.tasks[position].state = TaskState::Terminating;

        // the caller is running, so it can be in neither queue
        debug_assert!(!self.ready_queue.contains(&pid));
        debug_assert!(!self.sleep_queue.contains(&pid));

        let task = self.tasks.swap_remove(position);

        // everything below runs on the reserved cleanup stack in the kernel
        // address space: the task's own kernel stack and directory are about
        // to be freed out from under it
        unsafe {
            arch::enter_cleanup_stack(self.cleanup_stack.top());
            self.mmu.activate(self.kernel_dir.physical_addr);
        }

        let Task {
            dir,
            heap,
            kernel_stack,
            pointers,
            joiners,
            semaphores,
            pipes,
            ..
        } = task;

        drop(heap); // heap and index records
        destroy_directory(dir, &mut self.frames);

        for id in semaphores {
            self.drop_sem_reference(id);
        }
        for id in pipes {
            self.drop_pipe_reference(id);
        }

        for joiner in joiners {
            if let Some(task) = self.task_mut(joiner) {
                task.state = TaskState::Ready;
                self.ready_queue.push_back(joiner);
            }
        }

        drop(kernel_stack);
        drop(pointers);

        debug!(
            "[exit pid {}] {} free frames, {} kernel heap bytes free",
            pid,
            self.frames.count_free(),
            kheap::free_space()
        );

        self.schedule(false, false, false);
    }

    /// parks the caller until `pid` exits. unknown pids are an error
    pub fn join(&mut self, pid: Pid) -> Result<(), KernelError> {
        let me = self.current;
        let task = self.task_mut(pid).ok_or(KernelError::NoSuchTask)?;
        task.joiners.push(me);

        self.schedule(false, true, false);
        Ok(())
    }

    /// parks the caller for `seconds`. returns 0 on a normal wake, or the
    /// whole seconds remaining when the sleep was cut short
    pub fn sleep(&mut self, seconds: u32) -> u32 {
        let pid = self.current;
        self.current_task_mut().sleep_ticks = TICKS_PER_SECOND * seconds;
        self.sleep_queue.push(pid);

        self.schedule(false, true, false);

        let remaining = self.task(pid).map(|task| task.sleep_ticks).unwrap_or(0);
        if remaining == 0 {
            0
        } else {
            remaining / TICKS_PER_SECOND + 1
        }
    }

    /// sets the caller's priority (1 highest .. 10 lowest), returning the
    /// new value. querying another task returns its current priority
    /// unchanged; unknown pids and out-of-range priorities return 0
    pub fn set_priority(&mut self, pid: Pid, new_priority: i32) -> u32 {
        let current = self.current;
        let Some(task) = self.task_mut(pid) else {
            return 0;
        };

        if task.id != current {
            // other tasks' priorities can be read but not changed
            return task.priority;
        }

        if !(1..=10).contains(&new_priority) {
            return 0;
        }

        task.priority = new_priority as u32;
        task.initial_priority = task.priority;
        task.time_slice_count = 0;
        new_priority as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_kernel, PageBuf};

    #[test]
    fn bootstrap_leaves_the_idle_task_current() {
        let buf = PageBuf::new(64);
        let k = test_kernel(&buf);

        assert_eq!(k.current_pid(), k.idle_pid());
        assert_eq!(k.priority_of(k.idle_pid()), Some(IDLE_PRIORITY));
        assert!(k.task(k.idle_pid()).unwrap().heap.is_some());
    }

    #[test]
    fn fork_duplicates_metadata_into_a_private_address_space() {
        let buf = PageBuf::new(64);
        let mut k = test_kernel(&buf);

        let child = k.fork();
        assert!(child > k.idle_pid());
        assert!(k.ready_queue.contains(&child));
        assert_eq!(k.state_of(child), Some(TaskState::New));

        let parent_task = k.task(k.idle_pid()).unwrap();
        let child_task = k.task(child).unwrap();

        // separate directories, same heap geometry
        assert_ne!(parent_task.dir.physical_addr, child_task.dir.physical_addr);
        let parent_heap = parent_task.heap.as_ref().unwrap();
        let child_heap = child_task.heap.as_ref().unwrap();
        assert_eq!(parent_heap.start_address, child_heap.start_address);
        assert_eq!(parent_heap.end_address, child_heap.end_address);
        assert_eq!(parent_heap.max_address, child_heap.max_address);
        assert_eq!(parent_heap.index.len, child_heap.index.len);
        assert_eq!(parent_heap.index.watermark, child_heap.index.watermark);
    }

    #[test]
    fn fork_inherits_priority_except_from_the_idle_task() {
        let buf = PageBuf::new(64);
        let mut k = test_kernel(&buf);

        // children of the idle task start from the defaults
        let child = k.fork();
        assert_eq!(k.priority_of(child), Some(crate::task::sched::PRIORITY_NORMAL));

        k.yield_now();
        assert_eq!(k.current_pid(), child);
        assert_eq!(k.set_priority(child, 7), 7);

        let grandchild = k.fork();
        assert_eq!(k.priority_of(grandchild), Some(7));

        // another task's priority can be read but not changed
        assert_eq!(k.set_priority(grandchild, 3), 7);
        assert_eq!(k.priority_of(grandchild), Some(7));

        // out-of-range requests on yourself are refused
        assert_eq!(k.set_priority(child, 0), 0);
        assert_eq!(k.set_priority(child, 11), 0);
        assert_eq!(k.set_priority(999, 5), 0);
    }

    #[test]
    fn exit_releases_every_frame_the_fork_took() {
        let buf = PageBuf::new(64);
        let mut k = test_kernel(&buf);

        let before = k.used_frames();
        let child = k.fork();
        assert!(k.used_frames() > before, "fork committed no frames");

        k.yield_now();
        assert_eq!(k.current_pid(), child);
        k.exit();

        assert!(k.task(child).is_none());
        assert_eq!(k.used_frames(), before);
        assert_eq!(k.current_pid(), k.idle_pid());
    }

    #[test]
    fn join_parks_the_caller_until_the_target_exits() {
        let buf = PageBuf::new(64);
        let mut k = test_kernel(&buf);
        let idle = k.idle_pid();

        assert_eq!(k.join(999), Err(KernelError::NoSuchTask));

        let child = k.fork();
        k.join(child).unwrap();
        assert_eq!(k.current_pid(), child);
        assert_eq!(k.state_of(idle), Some(TaskState::Waiting));

        k.exit();
        assert_eq!(k.current_pid(), idle);
        assert_eq!(k.state_of(idle), Some(TaskState::Running));
    }

    #[test]
    fn alloc_hands_out_user_window_memory() {
        let buf = PageBuf::new(64);
        let mut k = test_kernel(&buf);

        let a = k.alloc(100, false);
        assert!(a >= buf.start() && a < buf.end());
        unsafe {
            core::ptr::write_bytes(a as *mut u8, 1, 100);
        }

        k.free(a);
        let b = k.alloc(50, false);
        assert_eq!(a, b, "freed space was not reused");

        // freeing null is a no-op
        k.free(0);
    }

    #[test]
    fn register_and_clear_stack_pointers() {
        let buf = PageBuf::new(64);
        let mut k = test_kernel(&buf);

        k.register_stack_pointer(0x1000, 0x2000);
        assert_eq!(k.current_task().pointers.len(), 1);
        assert_eq!(k.current_task().pointers[0].location, 0x1000);
        assert_eq!(k.current_task().pointers[0].target, 0x2000);

        k.clear_stack_pointers();
        assert!(k.current_task().pointers.is_empty());
    }
}

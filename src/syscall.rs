//! the system call interface
//!
//! one trap gate, one fixed table. the call number rides in eax and up to
//! five arguments in ebx/ecx/edx/esi/edi; the result goes back in eax.
//! numbers outside the table fall through as no-ops

use crate::arch::Registers;
use crate::console;
use crate::kernel::{self, Kernel, KernelError};
use core::ffi::CStr;
use log::debug;
use num_enum::TryFromPrimitive;

/// the trap vector the platform installs [trap_entry] on
pub const SYSCALL_VECTOR: u8 = 0x80;

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum Syscall {
    WriteString,
    WriteHex,
    WriteDec,
    Fork,
    GetPid,
    Yield,
    Exit,
    Alloc,
    Free,
    Sleep,
    SetPriority,
    SemOpen,
    SemWait,
    SemSignal,
    SemClose,
    PipeOpen,
    PipeWrite,
    PipeRead,
    PipeClose,
    Join,
    MonitorColour,
}

/// function prototype for individual syscall handlers
type SyscallHandler = fn(&mut Kernel, &mut Registers) -> usize;

/// amount of syscalls we have
pub const NUM_SYSCALLS: usize = 21;

/// handlers indexed by call number
static SYSCALL_TABLE: [SyscallHandler; NUM_SYSCALLS] = [
    write_string_handler,
    write_hex_handler,
    write_dec_handler,
    fork_handler,
    getpid_handler,
    yield_handler,
    exit_handler,
    alloc_handler,
    free_handler,
    sleep_handler,
    set_priority_handler,
    sem_open_handler,
    sem_wait_handler,
    sem_signal_handler,
    sem_close_handler,
    pipe_open_handler,
    pipe_write_handler,
    pipe_read_handler,
    pipe_close_handler,
    join_handler,
    monitor_colour_handler,
];

/// the handler the platform installs on vector 0x80
///
/// # Safety
///
/// call from the trap stub only, with `regs` pointing at the frame it
/// pushed on the current kernel stack
pub unsafe fn trap_entry(regs: &mut Registers) {
    dispatch(kernel::kernel(), regs);
}

/// validates the call number and runs the handler
pub fn dispatch(kernel: &mut Kernel, regs: &mut Registers) {
    let number = match Syscall::try_from(regs.eax as u32) {
        Ok(number) => number,
        Err(_) => {
            debug!("bad syscall {}", regs.eax);
            return;
        }
    };

    if number == Syscall::Fork {
        // fork's stack copy has to rewrite the trap frame pointer sitting in
        // this very frame, so the child returns through its own copy
        let location = core::ptr::addr_of!(regs) as usize;
        let target = regs as *const Registers as usize;
        kernel.register_stack_pointer(location, target);
    }

    let ret = SYSCALL_TABLE[number as usize](kernel, regs);
    regs.eax = ret;

    kernel.clear_stack_pointers();
}

/// ebx: pointer to a NUL-terminated string in the caller's address space
fn write_string_handler(_kernel: &mut Kernel, regs: &mut Registers) -> usize {
    if regs.ebx == 0 {
        return 0;
    }

    let bytes = unsafe { CStr::from_ptr(regs.ebx as *const _) }.to_bytes();
    console::write(&alloc::string::String::from_utf8_lossy(bytes));
    0
}

/// ebx: value to print in base 16
fn write_hex_handler(_kernel: &mut Kernel, regs: &mut Registers) -> usize {
    console::write_hex(regs.ebx);
    0
}

/// ebx: value to print in base 10
fn write_dec_handler(_kernel: &mut Kernel, regs: &mut Registers) -> usize {
    console::write_dec(regs.ebx);
    0
}

/// child pid to the parent, 0 to the child
fn fork_handler(kernel: &mut Kernel, _regs: &mut Registers) -> usize {
    kernel.fork() as usize
}

fn getpid_handler(kernel: &mut Kernel, _regs: &mut Registers) -> usize {
    kernel.getpid() as usize
}

fn yield_handler(kernel: &mut Kernel, _regs: &mut Registers) -> usize {
    kernel.yield_now();
    0
}

/// never returns on hardware
fn exit_handler(kernel: &mut Kernel, _regs: &mut Registers) -> usize {
    kernel.exit();
    0
}

/// ebx: size in bytes, ecx: nonzero to page-align. returns the address
fn alloc_handler(kernel: &mut Kernel, regs: &mut Registers) -> usize {
    kernel.alloc(regs.ebx, regs.ecx != 0)
}

/// ebx: address from a previous alloc; freeing null does nothing
fn free_handler(kernel: &mut Kernel, regs: &mut Registers) -> usize {
    kernel.free(regs.ebx);
    0
}

/// ebx: whole seconds. 0 on a normal wake
fn sleep_handler(kernel: &mut Kernel, regs: &mut Registers) -> usize {
    kernel.sleep(regs.ebx as u32) as usize
}

/// ebx: pid, ecx: new priority 1..=10
fn set_priority_handler(kernel: &mut Kernel, regs: &mut Registers) -> usize {
    kernel.set_priority(regs.ebx as u32, regs.ecx as i32) as usize
}

/// ebx: initial counter. id, or 0 on failure
fn sem_open_handler(kernel: &mut Kernel, regs: &mut Registers) -> usize {
    match kernel.sem_open(regs.ebx as i32) {
        Ok(id) => id as usize,
        Err(_) => 0,
    }
}

/// ebx: semaphore id. id on success, 0 on failure or cancellation
fn sem_wait_handler(kernel: &mut Kernel, regs: &mut Registers) -> usize {
    match kernel.sem_wait(regs.ebx as u32) {
        Ok(id) => id as usize,
        Err(_) => 0,
    }
}

/// ebx: semaphore id. id on success, 0 on failure
fn sem_signal_handler(kernel: &mut Kernel, regs: &mut Registers) -> usize {
    match kernel.sem_signal(regs.ebx as u32) {
        Ok(id) => id as usize,
        Err(_) => 0,
    }
}

/// ebx: semaphore id. id on success, 0 on failure (including a second close)
fn sem_close_handler(kernel: &mut Kernel, regs: &mut Registers) -> usize {
    match kernel.sem_close(regs.ebx as u32) {
        Ok(id) => id as usize,
        Err(_) => 0,
    }
}

fn pipe_open_handler(kernel: &mut Kernel, _regs: &mut Registers) -> usize {
    kernel.pipe_open() as usize
}

/// ebx: pipe id, ecx: buffer, edx: length. bytes written, 0 when the write
/// doesn't fit whole, -1 for a bad pipe
fn pipe_write_handler(kernel: &mut Kernel, regs: &mut Registers) -> usize {
    let buf: &[u8] = if regs.edx == 0 {
        &[]
    } else {
        unsafe { core::slice::from_raw_parts(regs.ecx as *const u8, regs.edx) }
    };

    match kernel.pipe_write(regs.ebx as u32, buf) {
        Ok(n) => n,
        Err(KernelError::PipeFull) => 0,
        Err(_) => usize::MAX,
    }
}

/// ebx: pipe id, ecx: buffer, edx: length. bytes read (0 from an empty
/// pipe), -1 for a bad pipe
fn pipe_read_handler(kernel: &mut Kernel, regs: &mut Registers) -> usize {
    let buf: &mut [u8] = if regs.edx == 0 {
        &mut []
    } else {
        unsafe { core::slice::from_raw_parts_mut(regs.ecx as *mut u8, regs.edx) }
    };

    match kernel.pipe_read(regs.ebx as u32, buf) {
        Ok(n) => n,
        Err(_) => usize::MAX,
    }
}

/// ebx: pipe id. id, or -1 for a pipe the caller doesn't own
fn pipe_close_handler(kernel: &mut Kernel, regs: &mut Registers) -> usize {
    match kernel.pipe_close(regs.ebx as u32) {
        Ok(id) => id as usize,
        Err(_) => usize::MAX,
    }
}

/// ebx: pid to wait for. 0 once it has exited, -1 for an unknown pid
fn join_handler(kernel: &mut Kernel, regs: &mut Registers) -> usize {
    match kernel.join(regs.ebx as u32) {
        Ok(()) => 0,
        Err(_) => usize::MAX,
    }
}

/// ebx: column, ecx: row, edx: colour attribute
fn monitor_colour_handler(_kernel: &mut Kernel, regs: &mut Registers) -> usize {
    console::paint(regs.ebx, regs.ecx, regs.edx as u8);
    0
}

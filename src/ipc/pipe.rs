//! byte pipes
//!
//! fixed-capacity ring buffers. writes are all-or-nothing: a write that
//! doesn't fit writes nothing and reports 0. reads drain whatever is there.
//! pipes never block- callers who want backpressure build it out of
//! semaphores

use crate::kernel::{Kernel, KernelError};
use alloc::{boxed::Box, vec};
use log::debug;

pub type PipeId = u32;

/// bytes a pipe can hold
pub const PIPE_BUFFER_SIZE: usize = 65536;

pub struct Pipe {
    pub id: PipeId,

    buffer: Box<[u8]>,

    /// next byte written goes here
    head: usize,

    /// next byte read comes from here
    tail: usize,

    /// bytes currently stored, always within `0..=PIPE_BUFFER_SIZE`
    count: usize,

    /// live references: the opener plus every fork that inherited the id
    pub refcount: u32,
}

impl Pipe {
    pub fn bytes_stored(&self) -> usize {
        self.count
    }
}

impl Kernel {
    pub(crate) fn pipe(&self, id: PipeId) -> Option<&Pipe> {
        self.pipes.iter().find(|pipe| pipe.id == id)
    }

    pub(crate) fn pipe_mut(&mut self, id: PipeId) -> Option<&mut Pipe> {
        self.pipes.iter_mut().find(|pipe| pipe.id == id)
    }

    fn current_owns_pipe(&self, id: PipeId) -> bool {
        self.current_task().pipes.contains(&id)
    }

    /// creates an empty pipe and registers it with the caller
    pub fn pipe_open(&mut self) -> PipeId {
        let id = self.next_pipe_id;
        self.next_pipe_id += 1;

        self.pipes.push(Pipe {
            id,
            buffer: vec![0; PIPE_BUFFER_SIZE].into_boxed_slice(),
            head: 0,
            tail: 0,
            count: 0,
            refcount: 1,
        });
        self.current_task_mut().pipes.push(id);

        id
    }

    /// writes all of `buf` into the pipe, or nothing at all when it doesn't
    /// fit ([KernelError::PipeFull])
    pub fn pipe_write(&mut self, id: PipeId, buf: &[u8]) -> Result<usize, KernelError> {
        if !self.current_owns_pipe(id) {
            return Err(KernelError::NotOwner);
        }
        let pipe = self.pipe_mut(id).ok_or(KernelError::NoSuchPipe)?;

        if PIPE_BUFFER_SIZE - pipe.count < buf.len() {
            return Err(KernelError::PipeFull);
        }

        for &byte in buf {
            pipe.buffer[pipe.head] = byte;
            pipe.head = (pipe.head + 1) % PIPE_BUFFER_SIZE;
        }
        pipe.count += buf.len();

        Ok(buf.len())
    }

    /// reads up to `buf.len()` bytes, returning how many were there to take
    /// (0 from an empty pipe)
    pub fn pipe_read(&mut self, id: PipeId, buf: &mut [u8]) -> Result<usize, KernelError> {
        if !self.current_owns_pipe(id) {
            return Err(KernelError::NotOwner);
        }
        let pipe = self.pipe_mut(id).ok_or(KernelError::NoSuchPipe)?;

        let n = buf.len().min(pipe.count);
        for byte in buf[..n].iter_mut() {
            *byte = pipe.buffer[pipe.tail];
            pipe.tail = (pipe.tail + 1) % PIPE_BUFFER_SIZE;
        }
        pipe.count -= n;

        Ok(n)
    }

    /// destroys the pipe outright. closing twice is an error, not a panic
    pub fn pipe_close(&mut self, id: PipeId) -> Result<PipeId, KernelError> {
        if !self.current_owns_pipe(id) {
            return Err(KernelError::NotOwner);
        }

        let position = self.pipes.iter().position(|pipe| pipe.id == id).ok_or(KernelError::NoSuchPipe)?;
        self.pipes.remove(position);

        Ok(id)
    }

    /// exit path: the dying task lets go of its reference; the last
    /// reference destroys the pipe
    pub(crate) fn drop_pipe_reference(&mut self, id: PipeId) {
        let Some(pipe) = self.pipe_mut(id) else {
            // already closed explicitly
            return;
        };

        pipe.refcount -= 1;
        if pipe.refcount == 0 {
            debug!("pipe {} dropped with its last reference", id);
            self.pipes.retain(|pipe| pipe.id != id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_kernel, PageBuf};

    #[test]
    fn bytes_come_back_in_write_order() {
        let buf = PageBuf::new(64);
        let mut k = test_kernel(&buf);

        let id = k.pipe_open();
        assert_eq!(k.pipe_write(id, b"hello "), Ok(6));
        assert_eq!(k.pipe_write(id, b"world"), Ok(5));

        let mut out = [0u8; 16];
        assert_eq!(k.pipe_read(id, &mut out), Ok(11));
        assert_eq!(&out[..11], b"hello world");

        // drained; further reads find nothing
        assert_eq!(k.pipe_read(id, &mut out), Ok(0));
    }

    #[test]
    fn writes_are_all_or_nothing() {
        let buf = PageBuf::new(64);
        let mut k = test_kernel(&buf);

        let id = k.pipe_open();
        let chunk = alloc::vec![0xabu8; PIPE_BUFFER_SIZE - 3];
        assert_eq!(k.pipe_write(id, &chunk), Ok(chunk.len()));

        // four more bytes don't fit, so none of them are written
        assert_eq!(k.pipe_write(id, b"1234"), Err(KernelError::PipeFull));
        assert_eq!(k.pipe(id).unwrap().bytes_stored(), PIPE_BUFFER_SIZE - 3);

        // but three exactly fill it to capacity
        assert_eq!(k.pipe_write(id, b"123"), Ok(3));
        assert_eq!(k.pipe(id).unwrap().bytes_stored(), PIPE_BUFFER_SIZE);
    }

    #[test]
    fn reads_wrap_around_the_ring() {
        let buf = PageBuf::new(64);
        let mut k = test_kernel(&buf);

        let id = k.pipe_open();
        let big = alloc::vec![1u8; PIPE_BUFFER_SIZE - 8];
        let mut scratch = alloc::vec![0u8; PIPE_BUFFER_SIZE];

        // push head and tail close to the end of the buffer, then wrap
        assert_eq!(k.pipe_write(id, &big), Ok(big.len()));
        assert_eq!(k.pipe_read(id, &mut scratch), Ok(big.len()));
        assert_eq!(k.pipe_write(id, b"wrap me around!!"), Ok(16));

        let mut out = [0u8; 16];
        assert_eq!(k.pipe_read(id, &mut out), Ok(16));
        assert_eq!(&out, b"wrap me around!!");
    }

    #[test]
    fn foreign_pipes_are_invisible() {
        let buf = PageBuf::new(64);
        let mut k = test_kernel(&buf);

        // the child is created before the open, so it inherits nothing
        let child = k.fork();
        let id = k.pipe_open();
        k.yield_now();
        assert_eq!(k.current_pid(), child);

        let mut out = [0u8; 4];
        assert_eq!(k.pipe_write(id, b"data"), Err(KernelError::NotOwner));
        assert_eq!(k.pipe_read(id, &mut out), Err(KernelError::NotOwner));
        assert_eq!(k.pipe_close(id), Err(KernelError::NotOwner));
    }

    #[test]
    fn close_destroys_and_a_second_close_fails() {
        let buf = PageBuf::new(64);
        let mut k = test_kernel(&buf);

        let id = k.pipe_open();
        assert_eq!(k.pipe_close(id), Ok(id));
        assert_eq!(k.pipe_close(id), Err(KernelError::NoSuchPipe));
    }

    #[test]
    fn fork_bumps_the_refcount_and_exit_drops_it() {
        let buf = PageBuf::new(64);
        let mut k = test_kernel(&buf);

        let id = k.pipe_open();
        let child = k.fork();
        assert_eq!(k.pipe(id).unwrap().refcount, 2);

        k.yield_now();
        assert_eq!(k.current_pid(), child);
        k.exit();
        assert_eq!(k.pipe(id).unwrap().refcount, 1);
    }
}

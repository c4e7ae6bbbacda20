//! counting semaphores

use crate::kernel::{Kernel, KernelError};
use crate::task::{Pid, TaskState};
use alloc::collections::VecDeque;
use log::debug;

pub type SemId = u32;

pub struct Semaphore {
    pub id: SemId,

    /// goes negative while tasks are blocked; `-counter` is then the queue
    /// length
    pub counter: i32,

    /// blocked pids, woken strictly first-in first-out
    pub wait_queue: VecDeque<Pid>,

    /// live references: the opener plus every fork that inherited the id
    pub refcount: u32,
}

impl Kernel {
    pub(crate) fn semaphore(&self, id: SemId) -> Option<&Semaphore> {
        self.semaphores.iter().find(|sem| sem.id == id)
    }

    pub(crate) fn semaphore_mut(&mut self, id: SemId) -> Option<&mut Semaphore> {
        self.semaphores.iter_mut().find(|sem| sem.id == id)
    }

    fn current_owns_sem(&self, id: SemId) -> bool {
        self.current_task().semaphores.contains(&id)
    }

    /// creates a semaphore admitting `n` holders and registers it with the
    /// caller
    pub fn sem_open(&mut self, n: i32) -> Result<SemId, KernelError> {
        if n < 0 {
            return Err(KernelError::InvalidArgument);
        }

        let id = self.next_sem_id;
        self.next_sem_id += 1;

        self.semaphores.push(Semaphore {
            id,
            counter: n,
            wait_queue: VecDeque::new(),
            refcount: 1,
        });
        self.current_task_mut().semaphores.push(id);

        Ok(id)
    }

    /// acquires `id`, blocking the caller when the counter runs out. a
    /// waiter woken because the semaphore was closed gets
    /// [KernelError::Cancelled] instead of the id
    pub fn sem_wait(&mut self, id: SemId) -> Result<SemId, KernelError> {
        if !self.current_owns_sem(id) {
            return Err(KernelError::NotOwner);
        }

        let pid = self.current;
        let sem = self.semaphore_mut(id).ok_or(KernelError::NoSuchSemaphore)?;

        sem.counter -= 1;
        if sem.counter < 0 {
            sem.wait_queue.push_back(pid);
            self.current_task_mut().state = TaskState::Waiting;
            self.schedule(false, true, false);
        }

        self.finish_wait(id)
    }

    /// the check a waiter performs once it runs again: if the semaphore is
    /// gone it was woken by a close, and the wait failed
    pub fn finish_wait(&self, id: SemId) -> Result<SemId, KernelError> {
        if self.semaphore(id).is_some() {
            Ok(id)
        } else {
            Err(KernelError::Cancelled)
        }
    }

    /// releases `id`. if anyone is blocked, the longest waiter becomes ready
    /// and the scheduler runs, so a higher-priority wakee takes the CPU
    /// right away
    pub fn sem_signal(&mut self, id: SemId) -> Result<SemId, KernelError> {
        if !self.current_owns_sem(id) {
            return Err(KernelError::NotOwner);
        }

        let sem = self.semaphore_mut(id).ok_or(KernelError::NoSuchSemaphore)?;
        sem.counter += 1;

        if let Some(pid) = sem.wait_queue.pop_front() {
            let task = self.task_mut(pid).expect("semaphore queue holds a dead pid");
            task.state = TaskState::Ready;
            self.ready_queue.push_back(pid);

            self.schedule(true, true, false);
        }

        Ok(id)
    }

    /// closes `id` outright and wakes every waiter; each of them will find
    /// the semaphore gone and report failure. closing twice is an error, not
    /// a panic
    pub fn sem_close(&mut self, id: SemId) -> Result<SemId, KernelError> {
        if !self.current_owns_sem(id) {
            return Err(KernelError::NotOwner);
        }

        let position = self
            .semaphores
            .iter()
            .position(|sem| sem.id == id)
            .ok_or(KernelError::NoSuchSemaphore)?;
        let mut sem = self.semaphores.remove(position);

        while let Some(pid) = sem.wait_queue.pop_front() {
            let task = self.task_mut(pid).expect("semaphore queue holds a dead pid");
            task.state = TaskState::Ready;
            self.ready_queue.push_back(pid);
        }

        Ok(id)
    }

    /// exit path: the dying task lets go of its reference; the last
    /// reference destroys the semaphore
    pub(crate) fn drop_sem_reference(&mut self, id: SemId) {
        let Some(sem) = self.semaphore_mut(id) else {
            // already closed explicitly
            return;
        };

        sem.refcount -= 1;
        if sem.refcount == 0 {
            debug!("semaphore {} dropped with its last reference", id);
            self.semaphores.retain(|sem| sem.id != id);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::kernel::KernelError;
    use crate::task::TaskState;
    use crate::testutil::{test_kernel, PageBuf};

    #[test]
    fn open_rejects_negative_counters() {
        let buf = PageBuf::new(64);
        let mut k = test_kernel(&buf);

        assert_eq!(k.sem_open(-1), Err(KernelError::InvalidArgument));
        let id = k.sem_open(3).unwrap();
        assert!(id > 0);
        assert_eq!(k.semaphore(id).unwrap().counter, 3);
    }

    #[test]
    fn wait_consumes_the_counter_without_blocking_while_positive() {
        let buf = PageBuf::new(64);
        let mut k = test_kernel(&buf);

        let id = k.sem_open(2).unwrap();
        assert_eq!(k.sem_wait(id), Ok(id));
        assert_eq!(k.sem_wait(id), Ok(id));

        let sem = k.semaphore(id).unwrap();
        assert_eq!(sem.counter, 0);
        assert!(sem.wait_queue.is_empty());
    }

    #[test]
    fn operations_on_foreign_semaphores_fail() {
        let buf = PageBuf::new(64);
        let mut k = test_kernel(&buf);

        // the child is created before the open, so it inherits nothing
        let child = k.fork();
        let id = k.sem_open(1).unwrap();
        k.yield_now();
        assert_eq!(k.current_pid(), child);

        assert_eq!(k.sem_wait(id), Err(KernelError::NotOwner));
        assert_eq!(k.sem_signal(id), Err(KernelError::NotOwner));
        assert_eq!(k.sem_close(id), Err(KernelError::NotOwner));
    }

    #[test]
    fn waiters_wake_in_fifo_order() {
        let buf = PageBuf::new(64);
        let mut k = test_kernel(&buf);
        let idle = k.idle_pid();

        let id = k.sem_open(0).unwrap();
        let first = k.fork();
        let second = k.fork();
        assert_eq!(k.semaphore(id).unwrap().refcount, 3);

        // run the first child into the wait queue
        k.yield_now();
        assert_eq!(k.current_pid(), first);
        let _ = k.sem_wait(id);
        assert_eq!(k.current_pid(), second);
        let _ = k.sem_wait(id);
        assert_eq!(k.current_pid(), idle);

        {
            let sem = k.semaphore(id).unwrap();
            assert_eq!(sem.counter, -2);
            assert_eq!(sem.wait_queue.len(), 2);
            // counter plus queue length never drops below the initial value
            assert_eq!(sem.counter + sem.wait_queue.len() as i32, 0);
        }
        assert_eq!(k.state_of(first), Some(TaskState::Waiting));
        assert_eq!(k.state_of(second), Some(TaskState::Waiting));

        // first in, first woken; the signaler yields to the wakee
        assert_eq!(k.sem_signal(id), Ok(id));
        assert_eq!(k.state_of(first), Some(TaskState::Running));
        assert_eq!(k.current_pid(), first);
        assert_eq!(k.state_of(second), Some(TaskState::Waiting));

        assert_eq!(k.sem_signal(id), Ok(id));
        assert_eq!(k.state_of(second), Some(TaskState::Running));
        assert_eq!(k.current_pid(), second);
    }

    #[test]
    fn close_wakes_every_waiter_with_a_failure() {
        let buf = PageBuf::new(64);
        let mut k = test_kernel(&buf);
        let idle = k.idle_pid();

        let id = k.sem_open(0).unwrap();
        let child = k.fork();

        k.yield_now();
        assert_eq!(k.current_pid(), child);
        let _ = k.sem_wait(id);
        assert_eq!(k.current_pid(), idle);

        assert_eq!(k.sem_close(id), Ok(id));
        assert_eq!(k.state_of(child), Some(TaskState::Ready));

        // what the resumed waiter will find: the semaphore is gone
        assert_eq!(k.finish_wait(id), Err(KernelError::Cancelled));

        // closing a second time is the 0 sentinel, not a panic
        assert_eq!(k.sem_close(id), Err(KernelError::NoSuchSemaphore));
    }

    #[test]
    fn exit_drops_references_and_the_last_one_destroys() {
        let buf = PageBuf::new(64);
        let mut k = test_kernel(&buf);

        let id = k.sem_open(1).unwrap();
        let child = k.fork();
        assert_eq!(k.semaphore(id).unwrap().refcount, 2);

        k.yield_now();
        assert_eq!(k.current_pid(), child);
        k.exit();
        assert_eq!(k.semaphore(id).unwrap().refcount, 1);
    }
}

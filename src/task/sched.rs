//! the scheduler
//!
//! a single ready queue scanned linearly for the numerically smallest
//! priority, first match winning, so tasks of equal priority take turns in
//! FIFO order. every pass ages the whole queue: a task that sits ready for
//! [TIME_SLICE_PER_AGE] passes has its effective priority improved by one
//! step, which keeps low-priority tasks live under load. the idle task is
//! pinned at priority 11 and immune to aging, so there is always something
//! to pick

use super::TaskState;
use crate::arch;
use crate::kernel::Kernel;

/// milliseconds per timer tick
pub const TIME_QUANTUM: u32 = 50;

pub const TICKS_PER_SECOND: u32 = 1000 / TIME_QUANTUM;

/// ready-queue passes a task sits through before its effective priority
/// improves by one
pub const TIME_SLICE_PER_AGE: u32 = 40;

/// numerically smallest, most urgent priority
pub const PRIORITY_MAX: u32 = 1;

/// what fresh tasks start at
pub const PRIORITY_NORMAL: u32 = 5;

/// least urgent priority a task can ask for
pub const PRIORITY_MIN: u32 = 10;

/// reserved for the idle task; never schedulable ahead of real work
pub const IDLE_PRIORITY: u32 = 11;

impl Kernel {
    /// parks the current task and resumes the best ready one
    ///
    /// the three flags describe the caller: `add_to_ready` re-queues the
    /// current task (yield, signal) rather than parking it waiting;
    /// `alive` is false only on the exit path, whose task is already gone
    /// and must not be saved; `timer_tick` marks invocations from the timer
    /// interrupt, which are the ones that advance sleep countdowns
    pub fn schedule(&mut self, add_to_ready: bool, alive: bool, timer_tick: bool) {
        if self.tasks.is_empty() {
            return;
        }

        // the snapshot a parked task resumes from. the resume falls out of
        // this very call, back into whatever invoked the scheduler
        let snapshot = arch::capture_context();

        let current = self.current;
        let current_gone = self.task(current).map(|task| task.state == TaskState::Terminating).unwrap_or(true);

        if alive && !current_gone {
            if let Some(snap) = snapshot {
                self.task_mut(current).unwrap().context = snap;
            }

            // age the queue before the current task joins it
            self.apply_aging();

            let task = self.task_mut(current).unwrap();
            if add_to_ready {
                task.state = TaskState::Ready;
                self.ready_queue.push_back(current);
            } else {
                task.state = TaskState::Waiting;
            }
        }

        // tick the sleepers; anyone reaching zero becomes ready right now
        if timer_tick {
            let Self { sleep_queue, tasks, ready_queue, .. } = self;
            sleep_queue.retain(|&pid| {
                let task = tasks.iter_mut().find(|task| task.id == pid).expect("sleep queue holds a dead pid");

                if task.sleep_ticks > 0 {
                    task.sleep_ticks -= 1;
                }
                if task.sleep_ticks == 0 {
                    task.state = TaskState::Ready;
                    ready_queue.push_back(pid);
                    false
                } else {
                    true
                }
            });
        }

        // smallest number wins; the first of a tie has waited longest
        let mut best = 0;
        for i in 1..self.ready_queue.len() {
            if self.ready_priority(i) < self.ready_priority(best) {
                best = i;
            }
        }
        let next = self.ready_queue.remove(best).expect("ready queue is empty and nothing can run");

        let (context, dir_phys, was_new) = {
            let task = self.task_mut(next).unwrap();
            task.priority = task.initial_priority;
            task.time_slice_count = 0;
            let was_new = task.state == TaskState::New;
            task.state = TaskState::Running;
            (task.context, task.dir.physical_addr, was_new)
        };

        self.current = next;
        (self.set_kernel_stack)(self.task(next).unwrap().kernel_stack.top());

        unsafe {
            arch::restore_context(&context, dir_phys, was_new);
        }
        // a parked task that gets resumed continues by falling out of its
        // own schedule call; fresh tasks never come back here at all
    }

    fn ready_priority(&self, index: usize) -> u32 {
        let pid = self.ready_queue[index];
        self.task(pid).map(|task| task.priority).expect("ready queue holds a dead pid")
    }

    fn apply_aging(&mut self) {
        let Self { ready_queue, tasks, idle_pid, .. } = self;

        for &pid in ready_queue.iter() {
            let task = tasks.iter_mut().find(|task| task.id == pid).expect("ready queue holds a dead pid");
            task.time_slice_count += 1;

            if pid == *idle_pid {
                task.priority = IDLE_PRIORITY;
            } else if task.time_slice_count == TIME_SLICE_PER_AGE {
                task.priority = task.priority.saturating_sub(1).max(PRIORITY_MAX);
                task.time_slice_count = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Pid;
    use crate::testutil::{test_kernel, PageBuf};
    use alloc::collections::BTreeMap;
    use alloc::vec::Vec;

    fn spawn_at(k: &mut crate::kernel::Kernel, priority: u32) -> Pid {
        let pid = k.fork();
        let task = k.task_mut(pid).unwrap();
        task.priority = priority;
        task.initial_priority = priority;
        pid
    }

    #[test]
    fn picks_the_smallest_priority_number() {
        let buf = PageBuf::new(64);
        let mut k = test_kernel(&buf);

        let low = spawn_at(&mut k, 8);
        let high = spawn_at(&mut k, 2);

        k.yield_now();
        assert_eq!(k.current_pid(), high);

        k.yield_now();
        // high got re-queued and still beats everyone
        assert_eq!(k.current_pid(), high);
        assert!(k.state_of(low).unwrap() == crate::task::TaskState::New);
    }

    #[test]
    fn equal_priorities_take_turns_in_fifo_order() {
        let buf = PageBuf::new(64);
        let mut k = test_kernel(&buf);

        let first = spawn_at(&mut k, 5);
        let second = spawn_at(&mut k, 5);

        let mut order = Vec::new();
        for _ in 0..6 {
            k.yield_now();
            order.push(k.current_pid());
        }

        assert_eq!(order, [first, second, first, second, first, second]);
    }

    #[test]
    fn picked_tasks_reset_to_their_initial_priority() {
        let buf = PageBuf::new(64);
        let mut k = test_kernel(&buf);

        let pid = spawn_at(&mut k, 6);

        // age it in the ready queue until its effective priority improves
        for _ in 0..TIME_SLICE_PER_AGE {
            k.apply_aging();
        }
        assert_eq!(k.priority_of(pid).unwrap(), 5);

        k.yield_now();
        assert_eq!(k.current_pid(), pid);
        assert_eq!(k.priority_of(pid).unwrap(), 6, "pick didn't reset the effective priority");
    }

    #[test]
    fn aging_gives_every_priority_a_share() {
        let buf = PageBuf::new(64);
        let mut k = test_kernel(&buf);

        let a = spawn_at(&mut k, 3);
        let b = spawn_at(&mut k, 4);
        let c = spawn_at(&mut k, 5);
        let d = spawn_at(&mut k, 6);

        let mut runs: BTreeMap<Pid, usize> = BTreeMap::new();
        for _ in 0..2000 {
            k.schedule(true, true, true);
            *runs.entry(k.current_pid()).or_default() += 1;
        }

        let (ra, rb, rc, rd) = (runs[&a], runs[&b], runs[&c], runs[&d]);
        assert!(ra > rb, "priority 3 should run more than 4 ({ra} vs {rb})");
        assert!(rb > rc, "priority 4 should run more than 5 ({rb} vs {rc})");
        assert!(rc > rd, "priority 5 should run more than 6 ({rc} vs {rd})");
        assert!(rd > 0, "aging must keep the lowest priority live");
    }

    #[test]
    fn sleep_wakes_on_the_exact_tick() {
        let buf = PageBuf::new(64);
        let mut k = test_kernel(&buf);

        let child = k.fork();
        k.yield_now();
        assert_eq!(k.current_pid(), child);

        k.sleep(1); // 20 ticks at 50ms
        assert_ne!(k.current_pid(), child);

        for tick in 1..=(TICKS_PER_SECOND) {
            k.schedule(true, true, true);
            if tick < TICKS_PER_SECOND {
                assert_ne!(k.current_pid(), child, "woke early on tick {tick}");
            }
        }
        assert_eq!(k.current_pid(), child, "child was not running on the wake tick");
    }

    #[test]
    fn untimed_passes_leave_sleepers_alone() {
        let buf = PageBuf::new(64);
        let mut k = test_kernel(&buf);

        let child = k.fork();
        k.yield_now();
        k.sleep(1);

        for _ in 0..100 {
            k.yield_now();
        }
        assert_eq!(k.task(child).unwrap().sleep_ticks, TICKS_PER_SECOND);
    }
}

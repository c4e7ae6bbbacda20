//! the physical frame allocator
//!
//! one bit per page frame. a bit is set exactly when the frame backs at
//! least one live page table entry

use super::paging::Page;
use crate::arch::{PhysicalAddress, PAGE_SIZE};
use crate::util::BitSet;

/// bitset over every physical page frame the kernel manages
pub struct FrameSet {
    frames: BitSet,
}

impl FrameSet {
    /// creates a frame set covering `memory_bytes` of physical memory
    pub fn new(memory_bytes: usize) -> Self {
        Self {
            frames: BitSet::new(memory_bytes / PAGE_SIZE),
        }
    }

    /// backs `page` with the lowest free frame and stamps in the
    /// present/user/writable flags. a page that is already present is left
    /// alone. running out of frames is fatal
    pub fn alloc(&mut self, page: &mut Page, is_kernel: bool, is_writable: bool) {
        if page.is_present() {
            return;
        }

        let idx = match self.frames.first_unset() {
            Some(idx) => idx,
            None => panic!("out of memory: no free page frames"),
        };
        self.frames.set(idx);

        page.set_present(true);
        page.set_writable(is_writable);
        page.set_user(!is_kernel);
        page.set_frame(idx as u32);
    }

    /// releases the frame behind `page` and clears its present flag. pages
    /// with nothing behind them are left alone
    pub fn free(&mut self, page: &mut Page) {
        if !page.is_present() {
            return;
        }

        let frame = page.frame() as usize;
        debug_assert!(self.frames.test(frame), "freeing a frame that was never allocated");
        self.frames.clear(frame);
        page.set_present(false);
    }

    /// marks the frame holding `addr` used without touching any page entry.
    /// bootstrap uses this to fence off memory the boot image already
    /// occupies
    pub fn reserve(&mut self, addr: PhysicalAddress) {
        self.frames.set(addr / PAGE_SIZE);
    }

    /// whether the frame holding `addr` is in use
    pub fn test(&self, addr: PhysicalAddress) -> bool {
        self.frames.test(addr / PAGE_SIZE)
    }

    /// number of free frames, skipping fully used words of the set
    pub fn count_free(&self) -> usize {
        self.frames.count_unset()
    }

    /// number of used frames
    pub fn count_used(&self) -> usize {
        self.frames.count_set()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_backs_page_with_lowest_free_frame() {
        let mut frames = FrameSet::new(PAGE_SIZE * 32);
        let mut a = Page::default();
        let mut b = Page::default();

        frames.alloc(&mut a, false, true);
        frames.alloc(&mut b, true, false);

        assert!(a.is_present() && a.user() && a.writable());
        assert_eq!(a.frame(), 0);
        assert!(b.is_present() && !b.user() && !b.writable());
        assert_eq!(b.frame(), 1);
        assert_eq!(frames.count_used(), 2);
    }

    #[test]
    fn alloc_is_a_noop_on_present_pages() {
        let mut frames = FrameSet::new(PAGE_SIZE * 8);
        let mut page = Page::default();

        frames.alloc(&mut page, false, true);
        let first = page.frame();
        frames.alloc(&mut page, false, true);

        assert_eq!(page.frame(), first);
        assert_eq!(frames.count_used(), 1);
    }

    #[test]
    fn free_returns_the_frame() {
        let mut frames = FrameSet::new(PAGE_SIZE * 8);
        let mut a = Page::default();
        let mut b = Page::default();

        frames.alloc(&mut a, false, true);
        frames.alloc(&mut b, false, true);
        frames.free(&mut a);

        assert!(!a.is_present());
        assert_eq!(frames.count_free(), 7);

        // the freed frame is handed out again first
        let mut c = Page::default();
        frames.alloc(&mut c, false, true);
        assert_eq!(c.frame(), 0);
    }

    #[test]
    #[should_panic(expected = "out of memory")]
    fn exhaustion_is_fatal() {
        let mut frames = FrameSet::new(PAGE_SIZE * 2);
        for _ in 0..3 {
            let mut page = Page::default();
            frames.alloc(&mut page, false, true);
        }
    }
}

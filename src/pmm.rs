//! Physical Memory Manager (PMM)
//!
//! The user-process subsystem treats this as an external collaborator
//! (§1): process and thread code never touches the bitmap directly, only
//! `PhysFrame`s handed back by `alloc_page`/`alloc_page_zeroed` and handed
//! in to `free_page`. Each bit in the bitmap represents one page.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use spinning_top::Spinlock;

use crate::config::PAGE_SIZE;

/// Enable debug frame tracking (adds overhead but helps find leaks).
pub const DEBUG_FRAME_TRACKING: bool = true;

/// Allocation source for debug tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSource {
    /// Kernel heap allocation.
    Kernel,
    /// Page-directory / page-table frame for a user address space.
    UserPageTable,
    /// User data page (segment, stack, mmap/brk).
    UserData,
    /// ELF loader (code/data segments).
    ElfLoader,
    /// Unknown/unspecified.
    Unknown,
}

/// Information about a tracked frame allocation.
#[derive(Debug, Clone)]
pub struct FrameInfo {
    pub source: FrameSource,
    /// Owning pid, 0 for the kernel.
    pub pid: u32,
}

struct FrameTracker {
    allocations: BTreeMap<usize, FrameInfo>,
    total_tracked: usize,
    total_untracked: usize,
}

impl FrameTracker {
    const fn new() -> Self {
        Self {
            allocations: BTreeMap::new(),
            total_tracked: 0,
            total_untracked: 0,
        }
    }

    fn track(&mut self, addr: usize, source: FrameSource, pid: u32) {
        if let Some(old) = self.allocations.insert(addr, FrameInfo { source, pid }) {
            crate::safe_print!(
                96,
                "[pmm] double allocation at {:#x}: was {:?}\n",
                addr,
                old.source
            );
        }
        self.total_tracked += 1;
    }

    fn untrack(&mut self, addr: usize) -> Option<FrameInfo> {
        match self.allocations.remove(&addr) {
            Some(info) => {
                self.total_untracked += 1;
                Some(info)
            }
            None => {
                crate::safe_print!(64, "[pmm] freeing untracked frame at {:#x}\n", addr);
                None
            }
        }
    }

    fn leak_count(&self) -> usize {
        self.allocations.len()
    }
}

static FRAME_TRACKER: Spinlock<FrameTracker> = Spinlock::new(FrameTracker::new());

pub fn track_frame(frame: PhysFrame, source: FrameSource, pid: u32) {
    if DEBUG_FRAME_TRACKING {
        FRAME_TRACKER.lock().track(frame.addr, source, pid);
    }
}

pub fn untrack_frame(frame: PhysFrame) {
    if DEBUG_FRAME_TRACKING {
        FRAME_TRACKER.lock().untrack(frame.addr);
    }
}

/// Number of frames the tracker believes are still outstanding. Meaningful
/// only with `DEBUG_FRAME_TRACKING` on; used by the `process_exit` test to
/// assert nothing the process owned remains reachable (§8).
pub fn leak_count() -> usize {
    if DEBUG_FRAME_TRACKING {
        FRAME_TRACKER.lock().leak_count()
    } else {
        0
    }
}

/// A physical page frame. Carries no ownership semantics by itself — the
/// caller is responsible for eventually passing it to `free_page`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysFrame {
    pub addr: usize,
}

impl PhysFrame {
    pub const fn new(addr: usize) -> Self {
        Self {
            addr: addr & !(PAGE_SIZE - 1),
        }
    }
}

struct BitmapAllocator {
    /// One bit per page; 1 = free, 0 = used.
    bitmap: Vec<u64>,
    base_addr: usize,
    total_pages: usize,
    free_pages: usize,
    next_free_hint: usize,
}

impl BitmapAllocator {
    const fn new() -> Self {
        Self {
            bitmap: Vec::new(),
            base_addr: 0,
            total_pages: 0,
            free_pages: 0,
            next_free_hint: 0,
        }
    }

    fn init(&mut self, base: usize, size: usize, kernel_end: usize) {
        self.base_addr = base;
        self.total_pages = size / PAGE_SIZE;

        let bitmap_words = self.total_pages.div_ceil(64);
        self.bitmap = alloc::vec![!0u64; bitmap_words];

        let kernel_pages = (kernel_end.saturating_sub(base)).div_ceil(PAGE_SIZE);
        for i in 0..kernel_pages {
            self.mark_used(i);
        }

        self.free_pages = self.total_pages - kernel_pages;
        self.next_free_hint = kernel_pages;

        let remaining = self.total_pages % 64;
        if remaining != 0 {
            let last_idx = bitmap_words - 1;
            self.bitmap[last_idx] &= (1u64 << remaining) - 1;
        }
    }

    fn mark_used(&mut self, page_idx: usize) {
        let (word, bit) = (page_idx / 64, page_idx % 64);
        if word < self.bitmap.len() {
            self.bitmap[word] &= !(1u64 << bit);
        }
    }

    fn mark_free(&mut self, page_idx: usize) {
        let (word, bit) = (page_idx / 64, page_idx % 64);
        if word < self.bitmap.len() {
            self.bitmap[word] |= 1u64 << bit;
        }
    }

    fn is_free(&self, page_idx: usize) -> bool {
        let (word, bit) = (page_idx / 64, page_idx % 64);
        word < self.bitmap.len() && (self.bitmap[word] & (1u64 << bit)) != 0
    }

    fn alloc_page(&mut self) -> Option<PhysFrame> {
        let start_word = self.next_free_hint / 64;
        let search = (start_word..self.bitmap.len()).chain(0..start_word);

        for word_idx in search {
            if self.bitmap[word_idx] == 0 {
                continue;
            }
            let bit_idx = self.bitmap[word_idx].trailing_zeros() as usize;
            let page_idx = word_idx * 64 + bit_idx;
            if page_idx < self.total_pages {
                self.mark_used(page_idx);
                self.free_pages -= 1;
                self.next_free_hint = page_idx + 1;
                return Some(PhysFrame::new(self.base_addr + page_idx * PAGE_SIZE));
            }
        }
        None
    }

    fn free_page(&mut self, frame: PhysFrame) {
        if frame.addr < self.base_addr {
            return;
        }
        let page_idx = (frame.addr - self.base_addr) / PAGE_SIZE;
        if page_idx < self.total_pages && !self.is_free(page_idx) {
            self.mark_free(page_idx);
            self.free_pages += 1;
            if page_idx < self.next_free_hint {
                self.next_free_hint = page_idx;
            }
        }
    }
}

static PMM: Spinlock<BitmapAllocator> = Spinlock::new(BitmapAllocator::new());
static TOTAL_PAGES: AtomicUsize = AtomicUsize::new(0);
static ALLOCATED_PAGES: AtomicUsize = AtomicUsize::new(0);

/// Initialize the physical memory manager over `[ram_base, ram_base +
/// ram_size)`, reserving everything below `kernel_end` for the kernel
/// image and heap.
pub fn init(ram_base: usize, ram_size: usize, kernel_end: usize) {
    let mut pmm = PMM.lock();
    pmm.init(ram_base, ram_size, kernel_end);
    TOTAL_PAGES.store(pmm.total_pages, Ordering::Release);
    ALLOCATED_PAGES.store(pmm.total_pages - pmm.free_pages, Ordering::Release);
}

pub fn alloc_page() -> Option<PhysFrame> {
    let mut pmm = PMM.lock();
    let result = pmm.alloc_page();
    if result.is_some() {
        ALLOCATED_PAGES.fetch_add(1, Ordering::Relaxed);
    }
    result
}

pub fn free_page(frame: PhysFrame) {
    // Untrack before freeing: if another caller reallocated this frame and
    // tracked it first, freeing before untracking would remove their entry.
    untrack_frame(frame);
    let mut pmm = PMM.lock();
    pmm.free_page(frame);
    ALLOCATED_PAGES.fetch_sub(1, Ordering::Relaxed);
}

/// (total, allocated, free) in pages.
pub fn stats() -> (usize, usize, usize) {
    let total = TOTAL_PAGES.load(Ordering::Relaxed);
    let allocated = ALLOCATED_PAGES.load(Ordering::Relaxed);
    (total, allocated, total.saturating_sub(allocated))
}

/// Allocate a page and zero it through its kernel mapping.
pub fn alloc_page_zeroed() -> Option<PhysFrame> {
    let frame = alloc_page()?;
    unsafe {
        let virt_addr = crate::mmu::phys_to_virt(frame.addr);
        core::ptr::write_bytes(virt_addr, 0, PAGE_SIZE);
    }
    Some(frame)
}

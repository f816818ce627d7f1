//! Kernel heap allocator
//!
//! The kernel heap backs every `Box`/`Vec`/`BTreeMap` used by the process
//! and thread subsystem (PCBs, wait-status and join-status records, the
//! per-process fd/thread/lock/sema tables). It is a fixed region claimed
//! once at boot and managed by `talc`; unlike user memory it is never
//! paged and is not subject to the page allocator in `pmm`.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};
use spinning_top::Spinlock;
use talc::{ErrOnOom, Span, Talc};

use crate::irq::with_irqs_disabled;

#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator;

static TALC: Spinlock<Talc<ErrOnOom>> = Spinlock::new(Talc::new(ErrOnOom));

static HEAP_SIZE: AtomicUsize = AtomicUsize::new(0);
static ALLOCATED_BYTES: AtomicUsize = AtomicUsize::new(0);
static ALLOCATION_COUNT: AtomicUsize = AtomicUsize::new(0);
static PEAK_ALLOCATED: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone, Copy)]
pub struct MemoryStats {
    pub heap_size: usize,
    pub allocated: usize,
    pub free: usize,
    pub allocation_count: usize,
    pub peak_allocated: usize,
}

pub fn stats() -> MemoryStats {
    let heap_size = HEAP_SIZE.load(Ordering::Relaxed);
    let allocated = ALLOCATED_BYTES.load(Ordering::Relaxed);
    MemoryStats {
        heap_size,
        allocated,
        free: heap_size.saturating_sub(allocated),
        allocation_count: ALLOCATION_COUNT.load(Ordering::Relaxed),
        peak_allocated: PEAK_ALLOCATED.load(Ordering::Relaxed),
    }
}

/// Claim a fixed memory region as the kernel heap. Must be called exactly
/// once, before any allocation, with a region that does not overlap
/// anything the page allocator (`pmm`) hands out.
pub fn init(heap_start: usize, heap_size: usize) -> Result<(), &'static str> {
    if heap_size == 0 {
        return Err("heap size cannot be zero");
    }
    if heap_start == 0 {
        return Err("invalid heap start address");
    }

    HEAP_SIZE.store(heap_size, Ordering::Relaxed);

    unsafe {
        let span = Span::from_base_size(heap_start as *mut u8, heap_size);
        TALC.lock()
            .claim(span)
            .map_err(|_| "failed to claim heap memory")?;
    }

    Ok(())
}

struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        with_irqs_disabled(|| {
            let result = unsafe { TALC.lock().malloc(layout) }
                .map(|ptr| ptr.as_ptr())
                .unwrap_or(ptr::null_mut());

            if !result.is_null() {
                record_alloc(layout.size());
            }

            result
        })
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        with_irqs_disabled(|| {
            unsafe {
                TALC.lock()
                    .free(core::ptr::NonNull::new_unchecked(ptr), layout);
            }
            ALLOCATED_BYTES.fetch_sub(layout.size(), Ordering::Relaxed);
        })
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if new_size == 0 {
            unsafe { self.dealloc(ptr, layout) };
            return ptr::null_mut();
        }

        let new_layout = match Layout::from_size_align(new_size, layout.align()) {
            Ok(l) => l,
            Err(_) => return ptr::null_mut(),
        };

        let new_ptr = unsafe { self.alloc(new_layout) };
        if new_ptr.is_null() {
            return ptr::null_mut();
        }

        if !ptr.is_null() {
            let copy_size = layout.size().min(new_size);
            unsafe {
                ptr::copy_nonoverlapping(ptr, new_ptr, copy_size);
                self.dealloc(ptr, layout);
            }
        }

        new_ptr
    }
}

fn record_alloc(size: usize) {
    let new_allocated = ALLOCATED_BYTES.fetch_add(size, Ordering::Relaxed) + size;
    ALLOCATION_COUNT.fetch_add(1, Ordering::Relaxed);

    let mut peak = PEAK_ALLOCATED.load(Ordering::Relaxed);
    while new_allocated > peak {
        match PEAK_ALLOCATED.compare_exchange_weak(
            peak,
            new_allocated,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(p) => peak = p,
        }
    }
}

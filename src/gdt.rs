//! Global descriptor table and task-state segment
//!
//! Out of scope (§1): segmentation itself is plumbing beneath the process
//! subsystem, not part of it. It still has to exist for any of that
//! subsystem to run, though: `threading::enter_user_mode`'s `iretd` and
//! every syscall/page-fault trap back into ring 0 (`exceptions.rs`) name
//! GDT selectors (`0x08` kernel code, `0x1B` user code, `0x23` user data)
//! that only mean anything once this module has installed a matching
//! table, and a ring 3-to-0 privilege change is only possible with a
//! loaded TSS naming the ring-0 stack to switch to. A Multiboot loader
//! hands off with its own GDT, which has no ring-3 descriptors and no TSS
//! at all, so this has no bootloader-provided equivalent to rely on.
//!
//! No teacher precedent: AArch64 has no segmentation and no analogous
//! structure, so this module is built directly from the x86 architecture
//! manual's GDT/TSS layout rather than ported from anything.

use core::mem::size_of;

const KERNEL_CODE_SELECTOR: u16 = 0x08;
const KERNEL_DATA_SELECTOR: u16 = 0x10;
const USER_CODE_SELECTOR: u16 = 0x1B;
const USER_DATA_SELECTOR: u16 = 0x23;
const TSS_SELECTOR: u16 = 0x28;

const ACCESS_PRESENT: u8 = 1 << 7;
const ACCESS_RING3: u8 = 3 << 5;
const ACCESS_CODE_DATA: u8 = 1 << 4; // "descriptor type": code/data, not system
const ACCESS_EXECUTABLE: u8 = 1 << 3;
const ACCESS_RW: u8 = 1 << 1; // readable (code) / writable (data)
const ACCESS_TSS_AVAILABLE: u8 = 0x9; // 32-bit TSS, not busy

const GRANULARITY_4K_32BIT: u8 = (1 << 7) | (1 << 6); // page granularity, 32-bit operands

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct GdtEntry {
    limit_low: u16,
    base_low: u16,
    base_mid: u8,
    access: u8,
    granularity: u8,
    base_high: u8,
}

impl GdtEntry {
    const fn null() -> Self {
        Self { limit_low: 0, base_low: 0, base_mid: 0, access: 0, granularity: 0, base_high: 0 }
    }

    const fn new(base: u32, limit: u32, access: u8, granularity: u8) -> Self {
        Self {
            limit_low: (limit & 0xFFFF) as u16,
            base_low: (base & 0xFFFF) as u16,
            base_mid: ((base >> 16) & 0xFF) as u8,
            access,
            granularity: granularity | (((limit >> 16) & 0x0F) as u8),
            base_high: ((base >> 24) & 0xFF) as u8,
        }
    }
}

#[repr(C, packed)]
struct GdtPointer {
    limit: u16,
    base: u32,
}

/// 32-bit TSS (Intel SDM Vol. 3A, Figure 9-2). Only `ss0`/`esp0` are ever
/// read by this kernel — every ring 3-to-0 trap loads the kernel stack
/// pointer from here, nothing else in the struct is consulted — but the
/// full layout is kept so the hardware's field offsets match.
#[repr(C, packed)]
struct TaskStateSegment {
    prev_task: u32,
    esp0: u32,
    ss0: u32,
    esp1: u32,
    ss1: u32,
    esp2: u32,
    ss2: u32,
    cr3: u32,
    eip: u32,
    eflags: u32,
    eax: u32,
    ecx: u32,
    edx: u32,
    ebx: u32,
    esp: u32,
    ebp: u32,
    esi: u32,
    edi: u32,
    es: u32,
    cs: u32,
    ss: u32,
    ds: u32,
    fs: u32,
    gs: u32,
    ldt: u32,
    trap: u16,
    iomap_base: u16,
}

impl TaskStateSegment {
    const fn new() -> Self {
        // SAFETY-relevant invariant: every field not named above must stay
        // zero, since this TSS is never actually switched to by a hardware
        // task switch (this kernel only uses it for esp0/ss0 on traps).
        Self {
            prev_task: 0,
            esp0: 0,
            ss0: 0,
            esp1: 0,
            ss1: 0,
            esp2: 0,
            ss2: 0,
            cr3: 0,
            eip: 0,
            eflags: 0,
            eax: 0,
            ecx: 0,
            edx: 0,
            ebx: 0,
            esp: 0,
            ebp: 0,
            esi: 0,
            edi: 0,
            es: 0,
            cs: 0,
            ss: 0,
            ds: 0,
            fs: 0,
            gs: 0,
            ldt: 0,
            trap: 0,
            iomap_base: size_of::<TaskStateSegment>() as u16, // no I/O bitmap
        }
    }
}

const GDT_ENTRIES: usize = 6;

static mut GDT: [GdtEntry; GDT_ENTRIES] = [GdtEntry::null(); GDT_ENTRIES];
static mut TSS: TaskStateSegment = TaskStateSegment::new();

/// Installs a flat GDT (kernel + user code/data covering all 4GB) and a TSS
/// naming the current stack as ring 0's. Must run before `exceptions::init`
/// and before the first `threading::enter_user_mode`.
pub fn init(initial_kernel_stack_top: u32) {
    unsafe {
        let tss_ptr = core::ptr::addr_of_mut!(TSS);
        (*tss_ptr).ss0 = KERNEL_DATA_SELECTOR as u32;
        (*tss_ptr).esp0 = initial_kernel_stack_top;

        let gdt_ptr = core::ptr::addr_of_mut!(GDT);
        (*gdt_ptr)[0] = GdtEntry::null();
        (*gdt_ptr)[1] = GdtEntry::new(
            0,
            0xFFFFF,
            ACCESS_PRESENT | ACCESS_CODE_DATA | ACCESS_EXECUTABLE | ACCESS_RW,
            GRANULARITY_4K_32BIT,
        );
        (*gdt_ptr)[2] = GdtEntry::new(
            0,
            0xFFFFF,
            ACCESS_PRESENT | ACCESS_CODE_DATA | ACCESS_RW,
            GRANULARITY_4K_32BIT,
        );
        (*gdt_ptr)[3] = GdtEntry::new(
            0,
            0xFFFFF,
            ACCESS_PRESENT | ACCESS_RING3 | ACCESS_CODE_DATA | ACCESS_EXECUTABLE | ACCESS_RW,
            GRANULARITY_4K_32BIT,
        );
        (*gdt_ptr)[4] = GdtEntry::new(
            0,
            0xFFFFF,
            ACCESS_PRESENT | ACCESS_RING3 | ACCESS_CODE_DATA | ACCESS_RW,
            GRANULARITY_4K_32BIT,
        );
        (*gdt_ptr)[5] = GdtEntry::new(
            tss_ptr as u32,
            (size_of::<TaskStateSegment>() - 1) as u32,
            ACCESS_PRESENT | ACCESS_RING3 | ACCESS_TSS_AVAILABLE,
            0,
        );

        let ptr = GdtPointer {
            limit: (size_of::<[GdtEntry; GDT_ENTRIES]>() - 1) as u16,
            base: gdt_ptr as u32,
        };
        load_gdt_and_segments(&ptr);

        core::arch::asm!("ltr {0:x}", in(reg) TSS_SELECTOR, options(nostack, preserves_flags));
    }
}

unsafe fn load_gdt_and_segments(ptr: &GdtPointer) {
    unsafe {
        core::arch::asm!(
            "lgdt [{ptr}]",
            "mov {tmp:x}, {kdata:x}",
            "mov ds, {tmp:x}",
            "mov es, {tmp:x}",
            "mov fs, {tmp:x}",
            "mov gs, {tmp:x}",
            "mov ss, {tmp:x}",
            // A far jump is the only way to reload CS; `push`/`retf` to a
            // local label is the standard freestanding substitute for the
            // `ljmp $KERNEL_CS, $1f` GAS syntax can't express in inline asm.
            "push {kcode}",
            "lea {tmp}, [2f]",
            "push {tmp}",
            "retf",
            "2:",
            ptr = in(reg) ptr,
            kdata = in(reg) KERNEL_DATA_SELECTOR as u32,
            kcode = in(reg) KERNEL_CODE_SELECTOR as u32,
            tmp = out(reg) _,
            options(preserves_flags),
        );
    }
}

/// Updates the ring-0 stack the TSS hands the CPU on the next ring 3-to-0
/// trap. Called by the scheduler on every switch to a thread that has run
/// (or will run) user code, so a trap taken while that thread is in ring 3
/// always lands on its own kernel stack rather than a stale one.
pub fn set_kernel_stack(esp0: u32) {
    unsafe {
        let tss_ptr = core::ptr::addr_of_mut!(TSS);
        (*tss_ptr).esp0 = esp0;
    }
}

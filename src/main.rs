//! Kernel entry point and boot sequence.

#![no_std]
#![no_main]

extern crate alloc;

mod allocator;
mod boot;
mod config;
mod console;
mod elf_loader;
mod exceptions;
mod gdt;
mod irq;
#[macro_use]
mod log;
mod mmu;
mod pmm;
mod process;
mod sync;
mod syscall;
mod threading;
mod vfs;

use core::panic::PanicInfo;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    crate::safe_print!(128, "panic: {}\n", info);
    loop {
        unsafe { core::arch::asm!("cli", "hlt", options(nomem, nostack)) };
    }
}

/// Physical RAM assumed present. A real bootloader hand-off would read this
/// from the Multiboot memory map; Multiboot parsing is boot-time plumbing
/// outside this subsystem's scope, so it is fixed here to match the `-m`
/// value the kernel is run with under QEMU.
const RAM_BASE: usize = 0;
const RAM_SIZE: usize = 128 * 1024 * 1024;

/// End of the kernel's own static image, rounded up generously. Physical
/// frames below this are never handed out by `pmm`.
const KERNEL_END: usize = boot::KERNEL_PHYS_BASE + 4 * 1024 * 1024;

const HEAP_SIZE: usize = 16 * 1024 * 1024;

/// The first user program the kernel loads once the lifecycle machinery is
/// up. A real kernel would take this from a boot argument; the process
/// subsystem otherwise has no notion of an "init" program, it is simply the
/// first caller of `process_execute`.
const INITIAL_PROGRAM: &str = "main";

unsafe extern "C" {
    // Defined in boot.rs's boot assembly; its address is the top of the 1MB
    // stack `rust_start` is already running on when this function begins.
    static boot_stack_top: u8;
}

#[unsafe(no_mangle)]
pub extern "C" fn rust_start(_multiboot_info: u32) -> ! {
    gdt::init(unsafe { core::ptr::addr_of!(boot_stack_top) } as u32);

    let heap_start = mmu::phys_to_virt(KERNEL_END) as usize;
    allocator::init(heap_start, HEAP_SIZE).expect("failed to initialize kernel heap");

    pmm::init(RAM_BASE, RAM_SIZE, KERNEL_END);
    mmu::init(RAM_BASE, RAM_SIZE);
    vfs::init();
    threading::init();
    exceptions::init();

    crate::println!("kernel up, starting {}", INITIAL_PROGRAM);

    if process::process_execute(INITIAL_PROGRAM).is_err() {
        crate::println!("load: {}: failed to start", INITIAL_PROGRAM);
    }

    // The boot thread becomes the idle loop: every other kernel thread
    // blocks or exits back into this yield, never truly "returning" to it
    // except via the round-robin scheduler.
    loop {
        threading::yield_now();
        unsafe { core::arch::asm!("hlt", options(nomem, nostack)) };
    }
}

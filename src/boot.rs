//! Boot code for x86 (32-bit, i386)
//!
//! Out of scope (§1): CPU context setup and the interrupt entry/exit
//! trampolines are treated as an external collaborator. This module only
//! carries the CPU from the bootloader's protected-mode entry to
//! `rust_start` with a stack in place; the GDT/TSS (`gdt::init`), IDT
//! (`exceptions::init`) and the kernel's own page directory (`mmu::init`)
//! are all installed from within `rust_start` itself, the same way
//! `netoneko-akuma`'s `_boot` hands off to `rust_start` before doing its
//! own MMU bootstrap.

use core::arch::global_asm;

/// Kernel load address, matching a typical Multiboot `-kernel` link.
pub const KERNEL_PHYS_BASE: usize = 0x0010_0000;

global_asm!(
    r#"
.section .text._boot
.global _boot

.equ STACK_SIZE, 0x100000 // 1MB boot stack

_boot:
    // The bootloader leaves us in 32-bit protected mode with no stack.
    mov esp, offset boot_stack_top

    // Multiboot passes the info struct pointer in ebx; hand it to Rust.
    push ebx
    call rust_start

hang:
    hlt
    jmp hang

.section .bss.boot
.balign 16
boot_stack_bottom:
    .space STACK_SIZE
.global boot_stack_top
boot_stack_top:
"#
);

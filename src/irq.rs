//! Interrupt masking
//!
//! A handful of operations in the process/thread subsystem are
//! interrupt-sensitive rather than just lock-protected: clearing
//! `pcb.pagedir` before activating the kernel directory, and clearing
//! `thread.pcb` before freeing the PCB storage (§4.2 steps 7 and 9 of the
//! process lifecycle). A timer interrupt landing between those two
//! statements would reactivate a directory that is about to be, or has
//! just been, freed. This module is the "interrupts logically disabled"
//! primitive those sections are built on.

const EFLAGS_IF: u32 = 1 << 9;

/// RAII guard that disables interrupts on creation and restores the prior
/// mask on drop, so the mask is restored correctly even if the guarded code
/// panics or returns early.
pub struct IrqGuard {
    saved_flags: u32,
}

impl IrqGuard {
    #[inline]
    pub fn new() -> Self {
        let saved_flags = read_flags();
        disable_irqs();
        Self { saved_flags }
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqGuard {
    #[inline]
    fn drop(&mut self) {
        if self.saved_flags & EFLAGS_IF != 0 {
            enable_irqs();
        }
    }
}

#[inline]
fn read_flags() -> u32 {
    let flags: u32;
    unsafe {
        core::arch::asm!("pushfd", "pop {0}", out(reg) flags, options(nomem, preserves_flags));
    }
    flags
}

/// Run a closure with interrupts disabled, restoring the previous mask
/// afterward even on an early return out of the closure.
#[inline]
pub fn with_irqs_disabled<T, F: FnOnce() -> T>(f: F) -> T {
    let _guard = IrqGuard::new();
    f()
}

/// Disable interrupts. Prefer `with_irqs_disabled` so the mask can't be
/// left disabled by a forgotten `enable_irqs`.
#[inline]
pub fn disable_irqs() {
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack));
    }
}

/// Re-enable interrupts. Only call after `disable_irqs`.
#[inline]
pub fn enable_irqs() {
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack));
    }
}

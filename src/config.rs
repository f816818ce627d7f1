//! Kernel configuration constants
//!
//! Tunable parameters for the process/thread subsystem. Modify these values
//! to adjust kernel behavior.

#![allow(dead_code)]

/// Page size in bytes, fixed by the hardware.
pub const PAGE_SIZE: usize = 4096;

/// Base of user virtual address space; the kernel occupies everything at or
/// above this address. User stacks are allocated downward from here.
pub const PHYS_BASE: usize = 0xC000_0000;

/// Boot/kernel stack size (1MB default).
///
/// Used by the boot thread and exception handlers.
pub const KERNEL_STACK_SIZE: usize = 1024 * 1024;

/// Default per-thread kernel stack size (32KB).
///
/// Used for every kernel thread backing a user thread, whether it is the
/// process's main thread or one spawned by `pthread_create`.
pub const DEFAULT_THREAD_STACK_SIZE: usize = 32 * 1024;

/// User process stack size (one page).
///
/// Matches the spec: each user thread gets exactly one stack page, chosen
/// by offset slot rather than grown on demand (no-goal: demand paging).
pub const USER_STACK_SIZE: usize = PAGE_SIZE;

/// Maximum kernel threads in the system thread pool.
pub const MAX_THREADS: usize = 64;

/// Maximum process name length, not counting the NUL terminator.
pub const PROCESS_NAME_MAX: usize = 15;

/// Size of a process's lock table (§3 Data model).
pub const MAX_LOCKS: usize = 256;

/// Size of a process's semaphore table (§3 Data model).
pub const MAX_SEMAPHORES: usize = 256;

/// Size of a process's stack-offset bitmap. Slot `i` claims the user page at
/// `PHYS_BASE - i * PAGE_SIZE`; slots 0 and 1 are permanently reserved.
pub const MAX_STACK_SLOTS: usize = 256;

/// Offset slot reserved for the main thread's stack.
pub const MAIN_THREAD_STACK_SLOT: usize = 1;

/// Lowest offset slot available to `pthread_create`d threads.
pub const FIRST_SPAWNED_STACK_SLOT: usize = 2;

/// Maximum open files per process, including stdin/stdout.
pub const MAX_OPEN_FILES: usize = 128;

/// First file descriptor handle handed out by `open` (0/1 are reserved for
/// stdin/stdout and never appear in the fd table itself).
pub const FIRST_FD_HANDLE: u32 = 2;

/// Exit code used for kernel-imposed termination (fault, bad syscall,
/// invalid user memory). Never produced by a voluntary `sys_exit`.
pub const KERNEL_KILL_EXIT_CODE: i32 = -1;

/// Gate for verbose syscall/process tracing. Off by default; flip on when
/// chasing a lifecycle bug.
pub const SYSCALL_DEBUG_INFO_ENABLED: bool = false;

/// Minimum severity `log` will print. Messages below this level are
/// compiled in but produce no output.
pub const LOG_LEVEL: crate::log::Level = crate::log::Level::Info;

/// Enable stack canary checking at the bottom of kernel thread stacks.
pub const ENABLE_STACK_CANARIES: bool = true;

/// Magic value written at the bottom of each kernel stack.
pub const STACK_CANARY: u64 = 0xDEAD_BEEF_CAFE_BABE;

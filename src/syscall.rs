//! System-call dispatch (§6)
//!
//! Out of scope (§1): the dispatch table's trivial per-syscall bodies are
//! not the point here; only the behaviors that touch the process/thread
//! core are implemented in earnest (exec, wait, exit, pt_*, lock_*,
//! sema_*). Entry is via `int 0x30`; the call number and up to three
//! argument words sit on the user stack at `esp`, `esp+4`, `esp+8`,
//! `esp+12` — not in registers, unlike the Linux-ABI convention this
//! module's teacher used.

use alloc::string::String;
use alloc::vec::Vec;

use crate::config::{KERNEL_KILL_EXIT_CODE, PHYS_BASE};
use crate::console;

const MAX_STRING_LEN: usize = 512;

/// Kills the process on any user pointer that would read or write kernel
/// memory. A pointer inside user space but unmapped is instead caught by
/// `exceptions::rust_page_fault_handler`, which takes the same exit path
/// (§7: "invalid user pointer: immediate process_exit").
fn validate_user_range(addr: usize, len: usize) {
    let end = match addr.checked_add(len) {
        Some(e) => e,
        None => crate::process::process_exit(KERNEL_KILL_EXIT_CODE),
    };
    if addr == 0 || end > PHYS_BASE {
        crate::process::process_exit(KERNEL_KILL_EXIT_CODE);
    }
}

fn read_user_u32(addr: usize) -> u32 {
    validate_user_range(addr, 4);
    unsafe { (addr as *const u32).read_unaligned() }
}

fn read_user_u8(addr: usize) -> u8 {
    validate_user_range(addr, 1);
    unsafe { (addr as *const u8).read() }
}

fn write_user_u8(addr: usize, value: u8) {
    validate_user_range(addr, 1);
    unsafe { (addr as *mut u8).write(value) };
}

/// Copies a NUL-terminated string in from user space, one byte at a time
/// so a string that runs off the end of a mapped region faults (and thus
/// exits the process) at exactly the byte that does so.
fn read_user_string(addr: usize) -> String {
    let mut bytes = Vec::new();
    let mut cur = addr;
    loop {
        let byte = read_user_u8(cur);
        if byte == 0 {
            break;
        }
        bytes.push(byte);
        cur += 1;
        if bytes.len() > MAX_STRING_LEN {
            crate::process::process_exit(KERNEL_KILL_EXIT_CODE);
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

fn user_slice(addr: usize, len: usize) -> &'static [u8] {
    validate_user_range(addr, len);
    unsafe { core::slice::from_raw_parts(addr as *const u8, len) }
}

fn user_slice_mut(addr: usize, len: usize) -> &'static mut [u8] {
    validate_user_range(addr, len);
    unsafe { core::slice::from_raw_parts_mut(addr as *mut u8, len) }
}

/// Entry point called from `exceptions::rust_syscall_handler`. `esp` is the
/// user stack pointer at the moment of `int 0x30`.
pub fn handle_syscall(esp: usize) -> u32 {
    let call_num = read_user_u32(esp);
    let arg = |i: usize| read_user_u32(esp + 4 + i * 4);

    if crate::config::SYSCALL_DEBUG_INFO_ENABLED {
        crate::log_syscall!(crate::log::Level::Debug, "call {} from tid {}", call_num, crate::threading::current_tid());
    }

    match call_num {
        0 => sys_halt(),
        1 => sys_exit(arg(0) as i32),
        2 => sys_exec(arg(0) as usize),
        3 => sys_wait(arg(0)),
        4 => sys_create(arg(0) as usize, arg(1) as usize),
        5 => sys_remove(arg(0) as usize),
        6 => sys_open(arg(0) as usize),
        7 => sys_filesize(arg(0)),
        8 => sys_read(arg(0), arg(1) as usize, arg(2) as usize),
        9 => sys_write(arg(0), arg(1) as usize, arg(2) as usize),
        10 => sys_seek(arg(0), arg(1) as usize),
        11 => sys_tell(arg(0)),
        12 => sys_close(arg(0)),
        13 => sys_practice(arg(0) as i32),
        14 => sys_compute_e(arg(0) as i32),
        15 => sys_pt_create(arg(0) as usize, arg(1) as usize, arg(2) as usize),
        16 => sys_pt_exit(),
        17 => sys_pt_join(arg(0)),
        18 => sys_lock_init(arg(0) as usize),
        19 => sys_lock_acquire(arg(0) as usize),
        20 => sys_lock_release(arg(0) as usize),
        21 => sys_sema_init(arg(0) as usize, arg(1)),
        22 => sys_sema_down(arg(0) as usize),
        23 => sys_sema_up(arg(0) as usize),
        24 => sys_get_tid(),
        _ => crate::process::process_exit(KERNEL_KILL_EXIT_CODE),
    }
}

fn sys_halt() -> u32 {
    crate::println!("Power off.");
    loop {
        unsafe { core::arch::asm!("cli", "hlt", options(nomem, nostack)) };
    }
}

fn sys_exit(code: i32) -> u32 {
    crate::process::process_exit(code);
}

fn sys_exec(path_addr: usize) -> u32 {
    let cmdline = read_user_string(path_addr);
    match crate::process::process_execute(&cmdline) {
        Ok(pid) => pid,
        Err(()) => u32::MAX,
    }
}

fn sys_wait(pid: u32) -> u32 {
    crate::process::wait(pid) as u32
}

fn sys_create(path_addr: usize, size: usize) -> u32 {
    let name = read_user_string(path_addr);
    crate::process::fs_create(&name, size) as u32
}

fn sys_remove(path_addr: usize) -> u32 {
    let name = read_user_string(path_addr);
    crate::process::fs_remove(&name) as u32
}

fn sys_open(path_addr: usize) -> u32 {
    let name = read_user_string(path_addr);
    match crate::process::fs_open(&name) {
        Ok(handle) => handle,
        Err(()) => u32::MAX,
    }
}

/// Kills the process on an fd that isn't actually open (§7: "Invalid user
/// handle (fd, lock, sema): process_exit for fds").
fn require_fd() -> ! {
    crate::process::process_exit(KERNEL_KILL_EXIT_CODE)
}

fn sys_filesize(handle: u32) -> u32 {
    if !crate::process::fd_exists(handle) {
        require_fd();
    }
    crate::process::fs_filesize(handle)
        .map(|n| n as u32)
        .unwrap_or(u32::MAX)
}

fn sys_read(handle: u32, buf_addr: usize, count: usize) -> u32 {
    if handle == 0 {
        let buf = user_slice_mut(buf_addr, count);
        for b in buf.iter_mut() {
            *b = console::getchar();
        }
        return count as u32;
    }
    if !crate::process::fd_exists(handle) {
        require_fd();
    }
    let buf = user_slice_mut(buf_addr, count);
    crate::process::fs_read(handle, buf)
        .map(|n| n as u32)
        .unwrap_or(u32::MAX)
}

fn sys_write(handle: u32, buf_addr: usize, count: usize) -> u32 {
    let buf = user_slice(buf_addr, count);
    if handle == 1 {
        console::write_bytes(buf);
        return count as u32;
    }
    if !crate::process::fd_exists(handle) {
        require_fd();
    }
    crate::process::fs_write(handle, buf)
        .map(|n| n as u32)
        .unwrap_or(u32::MAX)
}

fn sys_seek(handle: u32, pos: usize) -> u32 {
    if !crate::process::fd_exists(handle) {
        require_fd();
    }
    crate::process::fs_seek(handle, pos);
    0
}

fn sys_tell(handle: u32) -> u32 {
    if !crate::process::fd_exists(handle) {
        require_fd();
    }
    crate::process::fs_tell(handle).map(|n| n as u32).unwrap_or(0)
}

fn sys_close(handle: u32) -> u32 {
    if !crate::process::fd_exists(handle) {
        require_fd();
    }
    crate::process::fs_close(handle);
    0
}

fn sys_practice(n: i32) -> u32 {
    (n + 1) as u32
}

/// `compute_e(n)` (§6 #14): returns `floor(e_n)` where `e_n = sum_{i=0}^n
/// 1/i!`, computed exactly as a rational with common denominator `n!` to
/// avoid floating point in a `no_std` kernel. `n` is clamped to 20 terms,
/// past which `u64` factorials would overflow.
fn sys_compute_e(n: i32) -> u32 {
    if n < 0 {
        return 0;
    }
    let n = n.min(20) as u64;

    let mut denom: u64 = 1;
    for i in 1..=n {
        denom = denom.saturating_mul(i);
    }

    let mut numerator: u64 = 0;
    let mut term_factorial: u64 = 1;
    for i in 0..=n {
        if i > 0 {
            term_factorial *= i;
        }
        numerator += denom / term_factorial;
    }

    (numerator / denom) as u32
}

fn sys_pt_create(stub: usize, func: usize, arg: usize) -> u32 {
    match crate::threading::pthread_execute(stub, func, arg) {
        Ok(tid) => tid,
        Err(()) => u32::MAX,
    }
}

fn sys_pt_exit() -> u32 {
    crate::threading::pthread_exit();
}

fn sys_pt_join(tid: u32) -> u32 {
    if crate::threading::pthread_join(tid) {
        tid
    } else {
        u32::MAX
    }
}

fn sys_lock_init(handle_addr: usize) -> u32 {
    if handle_addr == 0 {
        return false as u32;
    }
    let mut handle = 0u8;
    let ok = crate::process::lock_init(&mut handle);
    if ok {
        write_user_u8(handle_addr, handle);
    }
    ok as u32
}

fn sys_lock_acquire(handle_addr: usize) -> u32 {
    if handle_addr == 0 {
        return false as u32;
    }
    let handle = read_user_u8(handle_addr);
    crate::process::lock_acquire(handle) as u32
}

fn sys_lock_release(handle_addr: usize) -> u32 {
    if handle_addr == 0 {
        return false as u32;
    }
    let handle = read_user_u8(handle_addr);
    crate::process::lock_release(handle) as u32
}

fn sys_sema_init(handle_addr: usize, value: u32) -> u32 {
    if handle_addr == 0 {
        return false as u32;
    }
    let mut handle = 0u8;
    let ok = crate::process::sema_init(&mut handle, value);
    if ok {
        write_user_u8(handle_addr, handle);
    }
    ok as u32
}

fn sys_sema_down(handle_addr: usize) -> u32 {
    if handle_addr == 0 {
        return false as u32;
    }
    let handle = read_user_u8(handle_addr);
    crate::process::sema_down(handle) as u32
}

fn sys_sema_up(handle_addr: usize) -> u32 {
    if handle_addr == 0 {
        return false as u32;
    }
    let handle = read_user_u8(handle_addr);
    crate::process::sema_up(handle) as u32
}

fn sys_get_tid() -> u32 {
    crate::threading::current_tid()
}

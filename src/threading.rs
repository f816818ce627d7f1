//! Kernel thread scheduler, x86 context switch, and pthread lifecycle (§4.3)
//!
//! Out of scope (§1): the underlying scheduler, and interrupt entry/exit
//! trampolines and CPU context setup, are assumed primitives. This module is
//! that primitive — a round-robin cooperative scheduler in the same shape
//! as `netoneko-akuma`'s, context-switched with callee-saved registers
//! instead of AArch64's, plus the ring-0-to-ring-3 entry the ELF loader's
//! caller needs once a process is ready to run. Built on top of it, the
//! `pthread_execute`/`start_pthread`/`pthread_join`/`pthread_exit*` state
//! machine is the part this subsystem actually specifies (§4.3).

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::arch::global_asm;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spinning_top::Spinlock;

use crate::config::{
    DEFAULT_THREAD_STACK_SIZE, ENABLE_STACK_CANARIES, MAX_THREADS, PAGE_SIZE, PHYS_BASE,
    PROCESS_NAME_MAX, STACK_CANARY,
};
use crate::mmu::user_flags;
use crate::process::{JoinStatus, Process};
use crate::sync::Semaphore;

pub type Tid = u32;

// ============================================================================
// Context switch
// ============================================================================

global_asm!(
    r#"
.section .text
.global switch_context
.global thread_start

// void switch_context(Context* old, const Context* new)
// cdecl: [esp+4] = old, [esp+8] = new. esp at entry points at the return
// address, which doubles as the saved eip - this is exactly how a real
// Pintos switch_threads avoids saving eip separately.
switch_context:
    mov eax, [esp+4]
    mov edx, [esp+8]

    mov [eax+0], ebx
    mov [eax+4], esi
    mov [eax+8], edi
    mov [eax+12], ebp
    mov [eax+16], esp

    mov ebx, [edx+0]
    mov esi, [edx+4]
    mov edi, [edx+8]
    mov ebp, [edx+12]
    mov esp, [edx+16]

    ret

// New threads are switched to exactly as if they'd called switch_context
// themselves and were returning from it: ebx holds the one-word argument
// thread_trampoline needs, and the rest of the registers restored above are
// whatever garbage Thread::new zeroed them to, which is fine, nothing reads
// them before they are overwritten.
thread_start:
    sti
    push ebx
    call thread_trampoline
    hlt
"#
);

unsafe extern "C" {
    fn switch_context(old: *mut Context, new: *const Context);
    fn thread_start();
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Context {
    ebx: u32,
    esi: u32,
    edi: u32,
    ebp: u32,
    esp: u32,
}

impl Context {
    const fn zero() -> Self {
        Self { ebx: 0, esi: 0, edi: 0, ebp: 0, esp: 0 }
    }
}

/// Entry point for every freshly spawned kernel thread. `raw` is a
/// `Box<Box<dyn FnOnce()>>` pointer, stashed as a single word in `ebx` the
/// same way `netoneko-akuma` stashes its entry function in `x19`.
#[unsafe(no_mangle)]
extern "C" fn thread_trampoline(raw: u32) -> ! {
    let boxed: Box<Box<dyn FnOnce()>> = unsafe { Box::from_raw(raw as *mut Box<dyn FnOnce()>) };
    let closure = *boxed;
    closure();
    exit_current_thread();
}

// ============================================================================
// Kernel thread table and scheduler
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRunState {
    Ready,
    Running,
    Terminated,
}

struct KernelThread {
    tid: Tid,
    name: String,
    context: Context,
    stack_base: usize,
    stack_size: usize,
    state: ThreadRunState,
    pcb: Option<Arc<Process>>,
    /// This thread's own non-owning handle to its join-status, set once in
    /// `start_pthread`/`start_process`. A joiner may remove the list entry
    /// in `pcb.threads.join_statuses` the instant it claims it, so the
    /// owning thread must signal through its own clone rather than
    /// re-deriving one by scanning that list at exit time.
    join_status: Option<Arc<JoinStatus>>,
}

struct Scheduler {
    threads: Vec<KernelThread>,
    current_idx: usize,
}

impl Scheduler {
    fn new() -> Self {
        let boot = KernelThread {
            tid: 0,
            name: String::from("boot"),
            context: Context::zero(),
            stack_base: 0,
            stack_size: 0,
            state: ThreadRunState::Running,
            pcb: None,
            join_status: None,
        };
        let mut threads = Vec::with_capacity(MAX_THREADS);
        threads.push(boot);
        Self { threads, current_idx: 0 }
    }

    fn push(&mut self, thread: KernelThread) -> Result<(), &'static str> {
        if self.threads.len() >= MAX_THREADS {
            return Err("too many kernel threads");
        }
        self.threads.push(thread);
        Ok(())
    }

    fn index_of(&self, tid: Tid) -> Option<usize> {
        self.threads.iter().position(|t| t.tid == tid)
    }

    /// Round-robin pick of the next ready thread, skipping the boot/idle
    /// thread (index may move once that thread itself terminates, but
    /// index 0 is never reused since tids are never reused).
    fn next_ready(&self) -> Option<usize> {
        let n = self.threads.len();
        if n <= 1 {
            return None;
        }
        for step in 1..=n {
            let idx = (self.current_idx + step) % n;
            if self.threads[idx].state == ThreadRunState::Ready {
                return Some(idx);
            }
        }
        None
    }
}

static SCHEDULER: Spinlock<Option<Scheduler>> = Spinlock::new(None);
static NEXT_TID: AtomicU32 = AtomicU32::new(1);

pub fn init() {
    *SCHEDULER.lock() = Some(Scheduler::new());
}

fn alloc_tid() -> Tid {
    NEXT_TID.fetch_add(1, Ordering::Relaxed)
}

/// Spawns a kernel thread running `body` to completion. Used both for a
/// process's main thread (`start_process`) and for `pthread_execute`'s
/// `start_pthread`.
pub fn spawn_kernel_thread<F>(name: &str, body: F) -> Result<Tid, &'static str>
where
    F: FnOnce() + Send + 'static,
{
    let tid = alloc_tid();

    let layout = core::alloc::Layout::from_size_align(DEFAULT_THREAD_STACK_SIZE, 16)
        .map_err(|_| "bad stack layout")?;
    let stack_base = unsafe { alloc::alloc::alloc_zeroed(layout) as usize };
    if stack_base == 0 {
        return Err("out of memory for kernel stack");
    }
    if ENABLE_STACK_CANARIES {
        unsafe { (stack_base as *mut u64).write_volatile(STACK_CANARY) };
    }
    let stack_top = (stack_base + DEFAULT_THREAD_STACK_SIZE) & !0xF;

    let boxed: Box<Box<dyn FnOnce()>> = Box::new(Box::new(body));
    let raw = Box::into_raw(boxed) as u32;

    // Fake return address so the first switch_context "returns" into
    // thread_start, matching the trick new threads are always bootstrapped
    // with in a classic Pintos switch_threads.
    let mut sp = stack_top;
    sp -= 4;
    unsafe {
        (sp as *mut u32).write(thread_start as usize as u32);
    }

    let context = Context {
        ebx: raw,
        esi: 0,
        edi: 0,
        ebp: 0,
        esp: sp as u32,
    };

    let thread = KernelThread {
        tid,
        name: name.to_string(),
        context,
        stack_base,
        stack_size: DEFAULT_THREAD_STACK_SIZE,
        state: ThreadRunState::Ready,
        pcb: None,
        join_status: None,
    };

    let mut sched = SCHEDULER.lock();
    sched.as_mut().expect("scheduler not initialized").push(thread)?;
    Ok(tid)
}

/// Spawns the kernel thread that will become a new process's main thread.
pub fn spawn_process_thread<F>(name: &str, body: F) -> Result<Tid, &'static str>
where
    F: FnOnce() + Send + 'static,
{
    spawn_kernel_thread(name, body)
}

pub fn current_tid() -> Tid {
    crate::irq::with_irqs_disabled(|| {
        let sched = SCHEDULER.lock();
        sched.as_ref().expect("scheduler not initialized").threads
            [sched.as_ref().unwrap().current_idx]
            .tid
    })
}

pub fn current_pcb() -> Option<Arc<Process>> {
    crate::irq::with_irqs_disabled(|| {
        let sched = SCHEDULER.lock();
        let s = sched.as_ref()?;
        s.threads[s.current_idx].pcb.clone()
    })
}

pub fn attach_pcb(pcb: Arc<Process>) {
    crate::irq::with_irqs_disabled(|| {
        let mut sched = SCHEDULER.lock();
        let s = sched.as_mut().expect("scheduler not initialized");
        let idx = s.current_idx;
        s.threads[idx].pcb = Some(pcb);
    });
}

pub fn detach_pcb() {
    crate::irq::with_irqs_disabled(|| {
        let mut sched = SCHEDULER.lock();
        let s = sched.as_mut().expect("scheduler not initialized");
        let idx = s.current_idx;
        s.threads[idx].pcb = None;
    });
}

/// Records the current thread's own join-status handle (§4.3 step 6:
/// "create a join-status ... push it onto the list, and attach to the
/// thread"). Called once, right after the matching list push, by both
/// `start_pthread` and `process::start_process` (for a process's main
/// thread, which is itself joinable via `pthread_join`).
pub fn set_current_join_status(join_status: Arc<JoinStatus>) {
    crate::irq::with_irqs_disabled(|| {
        let mut sched = SCHEDULER.lock();
        let s = sched.as_mut().expect("scheduler not initialized");
        let idx = s.current_idx;
        s.threads[idx].join_status = Some(join_status);
    });
}

/// The current thread's own join-status, set by `set_current_join_status`.
fn current_join_status() -> Option<Arc<JoinStatus>> {
    crate::irq::with_irqs_disabled(|| {
        let sched = SCHEDULER.lock();
        let s = sched.as_ref()?;
        s.threads[s.current_idx].join_status.clone()
    })
}

/// Cooperative reschedule: the primitive `Semaphore`/`Lock` in `sync.rs`
/// call this while blocked instead of spinning the whole core.
pub fn yield_now() {
    crate::irq::with_irqs_disabled(|| {
        let mut sched = SCHEDULER.lock();
        let s = sched.as_mut().expect("scheduler not initialized");
        let Some(next_idx) = s.next_ready() else {
            return;
        };
        let old_idx = s.current_idx;
        if s.threads[old_idx].state != ThreadRunState::Terminated {
            s.threads[old_idx].state = ThreadRunState::Ready;
        }
        s.threads[next_idx].state = ThreadRunState::Running;
        s.current_idx = next_idx;
        check_stack_canary(&s.threads[old_idx]);
        set_tss_stack_for(&s.threads[next_idx]);

        let old_ptr = &mut s.threads[old_idx].context as *mut Context;
        let new_ptr = &s.threads[next_idx].context as *const Context;
        drop(sched);
        unsafe { switch_context(old_ptr, new_ptr) };
    });
}

/// Marks the current thread terminated and switches away from it for good.
/// Never returns.
pub fn exit_current_thread() -> ! {
    loop {
        crate::irq::with_irqs_disabled(|| {
            let mut sched = SCHEDULER.lock();
            let s = sched.as_mut().expect("scheduler not initialized");
            let idx = s.current_idx;
            s.threads[idx].state = ThreadRunState::Terminated;

            if let Some(next_idx) = s.next_ready() {
                s.threads[next_idx].state = ThreadRunState::Running;
                s.current_idx = next_idx;
                check_stack_canary(&s.threads[idx]);
                set_tss_stack_for(&s.threads[next_idx]);
                let old_ptr = &mut s.threads[idx].context as *mut Context;
                let new_ptr = &s.threads[next_idx].context as *const Context;
                drop(sched);
                unsafe { switch_context(old_ptr, new_ptr) };
            }
        });
    }
}

/// Checks the outgoing thread's canary word (written once at stack
/// allocation) right before switching away from it, catching a kernel
/// stack overflow at the point it happened rather than whenever the
/// corrupted memory below it is next read. The boot/idle thread has no
/// allocated stack to check.
fn check_stack_canary(thread: &KernelThread) {
    if !ENABLE_STACK_CANARIES || thread.stack_base == 0 {
        return;
    }
    let canary = unsafe { (thread.stack_base as *const u64).read_volatile() };
    if canary != STACK_CANARY {
        panic!("kernel stack overflow on tid {}", thread.tid);
    }
}

/// Points the TSS's ring-0 stack at the thread being switched to. Every
/// thread that can reach `enter_user_mode` owns a real kernel stack
/// (`spawn_kernel_thread`'s allocation); the boot/idle thread never runs
/// user code, so it has none to hand the hardware and is left alone.
fn set_tss_stack_for(thread: &KernelThread) {
    if thread.stack_size != 0 {
        let stack_top = (thread.stack_base + thread.stack_size) & !0xF;
        crate::gdt::set_kernel_stack(stack_top as u32);
    }
}

const USER_CODE_SELECTOR: u32 = 0x1B;
const USER_DATA_SELECTOR: u32 = 0x23;
const USER_EFLAGS: u32 = 0x202; // IF set, reserved bit 1 set

global_asm!(
    r#"
.section .text
.global enter_user_mode_asm
// void enter_user_mode_asm(eip: [esp+4], esp: [esp+8])
enter_user_mode_asm:
    mov eax, [esp+4]
    mov ecx, [esp+8]

    mov dx, 0x23
    mov ds, dx
    mov es, dx
    mov fs, dx
    mov gs, dx

    push 0x23        // SS
    push ecx         // user ESP
    push 0x202       // EFLAGS
    push 0x1B        // CS
    push eax         // EIP
    iretd
"#
);

unsafe extern "C" {
    fn enter_user_mode_asm(eip: u32, esp: u32);
}

/// Drops from ring 0 to ring 3 at `entry_point` with the given user `esp`.
/// Never returns. Called once, by the thread that just finished loading a
/// fresh process or pthread stack.
pub unsafe fn enter_user_mode(entry_point: usize, esp: usize) -> ! {
    unsafe {
        enter_user_mode_asm(entry_point as u32, esp as u32);
    }
    unreachable!("iretd does not return")
}

// ============================================================================
// pthread lifecycle (§4.3)
// ============================================================================

struct PthreadCreateArgs {
    stub: usize,
    func: usize,
    arg: usize,
    pcb: Arc<Process>,
    success: AtomicBool,
    load_done: Semaphore,
}

/// Derives `"<main-name>-<id>"` (§4.3 step 3), truncated to the same width
/// a process name is truncated to.
fn derive_thread_name(main_name: &str, thread_count_id: u32) -> String {
    let full = alloc::format!("{}-{}", main_name, thread_count_id);
    full.chars().take(PROCESS_NAME_MAX).collect()
}

/// `pthread_execute(stub, fn, arg)` (§4.3).
pub fn pthread_execute(stub: usize, func: usize, arg: usize) -> Result<Tid, ()> {
    let pcb = crate::process::current_process().ok_or(())?;

    // Step 2: under the process thread lock, increment user_thread_counter
    // and capture the value as thread_count_id.
    let thread_count_id = {
        let mut threads = pcb.threads.lock();
        threads.user_thread_counter += 1;
        threads.user_thread_counter
    };
    let thread_name = derive_thread_name(&pcb.name, thread_count_id);

    let args = Arc::new(PthreadCreateArgs {
        stub,
        func,
        arg,
        pcb,
        success: AtomicBool::new(false),
        load_done: Semaphore::new(0),
    });

    let spawn_args = args.clone();
    let tid =
        spawn_kernel_thread(&thread_name, move || start_pthread(spawn_args)).map_err(|_| ())?;

    args.load_done.down();

    if args.success.load(Ordering::Acquire) {
        Ok(tid)
    } else {
        Err(())
    }
}

/// `start_pthread(args)` (§4.3), run by the freshly spawned kernel thread.
fn start_pthread(args: Arc<PthreadCreateArgs>) {
    attach_pcb(args.pcb.clone());
    let tid = current_tid();

    let offset_slot = args.pcb.threads.lock().claim_lowest_offset();
    let Some(offset_slot) = offset_slot else {
        args.success.store(false, Ordering::Release);
        args.load_done.up();
        exit_current_thread();
    };

    let upage_va = PHYS_BASE - offset_slot * PAGE_SIZE;

    let mapped = {
        let mut space_guard = args.pcb.address_space.lock();
        let Some(space) = space_guard.as_mut() else {
            return fail_pthread(&args, offset_slot);
        };
        space.alloc_and_map(upage_va, user_flags::RW)
    };
    let Ok(frame) = mapped else {
        return fail_pthread(&args, offset_slot);
    };

    let kpage = crate::mmu::phys_to_virt(frame.addr);
    unsafe { core::ptr::write_bytes(kpage, 0, PAGE_SIZE) };

    // Push arg, fn, then a null return address (§4.3 step 3).
    let mut cursor = PAGE_SIZE;
    cursor -= 4;
    unsafe { (kpage.add(cursor) as *mut u32).write_unaligned(args.arg as u32) };
    cursor -= 4;
    unsafe { (kpage.add(cursor) as *mut u32).write_unaligned(args.func as u32) };
    cursor -= 4;
    unsafe { (kpage.add(cursor) as *mut u32).write_unaligned(0) };
    let user_esp = upage_va + cursor;

    {
        let mut threads = args.pcb.threads.lock();
        threads.user_threads.push(crate::process::UserThreadEntry {
            tid,
            completed: false,
            initialized: true,
            kpage: kpage as usize,
            upage: upage_va,
            offset_slot,
        });
        let join_status = JoinStatus::new(tid);
        threads.join_statuses.push(join_status.clone());
        drop(threads);
        set_current_join_status(join_status);
    }

    args.success.store(true, Ordering::Release);
    args.load_done.up();
    crate::log_thread!(crate::log::Level::Debug, "tid {} started", tid);

    unsafe { enter_user_mode(args.stub, user_esp) }
}

fn fail_pthread(args: &Arc<PthreadCreateArgs>, offset_slot: usize) -> ! {
    args.pcb.threads.lock().release_offset(offset_slot);
    args.success.store(false, Ordering::Release);
    args.load_done.up();
    detach_pcb();
    exit_current_thread();
}

/// `pthread_join(tid)` (§4.3).
pub fn pthread_join(tid: Tid) -> bool {
    let Some(pcb) = crate::process::current_process() else {
        return false;
    };
    pthread_join_on(&pcb, tid)
}

fn pthread_join_on(pcb: &Arc<Process>, tid: Tid) -> bool {
    let join_status = {
        let mut threads = pcb.threads.lock();
        let idx = threads.join_statuses.iter().position(|j| j.tid == tid);
        match idx {
            Some(i) => {
                let js = threads.join_statuses[i].clone();
                if !js.claim() {
                    return false;
                }
                threads.join_statuses.remove(i);
                Some(js)
            }
            None => None,
        }
    };
    let Some(js) = join_status else {
        return false;
    };
    js.sema.down();
    crate::log_thread!(crate::log::Level::Debug, "tid {} joined", tid);
    true
}

/// `pthread_exit()` (§4.3), non-main thread. Delegates to
/// `pthread_exit_main` if called on the process's main thread.
pub fn pthread_exit() -> ! {
    let tid = current_tid();
    let Some(pcb) = crate::process::current_process() else {
        exit_current_thread();
    };

    if tid == pcb.main_tid {
        pthread_exit_main(&pcb);
    }

    let (kpage, offset_slot) = {
        let mut threads = pcb.threads.lock();
        let idx = threads.user_threads.iter().position(|e| e.tid == tid);
        match idx {
            Some(i) => {
                let entry = threads.user_threads.remove(i);
                (entry.kpage, entry.offset_slot)
            }
            None => (0, 0),
        }
    };

    if kpage != 0 {
        let upage_va = PHYS_BASE - offset_slot * PAGE_SIZE;
        if let Some(space) = pcb.address_space.lock().as_mut() {
            let _ = space.unmap_page(upage_va);
        }
        pcb.threads.lock().release_offset(offset_slot);
    }

    if let Some(js) = current_join_status() {
        js.sema.up();
    }

    detach_pcb();
    exit_current_thread();
}

/// `pthread_exit_main()` (§4.3): the main thread waits for every peer
/// before the process itself tears down.
fn pthread_exit_main(pcb: &Arc<Process>) -> ! {
    let my_tid = pcb.main_tid;

    if let Some(js) = current_join_status() {
        js.sema.up();
    }

    loop {
        let next = {
            let threads = pcb.threads.lock();
            threads.join_statuses.iter().find(|j| j.tid != my_tid).map(|j| j.tid)
        };
        match next {
            Some(tid) => {
                pthread_join_on(pcb, tid);
            }
            None => break,
        }
    }

    crate::process::clear_sync_tables(pcb);

    let main_entry = {
        let mut threads = pcb.threads.lock();
        let idx = threads.user_threads.iter().position(|e| e.tid == my_tid);
        idx.map(|i| threads.user_threads.remove(i))
    };
    if let Some(entry) = main_entry {
        let upage_va = PHYS_BASE - entry.offset_slot * PAGE_SIZE;
        if let Some(space) = pcb.address_space.lock().as_mut() {
            let _ = space.unmap_page(upage_va);
        }
        pcb.threads.lock().release_offset(entry.offset_slot);
    }

    crate::process::process_exit(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread(tid: Tid, state: ThreadRunState) -> KernelThread {
        KernelThread {
            tid,
            name: String::from("test"),
            context: Context::zero(),
            stack_base: 0,
            stack_size: 0,
            state,
            pcb: None,
            join_status: None,
        }
    }

    #[test]
    fn derive_thread_name_truncates_to_process_name_max() {
        let long_main = "a".repeat(PROCESS_NAME_MAX);
        let name = derive_thread_name(&long_main, 3);
        assert_eq!(name.len(), PROCESS_NAME_MAX);
        assert!(name.starts_with("aaa"));

        assert_eq!(derive_thread_name("main", 1), "main-1");
    }

    #[test]
    fn scheduler_new_has_only_the_running_boot_thread() {
        let sched = Scheduler::new();
        assert_eq!(sched.threads.len(), 1);
        assert_eq!(sched.threads[0].tid, 0);
        assert_eq!(sched.threads[0].state, ThreadRunState::Running);
        assert!(sched.next_ready().is_none());
    }

    #[test]
    fn next_ready_skips_running_and_terminated_threads() {
        let mut sched = Scheduler::new();
        sched.push(thread(1, ThreadRunState::Terminated)).unwrap();
        sched.push(thread(2, ThreadRunState::Ready)).unwrap();
        sched.push(thread(3, ThreadRunState::Ready)).unwrap();

        assert_eq!(sched.next_ready(), Some(1)); // tid 2, index 1
    }

    #[test]
    fn next_ready_round_robins_past_current() {
        let mut sched = Scheduler::new();
        sched.push(thread(1, ThreadRunState::Ready)).unwrap();
        sched.push(thread(2, ThreadRunState::Ready)).unwrap();
        sched.current_idx = 1;

        // From index 1, the next ready thread wraps to index 2 before
        // index 0 (the boot thread, not Ready).
        assert_eq!(sched.next_ready(), Some(2));
    }

    #[test]
    fn next_ready_none_when_nothing_is_ready() {
        let mut sched = Scheduler::new();
        sched.push(thread(1, ThreadRunState::Terminated)).unwrap();
        assert!(sched.next_ready().is_none());
    }

    #[test]
    fn index_of_finds_pushed_thread() {
        let mut sched = Scheduler::new();
        sched.push(thread(5, ThreadRunState::Ready)).unwrap();
        assert_eq!(sched.index_of(5), Some(1));
        assert_eq!(sched.index_of(99), None);
    }

    #[test]
    fn push_rejects_beyond_max_threads() {
        let mut sched = Scheduler::new();
        for tid in 1..MAX_THREADS as Tid {
            sched.push(thread(tid, ThreadRunState::Ready)).unwrap();
        }
        assert_eq!(sched.threads.len(), MAX_THREADS);
        assert!(sched.push(thread(MAX_THREADS as Tid, ThreadRunState::Ready)).is_err());
    }
}

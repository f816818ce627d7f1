//! Per-subsystem logging (§10.1)
//!
//! A thin wrapper over `console::print` that tags each line with a
//! subsystem prefix and filters by `config::LOG_LEVEL`, mirroring the
//! `config::SYSCALL_DEBUG_INFO_ENABLED` style toggle used elsewhere to gate
//! verbose output.

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
}

/// Subsystem a log line originates from, printed as `[proc]`/`[thread]`/
/// `[load]`/`[syscall]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    Proc,
    Thread,
    Load,
    Syscall,
}

impl Subsystem {
    pub fn tag(self) -> &'static str {
        match self {
            Subsystem::Proc => "proc",
            Subsystem::Thread => "thread",
            Subsystem::Load => "load",
            Subsystem::Syscall => "syscall",
        }
    }
}

/// True if `level` clears the `config::LOG_LEVEL` gate.
pub fn enabled(level: Level) -> bool {
    level >= crate::config::LOG_LEVEL
}

/// Prints `[subsystem] message` through `console::print` if `level` clears
/// the `config::LOG_LEVEL` gate. Built on `safe_print!`'s fixed-size stack
/// buffer, so it is safe to call from anywhere the process thread lock is
/// already held.
#[macro_export]
macro_rules! log {
    ($level:expr, $subsystem:expr, $($arg:tt)*) => {{
        if $crate::log::enabled($level) {
            $crate::safe_print!(128, "[{}] {}\n", $subsystem.tag(), format_args!($($arg)*));
        }
    }};
}

/// `log_proc!(Level::Info, "...")`, and the `log_thread!`/`log_load!`/
/// `log_syscall!` siblings below, are the call sites §10.1 names: process
/// create/exit, thread create/join, ELF load failures, syscall tracing.
#[macro_export]
macro_rules! log_proc {
    ($level:expr, $($arg:tt)*) => {
        $crate::log!($level, $crate::log::Subsystem::Proc, $($arg)*)
    };
}

#[macro_export]
macro_rules! log_thread {
    ($level:expr, $($arg:tt)*) => {
        $crate::log!($level, $crate::log::Subsystem::Thread, $($arg)*)
    };
}

#[macro_export]
macro_rules! log_load {
    ($level:expr, $($arg:tt)*) => {
        $crate::log!($level, $crate::log::Subsystem::Load, $($arg)*)
    };
}

#[macro_export]
macro_rules! log_syscall {
    ($level:expr, $($arg:tt)*) => {
        $crate::log!($level, $crate::log::Subsystem::Syscall, $($arg)*)
    };
}

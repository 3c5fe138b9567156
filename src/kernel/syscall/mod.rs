//! `int 0x80` syscall layer: dispatch table, argument marshalling, and
//! the errno mapping back to the trap frame (spec §4.7).
//!
//! [`crate::interrupt::dispatch`] is the only caller: it builds a
//! [`SyscallArgs`] from the trap frame's EAX/EBX/ECX/EDX/ESI and writes
//! whatever [`dispatch`] returns back into the saved EAX.

use crate::arch::x86::pit;
use crate::common::result::KernelError;
use crate::common::types::Pid;
use crate::kernel::driver::console;
use crate::kernel::mm::VirtAddr;
use crate::kernel::process::lifecycle;
use crate::kernel::process::PROCESS_TABLE;
use crate::kernel::scheduler;
use spin::Mutex;

/// Call numbers of the initial set (spec §4.7 table).
pub const SYS_EXIT: u32 = 0;
pub const SYS_WRITE: u32 = 1;
pub const SYS_GETPID: u32 = 2;
pub const SYS_READ: u32 = 3;
pub const SYS_OPEN: u32 = 4;
pub const SYS_CLOSE: u32 = 5;
pub const SYS_SLEEP: u32 = 6;
pub const SYS_YIELD: u32 = 7;

/// Highest call number with a real handler; anything above this is
/// `invalid_syscall` (spec §8 invariant 9: dispatch is total).
const MAX_KNOWN_SYSCALL: u32 = SYS_YIELD;

const MAX_WRITE_COUNT: u32 = 4096;
const MAX_SLEEP_MS: u32 = 60_000;
const FD_STDOUT: u32 = 1;
const PAGE_MASK: u32 = crate::kernel::mm::PAGE_SIZE - 1;

/// The four general-purpose arguments a syscall may carry, pulled
/// straight out of EBX/ECX/EDX/ESI by the trap handler (spec §4.7
/// "Entry": "up to five arguments in EBX, ECX, EDX, ESI [and EDI]" —
/// the initial call set never needs a fifth).
#[derive(Debug, Clone, Copy)]
pub struct SyscallArgs {
    pub number: u32,
    pub arg0: u32,
    pub arg1: u32,
    pub arg2: u32,
    pub arg3: u32,
}

/// Per-call and total invocation counters (spec §4.7 "Statistics"),
/// indexed by call number 0..=[`MAX_KNOWN_SYSCALL`] plus one bucket for
/// everything that misses the table.
struct Stats {
    per_call: [u32; MAX_KNOWN_SYSCALL as usize + 2],
    total: u32,
}

const UNKNOWN_BUCKET: usize = MAX_KNOWN_SYSCALL as usize + 1;

static STATS: Mutex<Stats> = Mutex::new(Stats {
    per_call: [0; MAX_KNOWN_SYSCALL as usize + 2],
    total: 0,
});

fn record(number: u32) {
    let mut stats = STATS.lock();
    stats.total += 1;
    let bucket = if number <= MAX_KNOWN_SYSCALL {
        number as usize
    } else {
        UNKNOWN_BUCKET
    };
    stats.per_call[bucket] += 1;
}

/// Snapshot of (per-call count for `number`, total calls so far), for
/// diagnostics and the scenario test suite (spec §4.7 "Statistics").
#[must_use]
pub fn call_count(number: u32) -> u32 {
    let stats = STATS.lock();
    let bucket = if number <= MAX_KNOWN_SYSCALL {
        number as usize
    } else {
        UNKNOWN_BUCKET
    };
    stats.per_call[bucket]
}

#[must_use]
pub fn total_calls() -> u32 {
    STATS.lock().total
}

/// Route one `int 0x80` trap to its handler and return the value to
/// place in the caller's EAX. Never panics (spec §8 invariant 9):
/// every call number either reaches a real handler or falls through to
/// `invalid_syscall`.
pub fn dispatch(caller: Pid, args: &SyscallArgs) -> i32 {
    record(args.number);

    if !PROCESS_TABLE.lock().contains_key(&caller) && !caller.is_idle() {
        return KernelError::NoSuchProcess.errno().unwrap_or(-1);
    }

    match args.number {
        SYS_EXIT => lifecycle::exit(args.arg0 as i32),
        SYS_WRITE => sys_write(caller, args.arg0, args.arg1, args.arg2),
        SYS_GETPID => caller.get() as i32,
        SYS_READ | SYS_OPEN | SYS_CLOSE => KernelError::InvalidSyscall.errno().unwrap_or(-1),
        SYS_SLEEP => sys_sleep(args.arg0),
        SYS_YIELD => sys_yield(),
        _ => KernelError::InvalidSyscall.errno().unwrap_or(-1),
    }
}

/// spec §4.7 `write`: only fd 1 is backed; `count == 0` is a no-op
/// success, `count` over 4096 is rejected outright, and the buffer must
/// not cross a page boundary (the source's single-page restriction,
/// kept per spec §9 "open questions" rather than the stricter
/// multi-page design).
fn sys_write(caller: Pid, fd: u32, buf_va: u32, count: u32) -> i32 {
    if fd != FD_STDOUT {
        return KernelError::InvalidParameter.errno().unwrap_or(-2);
    }
    if count == 0 {
        return 0;
    }
    if count > MAX_WRITE_COUNT {
        return KernelError::InvalidParameter.errno().unwrap_or(-2);
    }

    let last_byte = match buf_va.checked_add(count - 1) {
        Some(end) => end,
        None => return KernelError::InvalidAddress.errno().unwrap_or(-6),
    };
    if (buf_va & !PAGE_MASK) != (last_byte & !PAGE_MASK) {
        return KernelError::InvalidAddress.errno().unwrap_or(-6);
    }

    let mut table = PROCESS_TABLE.lock();
    let Some(pcb) = table.get_mut(&caller) else {
        return KernelError::NoSuchProcess.errno().unwrap_or(-4);
    };

    let page_base = VirtAddr::new(buf_va & !PAGE_MASK);
    let Some(phys_page) = pcb.address_space.translate(page_base) else {
        return KernelError::InvalidAddress.errno().unwrap_or(-6);
    };
    drop(table);

    let offset = buf_va & PAGE_MASK;
    let kernel_alias = crate::kernel::mm::vmm::KERNEL_VIRT_BASE + phys_page.as_u32();
    let src = (kernel_alias + offset) as *const u8;
    let bytes = unsafe { core::slice::from_raw_parts(src, count as usize) };
    console::write_user_bytes(bytes);

    count as i32
}

/// spec §4.7 `sleep`: rejects anything over [`MAX_SLEEP_MS`], otherwise
/// busy-waits against the tick counter. The busy-wait has to re-enable
/// interrupts for its duration — the timer that advances `pit::ticks()`
/// is itself gated on IF, so holding interrupts off here (the default
/// for a handler body, spec §5) would make the wait un-satisfiable.
fn sys_sleep(ms: u32) -> i32 {
    if ms > MAX_SLEEP_MS {
        return KernelError::InvalidParameter.errno().unwrap_or(-2);
    }
    let ticks_to_wait = u64::from(ms) * u64::from(pit::TIMER_HZ) / 1000;
    let deadline = pit::ticks() + ticks_to_wait;
    crate::arch::x86::cpu::enable_interrupts();
    while pit::ticks() < deadline {
        crate::arch::x86::cpu::halt();
    }
    crate::arch::x86::cpu::disable_interrupts();
    0
}

/// spec §4.7 `yield`: voluntary context switch, no priority penalty
/// (§4.6 "interactive boost": no demotion on voluntary block).
fn sys_yield() -> i32 {
    scheduler::relinquish_current();
    scheduler::schedule();
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_call_number_is_invalid_syscall_and_counted() {
        let before = total_calls();
        let args = SyscallArgs { number: 999, arg0: 0, arg1: 0, arg2: 0, arg3: 0 };
        let result = dispatch(Pid::IDLE, &args);
        assert_eq!(result, -1);
        assert_eq!(total_calls(), before + 1);
        assert_eq!(call_count(999), call_count(UNKNOWN_BUCKET as u32));
    }

    #[test]
    fn write_rejects_oversize_count() {
        let args = SyscallArgs {
            number: SYS_WRITE,
            arg0: FD_STDOUT,
            arg1: 0x1000,
            arg2: MAX_WRITE_COUNT + 1,
            arg3: 0,
        };
        assert_eq!(dispatch(Pid::IDLE, &args), -2);
    }

    #[test]
    fn write_zero_count_is_a_no_op_success() {
        assert_eq!(sys_write(Pid::IDLE, FD_STDOUT, 0x1000, 0), 0);
    }

    #[test]
    fn sleep_rejects_too_long_a_duration() {
        assert_eq!(sys_sleep(MAX_SLEEP_MS + 1), -2);
    }

    #[test]
    fn getpid_reflects_the_caller() {
        let args = SyscallArgs { number: SYS_GETPID, arg0: 0, arg1: 0, arg2: 0, arg3: 0 };
        assert_eq!(dispatch(Pid::IDLE, &args), 0);
    }

    #[test]
    fn unregistered_non_idle_caller_is_no_such_process() {
        let args = SyscallArgs { number: SYS_GETPID, arg0: 0, arg1: 0, arg2: 0, arg3: 0 };
        assert_eq!(dispatch(Pid::new(4242), &args), -4);
    }
}

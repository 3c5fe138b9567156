//! Multi-level feedback queue scheduler (spec §4.6).
//!
//! Five FIFO ready queues. A process demotes a level every time it
//! exhausts its quantum and is promoted back up by aging, so CPU-bound
//! work settles at the bottom while interactive work that blocks before
//! its slice runs out stays near the top.

use crate::arch::x86::gdt;
use crate::arch::x86::context;
use crate::common::types::{Pid, Priority};
use crate::kernel::process::{Privilege, ProcessControlBlock, ProcessState, PROCESS_TABLE};
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use spin::Mutex;

/// Quantum for level `k`, in timer ticks at 100 Hz (spec: 10/20/40/80/160 ms).
const QUANTUM_TICKS: [u32; Priority::LEVELS] = [1, 2, 4, 8, 16];

/// Ticks of accumulated wait time before a ready process ages up a level.
const AGING_THRESHOLD: u32 = 1000;

#[must_use]
pub fn slice_for_level(level: Priority) -> u32 {
    QUANTUM_TICKS[level.as_usize()]
}

struct Queues {
    levels: [VecDeque<Pid>; Priority::LEVELS],
    current: Option<Pid>,
}

impl Queues {
    const fn new() -> Self {
        Self {
            levels: [VecDeque::new(), VecDeque::new(), VecDeque::new(), VecDeque::new(), VecDeque::new()],
            current: None,
        }
    }
}

static QUEUES: Mutex<Queues> = Mutex::new(Queues::new());

/// Register a freshly created PCB and enqueue it at `priority_level`
/// (spec: arrival at queue 0 for create/fork; fork enqueues the child
/// at the parent's current level instead).
pub fn admit(pcb: Box<ProcessControlBlock>, level: Priority) {
    let pid = pcb.pid;
    PROCESS_TABLE.lock().insert(pid, pcb);
    QUEUES.lock().levels[level.as_usize()].push_back(pid);
}

/// Remove a terminated process's pid from every ready queue it might
/// still be sitting in (defensive; normally a terminated process is
/// never re-enqueued).
fn purge_from_queues(queues: &mut Queues, pid: Pid) {
    for level in &mut queues.levels {
        level.retain(|&p| p != pid);
    }
}

/// The pid of the process scheduled to run, if any (`None` means idle).
#[must_use]
pub fn current_pid() -> Option<Pid> {
    QUEUES.lock().current
}

/// spec §4.6 "Selection": scan queues 0..4, dequeue the first non-empty
/// head. `None` means every queue is empty and the idle process runs.
fn select_next(queues: &mut Queues) -> Option<Pid> {
    for level in &mut queues.levels {
        if let Some(pid) = level.pop_front() {
            return Some(pid);
        }
    }
    None
}

/// Timer-tick bookkeeping (spec §4.6 "Tick"): decrement the running
/// process's slice, demote it to the tail of the next level if it hits
/// zero, and run one aging pass. Returns `true` if a context switch is
/// now due; the IRQ trampoline performs the actual switch on its return
/// path, never from inside the interrupt body (spec §4.4).
pub fn on_timer_tick() -> bool {
    let mut queues = QUEUES.lock();
    let mut switch_needed = false;

    match queues.current {
        Some(pid) if pid.is_idle() => {
            // Always give a newly-ready process the chance to preempt idle.
            switch_needed = true;
        }
        Some(pid) => {
            let mut table = PROCESS_TABLE.lock();
            if let Some(pcb) = table.get_mut(&pid) {
                pcb.total_cpu_time += 1;
                if pcb.time_slice_remaining > 0 {
                    pcb.time_slice_remaining -= 1;
                }
                if pcb.time_slice_remaining == 0 {
                    let new_level = pcb.priority_level.demote();
                    pcb.priority_level = new_level;
                    pcb.time_slice_remaining = slice_for_level(new_level);
                    pcb.state = ProcessState::Ready;
                    queues.levels[new_level.as_usize()].push_back(pid);
                    queues.current = None;
                    switch_needed = true;
                }
            }
        }
        None => switch_needed = true,
    }

    run_aging_pass(&mut queues);
    switch_needed
}

/// spec §4.6 "Aging": every ready process at level 1..4 whose
/// `wait_time` exceeds [`AGING_THRESHOLD`] moves up one level, with its
/// slice and wait_time reset. Processes not currently scheduled accrue
/// wait time here; the running process does not.
fn run_aging_pass(queues: &mut Queues) {
    let mut table = PROCESS_TABLE.lock();
    let running = queues.current;

    for level in 0..Priority::LEVELS {
        let pids: alloc::vec::Vec<Pid> = queues.levels[level].iter().copied().collect();
        for pid in pids {
            if Some(pid) == running {
                continue;
            }
            let Some(pcb) = table.get_mut(&pid) else { continue };
            pcb.wait_time += 1;
            if level > 0 && pcb.wait_time > AGING_THRESHOLD {
                queues.levels[level].retain(|&p| p != pid);
                let new_level = pcb.priority_level.promote();
                pcb.priority_level = new_level;
                pcb.time_slice_remaining = slice_for_level(new_level);
                pcb.wait_time = 0;
                queues.levels[new_level.as_usize()].push_back(pid);
            }
        }
    }
}

/// Promote `pid` straight to level 0 without waiting for aging (spec
/// §4.6 "interactive boost": "an external call may promote an
/// interactive process to level 0").
pub fn boost_to_highest(pid: Pid) {
    let mut queues = QUEUES.lock();
    for level in &mut queues.levels {
        level.retain(|&p| p != pid);
    }
    let mut table = PROCESS_TABLE.lock();
    if let Some(pcb) = table.get_mut(&pid) {
        pcb.priority_level = Priority::HIGHEST;
        pcb.time_slice_remaining = slice_for_level(Priority::HIGHEST);
    }
    drop(table);
    queues.levels[Priority::HIGHEST.as_usize()].push_back(pid);
}

/// Take the running process out of rotation because it blocked
/// voluntarily (wait/sleep) or exited; does not touch its priority
/// level (spec §4.6 "interactive boost": no demotion on voluntary
/// block).
pub fn relinquish_current() {
    QUEUES.lock().current = None;
}

/// Re-admit a blocked process as ready at its existing priority level.
pub fn wake(pid: Pid) {
    let level = {
        let table = PROCESS_TABLE.lock();
        table.get(&pid).map(|p| p.priority_level)
    };
    let Some(level) = level else { return };
    let mut queues = QUEUES.lock();
    purge_from_queues(&mut queues, pid);
    queues.levels[level.as_usize()].push_back(pid);
}

/// Drop `pid` out of scheduling entirely (process exit).
pub fn retire(pid: Pid) {
    let mut queues = QUEUES.lock();
    purge_from_queues(&mut queues, pid);
    if queues.current == Some(pid) {
        queues.current = None;
    }
}

/// spec §4.6 "Context switch": select the next process (or idle),
/// perform steps 1-3 (same-process short circuit, CR3 reload, TSS
/// ESP0), then hand off to the assembly trampolines for steps 4-5.
/// Must run with interrupts disabled; never called from inside a
/// timer-IRQ body (§4.4), only on handler-return paths and from
/// `yield`/`sleep`/`wait`/`exit`.
pub fn schedule() {
    crate::arch::x86::cpu::without_interrupts(|| {
        let from_pid = {
            let queues = QUEUES.lock();
            queues.current
        };

        let to_pid = {
            let mut queues = QUEUES.lock();
            match select_next(&mut queues) {
                Some(pid) => {
                    queues.current = Some(pid);
                    pid
                }
                None => {
                    queues.current = None;
                    Pid::IDLE
                }
            }
        };

        if Some(to_pid) == from_pid {
            return;
        }

        let mut table = PROCESS_TABLE.lock();
        if let Some(pcb) = table.get_mut(&to_pid) {
            pcb.state = ProcessState::Running;
            pcb.address_space.activate();
            if pcb.privilege == Privilege::User {
                gdt::set_kernel_stack(pcb.kernel_stack_base + pcb.kernel_stack_size);
            }
        }
        drop(table);

        let from_esp_slot: *mut u32 = match from_pid {
            Some(pid) if !pid.is_idle() => {
                let mut table = PROCESS_TABLE.lock();
                table
                    .get_mut(&pid)
                    .map_or_else(idle_esp_slot, |pcb| core::ptr::addr_of_mut!(pcb.registers.esp))
            }
            _ => idle_esp_slot(),
        };

        let to_esp = if to_pid.is_idle() {
            idle_entry_esp()
        } else {
            let table = PROCESS_TABLE.lock();
            table.get(&to_pid).map_or(idle_entry_esp(), |pcb| pcb.registers.esp)
        };

        unsafe {
            context::switch_to(from_esp_slot, to_esp);
        }
    });
}

/// The idle process has no PCB; its saved stack pointer lives here
/// instead (spec §4.6 "Idle": pid 0, kernel privilege, `hlt` loop).
static IDLE_ESP: Mutex<u32> = Mutex::new(0);

fn idle_esp_slot() -> *mut u32 {
    let mut guard = IDLE_ESP.lock();
    core::ptr::addr_of_mut!(*guard)
}

fn idle_entry_esp() -> u32 {
    *IDLE_ESP.lock()
}

/// Install the idle process's initial stack pointer. Called once during
/// boot after the idle kernel stack has been carved out and primed with
/// [`context::init_kernel_stack`].
pub fn set_idle_esp(esp: u32) {
    *IDLE_ESP.lock() = esp;
}

/// Force `current` directly, bypassing `schedule`'s real context switch
/// (no CPU is available to switch to in a hosted test process). Lets
/// scenario tests drive [`on_timer_tick`]'s demotion/aging bookkeeping
/// against a chosen pid as a fake tick source (spec §8 scenarios S4/S5).
#[cfg(test)]
pub(crate) fn set_current_for_test(pid: Option<Pid>) {
    QUEUES.lock().current = pid;
}

/// spec §8 invariant 5: `running_count ∈ {0, 1}` and the sum of queue
/// sizes + running + blocked + terminated equals the live PCB count.
/// Exposed for the scenario test suite.
#[must_use]
pub fn ready_queue_lengths() -> [usize; Priority::LEVELS] {
    let queues = QUEUES.lock();
    let mut lens = [0usize; Priority::LEVELS];
    for (i, level) in queues.levels.iter().enumerate() {
        lens[i] = level.len();
    }
    lens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantum_table_matches_spec_ms_values() {
        // 10/20/40/80/160 ms at 100 Hz == 1/2/4/8/16 ticks.
        assert_eq!(QUANTUM_TICKS, [1, 2, 4, 8, 16]);
    }

    #[test]
    fn select_next_prefers_lower_numbered_queue() {
        let mut queues = Queues::new();
        queues.levels[2].push_back(Pid::new(5));
        queues.levels[0].push_back(Pid::new(3));
        assert_eq!(select_next(&mut queues), Some(Pid::new(3)));
        assert_eq!(select_next(&mut queues), Some(Pid::new(5)));
        assert_eq!(select_next(&mut queues), None);
    }
}

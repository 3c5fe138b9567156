//! Process control block, register context, and the global process
//! table (spec §3 "PCB"/"RegisterContext"/"FileDescriptor", §4.5).

pub mod lifecycle;

use crate::arch::x86::gdt::{KERNEL_CODE_SELECTOR, USER_CODE_SELECTOR, USER_DATA_SELECTOR};
use crate::common::types::{Pid, Priority};
use crate::kernel::mm::AddressSpace;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

pub const MAX_FILE_DESCRIPTORS: usize = 256;
pub const MAX_CHILDREN: usize = 64;
pub const PROCESS_NAME_LEN: usize = 32;

/// spec §3 "ProcessState": created -> ready <-> running -> {blocked,
/// terminated -> zombie}.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Created,
    Ready,
    Running,
    Blocked,
    Terminated,
    Zombie,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Kernel,
    User,
}

/// spec §3 "RegisterContext": exactly the state needed to resume a
/// process. `user_esp`/`user_ss` are only meaningful for user
/// processes; kernel processes never populate them.
#[derive(Debug, Clone, Copy)]
pub struct RegisterContext {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    pub eflags: u32,
    pub cs: u32,
    pub user_esp: u32,
    pub user_ss: u32,
}

const EFLAGS_IF: u32 = 1 << 9;
const EFLAGS_RESERVED_BIT1: u32 = 1 << 1;

impl RegisterContext {
    /// A fresh kernel-mode context: `IF=1`, reserved bit set, CS = the
    /// ring-0 code selector (spec §4.5 "Create (kernel process)").
    #[must_use]
    pub fn kernel_entry(eip: u32, esp: u32) -> Self {
        Self {
            eax: 0,
            ebx: 0,
            ecx: 0,
            edx: 0,
            esi: 0,
            edi: 0,
            ebp: 0,
            esp,
            eip,
            eflags: EFLAGS_IF | EFLAGS_RESERVED_BIT1,
            cs: u32::from(KERNEL_CODE_SELECTOR),
            user_esp: 0,
            user_ss: 0,
        }
    }

    /// A fresh user-mode context (spec §4.5 "Create (user process)").
    #[must_use]
    pub fn user_entry(entry: u32, kernel_esp: u32, user_esp: u32) -> Self {
        Self {
            eax: 0,
            ebx: 0,
            ecx: 0,
            edx: 0,
            esi: 0,
            edi: 0,
            ebp: 0,
            esp: kernel_esp,
            eip: entry,
            eflags: EFLAGS_IF | EFLAGS_RESERVED_BIT1,
            cs: u32::from(USER_CODE_SELECTOR),
            user_esp,
            user_ss: u32::from(USER_DATA_SELECTOR),
        }
    }

    #[must_use]
    pub fn is_user(&self) -> bool {
        self.cs == u32::from(USER_CODE_SELECTOR)
    }
}

/// spec §3 "FileDescriptor": opaque beyond duplicate/close semantics.
#[derive(Debug, Clone, Copy)]
pub struct FileDescriptor {
    pub handle: Option<u32>,
    pub flags: u32,
    pub position: u64,
    pub ref_count: u32,
}

impl FileDescriptor {
    const EMPTY: Self = Self {
        handle: None,
        flags: 0,
        position: 0,
        ref_count: 0,
    };
}

/// Process control block (spec §3 "PCB").
pub struct ProcessControlBlock {
    pub pid: Pid,
    pub name: [u8; PROCESS_NAME_LEN],
    pub name_len: usize,
    pub state: ProcessState,
    pub privilege: Privilege,
    pub registers: RegisterContext,
    pub address_space: AddressSpace,
    pub kernel_stack_base: u32,
    pub kernel_stack_size: u32,
    pub priority_level: Priority,
    pub time_slice_remaining: u32,
    pub wait_time: u32,
    pub total_cpu_time: u64,
    pub last_scheduled: u64,
    pub parent_pid: Option<Pid>,
    pub exit_code: i32,
    pub fd_table: [FileDescriptor; MAX_FILE_DESCRIPTORS],
    pub child_pids: [Option<Pid>; MAX_CHILDREN],
    pub waiting_for_child: Option<Pid>,
}

impl ProcessControlBlock {
    pub fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let len = bytes.len().min(PROCESS_NAME_LEN);
        self.name[..len].copy_from_slice(&bytes[..len]);
        self.name[len..].fill(0);
        self.name_len = len;
    }

    #[must_use]
    pub fn name_str(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len]).unwrap_or("?")
    }

    /// Insert `child` into the first free slot of `child_pids`.
    ///
    /// # Panics
    /// If the table is already full ([`MAX_CHILDREN`] live children is
    /// far beyond any scenario this kernel schedules).
    pub fn add_child(&mut self, child: Pid) {
        let slot = self
            .child_pids
            .iter_mut()
            .find(|c| c.is_none())
            .expect("child_pids table exhausted");
        *slot = Some(child);
    }

    #[must_use]
    pub fn children(&self) -> impl Iterator<Item = Pid> + '_ {
        self.child_pids.iter().filter_map(|c| *c)
    }
}

static NEXT_PID: AtomicU32 = AtomicU32::new(Pid::INIT.get() + 1);

/// Allocate the next monotonically increasing pid (spec §3 invariant
/// "PIDs are monotonically increasing").
#[must_use]
pub fn next_pid() -> Pid {
    Pid::new(NEXT_PID.fetch_add(1, Ordering::Relaxed))
}

/// The single owner of every live PCB (spec §9 "the scheduler or a
/// process table is the single owner of all live PCBs"). Looked up by
/// pid; nothing outside this module holds a PCB directly.
pub static PROCESS_TABLE: Mutex<BTreeMap<Pid, Box<ProcessControlBlock>>> =
    Mutex::new(BTreeMap::new());

pub fn new_fd_table() -> [FileDescriptor; MAX_FILE_DESCRIPTORS] {
    [FileDescriptor::EMPTY; MAX_FILE_DESCRIPTORS]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::mm::AddressSpace;

    fn test_pcb(pid: u32) -> ProcessControlBlock {
        ProcessControlBlock {
            pid: Pid::new(pid),
            name: [0; PROCESS_NAME_LEN],
            name_len: 0,
            state: ProcessState::Ready,
            privilege: Privilege::Kernel,
            registers: RegisterContext::kernel_entry(0, 0),
            address_space: AddressSpace::for_test(),
            kernel_stack_base: 0,
            kernel_stack_size: 0,
            priority_level: Priority::HIGHEST,
            time_slice_remaining: 0,
            wait_time: 0,
            total_cpu_time: 0,
            last_scheduled: 0,
            parent_pid: None,
            exit_code: 0,
            fd_table: new_fd_table(),
            child_pids: [None; MAX_CHILDREN],
            waiting_for_child: None,
        }
    }

    #[test]
    fn kernel_entry_has_if_set_and_kernel_cs() {
        let ctx = RegisterContext::kernel_entry(0x1000, 0x2000);
        assert_eq!(ctx.eip, 0x1000);
        assert_eq!(ctx.esp, 0x2000);
        assert_eq!(ctx.cs, u32::from(KERNEL_CODE_SELECTOR));
        assert_ne!(ctx.eflags & EFLAGS_IF, 0);
        assert!(!ctx.is_user());
    }

    #[test]
    fn user_entry_has_user_selectors() {
        let ctx = RegisterContext::user_entry(0x0040_0000, 0x3000, 0xBFFF_FFFC);
        assert_eq!(ctx.cs, u32::from(USER_CODE_SELECTOR));
        assert_eq!(ctx.user_ss, u32::from(USER_DATA_SELECTOR));
        assert_eq!(ctx.user_esp, 0xBFFF_FFFC);
        assert!(ctx.is_user());
    }

    #[test]
    fn set_name_truncates_and_null_pads() {
        let mut pcb = test_pcb(2);
        pcb.set_name("a_very_long_process_name_that_overflows_the_field");
        assert_eq!(pcb.name_len, PROCESS_NAME_LEN);
        pcb.set_name("init");
        assert_eq!(pcb.name_str(), "init");
        assert_eq!(pcb.name[4], 0);
    }

    #[test]
    fn children_iterator_skips_empty_slots() {
        let mut pcb = test_pcb(3);
        pcb.add_child(Pid::new(10));
        pcb.add_child(Pid::new(11));
        let kids: alloc::vec::Vec<Pid> = pcb.children().collect();
        assert_eq!(kids, alloc::vec![Pid::new(10), Pid::new(11)]);
    }

    #[test]
    fn next_pid_is_monotonic() {
        let a = next_pid();
        let b = next_pid();
        assert!(b.get() > a.get());
    }
}

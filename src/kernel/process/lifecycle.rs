//! Process lifecycle operations: create, fork, exec, exit, wait, and the
//! copy-on-write page-fault handler (spec §4.5).

use super::{
    new_fd_table, next_pid, FileDescriptor, Privilege, ProcessControlBlock, ProcessState,
    RegisterContext, PROCESS_TABLE,
};
use crate::arch::x86::context;
use crate::common::result::{KernelError, KernelResult};
use crate::common::types::{Pid, Priority};
use crate::kernel::mm::vmm::{self, AddressSpace, KERNEL_VIRT_BASE};
use crate::kernel::mm::{EntryFlags, Frame, PhysAddr, VirtAddr, FRAME_ALLOCATOR, PAGE_SIZE};
use crate::kernel::scheduler;
use alloc::boxed::Box;

/// Default kernel stack size for every process (spec leaves the exact
/// size unspecified beyond "allocate ... its kernel stack"; 16 KiB is
/// four frames, comfortably above what any handler here recurses into).
pub const KERNEL_STACK_SIZE: u32 = 16 * 1024;
/// Default user stack size (spec §4.5 "Create (user process)").
pub const USER_STACK_SIZE: u32 = 8 * 1024;
/// Top of the user stack region, growing down (spec §4.5 `exec`).
pub const USER_STACK_TOP: u32 = 0xBF00_0000;
/// Base virtual address user code is loaded at.
pub const USER_CODE_BASE: u32 = 0x0040_0000;

fn alloc_kernel_stack() -> KernelResult<u32> {
    let frames = KERNEL_STACK_SIZE / PAGE_SIZE;
    let mut allocator = FRAME_ALLOCATOR.lock();
    let base = allocator
        .alloc_contiguous(frames as usize)
        .ok()
        .flatten()
        .ok_or(KernelError::OutOfMemory)?;
    Ok(KERNEL_VIRT_BASE + base.start_address().as_u32())
}

/// Map `count` freshly allocated, zeroed frames starting at `va` in
/// `space`, with the given page flags.
fn map_fresh_pages(space: &mut AddressSpace, va: u32, count: u32, flags: EntryFlags) -> KernelResult<()> {
    for i in 0..count {
        let frame = FRAME_ALLOCATOR
            .lock()
            .alloc_one()
            .ok_or(KernelError::OutOfMemory)?;
        let page_va = VirtAddr::new(va + i * PAGE_SIZE);
        space
            .map(page_va, frame.start_address(), flags)
            .map_err(|_| KernelError::OutOfMemory)?;
        unsafe {
            crate::kernel::mm::frame::zero_frame(frame, KERNEL_VIRT_BASE);
        }
    }
    Ok(())
}

/// Entry trampoline every freshly created kernel process's stack is
/// primed to "return" into (via [`context::init_kernel_stack`]). Looks
/// up its own pid, runs the requested entry point, and falls through to
/// `exit(0)` if that entry point ever returns instead of calling
/// `exit` itself.
extern "C" fn kernel_process_trampoline() -> ! {
    let pid = scheduler::current_pid().expect("kernel process has no current pid");
    let entry = {
        let table = PROCESS_TABLE.lock();
        table.get(&pid).map(|pcb| pcb.registers.eip)
    };
    if let Some(entry) = entry {
        let entry_fn: extern "C" fn() = unsafe { core::mem::transmute(entry as usize) };
        entry_fn();
    }
    exit(0);
}

/// Entry trampoline for a process's first drop into ring 3: fetches its
/// own user EIP/ESP out of its PCB and hands off to [`context::enter_user_mode`],
/// which never returns.
extern "C" fn user_process_trampoline() -> ! {
    let pid = scheduler::current_pid().expect("user process has no current pid");
    let (eip, user_esp) = {
        let table = PROCESS_TABLE.lock();
        let pcb = table.get(&pid).expect("scheduled pid has no PCB");
        (pcb.registers.eip, pcb.registers.user_esp)
    };
    unsafe { context::enter_user_mode(eip, user_esp) }
}

/// spec §4.5 "Create (kernel process)": PCB + kernel stack, address
/// space with only the high half mapped, ready at level 0.
pub fn create_kernel_process(name: &str, entry: extern "C" fn()) -> KernelResult<Pid> {
    let pid = next_pid();
    let kernel_stack_base = alloc_kernel_stack()?;
    let kernel_stack_top = kernel_stack_base + KERNEL_STACK_SIZE;

    let address_space = vmm::new_kernel_only_address_space().map_err(|_| KernelError::OutOfMemory)?;

    let mut registers = RegisterContext::kernel_entry(entry as u32, kernel_stack_top);
    registers.esp =
        unsafe { context::init_kernel_stack(kernel_stack_top, kernel_process_trampoline) };

    let mut pcb = Box::new(ProcessControlBlock {
        pid,
        name: [0; super::PROCESS_NAME_LEN],
        name_len: 0,
        state: ProcessState::Ready,
        privilege: Privilege::Kernel,
        registers,
        address_space,
        kernel_stack_base,
        kernel_stack_size: KERNEL_STACK_SIZE,
        priority_level: Priority::HIGHEST,
        time_slice_remaining: scheduler::slice_for_level(Priority::HIGHEST),
        wait_time: 0,
        total_cpu_time: 0,
        last_scheduled: 0,
        parent_pid: None,
        exit_code: 0,
        fd_table: new_fd_table(),
        child_pids: [None; super::MAX_CHILDREN],
        waiting_for_child: None,
    });
    pcb.set_name(name);

    scheduler::admit(pcb, Priority::HIGHEST);
    Ok(pid)
}

/// spec §4.5 "Create (user process)": as kernel, plus a user code image
/// and an 8 KiB user stack.
pub fn create_user_process(name: &str, program: &[u8], parent_pid: Option<Pid>) -> KernelResult<Pid> {
    let pid = next_pid();
    let kernel_stack_base = alloc_kernel_stack()?;
    let kernel_stack_top = kernel_stack_base + KERNEL_STACK_SIZE;

    let mut address_space = vmm::new_kernel_only_address_space().map_err(|_| KernelError::OutOfMemory)?;

    let code_pages = program.len().div_ceil(PAGE_SIZE as usize) as u32;
    let code_pages = code_pages.max(1);
    map_fresh_pages(&mut address_space, USER_CODE_BASE, code_pages, EntryFlags::user_rw())?;
    write_program_image(&address_space, USER_CODE_BASE, program);
    address_space
        .change_flags(VirtAddr::new(USER_CODE_BASE), EntryFlags::user_ro())
        .map_err(|_| KernelError::OutOfMemory)?;

    let stack_pages = USER_STACK_SIZE / PAGE_SIZE;
    let stack_base = USER_STACK_TOP - USER_STACK_SIZE;
    map_fresh_pages(&mut address_space, stack_base, stack_pages, EntryFlags::user_rw())?;

    let user_esp = USER_STACK_TOP - 4;
    let mut registers = RegisterContext::user_entry(USER_CODE_BASE, kernel_stack_top, user_esp);
    registers.esp = unsafe { context::init_kernel_stack(kernel_stack_top, user_process_trampoline) };

    let mut pcb = Box::new(ProcessControlBlock {
        pid,
        name: [0; super::PROCESS_NAME_LEN],
        name_len: 0,
        state: ProcessState::Ready,
        privilege: Privilege::User,
        registers,
        address_space,
        kernel_stack_base,
        kernel_stack_size: KERNEL_STACK_SIZE,
        priority_level: Priority::HIGHEST,
        time_slice_remaining: scheduler::slice_for_level(Priority::HIGHEST),
        wait_time: 0,
        total_cpu_time: 0,
        last_scheduled: 0,
        parent_pid,
        exit_code: 0,
        fd_table: new_fd_table(),
        child_pids: [None; super::MAX_CHILDREN],
        waiting_for_child: None,
    });
    pcb.set_name(name);

    if let Some(parent) = parent_pid {
        let mut table = PROCESS_TABLE.lock();
        if let Some(parent_pcb) = table.get_mut(&parent) {
            parent_pcb.add_child(pid);
        }
    }

    scheduler::admit(pcb, Priority::HIGHEST);
    Ok(pid)
}

/// Copy `program` into the already-mapped code pages starting at `base`,
/// through the kernel's high-half alias of the freshly allocated frames
/// (the pages are writable at this point; `create_user_process` makes
/// them read-only afterward).
fn write_program_image(space: &AddressSpace, base: u32, program: &[u8]) {
    let mut written = 0usize;
    while written < program.len() {
        let va = VirtAddr::new(base + written as u32);
        let Some(phys) = space.translate(va) else { break };
        let page_off = va.page_offset() as usize;
        let chunk = (PAGE_SIZE as usize - page_off).min(program.len() - written);
        let dst = (KERNEL_VIRT_BASE + phys.as_u32()) as *mut u8;
        unsafe {
            core::ptr::copy_nonoverlapping(program[written..].as_ptr(), dst, chunk);
        }
        written += chunk;
    }
}

/// spec §4.5 "Fork", the six numbered steps.
pub fn fork(parent_pid: Pid) -> KernelResult<Pid> {
    let child_pid = next_pid();

    let (mut child_registers, address_space, priority_level, name) = {
        let mut table = PROCESS_TABLE.lock();
        let parent = table.get_mut(&parent_pid).ok_or(KernelError::NoSuchProcess)?;
        let address_space = parent
            .address_space
            .clone_for_fork()
            .map_err(|_| KernelError::OutOfMemory)?;
        (parent.registers, address_space, parent.priority_level, parent.name)
    };

    let child_kernel_stack_base = alloc_kernel_stack()?;
    let child_kernel_stack_top = child_kernel_stack_base + KERNEL_STACK_SIZE;
    child_registers.esp = unsafe {
        context::init_kernel_stack(
            child_kernel_stack_top,
            if child_registers.is_user() {
                user_process_trampoline
            } else {
                kernel_process_trampoline
            },
        )
    };
    // Step 5: fork return-value contract.
    child_registers.eax = 0;

    let mut child_fd_table = new_fd_table();
    {
        let mut table = PROCESS_TABLE.lock();
        let parent = table.get_mut(&parent_pid).ok_or(KernelError::NoSuchProcess)?;
        // Step 5: parent observes the child's pid.
        parent.registers.eax = child_pid.get();
        // Step 3: duplicate every present fd, sharing the handle.
        for (i, fd) in parent.fd_table.iter_mut().enumerate() {
            if fd.ref_count > 0 {
                fd.ref_count += 1;
                child_fd_table[i] = *fd;
            }
        }
        // Step 4: link into parent's child_pids.
        parent.add_child(child_pid);
    }

    let mut child = Box::new(ProcessControlBlock {
        pid: child_pid,
        name,
        name_len: name.iter().position(|&b| b == 0).unwrap_or(name.len()),
        state: ProcessState::Ready,
        privilege: if child_registers.is_user() { Privilege::User } else { Privilege::Kernel },
        registers: child_registers,
        address_space,
        kernel_stack_base: child_kernel_stack_base,
        kernel_stack_size: KERNEL_STACK_SIZE,
        priority_level,
        time_slice_remaining: scheduler::slice_for_level(priority_level),
        wait_time: 0,
        total_cpu_time: 0,
        last_scheduled: 0,
        parent_pid: Some(parent_pid),
        exit_code: 0,
        fd_table: child_fd_table,
        child_pids: [None; super::MAX_CHILDREN],
        waiting_for_child: None,
    });

    // Step 6: enqueue at the parent's current priority level.
    scheduler::admit(child, priority_level);
    Ok(child_pid)
}

/// Copy-on-write page-fault handler (spec §4.5 "COW fault"). `va` is the
/// page-aligned faulting address in the current process's address
/// space. Returns `Err` if the fault is not a recoverable COW fault
/// (caller then treats it as fatal).
pub fn handle_cow_fault(space: &mut AddressSpace, va: VirtAddr) -> Result<(), ()> {
    let va = VirtAddr::new(va.page_align_down().as_u32());
    let Some(old_phys) = space.translate(va) else { return Err(()) };

    let new_frame = FRAME_ALLOCATOR.lock().alloc_one().ok_or(())?;
    let src = (KERNEL_VIRT_BASE + old_phys.as_u32()) as *const u8;
    let dst = (KERNEL_VIRT_BASE + new_frame.start_address().as_u32()) as *mut u8;
    unsafe {
        core::ptr::copy_nonoverlapping(src, dst, PAGE_SIZE as usize);
    }

    space.retarget(va, new_frame, EntryFlags::user_rw());
    Ok(())
}

fn close_fd(fd: &mut FileDescriptor) {
    if fd.ref_count > 0 {
        fd.ref_count -= 1;
    }
    if fd.ref_count == 0 {
        *fd = FileDescriptor {
            handle: None,
            flags: 0,
            position: 0,
            ref_count: 0,
        };
    }
}

/// Reap a terminated child: remove it from the process table, free its
/// kernel stack and address space, and detach it from its parent's
/// child list. Returns its exit code.
fn reap(pid: Pid) -> i32 {
    let pcb = PROCESS_TABLE.lock().remove(&pid);
    let Some(mut pcb) = pcb else { return 0 };
    pcb.address_space.destroy();
    let frames = KERNEL_STACK_SIZE / PAGE_SIZE;
    let base_frame = Frame::containing(PhysAddr::new(pcb.kernel_stack_base - KERNEL_VIRT_BASE));
    let _ = FRAME_ALLOCATOR.lock().free_contiguous(base_frame, frames as usize);
    pcb.exit_code
}

/// spec §4.5 "Exit".
pub fn exit(exit_code: i32) -> ! {
    let pid = scheduler::current_pid().expect("exit with no current process");
    exit_bookkeeping(pid, exit_code);
    scheduler::retire(pid);

    scheduler::schedule();
    unreachable!("exited process was rescheduled");
}

/// Every state change `exit` makes short of actually giving up the CPU:
/// mark `pid` terminated, close its fds, reparent its children to init
/// (reaping any that are already exited themselves), wake a parent
/// blocked in `wait` on `pid`, then move `pid` itself to `Zombie`. Split
/// out of `exit` so scenario tests can drive the bookkeeping directly —
/// `exit` itself ends in `scheduler::retire`/`schedule`, which need a
/// real CPU and cannot run hosted.
pub(crate) fn exit_bookkeeping(pid: Pid, exit_code: i32) {
    let parent_pid = {
        let mut table = PROCESS_TABLE.lock();
        let pcb = table.get_mut(&pid).expect("exiting pid has no PCB");
        pcb.exit_code = exit_code;
        pcb.state = ProcessState::Terminated;
        for fd in &mut pcb.fd_table {
            close_fd(fd);
        }
        pcb.parent_pid
    };

    // Reparent every live child to pid 1; reap any that are already
    // terminated themselves.
    let children: alloc::vec::Vec<Pid> = {
        let table = PROCESS_TABLE.lock();
        table.get(&pid).map(|p| p.children().collect()).unwrap_or_default()
    };
    for child in children {
        let already_terminated = {
            let mut table = PROCESS_TABLE.lock();
            if let Some(child_pcb) = table.get_mut(&child) {
                child_pcb.parent_pid = Some(Pid::INIT);
                matches!(child_pcb.state, ProcessState::Terminated | ProcessState::Zombie)
            } else {
                false
            }
        };
        {
            let mut table = PROCESS_TABLE.lock();
            if let Some(init_pcb) = table.get_mut(&Pid::INIT) {
                init_pcb.add_child(child);
            }
        }
        if already_terminated {
            reap(child);
        }
    }

    if let Some(parent) = parent_pid {
        let mut table = PROCESS_TABLE.lock();
        if let Some(parent_pcb) = table.get_mut(&parent) {
            let waiting_matches = match parent_pcb.waiting_for_child {
                Some(target) if target.get() == 0 => true,
                Some(target) => target == pid,
                None => false,
            };
            // `pid` is marked Terminated above and only becomes Zombie
            // after this block runs, so `waiting_matches` alone decides
            // whether to wake the parent; `wait`'s own reapability check
            // has to accept both states (see `table_contains_terminated`).
            if waiting_matches && parent_pcb.state == ProcessState::Blocked {
                parent_pcb.waiting_for_child = None;
                parent_pcb.state = ProcessState::Ready;
                drop(table);
                scheduler::wake(parent);
            }
        }
    }

    {
        let mut table = PROCESS_TABLE.lock();
        if let Some(pcb) = table.get_mut(&pid) {
            pcb.state = ProcessState::Zombie;
        }
    }
}

/// Outcome of one [`wait_step`] poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitStep {
    /// A matching child was found, reaped, and its exit code returned.
    Reaped(i32),
    /// No matching child has exited yet; caller is now `Blocked`.
    Blocked,
}

/// One iteration of `wait`'s poll loop: look for an already-reapable
/// matching child, reap it if found, otherwise mark the caller blocked.
/// Split out of `wait` so scenario tests can drive it directly — the
/// public `wait` loop also calls `scheduler::schedule`, which needs a
/// real CPU and cannot run hosted.
pub(crate) fn wait_step(caller: Pid, target_pid: Pid) -> KernelResult<WaitStep> {
    let (found, is_blocked) = {
        let mut table = PROCESS_TABLE.lock();
        let pcb = table.get_mut(&caller).ok_or(KernelError::NoSuchProcess)?;

        if target_pid.get() != 0 && !pcb.children().any(|c| c == target_pid) {
            return Err(KernelError::NoSuchProcess);
        }

        let terminated_child = pcb.children().find(|&c| {
            table_contains_terminated(&table, c, target_pid)
        });

        if let Some(child) = terminated_child {
            (Some(child), false)
        } else {
            pcb.waiting_for_child = Some(target_pid);
            pcb.state = ProcessState::Blocked;
            (None, true)
        }
    };

    if let Some(child) = found {
        return Ok(WaitStep::Reaped(reap(child)));
    }
    debug_assert!(is_blocked);
    Ok(WaitStep::Blocked)
}

/// spec §4.5 "Wait(target_pid)". `target_pid.get() == 0` means "any
/// child". Blocks the caller if no matching child has exited yet;
/// returns its exit code once one has (reaping it in the process).
pub fn wait(caller: Pid, target_pid: Pid) -> KernelResult<i32> {
    loop {
        match wait_step(caller, target_pid)? {
            WaitStep::Reaped(code) => return Ok(code),
            WaitStep::Blocked => {
                scheduler::relinquish_current();
                scheduler::schedule();
                // Resumed once the awaited child exits; loop to re-check.
            }
        }
    }
}

fn table_contains_terminated(
    table: &alloc::collections::BTreeMap<Pid, Box<ProcessControlBlock>>,
    child: Pid,
    target_pid: Pid,
) -> bool {
    if target_pid.get() != 0 && child != target_pid {
        return false;
    }
    // A child's own `exit` sets Terminated, wakes a waiting parent, then
    // overwrites its own state to Zombie before scheduling away — by the
    // time this parent re-checks, the child is reapable in either state.
    table
        .get(&child)
        .is_some_and(|c| matches!(c.state, ProcessState::Terminated | ProcessState::Zombie))
}

/// spec §4.5 "Exec": tear down the low half, establish a fresh user
/// layout from `program`, reset the register frame, rename. File
/// descriptors survive.
pub fn exec(pid: Pid, name: &str, program: &[u8]) -> KernelResult<()> {
    let mut table = PROCESS_TABLE.lock();
    let pcb = table.get_mut(&pid).ok_or(KernelError::NoSuchProcess)?;

    pcb.address_space.unmap_low_half();

    let code_pages = program.len().div_ceil(PAGE_SIZE as usize).max(1) as u32;
    map_fresh_pages(&mut pcb.address_space, USER_CODE_BASE, code_pages, EntryFlags::user_rw())?;
    write_program_image(&pcb.address_space, USER_CODE_BASE, program);
    pcb.address_space
        .change_flags(VirtAddr::new(USER_CODE_BASE), EntryFlags::user_ro())
        .map_err(|_| KernelError::OutOfMemory)?;

    let stack_pages = USER_STACK_SIZE / PAGE_SIZE;
    let stack_base = USER_STACK_TOP - USER_STACK_SIZE;
    map_fresh_pages(&mut pcb.address_space, stack_base, stack_pages, EntryFlags::user_rw())?;

    pcb.set_name(name);
    pcb.privilege = Privilege::User;
    let user_esp = USER_STACK_TOP - 4;
    pcb.registers = RegisterContext::user_entry(USER_CODE_BASE, pcb.kernel_stack_base + pcb.kernel_stack_size, user_esp);
    pcb.registers.esp = unsafe {
        context::init_kernel_stack(pcb.kernel_stack_base + pcb.kernel_stack_size, user_process_trampoline)
    };

    Ok(())
}

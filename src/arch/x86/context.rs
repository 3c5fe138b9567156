//! Kernel-to-kernel context switch and the ring-0 -> ring-3 entry
//! trampoline (§4.6 step 4, §9 assembly surface).
//!
//! The switch only saves the callee-saved registers (`ebx`, `esi`,
//! `edi`, `ebp`) plus `esp`: everything else is caller-saved and already
//! on the stack or dead across the call. Each process's kernel stack
//! therefore always has a valid `Context` at the top whenever it isn't
//! running.

use super::gdt::{USER_CODE_SELECTOR, USER_DATA_SELECTOR};

/// Saved on the kernel stack by [`switch_to`]; the first four fields are
/// restored by the matching `pop` sequence, `eip` is the return address
/// pushed by the `call` that got us here (a process resumes exactly
/// where its last context switch left it).
#[repr(C)]
pub struct Context {
    pub edi: u32,
    pub esi: u32,
    pub ebx: u32,
    pub ebp: u32,
    pub eip: u32,
}

/// Switch kernel stacks: save the current callee-saved registers and
/// return address onto the stack pointed to by `old_esp`, then load
/// `new_esp` and resume whatever was suspended there.
///
/// # Safety
/// `old_esp` must point at a valid `u32` slot the scheduler owns, and
/// `new_esp` must be the stack pointer saved by a prior `switch_to` (or
/// one built by [`init_kernel_stack`]) for a process with the same
/// address space currently loaded in CR3.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_to(old_esp: *mut u32, new_esp: u32) {
    core::arch::naked_asm!(
        "push ebp",
        "push ebx",
        "push esi",
        "push edi",
        "mov eax, [esp + 20]", // old_esp (first arg, above return addr + 4 pushes)
        "mov [eax], esp",
        "mov esp, [esp + 24]", // new_esp (second arg)
        "pop edi",
        "pop esi",
        "pop ebx",
        "pop ebp",
        "ret",
    );
}

/// Lay out a brand-new kernel stack so the first [`switch_to`] into it
/// behaves like returning from a call to `entry`. Used when starting a
/// process for the first time rather than resuming one.
///
/// # Safety
/// `stack_top` must be the highest valid address of a stack the caller
/// owns exclusively, aligned to 4 bytes, with at least
/// `size_of::<Context>()` bytes available below it.
pub unsafe fn init_kernel_stack(stack_top: u32, entry: extern "C" fn() -> !) -> u32 {
    let frame_addr = stack_top - core::mem::size_of::<Context>() as u32;
    unsafe {
        let frame = frame_addr as *mut Context;
        (*frame).edi = 0;
        (*frame).esi = 0;
        (*frame).ebx = 0;
        (*frame).ebp = 0;
        (*frame).eip = entry as u32;
    }
    frame_addr
}

/// The `iret` frame for a first entry into ring 3: `eip`, `cs`, `eflags`,
/// `esp`, `ss`, pushed in that order so a bare `iretd` drops us into user
/// mode at `entry` running on `user_stack`.
#[repr(C)]
struct UserEntryFrame {
    eip: u32,
    cs: u32,
    eflags: u32,
    esp: u32,
    ss: u32,
}

const EFLAGS_INTERRUPT_ENABLE: u32 = 1 << 9;
const EFLAGS_RESERVED_BIT1: u32 = 1 << 1;

/// Drop to ring 3 at `entry_eip` on `user_esp`, never to return: the
/// caller's kernel stack frame is abandoned. Used once per process, the
/// first time it's scheduled (§4.5 `exec`/initial `fork` child return).
///
/// # Safety
/// `entry_eip` and `user_esp` must both already be mapped, user-
/// accessible (U/S=1) pages in the address space loaded in CR3;
/// interrupts must be disabled on entry (the function re-enables them
/// as part of the restored `eflags`).
#[unsafe(naked)]
pub unsafe extern "C" fn enter_user_mode(entry_eip: u32, user_esp: u32) -> ! {
    core::arch::naked_asm!(
        "mov eax, [esp + 4]",  // entry_eip
        "mov ecx, [esp + 8]",  // user_esp
        "push {user_data}",    // ss
        "push ecx",            // esp
        "push {eflags}",       // eflags (IF set)
        "push {user_code}",    // cs
        "push eax",            // eip
        "mov ax, {user_data}",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        "mov gs, ax",
        "iretd",
        user_data = const USER_DATA_SELECTOR as u32,
        user_code = const USER_CODE_SELECTOR as u32,
        eflags = const (EFLAGS_INTERRUPT_ENABLE | EFLAGS_RESERVED_BIT1),
    );
}

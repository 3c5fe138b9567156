//! Exception, IRQ, and syscall dispatch (spec §4.4). Every raw `isr_stub!`
//! trampoline in [`crate::arch::x86::idt`] funnels here through one
//! symbol; this module is the only place that interprets a [`TrapFrame`].

use crate::arch::x86::idt::{
    TrapFrame, EXCEPTION_DOUBLE_FAULT, EXCEPTION_GENERAL_PROTECTION, EXCEPTION_PAGE_FAULT,
    IRQ_KEYBOARD, IRQ_TIMER,
};
use crate::arch::x86::{cpu, pic::PICS};
use crate::common::types::Pid;
use crate::kernel::driver::keyboard;
use crate::kernel::mm::VirtAddr;
use crate::kernel::process::{lifecycle, PROCESS_TABLE};
use crate::kernel::scheduler;
use crate::kernel::syscall;

const SYSCALL_VECTOR: u32 = 0x80;

/// Page-fault error-code bit: the fault was caused by a write (spec §4.5
/// "COW fault").
const PAGE_FAULT_WRITE: u32 = 1 << 1;
/// Page-fault error-code bit: the faulting page was present.
const PAGE_FAULT_PRESENT: u32 = 1 << 0;

/// Entry point called by every `isr_stub!` trampoline with a pointer to
/// the `TrapFrame` it just built on the interrupt stack. Exceptions,
/// IRQs, and the `int 0x80` syscall gate all land here; `frame.vector`
/// says which.
///
/// # Safety
/// Must only ever be called by the asm trampolines in `idt.rs`, with
/// `frame` pointing at a valid, fully-populated `TrapFrame` on the
/// current stack.
pub unsafe extern "C" fn dispatch(frame: *mut TrapFrame) {
    let frame = unsafe { &mut *frame };

    match frame.vector as usize {
        EXCEPTION_PAGE_FAULT => handle_page_fault(frame),
        EXCEPTION_DOUBLE_FAULT | EXCEPTION_GENERAL_PROTECTION => fatal_fault(frame),
        v if v == IRQ_TIMER => handle_timer(frame),
        v if v == IRQ_KEYBOARD => handle_keyboard(),
        v if v as u32 == SYSCALL_VECTOR => handle_syscall(frame),
        0..=31 => fatal_fault(frame),
        _ => {
            // Unknown IRQ: acknowledge and ignore (spec §4.4 "others ignored").
            unsafe {
                PICS.lock().notify_end_of_interrupt(frame.vector as u8);
            }
        }
    }
}

fn handle_page_fault(frame: &mut TrapFrame) {
    let faulting_va = cpu::read_cr2();
    let is_write = frame.error_code & PAGE_FAULT_WRITE != 0;
    let was_present = frame.error_code & PAGE_FAULT_PRESENT != 0;

    if is_write && was_present {
        if let Some(pid) = scheduler::current_pid() {
            let mut table = PROCESS_TABLE.lock();
            if let Some(pcb) = table.get_mut(&pid) {
                let resolved =
                    lifecycle::handle_cow_fault(&mut pcb.address_space, VirtAddr::new(faulting_va));
                if resolved.is_ok() {
                    return;
                }
            }
        }
    }

    fatal_fault(frame);
}

/// spec §7 "the only form of kernel panic": write a diagnostic to
/// VGA+serial and halt with interrupts disabled.
fn fatal_fault(frame: &TrapFrame) -> ! {
    unsafe {
        cpu::disable_interrupts();
    }
    crate::kprintln!(
        "\n*** fatal fault: vector={} error_code={:#x} eip={:#010x} cr2={:#010x} ***",
        frame.vector,
        frame.error_code,
        frame.eip,
        cpu::read_cr2(),
    );
    loop {
        cpu::halt();
    }
}

/// spec §4.4 "IRQ dispatcher" / §4.6 "Tick": request a scheduling
/// decision without performing the address-space switch from inside
/// the IRQ body — that happens on the common trampoline's return path.
fn handle_timer(frame: &TrapFrame) {
    crate::arch::x86::pit::on_tick();
    let switch_needed = scheduler::on_timer_tick();
    unsafe {
        PICS.lock().notify_end_of_interrupt(frame.vector as u8);
    }
    if switch_needed {
        scheduler::schedule();
    }
}

fn handle_keyboard() {
    keyboard::on_irq();
    unsafe {
        PICS.lock().notify_end_of_interrupt(IRQ_KEYBOARD as u8);
    }
}

/// spec §4.4 "system-call trampoline": EAX/EBX/ECX/EDX/ESI carry the
/// call number and up to four arguments in; the dispatcher overwrites
/// the saved EAX with the return value before the trampoline restores
/// it into the caller's register.
fn handle_syscall(frame: &mut TrapFrame) {
    let caller = scheduler::current_pid().unwrap_or(Pid::IDLE);
    let args = syscall::SyscallArgs {
        number: frame.eax,
        arg0: frame.ebx,
        arg1: frame.ecx,
        arg2: frame.edx,
        arg3: frame.esi,
    };
    frame.eax = syscall::dispatch(caller, &args) as u32;
}

//! Interrupt Descriptor Table.
//!
//! 256 gates: 32 CPU exception stubs, 16 IRQ stubs at vectors 32-47, and
//! the `int 0x80` syscall gate at DPL 3 (§6, §4.7). Every vector pushes
//! a `TrapFrame` and calls into `crate::interrupt::dispatch`; this module
//! only builds the table and the raw entry stubs.

use super::cpu::DescriptorTablePointer;
use crate::arch::x86::gdt::{KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR};
use spin::Mutex;

const IDT_ENTRIES: usize = 256;
const SYSCALL_VECTOR: usize = 0x80;

pub const EXCEPTION_DIVIDE_BY_ZERO: usize = 0;
pub const EXCEPTION_DEBUG: usize = 1;
pub const EXCEPTION_BREAKPOINT: usize = 3;
pub const EXCEPTION_INVALID_OPCODE: usize = 6;
pub const EXCEPTION_DOUBLE_FAULT: usize = 8;
pub const EXCEPTION_GENERAL_PROTECTION: usize = 13;
pub const EXCEPTION_PAGE_FAULT: usize = 14;

pub const IRQ_BASE: usize = 32;
pub const IRQ_TIMER: usize = IRQ_BASE; // IRQ0
pub const IRQ_KEYBOARD: usize = IRQ_BASE + 1; // IRQ1

const GATE_PRESENT: u8 = 1 << 7;
const GATE_TYPE_INTERRUPT32: u8 = 0b1110;
const GATE_RING0: u8 = 0 << 5;
const GATE_RING3: u8 = 3 << 5;

#[derive(Clone, Copy)]
#[repr(C)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    zero: u8,
    flags: u8,
    offset_high: u16,
}

impl IdtEntry {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            zero: 0,
            flags: 0,
            offset_high: 0,
        }
    }

    fn new(handler: u32, flags: u8) -> Self {
        Self {
            offset_low: (handler & 0xFFFF) as u16,
            selector: KERNEL_CODE_SELECTOR,
            zero: 0,
            flags,
            offset_high: ((handler >> 16) & 0xFFFF) as u16,
        }
    }
}

struct IdtTable {
    entries: [IdtEntry; IDT_ENTRIES],
}

static IDT: Mutex<IdtTable> = Mutex::new(IdtTable {
    entries: [IdtEntry::missing(); IDT_ENTRIES],
});

/// The register/stack layout every exception or IRQ stub leaves behind
/// before calling into Rust: segment registers, then the `pusha` block,
/// then vector and error code, then whatever the CPU itself pushed.
/// Matches the push order in `isr_stub!` below, reversed (stack grows
/// down). The `int 0x80` gate uses this same layout: `eax`/`ebx`/`ecx`/
/// `edx`/`esi` carry the syscall number and up to four arguments in,
/// and the dispatcher overwrites the saved `eax` with the return value
/// before `popa` restores it into the caller's register.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub vector: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub user_esp: u32,
    pub user_ss: u32,
}

/// Build and install the IDT. Must run after [`super::gdt::init`] (the
/// stubs reference `KERNEL_CODE_SELECTOR`) and before interrupts are
/// enabled.
pub fn init() {
    let mut idt = IDT.lock();

    macro_rules! set_exception {
        ($vector:expr, $handler:expr) => {
            idt.entries[$vector] = IdtEntry::new(
                $handler as u32,
                GATE_PRESENT | GATE_RING0 | GATE_TYPE_INTERRUPT32,
            );
        };
    }

    set_exception!(EXCEPTION_DIVIDE_BY_ZERO, stub_divide_by_zero);
    set_exception!(EXCEPTION_DEBUG, stub_debug);
    set_exception!(EXCEPTION_BREAKPOINT, stub_breakpoint);
    set_exception!(EXCEPTION_INVALID_OPCODE, stub_invalid_opcode);
    set_exception!(EXCEPTION_DOUBLE_FAULT, stub_double_fault);
    set_exception!(EXCEPTION_GENERAL_PROTECTION, stub_general_protection);
    set_exception!(EXCEPTION_PAGE_FAULT, stub_page_fault);

    idt.entries[IRQ_TIMER] = IdtEntry::new(
        stub_irq_timer as u32,
        GATE_PRESENT | GATE_RING0 | GATE_TYPE_INTERRUPT32,
    );
    idt.entries[IRQ_KEYBOARD] = IdtEntry::new(
        stub_irq_keyboard as u32,
        GATE_PRESENT | GATE_RING0 | GATE_TYPE_INTERRUPT32,
    );

    idt.entries[SYSCALL_VECTOR] = IdtEntry::new(
        stub_syscall as u32,
        GATE_PRESENT | GATE_RING3 | GATE_TYPE_INTERRUPT32,
    );

    let base = core::ptr::addr_of!(idt.entries) as u32;
    let limit = (IDT_ENTRIES * core::mem::size_of::<IdtEntry>() - 1) as u16;
    let pointer = DescriptorTablePointer { limit, base };

    unsafe {
        super::cpu::lidt(&pointer);
    }
}

/// Common prologue: push general-purpose registers and the vector/error
/// code, call `$handler` with a pointer to the resulting `TrapFrame`,
/// then pop everything back and `iretd`. `$has_error_code` selects
/// whether the CPU already pushed an error code (exceptions 8, 10-14) or
/// whether a dummy zero must be pushed to keep the frame uniform.
macro_rules! isr_stub {
    ($name:ident, $vector:expr, push_error_code) => {
        #[unsafe(naked)]
        extern "C" fn $name() {
            core::arch::naked_asm!(
                "push {vector}",
                "pusha",
                "push ds",
                "push es",
                "push fs",
                "push gs",
                "mov ax, {kernel_data}",
                "mov ds, ax",
                "mov es, ax",
                "mov fs, ax",
                "mov gs, ax",
                "push esp",
                "call {dispatch}",
                "add esp, 4",
                "pop gs",
                "pop fs",
                "pop es",
                "pop ds",
                "popa",
                "add esp, 8", // vector + CPU-provided error code
                "iretd",
                vector = const $vector,
                kernel_data = const KERNEL_DATA_SELECTOR,
                dispatch = sym crate::interrupt::dispatch,
            );
        }
    };
    ($name:ident, $vector:expr, no_error_code) => {
        #[unsafe(naked)]
        extern "C" fn $name() {
            core::arch::naked_asm!(
                "push 0",
                "push {vector}",
                "pusha",
                "push ds",
                "push es",
                "push fs",
                "push gs",
                "mov ax, {kernel_data}",
                "mov ds, ax",
                "mov es, ax",
                "mov fs, ax",
                "mov gs, ax",
                "push esp",
                "call {dispatch}",
                "add esp, 4",
                "pop gs",
                "pop fs",
                "pop es",
                "pop ds",
                "popa",
                "add esp, 8",
                "iretd",
                vector = const $vector,
                kernel_data = const KERNEL_DATA_SELECTOR,
                dispatch = sym crate::interrupt::dispatch,
            );
        }
    };
}

isr_stub!(stub_divide_by_zero, EXCEPTION_DIVIDE_BY_ZERO, no_error_code);
isr_stub!(stub_debug, EXCEPTION_DEBUG, no_error_code);
isr_stub!(stub_breakpoint, EXCEPTION_BREAKPOINT, no_error_code);
isr_stub!(stub_invalid_opcode, EXCEPTION_INVALID_OPCODE, no_error_code);
isr_stub!(stub_double_fault, EXCEPTION_DOUBLE_FAULT, push_error_code);
isr_stub!(
    stub_general_protection,
    EXCEPTION_GENERAL_PROTECTION,
    push_error_code
);
isr_stub!(stub_page_fault, EXCEPTION_PAGE_FAULT, push_error_code);
isr_stub!(stub_irq_timer, IRQ_TIMER, no_error_code);
isr_stub!(stub_irq_keyboard, IRQ_KEYBOARD, no_error_code);
isr_stub!(stub_syscall, SYSCALL_VECTOR, no_error_code);

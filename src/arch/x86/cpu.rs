//! Low-level CPU primitives: flags, control registers, TLB invalidation,
//! and the table-load instructions. This is the "assembly surface" called
//! out in the design notes — everything here is a thin, tested wrapper;
//! nothing above this module uses inline asm directly.

use core::arch::asm;

/// Disable maskable interrupts.
#[inline]
pub fn disable_interrupts() {
    unsafe {
        asm!("cli", options(nomem, nostack, preserves_flags));
    }
}

/// Enable maskable interrupts.
#[inline]
pub fn enable_interrupts() {
    unsafe {
        asm!("sti", options(nomem, nostack, preserves_flags));
    }
}

/// Halt until the next interrupt.
#[inline]
pub fn halt() {
    unsafe {
        asm!("hlt", options(nomem, nostack, preserves_flags));
    }
}

/// Run `f` with interrupts disabled, restoring the prior IF state
/// afterwards. Every mutation site of global kernel state uses this guard
/// (§5: "all global kernel state is mutated only with interrupts
/// disabled").
#[inline]
pub fn without_interrupts<F: FnOnce() -> R, R>(f: F) -> R {
    let were_enabled = interrupts_enabled();
    disable_interrupts();
    let result = f();
    if were_enabled {
        enable_interrupts();
    }
    result
}

#[inline]
fn interrupts_enabled() -> bool {
    let flags: u32;
    unsafe {
        asm!(
            "pushfd",
            "pop {0}",
            out(reg) flags,
            options(nomem, preserves_flags)
        );
    }
    flags & (1 << 9) != 0
}

/// Read CR2 (faulting address, valid inside a page-fault handler).
#[inline]
pub fn read_cr2() -> u32 {
    let value: u32;
    unsafe {
        asm!("mov {0}, cr2", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    value
}

/// Read CR3 (current page directory base).
#[inline]
pub fn read_cr3() -> u32 {
    let value: u32;
    unsafe {
        asm!("mov {0}, cr3", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    value
}

/// Load CR3 with a new page directory base. Flushes all non-global TLB
/// entries.
///
/// # Safety
/// `pd_phys` must be the physical address of a valid, fully-populated page
/// directory (kernel high half mapped) or the next memory access will
/// fault unrecoverably.
#[inline]
pub unsafe fn write_cr3(pd_phys: u32) {
    unsafe {
        asm!("mov cr3, {0}", in(reg) pd_phys, options(nostack, preserves_flags));
    }
}

/// Set CR0.PG (bit 31), enabling paging. Requires CR3 to already hold a
/// valid page directory and the identity-mapped code at the current EIP to
/// remain mapped after the switch.
///
/// # Safety
/// Paging must already be fully configured (kernel identity + high-half
/// mappings installed) before this is called.
#[inline]
pub unsafe fn enable_paging() {
    unsafe {
        asm!(
            "mov {tmp}, cr0",
            "or {tmp}, 0x80000000",
            "mov cr0, {tmp}",
            tmp = out(reg) _,
            options(nostack, preserves_flags)
        );
    }
}

/// Invalidate a single TLB entry.
///
/// # Safety
/// `va` should be a page-aligned virtual address whose mapping just
/// changed; calling this elsewhere is harmless but pointless.
#[inline]
pub unsafe fn invlpg(va: u32) {
    unsafe {
        asm!("invlpg [{0}]", in(reg) va, options(nostack, preserves_flags));
    }
}

/// A 6-byte `lgdt`/`lidt` descriptor: 16-bit limit, 32-bit base.
#[repr(C, packed)]
pub struct DescriptorTablePointer {
    pub limit: u16,
    pub base: u32,
}

/// # Safety
/// `gdtr` must describe a valid, live GDT; this changes what every
/// subsequent segment-selector reload resolves to.
#[inline]
pub unsafe fn lgdt(gdtr: &DescriptorTablePointer) {
    unsafe {
        asm!("lgdt [{0}]", in(reg) gdtr, options(readonly, nostack, preserves_flags));
    }
}

/// # Safety
/// `idtr` must describe a valid, live IDT.
#[inline]
pub unsafe fn lidt(idtr: &DescriptorTablePointer) {
    unsafe {
        asm!("lidt [{0}]", in(reg) idtr, options(readonly, nostack, preserves_flags));
    }
}

/// Load the task register with the TSS selector.
///
/// # Safety
/// `selector` must index a valid, present TSS descriptor in the GDT.
#[inline]
pub unsafe fn ltr(selector: u16) {
    unsafe {
        asm!("ltr {0:x}", in(reg) selector, options(nostack, preserves_flags));
    }
}

/// Reload every data segment register and CS with the given selectors via
/// a far return (the standard "reload segments" sequence after `lgdt`).
///
/// # Safety
/// `code_selector`/`data_selector` must be valid, present GDT selectors of
/// the appropriate privilege level for the currently executing code.
#[inline]
pub unsafe fn reload_segments(code_selector: u16, data_selector: u16) {
    unsafe {
        asm!(
            "push {code_sel}",
            "lea {tmp}, [1f]",
            "push {tmp}",
            "retf",
            "1:",
            "mov ds, {data_sel:x}",
            "mov es, {data_sel:x}",
            "mov fs, {data_sel:x}",
            "mov gs, {data_sel:x}",
            "mov ss, {data_sel:x}",
            code_sel = in(reg) u32::from(code_selector),
            data_sel = in(reg) data_selector,
            tmp = out(reg) _,
        );
    }
}

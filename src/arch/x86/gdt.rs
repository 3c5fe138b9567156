//! Global Descriptor Table.
//!
//! Five descriptors as specified in §6: null, ring-0 code/data, ring-3
//! code/data, selectors 0x08/0x10/0x1B/0x23. A sixth TSS descriptor is
//! appended so the scheduler can point TSS.ESP0 at the next process's
//! kernel stack on every context switch (§4.6 step 3).

use super::cpu::{self, DescriptorTablePointer};
use spin::Mutex;

pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
pub const USER_CODE_SELECTOR: u16 = 0x1B; // RPL 3
pub const USER_DATA_SELECTOR: u16 = 0x23; // RPL 3
const TSS_SELECTOR: u16 = 0x28;

const ACCESS_PRESENT: u8 = 1 << 7;
const ACCESS_RING3: u8 = 3 << 5;
const ACCESS_CODE_DATA: u8 = 1 << 4;
const ACCESS_EXEC: u8 = 1 << 3;
const ACCESS_RW: u8 = 1 << 1; // readable (code) / writable (data)
const FLAGS_GRANULARITY_4K: u8 = 1 << 7;
const FLAGS_32BIT: u8 = 1 << 6;

/// A raw 8-byte GDT descriptor.
#[derive(Clone, Copy)]
#[repr(C)]
struct GdtEntry {
    limit_low: u16,
    base_low: u16,
    base_mid: u8,
    access: u8,
    flags_limit_high: u8,
    base_high: u8,
}

impl GdtEntry {
    const fn null() -> Self {
        Self {
            limit_low: 0,
            base_low: 0,
            base_mid: 0,
            access: 0,
            flags_limit_high: 0,
            base_high: 0,
        }
    }

    /// A flat (base 0, limit 4 GiB) code or data segment at the given
    /// privilege level.
    const fn flat(access: u8) -> Self {
        Self {
            limit_low: 0xFFFF,
            base_low: 0,
            base_mid: 0,
            access,
            flags_limit_high: FLAGS_GRANULARITY_4K | FLAGS_32BIT | 0x0F,
            base_high: 0,
        }
    }

    const fn tss(base: u32, limit: u32) -> Self {
        Self {
            limit_low: (limit & 0xFFFF) as u16,
            base_low: (base & 0xFFFF) as u16,
            base_mid: ((base >> 16) & 0xFF) as u8,
            access: ACCESS_PRESENT | 0b1001, // present, 32-bit TSS (available)
            flags_limit_high: ((limit >> 16) & 0x0F) as u8,
            base_high: ((base >> 24) & 0xFF) as u8,
        }
    }
}

/// Minimal 32-bit TSS. Only `esp0`/`ss0` are meaningful here: the CPU
/// consults them on every ring-3 -> ring-0 transition (interrupt, `int
/// 0x80`) to find the kernel stack to switch onto.
#[repr(C, packed)]
pub struct TaskStateSegment {
    link: u16,
    _link_hi: u16,
    pub esp0: u32,
    pub ss0: u16,
    _ss0_hi: u16,
    _rest: [u8; 88],
    iomap_base: u16,
}

impl TaskStateSegment {
    const fn new() -> Self {
        Self {
            link: 0,
            _link_hi: 0,
            esp0: 0,
            ss0: KERNEL_DATA_SELECTOR,
            _ss0_hi: 0,
            _rest: [0; 88],
            iomap_base: core::mem::size_of::<Self>() as u16,
        }
    }
}

const GDT_ENTRIES: usize = 6;

struct GdtTable {
    entries: [GdtEntry; GDT_ENTRIES],
}

static GDT: Mutex<GdtTable> = Mutex::new(GdtTable {
    entries: [GdtEntry::null(); GDT_ENTRIES],
});

static TSS: Mutex<TaskStateSegment> = Mutex::new(TaskStateSegment::new());

/// Initialize and load the GDT and TSS. Must run once, early in boot,
/// before any segment register reload or ring-3 transition.
pub fn init() {
    let tss_addr = {
        let tss = TSS.lock();
        core::ptr::addr_of!(*tss) as u32
    };

    {
        let mut gdt = GDT.lock();
        gdt.entries[0] = GdtEntry::null();
        gdt.entries[1] = GdtEntry::flat(ACCESS_PRESENT | ACCESS_CODE_DATA | ACCESS_EXEC | ACCESS_RW);
        gdt.entries[2] = GdtEntry::flat(ACCESS_PRESENT | ACCESS_CODE_DATA | ACCESS_RW);
        gdt.entries[3] = GdtEntry::flat(
            ACCESS_PRESENT | ACCESS_RING3 | ACCESS_CODE_DATA | ACCESS_EXEC | ACCESS_RW,
        );
        gdt.entries[4] =
            GdtEntry::flat(ACCESS_PRESENT | ACCESS_RING3 | ACCESS_CODE_DATA | ACCESS_RW);
        gdt.entries[5] = GdtEntry::tss(tss_addr, (core::mem::size_of::<TaskStateSegment>() - 1) as u32);

        let base = core::ptr::addr_of!(gdt.entries) as u32;
        let limit = (GDT_ENTRIES * core::mem::size_of::<GdtEntry>() - 1) as u16;
        let pointer = DescriptorTablePointer { limit, base };

        unsafe {
            cpu::lgdt(&pointer);
            cpu::reload_segments(KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR);
            cpu::ltr(TSS_SELECTOR);
        }
    }
}

/// Point the TSS's ring-0 stack at `esp0` so the next ring-3 -> ring-0
/// transition (interrupt or `int 0x80`) lands on the right kernel stack.
/// Called by the scheduler on every context switch into a user process
/// (§4.6 step 3).
pub fn set_kernel_stack(esp0: u32) {
    let mut tss = TSS.lock();
    tss.esp0 = esp0;
}

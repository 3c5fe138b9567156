//! Address and page-table-entry types shared by the frame allocator and
//! the virtual memory manager (spec §3 Data Model).

use core::fmt;

pub const PAGE_SIZE: u32 = 4096;
pub const PAGE_SHIFT: u32 = 12;
pub const ENTRIES_PER_TABLE: usize = 1024;

/// A physical address. Always a plain `u32`: this kernel never runs with
/// more than 4 GiB of physical memory in view.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(u32);

impl PhysAddr {
    #[inline]
    #[must_use]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }

    #[inline]
    #[must_use]
    pub const fn frame_index(self) -> u32 {
        self.0 >> PAGE_SHIFT
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#010x})", self.0)
    }
}

/// A virtual address, decomposed into the PD index / PT index / page
/// offset that a two-level x86 page walk consults (spec §3).
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(u32);

impl VirtAddr {
    #[inline]
    #[must_use]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }

    /// Bits 22..31: index into the page directory.
    #[inline]
    #[must_use]
    pub const fn pd_index(self) -> usize {
        (self.0 >> 22) as usize
    }

    /// Bits 12..21: index into the page table.
    #[inline]
    #[must_use]
    pub const fn pt_index(self) -> usize {
        ((self.0 >> 12) & 0x3FF) as usize
    }

    /// Bits 0..11: offset within the page.
    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u32 {
        self.0 & (PAGE_SIZE - 1)
    }

    #[inline]
    #[must_use]
    pub const fn page_align_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    #[inline]
    #[must_use]
    pub fn page_align_up(self) -> Self {
        Self((self.0.wrapping_add(PAGE_SIZE - 1)) & !(PAGE_SIZE - 1))
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, offset: u32) -> Option<Self> {
        match self.0.checked_add(offset) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#010x})", self.0)
    }
}

/// A 4 KiB physical page frame, identified by its base address
/// (spec §3 "Frame").
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Frame(u32);

impl Frame {
    #[inline]
    #[must_use]
    pub const fn containing(addr: PhysAddr) -> Self {
        Self(addr.as_u32() & !(PAGE_SIZE - 1))
    }

    #[inline]
    #[must_use]
    pub const fn from_index(index: u32) -> Self {
        Self(index << PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0 >> PAGE_SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn start_address(self) -> PhysAddr {
        PhysAddr::new(self.0)
    }
}

bitflags::bitflags! {
    /// Flag bits common to both page-directory and page-table entries
    /// (spec §3 "PTE/PDE"). A copy-on-write page is simply `PRESENT`
    /// without `WRITABLE`; the page-fault handler tells a COW fault from
    /// a real protection violation by checking whether the faulting
    /// address is still present in the owning address space.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        const PRESENT        = 1 << 0;
        const WRITABLE       = 1 << 1;
        const USER           = 1 << 2;
        const WRITE_THROUGH  = 1 << 3;
        const CACHE_DISABLED = 1 << 4;
        const ACCESSED       = 1 << 5;
        const DIRTY          = 1 << 6;
        const GLOBAL         = 1 << 8;
    }
}

impl EntryFlags {
    /// Flags for a present, kernel-only, read/write mapping.
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self::from_bits_truncate(Self::PRESENT.bits() | Self::WRITABLE.bits())
    }

    /// Flags for a present, user-accessible, read/write mapping.
    #[must_use]
    pub const fn user_rw() -> Self {
        Self::from_bits_truncate(Self::PRESENT.bits() | Self::WRITABLE.bits() | Self::USER.bits())
    }

    /// Flags for a present, user-accessible, read-only (executable) mapping.
    #[must_use]
    pub const fn user_ro() -> Self {
        Self::from_bits_truncate(Self::PRESENT.bits() | Self::USER.bits())
    }
}

/// A raw 32-bit page-directory or page-table entry
/// (spec §3: `{present, writable, user, ..., frame_index:20}`).
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageEntry(u32);

const FRAME_MASK: u32 = !(PAGE_SIZE - 1);

impl PageEntry {
    #[must_use]
    pub const fn unused() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0 & EntryFlags::PRESENT.bits() != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.0 & EntryFlags::WRITABLE.bits() != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_user(self) -> bool {
        self.0 & EntryFlags::USER.bits() != 0
    }

    #[inline]
    #[must_use]
    pub const fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0 & !FRAME_MASK)
    }

    #[inline]
    #[must_use]
    pub const fn frame(self) -> Frame {
        Frame::from_index((self.0 & FRAME_MASK) >> PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn address(self) -> PhysAddr {
        PhysAddr::new(self.0 & FRAME_MASK)
    }

    #[must_use]
    pub const fn new(frame: Frame, flags: EntryFlags) -> Self {
        Self(frame.start_address().as_u32() | flags.bits())
    }

    /// Replace the flag bits, keeping the frame untouched
    /// (spec §4.2 `change_flags`).
    #[must_use]
    pub const fn with_flags(self, flags: EntryFlags) -> Self {
        Self((self.0 & FRAME_MASK) | flags.bits())
    }

    /// Clear the writable bit, keeping everything else
    /// (COW marking, spec §4.2 `clone_for_fork`).
    #[must_use]
    pub const fn without_writable(self) -> Self {
        Self(self.0 & !EntryFlags::WRITABLE.bits())
    }

    /// Set the writable bit (COW fault resolution, spec §4.5).
    #[must_use]
    pub const fn with_writable(self) -> Self {
        Self(self.0 | EntryFlags::WRITABLE.bits())
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virt_addr_decomposes_into_pd_pt_offset() {
        let va = VirtAddr::new(0xC010_2004);
        assert_eq!(va.pd_index(), 0x300);
        assert_eq!(va.pt_index(), 0x102);
        assert_eq!(va.page_offset(), 0x4);
    }

    #[test]
    fn page_align_rounds_correctly() {
        let va = VirtAddr::new(0x1001);
        assert_eq!(va.page_align_down().as_u32(), 0x1000);
        assert_eq!(va.page_align_up().as_u32(), 0x2000);
        assert_eq!(VirtAddr::new(0x1000).page_align_up().as_u32(), 0x1000);
    }

    #[test]
    fn page_entry_roundtrips_frame_and_flags() {
        let frame = Frame::from_index(7);
        let entry = PageEntry::new(frame, EntryFlags::user_rw());
        assert!(entry.is_present());
        assert!(entry.is_writable());
        assert!(entry.is_user());
        assert_eq!(entry.frame(), frame);
    }

    #[test]
    fn without_writable_clears_only_that_bit() {
        let entry = PageEntry::new(Frame::from_index(1), EntryFlags::user_rw());
        let cow = entry.without_writable();
        assert!(!cow.is_writable());
        assert!(cow.is_present());
        assert!(cow.is_user());
        assert_eq!(cow.frame(), entry.frame());
    }
}

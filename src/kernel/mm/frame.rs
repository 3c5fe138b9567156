//! Physical frame allocator: a single bitmap over every 4 KiB frame in
//! the range the boot loader reported (spec §4.1).

use super::types::{Frame, PAGE_SIZE};
use crate::boot::multiboot::MemoryRegion;
use spin::Mutex;

/// Up to 4 GiB of physical memory, one bit per frame.
const MAX_FRAMES: usize = 1 << 20; // 4 GiB / 4 KiB
const BITMAP_WORDS: usize = MAX_FRAMES / 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// `alloc_contiguous`/allocation requested zero frames.
    ZeroSizeRequest,
    /// Frame address lies outside the allocator's tracked range.
    OutOfRange,
    /// `free_one`/`free_contiguous` targeted an already-free frame.
    DoubleFree,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FrameStats {
    pub total: usize,
    pub used: usize,
    pub free: usize,
}

struct Bitmap {
    words: [u32; BITMAP_WORDS],
    total_frames: usize,
    first_free_hint: usize,
}

impl Bitmap {
    const fn new() -> Self {
        Self {
            words: [u32::MAX; BITMAP_WORDS],
            total_frames: 0,
            first_free_hint: 0,
        }
    }

    fn is_used(&self, index: usize) -> bool {
        self.words[index / 32] & (1 << (index % 32)) != 0
    }

    fn set_used(&mut self, index: usize) {
        self.words[index / 32] |= 1 << (index % 32);
    }

    fn set_free(&mut self, index: usize) {
        self.words[index / 32] &= !(1 << (index % 32));
    }
}

pub struct FrameAllocator {
    bitmap: Bitmap,
    used_count: usize,
}

impl FrameAllocator {
    pub(crate) const fn new() -> Self {
        Self {
            bitmap: Bitmap::new(),
            used_count: 0,
        }
    }

    /// Mark every byte inside an "available" Multiboot region as free,
    /// then re-reserve the kernel image and the bitmap's own backing
    /// storage (spec §4.1 "Design"). Takes the memory map as a plain
    /// iterator rather than a `&BootInfo` so scenario tests can drive it
    /// with a handful of [`MemoryRegion`] literals instead of a real
    /// Multiboot struct (spec §8 scenario S1); the one production call
    /// site passes `boot_info.memory_map()`.
    ///
    /// # Safety
    /// Must be called exactly once, early in boot, before any other
    /// frame allocator call, with `kernel_start`/`kernel_end` describing
    /// the linked kernel image's physical extent.
    pub unsafe fn init(
        &mut self,
        memory_map: impl Iterator<Item = MemoryRegion>,
        kernel_start: u32,
        kernel_end: u32,
    ) {
        let mut max_frame = 0usize;

        for region in memory_map {
            if !region.is_available() {
                continue;
            }
            let base = region.base;
            let len = region.length;
            let start_frame = (base / u64::from(PAGE_SIZE)) as usize;
            let frame_count = (len / u64::from(PAGE_SIZE)) as usize;
            for i in 0..frame_count {
                let idx = start_frame + i;
                if idx < MAX_FRAMES {
                    self.bitmap.set_free(idx);
                    max_frame = max_frame.max(idx + 1);
                }
            }
        }

        self.bitmap.total_frames = max_frame;

        let kernel_start_frame = (kernel_start / PAGE_SIZE) as usize;
        let kernel_end_frame = kernel_end.div_ceil(PAGE_SIZE) as usize;
        for idx in kernel_start_frame..kernel_end_frame.min(MAX_FRAMES) {
            self.bitmap.set_used(idx);
        }

        self.used_count = (0..self.bitmap.total_frames)
            .filter(|&i| self.bitmap.is_used(i))
            .count();
        self.bitmap.first_free_hint = 0;
    }

    /// Reserve the frames backing `[start, end)` (used once, for the
    /// bitmap's own storage and other early fixed allocations).
    pub fn reserve_range(&mut self, start: u32, end: u32) {
        let start_frame = (start / PAGE_SIZE) as usize;
        let end_frame = end.div_ceil(PAGE_SIZE) as usize;
        for idx in start_frame..end_frame.min(MAX_FRAMES) {
            if !self.bitmap.is_used(idx) {
                self.bitmap.set_used(idx);
                self.used_count += 1;
            }
        }
    }

    /// Rotating first-fit single-frame allocation (spec §4.1).
    pub fn alloc_one(&mut self) -> Option<Frame> {
        let total = self.bitmap.total_frames;
        if total == 0 {
            return None;
        }
        let start = self.bitmap.first_free_hint % total;
        for offset in 0..total {
            let idx = (start + offset) % total;
            if !self.bitmap.is_used(idx) {
                self.bitmap.set_used(idx);
                self.used_count += 1;
                self.bitmap.first_free_hint = idx + 1;
                return Some(Frame::from_index(idx as u32));
            }
        }
        None
    }

    /// Linear scan for `n` physically contiguous free frames
    /// (spec §4.1: "no compaction").
    pub fn alloc_contiguous(&mut self, n: usize) -> Result<Option<Frame>, FrameError> {
        if n == 0 {
            return Err(FrameError::ZeroSizeRequest);
        }
        let total = self.bitmap.total_frames;
        if n > total {
            return Ok(None);
        }
        for start in 0..=(total - n) {
            if (start..start + n).all(|i| !self.bitmap.is_used(i)) {
                for i in start..start + n {
                    self.bitmap.set_used(i);
                }
                self.used_count += n;
                return Ok(Some(Frame::from_index(start as u32)));
            }
        }
        Ok(None)
    }

    /// # Errors
    /// [`FrameError::OutOfRange`] if `frame` is outside the tracked
    /// range; [`FrameError::DoubleFree`] if it is already free.
    pub fn free_one(&mut self, frame: Frame) -> Result<(), FrameError> {
        let idx = frame.index() as usize;
        if idx >= self.bitmap.total_frames {
            return Err(FrameError::OutOfRange);
        }
        if !self.bitmap.is_used(idx) {
            return Err(FrameError::DoubleFree);
        }
        self.bitmap.set_free(idx);
        self.used_count -= 1;
        self.bitmap.first_free_hint = self.bitmap.first_free_hint.min(idx);
        Ok(())
    }

    /// # Errors
    /// [`FrameError::ZeroSizeRequest`], [`FrameError::OutOfRange`], or
    /// [`FrameError::DoubleFree`] for the same reasons as
    /// [`Self::free_one`], checked against the whole run before any bit
    /// is cleared.
    pub fn free_contiguous(&mut self, frame: Frame, n: usize) -> Result<(), FrameError> {
        if n == 0 {
            return Err(FrameError::ZeroSizeRequest);
        }
        let start = frame.index() as usize;
        if start + n > self.bitmap.total_frames {
            return Err(FrameError::OutOfRange);
        }
        if (start..start + n).any(|i| !self.bitmap.is_used(i)) {
            return Err(FrameError::DoubleFree);
        }
        for i in start..start + n {
            self.bitmap.set_free(i);
        }
        self.used_count -= n;
        self.bitmap.first_free_hint = self.bitmap.first_free_hint.min(start);
        Ok(())
    }

    #[must_use]
    pub fn stats(&self) -> FrameStats {
        FrameStats {
            total: self.bitmap.total_frames,
            used: self.used_count,
            free: self.bitmap.total_frames - self.used_count,
        }
    }
}

pub static FRAME_ALLOCATOR: Mutex<FrameAllocator> = Mutex::new(FrameAllocator::new());

/// Zero-initialize a freshly allocated frame. Used by the VMM whenever a
/// new page table or page directory frame is brought into service.
///
/// # Safety
/// `frame` must be exclusively owned by the caller (just allocated, not
/// yet mapped writable anywhere else) and must be identity- or
/// offset-mapped so the zeroing write lands on the intended physical
/// page.
pub unsafe fn zero_frame(frame: Frame, identity_base: u32) {
    let ptr = (identity_base + frame.start_address().as_u32()) as *mut u8;
    unsafe {
        core::ptr::write_bytes(ptr, 0, PAGE_SIZE as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(n: usize) -> FrameAllocator {
        let mut a = FrameAllocator::new();
        a.bitmap.total_frames = n;
        for i in 0..n {
            a.bitmap.set_free(i);
        }
        a
    }

    #[test]
    fn alloc_then_free_preserves_total() {
        let mut a = fresh(64);
        let stats0 = a.stats();
        assert_eq!(stats0.used + stats0.free, 64);

        let f = a.alloc_one().unwrap();
        let stats1 = a.stats();
        assert_eq!(stats1.used, 1);
        assert_eq!(stats1.used + stats1.free, 64);

        a.free_one(f).unwrap();
        let stats2 = a.stats();
        assert_eq!(stats2.used, 0);
        assert_eq!(stats2.used + stats2.free, 64);
    }

    #[test]
    fn double_free_is_detected() {
        let mut a = fresh(8);
        let f = a.alloc_one().unwrap();
        a.free_one(f).unwrap();
        assert_eq!(a.free_one(f), Err(FrameError::DoubleFree));
    }

    #[test]
    fn zero_sized_contiguous_request_fails_fast() {
        let mut a = fresh(8);
        assert_eq!(a.alloc_contiguous(0), Err(FrameError::ZeroSizeRequest));
    }

    #[test]
    fn contiguous_alloc_returns_a_run() {
        let mut a = fresh(16);
        let base = a.alloc_contiguous(4).unwrap().unwrap();
        for i in 0..4 {
            assert!(a.bitmap.is_used(base.index() as usize + i));
        }
        assert_eq!(a.stats().used, 4);
    }

    #[test]
    fn contiguous_alloc_fails_when_no_run_fits() {
        let mut a = fresh(4);
        // fragment: frames 1 and 3 used, leaving only singletons free.
        a.bitmap.set_used(1);
        a.used_count += 1;
        a.bitmap.set_used(3);
        a.used_count += 1;
        assert_eq!(a.alloc_contiguous(2), Ok(None));
    }

    #[test]
    fn out_of_range_free_is_rejected() {
        let mut a = fresh(4);
        assert_eq!(
            a.free_one(Frame::from_index(100)),
            Err(FrameError::OutOfRange)
        );
    }

    #[test]
    fn alloc_exhaustion_returns_none() {
        let mut a = fresh(2);
        assert!(a.alloc_one().is_some());
        assert!(a.alloc_one().is_some());
        assert!(a.alloc_one().is_none());
    }
}

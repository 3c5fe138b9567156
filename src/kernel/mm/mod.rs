//! Memory management: physical frames, paging, and the kernel heap
//! (spec §4.1-§4.3).

pub mod frame;
pub mod heap;
pub mod types;
pub mod vmm;

pub use frame::{FrameAllocator, FrameError, FrameStats, FRAME_ALLOCATOR};
pub use types::{EntryFlags, Frame, PageEntry, PhysAddr, VirtAddr, PAGE_SIZE};
pub use vmm::{AddressSpace, VmmError};

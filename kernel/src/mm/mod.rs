//! Memory management
//!
//! Layered bottom-up: the physical frame allocator owns every 4 KiB frame
//! of RAM, paging builds per-process address spaces out of frames, and the
//! kernel heap carves variable-size blocks out of one pinned frame range.

pub mod frame_allocator;
pub mod heap;
pub mod page_fault;
pub mod paging;

pub use frame_allocator::{FrameAllocator, FrameNumber, FRAME_ALLOCATOR};
pub use paging::{PageDirectory, PteFlags};

/// Size of a physical frame and of a virtual page (4 KiB)
pub const FRAME_SIZE: usize = 4096;

/// Alias kept for call sites that talk about virtual memory
pub const PAGE_SIZE: usize = FRAME_SIZE;

/// Physical memory address (the machine is 32-bit)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub u32);

impl PhysicalAddress {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    pub const fn as_frame(&self) -> FrameNumber {
        FrameNumber::new(self.0 / FRAME_SIZE as u32)
    }

    /// Round down to the containing frame boundary
    pub const fn frame_aligned_down(&self) -> Self {
        Self(self.0 & !(FRAME_SIZE as u32 - 1))
    }

    /// Round up to the next frame boundary (saturating at the top of the
    /// 32-bit range)
    pub const fn frame_aligned_up(&self) -> Self {
        let rounded = (self.0 as u64 + FRAME_SIZE as u64 - 1) & !(FRAME_SIZE as u64 - 1);
        if rounded > u32::MAX as u64 {
            Self(u32::MAX & !(FRAME_SIZE as u32 - 1))
        } else {
            Self(rounded as u32)
        }
    }
}

/// Virtual memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub u32);

impl VirtualAddress {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Highest 10 bits select the page-directory entry
    pub const fn directory_index(&self) -> usize {
        ((self.0 >> 22) & 0x3FF) as usize
    }

    /// Middle 10 bits select the page-table entry
    pub const fn table_index(&self) -> usize {
        ((self.0 >> 12) & 0x3FF) as usize
    }

    /// Lowest 12 bits are the offset within the page
    pub const fn page_offset(&self) -> u32 {
        self.0 & 0xFFF
    }

    pub const fn page_aligned_down(&self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u32 - 1))
    }

    pub const fn page_aligned_up(&self) -> Self {
        Self((self.0).wrapping_add(PAGE_SIZE as u32 - 1) & !(PAGE_SIZE as u32 - 1))
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod kernel_space {
    //! Bare-metal bring-up of the memory subsystems, in dependency order:
    //! frame bitmap from the boot memory map, the kernel page directory
    //! identity-mapping all of RAM (so the kernel can reach any frame it
    //! hands out), then the pinned heap range.

    use spin::Once;

    use super::paging::{kernel_pde_count, IdentityFrames, PageDirectory, PteFlags};
    use super::{frame_allocator, MemoryRegion, PhysicalAddress};
    use crate::error::KernelResult;

    /// Kernel heap size (4 MiB of pinned contiguous frames)
    const HEAP_BYTES: usize = 4 * 1024 * 1024;

    /// The span of directory entries user address spaces share with the
    /// kernel: the identity map of kernel image, heap and low devices.
    const KERNEL_SHARED_SPAN: u32 = 16 * 1024 * 1024;

    static KERNEL_DIR: Once<(PageDirectory, usize)> = Once::new();

    /// Initialize frames, paging and the heap. Called once from the boot
    /// path with the memory map and the kernel image bounds.
    pub fn init(
        regions: &[MemoryRegion],
        kernel_start: u32,
        kernel_end: u32,
    ) -> KernelResult<()> {
        frame_allocator::FRAME_ALLOCATOR
            .lock()
            .init(regions, kernel_start, kernel_end);

        let highest = frame_allocator::FRAME_ALLOCATOR.lock().highest_address();
        let mut frames = IdentityFrames;
        let mut dir = PageDirectory::new(&mut frames)?;
        dir.identity_map_range(
            PhysicalAddress::new(0),
            PhysicalAddress::new(highest),
            PteFlags::WRITABLE | PteFlags::GLOBAL,
            &mut frames,
        )?;
        dir.activate();
        KERNEL_DIR.call_once(|| (dir, kernel_pde_count(KERNEL_SHARED_SPAN)));

        let heap_frames =
            frame_allocator::allocate_contiguous(HEAP_BYTES, PhysicalAddress::new(0))?;
        // SAFETY: the range was just reserved from the frame allocator and
        // is identity mapped by the directory activated above.
        unsafe {
            crate::KERNEL_HEAP.init(heap_frames.as_addr().as_u32() as *mut u8, HEAP_BYTES);
        }
        log::info!(
            "mm: heap of {} KiB at {:#x}, kernel directory at frame {}",
            HEAP_BYTES / 1024,
            heap_frames.as_addr().as_u32(),
            dir.frame().as_u32()
        );
        Ok(())
    }

    /// The kernel page directory and the number of directory entries user
    /// address spaces mirror from it.
    pub fn kernel_directory() -> (PageDirectory, usize) {
        *KERNEL_DIR.wait()
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use kernel_space::{init, kernel_directory};

/// Kind of a physical memory region reported by the boot loader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Usable RAM
    Available,
    /// Anything else: ROM, ACPI, holes, defective
    Reserved,
}

/// One region of the boot memory map
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: RegionKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_address_split() {
        let va = VirtualAddress::new(0x0804_8123);
        assert_eq!(va.directory_index(), 0x0804_8123 >> 22);
        assert_eq!(va.table_index(), (0x0804_8123 >> 12) & 0x3FF);
        assert_eq!(va.page_offset(), 0x123);
    }

    #[test]
    fn physical_address_rounding() {
        assert_eq!(PhysicalAddress::new(0x1001).frame_aligned_down().0, 0x1000);
        assert_eq!(PhysicalAddress::new(0x1001).frame_aligned_up().0, 0x2000);
        assert_eq!(PhysicalAddress::new(0x2000).frame_aligned_up().0, 0x2000);
    }
}

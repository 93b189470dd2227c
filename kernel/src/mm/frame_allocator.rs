//! Physical frame allocator
//!
//! One bit per 4 KiB frame across the whole 32-bit physical range: 1 Mi
//! frames tracked in 32768 words, 128 KiB of static state. A set bit means
//! the frame is used; the allocator starts with everything used and the
//! boot memory map opens up the available regions.
//!
//! Every public operation on the global instance runs with interrupts
//! masked: allocation is reached from interrupt context (page fault, tick
//! handlers spawning work).

use spin::Mutex;

use super::{MemoryRegion, PhysicalAddress, RegionKind, FRAME_SIZE};
use crate::error::KernelError;
use crate::sync::InterruptGuard;

/// Number of frames needed to cover 4 GiB
pub const MAX_FRAMES: usize = 1 << 20;

const BITMAP_WORDS: usize = MAX_FRAMES / 32;

/// Physical frame number (physical address / 4096)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameNumber(u32);

impl FrameNumber {
    pub const fn new(num: u32) -> Self {
        Self(num)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    pub const fn as_addr(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * FRAME_SIZE as u32)
    }

    pub const fn offset(&self, frames: u32) -> Self {
        Self(self.0 + frames)
    }
}

/// Bitmap-based physical frame manager
pub struct FrameAllocator {
    /// 1 = used, 0 = free
    bitmap: [u32; BITMAP_WORDS],
    free_frames: u32,
    used_frames: u32,
    highest_address: u32,
}

impl FrameAllocator {
    /// All frames start out used; `init` opens up the available ranges.
    pub const fn new() -> Self {
        Self {
            bitmap: [u32::MAX; BITMAP_WORDS],
            free_frames: 0,
            used_frames: MAX_FRAMES as u32,
            highest_address: 0,
        }
    }

    /// Consume the boot memory map. Available regions are rounded inward
    /// (base up, length down); everything else stays used. Frame 0 and the
    /// frames overlapping the kernel image are pinned used so they are
    /// never handed out.
    pub fn init(&mut self, regions: &[MemoryRegion], kernel_start: u32, kernel_end: u32) {
        for region in regions {
            if region.kind != RegionKind::Available {
                continue;
            }
            // Only the first 4 GiB is addressable on this machine.
            if region.base >= u32::MAX as u64 {
                continue;
            }
            let base = region.base as u32;
            let length = u64::min(region.length, u32::MAX as u64 - region.base as u64) as u32;
            self.mark_region_free(base, length);
            if base.saturating_add(length) > self.highest_address {
                self.highest_address = base.saturating_add(length);
            }
        }

        // Frame 0 stays used so null pointers never alias real memory.
        if self.is_free(0) {
            self.set_used(0);
        }

        // The kernel image is pinned, rounded outward.
        self.mark_region_used(kernel_start, kernel_end.saturating_sub(kernel_start));

        log::info!(
            "frame allocator: {} free / {} used frames, highest address {:#x}",
            self.free_frames,
            self.used_frames,
            self.highest_address
        );
    }

    /// First free frame at or above `min_addr`.
    pub fn allocate_frame(&mut self, min_addr: PhysicalAddress) -> Result<FrameNumber, KernelError> {
        let min_frame = min_addr.frame_aligned_up().as_frame().as_u32();
        let frame = self
            .find_first_free(min_frame)
            .ok_or(KernelError::OutOfFrames)?;
        self.set_used(frame);
        log::trace!("allocate_frame() -> frame {}", frame);
        Ok(FrameNumber::new(frame))
    }

    /// First run of `ceil(bytes / 4096)` consecutive free frames at or
    /// above `min_addr`, marked used as one step.
    pub fn allocate_contiguous(
        &mut self,
        bytes: usize,
        min_addr: PhysicalAddress,
    ) -> Result<FrameNumber, KernelError> {
        let frames_needed = bytes.div_ceil(FRAME_SIZE) as u32;
        if frames_needed == 0 {
            return Err(KernelError::BadArgument);
        }
        if frames_needed == 1 {
            return self.allocate_frame(min_addr);
        }

        let mut search_from = min_addr.frame_aligned_up().as_frame().as_u32();
        loop {
            let first = self
                .find_first_free(search_from)
                .ok_or(KernelError::OutOfFrames)?;

            let mut run = 1;
            while run < frames_needed {
                let candidate = first + run;
                if candidate as usize >= MAX_FRAMES || !self.is_free(candidate) {
                    break;
                }
                run += 1;
            }
            if run == frames_needed {
                for i in 0..frames_needed {
                    self.set_used(first + i);
                }
                log::trace!(
                    "allocate_contiguous({} bytes) -> {} frames from {}",
                    bytes,
                    frames_needed,
                    first
                );
                return Ok(FrameNumber::new(first));
            }
            // The run was broken; resume searching past the used frame.
            search_from = first + run + 1;
        }
    }

    /// Freeing a frame that is not used is fatal: it means some owner lost
    /// track of its memory.
    pub fn free_frame(&mut self, frame: FrameNumber) {
        let num = frame.as_u32();
        assert!(
            !self.is_free(num),
            "freeing unused physical frame {}",
            num
        );
        self.set_free(num);
        log::trace!("free_frame({})", num);
    }

    /// Free `ceil(bytes / 4096)` frames starting at `base`.
    pub fn free_contiguous(&mut self, base: FrameNumber, bytes: usize) {
        let frames = bytes.div_ceil(FRAME_SIZE) as u32;
        for i in 0..frames {
            self.free_frame(base.offset(i));
        }
    }

    pub fn free_frames(&self) -> u32 {
        self.free_frames
    }

    pub fn used_frames(&self) -> u32 {
        self.used_frames
    }

    pub fn total_frames(&self) -> u32 {
        MAX_FRAMES as u32
    }

    pub fn highest_address(&self) -> u32 {
        self.highest_address
    }

    /// Log a one-line usage summary.
    pub fn log_usage(&self) {
        log::info!(
            "frames: {} used, {} free, highest address {:#x}",
            self.used_frames,
            self.free_frames,
            self.highest_address
        );
    }

    fn mark_region_free(&mut self, base: u32, length: u32) {
        // Round inward: only whole frames fully inside the region open up.
        let first_addr = PhysicalAddress::new(base).frame_aligned_up().as_u32();
        let end_addr = PhysicalAddress::new(base.saturating_add(length).min(u32::MAX))
            .frame_aligned_down()
            .as_u32();
        let first = first_addr / FRAME_SIZE as u32;
        let count = end_addr.saturating_sub(first_addr) / FRAME_SIZE as u32;
        for i in 0..count {
            let frame = first + i;
            if (frame as usize) < MAX_FRAMES && !self.is_free(frame) {
                self.set_free(frame);
            }
        }
    }

    fn mark_region_used(&mut self, base: u32, length: u32) {
        // Round outward: every frame the region touches is pinned.
        let first_addr = PhysicalAddress::new(base).frame_aligned_down().as_u32();
        let end_addr = PhysicalAddress::new(base.saturating_add(length).min(u32::MAX))
            .frame_aligned_up()
            .as_u32();
        let first = first_addr / FRAME_SIZE as u32;
        let count = end_addr.saturating_sub(first_addr) / FRAME_SIZE as u32;
        for i in 0..count {
            let frame = first + i;
            if (frame as usize) < MAX_FRAMES && self.is_free(frame) {
                self.set_used(frame);
            }
        }
    }

    fn is_free(&self, frame: u32) -> bool {
        self.bitmap[frame as usize / 32] & (1 << (frame % 32)) == 0
    }

    fn set_used(&mut self, frame: u32) {
        debug_assert!(self.is_free(frame));
        self.bitmap[frame as usize / 32] |= 1 << (frame % 32);
        self.free_frames -= 1;
        self.used_frames += 1;
    }

    fn set_free(&mut self, frame: u32) {
        debug_assert!(!self.is_free(frame));
        self.bitmap[frame as usize / 32] &= !(1 << (frame % 32));
        self.free_frames += 1;
        self.used_frames -= 1;
    }

    fn find_first_free(&self, min_frame: u32) -> Option<u32> {
        let start_word = min_frame as usize / 32;
        for word_idx in start_word..BITMAP_WORDS {
            let word = self.bitmap[word_idx];
            if word == u32::MAX {
                continue;
            }
            let start_bit = if word_idx == start_word {
                min_frame as usize % 32
            } else {
                0
            };
            for bit in start_bit..32 {
                if word & (1 << bit) == 0 {
                    return Some((word_idx * 32 + bit) as u32);
                }
            }
        }
        None
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Global frame allocator instance
pub static FRAME_ALLOCATOR: Mutex<FrameAllocator> = Mutex::new(FrameAllocator::new());

/// Allocate one frame from the global allocator, interrupts masked.
pub fn allocate_frame(min_addr: PhysicalAddress) -> Result<FrameNumber, KernelError> {
    let _guard = InterruptGuard::acquire();
    FRAME_ALLOCATOR.lock().allocate_frame(min_addr)
}

/// Allocate a contiguous run from the global allocator, interrupts masked.
pub fn allocate_contiguous(
    bytes: usize,
    min_addr: PhysicalAddress,
) -> Result<FrameNumber, KernelError> {
    let _guard = InterruptGuard::acquire();
    FRAME_ALLOCATOR.lock().allocate_contiguous(bytes, min_addr)
}

/// Free one frame in the global allocator, interrupts masked.
pub fn free_frame(frame: FrameNumber) {
    let _guard = InterruptGuard::acquire();
    FRAME_ALLOCATOR.lock().free_frame(frame);
}

/// Free a contiguous run in the global allocator, interrupts masked.
pub fn free_contiguous(base: FrameNumber, bytes: usize) {
    let _guard = InterruptGuard::acquire();
    FRAME_ALLOCATOR.lock().free_contiguous(base, bytes);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::boxed::Box;

    use super::*;

    // The allocator is 128 KiB of bitmap; keep it off the test stack.
    fn fresh(available_mib: u32) -> Box<FrameAllocator> {
        let mut fa = Box::new(FrameAllocator::new());
        fa.init(
            &[MemoryRegion {
                base: 0,
                length: available_mib as u64 * 1024 * 1024,
                kind: RegionKind::Available,
            }],
            0x10_0000,
            0x20_0000,
        );
        fa
    }

    #[test]
    fn conservation_across_allocate_and_free() {
        let mut fa = fresh(16);
        let total = fa.total_frames();
        assert_eq!(fa.free_frames() + fa.used_frames(), total);

        let a = fa.allocate_frame(PhysicalAddress::new(0)).unwrap();
        let b = fa
            .allocate_contiguous(3 * FRAME_SIZE, PhysicalAddress::new(0))
            .unwrap();
        assert_eq!(fa.free_frames() + fa.used_frames(), total);

        fa.free_frame(a);
        fa.free_contiguous(b, 3 * FRAME_SIZE);
        assert_eq!(fa.free_frames() + fa.used_frames(), total);
    }

    #[test]
    fn no_frame_returned_twice_without_free() {
        let mut fa = fresh(16);
        let mut seen = alloc::vec::Vec::new();
        for _ in 0..64 {
            let f = fa.allocate_frame(PhysicalAddress::new(0)).unwrap();
            assert!(!seen.contains(&f.as_u32()), "frame {} handed out twice", f.as_u32());
            seen.push(f.as_u32());
        }
    }

    #[test]
    fn frame_zero_and_kernel_image_stay_used() {
        let mut fa = fresh(16);
        let f = fa.allocate_frame(PhysicalAddress::new(0)).unwrap();
        assert_ne!(f.as_u32(), 0);
        // Kernel image pinned at 1-2 MiB in `fresh`.
        assert!(f.as_addr().as_u32() < 0x10_0000 || f.as_addr().as_u32() >= 0x20_0000);
    }

    #[test]
    fn contiguous_run_is_consecutive_and_respects_min_addr() {
        let mut fa = fresh(16);
        let min = PhysicalAddress::new(0x20_0000);
        let base = fa.allocate_contiguous(5 * FRAME_SIZE, min).unwrap();
        assert!(base.as_addr() >= min);
        // The run is used; a following single allocation lands after it.
        let next = fa.allocate_frame(min).unwrap();
        assert_eq!(next.as_u32(), base.as_u32() + 5);
    }

    #[test]
    fn contiguous_skips_broken_runs() {
        let mut fa = fresh(16);
        let min = PhysicalAddress::new(0x20_0000);
        // Poke a hole: allocate two frames, free the first, so the first
        // free frame is followed by a used one.
        let a = fa.allocate_frame(min).unwrap();
        let _b = fa.allocate_frame(min).unwrap();
        fa.free_frame(a);
        let run = fa.allocate_contiguous(4 * FRAME_SIZE, min).unwrap();
        assert!(run.as_u32() > a.as_u32());
    }

    #[test]
    #[should_panic(expected = "freeing unused physical frame")]
    fn double_free_is_fatal() {
        let mut fa = fresh(16);
        let f = fa.allocate_frame(PhysicalAddress::new(0)).unwrap();
        fa.free_frame(f);
        fa.free_frame(f);
    }

    #[test]
    fn reserved_regions_are_not_handed_out() {
        let mut fa = Box::new(FrameAllocator::new());
        fa.init(
            &[
                MemoryRegion {
                    base: 0,
                    length: 0x9_F000,
                    kind: RegionKind::Available,
                },
                MemoryRegion {
                    base: 0x9_F000,
                    length: 0x6_1000,
                    kind: RegionKind::Reserved,
                },
                MemoryRegion {
                    base: 0x10_0000,
                    length: 0x40_0000,
                    kind: RegionKind::Available,
                },
            ],
            0x10_0000,
            0x18_0000,
        );
        // Allocate everything and confirm nothing falls in the hole.
        while let Ok(f) = fa.allocate_frame(PhysicalAddress::new(0)) {
            let addr = f.as_addr().as_u32();
            assert!(!(0x9_F000..0x10_0000).contains(&addr));
            assert!(!(0x10_0000..0x18_0000).contains(&addr));
        }
    }

    #[test]
    fn available_regions_round_inward() {
        let mut fa = Box::new(FrameAllocator::new());
        // Base 0x1800 rounds up to 0x2000; length shrinks accordingly.
        fa.init(
            &[MemoryRegion {
                base: 0x1800,
                length: 0x3000,
                kind: RegionKind::Available,
            }],
            0x10_0000,
            0x10_1000,
        );
        let f = fa.allocate_frame(PhysicalAddress::new(0)).unwrap();
        assert_eq!(f.as_addr().as_u32(), 0x2000);
    }
}

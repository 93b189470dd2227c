//! Kernel heap
//!
//! A first-fit split/coalesce allocator over one contiguous pinned frame
//! range. Every block is a header followed by its payload; headers form a
//! doubly-linked list from a free head sentinel to a permanently-used tail
//! sentinel, so coalescing never has to special-case the ends. The magic
//! word in each header detects payload overflow and underflow.
//!
//! On bare metal the heap backs `#[global_allocator]`; on the host it is
//! exercised over plain byte buffers by the unit tests.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use spin::Mutex;

use crate::error::KernelError;
use crate::sync::InterruptGuard;

/// Magic word stamped into every block header
pub const HEAP_MAGIC: u32 = 0x6FEB;

/// Payload sizes and header placement are multiples of this, so the global
/// allocator can serve any layout with `align <= MIN_ALIGN`.
pub const MIN_ALIGN: usize = 16;

#[repr(C, align(16))]
struct BlockHeader {
    used: u32,
    magic: u32,
    size: usize,
    prev: *mut BlockHeader,
    next: *mut BlockHeader,
}

const HDR: usize = core::mem::size_of::<BlockHeader>();

/// Best-effort variable-size allocator over a fixed memory range
pub struct BlockHeap {
    start: *mut u8,
    size: usize,
    available: usize,
    head: *mut BlockHeader,
    tail: *mut BlockHeader,
}

// SAFETY: the raw pointers refer to the heap's own exclusive memory range;
// access is serialized by the lock wrapping every instance.
unsafe impl Send for BlockHeap {}

impl BlockHeap {
    /// Build a heap over `[start, start + size)`.
    ///
    /// # Safety
    ///
    /// `start` must be valid for reads and writes of `size` bytes, aligned
    /// to 16, exclusively owned by the heap, and `size` must leave room
    /// for the two sentinels.
    pub unsafe fn new(start: *mut u8, size: usize) -> Self {
        assert!(size > 4 * HDR, "heap range too small");
        assert_eq!(start as usize % MIN_ALIGN, 0, "heap range misaligned");

        let head = start as *mut BlockHeader;
        // SAFETY: both sentinels lie inside the caller-guaranteed range.
        let tail = unsafe { start.add(size - HDR) } as *mut BlockHeader;
        unsafe {
            (*head).used = 0;
            (*head).magic = HEAP_MAGIC;
            (*head).size = size - 2 * HDR;
            (*head).prev = ptr::null_mut();
            (*head).next = tail;

            // The tail is marked used so it is never coalesced away.
            (*tail).used = 1;
            (*tail).magic = HEAP_MAGIC;
            (*tail).size = 0;
            (*tail).prev = head;
            (*tail).next = ptr::null_mut();
        }

        Self {
            start,
            size,
            available: size - 2 * HDR,
            head,
            tail,
        }
    }

    /// First free block large enough; split when the remainder can hold a
    /// header and a minimal payload.
    pub fn allocate(&mut self, size: usize) -> Result<*mut u8, KernelError> {
        let size = round_up(size.max(1));

        let mut curr = self.head;
        while !curr.is_null() {
            // SAFETY: curr walks the intact header list inside our range.
            unsafe {
                if (*curr).used == 0 && (*curr).size >= size {
                    break;
                }
                curr = (*curr).next;
            }
        }
        if curr.is_null() {
            log::warn!("kernel heap: no free block for {} bytes", size);
            return Err(KernelError::OutOfMemory);
        }

        unsafe {
            if (*curr).size >= size + HDR + MIN_ALIGN {
                // Carve the tail of the block into a new free block.
                let new_free = (curr as *mut u8).add(HDR + size) as *mut BlockHeader;
                let next = (*curr).next;
                (*new_free).used = 0;
                (*new_free).magic = HEAP_MAGIC;
                (*new_free).size = (*curr).size - HDR - size;
                (*new_free).prev = curr;
                (*new_free).next = next;
                if !next.is_null() {
                    (*next).prev = new_free;
                }
                (*curr).size = size;
                (*curr).next = new_free;
                self.available -= HDR;
            }
            (*curr).used = 1;
            self.available -= (*curr).size;
            let payload = (curr as *mut u8).add(HDR);
            log::trace!("heap allocate({}) -> {:p}", size, payload);
            Ok(payload)
        }
    }

    /// Return a payload pointer previously handed out by `allocate`.
    ///
    /// Magic mismatch is fatal: it means the payload before or after this
    /// one was overrun.
    ///
    /// # Safety
    ///
    /// `payload` must come from `allocate` on this heap and not have been
    /// freed through a different alias since.
    pub unsafe fn free(&mut self, payload: *mut u8) {
        // SAFETY: per contract the header sits immediately below the payload.
        let block = unsafe { payload.sub(HDR) } as *mut BlockHeader;
        unsafe {
            assert_eq!((*block).magic, HEAP_MAGIC, "heap underflow detected at {:p}", payload);
            let next = (*block).next;
            if !next.is_null() {
                assert_eq!((*next).magic, HEAP_MAGIC, "heap overflow detected at {:p}", payload);
            }
            if (*block).used == 0 {
                return; // already freed
            }

            (*block).used = 0;
            self.available += (*block).size;

            // Poison the payload so stale references fail loudly.
            ptr::write_bytes(payload, 0, (*block).size);

            // Coalesce forward first, then backward, so a free block never
            // neighbors another free block.
            if !next.is_null() && (*next).used == 0 {
                (*block).next = (*next).next;
                if !(*next).next.is_null() {
                    (*(*next).next).prev = block;
                }
                (*block).size += HDR + (*next).size;
                self.available += HDR;
            }
            let prev = (*block).prev;
            if !prev.is_null() && (*prev).used == 0 {
                (*prev).next = (*block).next;
                if !(*block).next.is_null() {
                    (*(*block).next).prev = prev;
                }
                (*prev).size += HDR + (*block).size;
                self.available += HDR;
            }
        }
    }

    /// Bytes the heap manages in total.
    pub fn total_bytes(&self) -> usize {
        self.size
    }

    /// Bytes still allocatable (excludes headers).
    pub fn free_bytes(&self) -> usize {
        self.available
    }

    /// Walk the whole block list and verify every structural invariant:
    /// the walk reaches the tail, prev/next agree, magics are intact, and
    /// no two adjacent blocks are both free.
    pub fn check_integrity(&self) -> Result<(), &'static str> {
        let mut curr = self.head;
        let mut prev: *mut BlockHeader = ptr::null_mut();
        let mut reached_tail = false;

        while !curr.is_null() {
            // SAFETY: walking headers within the heap range.
            unsafe {
                if (*curr).magic != HEAP_MAGIC {
                    return Err("bad magic");
                }
                if (*curr).prev != prev {
                    return Err("prev link mismatch");
                }
                if !prev.is_null() && (*prev).used == 0 && (*curr).used == 0 {
                    return Err("adjacent free blocks");
                }
                if curr == self.tail {
                    reached_tail = true;
                }
                prev = curr;
                curr = (*curr).next;
            }
        }
        if !reached_tail {
            return Err("walk did not reach the tail sentinel");
        }
        Ok(())
    }

    /// Log a per-block dump plus a usage summary.
    pub fn log_blocks(&self) {
        let mut curr = self.head;
        let mut free_blocks = 0usize;
        let mut used_blocks = 0usize;
        while !curr.is_null() {
            // SAFETY: walking headers within the heap range.
            unsafe {
                log::debug!(
                    "  {:p} {:>8} {}",
                    curr,
                    (*curr).size,
                    if (*curr).used != 0 { "used" } else { "free" }
                );
                if (*curr).used != 0 {
                    used_blocks += 1;
                } else {
                    free_blocks += 1;
                }
                curr = (*curr).next;
            }
        }
        log::debug!(
            "heap: {} bytes free of {}, {} used / {} free blocks",
            self.available,
            self.size,
            used_blocks,
            free_blocks
        );
    }
}

fn round_up(size: usize) -> usize {
    (size + MIN_ALIGN - 1) & !(MIN_ALIGN - 1)
}

/// Lock wrapper making the block heap usable as the global allocator.
pub struct LockedBlockHeap {
    inner: Mutex<Option<BlockHeap>>,
}

impl LockedBlockHeap {
    pub const fn empty() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Hand the heap its backing range.
    ///
    /// # Safety
    ///
    /// Same contract as [`BlockHeap::new`]; must be called once, before
    /// the first allocation.
    pub unsafe fn init(&self, start: *mut u8, size: usize) {
        let _guard = InterruptGuard::acquire();
        // SAFETY: forwarded caller contract.
        *self.inner.lock() = Some(unsafe { BlockHeap::new(start, size) });
    }

    /// Free bytes, for diagnostics and the smoke suite.
    pub fn free_bytes(&self) -> usize {
        let _guard = InterruptGuard::acquire();
        self.inner.lock().as_ref().map_or(0, BlockHeap::free_bytes)
    }
}

// SAFETY: allocation returns 16-aligned payloads from an exclusively owned
// range; larger alignments are refused with null per the GlobalAlloc
// contract.
unsafe impl GlobalAlloc for LockedBlockHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MIN_ALIGN {
            return ptr::null_mut();
        }
        let _guard = InterruptGuard::acquire();
        match self.inner.lock().as_mut() {
            Some(heap) => heap.allocate(layout.size()).unwrap_or(ptr::null_mut()),
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let _guard = InterruptGuard::acquire();
        if let Some(heap) = self.inner.lock().as_mut() {
            // SAFETY: the pointer came from `alloc` above.
            unsafe { heap.free(ptr) };
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::vec;
    use alloc::vec::Vec;

    use super::*;

    struct TestArena {
        // Kept alive for the duration of a test; the heap points into it.
        _storage: Vec<u128>,
        heap: BlockHeap,
    }

    fn arena(size: usize) -> TestArena {
        let mut storage = vec![0u128; size / 16];
        let start = storage.as_mut_ptr() as *mut u8;
        let heap = unsafe { BlockHeap::new(start, size) };
        TestArena {
            _storage: storage,
            heap,
        }
    }

    #[test]
    fn conservation_over_matched_pairs() {
        let mut a = arena(64 * 1024);
        let initial = a.heap.free_bytes();

        let mut ptrs = Vec::new();
        for size in [1usize, 16, 17, 100, 1024, 4000] {
            ptrs.push(a.heap.allocate(size).unwrap());
        }
        assert!(a.heap.free_bytes() < initial);
        for p in ptrs {
            unsafe { a.heap.free(p) };
        }
        assert_eq!(a.heap.free_bytes(), initial);
        a.heap.check_integrity().unwrap();
    }

    #[test]
    fn walk_is_consistent_after_interleaved_ops() {
        let mut a = arena(64 * 1024);
        let p1 = a.heap.allocate(100).unwrap();
        let p2 = a.heap.allocate(200).unwrap();
        let p3 = a.heap.allocate(300).unwrap();
        a.heap.check_integrity().unwrap();

        unsafe { a.heap.free(p2) };
        a.heap.check_integrity().unwrap();

        // Fits exactly in the freed middle block region.
        let p4 = a.heap.allocate(128).unwrap();
        a.heap.check_integrity().unwrap();

        unsafe {
            a.heap.free(p1);
            a.heap.free(p3);
            a.heap.free(p4);
        }
        a.heap.check_integrity().unwrap();
    }

    #[test]
    fn coalescing_reunites_the_arena() {
        let mut a = arena(16 * 1024);
        let initial = a.heap.free_bytes();
        let p1 = a.heap.allocate(512).unwrap();
        let p2 = a.heap.allocate(512).unwrap();
        let p3 = a.heap.allocate(512).unwrap();
        // Free in an order that exercises both directions of coalescing.
        unsafe {
            a.heap.free(p1);
            a.heap.free(p3);
            a.heap.free(p2);
        }
        assert_eq!(a.heap.free_bytes(), initial);
        // After full coalescing, one allocation of almost everything works.
        let big = a.heap.allocate(initial - MIN_ALIGN).unwrap();
        assert!(!big.is_null());
    }

    #[test]
    fn freed_memory_is_poisoned() {
        let mut a = arena(8 * 1024);
        let p = a.heap.allocate(64).unwrap();
        unsafe {
            ptr::write_bytes(p, 0xAB, 64);
            a.heap.free(p);
            for i in 0..64 {
                assert_eq!(*p.add(i), 0);
            }
        }
    }

    #[test]
    fn double_free_is_ignored() {
        let mut a = arena(8 * 1024);
        let initial = a.heap.free_bytes();
        let p = a.heap.allocate(64).unwrap();
        unsafe {
            a.heap.free(p);
            a.heap.free(p);
        }
        assert_eq!(a.heap.free_bytes(), initial);
    }

    #[test]
    #[should_panic(expected = "heap overflow detected")]
    fn payload_overrun_is_fatal_on_free() {
        let mut a = arena(8 * 1024);
        let p = a.heap.allocate(32).unwrap();
        unsafe {
            // Stomp the next header's magic.
            ptr::write_bytes(p, 0xFF, 32 + 8);
            a.heap.free(p);
        }
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let mut a = arena(4 * 1024);
        assert_eq!(a.heap.allocate(1 << 20), Err(KernelError::OutOfMemory));
    }
}

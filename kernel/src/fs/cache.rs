//! Block cache
//!
//! A fixed number of slots over one contiguous data buffer, a
//! `block_no → slot` hash with chained collisions, and an LRU recency
//! list. All links are slot indices into the arena, so the cache never
//! allocates per entry.
//!
//! Write-back: writes dirty the cached block only; the device sees it when
//! the block is evicted or on `flush`. An evicted dirty block is written
//! back *before* its slot is reused — that ordering is what guarantees no
//! lost update. If that write-back fails, the triggering operation aborts
//! and the victim stays dirty and cached, so a retry is possible.

use alloc::vec;
use alloc::vec::Vec;

use super::super::drivers::storage::StorageDevice;
use crate::error::KernelError;

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    block_no: u64,
    used: bool,
    dirty: bool,
    lru_older: Option<usize>,
    lru_newer: Option<usize>,
    hash_next: Option<usize>,
}

pub struct BlockCache<D: StorageDevice> {
    device: D,
    block_size: usize,
    capacity: usize,
    /// One fixed data area; slot `i` owns bytes `[i*block_size, (i+1)*block_size)`
    data: Vec<u8>,
    slots: Vec<Slot>,
    hash_heads: Vec<Option<usize>>,
    lru_newest: Option<usize>,
    lru_oldest: Option<usize>,
    used_slots: usize,
}

impl<D: StorageDevice> BlockCache<D> {
    /// `block_size` must be a whole multiple of the device's sector size.
    pub fn new(device: D, block_size: usize, capacity: usize) -> Self {
        assert!(capacity > 0, "cache needs at least one slot");
        assert_eq!(
            block_size % device.sector_size(),
            0,
            "block size must be a multiple of the sector size"
        );
        Self {
            device,
            block_size,
            capacity,
            data: vec![0u8; block_size * capacity],
            slots: vec![Slot::default(); capacity],
            hash_heads: vec![None; capacity],
            lru_newest: None,
            lru_oldest: None,
            used_slots: 0,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Tear the cache down and hand the device back. Dirty blocks are not
    /// written; call `flush` first.
    pub fn into_device(self) -> D {
        self.device
    }

    /// Copy bytes out of a block, loading it from the device on a miss.
    pub fn read(
        &mut self,
        block_no: u64,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<(), KernelError> {
        if offset + buf.len() > self.block_size {
            return Err(KernelError::OutOfBounds);
        }
        let slot = self.entry_for(block_no)?;
        let base = slot * self.block_size + offset;
        buf.copy_from_slice(&self.data[base..base + buf.len()]);
        Ok(())
    }

    /// Mutate the cached block and mark it dirty. A zero-length write is a
    /// no-op and does not dirty anything.
    pub fn write(&mut self, block_no: u64, offset: usize, data: &[u8]) -> Result<(), KernelError> {
        if data.is_empty() {
            return Ok(());
        }
        if offset + data.len() > self.block_size {
            return Err(KernelError::OutOfBounds);
        }
        let slot = self.entry_for(block_no)?;
        let base = slot * self.block_size + offset;
        self.data[base..base + data.len()].copy_from_slice(data);
        self.slots[slot].dirty = true;
        Ok(())
    }

    /// Zero a whole block (file truncation / fresh allocation).
    pub fn wipe(&mut self, block_no: u64) -> Result<(), KernelError> {
        let slot = self.entry_for(block_no)?;
        let base = slot * self.block_size;
        self.data[base..base + self.block_size].fill(0);
        self.slots[slot].dirty = true;
        Ok(())
    }

    /// Write every dirty block back and clear the dirty flags.
    pub fn flush(&mut self) -> Result<(), KernelError> {
        for slot in 0..self.capacity {
            if self.slots[slot].used && self.slots[slot].dirty {
                self.save_slot(slot)?;
                self.slots[slot].dirty = false;
            }
        }
        Ok(())
    }

    /// Is this block currently cached? (diagnostics and tests)
    pub fn contains(&self, block_no: u64) -> bool {
        self.find_slot(block_no).is_some()
    }

    /// Is this block cached and dirty?
    pub fn is_dirty(&self, block_no: u64) -> bool {
        self.find_slot(block_no)
            .is_some_and(|slot| self.slots[slot].dirty)
    }

    pub fn used_slot_count(&self) -> usize {
        self.used_slots
    }

    /// Locate or load the block, leaving it at the newest end of the LRU
    /// list. Returns the slot index.
    fn entry_for(&mut self, block_no: u64) -> Result<usize, KernelError> {
        if let Some(slot) = self.find_slot(block_no) {
            self.promote(slot);
            return Ok(slot);
        }

        let slot = if self.used_slots >= self.capacity {
            self.evict_oldest()?
        } else {
            self.find_unused_slot()?
        };

        // Fill the slot before it becomes findable. A failed read-through
        // releases the claim and surfaces the error; nothing is dirtied.
        self.slots[slot].used = true;
        self.used_slots += 1;
        if let Err(err) = self.load_slot(slot, block_no) {
            self.slots[slot].used = false;
            self.used_slots -= 1;
            return Err(err);
        }
        self.slots[slot].block_no = block_no;
        self.slots[slot].dirty = false;
        self.attach(slot, block_no);
        Ok(slot)
    }

    fn hash_bucket(&self, block_no: u64) -> usize {
        (block_no % self.capacity as u64) as usize
    }

    fn find_slot(&self, block_no: u64) -> Option<usize> {
        let mut cursor = self.hash_heads[self.hash_bucket(block_no)];
        while let Some(slot) = cursor {
            if self.slots[slot].block_no == block_no && self.slots[slot].used {
                return Some(slot);
            }
            cursor = self.slots[slot].hash_next;
        }
        None
    }

    /// Move a slot to the newest end of the LRU list.
    fn promote(&mut self, slot: usize) {
        if self.lru_newest == Some(slot) {
            return;
        }
        // Unlink from its current position.
        if self.lru_oldest == Some(slot) {
            self.lru_oldest = self.slots[slot].lru_newer;
        }
        if let Some(newer) = self.slots[slot].lru_newer {
            self.slots[newer].lru_older = self.slots[slot].lru_older;
        }
        if let Some(older) = self.slots[slot].lru_older {
            self.slots[older].lru_newer = self.slots[slot].lru_newer;
        }
        // Relink at the newest end.
        if let Some(newest) = self.lru_newest {
            self.slots[newest].lru_newer = Some(slot);
        }
        self.slots[slot].lru_older = self.lru_newest;
        self.slots[slot].lru_newer = None;
        self.lru_newest = Some(slot);
    }

    /// Link a freshly-filled slot into the LRU list and its hash chain.
    fn attach(&mut self, slot: usize, block_no: u64) {
        match self.lru_newest {
            None => {
                self.lru_newest = Some(slot);
                self.lru_oldest = Some(slot);
                self.slots[slot].lru_newer = None;
                self.slots[slot].lru_older = None;
            }
            Some(newest) => {
                self.slots[newest].lru_newer = Some(slot);
                self.slots[slot].lru_older = Some(newest);
                self.slots[slot].lru_newer = None;
                self.lru_newest = Some(slot);
            }
        }
        let bucket = self.hash_bucket(block_no);
        self.slots[slot].hash_next = self.hash_heads[bucket];
        self.hash_heads[bucket] = Some(slot);
    }

    /// Evict the least-recently-used entry and hand back its slot. A dirty
    /// victim is written back first; a write-back failure leaves it fully
    /// intact (dirty, hashed, in the LRU list) and aborts the caller.
    fn evict_oldest(&mut self) -> Result<usize, KernelError> {
        let oldest = self.lru_oldest.ok_or(KernelError::ResourcesExhausted)?;

        if self.slots[oldest].dirty {
            self.save_slot(oldest)?;
            self.slots[oldest].dirty = false;
        }

        // Unlink from the LRU list.
        if self.lru_newest == Some(oldest) {
            self.lru_newest = None;
            self.lru_oldest = None;
        } else {
            let second = self.slots[oldest].lru_newer.expect("broken LRU list");
            self.slots[second].lru_older = None;
            self.lru_oldest = Some(second);
        }

        // Unlink from the hash chain.
        let bucket = self.hash_bucket(self.slots[oldest].block_no);
        if self.hash_heads[bucket] == Some(oldest) {
            self.hash_heads[bucket] = self.slots[oldest].hash_next;
        } else {
            let mut cursor = self.hash_heads[bucket];
            while let Some(slot) = cursor {
                if self.slots[slot].hash_next == Some(oldest) {
                    self.slots[slot].hash_next = self.slots[oldest].hash_next;
                    break;
                }
                cursor = self.slots[slot].hash_next;
            }
        }

        self.slots[oldest].used = false;
        self.slots[oldest].hash_next = None;
        self.used_slots -= 1;
        log::trace!("cache: evicted block {}", self.slots[oldest].block_no);
        Ok(oldest)
    }

    fn find_unused_slot(&self) -> Result<usize, KernelError> {
        self.slots
            .iter()
            .position(|s| !s.used)
            .ok_or(KernelError::ResourcesExhausted)
    }

    fn load_slot(&mut self, slot: usize, block_no: u64) -> Result<(), KernelError> {
        let sector_size = self.device.sector_size();
        let sectors = self.block_size / sector_size;
        let first_sector = block_no * sectors as u64;
        let base = slot * self.block_size;
        self.device
            .read_sectors(first_sector, sectors, &mut self.data[base..base + self.block_size])?;
        Ok(())
    }

    fn save_slot(&mut self, slot: usize) -> Result<(), KernelError> {
        let sector_size = self.device.sector_size();
        let sectors = self.block_size / sector_size;
        let first_sector = self.slots[slot].block_no * sectors as u64;
        let base = slot * self.block_size;
        self.device
            .write_sectors(first_sector, sectors, &self.data[base..base + self.block_size])?;
        Ok(())
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::drivers::storage::RamDisk;
    use crate::error::IoError;

    const BLOCK: usize = 1024;

    fn disk_with_pattern(blocks: u64) -> RamDisk {
        let mut disk = RamDisk::new("test", 512, blocks * 2);
        // Block n starts with byte n.
        for n in 0..blocks {
            let mut block = vec![0u8; BLOCK];
            block[0] = n as u8;
            disk.write_sectors(n * 2, 2, &block).unwrap();
        }
        disk
    }

    #[test]
    fn read_miss_loads_from_device() {
        let mut cache = BlockCache::new(disk_with_pattern(8), BLOCK, 3);
        let mut byte = [0u8; 1];
        cache.read(5, 0, &mut byte).unwrap();
        assert_eq!(byte[0], 5);
        assert!(cache.contains(5));
    }

    #[test]
    fn write_then_flush_then_read_survives_eviction() {
        let mut cache = BlockCache::new(disk_with_pattern(8), BLOCK, 2);
        cache.write(1, 10, b"payload").unwrap();
        cache.flush().unwrap();

        // Push block 1 out through unrelated traffic.
        let mut scratch = [0u8; 4];
        cache.read(2, 0, &mut scratch).unwrap();
        cache.read(3, 0, &mut scratch).unwrap();
        cache.read(4, 0, &mut scratch).unwrap();
        assert!(!cache.contains(1));

        let mut back = [0u8; 7];
        cache.read(1, 10, &mut back).unwrap();
        assert_eq!(&back, b"payload");
    }

    #[test]
    fn lru_victim_is_the_least_recently_accessed() {
        // Capacity 3: after touching a,b,c then d, block a is the victim.
        let mut cache = BlockCache::new(disk_with_pattern(8), BLOCK, 3);
        let mut b = [0u8; 1];
        for block in [1u64, 2, 3] {
            cache.read(block, 0, &mut b).unwrap();
        }
        cache.read(4, 0, &mut b).unwrap();
        assert!(!cache.contains(1));
        for block in [2u64, 3, 4] {
            assert!(cache.contains(block));
        }
    }

    #[test]
    fn access_promotes_against_eviction() {
        let mut cache = BlockCache::new(disk_with_pattern(8), BLOCK, 3);
        let mut b = [0u8; 1];
        for block in [1u64, 2, 3] {
            cache.read(block, 0, &mut b).unwrap();
        }
        // Re-touch 1; now 2 is oldest.
        cache.read(1, 0, &mut b).unwrap();
        cache.read(4, 0, &mut b).unwrap();
        assert!(cache.contains(1));
        assert!(!cache.contains(2));
    }

    #[test]
    fn dirty_victim_written_back_before_slot_reuse() {
        // write(3), read(4), read(5) with capacity 2 forces 3's
        // write-back before its slot is reused.
        let mut cache = BlockCache::new(disk_with_pattern(8), BLOCK, 2);
        cache.write(3, 0, b"X").unwrap();
        let mut b = [0u8; 1];
        cache.read(4, 0, &mut b).unwrap();
        cache.read(5, 0, &mut b).unwrap();
        assert!(!cache.contains(3));

        // The device saw the write even though flush was never called.
        let mut sector = [0u8; 1024];
        cache.device_mut().read_sectors(6, 2, &mut sector).unwrap();
        assert_eq!(sector[0], b'X');
    }

    #[test]
    fn clean_eviction_does_not_touch_the_device() {
        // read(1), read(2), write(3, "X"), read(1) with capacity 2 evicts
        // block 2 (clean) and keeps 3 dirty.
        let mut cache = BlockCache::new(disk_with_pattern(8), BLOCK, 2);
        let mut b = [0u8; 1];
        cache.read(1, 0, &mut b).unwrap();
        cache.read(2, 0, &mut b).unwrap();
        cache.write(3, 0, b"X").unwrap(); // evicts 1 (oldest)
        cache.read(1, 0, &mut b).unwrap(); // evicts 2
        assert!(!cache.contains(2));
        assert!(cache.contains(3));
        assert!(cache.is_dirty(3));

        // Block 3 on the device is untouched until eviction or flush.
        let mut sector = [0u8; 1024];
        cache.device_mut().read_sectors(6, 2, &mut sector).unwrap();
        assert_eq!(sector[0], 3);
    }

    #[test]
    fn zero_length_write_is_a_no_op() {
        let mut cache = BlockCache::new(disk_with_pattern(8), BLOCK, 2);
        cache.write(1, 0, b"").unwrap();
        assert!(!cache.contains(1)); // not even loaded
        let mut b = [0u8; 1];
        cache.read(1, 0, &mut b).unwrap();
        cache.write(1, 0, b"").unwrap();
        assert!(!cache.is_dirty(1));
    }

    #[test]
    fn wipe_zeroes_the_whole_block_and_dirties_it() {
        let mut cache = BlockCache::new(disk_with_pattern(8), BLOCK, 2);
        cache.wipe(1).unwrap();
        assert!(cache.is_dirty(1));
        let mut block = [0xFFu8; BLOCK];
        cache.read(1, 0, &mut block).unwrap();
        assert!(block.iter().all(|&b| b == 0));
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let mut cache = BlockCache::new(disk_with_pattern(8), BLOCK, 2);
        let mut buf = [0u8; 16];
        assert_eq!(
            cache.read(1, BLOCK - 8, &mut buf),
            Err(KernelError::OutOfBounds)
        );
        assert_eq!(
            cache.write(1, BLOCK, b"x"),
            Err(KernelError::OutOfBounds)
        );
    }

    /// Device wrapper that can be told to fail writes.
    struct FlakyDisk {
        inner: RamDisk,
        fail_writes: bool,
    }

    impl StorageDevice for FlakyDisk {
        fn name(&self) -> &str {
            "flaky"
        }
        fn sector_size(&self) -> usize {
            self.inner.sector_size()
        }
        fn sector_count(&self) -> u64 {
            self.inner.sector_count()
        }
        fn read_sectors(
            &mut self,
            sector: u64,
            count: usize,
            buf: &mut [u8],
        ) -> Result<(), IoError> {
            self.inner.read_sectors(sector, count, buf)
        }
        fn write_sectors(&mut self, sector: u64, count: usize, buf: &[u8]) -> Result<(), IoError> {
            if self.fail_writes {
                return Err(IoError::WriteError);
            }
            self.inner.write_sectors(sector, count, buf)
        }
    }

    #[test]
    fn failed_write_back_aborts_and_keeps_victim_dirty() {
        let disk = FlakyDisk {
            inner: disk_with_pattern(8),
            fail_writes: true,
        };
        let mut cache = BlockCache::new(disk, BLOCK, 1);
        cache.write(1, 0, b"dirty").unwrap();

        // The miss on block 2 needs block 1's slot; the write-back fails,
        // so the read aborts and block 1 stays cached and dirty.
        let mut b = [0u8; 1];
        assert_eq!(
            cache.read(2, 0, &mut b),
            Err(KernelError::Io(IoError::WriteError))
        );
        assert!(cache.contains(1));
        assert!(cache.is_dirty(1));

        // Once the device recovers, the same operation goes through.
        cache.device_mut().fail_writes = false;
        cache.read(2, 0, &mut b).unwrap();
        assert_eq!(b[0], 2);
        let mut sector = [0u8; 1024];
        cache.device_mut().inner.read_sectors(2, 2, &mut sector).unwrap();
        assert_eq!(&sector[..5], b"dirty");
    }

    #[test]
    fn failed_read_through_releases_the_slot() {
        let mut cache = BlockCache::new(disk_with_pattern(4), BLOCK, 2);
        let mut b = [0u8; 1];
        // Block 100 is out of range on the backing disk.
        assert!(cache.read(100, 0, &mut b).is_err());
        assert!(!cache.contains(100));
        assert_eq!(cache.used_slot_count(), 0);
        // The cache remains fully functional.
        cache.read(1, 0, &mut b).unwrap();
        assert_eq!(b[0], 1);
    }

    #[test]
    fn hash_collisions_resolve_by_chaining() {
        // Capacity 3: blocks 1, 4, 7 all hash to bucket 1.
        let mut cache = BlockCache::new(disk_with_pattern(8), BLOCK, 3);
        let mut b = [0u8; 1];
        for block in [1u64, 4, 7] {
            cache.read(block, 0, &mut b).unwrap();
        }
        for block in [1u64, 4, 7] {
            cache.read(block, 0, &mut b).unwrap();
            assert_eq!(b[0], block as u8);
        }
    }
}

//! ferrofs — the native filesystem back-end
//!
//! A small ext2-shaped layout proving the whole VFS contract: block 0
//! holds the superblock, then a block-allocation bitmap, a fixed inode
//! table, and data blocks. Inodes carry 11 direct block pointers and one
//! single-indirect block; directories are arrays of fixed 64-byte entries
//! (`.` and `..` are real entries). All device access goes through the
//! block cache; `sync` flushes it.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use super::cache::BlockCache;
use super::partition::PartitionView;
use super::{
    DirStream, FileDescriptor, FileStream, FilesystemDriver, NodeInfo, NodeKind, SeekOrigin,
    Superblock,
};
use crate::drivers::storage::StorageDevice;
use crate::error::{FsError, KernelError, KernelResult};
use crate::sched::timer;

/// Filesystem block size
pub const BLOCK_SIZE: usize = 1024;

/// Superblock magic, "FeFS"
pub const MAGIC: u32 = u32::from_le_bytes(*b"FeFS");

const VERSION: u32 = 1;

/// Cache slots each mounted ferrofs keeps
const CACHE_SLOTS: usize = 64;

const INODE_SIZE: usize = 64;
const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;
const DIRECT_POINTERS: usize = 11;
const POINTERS_PER_BLOCK: usize = BLOCK_SIZE / 4;

const DIRENT_SIZE: usize = 64;
/// Longest representable file name
pub const NAME_MAX: usize = DIRENT_SIZE - 6;

const ROOT_INODE: u32 = 1;

const KIND_FREE: u16 = 0;
const KIND_FILE: u16 = 1;
const KIND_DIR: u16 = 2;

/// On-disk superblock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DiskSuperblock {
    total_blocks: u32,
    inode_count: u32,
    bitmap_start: u32,
    bitmap_blocks: u32,
    inode_table_start: u32,
    inode_table_blocks: u32,
    data_start: u32,
    free_blocks: u32,
    free_inodes: u32,
}

impl DiskSuperblock {
    fn to_bytes(self) -> [u8; 44] {
        let mut b = [0u8; 44];
        b[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        b[4..8].copy_from_slice(&VERSION.to_le_bytes());
        b[8..12].copy_from_slice(&self.total_blocks.to_le_bytes());
        b[12..16].copy_from_slice(&self.inode_count.to_le_bytes());
        b[16..20].copy_from_slice(&self.bitmap_start.to_le_bytes());
        b[20..24].copy_from_slice(&self.bitmap_blocks.to_le_bytes());
        b[24..28].copy_from_slice(&self.inode_table_start.to_le_bytes());
        b[28..32].copy_from_slice(&self.inode_table_blocks.to_le_bytes());
        b[32..36].copy_from_slice(&self.data_start.to_le_bytes());
        b[36..40].copy_from_slice(&self.free_blocks.to_le_bytes());
        b[40..44].copy_from_slice(&self.free_inodes.to_le_bytes());
        b
    }

    fn from_bytes(b: &[u8]) -> KernelResult<Self> {
        if read_u32(b, 0) != MAGIC || read_u32(b, 4) != VERSION {
            return Err(KernelError::Fs(FsError::NoDriverFound));
        }
        Ok(Self {
            total_blocks: read_u32(b, 8),
            inode_count: read_u32(b, 12),
            bitmap_start: read_u32(b, 16),
            bitmap_blocks: read_u32(b, 20),
            inode_table_start: read_u32(b, 24),
            inode_table_blocks: read_u32(b, 28),
            data_start: read_u32(b, 32),
            free_blocks: read_u32(b, 36),
            free_inodes: read_u32(b, 40),
        })
    }
}

/// On-disk inode
#[derive(Debug, Clone, Copy)]
struct DiskInode {
    kind: u16,
    links: u16,
    size: u32,
    ctime: u32,
    mtime: u32,
    direct: [u32; DIRECT_POINTERS],
    indirect: u32,
}

impl DiskInode {
    fn empty() -> Self {
        Self {
            kind: KIND_FREE,
            links: 0,
            size: 0,
            ctime: 0,
            mtime: 0,
            direct: [0; DIRECT_POINTERS],
            indirect: 0,
        }
    }

    fn new(kind: u16, now: u32) -> Self {
        Self {
            kind,
            links: 1,
            size: 0,
            ctime: now,
            mtime: now,
            direct: [0; DIRECT_POINTERS],
            indirect: 0,
        }
    }

    fn to_bytes(self) -> [u8; INODE_SIZE] {
        let mut b = [0u8; INODE_SIZE];
        b[0..2].copy_from_slice(&self.kind.to_le_bytes());
        b[2..4].copy_from_slice(&self.links.to_le_bytes());
        b[4..8].copy_from_slice(&self.size.to_le_bytes());
        b[8..12].copy_from_slice(&self.ctime.to_le_bytes());
        b[12..16].copy_from_slice(&self.mtime.to_le_bytes());
        for (i, ptr) in self.direct.iter().enumerate() {
            b[16 + i * 4..20 + i * 4].copy_from_slice(&ptr.to_le_bytes());
        }
        b[60..64].copy_from_slice(&self.indirect.to_le_bytes());
        b
    }

    fn from_bytes(b: &[u8]) -> Self {
        let mut direct = [0u32; DIRECT_POINTERS];
        for (i, ptr) in direct.iter_mut().enumerate() {
            *ptr = read_u32(b, 16 + i * 4);
        }
        Self {
            kind: u16::from_le_bytes([b[0], b[1]]),
            links: u16::from_le_bytes([b[2], b[3]]),
            size: read_u32(b, 4),
            ctime: read_u32(b, 8),
            mtime: read_u32(b, 12),
            direct,
            indirect: read_u32(b, 60),
        }
    }

    fn node_kind(&self) -> KernelResult<NodeKind> {
        match self.kind {
            KIND_FILE => Ok(NodeKind::File),
            KIND_DIR => Ok(NodeKind::Directory),
            _ => Err(KernelError::BadValue),
        }
    }
}

/// One directory entry slot
#[derive(Debug, Clone)]
struct Dirent {
    inode: u32,
    kind: u16,
    name: String,
}

fn dirent_to_bytes(inode: u32, kind: u16, name: &str) -> [u8; DIRENT_SIZE] {
    let mut b = [0u8; DIRENT_SIZE];
    b[0..4].copy_from_slice(&inode.to_le_bytes());
    b[4] = kind as u8;
    b[5] = name.len() as u8;
    b[6..6 + name.len()].copy_from_slice(name.as_bytes());
    b
}

fn dirent_from_bytes(b: &[u8]) -> Option<Dirent> {
    let inode = read_u32(b, 0);
    if inode == 0 {
        return None;
    }
    let name_len = b[5] as usize;
    let name = core::str::from_utf8(&b[6..6 + name_len.min(NAME_MAX)])
        .ok()?
        .into();
    Some(Dirent {
        inode,
        kind: b[4] as u16,
        name,
    })
}

fn read_u32(b: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(b[offset..offset + 4].try_into().expect("u32 slice"))
}

fn now() -> u32 {
    timer::uptime_ms() as u32
}

/// Write an empty ferrofs onto a device. Everything the device held is
/// gone afterwards.
pub fn format<D: StorageDevice>(device: D, inode_count: u32) -> KernelResult<D> {
    let total_bytes = device.sector_count() * device.sector_size() as u64;
    let total_blocks = (total_bytes / BLOCK_SIZE as u64) as u32;
    let bitmap_blocks = total_blocks.div_ceil((BLOCK_SIZE * 8) as u32);
    let inode_table_blocks = inode_count.div_ceil(INODES_PER_BLOCK as u32);
    let data_start = 1 + bitmap_blocks + inode_table_blocks;
    if data_start + 1 >= total_blocks {
        return Err(KernelError::BadArgument);
    }

    let mut cache = BlockCache::new(device, BLOCK_SIZE, CACHE_SLOTS);
    let mut sb = DiskSuperblock {
        total_blocks,
        inode_count,
        bitmap_start: 1,
        bitmap_blocks,
        inode_table_start: 1 + bitmap_blocks,
        inode_table_blocks,
        data_start,
        free_blocks: total_blocks - data_start,
        free_inodes: inode_count - 1,
    };

    // Zero the metadata, then mark every metadata block used.
    for block in 0..data_start {
        cache.wipe(block as u64)?;
    }
    for block in 0..data_start {
        set_bitmap_bit(&mut cache, &sb, block, true)?;
    }

    // Root directory: inode 1, one data block with "." and "..".
    let root_block = alloc_block_raw(&mut cache, &mut sb)?;
    let mut root = DiskInode::new(KIND_DIR, now());
    root.direct[0] = root_block;
    root.size = (2 * DIRENT_SIZE) as u32;
    write_inode_raw(&mut cache, &sb, ROOT_INODE, &root)?;
    cache.write(
        root_block as u64,
        0,
        &dirent_to_bytes(ROOT_INODE, KIND_DIR, "."),
    )?;
    cache.write(
        root_block as u64,
        DIRENT_SIZE,
        &dirent_to_bytes(ROOT_INODE, KIND_DIR, ".."),
    )?;

    cache.write(0, 0, &sb.to_bytes())?;
    cache.flush()?;
    log::info!(
        "ferrofs: formatted {} blocks, {} inodes, data at block {}",
        total_blocks,
        inode_count,
        data_start
    );
    Ok(cache.into_device())
}

fn bitmap_pos(sb: &DiskSuperblock, block: u32) -> (u64, usize, u8) {
    let bits_per_block = (BLOCK_SIZE * 8) as u32;
    let bmp_block = sb.bitmap_start + block / bits_per_block;
    let bit_in_block = block % bits_per_block;
    (
        bmp_block as u64,
        (bit_in_block / 8) as usize,
        1u8 << (bit_in_block % 8),
    )
}

fn set_bitmap_bit<D: StorageDevice>(
    cache: &mut BlockCache<D>,
    sb: &DiskSuperblock,
    block: u32,
    used: bool,
) -> KernelResult<()> {
    let (bmp_block, byte, mask) = bitmap_pos(sb, block);
    let mut b = [0u8; 1];
    cache.read(bmp_block, byte, &mut b)?;
    if used {
        b[0] |= mask;
    } else {
        b[0] &= !mask;
    }
    cache.write(bmp_block, byte, &b)?;
    Ok(())
}

fn alloc_block_raw<D: StorageDevice>(
    cache: &mut BlockCache<D>,
    sb: &mut DiskSuperblock,
) -> KernelResult<u32> {
    for bmp_index in 0..sb.bitmap_blocks {
        let bmp_block = (sb.bitmap_start + bmp_index) as u64;
        let mut bytes = vec![0u8; BLOCK_SIZE];
        cache.read(bmp_block, 0, &mut bytes)?;
        for (byte_idx, byte) in bytes.iter().enumerate() {
            if *byte == 0xFF {
                continue;
            }
            for bit in 0..8u8 {
                if *byte & (1 << bit) != 0 {
                    continue;
                }
                let block =
                    bmp_index * (BLOCK_SIZE * 8) as u32 + byte_idx as u32 * 8 + bit as u32;
                if block >= sb.total_blocks {
                    return Err(KernelError::OutOfFrames);
                }
                let patched = [*byte | (1 << bit)];
                cache.write(bmp_block, byte_idx, &patched)?;
                sb.free_blocks -= 1;
                cache.write(0, 0, &sb.to_bytes())?;
                // Fresh blocks start zeroed.
                cache.wipe(block as u64)?;
                return Ok(block);
            }
        }
    }
    Err(KernelError::ResourcesExhausted)
}

fn free_block_raw<D: StorageDevice>(
    cache: &mut BlockCache<D>,
    sb: &mut DiskSuperblock,
    block: u32,
) -> KernelResult<()> {
    set_bitmap_bit(cache, sb, block, false)?;
    sb.free_blocks += 1;
    cache.write(0, 0, &sb.to_bytes())?;
    Ok(())
}

fn inode_pos(sb: &DiskSuperblock, inode: u32) -> (u64, usize) {
    let index = (inode - 1) as usize;
    (
        (sb.inode_table_start as usize + index / INODES_PER_BLOCK) as u64,
        (index % INODES_PER_BLOCK) * INODE_SIZE,
    )
}

fn read_inode_raw<D: StorageDevice>(
    cache: &mut BlockCache<D>,
    sb: &DiskSuperblock,
    inode: u32,
) -> KernelResult<DiskInode> {
    if inode == 0 || inode > sb.inode_count {
        return Err(KernelError::BadArgument);
    }
    let (block, offset) = inode_pos(sb, inode);
    let mut bytes = [0u8; INODE_SIZE];
    cache.read(block, offset, &mut bytes)?;
    Ok(DiskInode::from_bytes(&bytes))
}

fn write_inode_raw<D: StorageDevice>(
    cache: &mut BlockCache<D>,
    sb: &DiskSuperblock,
    inode: u32,
    data: &DiskInode,
) -> KernelResult<()> {
    let (block, offset) = inode_pos(sb, inode);
    cache.write(block, offset, &data.to_bytes())?;
    Ok(())
}

/// Mounted-filesystem state behind the lock
struct Inner {
    cache: BlockCache<PartitionView>,
    sb: DiskSuperblock,
}

impl Inner {
    fn read_inode(&mut self, inode: u32) -> KernelResult<DiskInode> {
        read_inode_raw(&mut self.cache, &self.sb, inode)
    }

    fn write_inode(&mut self, inode: u32, data: &DiskInode) -> KernelResult<()> {
        write_inode_raw(&mut self.cache, &self.sb, inode, data)
    }

    fn alloc_inode(&mut self, kind: u16) -> KernelResult<u32> {
        for inode in 1..=self.sb.inode_count {
            if self.read_inode(inode)?.kind == KIND_FREE {
                self.write_inode(inode, &DiskInode::new(kind, now()))?;
                self.sb.free_inodes -= 1;
                self.cache.write(0, 0, &self.sb.to_bytes())?;
                return Ok(inode);
            }
        }
        Err(KernelError::ResourcesExhausted)
    }

    /// Data block holding file byte `index * BLOCK_SIZE`, allocating the
    /// pointer (and the indirect block) on demand when `allocate` is set.
    fn block_for(&mut self, inode_no: u32, index: usize, allocate: bool) -> KernelResult<Option<u32>> {
        let mut inode = self.read_inode(inode_no)?;
        if index < DIRECT_POINTERS {
            if inode.direct[index] == 0 {
                if !allocate {
                    return Ok(None);
                }
                let block = alloc_block_raw(&mut self.cache, &mut self.sb)?;
                inode.direct[index] = block;
                self.write_inode(inode_no, &inode)?;
            }
            return Ok(Some(inode.direct[index]));
        }

        let slot = index - DIRECT_POINTERS;
        if slot >= POINTERS_PER_BLOCK {
            return Err(KernelError::OutOfBounds);
        }
        if inode.indirect == 0 {
            if !allocate {
                return Ok(None);
            }
            let block = alloc_block_raw(&mut self.cache, &mut self.sb)?;
            inode.indirect = block;
            self.write_inode(inode_no, &inode)?;
        }
        let mut ptr = [0u8; 4];
        self.cache.read(inode.indirect as u64, slot * 4, &mut ptr)?;
        let mut block = u32::from_le_bytes(ptr);
        if block == 0 {
            if !allocate {
                return Ok(None);
            }
            block = alloc_block_raw(&mut self.cache, &mut self.sb)?;
            self.cache
                .write(inode.indirect as u64, slot * 4, &block.to_le_bytes())?;
        }
        Ok(Some(block))
    }

    fn read_at(&mut self, inode_no: u32, pos: u64, buf: &mut [u8]) -> KernelResult<usize> {
        let inode = self.read_inode(inode_no)?;
        if pos >= inode.size as u64 {
            return Ok(0);
        }
        let mut remaining = (buf.len() as u64).min(inode.size as u64 - pos) as usize;
        let mut pos = pos as usize;
        let mut done = 0usize;
        while remaining > 0 {
            let in_block = (BLOCK_SIZE - pos % BLOCK_SIZE).min(remaining);
            match self.block_for(inode_no, pos / BLOCK_SIZE, false)? {
                Some(block) => self.cache.read(
                    block as u64,
                    pos % BLOCK_SIZE,
                    &mut buf[done..done + in_block],
                )?,
                // A hole reads as zeros.
                None => buf[done..done + in_block].fill(0),
            }
            pos += in_block;
            done += in_block;
            remaining -= in_block;
        }
        Ok(done)
    }

    fn write_at(&mut self, inode_no: u32, pos: u64, data: &[u8]) -> KernelResult<usize> {
        let mut pos = pos as usize;
        let mut done = 0usize;
        while done < data.len() {
            let in_block = (BLOCK_SIZE - pos % BLOCK_SIZE).min(data.len() - done);
            let block = self
                .block_for(inode_no, pos / BLOCK_SIZE, true)?
                .ok_or(KernelError::BadValue)?;
            self.cache
                .write(block as u64, pos % BLOCK_SIZE, &data[done..done + in_block])?;
            pos += in_block;
            done += in_block;
        }
        let mut inode = self.read_inode(inode_no)?;
        if pos as u32 > inode.size {
            inode.size = pos as u32;
        }
        inode.mtime = now();
        self.write_inode(inode_no, &inode)?;
        Ok(done)
    }

    /// All live entries of a directory.
    fn list_dir(&mut self, dir_inode: u32) -> KernelResult<Vec<Dirent>> {
        let inode = self.read_inode(dir_inode)?;
        if inode.kind != KIND_DIR {
            return Err(KernelError::Fs(FsError::NotADirectory));
        }
        let slots = inode.size as usize / DIRENT_SIZE;
        let mut entries = Vec::new();
        let mut bytes = [0u8; DIRENT_SIZE];
        for slot in 0..slots {
            let pos = slot * DIRENT_SIZE;
            let Some(block) = self.block_for(dir_inode, pos / BLOCK_SIZE, false)? else {
                continue;
            };
            self.cache.read(block as u64, pos % BLOCK_SIZE, &mut bytes)?;
            if let Some(entry) = dirent_from_bytes(&bytes) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    fn find_in_dir(&mut self, dir_inode: u32, name: &str) -> KernelResult<Dirent> {
        self.list_dir(dir_inode)?
            .into_iter()
            .find(|e| e.name == name)
            .ok_or(KernelError::Fs(FsError::NotFound))
    }

    fn add_dir_entry(&mut self, dir_inode: u32, entry_inode: u32, kind: u16, name: &str) -> KernelResult<()> {
        if name.is_empty() || name.len() > NAME_MAX || name.contains('/') {
            return Err(KernelError::BadArgument);
        }
        if self.find_in_dir(dir_inode, name).is_ok() {
            return Err(KernelError::BadArgument);
        }
        let inode = self.read_inode(dir_inode)?;
        let slots = inode.size as usize / DIRENT_SIZE;
        // Reuse a freed slot when one exists, else append.
        let mut bytes = [0u8; DIRENT_SIZE];
        let mut target = slots;
        for slot in 0..slots {
            let pos = slot * DIRENT_SIZE;
            if let Some(block) = self.block_for(dir_inode, pos / BLOCK_SIZE, false)? {
                self.cache.read(block as u64, pos % BLOCK_SIZE, &mut bytes)?;
                if dirent_from_bytes(&bytes).is_none() {
                    target = slot;
                    break;
                }
            }
        }
        let pos = target * DIRENT_SIZE;
        let block = self
            .block_for(dir_inode, pos / BLOCK_SIZE, true)?
            .ok_or(KernelError::BadValue)?;
        self.cache
            .write(block as u64, pos % BLOCK_SIZE, &dirent_to_bytes(entry_inode, kind, name))?;
        if target == slots {
            let mut inode = self.read_inode(dir_inode)?;
            inode.size += DIRENT_SIZE as u32;
            inode.mtime = now();
            self.write_inode(dir_inode, &inode)?;
        }
        Ok(())
    }

    fn clear_dir_entry(&mut self, dir_inode: u32, name: &str) -> KernelResult<()> {
        let inode = self.read_inode(dir_inode)?;
        let slots = inode.size as usize / DIRENT_SIZE;
        let mut bytes = [0u8; DIRENT_SIZE];
        for slot in 0..slots {
            let pos = slot * DIRENT_SIZE;
            let Some(block) = self.block_for(dir_inode, pos / BLOCK_SIZE, false)? else {
                continue;
            };
            self.cache.read(block as u64, pos % BLOCK_SIZE, &mut bytes)?;
            if dirent_from_bytes(&bytes).is_some_and(|e| e.name == name) {
                self.cache
                    .write(block as u64, pos % BLOCK_SIZE, &[0u8; DIRENT_SIZE])?;
                return Ok(());
            }
        }
        Err(KernelError::Fs(FsError::NotFound))
    }

    /// Release every data block of an inode and the inode itself.
    fn release_inode(&mut self, inode_no: u32) -> KernelResult<()> {
        let inode = self.read_inode(inode_no)?;
        for ptr in inode.direct {
            if ptr != 0 {
                free_block_raw(&mut self.cache, &mut self.sb, ptr)?;
            }
        }
        if inode.indirect != 0 {
            let mut ptr_bytes = [0u8; 4];
            for slot in 0..POINTERS_PER_BLOCK {
                self.cache.read(inode.indirect as u64, slot * 4, &mut ptr_bytes)?;
                let ptr = u32::from_le_bytes(ptr_bytes);
                if ptr != 0 {
                    free_block_raw(&mut self.cache, &mut self.sb, ptr)?;
                }
            }
            free_block_raw(&mut self.cache, &mut self.sb, inode.indirect)?;
        }
        self.write_inode(inode_no, &DiskInode::empty())?;
        self.sb.free_inodes += 1;
        self.cache.write(0, 0, &self.sb.to_bytes())?;
        Ok(())
    }

    fn node_info(&mut self, inode_no: u32, name: &str) -> KernelResult<NodeInfo> {
        let inode = self.read_inode(inode_no)?;
        Ok(NodeInfo {
            name: String::from(name),
            location: inode_no as u64,
            size: inode.size as u64,
            kind: inode.node_kind()?,
            ctime: inode.ctime as u64,
            mtime: inode.mtime as u64,
        })
    }
}

/// The mounted filesystem
#[derive(Clone)]
pub struct FerroFs {
    inner: Arc<Mutex<Inner>>,
}

impl FerroFs {
    pub fn mount(partition: PartitionView) -> KernelResult<Self> {
        let mut cache = BlockCache::new(partition, BLOCK_SIZE, CACHE_SLOTS);
        let mut head = [0u8; 44];
        cache.read(0, 0, &mut head)?;
        let sb = DiskSuperblock::from_bytes(&head)?;
        log::debug!(
            "ferrofs: mounted — {} blocks ({} free), {} inodes ({} free)",
            sb.total_blocks,
            sb.free_blocks,
            sb.inode_count,
            sb.free_inodes
        );
        Ok(Self {
            inner: Arc::new(Mutex::new(Inner { cache, sb })),
        })
    }
}

impl Superblock for FerroFs {
    fn root_node(&self) -> KernelResult<NodeInfo> {
        self.inner.lock().node_info(ROOT_INODE, "/")
    }

    fn lookup(&self, dir: &FileDescriptor, name: &str) -> KernelResult<NodeInfo> {
        let mut inner = self.inner.lock();
        let entry = inner.find_in_dir(dir.location as u32, name)?;
        inner.node_info(entry.inode, &entry.name)
    }

    fn open(&self, fd: &FileDescriptor) -> KernelResult<Box<dyn FileStream>> {
        if fd.kind != NodeKind::File {
            return Err(KernelError::Fs(FsError::NotAFile));
        }
        Ok(Box::new(FerroFile {
            inner: self.inner.clone(),
            inode: fd.location as u32,
            pos: 0,
        }))
    }

    fn opendir(&self, fd: &FileDescriptor) -> KernelResult<Box<dyn DirStream>> {
        if fd.kind != NodeKind::Directory {
            return Err(KernelError::Fs(FsError::NotADirectory));
        }
        Ok(Box::new(FerroDir {
            inner: self.inner.clone(),
            inode: fd.location as u32,
            index: 0,
        }))
    }

    fn touch(&self, parent: &FileDescriptor, name: &str) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        let inode = inner.alloc_inode(KIND_FILE)?;
        if let Err(err) = inner.add_dir_entry(parent.location as u32, inode, KIND_FILE, name) {
            inner.release_inode(inode)?;
            return Err(err);
        }
        Ok(())
    }

    fn unlink(&self, parent: &FileDescriptor, name: &str) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        let entry = inner.find_in_dir(parent.location as u32, name)?;
        if entry.kind != KIND_FILE {
            return Err(KernelError::Fs(FsError::NotAFile));
        }
        inner.clear_dir_entry(parent.location as u32, name)?;
        inner.release_inode(entry.inode)
    }

    fn mkdir(&self, parent: &FileDescriptor, name: &str) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        let inode = inner.alloc_inode(KIND_DIR)?;
        if let Err(err) = inner.add_dir_entry(parent.location as u32, inode, KIND_DIR, name) {
            inner.release_inode(inode)?;
            return Err(err);
        }
        inner.add_dir_entry(inode, inode, KIND_DIR, ".")?;
        inner.add_dir_entry(inode, parent.location as u32, KIND_DIR, "..")?;
        Ok(())
    }

    fn rmdir(&self, parent: &FileDescriptor, name: &str) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        let entry = inner.find_in_dir(parent.location as u32, name)?;
        if entry.kind != KIND_DIR {
            return Err(KernelError::Fs(FsError::NotADirectory));
        }
        let leftovers = inner
            .list_dir(entry.inode)?
            .iter()
            .filter(|e| e.name != "." && e.name != "..")
            .count();
        if leftovers > 0 {
            return Err(KernelError::Fs(FsError::DirNotEmpty));
        }
        inner.clear_dir_entry(parent.location as u32, name)?;
        inner.release_inode(entry.inode)
    }

    fn sync(&self) -> KernelResult<()> {
        self.inner.lock().cache.flush()
    }
}

/// Open-file cursor
struct FerroFile {
    inner: Arc<Mutex<Inner>>,
    inode: u32,
    pos: u64,
}

impl FileStream for FerroFile {
    fn read(&mut self, buf: &mut [u8]) -> KernelResult<usize> {
        let done = self.inner.lock().read_at(self.inode, self.pos, buf)?;
        self.pos += done as u64;
        Ok(done)
    }

    fn write(&mut self, buf: &[u8]) -> KernelResult<usize> {
        let done = self.inner.lock().write_at(self.inode, self.pos, buf)?;
        self.pos += done as u64;
        Ok(done)
    }

    fn seek(&mut self, offset: i64, origin: SeekOrigin) -> KernelResult<u64> {
        let size = self.inner.lock().read_inode(self.inode)?.size as i64;
        let base = match origin {
            SeekOrigin::Start => 0,
            SeekOrigin::Current => self.pos as i64,
            SeekOrigin::End => size,
        };
        let target = base + offset;
        if target < 0 {
            return Err(KernelError::BadArgument);
        }
        self.pos = target as u64;
        Ok(self.pos)
    }

    fn flush(&mut self) -> KernelResult<()> {
        self.inner.lock().cache.flush()
    }

    fn close(&mut self) -> KernelResult<()> {
        self.flush()
    }
}

/// Open-directory cursor
struct FerroDir {
    inner: Arc<Mutex<Inner>>,
    inode: u32,
    index: usize,
}

impl DirStream for FerroDir {
    fn rewind(&mut self) -> KernelResult<()> {
        self.index = 0;
        Ok(())
    }

    fn next(&mut self) -> KernelResult<Option<NodeInfo>> {
        let mut inner = self.inner.lock();
        let entries = inner.list_dir(self.inode)?;
        match entries.get(self.index) {
            Some(entry) => {
                self.index += 1;
                let info = inner.node_info(entry.inode, &entry.name)?;
                Ok(Some(info))
            }
            None => Ok(None),
        }
    }

    fn close(&mut self) -> KernelResult<()> {
        Ok(())
    }
}

/// The driver registered with the VFS
pub struct FerroFsDriver;

impl FilesystemDriver for FerroFsDriver {
    fn name(&self) -> &'static str {
        "ferrofs"
    }

    fn probe(&self, partition: &mut PartitionView) -> bool {
        let sector_size = partition.sector_size();
        let mut sector = vec![0u8; sector_size];
        if partition.read_sectors(0, 1, &mut sector).is_err() {
            return false;
        }
        read_u32(&sector, 0) == MAGIC
    }

    fn open_superblock(&self, partition: PartitionView) -> KernelResult<Arc<dyn Superblock>> {
        Ok(Arc::new(FerroFs::mount(partition)?))
    }
}

//! Filesystem stack
//!
//! Bottom to top: the block cache sits on the storage abstraction,
//! partition discovery slices devices into sector-offset views, the VFS
//! resolves paths across mounted filesystems, and back-end drivers
//! implement the per-filesystem contracts.
//!
//! The contracts are traits instead of vtable structs: [`Superblock`]
//! carries the per-mount operations, while the cursor-shaped state that an
//! open file or directory needs lives in the [`FileStream`] /
//! [`DirStream`] objects a superblock hands out.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;

use crate::error::KernelResult;

pub mod cache;
pub mod drivers;
pub mod ferrofs;
pub mod mount;
pub mod partition;
pub mod vfs;

pub use cache::BlockCache;
pub use drivers::DriverRegistry;
pub use mount::{Mount, MountTable};
pub use partition::{Partition, PartitionView};
pub use vfs::{OpenDir, OpenFile, Vfs};

/// What a descriptor points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
}

/// Plain facts a back-end reports about one of its nodes. The VFS wraps
/// this into a [`FileDescriptor`] carrying the superblock handle and the
/// parent chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    /// Where the node lives inside its filesystem (inode number, cluster,
    /// whatever the back-end uses)
    pub location: u64,
    pub size: u64,
    pub kind: NodeKind,
    pub ctime: u64,
    pub mtime: u64,
}

/// Value-type identification of a file or directory: enough to reopen it,
/// never owning file data. The parent chain ends at a root whose parent is
/// `None`.
#[derive(Clone)]
pub struct FileDescriptor {
    pub superblock: Arc<dyn Superblock>,
    pub name: String,
    pub location: u64,
    pub size: u64,
    pub kind: NodeKind,
    pub ctime: u64,
    pub mtime: u64,
    pub parent: Option<Arc<FileDescriptor>>,
}

impl FileDescriptor {
    pub fn from_info(
        superblock: Arc<dyn Superblock>,
        info: NodeInfo,
        parent: Option<Arc<FileDescriptor>>,
    ) -> Self {
        Self {
            superblock,
            name: info.name,
            location: info.location,
            size: info.size,
            kind: info.kind,
            ctime: info.ctime,
            mtime: info.mtime,
            parent,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }

    /// Same node: same filesystem instance, same location.
    pub fn same_node(&self, other: &FileDescriptor) -> bool {
        Arc::ptr_eq(&self.superblock, &other.superblock) && self.location == other.location
    }

    /// Same filesystem instance as another descriptor.
    pub fn same_filesystem(&self, other: &FileDescriptor) -> bool {
        Arc::ptr_eq(&self.superblock, &other.superblock)
    }
}

impl PartialEq for FileDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.same_node(other) && self.name == other.name && self.kind == other.kind
    }
}

// Manual Debug: the superblock handle has no useful Debug form.
impl core::fmt::Debug for FileDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FileDescriptor")
            .field("name", &self.name)
            .field("location", &self.location)
            .field("size", &self.size)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Origin for `seek`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOrigin {
    Start,
    Current,
    End,
}

/// Per-mount filesystem operations. One instance per mounted filesystem;
/// descriptors hold it by `Arc`.
pub trait Superblock: Send + Sync {
    /// The filesystem's root directory.
    fn root_node(&self) -> KernelResult<NodeInfo>;

    /// Find `name` inside the directory `dir`.
    fn lookup(&self, dir: &FileDescriptor, name: &str) -> KernelResult<NodeInfo>;

    /// Open a regular file for reading and writing.
    fn open(&self, fd: &FileDescriptor) -> KernelResult<Box<dyn FileStream>>;

    /// Open a directory for enumeration.
    fn opendir(&self, fd: &FileDescriptor) -> KernelResult<Box<dyn DirStream>>;

    /// Create an empty file named `name` under `parent`.
    fn touch(&self, parent: &FileDescriptor, name: &str) -> KernelResult<()>;

    /// Remove the file `name` from `parent`.
    fn unlink(&self, parent: &FileDescriptor, name: &str) -> KernelResult<()>;

    /// Create a directory named `name` under `parent`.
    fn mkdir(&self, parent: &FileDescriptor, name: &str) -> KernelResult<()>;

    /// Remove the directory `name` from `parent`. The VFS has already
    /// verified emptiness.
    fn rmdir(&self, parent: &FileDescriptor, name: &str) -> KernelResult<()>;

    /// Write every cached dirty block back to the device.
    fn sync(&self) -> KernelResult<()>;
}

/// Cursor over an open file
pub trait FileStream: Send {
    fn read(&mut self, buf: &mut [u8]) -> KernelResult<usize>;
    fn write(&mut self, buf: &[u8]) -> KernelResult<usize>;
    fn seek(&mut self, offset: i64, origin: SeekOrigin) -> KernelResult<u64>;
    fn flush(&mut self) -> KernelResult<()>;
    fn close(&mut self) -> KernelResult<()>;
}

/// Cursor over an open directory
pub trait DirStream: Send {
    fn rewind(&mut self) -> KernelResult<()>;
    fn next(&mut self) -> KernelResult<Option<NodeInfo>>;
    fn close(&mut self) -> KernelResult<()>;
}

/// A filesystem back-end, registered once and consulted at mount time
pub trait FilesystemDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Does this partition hold our on-disk format?
    fn probe(&self, partition: &mut PartitionView) -> bool;

    /// Build the superblock for a claimed partition.
    fn open_superblock(&self, partition: PartitionView) -> KernelResult<Arc<dyn Superblock>>;
}

/// Directory part of a path: `/a/b` → `/a`, `/a` → `/`, `a` → `.`,
/// trailing slashes ignored.
pub fn dirname(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/";
    }
    match trimmed.rfind('/') {
        None => ".",
        Some(0) => "/",
        Some(idx) => &trimmed[..idx],
    }
}

/// Final component of a path: `/a/b` → `b`, `/` → ``.
pub fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        None => trimmed,
        Some(idx) => &trimmed[idx + 1..],
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn dirname_covers_the_edge_shapes() {
        assert_eq!(dirname("/a/b"), "/a");
        assert_eq!(dirname("/a/b/"), "/a");
        assert_eq!(dirname("/a"), "/");
        assert_eq!(dirname("a"), ".");
        assert_eq!(dirname("a/b"), "a");
        assert_eq!(dirname("/"), "/");
    }

    #[test]
    fn basename_extracts_the_final_component() {
        assert_eq!(basename("/a/b"), "b");
        assert_eq!(basename("/a/b/"), "b");
        assert_eq!(basename("file.txt"), "file.txt");
        assert_eq!(basename("/"), "");
    }
}

//! VFS core: path resolution and the file operations facade
//!
//! Path resolution walks one component at a time, asking the current
//! base directory's superblock to look the component up, and substitutes
//! the mounted filesystem's root whenever a resolved directory is a mount
//! point. Every other VFS operation (open, mkdir, unlink, …) is a resolve
//! followed by one back-end call.

use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;

use spin::Mutex;

use super::drivers::DriverRegistry;
use super::mount::{Mount, MountTable};
use super::partition::{self, Partition, PartitionView};
use super::{
    basename, dirname, DirStream, FileDescriptor, FileStream, SeekOrigin, Superblock,
};
use crate::drivers::storage::{SharedDevice, DEVICE_REGISTRY};
use crate::error::{FsError, KernelError, KernelResult};

/// An opened file: the resolved descriptor plus the back-end cursor
pub struct OpenFile {
    pub descriptor: FileDescriptor,
    stream: Box<dyn FileStream>,
}

impl OpenFile {
    pub fn read(&mut self, buf: &mut [u8]) -> KernelResult<usize> {
        self.stream.read(buf)
    }

    pub fn write(&mut self, buf: &[u8]) -> KernelResult<usize> {
        self.stream.write(buf)
    }

    pub fn seek(&mut self, offset: i64, origin: SeekOrigin) -> KernelResult<u64> {
        self.stream.seek(offset, origin)
    }

    pub fn flush(&mut self) -> KernelResult<()> {
        self.stream.flush()
    }

    pub fn close(mut self) -> KernelResult<()> {
        self.stream.close()
    }
}

/// An opened directory enumeration
pub struct OpenDir {
    pub descriptor: FileDescriptor,
    stream: Box<dyn DirStream>,
}

impl OpenDir {
    pub fn rewind(&mut self) -> KernelResult<()> {
        self.stream.rewind()
    }

    /// Next entry as a full descriptor whose parent is this directory.
    pub fn read_entry(&mut self) -> KernelResult<Option<FileDescriptor>> {
        match self.stream.next()? {
            Some(info) => Ok(Some(FileDescriptor::from_info(
                self.descriptor.superblock.clone(),
                info,
                Some(Arc::new(self.descriptor.clone())),
            ))),
            None => Ok(None),
        }
    }

    pub fn close(mut self) -> KernelResult<()> {
        self.stream.close()
    }
}

/// The VFS state: registered drivers plus the mount table
pub struct Vfs {
    pub drivers: DriverRegistry,
    pub mounts: MountTable,
}

impl Vfs {
    pub const fn new() -> Self {
        Self {
            drivers: DriverRegistry::new(),
            mounts: MountTable::new(),
        }
    }

    /// Mount an already-opened superblock at `path`. The host directory is
    /// resolved before the mount is added, so the mount point must already
    /// exist (except for `/`).
    pub fn mount_superblock(
        &mut self,
        superblock: Arc<dyn Superblock>,
        path: &str,
        dev_no: u32,
        part_no: u32,
        driver_name: &'static str,
    ) -> KernelResult<()> {
        let info = superblock.root_node()?;
        let mounted_root = FileDescriptor::from_info(superblock.clone(), info, None);

        let host_dir = if path == "/" {
            None
        } else {
            let dir = self.resolve(path, None, false)?;
            if !dir.is_dir() {
                return Err(KernelError::Fs(FsError::NotADirectory));
            }
            Some(dir)
        };

        self.mounts.add(Mount {
            id: 0,
            dev_no,
            part_no,
            driver_name,
            superblock,
            mount_point: String::from(path),
            mounted_root,
            host_dir,
        })?;
        Ok(())
    }

    /// Probe the drivers for this partition and mount the claimer.
    pub fn mount_partition(
        &mut self,
        device: SharedDevice,
        part: &Partition,
        path: &str,
    ) -> KernelResult<()> {
        let mut view = PartitionView::new(device.clone(), part);
        let driver = self
            .drivers
            .find_for(&mut view)
            .ok_or(KernelError::Fs(FsError::NoDriverFound))?;
        let superblock = driver.open_superblock(view)?;
        self.mount_superblock(superblock, path, part.dev_no, part.part_no, driver.name())
    }

    /// Mount by `(dev_no, part_no)` using the global device and partition
    /// registries.
    pub fn mount(&mut self, dev_no: u32, part_no: u32, path: &str) -> KernelResult<()> {
        let device = DEVICE_REGISTRY
            .lock()
            .get(dev_no)
            .ok_or(KernelError::Fs(FsError::NoDevice))?;
        let part =
            partition::get_partition(dev_no, part_no).ok_or(KernelError::Fs(FsError::NoPartition))?;
        self.mount_partition(device, &part, path)
    }

    /// Unmount `path`: the superblock is flushed and the binding removed.
    pub fn unmount(&mut self, path: &str) -> KernelResult<()> {
        let mount = self
            .mounts
            .remove_by_path(path)
            .ok_or(KernelError::Fs(FsError::NotFound))?;
        mount.superblock.sync()?;
        log::info!("vfs: \"{}\" unmounted", path);
        Ok(())
    }

    /// Resolve a path to a descriptor.
    ///
    /// `curr` is the process's working directory (required for relative
    /// paths); with `containing_folder` the path is first reduced to its
    /// directory part, so the final component need not exist.
    pub fn resolve(
        &self,
        path: &str,
        curr: Option<&FileDescriptor>,
        containing_folder: bool,
    ) -> KernelResult<FileDescriptor> {
        if path.is_empty() {
            return Err(KernelError::BadArgument);
        }
        let root = &self
            .mounts
            .root()
            .ok_or(KernelError::Fs(FsError::NoFsMounted))?
            .mounted_root;

        let effective = if containing_folder { dirname(path) } else { path };

        // Single-component short-circuits.
        if effective == "." {
            return curr.cloned().ok_or(KernelError::BadArgument);
        }
        if effective == "/" {
            return Ok(root.clone());
        }

        let mut base = if effective.starts_with('/') {
            root.clone()
        } else {
            curr.cloned().ok_or(KernelError::BadArgument)?
        };

        for component in effective.split('/').filter(|c| !c.is_empty()) {
            if !base.is_dir() {
                return Err(KernelError::Fs(FsError::NotADirectory));
            }
            let info = base.superblock.lookup(&base, component)?;
            let mut child = FileDescriptor::from_info(
                base.superblock.clone(),
                info,
                Some(Arc::new(base.clone())),
            );
            // Crossing into a mounted filesystem: continue from its root.
            if child.is_dir() {
                if let Some(mounted_root) = self.mounts.mount_root_for_host(&child) {
                    child = mounted_root;
                }
            }
            base = child;
        }
        Ok(base)
    }

    pub fn open(&self, path: &str, curr: Option<&FileDescriptor>) -> KernelResult<OpenFile> {
        let fd = self.resolve(path, curr, false)?;
        if !fd.is_file() {
            return Err(KernelError::Fs(FsError::NotAFile));
        }
        let stream = fd.superblock.open(&fd)?;
        log::trace!("vfs: open(\"{}\")", path);
        Ok(OpenFile {
            descriptor: fd,
            stream,
        })
    }

    pub fn opendir(&self, path: &str, curr: Option<&FileDescriptor>) -> KernelResult<OpenDir> {
        let fd = self.resolve(path, curr, false)?;
        if !fd.is_dir() {
            return Err(KernelError::Fs(FsError::NotADirectory));
        }
        let stream = fd.superblock.opendir(&fd)?;
        Ok(OpenDir {
            descriptor: fd,
            stream,
        })
    }

    pub fn touch(&self, path: &str, curr: Option<&FileDescriptor>) -> KernelResult<()> {
        let parent = self.resolve(path, curr, true)?;
        parent.superblock.touch(&parent, basename(path))
    }

    pub fn unlink(&self, path: &str, curr: Option<&FileDescriptor>) -> KernelResult<()> {
        let parent = self.resolve(path, curr, true)?;
        parent.superblock.unlink(&parent, basename(path))
    }

    pub fn mkdir(&self, path: &str, curr: Option<&FileDescriptor>) -> KernelResult<()> {
        let parent = self.resolve(path, curr, true)?;
        parent.superblock.mkdir(&parent, basename(path))
    }

    /// Remove a directory. The target is enumerated first and refused
    /// while anything besides `.` and `..` remains.
    pub fn rmdir(&self, path: &str, curr: Option<&FileDescriptor>) -> KernelResult<()> {
        let target = self.resolve(path, curr, false)?;
        if !target.is_dir() {
            return Err(KernelError::Fs(FsError::NotADirectory));
        }
        let mut dir = OpenDir {
            stream: target.superblock.opendir(&target)?,
            descriptor: target.clone(),
        };
        while let Some(entry) = dir.read_entry()? {
            if entry.name != "." && entry.name != ".." {
                return Err(KernelError::Fs(FsError::DirNotEmpty));
            }
        }
        dir.close()?;

        let parent = self.resolve(path, curr, true)?;
        parent.superblock.rmdir(&parent, basename(path))
    }

    /// Flush every mounted filesystem.
    pub fn sync_all(&self) -> KernelResult<()> {
        for mount in self.mounts.iter() {
            mount.superblock.sync()?;
        }
        Ok(())
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

/// The kernel-wide VFS instance
pub static VFS: Mutex<Vfs> = Mutex::new(Vfs::new());

/// Mount the root filesystem selected on the kernel command line, then
/// auto-mount every other partition a driver claims under
/// `/mnt/d<N>p<M>`.
pub fn discover_and_mount(root_dev: u32, root_part: u32) -> KernelResult<()> {
    let mut vfs = VFS.lock();
    vfs.mount(root_dev, root_part, "/")?;

    let all: alloc::vec::Vec<Partition> = partition::PARTITIONS.lock().clone();
    for part in all {
        if vfs.mounts.by_numbers(part.dev_no, part.part_no).is_some() {
            continue;
        }
        let path = format!("/mnt/d{}p{}", part.dev_no, part.part_no);
        // Best effort: the mount point may not exist and not every
        // partition has a driver.
        match vfs.mount(part.dev_no, part.part_no, &path) {
            Ok(()) => {}
            Err(err) => log::debug!(
                "vfs: not auto-mounting dev #{} p#{}: {}",
                part.dev_no,
                part.part_no,
                err
            ),
        }
    }
    Ok(())
}

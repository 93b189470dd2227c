//! Mount table
//!
//! Binds `(device, partition, driver, superblock)` tuples to path
//! prefixes. The root mount must exist before anything else can be
//! mounted or resolved. Nothing stops a device from being mounted at
//! several paths.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::{FileDescriptor, Superblock};
use crate::error::{FsError, KernelError, KernelResult};

pub struct Mount {
    pub id: u32,
    pub dev_no: u32,
    pub part_no: u32,
    pub driver_name: &'static str,
    pub superblock: Arc<dyn Superblock>,
    pub mount_point: String,
    /// Root directory of the mounted filesystem
    pub mounted_root: FileDescriptor,
    /// The directory in the host filesystem this mount covers; `None` for
    /// the root mount
    pub host_dir: Option<FileDescriptor>,
}

pub struct MountTable {
    mounts: Vec<Mount>,
    next_id: u32,
}

impl MountTable {
    pub const fn new() -> Self {
        Self {
            mounts: Vec::new(),
            next_id: 1,
        }
    }

    /// Add a mount. The first mount must be `/`; a second mount of `/` is
    /// refused.
    pub fn add(&mut self, mut mount: Mount) -> KernelResult<u32> {
        let is_root = mount.mount_point == "/";
        if self.root().is_none() && !is_root {
            return Err(KernelError::Fs(FsError::NoFsMounted));
        }
        if is_root && self.root().is_some() {
            return Err(KernelError::BadArgument);
        }
        mount.id = self.next_id;
        self.next_id += 1;
        log::info!(
            "vfs: dev #{} p#{} ({}) mounted on \"{}\"",
            mount.dev_no,
            mount.part_no,
            mount.driver_name,
            mount.mount_point
        );
        let id = mount.id;
        self.mounts.push(mount);
        Ok(id)
    }

    pub fn root(&self) -> Option<&Mount> {
        self.mounts.iter().find(|m| m.mount_point == "/")
    }

    pub fn by_path(&self, path: &str) -> Option<&Mount> {
        self.mounts.iter().find(|m| m.mount_point == path)
    }

    pub fn by_numbers(&self, dev_no: u32, part_no: u32) -> Option<&Mount> {
        self.mounts
            .iter()
            .find(|m| m.dev_no == dev_no && m.part_no == part_no)
    }

    pub fn remove_by_path(&mut self, path: &str) -> Option<Mount> {
        let index = self.mounts.iter().position(|m| m.mount_point == path)?;
        Some(self.mounts.remove(index))
    }

    /// If `dir` is the host directory of a mount, the mounted filesystem's
    /// root replaces it during path resolution.
    pub fn mount_root_for_host(&self, dir: &FileDescriptor) -> Option<FileDescriptor> {
        self.mounts
            .iter()
            .find(|m| m.host_dir.as_ref().is_some_and(|h| h.same_node(dir)))
            .map(|m| m.mounted_root.clone())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mount> {
        self.mounts.iter()
    }

    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }
}

impl Default for MountTable {
    fn default() -> Self {
        Self::new()
    }
}

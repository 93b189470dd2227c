//! Filesystem driver registry
//!
//! Back-ends register once at boot; when a partition is mounted the
//! registry walks the drivers in registration order and the first probe
//! that claims the partition wins.

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::partition::PartitionView;
use super::FilesystemDriver;

pub struct DriverRegistry {
    drivers: Vec<Arc<dyn FilesystemDriver>>,
}

impl DriverRegistry {
    pub const fn new() -> Self {
        Self {
            drivers: Vec::new(),
        }
    }

    pub fn register(&mut self, driver: Arc<dyn FilesystemDriver>) {
        log::info!("vfs: filesystem driver \"{}\" registered", driver.name());
        self.drivers.push(driver);
    }

    /// First driver whose probe claims the partition.
    pub fn find_for(&self, partition: &mut PartitionView) -> Option<Arc<dyn FilesystemDriver>> {
        self.drivers
            .iter()
            .find(|d| d.probe(partition))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

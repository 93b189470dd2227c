//! Device drivers
//!
//! The storage abstraction is the boundary the rest of the kernel sees:
//! everything above `StorageDevice` is ignorant of ATA vs. AHCI vs. a
//! memory-backed disk.

pub mod ahci;
pub mod ata;
pub mod storage;

pub use storage::{DeviceRegistry, RamDisk, SharedDevice, StorageDevice, DEVICE_REGISTRY};

//! Storage device abstraction and registry
//!
//! Drivers register their devices here at probe time and receive a
//! monotonic device number. Each device sits behind its own lock, so
//! concurrent requests from different processes serialize per device, not
//! globally.

use alloc::borrow::ToOwned;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::IoError;

/// Uniform sector-level interface over any storage hardware
pub trait StorageDevice: Send {
    fn name(&self) -> &str;

    /// Bytes per sector. Callers must use this, never assume 512.
    fn sector_size(&self) -> usize;

    fn sector_count(&self) -> u64;

    /// Read `count` sectors starting at `sector` into `buf`.
    fn read_sectors(&mut self, sector: u64, count: usize, buf: &mut [u8]) -> Result<(), IoError>;

    /// Write `count` sectors starting at `sector` from `buf`.
    fn write_sectors(&mut self, sector: u64, count: usize, buf: &[u8]) -> Result<(), IoError>;
}

/// A registered device: shared handle, per-device command serialization
pub type SharedDevice = Arc<Mutex<dyn StorageDevice>>;

/// Global list of storage devices, keyed by device number
pub struct DeviceRegistry {
    devices: BTreeMap<u32, SharedDevice>,
    next_dev_no: u32,
}

impl DeviceRegistry {
    pub const fn new() -> Self {
        Self {
            devices: BTreeMap::new(),
            next_dev_no: 1,
        }
    }

    /// Register a device, returning its number.
    pub fn register(&mut self, device: impl StorageDevice + 'static) -> u32 {
        let dev_no = self.next_dev_no;
        self.next_dev_no += 1;
        log::info!("storage: dev #{}: {}", dev_no, device.name());
        self.devices.insert(dev_no, Arc::new(Mutex::new(device)));
        dev_no
    }

    pub fn get(&self, dev_no: u32) -> Option<SharedDevice> {
        self.devices.get(&dev_no).cloned()
    }

    pub fn dev_numbers(&self) -> Vec<u32> {
        self.devices.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The kernel-wide device registry
pub static DEVICE_REGISTRY: Mutex<DeviceRegistry> = Mutex::new(DeviceRegistry::new());

/// Memory-backed storage device, used for ramdisks and by the test suite
pub struct RamDisk {
    name: String,
    sector_size: usize,
    data: Vec<u8>,
}

impl RamDisk {
    pub fn new(name: &str, sector_size: usize, sector_count: u64) -> Self {
        Self {
            name: name.to_owned(),
            sector_size,
            data: vec![0u8; sector_size * sector_count as usize],
        }
    }

    /// Build a ramdisk over an existing image.
    pub fn from_image(name: &str, sector_size: usize, image: Vec<u8>) -> Self {
        assert_eq!(image.len() % sector_size, 0, "image not sector aligned");
        Self {
            name: name.to_owned(),
            sector_size,
            data: image,
        }
    }

    fn byte_range(&self, sector: u64, count: usize) -> Result<(usize, usize), IoError> {
        let start = sector as usize * self.sector_size;
        let len = count * self.sector_size;
        if start + len > self.data.len() {
            return Err(IoError::InvalidAddress);
        }
        Ok((start, len))
    }
}

impl StorageDevice for RamDisk {
    fn name(&self) -> &str {
        &self.name
    }

    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn sector_count(&self) -> u64 {
        (self.data.len() / self.sector_size) as u64
    }

    fn read_sectors(&mut self, sector: u64, count: usize, buf: &mut [u8]) -> Result<(), IoError> {
        let (start, len) = self.byte_range(sector, count)?;
        if buf.len() < len {
            return Err(IoError::ReadError);
        }
        buf[..len].copy_from_slice(&self.data[start..start + len]);
        Ok(())
    }

    fn write_sectors(&mut self, sector: u64, count: usize, buf: &[u8]) -> Result<(), IoError> {
        let (start, len) = self.byte_range(sector, count)?;
        if buf.len() < len {
            return Err(IoError::WriteError);
        }
        self.data[start..start + len].copy_from_slice(&buf[..len]);
        Ok(())
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn ramdisk_round_trip() {
        let mut disk = RamDisk::new("rd0", 512, 64);
        assert_eq!(disk.sector_count(), 64);

        let data = [0x5Au8; 1024];
        disk.write_sectors(3, 2, &data).unwrap();
        let mut back = [0u8; 1024];
        disk.read_sectors(3, 2, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn ramdisk_rejects_out_of_range() {
        let mut disk = RamDisk::new("rd0", 512, 8);
        let mut buf = [0u8; 512];
        assert_eq!(
            disk.read_sectors(8, 1, &mut buf),
            Err(IoError::InvalidAddress)
        );
        assert_eq!(disk.write_sectors(7, 2, &[0; 1024]), Err(IoError::InvalidAddress));
    }

    #[test]
    fn registry_numbers_devices_monotonically() {
        let mut reg = DeviceRegistry::new();
        let a = reg.register(RamDisk::new("a", 512, 8));
        let b = reg.register(RamDisk::new("b", 512, 8));
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert!(reg.get(a).is_some());
        assert!(reg.get(3).is_none());

        // The handle reaches the same device.
        let dev = reg.get(b).unwrap();
        assert_eq!(dev.lock().name(), "b");
    }
}

//! Partition discovery
//!
//! A new storage device is probed for GPT first (signature at LBA 1); only
//! when that fails is the legacy MBR at LBA 0 examined, including the
//! recursive extended-partition chain. Discovered partitions land in a
//! global list keyed by `(dev_no, part_no)`; a [`PartitionView`] adapts a
//! partition back into the `StorageDevice` shape by translating sector
//! addresses.

use alloc::format;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use super::super::drivers::storage::{SharedDevice, StorageDevice};
use crate::error::{IoError, KernelError};

/// Legacy partition types that chain an extended partition
const MBR_TYPE_EXTENDED_CHS: u8 = 0x05;
const MBR_TYPE_EXTENDED_LBA: u8 = 0x0F;

/// Logical partitions inside an extended chain number from here
const FIRST_LOGICAL_PART_NO: u32 = 5;

/// Extended chains deeper than this are considered corrupt
const MAX_EBR_CHAIN: usize = 64;

/// One discovered partition
#[derive(Debug, Clone)]
pub struct Partition {
    pub name: String,
    pub dev_no: u32,
    pub part_no: u32,
    pub first_sector: u64,
    pub num_sectors: u64,
    /// MBR system id; zero for GPT partitions
    pub legacy_type: u8,
    pub bootable: bool,
}

/// Global partition list
pub static PARTITIONS: Mutex<Vec<Partition>> = Mutex::new(Vec::new());

/// Look a partition up by `(dev_no, part_no)`.
pub fn get_partition(dev_no: u32, part_no: u32) -> Option<Partition> {
    PARTITIONS
        .lock()
        .iter()
        .find(|p| p.dev_no == dev_no && p.part_no == part_no)
        .cloned()
}

/// Probe one device and append whatever it holds to the global list.
pub fn discover_device(dev_no: u32, device: &SharedDevice) -> Result<(), KernelError> {
    let mut dev = device.lock();
    let found = discover_partitions(dev_no, &mut *dev)?;
    drop(dev);
    for part in &found {
        log::info!(
            "partition: dev #{} p#{}: {} ({} sectors at {})",
            part.dev_no,
            part.part_no,
            part.name,
            part.num_sectors,
            part.first_sector
        );
    }
    PARTITIONS.lock().extend(found);
    Ok(())
}

/// Parse the partition tables of one device. GPT wins over MBR.
pub fn discover_partitions(
    dev_no: u32,
    dev: &mut dyn StorageDevice,
) -> Result<Vec<Partition>, KernelError> {
    if let Some(parts) = parse_gpt(dev_no, dev)? {
        return Ok(parts);
    }
    parse_mbr(dev_no, dev)
}

fn parse_gpt(
    dev_no: u32,
    dev: &mut dyn StorageDevice,
) -> Result<Option<Vec<Partition>>, KernelError> {
    let sector_size = dev.sector_size();
    let mut header = vec![0u8; sector_size];
    dev.read_sectors(1, 1, &mut header)?;

    if &header[0..8] != b"EFI PART" {
        log::debug!("dev #{}: no GPT signature", dev_no);
        return Ok(None);
    }

    let entries_lba_raw = read_u64(&header, 0x48);
    let entry_count = read_u32(&header, 0x50);
    let entry_size = read_u32(&header, 0x54) as usize;
    if entry_size == 0 || entry_size > sector_size {
        return Err(KernelError::BadValue);
    }
    // Some tools leave the field zero; the entries conventionally start at
    // LBA 2.
    let mut entries_lba = if entries_lba_raw == 0 { 2 } else { entries_lba_raw };
    log::debug!(
        "dev #{}: GPT with {} entries of {} bytes at LBA {}",
        dev_no,
        entry_count,
        entry_size,
        entries_lba
    );

    let mut partitions = Vec::new();
    let mut sector = vec![0u8; sector_size];
    let mut remaining = 0usize;
    let mut offset = 0usize;
    for index in 0..entry_count {
        if remaining < entry_size {
            dev.read_sectors(entries_lba, 1, &mut sector)?;
            entries_lba += 1;
            remaining = sector_size;
            offset = 0;
        }
        let entry = &sector[offset..offset + entry_size];
        offset += entry_size;
        remaining -= entry_size;

        // An all-zero type GUID marks an unused entry.
        let type_guid = &entry[0..16];
        if type_guid.iter().all(|&b| b == 0) {
            continue;
        }

        let first_lba = read_u64(entry, 0x20);
        let last_lba = read_u64(entry, 0x28);
        let attributes = read_u64(entry, 0x30);
        if first_lba > u32::MAX as u64 || last_lba > u32::MAX as u64 {
            log::error!(
                "dev #{}: GPT entry {} beyond the 32-bit sector range, skipping",
                dev_no,
                index
            );
            continue;
        }

        let guid = &entry[0x10..0x20];
        partitions.push(Partition {
            name: format!("Partition {} ({})", index + 1, format_guid(guid)),
            dev_no,
            part_no: index + 1,
            first_sector: first_lba,
            num_sectors: last_lba - first_lba + 1,
            legacy_type: 0,
            bootable: attributes & 0x2 != 0,
        });
    }

    Ok(Some(partitions))
}

fn parse_mbr(dev_no: u32, dev: &mut dyn StorageDevice) -> Result<Vec<Partition>, KernelError> {
    let mut partitions = Vec::new();
    let mut next_logical = FIRST_LOGICAL_PART_NO;
    parse_mbr_sector(dev_no, dev, 0, &mut next_logical, &mut partitions, 0)?;
    Ok(partitions)
}

/// Parse one MBR/EBR sector; extended entries recurse down the chain.
fn parse_mbr_sector(
    dev_no: u32,
    dev: &mut dyn StorageDevice,
    base_sector: u64,
    next_logical: &mut u32,
    out: &mut Vec<Partition>,
    depth: usize,
) -> Result<(), KernelError> {
    if depth > MAX_EBR_CHAIN {
        log::error!("dev #{}: extended partition chain too deep, stopping", dev_no);
        return Ok(());
    }

    let sector_size = dev.sector_size();
    let mut sector = vec![0u8; sector_size];
    dev.read_sectors(base_sector, 1, &mut sector)?;

    if sector[0x1FE] != 0x55 || sector[0x1FF] != 0xAA {
        log::debug!("dev #{}: no MBR signature at sector {}", dev_no, base_sector);
        return Ok(());
    }

    let mut extended_offset = None;
    for entry_no in 0..4usize {
        let entry = &sector[0x1BE + entry_no * 16..0x1BE + (entry_no + 1) * 16];
        let boot_indicator = entry[0x0];
        let system_id = entry[0x4];
        let sector_offset = read_u32(entry, 0x8) as u64;
        let num_sectors = read_u32(entry, 0xC) as u64;

        if system_id == 0 {
            continue;
        }
        if system_id == MBR_TYPE_EXTENDED_CHS || system_id == MBR_TYPE_EXTENDED_LBA {
            extended_offset = Some(sector_offset);
            continue;
        }

        let (part_no, name) = if base_sector == 0 {
            let no = entry_no as u32 + 1;
            (no, format!("Primary partition {}", no))
        } else {
            let no = *next_logical;
            *next_logical += 1;
            (no, format!("Logical partition {}", no))
        };
        out.push(Partition {
            name,
            dev_no,
            part_no,
            first_sector: base_sector + sector_offset,
            num_sectors,
            legacy_type: system_id,
            bootable: boot_indicator & 0x80 != 0,
        });
    }

    // Recurse only after this sector's entries are parsed (the buffer is
    // reused down the chain).
    if let Some(offset) = extended_offset {
        parse_mbr_sector(
            dev_no,
            dev,
            base_sector + offset,
            next_logical,
            out,
            depth + 1,
        )?;
    }
    Ok(())
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().expect("u32 slice"))
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().expect("u64 slice"))
}

fn format_guid(guid: &[u8]) -> String {
    let mut s = String::new();
    for (i, byte) in guid.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            s.push('-');
        }
        s.push_str(&format!("{:02x}", byte));
    }
    s
}

/// Sector-offset view of a device: sector `n` of the view is sector
/// `first_sector + n` of the underlying device. Carries the partition
/// bounds, so out-of-partition access fails instead of straying.
pub struct PartitionView {
    device: SharedDevice,
    name: String,
    first_sector: u64,
    num_sectors: u64,
}

impl PartitionView {
    pub fn new(device: SharedDevice, partition: &Partition) -> Self {
        Self {
            device,
            name: partition.name.clone(),
            first_sector: partition.first_sector,
            num_sectors: partition.num_sectors,
        }
    }

    /// A view over a whole device (partitionless filesystems, tests).
    pub fn whole_device(device: SharedDevice) -> Self {
        let sectors = device.lock().sector_count();
        Self {
            device,
            name: String::from("whole device"),
            first_sector: 0,
            num_sectors: sectors,
        }
    }

    fn check_range(&self, sector: u64, count: usize) -> Result<(), IoError> {
        if sector + count as u64 > self.num_sectors {
            return Err(IoError::InvalidAddress);
        }
        Ok(())
    }
}

impl StorageDevice for PartitionView {
    fn name(&self) -> &str {
        &self.name
    }

    fn sector_size(&self) -> usize {
        self.device.lock().sector_size()
    }

    fn sector_count(&self) -> u64 {
        self.num_sectors
    }

    fn read_sectors(&mut self, sector: u64, count: usize, buf: &mut [u8]) -> Result<(), IoError> {
        self.check_range(sector, count)?;
        self.device
            .lock()
            .read_sectors(self.first_sector + sector, count, buf)
    }

    fn write_sectors(&mut self, sector: u64, count: usize, buf: &[u8]) -> Result<(), IoError> {
        self.check_range(sector, count)?;
        self.device
            .lock()
            .write_sectors(self.first_sector + sector, count, buf)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::drivers::storage::RamDisk;

    fn blank_disk(sectors: u64) -> RamDisk {
        RamDisk::new("test", 512, sectors)
    }

    fn write_sector(disk: &mut RamDisk, sector: u64, bytes: &[(usize, &[u8])]) {
        let mut data = vec![0u8; 512];
        for (offset, chunk) in bytes {
            data[*offset..*offset + chunk.len()].copy_from_slice(chunk);
        }
        disk.write_sectors(sector, 1, &data).unwrap();
    }

    fn mbr_entry(boot: u8, system_id: u8, lba: u32, count: u32) -> [u8; 16] {
        let mut e = [0u8; 16];
        e[0] = boot;
        e[4] = system_id;
        e[8..12].copy_from_slice(&lba.to_le_bytes());
        e[12..16].copy_from_slice(&count.to_le_bytes());
        e
    }

    #[test]
    fn gpt_single_entry() {
        // No MBR signature; GPT at LBA 1 with a single used entry.
        let mut disk = blank_disk(4096);
        let mut header = vec![0u8; 512];
        header[0..8].copy_from_slice(b"EFI PART");
        header[0x48..0x50].copy_from_slice(&2u64.to_le_bytes()); // entries at LBA 2
        header[0x50..0x54].copy_from_slice(&1u32.to_le_bytes()); // one entry
        header[0x54..0x58].copy_from_slice(&128u32.to_le_bytes());
        disk.write_sectors(1, 1, &header).unwrap();

        let mut entry = vec![0u8; 512];
        entry[0] = 0xEB; // non-zero type GUID
        entry[0x20..0x28].copy_from_slice(&34u64.to_le_bytes());
        entry[0x28..0x30].copy_from_slice(&2047u64.to_le_bytes());
        disk.write_sectors(2, 1, &entry).unwrap();

        let parts = discover_partitions(1, &mut disk).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].part_no, 1);
        assert_eq!(parts[0].first_sector, 34);
        assert_eq!(parts[0].num_sectors, 2014);
        assert!(!parts[0].bootable);
    }

    #[test]
    fn gpt_skips_empty_entries_and_reads_attributes() {
        let mut disk = blank_disk(4096);
        let mut header = vec![0u8; 512];
        header[0..8].copy_from_slice(b"EFI PART");
        // Entries LBA left zero: defaults to LBA 2.
        header[0x50..0x54].copy_from_slice(&3u32.to_le_bytes());
        header[0x54..0x58].copy_from_slice(&128u32.to_le_bytes());
        disk.write_sectors(1, 1, &header).unwrap();

        let mut sector = vec![0u8; 512];
        // Entry 0: empty (all-zero type GUID). Entry 1: bootable.
        sector[128] = 0x42;
        sector[128 + 0x20..128 + 0x28].copy_from_slice(&100u64.to_le_bytes());
        sector[128 + 0x28..128 + 0x30].copy_from_slice(&199u64.to_le_bytes());
        sector[128 + 0x30..128 + 0x38].copy_from_slice(&2u64.to_le_bytes());
        // Entry 2: plain.
        sector[256] = 0x43;
        sector[256 + 0x20..256 + 0x28].copy_from_slice(&200u64.to_le_bytes());
        sector[256 + 0x28..256 + 0x30].copy_from_slice(&299u64.to_le_bytes());
        disk.write_sectors(2, 1, &sector).unwrap();

        let parts = discover_partitions(1, &mut disk).unwrap();
        assert_eq!(parts.len(), 2);
        // Numbering follows the entry index, skipped entries included.
        assert_eq!(parts[0].part_no, 2);
        assert!(parts[0].bootable);
        assert_eq!(parts[0].num_sectors, 100);
        assert_eq!(parts[1].part_no, 3);
        assert!(!parts[1].bootable);
    }

    #[test]
    fn mbr_primary_and_extended_chain() {
        // A primary at 2048 and an extended chain whose EBR at 4096 holds
        // one logical partition at relative sector 10.
        let mut disk = blank_disk(8192);
        let e0 = mbr_entry(0, 0x83, 2048, 100);
        let e1 = mbr_entry(0, 0x05, 4096, 1000);
        write_sector(
            &mut disk,
            0,
            &[(0x1BE, &e0), (0x1CE, &e1), (0x1FE, &[0x55, 0xAA])],
        );
        let l0 = mbr_entry(0, 0x83, 10, 50);
        write_sector(&mut disk, 4096, &[(0x1BE, &l0), (0x1FE, &[0x55, 0xAA])]);

        let parts = discover_partitions(1, &mut disk).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].part_no, 1);
        assert_eq!(parts[0].first_sector, 2048);
        assert_eq!(parts[0].num_sectors, 100);
        assert_eq!(parts[0].legacy_type, 0x83);

        assert_eq!(parts[1].part_no, 5);
        assert_eq!(parts[1].first_sector, 4106);
        assert_eq!(parts[1].num_sectors, 50);
    }

    #[test]
    fn mbr_bootable_flag_and_empty_entries() {
        let mut disk = blank_disk(8192);
        let e0 = mbr_entry(0x80, 0x0C, 64, 128);
        write_sector(&mut disk, 0, &[(0x1BE, &e0), (0x1FE, &[0x55, 0xAA])]);
        let parts = discover_partitions(1, &mut disk).unwrap();
        assert_eq!(parts.len(), 1);
        assert!(parts[0].bootable);
        assert_eq!(parts[0].legacy_type, 0x0C);
    }

    #[test]
    fn missing_signature_yields_nothing() {
        let mut disk = blank_disk(64);
        let parts = discover_partitions(1, &mut disk).unwrap();
        assert!(parts.is_empty());
    }

    #[test]
    fn partition_view_translates_and_bounds() {
        let mut disk = blank_disk(128);
        let mut marker = vec![0u8; 512];
        marker[0] = 0x77;
        disk.write_sectors(40, 1, &marker).unwrap();

        let shared: SharedDevice = Arc::new(Mutex::new(disk));
        let part = Partition {
            name: String::from("p"),
            dev_no: 1,
            part_no: 1,
            first_sector: 32,
            num_sectors: 16,
            legacy_type: 0x83,
            bootable: false,
        };
        let mut view = PartitionView::new(shared, &part);
        assert_eq!(view.sector_count(), 16);

        // View sector 8 is device sector 40.
        let mut buf = vec![0u8; 512];
        view.read_sectors(8, 1, &mut buf).unwrap();
        assert_eq!(buf[0], 0x77);

        // The view never reaches outside its partition.
        assert_eq!(
            view.read_sectors(16, 1, &mut buf),
            Err(IoError::InvalidAddress)
        );
        assert_eq!(
            view.write_sectors(15, 2, &vec![0u8; 1024]),
            Err(IoError::InvalidAddress)
        );
    }
}

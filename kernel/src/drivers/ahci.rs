//! AHCI (SATA) driver
//!
//! A port is rebased onto a caller-allocated 12 KiB region holding its
//! command list (32 headers), the received-FIS area and one command table
//! per slot. Each request builds a command header, a host-to-device
//! register FIS and a PRDT, then waits on the command-issue bit with a
//! bounded spin; a task-file error surfaces through the error register
//! decoding shared with the ATA driver.
//!
//! Memory layouts and command construction are plain data code, unit
//! tested on the host; only the MMIO half is target-gated.

use crate::error::IoError;

/// Bytes the caller must hand `rebase` per port
pub const PORT_REGION_SIZE: usize = 12 * 1024;

/// Command slots per port
pub const CMD_SLOTS: usize = 32;

/// PRDT entries per command table
pub const PRDT_ENTRIES: usize = 8;

/// Max bytes one PRDT entry can describe (4 MiB, and the byte count field
/// stores `len - 1`)
pub const PRDT_MAX_BYTES: usize = 4 * 1024 * 1024;

const FIS_TYPE_REG_H2D: u8 = 0x27;
const CMD_READ_DMA_EXT: u8 = 0x25;
const CMD_WRITE_DMA_EXT: u8 = 0x35;

/// Host-to-device register FIS
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FisRegH2D {
    pub fis_type: u8,
    /// Port multiplier port in the low nibble; bit 7 = command (vs control)
    pub pmport_c: u8,
    pub command: u8,
    pub feature_lo: u8,

    pub lba0: u8,
    pub lba1: u8,
    pub lba2: u8,
    pub device: u8,

    pub lba3: u8,
    pub lba4: u8,
    pub lba5: u8,
    pub feature_hi: u8,

    pub count_lo: u8,
    pub count_hi: u8,
    pub icc: u8,
    pub control: u8,

    pub reserved: [u8; 4],
}

/// One command-list header
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct HbaCmdHeader {
    /// cfl in the low 5 bits, write = bit 6, prefetchable = bit 7
    pub flags: u16,
    /// PRDT length in entries
    pub prdtl: u16,
    /// Bytes transferred, updated by the HBA
    pub prdbc: u32,
    /// Command-table base (128-byte aligned)
    pub ctba: u32,
    pub ctbau: u32,
    pub reserved: [u32; 4],
}

/// One physical-region descriptor
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct HbaPrdtEntry {
    pub dba: u32,
    pub dbau: u32,
    pub reserved: u32,
    /// Byte count - 1 in the low 22 bits; bit 31 = interrupt on completion
    pub dbc_i: u32,
}

/// Command table: command FIS, ATAPI command area, PRDT
#[repr(C)]
pub struct HbaCmdTable {
    pub cfis: [u8; 64],
    pub acmd: [u8; 16],
    pub reserved: [u8; 48],
    pub prdt: [HbaPrdtEntry; PRDT_ENTRIES],
}

/// Port register block (one per port, inside the HBA's MMIO space)
#[repr(C)]
pub struct HbaPort {
    pub clb: u32,
    pub clbu: u32,
    pub fb: u32,
    pub fbu: u32,
    pub is: u32,
    pub ie: u32,
    pub cmd: u32,
    pub reserved0: u32,
    pub tfd: u32,
    pub sig: u32,
    pub ssts: u32,
    pub sctl: u32,
    pub serr: u32,
    pub sact: u32,
    pub ci: u32,
    pub sntf: u32,
    pub fbs: u32,
    pub reserved1: [u32; 11],
    pub vendor: [u32; 4],
}

/// Where the pieces of a rebased port live inside its region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRegionLayout {
    pub cmd_list: u32,
    pub received_fis: u32,
    pub first_cmd_table: u32,
    pub cmd_table_stride: u32,
}

impl PortRegionLayout {
    pub fn cmd_table(&self, slot: usize) -> u32 {
        self.first_cmd_table + slot as u32 * self.cmd_table_stride
    }
}

/// Split a port region into command list, received-FIS area and command
/// tables. `base` must be 1 KiB aligned (the command-list requirement).
pub fn region_layout(base: u32) -> PortRegionLayout {
    assert_eq!(base % 1024, 0, "port region must be 1 KiB aligned");
    let cmd_list = base;
    let received_fis = base + (CMD_SLOTS * core::mem::size_of::<HbaCmdHeader>()) as u32;
    // Command tables are 256 bytes here and must be 128-byte aligned; the
    // received-FIS area is 256 bytes, so the first table lands aligned.
    let first_cmd_table = received_fis + 256;
    let layout = PortRegionLayout {
        cmd_list,
        received_fis,
        first_cmd_table,
        cmd_table_stride: core::mem::size_of::<HbaCmdTable>() as u32,
    };
    debug_assert!(
        layout.cmd_table(CMD_SLOTS) - base <= PORT_REGION_SIZE as u32,
        "port region overrun"
    );
    layout
}

/// Build the register FIS for a 48-bit DMA read or write.
pub fn build_rw_fis(lba: u64, count: u16, write: bool) -> FisRegH2D {
    FisRegH2D {
        fis_type: FIS_TYPE_REG_H2D,
        pmport_c: 1 << 7, // command
        command: if write { CMD_WRITE_DMA_EXT } else { CMD_READ_DMA_EXT },
        device: 1 << 6, // LBA mode
        lba0: lba as u8,
        lba1: (lba >> 8) as u8,
        lba2: (lba >> 16) as u8,
        lba3: (lba >> 24) as u8,
        lba4: (lba >> 32) as u8,
        lba5: (lba >> 40) as u8,
        count_lo: count as u8,
        count_hi: (count >> 8) as u8,
        ..Default::default()
    }
}

/// Fill a PRDT for a physically contiguous buffer. Returns the number of
/// entries used.
pub fn fill_prdt(
    prdt: &mut [HbaPrdtEntry; PRDT_ENTRIES],
    buffer_phys: u32,
    len: usize,
) -> Result<u16, IoError> {
    if len == 0 || len > PRDT_ENTRIES * PRDT_MAX_BYTES {
        return Err(IoError::InvalidAddress);
    }
    let mut remaining = len;
    let mut addr = buffer_phys;
    let mut used = 0usize;
    while remaining > 0 {
        let chunk = remaining.min(PRDT_MAX_BYTES);
        prdt[used] = HbaPrdtEntry {
            dba: addr,
            dbau: 0,
            reserved: 0,
            dbc_i: (chunk as u32 - 1) | (1 << 31),
        };
        addr += chunk as u32;
        remaining -= chunk;
        used += 1;
    }
    Ok(used as u16)
}

/// Build the command header for a request.
pub fn build_cmd_header(table_phys: u32, prdt_len: u16, write: bool) -> HbaCmdHeader {
    let cfl = (core::mem::size_of::<FisRegH2D>() / 4) as u16; // in dwords
    HbaCmdHeader {
        flags: cfl | if write { 1 << 6 } else { 0 },
        prdtl: prdt_len,
        prdbc: 0,
        ctba: table_phys,
        ctbau: 0,
        reserved: [0; 4],
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod hw {
    //! MMIO half: port start/stop, rebase, command issue.

    use super::*;
    use core::ptr::{read_volatile, write_volatile};

    const PXCMD_ST: u32 = 1 << 0;
    const PXCMD_FRE: u32 = 1 << 4;
    const PXCMD_FR: u32 = 1 << 14;
    const PXCMD_CR: u32 = 1 << 15;
    const PXIS_TFES: u32 = 1 << 30;
    const TFD_BSY: u32 = 0x80;
    const TFD_DRQ: u32 = 0x08;

    /// Bound on every busy-wait; a healthy device answers well within it.
    const SPIN_LIMIT: u32 = 1_000_000;

    pub struct Port {
        regs: *mut HbaPort,
        layout: PortRegionLayout,
    }

    // SAFETY: a Port is the sole handle to its register block; commands
    // are serialized by the registry's per-device lock.
    unsafe impl Send for Port {}

    impl Port {
        /// Take over a port, pointing it at `region` (12 KiB, physically
        /// contiguous, identity mapped, 1 KiB aligned).
        ///
        /// # Safety
        ///
        /// `regs` must be the port's register block and `region` memory
        /// the caller owns for the lifetime of the port.
        pub unsafe fn rebase(regs: *mut HbaPort, region: u32) -> Self {
            let layout = region_layout(region);
            let mut port = Self { regs, layout };
            port.stop();
            // SAFETY: caller guarantees the region; zeroing our own memory.
            unsafe {
                core::ptr::write_bytes(region as *mut u8, 0, PORT_REGION_SIZE);
                write_volatile(&mut (*port.regs).clb, layout.cmd_list);
                write_volatile(&mut (*port.regs).clbu, 0);
                write_volatile(&mut (*port.regs).fb, layout.received_fis);
                write_volatile(&mut (*port.regs).fbu, 0);
            }
            port.start();
            port
        }

        fn stop(&mut self) {
            // SAFETY: register block owned by this port.
            unsafe {
                let cmd = read_volatile(&(*self.regs).cmd);
                write_volatile(&mut (*self.regs).cmd, cmd & !(PXCMD_ST | PXCMD_FRE));
                let mut spins = 0;
                while read_volatile(&(*self.regs).cmd) & (PXCMD_FR | PXCMD_CR) != 0 {
                    spins += 1;
                    if spins > SPIN_LIMIT {
                        log::warn!("ahci: port refused to stop");
                        break;
                    }
                    core::hint::spin_loop();
                }
            }
        }

        fn start(&mut self) {
            // SAFETY: register block owned by this port.
            unsafe {
                let mut spins = 0;
                while read_volatile(&(*self.regs).cmd) & PXCMD_CR != 0 {
                    spins += 1;
                    if spins > SPIN_LIMIT {
                        break;
                    }
                    core::hint::spin_loop();
                }
                let cmd = read_volatile(&(*self.regs).cmd);
                write_volatile(&mut (*self.regs).cmd, cmd | PXCMD_FRE | PXCMD_ST);
            }
        }

        fn free_slot(&self) -> Result<usize, IoError> {
            // SAFETY: register block owned by this port.
            let busy = unsafe { read_volatile(&(*self.regs).sact) | read_volatile(&(*self.regs).ci) };
            for slot in 0..CMD_SLOTS {
                if busy & (1 << slot) == 0 {
                    return Ok(slot);
                }
            }
            Err(IoError::DeviceFault)
        }

        /// Run one DMA transfer. `buffer_phys` must be physically
        /// contiguous and identity mapped.
        pub fn transfer(
            &mut self,
            lba: u64,
            count: u16,
            buffer_phys: u32,
            len: usize,
            write: bool,
        ) -> Result<(), IoError> {
            let slot = self.free_slot()?;
            let table_addr = self.layout.cmd_table(slot);

            // SAFETY: the region belongs to this port; slot is free.
            unsafe {
                let table = table_addr as *mut HbaCmdTable;
                core::ptr::write_bytes(table, 0, 1);
                let fis = build_rw_fis(lba, count, write);
                core::ptr::copy_nonoverlapping(
                    &fis as *const FisRegH2D as *const u8,
                    (*table).cfis.as_mut_ptr(),
                    core::mem::size_of::<FisRegH2D>(),
                );
                let prdt_len = fill_prdt(&mut (*table).prdt, buffer_phys, len)?;

                let header = (self.layout.cmd_list as *mut HbaCmdHeader).add(slot);
                *header = build_cmd_header(table_addr, prdt_len, write);

                // Wait for the port to be idle, then issue.
                let mut spins = 0;
                while read_volatile(&(*self.regs).tfd) & (TFD_BSY | TFD_DRQ) != 0 {
                    spins += 1;
                    if spins > SPIN_LIMIT {
                        return Err(IoError::DeviceFault);
                    }
                    core::hint::spin_loop();
                }
                write_volatile(&mut (*self.regs).ci, 1 << slot);

                // Bounded spin on the command-issue bit.
                spins = 0;
                loop {
                    if read_volatile(&(*self.regs).is) & PXIS_TFES != 0 {
                        let tfd = read_volatile(&(*self.regs).tfd);
                        return Err(super::super::ata::decode_error_register((tfd >> 8) as u8));
                    }
                    if read_volatile(&(*self.regs).ci) & (1 << slot) == 0 {
                        break;
                    }
                    spins += 1;
                    if spins > SPIN_LIMIT {
                        return Err(IoError::DeviceFault);
                    }
                    core::hint::spin_loop();
                }
            }
            Ok(())
        }
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use hw::Port;

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn structure_sizes_match_the_hardware_layout() {
        assert_eq!(size_of::<FisRegH2D>(), 20);
        assert_eq!(size_of::<HbaCmdHeader>(), 32);
        assert_eq!(size_of::<HbaPrdtEntry>(), 16);
        assert_eq!(size_of::<HbaCmdTable>(), 256);
        assert_eq!(size_of::<HbaPort>(), 0x80);
    }

    #[test]
    fn region_layout_fits_twelve_kib() {
        let layout = region_layout(0x10_0000);
        assert_eq!(layout.cmd_list, 0x10_0000);
        assert_eq!(layout.received_fis, 0x10_0000 + 1024);
        assert_eq!(layout.first_cmd_table, 0x10_0000 + 1280);
        // Tables stay 128-byte aligned and inside the region.
        for slot in 0..CMD_SLOTS {
            assert_eq!(layout.cmd_table(slot) % 128, 0);
        }
        assert!(layout.cmd_table(CMD_SLOTS) - 0x10_0000 <= PORT_REGION_SIZE as u32);
    }

    #[test]
    fn rw_fis_encodes_lba_and_count() {
        let fis = build_rw_fis(0x0123_4567_89AB, 0x0102, false);
        assert_eq!(fis.fis_type, FIS_TYPE_REG_H2D);
        assert_eq!(fis.pmport_c, 0x80);
        assert_eq!(fis.command, CMD_READ_DMA_EXT);
        assert_eq!(
            [fis.lba0, fis.lba1, fis.lba2, fis.lba3, fis.lba4, fis.lba5],
            [0xAB, 0x89, 0x67, 0x45, 0x23, 0x01]
        );
        assert_eq!((fis.count_lo, fis.count_hi), (0x02, 0x01));
        assert_eq!(fis.device, 1 << 6);

        let wfis = build_rw_fis(0, 1, true);
        assert_eq!(wfis.command, CMD_WRITE_DMA_EXT);
    }

    #[test]
    fn prdt_splits_large_buffers() {
        let mut prdt = [HbaPrdtEntry::default(); PRDT_ENTRIES];
        let used = fill_prdt(&mut prdt, 0x20_0000, PRDT_MAX_BYTES + 4096).unwrap();
        assert_eq!(used, 2);
        assert_eq!(prdt[0].dba, 0x20_0000);
        assert_eq!(prdt[0].dbc_i & 0x3F_FFFF, (PRDT_MAX_BYTES - 1) as u32);
        assert_eq!(prdt[1].dba, 0x20_0000 + PRDT_MAX_BYTES as u32);
        assert_eq!(prdt[1].dbc_i & 0x3F_FFFF, 4095);
    }

    #[test]
    fn prdt_rejects_empty_and_oversized() {
        let mut prdt = [HbaPrdtEntry::default(); PRDT_ENTRIES];
        assert_eq!(fill_prdt(&mut prdt, 0, 0), Err(IoError::InvalidAddress));
        assert_eq!(
            fill_prdt(&mut prdt, 0, PRDT_ENTRIES * PRDT_MAX_BYTES + 1),
            Err(IoError::InvalidAddress)
        );
    }

    #[test]
    fn cmd_header_flags_carry_fis_length_and_direction() {
        let header = build_cmd_header(0x1000, 3, true);
        assert_eq!(header.flags & 0x1F, 5); // 20-byte FIS = 5 dwords
        assert_ne!(header.flags & (1 << 6), 0);
        assert_eq!(header.prdtl, 3);
        assert_eq!(header.ctba, 0x1000);

        let read = build_cmd_header(0x2000, 1, false);
        assert_eq!(read.flags & (1 << 6), 0);
    }
}

//! ATA PIO driver
//!
//! Polled programmed I/O over the legacy IDE register blocks. Addressing
//! mode is chosen per request: LBA28 when the whole request fits below the
//! 2^28-sector boundary, LBA48 beyond that, CHS for drives without LBA
//! support. Writes finish with a cache-flush command. The error register
//! decodes into the kernel's stable I/O taxonomy.
//!
//! The register-banging half only exists on the bare-metal target; the
//! addressing and decoding logic is plain code shared with the host tests.

use crate::error::IoError;

/// Error-register bits
const ER_AMNF: u8 = 0x01; // no address mark
const ER_TK0NF: u8 = 0x02; // track 0 not found (treated as missing media)
const ER_ABRT: u8 = 0x04; // command aborted
const ER_MCR: u8 = 0x08; // media change request
const ER_IDNF: u8 = 0x10; // id mark not found
const ER_MC: u8 = 0x20; // media changed
const ER_UNC: u8 = 0x40; // uncorrectable data
const ER_BBK: u8 = 0x80; // bad block

/// Largest sector index reachable with 28-bit addressing
const LBA28_LIMIT: u64 = 1 << 28;

/// How a request is addressed on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    Chs { cylinder: u16, head: u8, sector: u8 },
    Lba28,
    Lba48,
}

/// Pick the addressing mode for a request. The whole span counts: a
/// request that starts below the 28-bit boundary but runs past it must use
/// LBA48.
pub fn select_addressing(
    lba: u64,
    count: usize,
    supports_lba: bool,
    supports_lba48: bool,
) -> Result<Addressing, IoError> {
    if !supports_lba {
        if lba + count as u64 > LBA28_LIMIT {
            return Err(IoError::InvalidAddress);
        }
        return Ok(chs_for(lba as u32));
    }
    if lba + count as u64 <= LBA28_LIMIT {
        return Ok(Addressing::Lba28);
    }
    if supports_lba48 {
        return Ok(Addressing::Lba48);
    }
    Err(IoError::InvalidAddress)
}

/// Classic 16-head, 63-sector translation for pre-LBA drives.
fn chs_for(lba: u32) -> Addressing {
    let sector = (lba % 63) as u8 + 1;
    let track = lba / 63;
    Addressing::Chs {
        cylinder: (track / 16) as u16,
        head: (track % 16) as u8,
        sector,
    }
}

/// Map the error register to the stable taxonomy. Checked in the order the
/// bits are most specific about the cause.
pub fn decode_error_register(err: u8) -> IoError {
    if err & ER_AMNF != 0 {
        return IoError::AddressMarkNotFound;
    }
    if err & ER_TK0NF != 0 {
        return IoError::NoMedia;
    }
    if err & ER_ABRT != 0 {
        return IoError::CommandAborted;
    }
    if err & ER_MCR != 0 {
        return IoError::NoMedia;
    }
    if err & ER_IDNF != 0 {
        return IoError::IdNotFound;
    }
    if err & ER_MC != 0 {
        return IoError::NoMedia;
    }
    if err & ER_UNC != 0 {
        return IoError::UncorrectableData;
    }
    if err & ER_BBK != 0 {
        return IoError::BadSector;
    }
    IoError::ReadError
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod hw {
    //! Register-level access to the two legacy IDE channels.

    use alloc::format;
    use alloc::string::String;

    use super::*;
    use crate::drivers::storage::{StorageDevice, DEVICE_REGISTRY};
    use crate::intrinsics::{inb, insw, outb, outsw};

    // Status bits
    const SR_BSY: u8 = 0x80;
    const SR_DF: u8 = 0x20;
    const SR_DRQ: u8 = 0x08;
    const SR_ERR: u8 = 0x01;

    // Commands
    const CMD_READ_PIO: u8 = 0x20;
    const CMD_READ_PIO_EXT: u8 = 0x24;
    const CMD_WRITE_PIO: u8 = 0x30;
    const CMD_WRITE_PIO_EXT: u8 = 0x34;
    const CMD_CACHE_FLUSH: u8 = 0xE7;
    const CMD_CACHE_FLUSH_EXT: u8 = 0xEA;
    const CMD_IDENTIFY: u8 = 0xEC;

    // Register offsets from the channel base
    const REG_DATA: u16 = 0;
    const REG_ERROR: u16 = 1;
    const REG_SECCOUNT: u16 = 2;
    const REG_LBA0: u16 = 3;
    const REG_LBA1: u16 = 4;
    const REG_LBA2: u16 = 5;
    const REG_HDDEVSEL: u16 = 6;
    const REG_COMMAND: u16 = 7;
    const REG_STATUS: u16 = 7;

    #[derive(Clone, Copy)]
    struct Channel {
        base: u16,
        ctrl: u16,
    }

    const CHANNELS: [Channel; 2] = [
        Channel { base: 0x1F0, ctrl: 0x3F6 },
        Channel { base: 0x170, ctrl: 0x376 },
    ];

    impl Channel {
        fn write_reg(&self, reg: u16, value: u8) {
            // SAFETY: legacy IDE port range, probed before use.
            unsafe { outb(self.base + reg, value) };
        }

        fn read_reg(&self, reg: u16) -> u8 {
            // SAFETY: as above.
            unsafe { inb(self.base + reg) }
        }

        fn io_delay(&self) {
            // Reading the alternate status wastes ~100ns; four reads give
            // the device its mandated settling time.
            for _ in 0..4 {
                // SAFETY: alternate status is read-only and side-effect free.
                unsafe { inb(self.ctrl) };
            }
        }

        fn wait_not_busy(&self) {
            while self.read_reg(REG_STATUS) & SR_BSY != 0 {
                core::hint::spin_loop();
            }
        }

        fn poll_transfer(&self) -> Result<(), IoError> {
            self.io_delay();
            self.wait_not_busy();
            let status = self.read_reg(REG_STATUS);
            if status & SR_ERR != 0 {
                return Err(decode_error_register(self.read_reg(REG_ERROR)));
            }
            if status & SR_DF != 0 {
                return Err(IoError::DeviceFault);
            }
            if status & SR_DRQ == 0 {
                return Err(IoError::ReadError);
            }
            Ok(())
        }
    }

    /// One detected drive
    pub struct AtaDrive {
        name: String,
        channel: Channel,
        slave: bool,
        supports_lba: bool,
        supports_lba48: bool,
        sector_count: u64,
        sector_size: usize,
    }

    impl AtaDrive {
        fn identify(channel: Channel, slave: bool, index: usize) -> Option<Self> {
            channel.write_reg(REG_HDDEVSEL, 0xA0 | ((slave as u8) << 4));
            channel.io_delay();
            channel.write_reg(REG_COMMAND, CMD_IDENTIFY);
            channel.io_delay();
            if channel.read_reg(REG_STATUS) == 0 {
                return None; // nothing wired to this position
            }
            channel.wait_not_busy();
            if channel.read_reg(REG_STATUS) & SR_ERR != 0 {
                return None; // ATAPI or absent
            }

            let mut identity = [0u16; 256];
            // SAFETY: IDENTIFY leaves 256 words in the data register.
            unsafe { insw(channel.base + REG_DATA, identity.as_mut_ptr(), 256) };

            let capabilities = identity[49];
            let supports_lba = capabilities & 0x0200 != 0;
            let cmd_sets = identity[83];
            let supports_lba48 = cmd_sets & (1 << 10) != 0;
            let sector_count = if supports_lba48 {
                (identity[100] as u64)
                    | (identity[101] as u64) << 16
                    | (identity[102] as u64) << 32
                    | (identity[103] as u64) << 48
            } else {
                (identity[60] as u64) | (identity[61] as u64) << 16
            };
            if sector_count == 0 {
                return None;
            }

            Some(Self {
                name: format!("ata{}", index),
                channel,
                slave,
                supports_lba,
                supports_lba48,
                sector_count,
                sector_size: 512,
            })
        }

        fn setup_transfer(
            &self,
            lba: u64,
            count: usize,
            mode: Addressing,
        ) -> Result<(), IoError> {
            let ch = &self.channel;
            ch.wait_not_busy();

            let slavebit = (self.slave as u8) << 4;
            match mode {
                Addressing::Chs { cylinder, head, sector } => {
                    ch.write_reg(REG_HDDEVSEL, 0xA0 | slavebit | (head & 0x0F));
                    ch.write_reg(REG_SECCOUNT, count as u8);
                    ch.write_reg(REG_LBA0, sector);
                    ch.write_reg(REG_LBA1, cylinder as u8);
                    ch.write_reg(REG_LBA2, (cylinder >> 8) as u8);
                }
                Addressing::Lba28 => {
                    ch.write_reg(REG_HDDEVSEL, 0xE0 | slavebit | ((lba >> 24) as u8 & 0x0F));
                    ch.write_reg(REG_SECCOUNT, count as u8);
                    ch.write_reg(REG_LBA0, lba as u8);
                    ch.write_reg(REG_LBA1, (lba >> 8) as u8);
                    ch.write_reg(REG_LBA2, (lba >> 16) as u8);
                }
                Addressing::Lba48 => {
                    ch.write_reg(REG_HDDEVSEL, 0xE0 | slavebit);
                    // High halves first, then the low ones.
                    ch.write_reg(REG_SECCOUNT, (count >> 8) as u8);
                    ch.write_reg(REG_LBA0, (lba >> 24) as u8);
                    ch.write_reg(REG_LBA1, (lba >> 32) as u8);
                    ch.write_reg(REG_LBA2, (lba >> 40) as u8);
                    ch.write_reg(REG_SECCOUNT, count as u8);
                    ch.write_reg(REG_LBA0, lba as u8);
                    ch.write_reg(REG_LBA1, (lba >> 8) as u8);
                    ch.write_reg(REG_LBA2, (lba >> 16) as u8);
                }
            }
            Ok(())
        }

        fn flush_cache(&self, mode: Addressing) {
            let cmd = if matches!(mode, Addressing::Lba48) {
                CMD_CACHE_FLUSH_EXT
            } else {
                CMD_CACHE_FLUSH
            };
            self.channel.write_reg(REG_COMMAND, cmd);
            self.channel.io_delay();
            self.channel.wait_not_busy();
        }
    }

    impl AtaDrive {
        fn read_burst(&mut self, sector: u64, count: usize, buf: &mut [u8]) -> Result<(), IoError> {
            let mode = select_addressing(sector, count, self.supports_lba, self.supports_lba48)?;
            self.setup_transfer(sector, count, mode)?;
            let cmd = if matches!(mode, Addressing::Lba48) {
                CMD_READ_PIO_EXT
            } else {
                CMD_READ_PIO
            };
            self.channel.write_reg(REG_COMMAND, cmd);

            let words_per_sector = self.sector_size / 2;
            for i in 0..count {
                self.channel.poll_transfer()?;
                // SAFETY: DRQ is set and the buffer holds a full sector.
                unsafe {
                    insw(
                        self.channel.base + REG_DATA,
                        buf.as_mut_ptr().add(i * self.sector_size) as *mut u16,
                        words_per_sector,
                    );
                }
            }
            Ok(())
        }

        fn write_burst(&mut self, sector: u64, count: usize, buf: &[u8]) -> Result<(), IoError> {
            let mode = select_addressing(sector, count, self.supports_lba, self.supports_lba48)?;
            self.setup_transfer(sector, count, mode)?;
            let cmd = if matches!(mode, Addressing::Lba48) {
                CMD_WRITE_PIO_EXT
            } else {
                CMD_WRITE_PIO
            };
            self.channel.write_reg(REG_COMMAND, cmd);

            let words_per_sector = self.sector_size / 2;
            for i in 0..count {
                self.channel.io_delay();
                self.channel.wait_not_busy();
                // SAFETY: device is ready for data and the buffer holds a
                // full sector.
                unsafe {
                    outsw(
                        self.channel.base + REG_DATA,
                        buf.as_ptr().add(i * self.sector_size) as *const u16,
                        words_per_sector,
                    );
                }
            }
            self.flush_cache(mode);
            Ok(())
        }
    }

    /// Sectors per command burst; the sector-count register is 8 bits wide
    /// in LBA28/CHS mode.
    const BURST_SECTORS: usize = 128;

    impl StorageDevice for AtaDrive {
        fn name(&self) -> &str {
            &self.name
        }

        fn sector_size(&self) -> usize {
            self.sector_size
        }

        fn sector_count(&self) -> u64 {
            self.sector_count
        }

        fn read_sectors(
            &mut self,
            sector: u64,
            count: usize,
            buf: &mut [u8],
        ) -> Result<(), IoError> {
            if sector + count as u64 > self.sector_count {
                return Err(IoError::InvalidAddress);
            }
            if buf.len() < count * self.sector_size {
                return Err(IoError::ReadError);
            }
            let mut done = 0usize;
            while done < count {
                let burst = (count - done).min(BURST_SECTORS);
                let bytes = done * self.sector_size..(done + burst) * self.sector_size;
                self.read_burst(sector + done as u64, burst, &mut buf[bytes])?;
                done += burst;
            }
            Ok(())
        }

        fn write_sectors(&mut self, sector: u64, count: usize, buf: &[u8]) -> Result<(), IoError> {
            if sector + count as u64 > self.sector_count {
                return Err(IoError::InvalidAddress);
            }
            if buf.len() < count * self.sector_size {
                return Err(IoError::WriteError);
            }
            let mut done = 0usize;
            while done < count {
                let burst = (count - done).min(BURST_SECTORS);
                let bytes = done * self.sector_size..(done + burst) * self.sector_size;
                self.write_burst(sector + done as u64, burst, &buf[bytes])?;
                done += burst;
            }
            Ok(())
        }
    }

    /// Probe both channels, master and slave, and register what answers.
    pub fn probe_and_register() {
        let mut index = 0;
        for channel in CHANNELS {
            for slave in [false, true] {
                if let Some(drive) = AtaDrive::identify(channel, slave, index) {
                    log::info!(
                        "ata: {} — {} sectors of {} bytes",
                        drive.name,
                        drive.sector_count,
                        drive.sector_size
                    );
                    DEVICE_REGISTRY.lock().register(drive);
                    index += 1;
                }
            }
        }
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use hw::probe_and_register;

//! Boot contract
//!
//! The kernel is entered with a magic value and a pointer to a
//! multiboot-style information structure. Three things are consumed from
//! it: the memory map (with two fallbacks when the bootloader supplies
//! less), the command line, and nothing else. Raw-memory access is
//! confined to the target-only `gather` function; the parsers work on
//! slices and strings.

use alloc::vec::Vec;

use crate::mm::{MemoryRegion, RegionKind};

/// Value in EAX when a multiboot loader hands over control
pub const MULTIBOOT_BOOTLOADER_MAGIC: u32 = 0x2BAD_B002;

pub const FLAG_MEM: u32 = 1 << 0;
pub const FLAG_CMDLINE: u32 = 1 << 2;
pub const FLAG_MMAP: u32 = 1 << 6;

const MEMORY_AVAILABLE: u32 = 1;

/// The multiboot information structure, as far as this kernel reads it
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MultibootInfo {
    pub flags: u32,
    pub mem_lower: u32,
    pub mem_upper: u32,
    pub boot_device: u32,
    pub cmdline: u32,
    pub mods_count: u32,
    pub mods_addr: u32,
    pub syms: [u32; 4],
    pub mmap_length: u32,
    pub mmap_addr: u32,
}

/// Parse a multiboot memory map. Each entry is a 4-byte size prefix
/// (counting the rest of the entry) followed by `{base: u64, length: u64,
/// type: u32}`; entries advance by `size + 4`.
pub fn parse_memory_map(bytes: &[u8]) -> Vec<MemoryRegion> {
    let mut regions = Vec::new();
    let mut offset = 0usize;
    while offset + 24 <= bytes.len() {
        let size = u32::from_le_bytes(bytes[offset..offset + 4].try_into().expect("u32")) as usize;
        if size < 20 {
            break; // corrupt entry
        }
        let base = u64::from_le_bytes(bytes[offset + 4..offset + 12].try_into().expect("u64"));
        let length = u64::from_le_bytes(bytes[offset + 12..offset + 20].try_into().expect("u64"));
        let kind = u32::from_le_bytes(bytes[offset + 20..offset + 24].try_into().expect("u32"));
        regions.push(MemoryRegion {
            base,
            length,
            kind: if kind == MEMORY_AVAILABLE {
                RegionKind::Available
            } else {
                RegionKind::Reserved
            },
        });
        offset += size + 4;
    }
    regions
}

/// Fallback when only the `mem_lower`/`mem_upper` pair is present: the
/// low range plus the range above 1 MiB.
pub fn regions_from_mem_pair(mem_lower_kb: u32, mem_upper_kb: u32) -> Vec<MemoryRegion> {
    let mut regions = Vec::new();
    regions.push(MemoryRegion {
        base: 0,
        length: mem_lower_kb as u64 * 1024,
        kind: RegionKind::Available,
    });
    regions.push(MemoryRegion {
        base: 1024 * 1024,
        length: mem_upper_kb as u64 * 1024,
        kind: RegionKind::Available,
    });
    regions
}

/// Last resort when the bootloader reported nothing: assume 512 KiB of
/// low memory and a gigabyte above 1 MiB, and hope.
pub fn assumed_regions() -> Vec<MemoryRegion> {
    let mut regions = Vec::new();
    regions.push(MemoryRegion {
        base: 0,
        length: 512 * 1024,
        kind: RegionKind::Available,
    });
    regions.push(MemoryRegion {
        base: 1024 * 1024,
        length: 1024 * 1024 * 1024 - 1024 * 1024,
        kind: RegionKind::Available,
    });
    regions
}

/// Options recognized on the kernel command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootOptions {
    pub root_dev: u32,
    pub root_part: u32,
    /// `tests`: run the built-in smoke suite and halt
    pub run_tests: bool,
}

impl Default for BootOptions {
    fn default() -> Self {
        Self {
            root_dev: 1,
            root_part: 1,
            run_tests: false,
        }
    }
}

/// Parse the command line: `root=d<N>p<M>` selects the root device and
/// partition, the word `tests` requests the smoke suite. Anything else is
/// ignored.
pub fn parse_command_line(cmdline: &str) -> BootOptions {
    let mut options = BootOptions::default();
    for word in cmdline.split_whitespace() {
        if word == "tests" {
            options.run_tests = true;
            continue;
        }
        if let Some(spec) = word.strip_prefix("root=d") {
            if let Some((dev, part)) = spec.split_once('p') {
                if let (Ok(dev), Ok(part)) = (dev.parse::<u32>(), part.parse::<u32>()) {
                    options.root_dev = dev;
                    options.root_part = part;
                    continue;
                }
            }
            log::warn!("boot: unparsable root spec \"{}\", using default", word);
        }
    }
    options
}

/// Read the memory map and command line out of the live multiboot
/// structure.
///
/// # Safety
///
/// `info` must point at a multiboot information structure whose embedded
/// pointers (memory map, command line) are valid identity-mapped memory.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub unsafe fn gather(info: &MultibootInfo) -> (Vec<MemoryRegion>, BootOptions) {
    let regions = if info.flags & FLAG_MMAP != 0 {
        // SAFETY: per the function contract.
        let bytes = unsafe {
            core::slice::from_raw_parts(info.mmap_addr as *const u8, info.mmap_length as usize)
        };
        parse_memory_map(bytes)
    } else if info.flags & FLAG_MEM != 0 {
        regions_from_mem_pair(info.mem_lower, info.mem_upper)
    } else {
        log::warn!("boot: no memory information from the loader, guessing");
        assumed_regions()
    };

    let options = if info.flags & FLAG_CMDLINE != 0 {
        // SAFETY: per the function contract; the command line is a
        // NUL-terminated string.
        let cmdline = unsafe {
            let start = info.cmdline as *const u8;
            let mut len = 0usize;
            while core::ptr::read(start.add(len)) != 0 {
                len += 1;
            }
            core::str::from_utf8(core::slice::from_raw_parts(start, len)).unwrap_or("")
        };
        log::info!("boot: command line \"{}\"", cmdline);
        parse_command_line(cmdline)
    } else {
        BootOptions::default()
    };

    (regions, options)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn entry(size: u32, base: u64, length: u64, kind: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&size.to_le_bytes());
        bytes.extend_from_slice(&base.to_le_bytes());
        bytes.extend_from_slice(&length.to_le_bytes());
        bytes.extend_from_slice(&kind.to_le_bytes());
        bytes
    }

    #[test]
    fn memory_map_entries_parse_with_size_prefix() {
        let mut bytes = Vec::new();
        bytes.extend(entry(20, 0, 0x9_F000, 1));
        bytes.extend(entry(20, 0x9_F000, 0x6_1000, 2));
        bytes.extend(entry(20, 0x10_0000, 0x3FF0_0000, 1));

        let regions = parse_memory_map(&bytes);
        assert_eq!(regions.len(), 3);
        assert_eq!(regions[0].kind, RegionKind::Available);
        assert_eq!(regions[1].kind, RegionKind::Reserved);
        assert_eq!(regions[2].base, 0x10_0000);
        assert_eq!(regions[2].length, 0x3FF0_0000);
    }

    #[test]
    fn memory_map_honors_oversized_entries() {
        // ACPI 3.0 entries carry 4 extra bytes; the size prefix skips them.
        let mut bytes = Vec::new();
        let mut first = entry(24, 0, 0x1000, 1);
        first.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend(first);
        bytes.extend(entry(20, 0x2000, 0x1000, 1));

        let regions = parse_memory_map(&bytes);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[1].base, 0x2000);
    }

    #[test]
    fn mem_pair_fallback_covers_low_and_high() {
        let regions = regions_from_mem_pair(640, 30 * 1024);
        assert_eq!(regions[0].base, 0);
        assert_eq!(regions[0].length, 640 * 1024);
        assert_eq!(regions[1].base, 1024 * 1024);
        assert_eq!(regions[1].length, 30 * 1024 * 1024);
    }

    #[test]
    fn command_line_selects_root_and_tests() {
        let options = parse_command_line("root=d2p5 quiet tests");
        assert_eq!(options.root_dev, 2);
        assert_eq!(options.root_part, 5);
        assert!(options.run_tests);

        assert_eq!(parse_command_line(""), BootOptions::default());
        assert_eq!(parse_command_line("root=dXp1"), BootOptions::default());

        let multi = parse_command_line("root=d10p12");
        assert_eq!(multi.root_dev, 10);
        assert_eq!(multi.root_part, 12);
    }
}

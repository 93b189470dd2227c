//! Built-in smoke suite
//!
//! Run when the kernel command line carries `tests`: a handful of quick
//! cross-layer checks against the live kernel, each logging pass/fail.
//! This is a sanity net for hardware bring-up, not the unit-test suite —
//! that one runs on the host.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::drivers::storage::{RamDisk, StorageDevice};
use crate::fs::cache::BlockCache;
use crate::fs::partition::{discover_partitions, Partition};
use crate::fs::{ferrofs, vfs::Vfs, SeekOrigin};
use crate::process::Priority;
use crate::sched::Scheduler;

struct Outcome {
    passed: usize,
    failed: usize,
}

impl Outcome {
    fn record(&mut self, name: &str, ok: bool) {
        if ok {
            self.passed += 1;
            log::info!("selftest: {} ... ok", name);
        } else {
            self.failed += 1;
            log::error!("selftest: {} ... FAILED", name);
        }
    }
}

/// Run every check. Returns true when all passed.
pub fn run() -> bool {
    let mut outcome = Outcome {
        passed: 0,
        failed: 0,
    };

    outcome.record("heap round trip", heap_round_trip());
    outcome.record("block cache write-back", cache_write_back());
    outcome.record("mbr parsing", mbr_parsing());
    outcome.record("ferrofs lifecycle", ferrofs_lifecycle());
    outcome.record("scheduler fifo", scheduler_fifo());

    log::info!(
        "selftest: {} passed, {} failed",
        outcome.passed,
        outcome.failed
    );
    outcome.failed == 0
}

fn heap_round_trip() -> bool {
    let boxed = Box::new(0x5AA5_1234u32);
    let mut grown: Vec<u8> = Vec::new();
    for i in 0..4096 {
        grown.push((i % 251) as u8);
    }
    *boxed == 0x5AA5_1234 && grown[4095] == (4095 % 251) as u8
}

fn cache_write_back() -> bool {
    let mut cache = BlockCache::new(RamDisk::new("st-cache", 512, 64), 1024, 2);
    if cache.write(1, 0, b"selftest").is_err() {
        return false;
    }
    if cache.flush().is_err() {
        return false;
    }
    // Push block 1 out and read it back through the device.
    let mut scratch = [0u8; 4];
    let _ = cache.read(2, 0, &mut scratch);
    let _ = cache.read(3, 0, &mut scratch);
    let mut back = [0u8; 8];
    cache.read(1, 0, &mut back).is_ok() && &back == b"selftest"
}

fn mbr_parsing() -> bool {
    let mut disk = RamDisk::new("st-mbr", 512, 128);
    let mut sector = vec![0u8; 512];
    sector[0x1BE + 4] = 0x83;
    sector[0x1BE + 8..0x1BE + 12].copy_from_slice(&64u32.to_le_bytes());
    sector[0x1BE + 12..0x1BE + 16].copy_from_slice(&32u32.to_le_bytes());
    sector[0x1FE] = 0x55;
    sector[0x1FF] = 0xAA;
    if disk.write_sectors(0, 1, &sector).is_err() {
        return false;
    }
    match discover_partitions(99, &mut disk) {
        Ok(parts) => {
            parts.len() == 1 && parts[0].first_sector == 64 && parts[0].num_sectors == 32
        }
        Err(_) => false,
    }
}

fn ferrofs_lifecycle() -> bool {
    let Ok(disk) = ferrofs::format(RamDisk::new("st-fs", 512, 2048), 16) else {
        return false;
    };
    let shared: crate::drivers::SharedDevice = Arc::new(spin::Mutex::new(disk));
    let mut vfs = Vfs::new();
    vfs.drivers.register(Arc::new(ferrofs::FerroFsDriver));
    let part = Partition {
        name: String::from("st"),
        dev_no: 99,
        part_no: 1,
        first_sector: 0,
        num_sectors: 2048,
        legacy_type: 0,
        bootable: false,
    };
    if vfs.mount_partition(shared, &part, "/").is_err() {
        return false;
    }
    if vfs.touch("/probe", None).is_err() {
        return false;
    }
    let Ok(mut file) = vfs.open("/probe", None) else {
        return false;
    };
    if file.write(b"ok").is_err() || file.seek(0, SeekOrigin::Start).is_err() {
        return false;
    }
    let mut buf = [0u8; 2];
    file.read(&mut buf).is_ok() && &buf == b"ok" && vfs.unlink("/probe", None).is_ok()
}

fn scheduler_fifo() -> bool {
    let mut table = crate::process::ProcessTable::new();
    let mut sched = Scheduler::new(10);
    let a = table.create("st-a", Priority::User, None);
    let b = table.create("st-b", Priority::User, None);
    sched.enqueue(&mut table, a);
    sched.enqueue(&mut table, b);
    let first = sched.dispatch(&mut table).map(|p| p.to);
    let second = sched.yield_now(&mut table).map(|p| p.to);
    first == Some(a) && second == Some(b)
}

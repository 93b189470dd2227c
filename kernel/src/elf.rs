//! ELF32 executable loading
//!
//! Parses the identification and program headers of a 32-bit little-endian
//! i386 executable and installs its `PT_LOAD` segments into an address
//! space: the whole memory span of a segment is zeroed, then the file
//! bytes are copied over the front. The final user stack image (argc and
//! the argv/envp pointer arrays) is built here too.
//!
//! All memory access goes through mapped frames, so every stage short of
//! the actual jump runs on the host in tests.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::fs::vfs::OpenFile;
use crate::fs::SeekOrigin;
use crate::mm::paging::{self, FrameAccess, PageDirectory};

pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const CLASS_32: u8 = 1;
const DATA_LSB: u8 = 1;
const VERSION_CURRENT: u8 = 1;
const TYPE_EXECUTABLE: u16 = 2;
const MACHINE_I386: u16 = 3;

pub const PT_LOAD: u32 = 1;

pub const HEADER_SIZE: usize = 52;
pub const PHDR_SIZE: usize = 32;

/// ELF file header
#[derive(Debug, Clone, PartialEq)]
pub struct Elf32Header {
    pub ident: [u8; 16],
    pub elf_type: u16,
    pub machine: u16,
    pub version: u32,
    pub entry: u32,
    pub phoff: u32,
    pub shoff: u32,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

/// One program header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elf32ProgramHeader {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: u32,
    pub p_paddr: u32,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: u32,
    pub p_align: u32,
}

/// The virtual span `[virt_lo, virt_hi)` covered by the LOAD segments,
/// plus the entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSpan {
    pub virt_lo: u32,
    pub virt_hi: u32,
    pub entry: u32,
}

fn u16_at(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(b[off..off + 2].try_into().expect("u16 slice"))
}

fn u32_at(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(b[off..off + 4].try_into().expect("u32 slice"))
}

/// Parse and verify the 52-byte file header: magic, 32-bit class,
/// little-endian, version 1, executable type, i386 machine.
pub fn parse_header(bytes: &[u8]) -> KernelResult<Elf32Header> {
    if bytes.len() < HEADER_SIZE {
        return Err(KernelError::NotSupported);
    }
    let mut ident = [0u8; 16];
    ident.copy_from_slice(&bytes[..16]);
    if ident[0..4] != ELF_MAGIC {
        return Err(KernelError::NotSupported);
    }
    if ident[4] != CLASS_32 || ident[5] != DATA_LSB || ident[6] != VERSION_CURRENT {
        return Err(KernelError::NotSupported);
    }
    let header = Elf32Header {
        ident,
        elf_type: u16_at(bytes, 16),
        machine: u16_at(bytes, 18),
        version: u32_at(bytes, 20),
        entry: u32_at(bytes, 24),
        phoff: u32_at(bytes, 28),
        shoff: u32_at(bytes, 32),
        flags: u32_at(bytes, 36),
        ehsize: u16_at(bytes, 40),
        phentsize: u16_at(bytes, 42),
        phnum: u16_at(bytes, 44),
        shentsize: u16_at(bytes, 46),
        shnum: u16_at(bytes, 48),
        shstrndx: u16_at(bytes, 50),
    };
    if header.elf_type != TYPE_EXECUTABLE || header.machine != MACHINE_I386 {
        return Err(KernelError::NotSupported);
    }
    if header.phnum == 0 || (header.phentsize as usize) < PHDR_SIZE {
        return Err(KernelError::NotSupported);
    }
    Ok(header)
}

fn parse_program_header(bytes: &[u8]) -> Elf32ProgramHeader {
    Elf32ProgramHeader {
        p_type: u32_at(bytes, 0),
        p_offset: u32_at(bytes, 4),
        p_vaddr: u32_at(bytes, 8),
        p_paddr: u32_at(bytes, 12),
        p_filesz: u32_at(bytes, 16),
        p_memsz: u32_at(bytes, 20),
        p_flags: u32_at(bytes, 24),
        p_align: u32_at(bytes, 28),
    }
}

/// Read and verify the header of an opened executable.
pub fn read_header(file: &mut OpenFile) -> KernelResult<Elf32Header> {
    file.seek(0, SeekOrigin::Start)?;
    let mut bytes = [0u8; HEADER_SIZE];
    if file.read(&mut bytes)? != HEADER_SIZE {
        return Err(KernelError::NotSupported);
    }
    parse_header(&bytes)
}

/// Read the program header table (`phnum` entries of `phentsize` bytes).
pub fn read_program_headers(
    file: &mut OpenFile,
    header: &Elf32Header,
) -> KernelResult<Vec<Elf32ProgramHeader>> {
    let mut headers = Vec::with_capacity(header.phnum as usize);
    let mut entry = vec![0u8; header.phentsize as usize];
    for index in 0..header.phnum as usize {
        file.seek(
            header.phoff as i64 + (index * header.phentsize as usize) as i64,
            SeekOrigin::Start,
        )?;
        if file.read(&mut entry)? != entry.len() {
            return Err(KernelError::NotSupported);
        }
        headers.push(parse_program_header(&entry));
    }
    Ok(headers)
}

/// Compute `[virt_lo, virt_hi)` over the LOAD segments.
pub fn load_span(header: &Elf32Header, phdrs: &[Elf32ProgramHeader]) -> KernelResult<LoadSpan> {
    let mut lo = u32::MAX;
    let mut hi = 0u32;
    for ph in phdrs.iter().filter(|ph| ph.p_type == PT_LOAD) {
        if ph.p_filesz > ph.p_memsz {
            return Err(KernelError::NotSupported);
        }
        lo = lo.min(ph.p_vaddr);
        hi = hi.max(ph.p_vaddr.saturating_add(ph.p_memsz));
    }
    if lo >= hi {
        return Err(KernelError::NotSupported);
    }
    Ok(LoadSpan {
        virt_lo: lo,
        virt_hi: hi,
        entry: header.entry,
    })
}

/// Install every LOAD segment: zero `[p_vaddr, p_vaddr + p_memsz)`, then
/// copy `p_filesz` bytes from `p_offset`. The covering pages must already
/// be mapped in `dir`.
pub fn load_segments<A: FrameAccess>(
    file: &mut OpenFile,
    phdrs: &[Elf32ProgramHeader],
    dir: &PageDirectory,
    access: &mut A,
) -> KernelResult<()> {
    let mut chunk = [0u8; 1024];
    for ph in phdrs.iter().filter(|ph| ph.p_type == PT_LOAD) {
        log::debug!(
            "elf: segment vaddr {:#x} filesz {:#x} memsz {:#x}",
            ph.p_vaddr,
            ph.p_filesz,
            ph.p_memsz
        );
        paging::zero_bytes(dir, ph.p_vaddr, ph.p_memsz as usize, access)?;

        file.seek(ph.p_offset as i64, SeekOrigin::Start)?;
        let mut copied = 0usize;
        while copied < ph.p_filesz as usize {
            let want = chunk.len().min(ph.p_filesz as usize - copied);
            let got = file.read(&mut chunk[..want])?;
            if got == 0 {
                return Err(KernelError::Fs(crate::error::FsError::ReadingFile));
            }
            paging::write_bytes(dir, ph.p_vaddr + copied as u32, &chunk[..got], access)?;
            copied += got;
        }
    }
    Ok(())
}

/// Lay out the initial user stack below `stack_top`:
///
/// ```text
///   stack_top ->  ...string bytes (argv then envp)...
///                 envp pointer array, NULL-terminated
///                 argv pointer array, NULL-terminated
///                 pointer to envp array
///                 pointer to argv array
///                 argc
///       esp  ->   0  (fake return address)
/// ```
///
/// Returns the resulting stack pointer.
pub fn build_user_stack<A: FrameAccess>(
    dir: &PageDirectory,
    stack_top: u32,
    argv: &[String],
    envp: &[String],
    access: &mut A,
) -> KernelResult<u32> {
    let mut cursor = stack_top;

    let push_strings = |cursor: &mut u32, strings: &[String], access: &mut A| -> KernelResult<Vec<u32>> {
        let mut pointers = Vec::with_capacity(strings.len());
        for s in strings {
            *cursor -= s.len() as u32 + 1;
            paging::write_bytes(dir, *cursor, s.as_bytes(), access)?;
            paging::write_bytes(dir, *cursor + s.len() as u32, &[0], access)?;
            pointers.push(*cursor);
        }
        Ok(pointers)
    };

    let argv_ptrs = push_strings(&mut cursor, argv, access)?;
    let envp_ptrs = push_strings(&mut cursor, envp, access)?;

    cursor &= !3; // word-align below the string bytes

    let push_word = |cursor: &mut u32, word: u32, access: &mut A| -> KernelResult<()> {
        *cursor -= 4;
        paging::write_bytes(dir, *cursor, &word.to_le_bytes(), access)
    };

    // Pointer arrays, highest first so the arrays read forward in memory.
    push_word(&mut cursor, 0, access)?;
    for &ptr in envp_ptrs.iter().rev() {
        push_word(&mut cursor, ptr, access)?;
    }
    let envp_array = cursor;
    push_word(&mut cursor, 0, access)?;
    for &ptr in argv_ptrs.iter().rev() {
        push_word(&mut cursor, ptr, access)?;
    }
    let argv_array = cursor;

    push_word(&mut cursor, envp_array, access)?;
    push_word(&mut cursor, argv_array, access)?;
    push_word(&mut cursor, argv.len() as u32, access)?;
    // Fake return address: _start never returns this way.
    push_word(&mut cursor, 0, access)?;

    Ok(cursor)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::string::ToString;
    use alloc::sync::Arc;

    use super::*;
    use crate::drivers::storage::RamDisk;
    use crate::fs::partition::Partition;
    use crate::fs::{ferrofs, vfs::Vfs};
    use crate::mm::paging::{PteFlags, SyntheticFrames};
    use crate::mm::{VirtualAddress, PAGE_SIZE};

    /// Assemble a minimal ELF image with the given LOAD segments laid out
    /// at their stated offsets.
    fn build_elf(entry: u32, segments: &[(Elf32ProgramHeader, Vec<u8>)]) -> Vec<u8> {
        let total = segments
            .iter()
            .map(|(ph, _)| ph.p_offset as usize + ph.p_filesz as usize)
            .max()
            .unwrap_or(HEADER_SIZE)
            .max(HEADER_SIZE + segments.len() * PHDR_SIZE);
        let mut image = vec![0u8; total];

        image[0..4].copy_from_slice(&ELF_MAGIC);
        image[4] = CLASS_32;
        image[5] = DATA_LSB;
        image[6] = VERSION_CURRENT;
        image[16..18].copy_from_slice(&TYPE_EXECUTABLE.to_le_bytes());
        image[18..20].copy_from_slice(&MACHINE_I386.to_le_bytes());
        image[20..24].copy_from_slice(&1u32.to_le_bytes());
        image[24..28].copy_from_slice(&entry.to_le_bytes());
        image[28..32].copy_from_slice(&(HEADER_SIZE as u32).to_le_bytes()); // phoff
        image[42..44].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        image[44..46].copy_from_slice(&(segments.len() as u16).to_le_bytes());

        for (index, (ph, data)) in segments.iter().enumerate() {
            let off = HEADER_SIZE + index * PHDR_SIZE;
            let fields = [
                ph.p_type, ph.p_offset, ph.p_vaddr, ph.p_paddr, ph.p_filesz, ph.p_memsz,
                ph.p_flags, ph.p_align,
            ];
            for (i, field) in fields.iter().enumerate() {
                image[off + i * 4..off + i * 4 + 4].copy_from_slice(&field.to_le_bytes());
            }
            image[ph.p_offset as usize..ph.p_offset as usize + data.len()].copy_from_slice(data);
        }
        image
    }

    fn vfs_with_file(path: &str, content: &[u8]) -> Vfs {
        let disk = ferrofs::format(RamDisk::new("rd", 512, 4096), 32).unwrap();
        let shared: crate::drivers::SharedDevice = Arc::new(spin::Mutex::new(disk));
        let mut vfs = Vfs::new();
        vfs.drivers.register(Arc::new(ferrofs::FerroFsDriver));
        let part = Partition {
            name: "root".to_string(),
            dev_no: 1,
            part_no: 1,
            first_sector: 0,
            num_sectors: 4096,
            legacy_type: 0,
            bootable: false,
        };
        vfs.mount_partition(shared, &part, "/").unwrap();
        vfs.touch(path, None).unwrap();
        let mut file = vfs.open(path, None).unwrap();
        file.write(content).unwrap();
        file.close().unwrap();
        vfs
    }

    fn map_span(
        dir: &mut PageDirectory,
        frames: &mut SyntheticFrames,
        lo: u32,
        hi: u32,
    ) {
        let mut page = lo & !(PAGE_SIZE as u32 - 1);
        while page < hi {
            let backing = frames.allocate_table_frame().unwrap();
            dir.map(
                VirtualAddress::new(page),
                backing.as_addr(),
                PteFlags::WRITABLE | PteFlags::USER,
                frames,
            )
            .unwrap();
            page += PAGE_SIZE as u32;
        }
    }

    const SEG: Elf32ProgramHeader = Elf32ProgramHeader {
        p_type: PT_LOAD,
        p_offset: 0x1000,
        p_vaddr: 0x0804_8000,
        p_paddr: 0,
        p_filesz: 0x200,
        p_memsz: 0x400,
        p_flags: 5,
        p_align: 0x1000,
    };

    #[test]
    fn header_validation_rejects_foreign_binaries() {
        let image = build_elf(0x0804_8000, &[(SEG, vec![0u8; 0x200])]);
        assert!(parse_header(&image).is_ok());

        let mut bad = image.clone();
        bad[0] = 0x7E;
        assert_eq!(parse_header(&bad), Err(KernelError::NotSupported));

        let mut bad = image.clone();
        bad[4] = 2; // 64-bit
        assert_eq!(parse_header(&bad), Err(KernelError::NotSupported));

        let mut bad = image.clone();
        bad[5] = 2; // big-endian
        assert_eq!(parse_header(&bad), Err(KernelError::NotSupported));

        let mut bad = image.clone();
        bad[16] = 3; // shared object
        assert_eq!(parse_header(&bad), Err(KernelError::NotSupported));

        let mut bad = image;
        bad[18] = 0x3E; // x86_64 machine
        assert_eq!(parse_header(&bad), Err(KernelError::NotSupported));
    }

    #[test]
    fn span_covers_all_load_segments() {
        let a = Elf32ProgramHeader {
            p_vaddr: 0x0804_8000,
            p_memsz: 0x1000,
            ..SEG
        };
        let b = Elf32ProgramHeader {
            p_vaddr: 0x0805_0000,
            p_memsz: 0x234,
            ..SEG
        };
        let skip = Elf32ProgramHeader {
            p_type: 6, // PHDR, not loadable
            p_vaddr: 0,
            ..SEG
        };
        let header = parse_header(&build_elf(0x0804_8010, &[(SEG, vec![0; 0x200])])).unwrap();
        let span = load_span(&header, &[a, skip, b]).unwrap();
        assert_eq!(span.virt_lo, 0x0804_8000);
        assert_eq!(span.virt_hi, 0x0805_0234);
        assert_eq!(span.entry, 0x0804_8010);
    }

    #[test]
    fn loaded_segment_matches_file_front_and_zero_tail() {
        // One LOAD segment, filesz 0x200, memsz 0x400: the file bytes land
        // at the front, the rest reads back zero.
        let payload: Vec<u8> = (0..0x200u32).map(|i| (i * 7 % 251) as u8).collect();
        let image = build_elf(0x0804_8000, &[(SEG, payload.clone())]);
        let vfs = vfs_with_file("/prog", &image);

        let mut file = vfs.open("/prog", None).unwrap();
        let header = read_header(&mut file).unwrap();
        let phdrs = read_program_headers(&mut file, &header).unwrap();
        assert_eq!(phdrs.len(), 1);
        assert_eq!(phdrs[0], SEG);
        let span = load_span(&header, &phdrs).unwrap();
        assert_eq!(span.entry, 0x0804_8000);

        let mut frames = SyntheticFrames::new();
        let mut dir = PageDirectory::new(&mut frames).unwrap();
        map_span(&mut dir, &mut frames, span.virt_lo, span.virt_hi);
        // Dirty the backing memory so the zeroing is observable.
        paging::write_bytes(&dir, 0x0804_8000, &[0xAAu8; 0x400], &mut frames).unwrap();

        load_segments(&mut file, &phdrs, &dir, &mut frames).unwrap();

        let mut memory = vec![0u8; 0x400];
        paging::read_bytes(&dir, 0x0804_8000, &mut memory, &mut frames).unwrap();
        assert_eq!(&memory[..0x200], &payload[..]);
        assert!(memory[0x200..].iter().all(|&b| b == 0));
    }

    #[test]
    fn user_stack_image_has_argc_argv_envp() {
        let mut frames = SyntheticFrames::new();
        let mut dir = PageDirectory::new(&mut frames).unwrap();
        let stack_base = 0x0700_0000u32;
        map_span(&mut dir, &mut frames, stack_base, stack_base + 0x2000);
        let stack_top = stack_base + 0x2000;

        let argv = vec!["prog".to_string(), "-v".to_string()];
        let envp = vec!["TERM=ferrite".to_string()];
        let esp = build_user_stack(&dir, stack_top, &argv, &envp, &mut frames).unwrap();
        assert_eq!(esp % 4, 0);
        assert!(esp < stack_top);

        let word = |frames: &mut SyntheticFrames, addr: u32| -> u32 {
            let mut b = [0u8; 4];
            paging::read_bytes(&dir, addr, &mut b, frames).unwrap();
            u32::from_le_bytes(b)
        };
        let string_at = |frames: &mut SyntheticFrames, addr: u32, len: usize| -> Vec<u8> {
            let mut b = vec![0u8; len];
            paging::read_bytes(&dir, addr, &mut b, frames).unwrap();
            b
        };

        // esp: [ret] [argc] [argv*] [envp*]
        assert_eq!(word(&mut frames, esp), 0);
        assert_eq!(word(&mut frames, esp + 4), 2); // argc
        let argv_array = word(&mut frames, esp + 8);
        let envp_array = word(&mut frames, esp + 12);

        let arg0 = word(&mut frames, argv_array);
        assert_eq!(string_at(&mut frames, arg0, 5), b"prog\0");
        let arg1 = word(&mut frames, argv_array + 4);
        assert_eq!(string_at(&mut frames, arg1, 3), b"-v\0");
        assert_eq!(word(&mut frames, argv_array + 8), 0); // NULL terminator

        let env0 = word(&mut frames, envp_array);
        assert_eq!(string_at(&mut frames, env0, 13), b"TERM=ferrite\0");
        assert_eq!(word(&mut frames, envp_array + 4), 0);
    }
}

//! Program execution
//!
//! `execve` runs in two phases. The parent verifies the executable's
//! identification, creates a parked child carrying kernel-owned copies of
//! the path, argv and envp, and makes it runnable. The child starts life
//! in a trampoline that builds the whole user address space — directory
//! sharing the kernel range, stack below the load span, heap above it,
//! segments installed, argc/argv/envp pushed — and then jumps to the ELF
//! entry point. The trampoline never returns; each of its stages exits
//! the child with a distinct negative code on failure.

use alloc::string::String;
use alloc::vec::Vec;

use crate::elf;
use crate::error::{KernelError, KernelResult};
use crate::fs::vfs::Vfs;
use crate::fs::FileDescriptor;
use crate::mm::paging::{FrameAccess, PageDirectory, PteFlags};
use crate::mm::{VirtualAddress, PAGE_SIZE};
use crate::process::UserSpace;

/// User stack size
pub const STACK_SIZE: u32 = 256 * 1024;

/// Unmapped gap between the top of the stack and the lowest load address
const STACK_GUARD_GAP: u32 = PAGE_SIZE as u32;

/// Loader stage exit codes, reported through the child's exit status
pub const EXIT_OPEN_FAILED: i32 = -1;
pub const EXIT_BAD_IMAGE: i32 = -2;
pub const EXIT_LOAD_FAILED: i32 = -3;
pub const EXIT_CLOSE_FAILED: i32 = -4;
pub const EXIT_RETURNED: i32 = -5;

/// Everything the trampoline needs to start the program
pub struct LoadedProgram {
    pub dir: PageDirectory,
    pub entry: u32,
    pub esp: u32,
    pub user: UserSpace,
}

/// Parent-side check: the file exists and is a loadable executable. The
/// file is opened, verified and closed again.
pub fn verify_executable(
    vfs: &Vfs,
    path: &str,
    curr: Option<&FileDescriptor>,
) -> KernelResult<()> {
    let mut file = vfs.open(path, curr)?;
    let result = elf::read_header(&mut file).map(|_| ());
    file.close()?;
    result
}

/// Map `[lo, hi)` with one fresh frame per page.
fn map_fresh_range<A: FrameAccess>(
    dir: &mut PageDirectory,
    lo: u32,
    hi: u32,
    access: &mut A,
) -> KernelResult<()> {
    let mut page = lo & !(PAGE_SIZE as u32 - 1);
    while page < hi {
        let frame = access.allocate_table_frame()?;
        dir.map(
            VirtualAddress::new(page),
            frame.as_addr(),
            PteFlags::WRITABLE | PteFlags::USER,
            access,
        )?;
        page += PAGE_SIZE as u32;
    }
    Ok(())
}

/// Child-side stages a–g of exec: build the address space and the initial
/// stack for `path`. Pure with respect to the machine — the caller
/// activates the directory and jumps.
pub fn load_program<A: FrameAccess>(
    vfs: &Vfs,
    path: &str,
    curr: Option<&FileDescriptor>,
    argv: Vec<String>,
    envp: Vec<String>,
    kernel_template: Option<(&PageDirectory, usize)>,
    access: &mut A,
) -> KernelResult<LoadedProgram> {
    let mut file = vfs.open(path, curr)?;

    let header = elf::read_header(&mut file)?;
    let phdrs = elf::read_program_headers(&mut file, &header)?;
    let span = elf::load_span(&header, &phdrs)?;

    // Stack below the image (with a guard gap), heap right above it.
    let stack_base = span
        .virt_lo
        .checked_sub(STACK_SIZE + STACK_GUARD_GAP)
        .ok_or(KernelError::BadValue)?
        & !(PAGE_SIZE as u32 - 1);
    let heap_base = VirtualAddress::new(span.virt_hi).page_aligned_up().as_u32();
    let heap_size = 0u32; // grows by page fault

    let mut dir = match kernel_template {
        Some((kernel, pdes)) => PageDirectory::new_shared(access, kernel, pdes)?,
        None => PageDirectory::new(access)?,
    };
    map_fresh_range(&mut dir, stack_base, stack_base + STACK_SIZE, access)?;
    map_fresh_range(&mut dir, span.virt_lo, span.virt_hi, access)?;

    elf::load_segments(&mut file, &phdrs, &dir, access)?;
    file.close()?;

    let esp = elf::build_user_stack(&dir, stack_base + STACK_SIZE, &argv, &envp, access)?;

    log::debug!(
        "exec: \"{}\" at [{:#x}, {:#x}), entry {:#x}, stack [{:#x}, {:#x}), esp {:#x}",
        path,
        span.virt_lo,
        span.virt_hi,
        span.entry,
        stack_base,
        stack_base + STACK_SIZE,
        esp
    );

    Ok(LoadedProgram {
        dir,
        entry: span.entry,
        esp,
        user: UserSpace {
            heap_base,
            heap_size,
            stack_base,
            stack_size: STACK_SIZE,
            executable: String::from(path),
            argv,
            envp,
        },
    })
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod machine {
    //! Bare-metal wiring: child creation, the trampoline, the jump.

    use alloc::string::ToString;

    use super::*;
    use crate::arch::x86::context;
    use crate::fs::vfs::VFS;
    use crate::mm::paging::IdentityFrames;
    use crate::mm::{self, frame_allocator, PhysicalAddress};
    use crate::process::{Pid, Priority};
    use crate::sched::kernel_state::{KernelStateParts, KERNEL};
    use crate::sync::InterruptGuard;

    /// Kernel stack per process
    const KERNEL_STACK_SIZE: usize = 16 * 1024;

    /// Create a child process that will load and run `path`, inheriting
    /// the parent's priority, working directory and tty. Returns the new
    /// pid; the parent keeps running.
    pub fn execve(path: &str, argv: &[&str], envp: &[&str]) -> KernelResult<Pid> {
        {
            let vfs = VFS.lock();
            let kernel = KERNEL.lock();
            let curr = kernel
                .scheduler
                .current()
                .and_then(|pid| kernel.table.get(pid))
                .and_then(|p| p.cwd.as_ref().cloned());
            verify_executable(&vfs, path, curr.as_ref())?;
        }

        let stack_frames = frame_allocator::allocate_contiguous(
            KERNEL_STACK_SIZE,
            PhysicalAddress::new(0),
        )?;
        let stack_top = stack_frames.as_addr().as_u32() + KERNEL_STACK_SIZE as u32;

        let _guard = InterruptGuard::acquire();
        let mut kernel = KERNEL.lock();
        let parent = kernel.scheduler.current();
        let priority = parent
            .and_then(|pid| kernel.table.get(pid))
            .map_or(Priority::User, |p| p.priority);
        let pid = kernel.table.create(path, priority, parent);

        let proc = kernel.table.get_mut(pid).expect("fresh pid vanished");
        proc.kernel_stack_top = Some(stack_top);
        proc.context.esp = context::prepare_initial_stack(stack_top, exec_trampoline);
        proc.user = Some(UserSpace {
            heap_base: 0,
            heap_size: 0,
            stack_base: 0,
            stack_size: 0,
            executable: path.to_string(),
            argv: argv.iter().map(|s| s.to_string()).collect(),
            envp: envp.iter().map(|s| s.to_string()).collect(),
        });
        let KernelStateParts { scheduler, table } = kernel.parts();
        scheduler.enqueue(table, pid);
        log::info!("execve: \"{}\" -> pid {}", path, pid);
        Ok(pid)
    }

    /// First code a freshly exec'd process runs, on its own kernel stack.
    extern "C" fn exec_trampoline() -> ! {
        let (path, argv, envp, curr) = {
            let kernel = KERNEL.lock();
            let pid = kernel.scheduler.current().expect("trampoline without current");
            let proc = kernel.table.get(pid).expect("current process vanished");
            let user = proc.user.as_ref().expect("exec child without user info");
            (
                user.executable.clone(),
                user.argv.clone(),
                user.envp.clone(),
                proc.cwd.clone(),
            )
        };

        let loaded = {
            let vfs = VFS.lock();
            let mut frames = IdentityFrames;
            let (kernel_dir, kernel_pdes) = mm::kernel_directory();
            match load_program(
                &vfs,
                &path,
                curr.as_ref(),
                argv,
                envp,
                Some((&kernel_dir, kernel_pdes)),
                &mut frames,
            ) {
                Ok(loaded) => loaded,
                Err(KernelError::Fs(_)) => exit_current(EXIT_OPEN_FAILED),
                Err(KernelError::NotSupported) => exit_current(EXIT_BAD_IMAGE),
                Err(_) => exit_current(EXIT_LOAD_FAILED),
            }
        };

        {
            let _guard = InterruptGuard::acquire();
            let mut kernel = KERNEL.lock();
            let pid = kernel.scheduler.current().expect("trampoline without current");
            if let Some(proc) = kernel.table.get_mut(pid) {
                proc.page_directory = Some(loaded.dir);
                proc.user = Some(loaded.user);
            }
        }

        loaded.dir.activate();
        // SAFETY: entry and esp come out of the address space just built.
        unsafe { context::enter_program(loaded.entry, loaded.esp) }
    }

    /// Terminate the current process and never come back.
    pub fn exit_current(code: i32) -> ! {
        crate::sched::kernel_state::exit_current(code)
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use machine::{execve, exit_current};

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::string::ToString;
    use alloc::sync::Arc;
    use alloc::vec;

    use super::*;
    use crate::drivers::storage::RamDisk;
    use crate::elf::{Elf32ProgramHeader, ELF_MAGIC, HEADER_SIZE, PHDR_SIZE, PT_LOAD};
    use crate::fs::partition::Partition;
    use crate::fs::{ferrofs, vfs::Vfs};
    use crate::mm::paging::{self, SyntheticFrames};

    fn build_elf(entry: u32, seg: Elf32ProgramHeader, payload: &[u8]) -> alloc::vec::Vec<u8> {
        let mut image = vec![0u8; seg.p_offset as usize + payload.len()];
        image[0..4].copy_from_slice(&ELF_MAGIC);
        image[4] = 1;
        image[5] = 1;
        image[6] = 1;
        image[16..18].copy_from_slice(&2u16.to_le_bytes());
        image[18..20].copy_from_slice(&3u16.to_le_bytes());
        image[24..28].copy_from_slice(&entry.to_le_bytes());
        image[28..32].copy_from_slice(&(HEADER_SIZE as u32).to_le_bytes());
        image[42..44].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        image[44..46].copy_from_slice(&1u16.to_le_bytes());
        let fields = [
            seg.p_type, seg.p_offset, seg.p_vaddr, seg.p_paddr, seg.p_filesz, seg.p_memsz,
            seg.p_flags, seg.p_align,
        ];
        for (i, field) in fields.iter().enumerate() {
            image[HEADER_SIZE + i * 4..HEADER_SIZE + i * 4 + 4]
                .copy_from_slice(&field.to_le_bytes());
        }
        image[seg.p_offset as usize..seg.p_offset as usize + payload.len()]
            .copy_from_slice(payload);
        image
    }

    fn vfs_with(path: &str, content: &[u8]) -> Vfs {
        let disk = ferrofs::format(RamDisk::new("rd", 512, 8192), 32).unwrap();
        let shared: crate::drivers::SharedDevice = Arc::new(spin::Mutex::new(disk));
        let mut vfs = Vfs::new();
        vfs.drivers.register(Arc::new(ferrofs::FerroFsDriver));
        let part = Partition {
            name: "root".to_string(),
            dev_no: 1,
            part_no: 1,
            first_sector: 0,
            num_sectors: 8192,
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
    fn verify_accepts_valid_and_rejects_garbage() {
        let image = build_elf(0x0804_8000, SEG, &[0xC3; 0x200]);
        let vfs = vfs_with("/bin-ok", &image);
        assert!(verify_executable(&vfs, "/bin-ok", None).is_ok());

        let vfs = vfs_with("/bin-bad", b"#!/bin/sh\necho nope\n");
        assert_eq!(
            verify_executable(&vfs, "/bin-bad", None),
            Err(KernelError::NotSupported)
        );
        assert!(matches!(
            verify_executable(&vfs, "/absent", None),
            Err(KernelError::Fs(_))
        ));
    }

    #[test]
    fn load_program_builds_the_full_address_space() {
        let payload: alloc::vec::Vec<u8> = (0..0x200u32).map(|i| (i % 199) as u8).collect();
        let vfs = vfs_with("/prog", &build_elf(0x0804_8010, SEG, &payload));

        let mut frames = SyntheticFrames::new();
        let loaded = load_program(
            &vfs,
            "/prog",
            None,
            vec!["prog".to_string()],
            vec![],
            None,
            &mut frames,
        )
        .unwrap();

        assert_eq!(loaded.entry, 0x0804_8010);

        // Segment image: file front, zero tail.
        let mut memory = vec![0u8; 0x400];
        paging::read_bytes(&loaded.dir, 0x0804_8000, &mut memory, &mut frames).unwrap();
        assert_eq!(&memory[..0x200], &payload[..]);
        assert!(memory[0x200..].iter().all(|&b| b == 0));

        // Stack sits below the image with a guard gap; heap above.
        let user = &loaded.user;
        assert_eq!(user.stack_base + user.stack_size + PAGE_SIZE as u32, 0x0804_8000);
        assert_eq!(user.heap_base, 0x0804_8000 + 0x1000);
        assert_eq!(user.heap_size, 0);
        assert_eq!(user.executable, "/prog");

        // esp is inside the stack and argc sits above the return slot.
        assert!(loaded.esp >= user.stack_base && loaded.esp < user.stack_base + user.stack_size);
        let mut argc = [0u8; 4];
        paging::read_bytes(&loaded.dir, loaded.esp + 4, &mut argc, &mut frames).unwrap();
        assert_eq!(u32::from_le_bytes(argc), 1);

        // The guard gap page is not mapped.
        assert!(loaded
            .dir
            .resolve(
                crate::mm::VirtualAddress::new(0x0804_8000 - 0x800),
                &mut frames
            )
            .is_none());
    }

    #[test]
    fn load_program_shares_the_kernel_template() {
        let vfs = vfs_with("/prog", &build_elf(0x0804_8000, SEG, &[0x90; 0x200]));
        let mut frames = SyntheticFrames::new();

        let mut kernel_dir = PageDirectory::new(&mut frames).unwrap();
        kernel_dir
            .identity_map_range(
                crate::mm::PhysicalAddress::new(0),
                crate::mm::PhysicalAddress::new(0x40_0000),
                PteFlags::WRITABLE,
                &mut frames,
            )
            .unwrap();

        let loaded = load_program(
            &vfs,
            "/prog",
            None,
            vec![],
            vec![],
            Some((&kernel_dir, 1)),
            &mut frames,
        )
        .unwrap();

        // Kernel range resolves identically through the program directory.
        assert_eq!(
            loaded
                .dir
                .resolve(crate::mm::VirtualAddress::new(0x0010_0000), &mut frames),
            Some(crate::mm::PhysicalAddress::new(0x0010_0000))
        );
    }
}

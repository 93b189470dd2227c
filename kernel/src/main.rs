//! Kernel binary entry
//!
//! The multiboot stub hands over with EAX holding the magic and EBX
//! pointing at the information structure. Bring-up order follows the data
//! flow of the design: log sink, memory map, frames, paging, heap,
//! processes, storage probes, partition discovery, mounts, and finally
//! either the smoke suite or the idle loop.
//!
//! Interrupt plumbing (IDT/PIC/PIT programming) is external to this
//! repository; its handlers are expected to call
//! `sched::kernel_state::tick` on the timer tick and
//! `mm::page_fault::handle` on vector 14.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod kernel_entry {
    use core::arch::global_asm;

    use ferrite_kernel::boot::{self, MultibootInfo, MULTIBOOT_BOOTLOADER_MAGIC};
    use ferrite_kernel::drivers::{ata, storage::DEVICE_REGISTRY};
    use ferrite_kernel::fs::{ferrofs, partition, vfs};
    use ferrite_kernel::process::{Priority, INIT_PID};
    use ferrite_kernel::sched::kernel_state::{KernelStateParts, KERNEL};
    use ferrite_kernel::{intrinsics, logger, mm, selftest, serial};

    extern "C" {
        static __kernel_start: u8;
        static __kernel_end: u8;
    }

    // Multiboot header (page-aligned modules + memory info) and the entry
    // stub: load a boot stack, push EBX/EAX, call into Rust.
    global_asm!(
        r#"
.section .multiboot, "a"
.align 4
.long 0x1BADB002
.long 0x00000003
.long -(0x1BADB002 + 0x00000003)

.section .text
.global _start
_start:
    mov esp, offset BOOT_STACK_TOP
    push ebx
    push eax
    call kernel_main
1:  hlt
    jmp 1b

.section .bss
.align 16
BOOT_STACK:
    .skip 16384
BOOT_STACK_TOP:
"#
    );

    #[no_mangle]
    extern "C" fn kernel_main(magic: u32, info: *const MultibootInfo) -> ! {
        serial::init();
        logger::init();
        log::info!("ferrite: booting");

        assert_eq!(magic, MULTIBOOT_BOOTLOADER_MAGIC, "not loaded by a multiboot loader");
        // SAFETY: the loader's info structure is identity mapped at entry.
        let info = unsafe { &*info };
        // SAFETY: as above, including the embedded map/cmdline pointers.
        let (regions, options) = unsafe { boot::gather(info) };

        // SAFETY: linker-provided image bounds.
        let (kernel_start, kernel_end) = unsafe {
            (
                core::ptr::addr_of!(__kernel_start) as u32,
                core::ptr::addr_of!(__kernel_end) as u32,
            )
        };
        mm::init(&regions, kernel_start, kernel_end).expect("memory bring-up failed");

        // The boot flow of control becomes init (pid 1); the idle stub
        // gets its own small stack and runs only when nothing else can.
        {
            let mut kernel = KERNEL.lock();
            let init = kernel.table.create("init", Priority::Kernel, None);
            assert_eq!(init, INIT_PID);
            let idle = kernel.table.create("idle", Priority::Idle, None);

            let idle_stack = mm::frame_allocator::allocate_contiguous(
                16 * 1024,
                mm::PhysicalAddress::new(0),
            )
            .expect("no frames for the idle stack");
            let idle_top = idle_stack.as_addr().as_u32() + 16 * 1024;
            if let Some(proc) = kernel.table.get_mut(idle) {
                proc.kernel_stack_top = Some(idle_top);
                proc.context.esp =
                    ferrite_kernel::arch::x86::context::prepare_initial_stack(idle_top, idle_entry);
            }

            let KernelStateParts { scheduler, table } = kernel.parts();
            scheduler.set_idle(idle);
            scheduler.adopt_current(table, init);
        }

        // Storage, partitions, filesystems.
        ata::probe_and_register();
        let dev_numbers = DEVICE_REGISTRY.lock().dev_numbers();
        for dev_no in dev_numbers {
            let device = DEVICE_REGISTRY.lock().get(dev_no).expect("registered device");
            if let Err(err) = partition::discover_device(dev_no, &device) {
                log::warn!("partition discovery failed on dev #{}: {}", dev_no, err);
            }
        }
        vfs::VFS.lock().drivers.register(alloc::sync::Arc::new(ferrofs::FerroFsDriver));
        match vfs::discover_and_mount(options.root_dev, options.root_part) {
            Ok(()) => {
                // Init starts life at the root of the mounted namespace.
                let root = vfs::VFS.lock().resolve("/", None, false).ok();
                if let Some(proc) = KERNEL.lock().table.get_mut(INIT_PID) {
                    proc.cwd = root;
                }
            }
            Err(err) => log::warn!("no root filesystem: {}", err),
        }

        if options.run_tests {
            let ok = selftest::run();
            log::info!("selftest finished, halting");
            loop {
                intrinsics::halt();
                let _ = ok;
            }
        }

        log::info!("ferrite: up");
        // From here the timer drives scheduling; init has nothing else to
        // do yet, so behave like a second idle loop.
        loop {
            intrinsics::halt();
        }
    }

    extern "C" fn idle_entry() -> ! {
        loop {
            intrinsics::halt();
        }
    }

    extern crate alloc;

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        log::error!("KERNEL PANIC: {}", info);
        loop {
            // SAFETY: nothing can run anymore; stop taking interrupts.
            unsafe { intrinsics::disable_interrupts() };
            intrinsics::halt();
        }
    }
}

// Host build of the binary target: nothing to run, the library's unit
// tests carry the logic.
#[cfg(not(target_os = "none"))]
fn main() {
    println!("ferrite-kernel targets 32-bit x86 bare metal; run `cargo test` on the host");
}

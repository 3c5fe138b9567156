//! Kernel image entry point: the freestanding binary `boot.asm`'s
//! `_start` hands off to after enabling paging (spec §6 "Boot").

#![no_std]
#![no_main]

extern crate alloc;

use protokernel::arch::x86::{cpu, gdt, idt, pic::PICS, pit};
use protokernel::boot::multiboot;
use protokernel::kernel::driver::console;
use protokernel::kernel::mm::vmm;
use protokernel::kernel::process::lifecycle;
use protokernel::kernel::scheduler;

/// A small boot-time demo process (spec §1 "Out of scope": the CLI
/// surface is "purely boot-time text", not part of the core) that
/// exercises the scheduler by yielding in a loop after announcing
/// itself.
extern "C" fn demo_kernel_process() {
    protokernel::kprintln!("demo: pid={:?} running", scheduler::current_pid());
    loop {
        protokernel::kprintln!("demo: heartbeat, free frames = {}",
            protokernel::kernel::mm::FRAME_ALLOCATOR.lock().stats().free);
        for _ in 0..5_000_000u32 {
            core::hint::spin_loop();
        }
    }
}

/// # Safety
/// Called exactly once, by `_start` in `boot.asm`, with paging already
/// enabled and `magic`/`multiboot_info_addr` exactly as GRUB left them
/// in EAX/EBX.
#[unsafe(no_mangle)]
pub extern "C" fn kernel_main(magic: u32, multiboot_info_addr: u32) -> ! {
    let boot_info = unsafe { multiboot::parse(magic, multiboot_info_addr) }
        .expect("boot: bad multiboot magic");

    // `kernel_end` is the linker-script symbol marking the end of the
    // linked image (`linker.ld`); its address, taken while already
    // running high-half, needs translating back to a physical extent.
    unsafe extern "C" {
        static kernel_end: u8;
    }
    const KERNEL_LMA: u32 = 0x0010_0000;
    let kernel_image_end_phys =
        unsafe { core::ptr::addr_of!(kernel_end) as u32 } - vmm::KERNEL_VIRT_BASE;

    let mut kernel_space = unsafe {
        vmm::bootstrap_kernel_address_space(&boot_info, KERNEL_LMA, kernel_image_end_phys)
    };

    unsafe {
        protokernel::init_heap(&mut kernel_space);
    }

    gdt::init();
    idt::init();
    unsafe {
        PICS.lock().initialize();
        PICS.lock().unmask_irq(0); // timer
        PICS.lock().unmask_irq(1); // keyboard
    }
    pit::init();

    unsafe {
        console::init();
    }
    protokernel::init_logging();

    protokernel::kprintln!("protokernel: boot ok, {} frames free",
        protokernel::kernel::mm::FRAME_ALLOCATOR.lock().stats().free);

    lifecycle::create_kernel_process("demo", demo_kernel_process)
        .expect("failed to create boot-time demo process");

    cpu::enable_interrupts();

    // Idle process body (spec §4.6 "Idle": pid 0, kernel privilege,
    // `hlt` loop). This call stack's own position is what the scheduler
    // captures into `IDLE_ESP` the first time it switches away from
    // idle (`scheduler::current_pid() == None` until then); there is no
    // separate idle stack to carve out.
    protokernel::hlt_loop();
}

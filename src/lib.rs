//! A single-address-space, uniprocessor 32-bit x86 teaching kernel
//! (spec §1 overview): Multiboot boot, two-level paging with
//! copy-on-write fork, a five-level MLFQ scheduler, and an `int 0x80`
//! syscall gateway.
//!
//! Compiled two ways: as a genuinely freestanding (`no_std`) kernel
//! image linked with [`crate::main`]'s `kernel_main` entry point, or,
//! under `cfg(test)`, as an ordinary hosted crate so the `#[cfg(test)]`
//! unit and scenario suites scattered through every module run on the
//! host under plain `libtest` rather than inside an emulator.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![cfg_attr(test, allow(missing_docs))]

extern crate alloc;

pub mod arch;
pub mod boot;
pub mod common;
pub mod interrupt;
pub mod kernel;

use kernel::mm::vmm::AddressSpace;

/// Global heap allocator backing `alloc::*` (spec §4.3); wired up for
/// real only once [`init_heap`] has mapped the arena.
#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: kernel::mm::heap::LockedHeap = kernel::mm::heap::LockedHeap::new();

/// Bring up the kernel heap over `kernel_space` (spec §4.3 "Create").
///
/// # Safety
/// Must run exactly once, during early boot, after
/// [`kernel::mm::vmm::bootstrap_kernel_address_space`] has produced
/// `kernel_space` and before any `alloc::*` type is touched.
#[cfg(not(test))]
pub unsafe fn init_heap(kernel_space: &mut AddressSpace) {
    unsafe {
        ALLOCATOR.init(kernel_space);
    }
}

/// Route the `log` facade through the VGA+serial console (SPEC_FULL
/// ambient-stack A.2). Installed once during boot; every `log::info!`
/// etc. call thereafter goes through [`kernel::driver::console`].
#[cfg(not(test))]
struct ConsoleLogger;

#[cfg(not(test))]
impl log::Log for ConsoleLogger {
    fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &log::Record<'_>) {
        crate::kprintln!("[{:<5}] {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

#[cfg(not(test))]
static LOGGER: ConsoleLogger = ConsoleLogger;

/// Install [`ConsoleLogger`] as the `log` backend.
///
/// # Safety
/// Must run after [`kernel::driver::console::init`] and only once.
#[cfg(not(test))]
pub fn init_logging() {
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(log::LevelFilter::Trace))
        .expect("logger already installed");
}

/// Halt forever, re-enabling interrupts so the idle process still
/// receives the timer tick and any device IRQs (spec §4.6 "Idle").
#[cfg(not(test))]
#[inline]
pub fn hlt_loop() -> ! {
    loop {
        arch::x86::cpu::halt();
    }
}

/// Disable interrupts, print a diagnostic, and spin forever — the only
/// form of kernel panic (spec §7).
#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    arch::x86::cpu::disable_interrupts();
    crate::kprintln!("\n*** kernel panic: {} ***", info);
    loop {
        arch::x86::cpu::halt();
    }
}

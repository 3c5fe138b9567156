//! Combined VGA + serial sink used by `write`'s fd=1 path and by the
//! kernel's own `log::Log` implementation (spec §4.7 `write`, SPEC_FULL
//! A.2).

use super::{serial, vga};
use core::fmt::Write as _;

/// Bring up both backing drivers.
///
/// # Safety
/// Must run once, during early boot, after the VMM has mapped the
/// kernel identity range covering 0xB8000.
pub unsafe fn init() {
    unsafe {
        serial::SERIAL.lock().init();
    }
}

/// Write `bytes` to both sinks, applying the same printable-ASCII /
/// newline / tab(=4 spaces) filtering `sys_write` promises (spec §4.7).
/// Tab expansion happens identically on both sinks: `vga.write_byte`
/// expands a raw tab internally, so the serial side expands it here to
/// keep the two sinks byte-for-byte in step.
pub fn write_user_bytes(bytes: &[u8]) {
    let mut vga = vga::VGA.lock();
    let mut ser = serial::SERIAL.lock();
    for &byte in bytes {
        if byte == b'\n' || byte == b'\t' || (0x20..0x7F).contains(&byte) {
            vga.write_byte(byte);
            if byte == b'\n' {
                ser.write_byte(b'\r');
            } else if byte == b'\t' {
                for _ in 0..4 {
                    ser.write_byte(b' ');
                }
                continue;
            }
            ser.write_byte(byte);
        }
    }
}

#[doc(hidden)]
pub fn _print(args: core::fmt::Arguments<'_>) {
    let _ = vga::VGA.lock().write_fmt(args);
    let _ = serial::SERIAL.lock().write_fmt(args);
}

/// Print to both the VGA console and the serial port.
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::kernel::driver::console::_print(format_args!($($arg)*))
    };
}

/// Print to both the VGA console and the serial port, with a newline.
#[macro_export]
macro_rules! kprintln {
    () => { $crate::kprint!("\n") };
    ($($arg:tt)*) => {
        $crate::kprint!("{}\n", format_args!($($arg)*))
    };
}

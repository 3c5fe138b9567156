//! 8253/8254 Programmable Interval Timer, channel 0, wired to IRQ0.
//!
//! Drives the scheduler's tick count and quantum expiry (§4.6). Runs at
//! a fixed 100 Hz, matching the quanta table expressed in ticks
//! (10/20/40/80/160 ms = 1/2/4/8/16 ticks).

use super::port::Port;
use core::sync::atomic::{AtomicU64, Ordering};

const PIT_FREQUENCY_HZ: u32 = 1_193_180;
pub const TIMER_HZ: u32 = 100;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Program channel 0 for rate-generator mode at [`TIMER_HZ`].
pub fn init() {
    let divisor = (PIT_FREQUENCY_HZ / TIMER_HZ) as u16;
    let mut command: Port<u8> = Port::new(0x43);
    let mut channel0: Port<u8> = Port::new(0x40);

    unsafe {
        command.write(0x36); // channel 0, lo/hi byte, mode 3 (square wave)
        channel0.write((divisor & 0xFF) as u8);
        channel0.write((divisor >> 8) as u8);
    }
}

/// Called from the timer IRQ handler on every tick.
pub fn on_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Ticks elapsed since [`init`]. Wraps only after ~5.8 billion years at
/// 100 Hz, so callers treat it as monotonic.
#[must_use]
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_advance_monotonically() {
        let before = ticks();
        on_tick();
        on_tick();
        assert_eq!(ticks(), before + 2);
    }
}

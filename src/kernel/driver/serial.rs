//! 16550 UART driver, COM1 at 0x3F8 (spec §6).
//!
//! Bring-up disables interrupts on the port, sets the baud-rate divisor
//! for 38400 8N1, enables the FIFO, and disables loopback — the
//! standard minimal sequence for a polled, interrupt-free serial sink.

use crate::arch::x86::port::Port;
use spin::Mutex;

const COM1_BASE: u16 = 0x3F8;

pub struct SerialPort {
    data: Port<u8>,
    interrupt_enable: Port<u8>,
    fifo_control: Port<u8>,
    line_control: Port<u8>,
    modem_control: Port<u8>,
    line_status: Port<u8>,
}

impl SerialPort {
    const fn new(base: u16) -> Self {
        Self {
            data: Port::new(base),
            interrupt_enable: Port::new(base + 1),
            fifo_control: Port::new(base + 2),
            line_control: Port::new(base + 3),
            modem_control: Port::new(base + 4),
            line_status: Port::new(base + 5),
        }
    }

    /// # Safety
    /// Must run once, during early boot.
    pub unsafe fn init(&mut self) {
        unsafe {
            self.interrupt_enable.write(0x00); // disable all interrupts
            self.line_control.write(0x80); // enable DLAB to set divisor
            self.data.write(0x03); // divisor low byte: 38400 baud
            self.interrupt_enable.write(0x00); // divisor high byte
            self.line_control.write(0x03); // 8 bits, no parity, 1 stop bit
            self.fifo_control.write(0xC7); // enable FIFO, clear, 14-byte threshold
            self.modem_control.write(0x0B); // RTS/DSR set, no loopback
        }
    }

    fn transmit_empty(&mut self) -> bool {
        unsafe { self.line_status.read() & 0x20 != 0 }
    }

    pub fn write_byte(&mut self, byte: u8) {
        while !self.transmit_empty() {
            core::hint::spin_loop();
        }
        unsafe {
            self.data.write(byte);
        }
    }

    pub fn write_str(&mut self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
    }
}

pub static SERIAL: Mutex<SerialPort> = Mutex::new(SerialPort::new(COM1_BASE));

impl core::fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        SerialPort::write_str(self, s);
        Ok(())
    }
}

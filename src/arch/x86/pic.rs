//! 8259 Programmable Interrupt Controller, chained master/slave.
//!
//! Remaps the master to vectors 0x20-0x27 and the slave to 0x28-0x2F so
//! neither range collides with the CPU exception vectors 0-31.

use super::port::Port;

const ICW1_INIT: u8 = 0x11;
const ICW4_8086: u8 = 0x01;
const PIC_EOI: u8 = 0x20;

pub const PIC1_OFFSET: u8 = 0x20;
pub const PIC2_OFFSET: u8 = 0x28;

struct Pic {
    offset: u8,
    command: Port<u8>,
    data: Port<u8>,
}

impl Pic {
    const fn new(offset: u8, command_port: u16, data_port: u16) -> Self {
        Self {
            offset,
            command: Port::new(command_port),
            data: Port::new(data_port),
        }
    }

    fn handles_interrupt(&self, vector: u8) -> bool {
        self.offset <= vector && vector < self.offset + 8
    }

    unsafe fn end_of_interrupt(&mut self) {
        unsafe {
            self.command.write(PIC_EOI);
        }
    }
}

/// A pair of cascaded 8259 PICs.
pub struct ChainedPics {
    pics: [Pic; 2],
}

impl ChainedPics {
    pub const fn new(offset1: u8, offset2: u8) -> Self {
        Self {
            pics: [
                Pic::new(offset1, 0x20, 0x21),
                Pic::new(offset2, 0xA0, 0xA1),
            ],
        }
    }

    /// Remap and unmask both PICs. Must run with interrupts disabled.
    ///
    /// # Safety
    /// Must only run once, during early boot, before interrupts are
    /// enabled.
    pub unsafe fn initialize(&mut self) {
        unsafe {
            let wait_port: Port<u8> = Port::new(0x80);
            let wait = || {
                wait_port.read();
            };

            let saved_mask1 = self.pics[0].data.read();
            let saved_mask2 = self.pics[1].data.read();

            self.pics[0].command.write(ICW1_INIT);
            wait();
            self.pics[1].command.write(ICW1_INIT);
            wait();

            self.pics[0].data.write(self.pics[0].offset);
            wait();
            self.pics[1].data.write(self.pics[1].offset);
            wait();

            self.pics[0].data.write(4); // slave attached to IRQ2
            wait();
            self.pics[1].data.write(2); // slave's cascade identity
            wait();

            self.pics[0].data.write(ICW4_8086);
            wait();
            self.pics[1].data.write(ICW4_8086);
            wait();

            self.pics[0].data.write(saved_mask1);
            self.pics[1].data.write(saved_mask2);
        }
    }

    fn handles_interrupt(&self, vector: u8) -> bool {
        self.pics.iter().any(|p| p.handles_interrupt(vector))
    }

    /// Signal end-of-interrupt for `vector`. Sends EOI to the slave first
    /// when the slave handled it, since the master must also be told.
    ///
    /// # Safety
    /// `vector` must be the vector of the interrupt currently being
    /// serviced.
    pub unsafe fn notify_end_of_interrupt(&mut self, vector: u8) {
        if self.handles_interrupt(vector) {
            unsafe {
                if self.pics[1].handles_interrupt(vector) {
                    self.pics[1].end_of_interrupt();
                }
                self.pics[0].end_of_interrupt();
            }
        }
    }

    /// Unmask a single IRQ line (0-15).
    ///
    /// # Safety
    /// Must be called after [`Self::initialize`].
    pub unsafe fn unmask_irq(&mut self, irq: u8) {
        unsafe {
            let pic_index = usize::from(irq >= 8);
            let line = irq % 8;
            let pic = &mut self.pics[pic_index];
            let mask = pic.data.read();
            pic.data.write(mask & !(1 << line));
        }
    }
}

pub static PICS: spin::Mutex<ChainedPics> =
    spin::Mutex::new(ChainedPics::new(PIC1_OFFSET, PIC2_OFFSET));

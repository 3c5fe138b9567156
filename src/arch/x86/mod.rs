//! 32-bit x86 architecture layer: everything that touches a register,
//! port, or descriptor table the rest of the kernel never sees directly.

pub mod context;
pub mod cpu;
pub mod gdt;
pub mod idt;
pub mod pic;
pub mod pit;
pub mod port;

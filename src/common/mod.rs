//! Shared kernel types and error handling.

pub mod result;
pub mod types;

pub use result::{KernelError, KernelResult};
pub use types::{Pid, Priority};

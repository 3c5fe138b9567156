//! Multiboot entry and the loader-provided info struct.

pub mod multiboot;

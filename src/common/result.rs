//! Kernel-wide error taxonomy (spec §7).

use core::fmt;

/// Kernel `Result` alias used throughout instead of panicking.
pub type KernelResult<T> = Result<T, KernelError>;

/// The one error taxonomy shared by every subsystem. Core allocators
/// signal failure by returning `None`/`Option` rather than this type;
/// `KernelError` is for operations that need to distinguish *why* they
/// failed (process lifecycle, syscalls, VMM operations).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// No free frame or heap byte for a demanded allocation.
    OutOfMemory,
    /// A user-supplied virtual address does not translate, or crosses a
    /// disallowed boundary.
    InvalidAddress,
    /// Syscall argument out of range, unsupported fd, oversize count.
    InvalidParameter,
    /// Caller or target pid does not exist.
    NoSuchProcess,
    /// Unknown syscall number, or a registered number whose handler is a
    /// stub.
    InvalidSyscall,
    /// Reserved for future capability checks.
    PermissionDenied,
    /// A provided buffer is smaller than the operation requires.
    BufferTooSmall,
    /// Reserved for future filesystem work.
    AlreadyExists,
    /// Reserved for future filesystem work.
    NotFound,
    /// Reserved for future filesystem work.
    Busy,
    /// Reserved for future filesystem work.
    Interrupted,
    /// Reserved for future filesystem work.
    ReadOnly,
    /// Reserved for future filesystem work.
    NoSpace,
}

impl KernelError {
    /// Short description, used by `Display` and by the fatal-fault
    /// diagnostic path.
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OutOfMemory => "out of memory",
            Self::InvalidAddress => "invalid address",
            Self::InvalidParameter => "invalid parameter",
            Self::NoSuchProcess => "no such process",
            Self::InvalidSyscall => "invalid syscall",
            Self::PermissionDenied => "permission denied",
            Self::BufferTooSmall => "buffer too small",
            Self::AlreadyExists => "already exists",
            Self::NotFound => "not found",
            Self::Busy => "busy",
            Self::Interrupted => "interrupted",
            Self::ReadOnly => "read-only",
            Self::NoSpace => "no space",
        }
    }

    /// Negative errno per the §4.7 mapping. `None` for the reserved,
    /// not-yet-wired-up variants — callers that can't encounter them in
    /// the current syscall set never need to.
    #[inline]
    #[must_use]
    pub const fn errno(self) -> Option<i32> {
        match self {
            Self::InvalidSyscall => Some(-1),
            Self::InvalidParameter => Some(-2),
            Self::PermissionDenied => Some(-3),
            Self::NoSuchProcess => Some(-4),
            Self::OutOfMemory => Some(-5),
            Self::InvalidAddress => Some(-6),
            Self::BufferTooSmall => Some(-7),
            _ => None,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Richer diagnostic context, used only on the fatal-fault panic path
/// (§7: "write a diagnostic to VGA+serial and halt").
pub trait ErrorContext {
    fn context(&self) -> &'static str;
}

impl ErrorContext for KernelError {
    fn context(&self) -> &'static str {
        match self {
            Self::OutOfMemory => "allocator exhausted: no frame or heap byte available",
            Self::InvalidAddress => "virtual address does not translate in the caller's address space",
            Self::InvalidParameter => "syscall argument out of the accepted range",
            Self::NoSuchProcess => "referenced pid has no live PCB",
            Self::InvalidSyscall => "syscall number has no handler",
            Self::PermissionDenied => "capability check failed",
            Self::BufferTooSmall => "supplied buffer smaller than required",
            Self::AlreadyExists => "reserved for future filesystem work",
            Self::NotFound => "reserved for future filesystem work",
            Self::Busy => "reserved for future filesystem work",
            Self::Interrupted => "reserved for future filesystem work",
            Self::ReadOnly => "reserved for future filesystem work",
            Self::NoSpace => "reserved for future filesystem work",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_matches_spec_table() {
        assert_eq!(KernelError::InvalidSyscall.errno(), Some(-1));
        assert_eq!(KernelError::InvalidParameter.errno(), Some(-2));
        assert_eq!(KernelError::PermissionDenied.errno(), Some(-3));
        assert_eq!(KernelError::NoSuchProcess.errno(), Some(-4));
        assert_eq!(KernelError::OutOfMemory.errno(), Some(-5));
        assert_eq!(KernelError::InvalidAddress.errno(), Some(-6));
        assert_eq!(KernelError::BufferTooSmall.errno(), Some(-7));
    }

    #[test]
    fn reserved_variants_have_no_errno_yet() {
        assert_eq!(KernelError::NotFound.errno(), None);
        assert_eq!(KernelError::Busy.errno(), None);
    }
}

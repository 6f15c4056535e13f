//! Kernel result codes and errors

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Module field of kernel-originated result codes.
const MODULE_KERNEL: u32 = 1;

/// A guest-visible numeric result code.
///
/// Encoded the way the guest OS packs them: the module in the low 9 bits,
/// the description above it. The syscall layer hands these back to the
/// guest verbatim, so the values are ABI and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResultCode(u32);

impl ResultCode {
    /// The success code (all zero).
    pub const SUCCESS: ResultCode = ResultCode(0);

    /// Builds a kernel-module result code from a description value
    pub const fn kernel(description: u32) -> Self {
        Self(MODULE_KERNEL | (description << 9))
    }

    /// Returns the raw encoded value
    pub fn raw(&self) -> u32 {
        self.0
    }

    /// True if this code signals success
    pub fn is_success(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// Errors produced by the scheduling core.
///
/// Every variant maps to a stable guest-visible [`ResultCode`]. These are
/// returned, never thrown; the single fatal condition in the core
/// (scheduler-state corruption) panics instead of appearing here, because
/// no caller-recoverable state exists for it.
///
/// `Timeout` and `Cancelled` are expected, frequent control-flow results,
/// not failures.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelError {
    /// A wait elapsed without any object signaling
    #[error("operation timed out")]
    Timeout,

    /// The wait was cancelled by another thread
    #[error("synchronization cancelled")]
    Cancelled,

    /// The calling thread has a pending termination request
    #[error("thread is terminating")]
    ThreadTerminating,

    /// A handle did not resolve to a live object
    #[error("invalid handle")]
    InvalidHandle,

    /// A wait/signal precondition did not hold (e.g. value mismatch)
    #[error("invalid state")]
    InvalidState,

    /// A guest memory access failed
    #[error("no access permission to guest memory")]
    NoAccessPerm,

    /// A guest address was misaligned
    #[error("invalid address alignment")]
    InvalidAddress,

    /// Too many wait handles were passed in one call
    #[error("handle count out of range")]
    CountOutOfRange,

    /// A core or affinity-mask argument was malformed
    #[error("invalid core mask value")]
    InvalidMaskValue,
}

impl KernelError {
    /// Returns the guest-visible result code for this error.
    pub fn result_code(&self) -> ResultCode {
        match self {
            KernelError::ThreadTerminating => ResultCode::kernel(59),
            KernelError::InvalidAddress => ResultCode::kernel(102),
            KernelError::NoAccessPerm => ResultCode::kernel(106),
            KernelError::InvalidHandle => ResultCode::kernel(114),
            KernelError::InvalidMaskValue => ResultCode::kernel(116),
            KernelError::Timeout => ResultCode::kernel(117),
            KernelError::Cancelled => ResultCode::kernel(118),
            KernelError::CountOutOfRange => ResultCode::kernel(119),
            KernelError::InvalidState => ResultCode::kernel(125),
        }
    }
}

/// Convenience alias used throughout the core.
pub type KernelResult<T> = Result<T, KernelError>;

//! # Kernel Types
//!
//! Shared vocabulary for the guest-kernel scheduling core.
//!
//! ## Purpose
//!
//! Identifier, result-code and time types used across the scheduling core
//! and its collaborators (syscall dispatch, CPU emulation, guest memory).
//! This crate carries no behavior beyond conversions and formatting, so
//! every other crate can depend on it without pulling in scheduler logic.

pub mod ids;
pub mod result;
pub mod time;

pub use ids::{CoreId, Handle, ObjectId, ThreadId, CORE_COUNT, HANDLE_HAS_LISTENERS};
pub use result::{KernelError, KernelResult, ResultCode};
pub use time::{Duration, Instant, Timeout};

/// Number of distinct thread priority levels understood by the scheduler.
///
/// Priorities run 0..=63; lower values are more urgent. Values of 64 and
/// above mark a thread as unschedulable (idle-thread territory).
pub const PRIORITY_COUNT: usize = 64;

/// First priority that is never picked by the scheduler.
pub const UNSCHEDULABLE_PRIORITY: u32 = PRIORITY_COUNT as u32;

/// Priorities 0 and 1 are reserved for fixed system dispatch threads and
/// are exempt from load-balancing migration.
pub const LOWEST_MIGRATABLE_PRIORITY: u32 = 2;

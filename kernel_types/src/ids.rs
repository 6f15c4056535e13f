//! Unique identifiers for kernel entities

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of virtual CPU cores exposed to the guest.
pub const CORE_COUNT: usize = 4;

/// Bit set in a guest mutex word while threads are queued on it.
///
/// The low bits of the word carry the owning thread's handle; this flag
/// tells the guest-side fast path that an unlock must go through the
/// kernel so a waiter can be handed the mutex.
pub const HANDLE_HAS_LISTENERS: u32 = 0x4000_0000;

/// Unique identifier for a guest thread.
///
/// Allocated monotonically by the kernel's thread arena. Stable for the
/// lifetime of the thread; never reused within a kernel instance. All
/// cross-references between scheduler structures are stored as `ThreadId`s
/// and resolved through the arena, never as owning pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId(u64);

impl ThreadId {
    /// Creates a thread ID from a raw value
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thread({})", self.0)
    }
}

/// Unique identifier for a waitable kernel object.
///
/// Waitable objects (thread exit objects, events built on top of the wait
/// coordinator) are owned by the kernel's object table. The syscall layer
/// translates guest handles to `ObjectId`s before calling in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Creates an object ID from a raw value
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Object({})", self.0)
    }
}

/// A guest-visible handle value.
///
/// Handles are minted and resolved by the handle-table collaborator; the
/// scheduling core only stores and compares them, and writes them into
/// guest mutex words during arbitration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle(u32);

impl Handle {
    /// Creates a handle from its raw guest representation
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw guest representation
    pub fn as_raw(&self) -> u32 {
        self.0
    }

    /// Strips the listeners flag, leaving the bare handle bits.
    pub fn without_listeners(&self) -> Handle {
        Handle(self.0 & !HANDLE_HAS_LISTENERS)
    }

    /// Returns the raw value with the listeners flag set.
    pub fn with_listeners(&self) -> u32 {
        self.0 | HANDLE_HAS_LISTENERS
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle(0x{:08X})", self.0)
    }
}

/// Identifier for a virtual CPU core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoreId(pub usize);

impl CoreId {
    /// Returns the affinity-mask bit for this core
    pub fn mask_bit(&self) -> u64 {
        1 << self.0
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Core({})", self.0)
    }
}

//! Guest memory access with exclusive-monitor semantics.
//!
//! Guest memory is software-managed by the memory collaborator; there is no
//! hardware atomic instruction the core can lean on. Atomic updates are
//! expressed as load-linked/store-conditional: take a monitor on an
//! address, read, then attempt a conditional store that succeeds only if
//! the monitor is still intact. Callers loop until the store lands.

use kernel_types::CoreId;
use thiserror::Error;

/// Errors raised by guest memory accesses.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum MemoryError {
    /// The address is not mapped in the guest address space
    #[error("guest address 0x{addr:08X} is not mapped")]
    Unmapped { addr: u64 },

    /// The address is not aligned for a word access
    #[error("guest address 0x{addr:08X} is not word-aligned")]
    Misaligned { addr: u64 },
}

impl From<MemoryError> for kernel_types::KernelError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::Unmapped { .. } => kernel_types::KernelError::NoAccessPerm,
            MemoryError::Misaligned { .. } => kernel_types::KernelError::InvalidAddress,
        }
    }
}

/// Word-granular access to guest memory.
///
/// Implemented by the memory-management collaborator. All addresses are
/// guest virtual addresses; word accesses are 32-bit. Validation of
/// mapping and permissions happens behind this trait.
pub trait GuestMemory: Send + Sync {
    /// Reads a 32-bit word.
    fn read_word(&self, addr: u64) -> Result<u32, MemoryError>;

    /// True if the address lies in mapped guest memory.
    fn is_mapped(&self, addr: u64) -> bool;

    /// Places core `core`'s exclusive monitor on `addr`.
    fn set_exclusive(&self, core: CoreId, addr: u64);

    /// True if core `core`'s monitor still covers `addr`.
    fn test_exclusive(&self, core: CoreId, addr: u64) -> bool;

    /// Drops core `core`'s monitor.
    fn clear_exclusive(&self, core: CoreId);

    /// Conditionally stores `value` at `addr` on behalf of `core`.
    ///
    /// The store succeeds only if the core's monitor still covers the
    /// address; success clears every monitor watching that address.
    /// Returns whether the store landed.
    fn write_word_conditional(&self, core: CoreId, addr: u64, value: u32) -> bool;
}

/// In-process guest memory for tests.
///
/// A word store over explicitly mapped regions, with one exclusive monitor
/// per virtual core. A successful conditional store invalidates every
/// monitor watching the written address, which is exactly the cross-core
/// contention the retry loops in the core have to survive.
pub struct SimGuestMemory {
    inner: parking_lot::Mutex<SimMemoryInner>,
}

struct SimMemoryInner {
    words: std::collections::HashMap<u64, u32>,
    regions: Vec<(u64, u64)>,
    monitors: [Option<u64>; kernel_types::CORE_COUNT],
}

impl SimGuestMemory {
    /// Creates an empty memory with no mapped regions
    pub fn new() -> Self {
        Self {
            inner: parking_lot::Mutex::new(SimMemoryInner {
                words: std::collections::HashMap::new(),
                regions: Vec::new(),
                monitors: [None; kernel_types::CORE_COUNT],
            }),
        }
    }

    /// Maps `len` bytes starting at `start`, zero-filled.
    pub fn map_region(&self, start: u64, len: u64) {
        self.inner.lock().regions.push((start, len));
    }

    /// Directly writes a word, bypassing monitors (test setup).
    ///
    /// Still invalidates monitors on the address, the way any real store
    /// from guest code would.
    pub fn write_word(&self, addr: u64, value: u32) {
        let mut inner = self.inner.lock();
        inner.words.insert(addr, value);
        inner.invalidate_monitors(addr);
    }

    /// Reads a word without error mapping (test assertions).
    pub fn word(&self, addr: u64) -> u32 {
        self.inner.lock().words.get(&addr).copied().unwrap_or(0)
    }
}

impl Default for SimGuestMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl SimMemoryInner {
    fn mapped(&self, addr: u64) -> bool {
        self.regions
            .iter()
            .any(|&(start, len)| addr >= start && addr < start + len)
    }

    fn invalidate_monitors(&mut self, addr: u64) {
        for monitor in self.monitors.iter_mut() {
            if *monitor == Some(addr) {
                *monitor = None;
            }
        }
    }
}

impl GuestMemory for SimGuestMemory {
    fn read_word(&self, addr: u64) -> Result<u32, MemoryError> {
        if addr % 4 != 0 {
            return Err(MemoryError::Misaligned { addr });
        }
        let inner = self.inner.lock();
        if !inner.mapped(addr) {
            return Err(MemoryError::Unmapped { addr });
        }
        Ok(inner.words.get(&addr).copied().unwrap_or(0))
    }

    fn is_mapped(&self, addr: u64) -> bool {
        self.inner.lock().mapped(addr)
    }

    fn set_exclusive(&self, core: CoreId, addr: u64) {
        self.inner.lock().monitors[core.0] = Some(addr & !3);
    }

    fn test_exclusive(&self, core: CoreId, addr: u64) -> bool {
        self.inner.lock().monitors[core.0] == Some(addr & !3)
    }

    fn clear_exclusive(&self, core: CoreId) {
        self.inner.lock().monitors[core.0] = None;
    }

    fn write_word_conditional(&self, core: CoreId, addr: u64, value: u32) -> bool {
        let addr = addr & !3;
        let mut inner = self.inner.lock();
        if inner.monitors[core.0] != Some(addr) || !inner.mapped(addr) {
            return false;
        }
        inner.words.insert(addr, value);
        inner.invalidate_monitors(addr);
        true
    }
}

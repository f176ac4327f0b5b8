//! The WAL-index, shared between connections to a database in WAL mode.
//!
//! The engine accesses the WAL-index as 32 KiB regions of its own memory,
//! guarded by eight lock slots. Two backings are provided:
//!
//! - [`mapped::MappedShm`] maps the `-shm` file over sandbox memory, so
//!   every process sees the same bytes. Unix only.
//! - [`shadow::ShadowShm`] keeps the index in host buffers shared within the
//!   process, and copies changes in and out of sandbox memory at lock
//!   boundaries.
//!
//! See [WAL-mode File Format](https://sqlite.org/walformat.html).

#[cfg(unix)]
pub mod mapped;
pub mod shadow;

use std::ffi::c_int;
use std::fmt;
use std::sync::atomic::{fence, Ordering};

use crate::bridge::Module;
use crate::error::Error;
use crate::ffi;
use crate::vfs::Result;

/// Size of a WAL-index region.
pub const SHM_REGION_SIZE: u32 = 32768;
/// Number of lock slots.
pub const SHM_NLOCK: usize = ffi::SQLITE_SHM_NLOCK as usize;
/// Offset in the `-shm` file of the first lock slot.
pub const SHM_BASE: u64 = 120;
/// Offset in the `-shm` file of the dead man's switch.
pub const SHM_DMS: u64 = SHM_BASE + SHM_NLOCK as u64;

/// The WAL-index backing of a database file.
///
/// Every method receiving a [`Module`] runs inside a host call from that
/// module, and may read or write its memory.
pub trait SharedMemory: Send {
    /// Returns the sandbox address of region `region`, creating it if
    /// `extend` is set. `Ok(0)` means the region does not exist yet.
    ///
    /// See [`xShmMap`](https://sqlite.org/c3ref/io_methods.html).
    fn map(&mut self, module: &mut dyn Module, region: u32, size: u32, extend: bool) -> Result<u32>;

    /// Acquires lock slots, failing with `SQLITE_BUSY` on contention.
    ///
    /// See [`xShmLock`](https://sqlite.org/c3ref/io_methods.html).
    fn lock(&mut self, module: &mut dyn Module, locks: WalLock, mode: WalLockMode) -> Result<()>;

    /// Releases lock slots.
    fn unlock(&mut self, module: &mut dyn Module, locks: WalLock, mode: WalLockMode) -> Result<()>;

    /// Orders memory accesses to the WAL-index.
    ///
    /// See [`xShmBarrier`](https://sqlite.org/c3ref/io_methods.html).
    fn barrier(&mut self, module: &mut dyn Module) {
        let _ = module;
        fence(Ordering::SeqCst);
    }

    /// Gives back all regions, deleting the backing store if `delete`.
    ///
    /// See [`xShmUnmap`](https://sqlite.org/c3ref/io_methods.html).
    fn unmap(&mut self, module: &mut dyn Module, delete: bool) -> Result<()>;

    /// Releases locks and shared state when the module is already gone.
    fn close(&mut self);
}

/// How a lock slot is held.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WalLockMode {
    Shared,
    Exclusive,
}

/// Whether a `xShmLock` call locks or unlocks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WalLockOp {
    Lock,
    Unlock,
}

impl WalLockMode {
    /// Decodes `xShmLock` flags; only the four documented combinations are
    /// valid.
    pub fn from_flags(flags: c_int) -> Result<(WalLockOp, WalLockMode)> {
        const LOCK_SHARED: c_int = ffi::SQLITE_SHM_LOCK | ffi::SQLITE_SHM_SHARED;
        const LOCK_EXCLUSIVE: c_int = ffi::SQLITE_SHM_LOCK | ffi::SQLITE_SHM_EXCLUSIVE;
        const UNLOCK_SHARED: c_int = ffi::SQLITE_SHM_UNLOCK | ffi::SQLITE_SHM_SHARED;
        const UNLOCK_EXCLUSIVE: c_int = ffi::SQLITE_SHM_UNLOCK | ffi::SQLITE_SHM_EXCLUSIVE;
        match flags {
            LOCK_SHARED => Ok((WalLockOp::Lock, WalLockMode::Shared)),
            LOCK_EXCLUSIVE => Ok((WalLockOp::Lock, WalLockMode::Exclusive)),
            UNLOCK_SHARED => Ok((WalLockOp::Unlock, WalLockMode::Shared)),
            UNLOCK_EXCLUSIVE => Ok((WalLockOp::Unlock, WalLockMode::Exclusive)),
            _ => Err(Error::misuse("invalid shm lock flags")),
        }
    }
}

/// A run of lock slots.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct WalLock {
    offset: u8,
    n: u8,
}

impl WalLock {
    pub const WRITE: WalLock = WalLock { offset: 0, n: 1 };
    pub const CHECKPOINT: WalLock = WalLock { offset: 1, n: 1 };
    pub const RECOVER: WalLock = WalLock { offset: 2, n: 1 };
    pub const ALL: WalLock = WalLock {
        offset: 0,
        n: SHM_NLOCK as u8,
    };

    /// Slots `offset..offset + n`, which must lie within the eight slots.
    pub fn new(offset: i32, n: i32) -> Result<Self> {
        let offset = u8::try_from(offset).map_err(|_| Error::misuse("invalid shm lock offset"))?;
        let n = u8::try_from(n).map_err(|_| Error::misuse("invalid shm lock count"))?;
        if n == 0 || usize::from(offset) + usize::from(n) > SHM_NLOCK {
            return Err(Error::misuse("shm lock out of range"));
        }
        Ok(WalLock { offset, n })
    }

    /// Read mark `i`, for `i` in `0..5`.
    pub fn read(i: u8) -> Result<Self> {
        Self::new(3 + i32::from(i), 1)
    }

    pub fn offset(&self) -> u8 {
        self.offset
    }

    pub fn len(&self) -> u8 {
        self.n
    }

    /// Slot indices covered.
    pub fn slots(&self) -> std::ops::Range<usize> {
        usize::from(self.offset)..usize::from(self.offset + self.n)
    }

    /// Slots covered, as a bit mask.
    pub fn mask(&self) -> u8 {
        (((1u16 << self.n) - 1) << self.offset) as u8
    }
}

impl fmt::Debug for WalLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WalLock({}..{})", self.offset, self.offset + self.n)
    }
}

/// Per-process lock slot state: `-1` for exclusive, otherwise the number of
/// shared holders.
pub type SlotCounts = [i16; SHM_NLOCK];

/// Which slots one file holds.
pub type SlotsHeld = [bool; SHM_NLOCK];

/// Acquires slots against the shared counts. All or nothing.
pub(crate) fn lock_slots(
    counts: &mut SlotCounts,
    held: &mut SlotsHeld,
    locks: WalLock,
    mode: WalLockMode,
) -> Result<()> {
    for i in locks.slots() {
        match mode {
            WalLockMode::Shared => {
                if !held[i] && counts[i] < 0 {
                    return Err(Error::new(ffi::SQLITE_BUSY));
                }
            }
            WalLockMode::Exclusive => {
                if held[i] {
                    return Err(Error::misuse("shm slot already held"));
                }
                if counts[i] != 0 {
                    return Err(Error::new(ffi::SQLITE_BUSY));
                }
            }
        }
    }
    for i in locks.slots() {
        if held[i] {
            continue;
        }
        counts[i] = match mode {
            WalLockMode::Shared => counts[i] + 1,
            WalLockMode::Exclusive => -1,
        };
        held[i] = true;
    }
    Ok(())
}

/// Releases slots this file holds. Slots not held are ignored.
pub(crate) fn unlock_slots(counts: &mut SlotCounts, held: &mut SlotsHeld, locks: WalLock) {
    for i in locks.slots() {
        if !held[i] {
            continue;
        }
        counts[i] = if counts[i] <= 0 { 0 } else { counts[i] - 1 };
        held[i] = false;
    }
}

//! The five-level database file locking protocol.
//!
//! [`FileLock`] enforces the legal transitions between [`LockLevel`]s and
//! delegates the actual locking to a [`LockBackend`]. The byte-range
//! backends ([`RangeBackend`]) place locks at the well-known offsets in the
//! database file through a [`RangeLock`], following either the POSIX or the
//! Windows protocol. Dot-file locking lives in [`super::os::dotlock`], the
//! in-memory database lock in [`super::memdb`].
//!
//! See [File Locking And Concurrency](https://www.sqlite.org/lockingv3.html).

use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::ffi;
use crate::vfs::{LockLevel, Result};

/// First byte past 1 GiB. Never read or written as page data.
pub const PENDING_BYTE: u64 = 0x4000_0000;
/// Held exclusively by the single writer.
pub const RESERVED_BYTE: u64 = PENDING_BYTE + 1;
/// Start of the range readers lock shared.
pub const SHARED_FIRST: u64 = PENDING_BYTE + 2;
/// Length of the range readers lock shared.
pub const SHARED_SIZE: u64 = 510;

/// Advisory locks on byte ranges of an open file.
///
/// `timeout` is `Some(Duration::ZERO)` to try once, `None` to block, or a
/// deadline to poll against. Contention returns `SQLITE_BUSY`.
pub trait RangeLock {
    /// Acquires a shared lock. Failures other than contention report
    /// `SQLITE_IOERR_RDLOCK`.
    fn read_lock(&self, start: u64, len: u64, timeout: Option<Duration>) -> Result<()>;

    /// Acquires an exclusive lock. Failures other than contention report
    /// `SQLITE_IOERR_LOCK`.
    fn write_lock(&self, start: u64, len: u64, timeout: Option<Duration>) -> Result<()>;

    /// Releases any lock held on the range. A `len` of 0 extends to the end
    /// of the file.
    fn unlock(&self, start: u64, len: u64) -> Result<()>;

    /// Reports whether another owner holds an exclusive lock overlapping
    /// the range.
    fn check_lock(&self, start: u64, len: u64) -> Result<bool>;
}

impl<R: RangeLock + ?Sized> RangeLock for Arc<R> {
    fn read_lock(&self, start: u64, len: u64, timeout: Option<Duration>) -> Result<()> {
        (**self).read_lock(start, len, timeout)
    }

    fn write_lock(&self, start: u64, len: u64, timeout: Option<Duration>) -> Result<()> {
        (**self).write_lock(start, len, timeout)
    }

    fn unlock(&self, start: u64, len: u64) -> Result<()> {
        (**self).unlock(start, len)
    }

    fn check_lock(&self, start: u64, len: u64) -> Result<bool> {
        (**self).check_lock(start, len)
    }
}

/// The primitive steps of the locking protocol.
///
/// [`FileLock`] calls these only for legal transitions; implementations need
/// not validate the current level.
pub trait LockBackend: Send {
    /// NONE to SHARED.
    fn shared(&mut self, timeout: Option<Duration>) -> Result<()>;

    /// SHARED to RESERVED.
    fn reserved(&mut self, timeout: Option<Duration>) -> Result<()>;

    /// Takes PENDING on the way to EXCLUSIVE. Never waits.
    fn pending(&mut self) -> Result<()>;

    /// PENDING to EXCLUSIVE.
    fn exclusive(&mut self, timeout: Option<Duration>) -> Result<()>;

    /// Drops a PENDING lock taken by a failed EXCLUSIVE attempt.
    fn release_pending(&mut self) -> Result<()>;

    /// Any level above SHARED down to SHARED.
    fn downgrade(&mut self, from: LockLevel) -> Result<()>;

    /// Any level down to NONE.
    fn release(&mut self, from: LockLevel) -> Result<()>;

    /// Whether another file holds RESERVED or greater.
    fn check_reserved(&self) -> Result<bool>;
}

/// Which platform's byte-range protocol to follow.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Protocol {
    /// Locks convert in place: an exclusive request on a range this file
    /// holds shared upgrades atomically.
    Posix,
    /// Locks stack and never convert: a shared range must be released
    /// before it can be locked exclusively.
    Windows,
}

impl Protocol {
    /// The protocol of the host platform.
    pub const NATIVE: Protocol = if cfg!(windows) {
        Protocol::Windows
    } else {
        Protocol::Posix
    };
}

/// Implements the locking protocol with byte-range locks.
pub struct RangeBackend<R> {
    locks: R,
    protocol: Protocol,
}

impl<R: RangeLock> RangeBackend<R> {
    pub fn new(locks: R, protocol: Protocol) -> Self {
        RangeBackend { locks, protocol }
    }
}

impl<R: RangeLock + Send> LockBackend for RangeBackend<R> {
    fn shared(&mut self, timeout: Option<Duration>) -> Result<()> {
        // A writer holding PENDING keeps new readers out.
        self.locks.read_lock(PENDING_BYTE, 1, timeout)?;
        let rc = self.locks.read_lock(SHARED_FIRST, SHARED_SIZE, timeout);
        self.locks.unlock(PENDING_BYTE, 1)?;
        rc
    }

    fn reserved(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.locks.write_lock(RESERVED_BYTE, 1, timeout)
    }

    fn pending(&mut self) -> Result<()> {
        self.locks.write_lock(PENDING_BYTE, 1, Some(Duration::ZERO))
    }

    fn exclusive(&mut self, timeout: Option<Duration>) -> Result<()> {
        // Readers finishing up release quickly; always wait a little.
        let timeout = timeout.map(|t| t.max(Duration::from_millis(1)));
        match self.protocol {
            Protocol::Posix => self.locks.write_lock(SHARED_FIRST, SHARED_SIZE, timeout),
            Protocol::Windows => {
                self.locks.unlock(SHARED_FIRST, SHARED_SIZE)?;
                let rc = self.locks.write_lock(SHARED_FIRST, SHARED_SIZE, timeout);
                if rc.is_err() {
                    self.locks
                        .read_lock(SHARED_FIRST, SHARED_SIZE, Some(Duration::ZERO))
                        .map_err(|err| err.recode(ffi::SQLITE_IOERR_RDLOCK))?;
                }
                rc
            }
        }
    }

    fn release_pending(&mut self) -> Result<()> {
        self.locks.unlock(PENDING_BYTE, 1)
    }

    fn downgrade(&mut self, from: LockLevel) -> Result<()> {
        match self.protocol {
            Protocol::Posix => {
                if from >= LockLevel::Exclusive {
                    self.locks
                        .read_lock(SHARED_FIRST, SHARED_SIZE, Some(Duration::ZERO))
                        .map_err(|err| err.recode(ffi::SQLITE_IOERR_RDLOCK))?;
                }
                // PENDING and RESERVED are adjacent.
                self.locks.unlock(PENDING_BYTE, 2)
            }
            Protocol::Windows => {
                if from >= LockLevel::Exclusive {
                    self.locks.unlock(SHARED_FIRST, SHARED_SIZE)?;
                    self.locks
                        .read_lock(SHARED_FIRST, SHARED_SIZE, Some(Duration::ZERO))
                        .map_err(|err| err.recode(ffi::SQLITE_IOERR_RDLOCK))?;
                }
                if from >= LockLevel::Reserved {
                    self.locks.unlock(RESERVED_BYTE, 1)?;
                }
                if from >= LockLevel::Pending {
                    self.locks.unlock(PENDING_BYTE, 1)?;
                }
                Ok(())
            }
        }
    }

    fn release(&mut self, from: LockLevel) -> Result<()> {
        match self.protocol {
            Protocol::Posix => self.locks.unlock(0, 0),
            Protocol::Windows => {
                if from >= LockLevel::Reserved {
                    self.locks.unlock(RESERVED_BYTE, 1)?;
                }
                if from >= LockLevel::Shared {
                    self.locks.unlock(SHARED_FIRST, SHARED_SIZE)?;
                }
                if from >= LockLevel::Pending {
                    self.locks.unlock(PENDING_BYTE, 1)?;
                }
                Ok(())
            }
        }
    }

    fn check_reserved(&self) -> Result<bool> {
        self.locks.check_lock(RESERVED_BYTE, 1)
    }
}

/// A backend that grants every request. Used with `nolock=1`.
#[derive(Debug, Default)]
pub struct NoLock;

impl LockBackend for NoLock {
    fn shared(&mut self, _timeout: Option<Duration>) -> Result<()> {
        Ok(())
    }

    fn reserved(&mut self, _timeout: Option<Duration>) -> Result<()> {
        Ok(())
    }

    fn pending(&mut self) -> Result<()> {
        Ok(())
    }

    fn exclusive(&mut self, _timeout: Option<Duration>) -> Result<()> {
        Ok(())
    }

    fn release_pending(&mut self) -> Result<()> {
        Ok(())
    }

    fn downgrade(&mut self, _from: LockLevel) -> Result<()> {
        Ok(())
    }

    fn release(&mut self, _from: LockLevel) -> Result<()> {
        Ok(())
    }

    fn check_reserved(&self) -> Result<bool> {
        Ok(false)
    }
}

/// The lock level of one open file and the backend that enforces it.
pub struct FileLock {
    level: LockLevel,
    backend: Box<dyn LockBackend>,
}

impl FileLock {
    pub fn new(backend: impl LockBackend + 'static) -> Self {
        Self::from_box(Box::new(backend))
    }

    pub fn from_box(backend: Box<dyn LockBackend>) -> Self {
        FileLock {
            level: LockLevel::None,
            backend,
        }
    }

    /// The level currently held.
    pub fn level(&self) -> LockLevel {
        self.level
    }

    /// Raises the lock to `level`.
    ///
    /// On failure the level is unchanged; a PENDING lock taken on the way to
    /// EXCLUSIVE is given back.
    pub fn lock(
        &mut self,
        level: LockLevel,
        readonly: bool,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if matches!(level, LockLevel::None | LockLevel::Pending) {
            return Err(Error::misuse("lock request must be SHARED, RESERVED or EXCLUSIVE"));
        }
        if self.level >= level {
            return Ok(());
        }
        if self.level == LockLevel::None && level != LockLevel::Shared {
            return Err(Error::misuse("lock request without a SHARED lock"));
        }
        if level == LockLevel::Reserved && self.level != LockLevel::Shared {
            return Err(Error::misuse("RESERVED lock requires a SHARED lock"));
        }
        if readonly && level >= LockLevel::Reserved {
            return Err(Error::new(ffi::SQLITE_IOERR_LOCK));
        }

        match level {
            LockLevel::Shared => self.backend.shared(timeout)?,
            LockLevel::Reserved => self.backend.reserved(timeout)?,
            _ => {
                let took_pending = self.level < LockLevel::Pending;
                if took_pending {
                    self.backend.pending()?;
                }
                if let Err(err) = self.backend.exclusive(timeout) {
                    if took_pending {
                        if let Err(e) = self.backend.release_pending() {
                            log::warn!("cannot release PENDING lock: {e}");
                        }
                    }
                    return Err(err);
                }
            }
        }
        log::trace!("lock {:?} -> {:?}", self.level, level);
        self.level = level;
        Ok(())
    }

    /// Lowers the lock to `level`, which must be SHARED or NONE.
    pub fn unlock(&mut self, level: LockLevel) -> Result<()> {
        if level > LockLevel::Shared {
            return Err(Error::misuse("unlock target must be SHARED or NONE"));
        }
        if self.level <= level {
            return Ok(());
        }
        match level {
            LockLevel::Shared => self.backend.downgrade(self.level)?,
            _ => self.backend.release(self.level)?,
        }
        log::trace!("unlock {:?} -> {:?}", self.level, level);
        self.level = level;
        Ok(())
    }

    /// Whether this or any other file holds RESERVED or greater.
    pub fn check_reserved(&self) -> Result<bool> {
        if self.level >= LockLevel::Reserved {
            return Ok(true);
        }
        self.backend.check_reserved()
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if self.level > LockLevel::None {
            if let Err(err) = self.backend.release(self.level) {
                log::warn!("cannot release lock on drop: {err}");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::collections::HashMap;

    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    enum Kind {
        Read,
        Write,
    }

    /// An in-process model of open-file-description locks.
    #[derive(Default)]
    pub(crate) struct LockTable {
        bytes: Mutex<HashMap<u64, HashMap<usize, Kind>>>,
    }

    pub(crate) struct FakeLocks {
        table: Arc<LockTable>,
        owner: usize,
    }

    impl FakeLocks {
        pub(crate) fn new(table: &Arc<LockTable>, owner: usize) -> Self {
            FakeLocks {
                table: Arc::clone(table),
                owner,
            }
        }

        fn set(&self, start: u64, len: u64, kind: Kind) -> Result<()> {
            let mut bytes = self.table.bytes.lock();
            let conflict = (start..start + len).any(|b| {
                bytes.get(&b).is_some_and(|owners| {
                    owners
                        .iter()
                        .any(|(&o, &k)| o != self.owner && (kind == Kind::Write || k == Kind::Write))
                })
            });
            if conflict {
                return Err(Error::new(ffi::SQLITE_BUSY));
            }
            for b in start..start + len {
                bytes.entry(b).or_default().insert(self.owner, kind);
            }
            Ok(())
        }
    }

    impl RangeLock for FakeLocks {
        fn read_lock(&self, start: u64, len: u64, _timeout: Option<Duration>) -> Result<()> {
            self.set(start, len, Kind::Read)
        }

        fn write_lock(&self, start: u64, len: u64, _timeout: Option<Duration>) -> Result<()> {
            self.set(start, len, Kind::Write)
        }

        fn unlock(&self, start: u64, len: u64) -> Result<()> {
            let end = if len == 0 { u64::MAX } else { start + len };
            let mut bytes = self.table.bytes.lock();
            for (b, owners) in bytes.iter_mut() {
                if *b >= start && *b < end {
                    owners.remove(&self.owner);
                }
            }
            Ok(())
        }

        fn check_lock(&self, start: u64, len: u64) -> Result<bool> {
            let bytes = self.table.bytes.lock();
            Ok((start..start + len).any(|b| {
                bytes.get(&b).is_some_and(|owners| {
                    owners
                        .iter()
                        .any(|(&o, &k)| o != self.owner && k == Kind::Write)
                })
            }))
        }
    }

    fn pair(protocol: Protocol) -> (FileLock, FileLock) {
        let table = Arc::new(LockTable::default());
        (
            FileLock::new(RangeBackend::new(FakeLocks::new(&table, 1), protocol)),
            FileLock::new(RangeBackend::new(FakeLocks::new(&table, 2), protocol)),
        )
    }

    fn busy() -> Error {
        Error::new(ffi::SQLITE_BUSY)
    }

    const NOW: Option<Duration> = Some(Duration::ZERO);

    #[test]
    fn test_escalation() {
        for protocol in [Protocol::Posix, Protocol::Windows] {
            let (mut f1, mut f2) = pair(protocol);
            f1.lock(LockLevel::Shared, false, NOW).unwrap();
            f2.lock(LockLevel::Shared, false, NOW).unwrap();
            f1.lock(LockLevel::Reserved, false, NOW).unwrap();
            assert!(f2.check_reserved().unwrap());
            assert_eq!(f2.lock(LockLevel::Reserved, false, NOW).unwrap_err(), busy());
            assert_eq!(f1.lock(LockLevel::Exclusive, false, NOW).unwrap_err(), busy());
            assert_eq!(f1.level(), LockLevel::Reserved);
            f2.unlock(LockLevel::None).unwrap();
            f1.lock(LockLevel::Exclusive, false, NOW).unwrap();
            assert_eq!(f1.level(), LockLevel::Exclusive);
            assert_eq!(f2.lock(LockLevel::Shared, false, NOW).unwrap_err(), busy());

            f1.unlock(LockLevel::Shared).unwrap();
            assert!(!f2.check_reserved().unwrap());
            f2.lock(LockLevel::Shared, false, NOW).unwrap();
            f1.unlock(LockLevel::None).unwrap();
            f2.lock(LockLevel::Reserved, false, NOW).unwrap();
            f2.lock(LockLevel::Exclusive, false, NOW).unwrap();
        }
    }

    #[test]
    fn test_pending_blocks_new_readers() {
        for protocol in [Protocol::Posix, Protocol::Windows] {
            let table = Arc::new(LockTable::default());
            let mut writer = RangeBackend::new(FakeLocks::new(&table, 1), protocol);
            let mut reader = FileLock::new(RangeBackend::new(FakeLocks::new(&table, 2), protocol));
            writer.shared(NOW).unwrap();
            writer.pending().unwrap();
            assert_eq!(reader.lock(LockLevel::Shared, false, NOW).unwrap_err(), busy());
            writer.release_pending().unwrap();
            reader.lock(LockLevel::Shared, false, NOW).unwrap();
        }
    }

    #[test]
    fn test_assertions() {
        let (mut f1, _) = pair(Protocol::Posix);
        let misuse = Error::new(ffi::SQLITE_MISUSE);
        assert_eq!(f1.lock(LockLevel::Reserved, false, NOW).unwrap_err(), misuse);
        assert_eq!(f1.lock(LockLevel::Exclusive, false, NOW).unwrap_err(), misuse);
        assert_eq!(f1.lock(LockLevel::Pending, false, NOW).unwrap_err(), misuse);
        f1.lock(LockLevel::Shared, false, NOW).unwrap();
        assert_eq!(f1.unlock(LockLevel::Reserved).unwrap_err(), misuse);
        assert_eq!(
            f1.lock(LockLevel::Reserved, true, NOW).unwrap_err(),
            Error::new(ffi::SQLITE_IOERR_LOCK)
        );
        f1.lock(LockLevel::Exclusive, false, NOW).unwrap();
        // Already held: no-op.
        f1.lock(LockLevel::Shared, false, NOW).unwrap();
        assert_eq!(f1.level(), LockLevel::Exclusive);
    }

    #[test]
    fn test_drop_releases() {
        let (mut f1, mut f2) = pair(Protocol::Posix);
        f1.lock(LockLevel::Shared, false, NOW).unwrap();
        f1.lock(LockLevel::Exclusive, false, NOW).unwrap();
        drop(f1);
        f2.lock(LockLevel::Shared, false, NOW).unwrap();
        f2.lock(LockLevel::Exclusive, false, NOW).unwrap();
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Lock(usize, LockLevel),
        Unlock(usize, LockLevel),
    }

    fn op() -> impl Strategy<Value = Op> {
        let level = prop_oneof![
            Just(LockLevel::None),
            Just(LockLevel::Shared),
            Just(LockLevel::Reserved),
            Just(LockLevel::Pending),
            Just(LockLevel::Exclusive),
        ];
        (0..3usize, level, any::<bool>()).prop_map(|(file, level, lock)| {
            if lock {
                Op::Lock(file, level)
            } else {
                Op::Unlock(file, level)
            }
        })
    }

    fn legal(from: LockLevel, to: LockLevel) -> bool {
        use LockLevel::*;
        from == to
            || matches!(
                (from, to),
                (None, Shared)
                    | (Shared, Reserved)
                    | (Shared, Exclusive)
                    | (Reserved, Exclusive)
                    | (Pending, Exclusive)
                    | (_, None)
                    | (Reserved | Pending | Exclusive, Shared)
            )
    }

    proptest! {
        #[test]
        fn prop_transitions_and_exclusion(
            ops in proptest::collection::vec(op(), 1..60),
            windows in any::<bool>(),
        ) {
            let protocol = if windows { Protocol::Windows } else { Protocol::Posix };
            let table = Arc::new(LockTable::default());
            let mut files: Vec<FileLock> = (0..3)
                .map(|i| FileLock::new(RangeBackend::new(FakeLocks::new(&table, i), protocol)))
                .collect();
            for op in ops {
                let (i, before) = match op {
                    Op::Lock(i, _) | Op::Unlock(i, _) => (i, files[i].level()),
                };
                let result = match op {
                    Op::Lock(i, level) => files[i].lock(level, false, NOW),
                    Op::Unlock(i, level) => files[i].unlock(level),
                };
                let after = files[i].level();
                if result.is_err() {
                    prop_assert_eq!(before, after);
                }
                prop_assert!(legal(before, after), "{:?} -> {:?}", before, after);
                prop_assert!(after != LockLevel::Pending);

                let writers = files.iter().filter(|f| f.level() >= LockLevel::Reserved).count();
                prop_assert!(writers <= 1);
                let exclusive = files.iter().any(|f| f.level() == LockLevel::Exclusive);
                let holders = files.iter().filter(|f| f.level() > LockLevel::None).count();
                prop_assert!(!exclusive || holders == 1);
            }
        }
    }
}

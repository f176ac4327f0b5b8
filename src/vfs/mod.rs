//! Virtual file systems for a sandboxed SQLite.
//!
//! The engine inside the sandbox reaches storage through the host functions
//! in [`crate::bridge`]. Those resolve a [`Vfs`] by name from a
//! [`VfsRegistry`] and forward every file method to a [`VfsFile`].
//!
//! Three VFSes are built in:
//!
//! 1. [`os::OsVfs`], files on the host filesystem, registered as `"os"` and as
//!    the default.
//! 2. [`memdb::MemDbVfs`], shared in-memory databases, registered as
//!    `"memdb"`.
//! 3. [`reader::ReaderVfs`], immutable databases served from positional
//!    readers, registered as `"reader"`.
//!
//! Main databases and WALs of every VFS pass through the [`cksm`] codec,
//! which is inert unless the database reserves 8 bytes per page.
//!
//! (See [SQLite doc](https://sqlite.org/vfs.html))

pub mod cksm;
pub mod filename;
pub mod lock;
pub mod memdb;
pub mod os;
pub mod reader;
pub mod registry;
pub mod shm;

pub use self::filename::Filename;
pub use self::registry::VfsRegistry;
pub use self::shm::{SharedMemory, WalLock, WalLockMode};

use crate::error::Error;
use crate::ffi;
use parking_lot::Mutex;
use rand::RngCore;
use std::borrow::Cow;
use std::error;
use std::ffi::c_int;
use std::fmt::{self, Display};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

/// A specialised result type for [`Vfs`] operations.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// A file shared between the bridge's handle table and the files that refer
/// back to it (a WAL inheriting its database's checksum state).
pub type FileHandle = Arc<Mutex<Box<dyn VfsFile>>>;

/// Extension trait to write results to output parameters, consuming the result and returning an appropriate [`Result`].
pub trait WriteOutputResultExt<T> {
    /// Converts `self` into the `out` param + return code form the engine
    /// expects.
    ///
    /// If `self` is:
    /// - `Ok(value)`, then `value` is written to `*output` and [`Result::Ok`] is returned.
    /// - `Err(err)`, then `*output` is unchanged and `err` is returned.
    fn write_to_output(self, output: &mut impl From<T>) -> Result<()>;
}

impl<T> WriteOutputResultExt<T> for Result<T> {
    fn write_to_output(self, output: &mut impl From<T>) -> Result<()> {
        self.map(|value| *output = value.into())
    }
}

/// Represents a virtual file system.
///
/// This trait abstracts [`sqlite3_vfs`](https://www.sqlite.org/c3ref/vfs.html).
/// Implementations are shared by every module using the registry, so they
/// must be thread safe.
pub trait Vfs: Send + Sync {
    /// Opens a file. Returns the file and the flags actually used.
    ///
    /// `name` is `None` for temporary files the VFS must name itself.
    ///
    /// See [`xOpen`](https://www.sqlite.org/c3ref/vfs.html).
    fn open(&self, name: Option<&Filename>, flags: OpenFlags) -> Result<OpenFile>;

    /// Opens a file, also receiving the URI parameters given to the engine.
    ///
    /// Called instead of [`Vfs::open`] when the engine opened the database
    /// with `SQLITE_OPEN_URI`.
    fn open_with_params(
        &self,
        name: Option<&Filename>,
        flags: OpenFlags,
        params: &[(String, String)],
    ) -> Result<OpenFile> {
        let _ = params;
        self.open(name, flags)
    }

    /// Deletes a file, optionally syncing the directory afterward.
    ///
    /// See [`xDelete`](https://www.sqlite.org/c3ref/vfs.html).
    fn delete(&self, name: &str, sync_dir: bool) -> Result<()>;

    /// Checks a file for existence or permissions without opening it.
    ///
    /// See [`xAccess`](https://www.sqlite.org/c3ref/vfs.html).
    fn access(&self, name: &str, flag: AccessFlag) -> Result<bool>;

    /// Resolves the canonical name of a file.
    ///
    /// See [`xFullPathname`](https://www.sqlite.org/c3ref/vfs.html).
    fn full_pathname(&self, name: &str) -> Result<FullPathname>;

    /// Fills a buffer with random bytes.
    ///
    /// See [`xRandomness`](https://www.sqlite.org/c3ref/vfs.html).
    fn fill_random_bytes(&self, out: &mut [u8]) {
        rand::rng().fill_bytes(out);
    }

    /// Sleeps for the given duration.
    ///
    /// See [`xSleep`](https://www.sqlite.org/c3ref/vfs.html).
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }

    /// Returns the current system time.
    ///
    /// See [`xCurrentTimeInt64`](https://www.sqlite.org/c3ref/vfs.html).
    fn now(&self) -> Result<SystemTime> {
        Ok(SystemTime::now())
    }
}

/// The canonical name of a file, as produced by [`Vfs::full_pathname`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FullPathname {
    /// The resolved path.
    pub path: String,
    /// The path names a symbolic link (`SQLITE_OK_SYMLINK`).
    pub symlink: bool,
}

impl FullPathname {
    /// A resolved path that is not a symbolic link.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            symlink: false,
        }
    }
}

/// The question asked by [`Vfs::access`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccessFlag {
    /// Mirrors SQLITE_ACCESS_EXISTS.
    Exists,
    /// Mirrors SQLITE_ACCESS_READWRITE.
    ReadWrite,
    /// Mirrors SQLITE_ACCESS_READ.
    Read,
}

impl AccessFlag {
    /// Converts SQLite access constants into [`AccessFlag`].
    pub fn from_raw(flag: c_int) -> Result<Self> {
        match flag {
            ffi::SQLITE_ACCESS_EXISTS => Ok(AccessFlag::Exists),
            ffi::SQLITE_ACCESS_READWRITE => Ok(AccessFlag::ReadWrite),
            ffi::SQLITE_ACCESS_READ => Ok(AccessFlag::Read),
            _ => Err(Error::misuse("invalid access flag")),
        }
    }
}

/// The type of file being opened.
///
/// See [`xOpen`](https://sqlite.org/c3ref/vfs.html#sqlite3vfsxopen)
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FileType {
    /// Mirrors SQLITE_OPEN_MAIN_DB.
    MainDb,
    /// Mirrors SQLITE_OPEN_MAIN_JOURNAL.
    MainJournal,
    /// Mirrors SQLITE_OPEN_TEMP_DB.
    TempDb,
    /// Mirrors SQLITE_OPEN_TEMP_JOURNAL.
    TempJournal,
    /// Mirrors SQLITE_OPEN_TRANSIENT_DB.
    TransientDb,
    /// Mirrors SQLITE_OPEN_SUBJOURNAL.
    Subjournal,
    /// Mirrors SQLITE_OPEN_SUPER_JOURNAL.
    SuperJournal,
    /// Mirrors SQLITE_OPEN_WAL.
    Wal,
}

bitflags::bitflags! {
    /// Flags passed to [`Vfs::open`] and returned through [`OpenFile`].
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct OpenFlags: c_int {
        const READONLY = ffi::SQLITE_OPEN_READONLY;
        const READWRITE = ffi::SQLITE_OPEN_READWRITE;
        const CREATE = ffi::SQLITE_OPEN_CREATE;
        /// Deletes the file when it is closed.
        const DELETEONCLOSE = ffi::SQLITE_OPEN_DELETEONCLOSE;
        const EXCLUSIVE = ffi::SQLITE_OPEN_EXCLUSIVE;
        const AUTOPROXY = ffi::SQLITE_OPEN_AUTOPROXY;
        /// The name was given as a URI; parameters are available.
        const URI = ffi::SQLITE_OPEN_URI;
        const MEMORY = ffi::SQLITE_OPEN_MEMORY;
        const MAIN_DB = ffi::SQLITE_OPEN_MAIN_DB;
        const TEMP_DB = ffi::SQLITE_OPEN_TEMP_DB;
        const TRANSIENT_DB = ffi::SQLITE_OPEN_TRANSIENT_DB;
        const MAIN_JOURNAL = ffi::SQLITE_OPEN_MAIN_JOURNAL;
        const TEMP_JOURNAL = ffi::SQLITE_OPEN_TEMP_JOURNAL;
        const SUBJOURNAL = ffi::SQLITE_OPEN_SUBJOURNAL;
        const SUPER_JOURNAL = ffi::SQLITE_OPEN_SUPER_JOURNAL;
        const NOMUTEX = ffi::SQLITE_OPEN_NOMUTEX;
        const FULLMUTEX = ffi::SQLITE_OPEN_FULLMUTEX;
        const SHAREDCACHE = ffi::SQLITE_OPEN_SHAREDCACHE;
        const PRIVATECACHE = ffi::SQLITE_OPEN_PRIVATECACHE;
        const WAL = ffi::SQLITE_OPEN_WAL;
        /// Refuses to open symbolic links.
        const NOFOLLOW = ffi::SQLITE_OPEN_NOFOLLOW;
        const EXRESCODE = ffi::SQLITE_OPEN_EXRESCODE;
    }
}

impl OpenFlags {
    const FILE_TYPES: [(OpenFlags, FileType); 8] = [
        (OpenFlags::MAIN_DB, FileType::MainDb),
        (OpenFlags::MAIN_JOURNAL, FileType::MainJournal),
        (OpenFlags::TEMP_DB, FileType::TempDb),
        (OpenFlags::TEMP_JOURNAL, FileType::TempJournal),
        (OpenFlags::TRANSIENT_DB, FileType::TransientDb),
        (OpenFlags::SUBJOURNAL, FileType::Subjournal),
        (OpenFlags::SUPER_JOURNAL, FileType::SuperJournal),
        (OpenFlags::WAL, FileType::Wal),
    ];

    /// Returns the class of file being opened.
    ///
    /// `None` when no class bit, or more than one, is set.
    pub fn file_type(&self) -> Option<FileType> {
        let mut found = None;
        for (flag, ty) in Self::FILE_TYPES {
            if self.contains(flag) {
                if found.is_some() {
                    return None;
                }
                found = Some(ty);
            }
        }
        found
    }
}

/// Represents a VFS opened file along with the flags it was opened with.
pub struct OpenFile {
    pub(crate) file: Box<dyn VfsFile>,
    pub(crate) flags: OpenFlags,
}

impl OpenFile {
    /// Creates a new `OpenFile` reporting `flags` back to the engine.
    pub fn new(file: impl VfsFile + 'static, flags: OpenFlags) -> Self {
        Self::from_box(Box::new(file), flags)
    }

    /// Creates a new `OpenFile` from an already boxed file.
    pub fn from_box(file: Box<dyn VfsFile>, flags: OpenFlags) -> Self {
        OpenFile { file, flags }
    }

    /// Marks the file as readonly. See [`SQLITE_OPEN_READONLY`](https://sqlite.org/c3ref/vfs.html#sqlite3vfsxopen).
    pub fn readonly(mut self) -> Self {
        self.flags.remove(OpenFlags::READWRITE);
        self.flags.insert(OpenFlags::READONLY);
        self
    }

    /// The flags reported to the engine.
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// Splits into the file and its flags.
    pub fn into_parts(self) -> (Box<dyn VfsFile>, OpenFlags) {
        (self.file, self.flags)
    }
}

/// Represents the file I/O behaviours required by a [`Vfs`].
///
/// This trait corresponds to [`sqlite3_io_methods`](https://www.sqlite.org/c3ref/io_methods.html).
/// Methods with a default return `SQLITE_NOTFOUND` (or a neutral value), which
/// makes the engine fall back to its built-in behavior.
#[allow(clippy::len_without_is_empty)]
pub trait VfsFile: Send {
    /// Reads from the file at an offset, returning the number of bytes read.
    ///
    /// Fewer bytes than requested means end of file; the bridge zero-fills
    /// the rest and reports `SQLITE_IOERR_SHORT_READ`.
    ///
    /// See [`xRead`](https://www.sqlite.org/c3ref/io_methods.html#xRead).
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Writes to the file at an offset. Short writes are errors.
    ///
    /// See [`xWrite`](https://www.sqlite.org/c3ref/io_methods.html#xWrite).
    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<()>;

    /// Truncates the file to a size.
    ///
    /// See [`xTruncate`](https://www.sqlite.org/c3ref/io_methods.html#xTruncate).
    fn truncate(&mut self, size: u64) -> Result<()>;

    /// Syncs the file to disk.
    ///
    /// See [`xSync`](https://www.sqlite.org/c3ref/io_methods.html#xSync).
    fn sync(&mut self, op: SyncOptions) -> Result<()>;

    /// Gets the file size.
    ///
    /// See [`xFileSize`](https://www.sqlite.org/c3ref/io_methods.html#xFileSize).
    fn len(&self) -> Result<u64>;

    /// Acquires a file lock at the given `level`.
    ///
    /// See [`xLock`](https://www.sqlite.org/c3ref/io_methods.html#xLock).
    fn lock(&mut self, level: LockLevel) -> Result<()>;

    /// Releases a file lock down to the given `level`.
    ///
    /// See [`xUnlock`](https://www.sqlite.org/c3ref/io_methods.html#xUnlock).
    fn unlock(&mut self, level: LockLevel) -> Result<()>;

    /// Checks if any connection holds a RESERVED or greater lock.
    ///
    /// See [`xCheckReservedLock`](https://www.sqlite.org/c3ref/io_methods.html#xCheckReservedLock).
    fn is_write_locked(&self) -> Result<bool>;

    /// Gets the current lock state.
    ///
    /// See [`SQLITE_FCNTL_LOCKSTATE`](https://www.sqlite.org/c3ref/c_fcntl_begin_atomic_write.html#sqlitefcntllockstate).
    fn lock_level(&self) -> LockLevel;

    /// Gets the sector size.
    ///
    /// See [`xSectorSize`](https://www.sqlite.org/c3ref/io_methods.html#xSectorSize).
    fn sector_len(&self) -> u32 {
        4096
    }

    /// Gets I/O characteristics.
    ///
    /// See [`xDeviceCharacteristics`](https://www.sqlite.org/c3ref/io_methods.html#xDeviceCharacteristics).
    fn io_capabilities(&self) -> IoCapabilities;

    /// Releases locks and OS resources.
    ///
    /// See [`xClose`](https://www.sqlite.org/c3ref/io_methods.html#xClose).
    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// Handles the size hint for a transaction.
    ///
    /// See [`SQLITE_FCNTL_SIZE_HINT`](https://www.sqlite.org/c3ref/c_fcntl_begin_atomic_write.html#sqlitefcntlsizehint).
    fn hint_size(&mut self, size: u64) -> Result<()> {
        let _ = size;
        Err(Error::new(ffi::SQLITE_NOTFOUND))
    }

    /// Hints that subsequent writes overwrite existing content.
    ///
    /// See [`SQLITE_FCNTL_OVERWRITE`](https://www.sqlite.org/c3ref/c_fcntl_begin_atomic_write.html#sqlitefcntloverwrite).
    fn hint_overwrite(&mut self) -> Result<()> {
        Err(Error::new(ffi::SQLITE_NOTFOUND))
    }

    /// Sets the allocation granularity.
    ///
    /// See [`SQLITE_FCNTL_CHUNK_SIZE`](https://www.sqlite.org/c3ref/c_fcntl_begin_atomic_write.html#sqlitefcntlchunksize).
    fn set_chunk_size(&mut self, size: u32) -> Result<()> {
        let _ = size;
        Err(Error::new(ffi::SQLITE_NOTFOUND))
    }

    /// Handles PRAGMA forwarding.
    ///
    /// See [`SQLITE_FCNTL_PRAGMA`](https://www.sqlite.org/c3ref/c_fcntl_begin_atomic_write.html#sqlitefcntlpragma).
    fn pragma(&mut self, name: &str, arg: Option<&str>) -> PragmaResult {
        let _ = name;
        let _ = arg;
        Err(PragmaError::from(Error::new(ffi::SQLITE_NOTFOUND)))
    }

    /// Reports whether the file was renamed or deleted since it was opened.
    ///
    /// See [`SQLITE_FCNTL_HAS_MOVED`](https://www.sqlite.org/c3ref/c_fcntl_begin_atomic_write.html#sqlitefcnthasmoved).
    fn has_moved(&self) -> Result<bool> {
        Ok(false)
    }

    /// Completes commit phase two.
    ///
    /// See [`SQLITE_FCNTL_COMMIT_PHASETWO`](https://www.sqlite.org/c3ref/c_fcntl_begin_atomic_write.html#sqlitefcntlcommitphasetwo).
    fn commit_phase_two(&mut self) -> Result<()> {
        Err(Error::new(ffi::SQLITE_NOTFOUND))
    }

    /// Begins an atomic-write sequence.
    ///
    /// See [`SQLITE_FCNTL_BEGIN_ATOMIC_WRITE`](https://www.sqlite.org/c3ref/c_fcntl_begin_atomic_write.html#sqlitefcntlbeginatomicwrite).
    fn begin_atomic(&mut self) -> Result<()> {
        Err(Error::new(ffi::SQLITE_NOTFOUND))
    }

    /// Commits an atomic-write sequence.
    ///
    /// See [`SQLITE_FCNTL_COMMIT_ATOMIC_WRITE`](https://www.sqlite.org/c3ref/c_fcntl_begin_atomic_write.html#sqlitefcntlcommitatomicwrite).
    fn commit_atomic(&mut self) -> Result<()> {
        Err(Error::new(ffi::SQLITE_NOTFOUND))
    }

    /// Rolls back an atomic-write sequence.
    ///
    /// See [`SQLITE_FCNTL_ROLLBACK_ATOMIC_WRITE`](https://www.sqlite.org/c3ref/c_fcntl_begin_atomic_write.html#sqlitefcntlrollbackatomicwrite).
    fn rollback_atomic(&mut self) -> Result<()> {
        Err(Error::new(ffi::SQLITE_NOTFOUND))
    }

    /// Gets the lock timeout. `None` blocks indefinitely.
    ///
    /// See [`SQLITE_FCNTL_LOCK_TIMEOUT`](https://www.sqlite.org/c3ref/c_fcntl_begin_atomic_write.html#sqlitefcntllocktimeout).
    fn lock_timeout(&self) -> Option<Duration> {
        Some(Duration::ZERO)
    }

    /// Sets the lock timeout and returns the previous value.
    fn set_lock_timeout(&mut self, timeout: Option<Duration>) -> Result<Option<Duration>> {
        let _ = timeout;
        Err(Error::new(ffi::SQLITE_NOTFOUND))
    }

    /// Gets WAL persistence.
    ///
    /// See [`SQLITE_FCNTL_PERSIST_WAL`](https://www.sqlite.org/c3ref/c_fcntl_begin_atomic_write.html#sqlitefcntlpersistwal).
    fn is_wal_persistent(&self) -> bool {
        false
    }

    /// Sets WAL persistence.
    fn set_wal_persistent(&mut self, persist: bool) {
        let _ = persist;
    }

    /// Gets powersafe overwrite property for the filesystem.
    ///
    /// See [`SQLITE_FCNTL_POWERSAFE_OVERWRITE`](https://www.sqlite.org/c3ref/c_fcntl_begin_atomic_write.html#sqlitefcntlpowersafeoverwrite).
    fn is_powersafe_overwrite(&self) -> bool {
        false
    }

    /// Sets powersafe overwrite property for the filesystem.
    fn set_powersafe_overwrite(&mut self, powersafe: bool) -> Result<()> {
        let _ = powersafe;
        Err(Error::new(ffi::SQLITE_NOTFOUND))
    }

    /// Signals checkpoint start.
    ///
    /// See [`SQLITE_FCNTL_CKPT_START`](https://www.sqlite.org/c3ref/c_fcntl_begin_atomic_write.html#sqlitefcntlckptstart).
    fn on_checkpoint_start(&mut self) {}

    /// Signals checkpoint completion.
    ///
    /// See [`SQLITE_FCNTL_CKPT_DONE`](https://www.sqlite.org/c3ref/c_fcntl_begin_atomic_write.html#sqlitefcntlckptdone).
    fn on_checkpoint_done(&mut self) {}

    /// The WAL-index backing of this file, if it supports WAL mode.
    ///
    /// Files without one make the engine fall back to rollback journals.
    fn shared_memory(&mut self) -> Option<&mut dyn SharedMemory> {
        None
    }

    /// The checksum state of a main database file, shared with its WAL.
    fn checksum_flags(&self) -> Option<cksm::SharedFlags> {
        None
    }
}

/// Options for syncing a file.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// True for Mac OS X style fullsync, false for Unix style fsync.
    pub full: bool,
    /// True to sync only the data of the file and not its inode (fdatasync).
    pub data_only: bool,
}

impl SyncOptions {
    /// Converts from raw SQLite flags.
    pub fn from_raw(flags: c_int) -> Self {
        SyncOptions {
            full: (flags & 0x0f) == ffi::SQLITE_SYNC_FULL,
            data_only: (flags & ffi::SQLITE_SYNC_DATAONLY) != 0,
        }
    }

    /// Converts to raw SQLite flags.
    pub fn to_raw(&self) -> c_int {
        let mut flags = if self.full {
            ffi::SQLITE_SYNC_FULL
        } else {
            ffi::SQLITE_SYNC_NORMAL
        };
        if self.data_only {
            flags |= ffi::SQLITE_SYNC_DATAONLY;
        }
        flags
    }
}

/// Represents pragma operation results.
pub type PragmaResult = std::result::Result<Option<Cow<'static, str>>, PragmaError>;

/// Represents errors in pragma operations.
#[derive(Debug)]
pub struct PragmaError {
    /// Error code.
    pub code: Error,
    /// Optional error message, handed back to the engine as the pragma's
    /// error text.
    pub message: Option<Cow<'static, str>>,
}

impl PragmaError {
    /// Constructs a pragma error with an explicit message.
    pub fn new(code: Error, message: impl Into<Cow<'static, str>>) -> Self {
        PragmaError {
            code,
            message: Some(message.into()),
        }
    }

    /// True when the pragma is not handled at this layer.
    pub fn is_not_found(&self) -> bool {
        self.code.extended_code() == ffi::SQLITE_NOTFOUND
    }
}

impl From<Error> for PragmaError {
    fn from(code: Error) -> Self {
        PragmaError {
            code,
            message: None,
        }
    }
}

impl Display for PragmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { code, message } = self;
        match message {
            Some(msg) => write!(f, "{code}: {msg}"),
            None => write!(f, "{code}"),
        }
    }
}

impl error::Error for PragmaError {}

/// File locking levels. See [File Locking](https://www.sqlite.org/lockingv3.html).
#[derive(Copy, Clone, Debug, Default, Eq, Ord, PartialEq, PartialOrd, Hash)]
pub enum LockLevel {
    /// Mirrors SQLITE_LOCK_NONE.
    #[default]
    None,
    /// Mirrors SQLITE_LOCK_SHARED.
    Shared,
    /// Mirrors SQLITE_LOCK_RESERVED.
    Reserved,
    /// Mirrors SQLITE_LOCK_PENDING.
    Pending,
    /// Mirrors SQLITE_LOCK_EXCLUSIVE.
    Exclusive,
}

impl LockLevel {
    /// Converts SQLite lock constants into [`LockLevel`].
    pub fn from_raw(level: c_int) -> Result<Self> {
        match level {
            ffi::SQLITE_LOCK_NONE => Ok(LockLevel::None),
            ffi::SQLITE_LOCK_SHARED => Ok(LockLevel::Shared),
            ffi::SQLITE_LOCK_RESERVED => Ok(LockLevel::Reserved),
            ffi::SQLITE_LOCK_PENDING => Ok(LockLevel::Pending),
            ffi::SQLITE_LOCK_EXCLUSIVE => Ok(LockLevel::Exclusive),
            _ => Err(Error::misuse("invalid lock level")),
        }
    }

    /// Converts [`LockLevel`] back into SQLite lock constants.
    pub fn to_raw(&self) -> c_int {
        match self {
            LockLevel::None => ffi::SQLITE_LOCK_NONE,
            LockLevel::Shared => ffi::SQLITE_LOCK_SHARED,
            LockLevel::Reserved => ffi::SQLITE_LOCK_RESERVED,
            LockLevel::Pending => ffi::SQLITE_LOCK_PENDING,
            LockLevel::Exclusive => ffi::SQLITE_LOCK_EXCLUSIVE,
        }
    }
}

bitflags::bitflags! {
    /// I/O characteristics reported by [`VfsFile::io_capabilities`].
    ///
    /// See [Device Characteristics](https://sqlite.org/c3ref/c_iocap_atomic.html).
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct IoCapabilities: c_int {
        /// All writes are atomic.
        const ATOMIC = ffi::SQLITE_IOCAP_ATOMIC;
        const ATOMIC512 = ffi::SQLITE_IOCAP_ATOMIC512;
        const ATOMIC1K = ffi::SQLITE_IOCAP_ATOMIC1K;
        const ATOMIC2K = ffi::SQLITE_IOCAP_ATOMIC2K;
        const ATOMIC4K = ffi::SQLITE_IOCAP_ATOMIC4K;
        const ATOMIC8K = ffi::SQLITE_IOCAP_ATOMIC8K;
        const ATOMIC16K = ffi::SQLITE_IOCAP_ATOMIC16K;
        const ATOMIC32K = ffi::SQLITE_IOCAP_ATOMIC32K;
        const ATOMIC64K = ffi::SQLITE_IOCAP_ATOMIC64K;
        /// Data grows before the file length.
        const SAFE_APPEND = ffi::SQLITE_IOCAP_SAFE_APPEND;
        /// Writes reach storage in call order.
        const SEQUENTIAL = ffi::SQLITE_IOCAP_SEQUENTIAL;
        const UNDELETABLE_WHEN_OPEN = ffi::SQLITE_IOCAP_UNDELETABLE_WHEN_OPEN;
        /// Crashes leave neighboring bytes intact.
        const POWERSAFE_OVERWRITE = ffi::SQLITE_IOCAP_POWERSAFE_OVERWRITE;
        /// Backing media never changes.
        const IMMUTABLE = ffi::SQLITE_IOCAP_IMMUTABLE;
        const BATCH_ATOMIC = ffi::SQLITE_IOCAP_BATCH_ATOMIC;
        const SUBPAGE_READ = ffi::SQLITE_IOCAP_SUBPAGE_READ;
    }
}

/// Converts a `SQLITE_FCNTL_LOCK_TIMEOUT` value in milliseconds.
/// Negative values block indefinitely.
pub fn lock_timeout_from_millis(ms: i32) -> Option<Duration> {
    u64::try_from(ms).ok().map(Duration::from_millis)
}

/// Converts a lock timeout back to milliseconds, saturating.
pub fn lock_timeout_to_millis(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) => i32::try_from(d.as_millis()).unwrap_or(i32::MAX),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DummyFile;

    impl VfsFile for DummyFile {
        fn read_at(&mut self, buf: &mut [u8], _offset: u64) -> Result<usize> {
            buf.fill(0);
            Ok(0)
        }

        fn write_at(&mut self, _buf: &[u8], _offset: u64) -> Result<()> {
            Ok(())
        }

        fn truncate(&mut self, _size: u64) -> Result<()> {
            Ok(())
        }

        fn sync(&mut self, _op: SyncOptions) -> Result<()> {
            Ok(())
        }

        fn len(&self) -> Result<u64> {
            Ok(0)
        }

        fn lock(&mut self, _level: LockLevel) -> Result<()> {
            Ok(())
        }

        fn unlock(&mut self, _level: LockLevel) -> Result<()> {
            Ok(())
        }

        fn is_write_locked(&self) -> Result<bool> {
            Ok(false)
        }

        fn lock_level(&self) -> LockLevel {
            LockLevel::None
        }

        fn io_capabilities(&self) -> IoCapabilities {
            IoCapabilities::empty()
        }
    }

    #[test]
    fn test_default_file_methods() {
        let mut file = DummyFile;
        let not_found = Error::new(ffi::SQLITE_NOTFOUND);
        assert_eq!(file.hint_size(4096).unwrap_err(), not_found);
        assert_eq!(file.set_chunk_size(4096).unwrap_err(), not_found);
        assert_eq!(file.commit_phase_two().unwrap_err(), not_found);
        assert_eq!(file.set_lock_timeout(None).unwrap_err(), not_found);
        assert!(file.pragma("page_size", None).unwrap_err().is_not_found());
        assert!(!file.has_moved().unwrap());
        assert!(file.shared_memory().is_none());
        assert!(file.checksum_flags().is_none());
        assert_eq!(file.sector_len(), 4096);
    }

    #[test]
    fn test_file_type() {
        let flags = OpenFlags::READWRITE | OpenFlags::CREATE | OpenFlags::MAIN_DB;
        assert_eq!(flags.file_type(), Some(FileType::MainDb));
        assert_eq!(OpenFlags::WAL.file_type(), Some(FileType::Wal));
        assert_eq!(OpenFlags::READWRITE.file_type(), None);
        assert_eq!((OpenFlags::WAL | OpenFlags::MAIN_DB).file_type(), None);
    }

    #[test]
    fn test_open_file_readonly() {
        let file = OpenFile::new(DummyFile, OpenFlags::READWRITE | OpenFlags::MAIN_DB).readonly();
        assert_eq!(file.flags(), OpenFlags::READONLY | OpenFlags::MAIN_DB);
    }

    #[test]
    fn test_lock_level() {
        for raw in 0..=4 {
            assert_eq!(LockLevel::from_raw(raw).unwrap().to_raw(), raw);
        }
        let err = LockLevel::from_raw(5).unwrap_err();
        assert_eq!(err.extended_code(), ffi::SQLITE_MISUSE);
        assert!(LockLevel::Shared < LockLevel::Reserved);
        assert!(LockLevel::Pending < LockLevel::Exclusive);
    }

    #[test]
    fn test_sync_options() {
        let full = SyncOptions::from_raw(ffi::SQLITE_SYNC_FULL | ffi::SQLITE_SYNC_DATAONLY);
        assert!(full.full && full.data_only);
        assert_eq!(full.to_raw(), ffi::SQLITE_SYNC_FULL | ffi::SQLITE_SYNC_DATAONLY);
        let normal = SyncOptions::from_raw(ffi::SQLITE_SYNC_NORMAL);
        assert!(!normal.full && !normal.data_only);
    }

    #[test]
    fn test_io_capabilities() {
        let caps = IoCapabilities::IMMUTABLE | IoCapabilities::SUBPAGE_READ;
        assert_eq!(caps.bits(), 0xa000);
        let memdb = IoCapabilities::ATOMIC
            | IoCapabilities::SEQUENTIAL
            | IoCapabilities::SAFE_APPEND
            | IoCapabilities::POWERSAFE_OVERWRITE;
        assert_eq!(memdb.bits(), 0x1601);
    }

    #[test]
    fn test_lock_timeout_millis() {
        assert_eq!(lock_timeout_from_millis(-1), None);
        assert_eq!(lock_timeout_from_millis(0), Some(Duration::ZERO));
        assert_eq!(lock_timeout_to_millis(Some(Duration::from_millis(250))), 250);
        assert_eq!(lock_timeout_to_millis(None), -1);
    }

    #[test]
    fn test_write_to_output() {
        let mut out = 0i64;
        Ok(42u32).write_to_output(&mut out).unwrap();
        assert_eq!(out, 42);
        let err: Result<u32> = Err(Error::new(ffi::SQLITE_IOERR_SEEK));
        assert!(err.write_to_output(&mut out).is_err());
        assert_eq!(out, 42);
    }
}

//! Configure files and the OS VFS

use std::os::raw::c_int;
use std::time::Duration;

use crate::ffi;
use crate::vfs::{lock_timeout_to_millis, Result, VfsFile};

/// Per-connection file options, issued through `sqlite3_file_control`.
///
/// See [Standard File Control Opcodes][fcntl] for details.
///
/// [fcntl]: https://sqlite.org/c3ref/c_fcntl_begin_atomic_write.html
#[repr(i32)]
#[non_exhaustive]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FileConfig {
    /// Milliseconds a lock request waits before returning `SQLITE_BUSY`.
    /// Negative values wait forever.
    ///
    /// Equivalent to `SQLITE_FCNTL_LOCK_TIMEOUT` from the C API.
    LockTimeout = 34,

    /// Keep the WAL file after the last connection closes.
    ///
    /// Equivalent to `SQLITE_FCNTL_PERSIST_WAL` from the C API.
    PersistWal = 10,

    /// Whether the storage has the power-safe overwrite property.
    ///
    /// Equivalent to `SQLITE_FCNTL_POWERSAFE_OVERWRITE` from the C API.
    PowersafeOverwrite = 13,

    /// Grow and shrink the database in multiples of this many bytes.
    ///
    /// Equivalent to `SQLITE_FCNTL_CHUNK_SIZE` from the C API.
    ChunkSize = 6,

    /// Bytes reserved at the end of each page. 8 turns on page checksums
    /// once the database is rebuilt with `VACUUM`.
    ///
    /// This one is consumed by the engine; the VFS only observes its effect
    /// through the database header.
    ///
    /// Equivalent to `SQLITE_FCNTL_RESERVE_BYTES` from the C API.
    ReserveBytes = 38,

    /// Expected final size of the database, so space can be preallocated.
    ///
    /// Equivalent to `SQLITE_FCNTL_SIZE_HINT` from the C API.
    SizeHint = 5,
}

impl FileConfig {
    /// The `sqlite3_file_control` opcode.
    #[must_use]
    pub fn opcode(self) -> c_int {
        self as c_int
    }
}

/// A set of [`FileConfig`] values to apply to a database file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileOptions {
    lock_timeout: Option<Option<Duration>>,
    persist_wal: Option<bool>,
    powersafe_overwrite: Option<bool>,
    chunk_size: Option<u32>,
    reserve_bytes: Option<u8>,
    size_hint: Option<u64>,
}

impl FileOptions {
    /// No options set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// See [`FileConfig::LockTimeout`]. `None` waits forever.
    #[must_use]
    pub fn lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// See [`FileConfig::PersistWal`].
    #[must_use]
    pub fn persist_wal(mut self, persist: bool) -> Self {
        self.persist_wal = Some(persist);
        self
    }

    /// See [`FileConfig::PowersafeOverwrite`].
    #[must_use]
    pub fn powersafe_overwrite(mut self, psow: bool) -> Self {
        self.powersafe_overwrite = Some(psow);
        self
    }

    /// See [`FileConfig::ChunkSize`].
    #[must_use]
    pub fn chunk_size(mut self, size: u32) -> Self {
        self.chunk_size = Some(size);
        self
    }

    /// See [`FileConfig::ReserveBytes`]. Only 0 and 8 are meaningful.
    #[must_use]
    pub fn checksums(mut self, enabled: bool) -> Self {
        self.reserve_bytes = Some(if enabled { 8 } else { 0 });
        self
    }

    /// See [`FileConfig::SizeHint`].
    #[must_use]
    pub fn size_hint(mut self, size: u64) -> Self {
        self.size_hint = Some(size);
        self
    }

    /// The `(option, argument)` pairs a connection issues, in order.
    pub fn file_controls(&self) -> Vec<(FileConfig, i64)> {
        let mut controls = Vec::new();
        if let Some(timeout) = self.lock_timeout {
            controls.push((
                FileConfig::LockTimeout,
                i64::from(lock_timeout_to_millis(timeout)),
            ));
        }
        if let Some(persist) = self.persist_wal {
            controls.push((FileConfig::PersistWal, i64::from(persist)));
        }
        if let Some(psow) = self.powersafe_overwrite {
            controls.push((FileConfig::PowersafeOverwrite, i64::from(psow)));
        }
        if let Some(size) = self.chunk_size {
            controls.push((FileConfig::ChunkSize, i64::from(size)));
        }
        if let Some(n) = self.reserve_bytes {
            controls.push((FileConfig::ReserveBytes, i64::from(n)));
        }
        if let Some(size) = self.size_hint {
            controls.push((FileConfig::SizeHint, size as i64));
        }
        controls
    }

    /// Applies the options the VFS handles to an open file.
    ///
    /// Options the file does not support are skipped, as the engine does
    /// with `SQLITE_NOTFOUND`.
    pub fn apply(&self, file: &mut dyn VfsFile) -> Result<()> {
        if let Some(timeout) = self.lock_timeout {
            ignore_not_found(file.set_lock_timeout(timeout).map(|_| ()))?;
        }
        if let Some(persist) = self.persist_wal {
            file.set_wal_persistent(persist);
        }
        if let Some(psow) = self.powersafe_overwrite {
            ignore_not_found(file.set_powersafe_overwrite(psow))?;
        }
        if let Some(size) = self.chunk_size {
            ignore_not_found(file.set_chunk_size(size))?;
        }
        if let Some(size) = self.size_hint {
            ignore_not_found(file.hint_size(size))?;
        }
        Ok(())
    }
}

fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(err) if err.extended_code() == ffi::SQLITE_NOTFOUND => Ok(()),
        other => other,
    }
}

/// How the OS VFS locks database files.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum Locking {
    /// Byte-range locks: OFD locks on Linux and macOS, POSIX locks on other
    /// Unix systems, `LockFileEx` on Windows.
    #[default]
    Native,
    /// A `<name>.lock` directory per database, with readers counted in
    /// process. For filesystems without working advisory locks.
    DotFile,
    /// No locking at all. Only safe with a single connection.
    None,
}

/// How the OS VFS backs the WAL-index.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum SharedMemoryMode {
    /// Map the `-shm` file into sandbox memory.
    Mapped,
    /// Share buffers in process and copy through a shadow.
    Shadow,
    /// No WAL support.
    Disabled,
}

impl Default for SharedMemoryMode {
    fn default() -> Self {
        if cfg!(any(target_os = "linux", target_os = "macos")) {
            SharedMemoryMode::Mapped
        } else {
            SharedMemoryMode::Shadow
        }
    }
}

/// Configuration of the OS VFS.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VfsConfig {
    /// File locking strategy.
    pub locking: Locking,
    /// WAL-index strategy.
    pub shared_memory: SharedMemoryMode,
}

impl VfsConfig {
    /// Uses dot-file locking, which also requires shadowed shared memory.
    #[must_use]
    pub fn dot_file() -> Self {
        VfsConfig {
            locking: Locking::DotFile,
            shared_memory: SharedMemoryMode::Shadow,
        }
    }

    /// The effective shared memory mode: mapping a `-shm` file needs native
    /// locks on it.
    #[must_use]
    pub fn shared_memory(&self) -> SharedMemoryMode {
        match (self.locking, self.shared_memory) {
            (Locking::DotFile, SharedMemoryMode::Mapped) => SharedMemoryMode::Shadow,
            (_, SharedMemoryMode::Mapped) if !cfg!(unix) => SharedMemoryMode::Shadow,
            (_, mode) => mode,
        }
    }
}

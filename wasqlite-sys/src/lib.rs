#![allow(non_snake_case, non_camel_case_types)]
//! Constants of the SQLite C ABI as seen from outside a WebAssembly build of
//! the engine.
//!
//! The engine lives in a sandbox; nothing here is linked. Values mirror
//! `sqlite3.h` so host code can speak the engine's numeric protocol.

pub use self::error::*;

use std::ffi::c_int;

mod error;

/// A pointer into the sandbox linear memory.
pub type ptr_t = u32;

pub const SQLITE_OK: c_int = 0;
pub const SQLITE_ERROR: c_int = 1;
pub const SQLITE_INTERNAL: c_int = 2;
pub const SQLITE_PERM: c_int = 3;
pub const SQLITE_ABORT: c_int = 4;
pub const SQLITE_BUSY: c_int = 5;
pub const SQLITE_LOCKED: c_int = 6;
pub const SQLITE_NOMEM: c_int = 7;
pub const SQLITE_READONLY: c_int = 8;
pub const SQLITE_INTERRUPT: c_int = 9;
pub const SQLITE_IOERR: c_int = 10;
pub const SQLITE_CORRUPT: c_int = 11;
pub const SQLITE_NOTFOUND: c_int = 12;
pub const SQLITE_FULL: c_int = 13;
pub const SQLITE_CANTOPEN: c_int = 14;
pub const SQLITE_PROTOCOL: c_int = 15;
pub const SQLITE_EMPTY: c_int = 16;
pub const SQLITE_SCHEMA: c_int = 17;
pub const SQLITE_TOOBIG: c_int = 18;
pub const SQLITE_CONSTRAINT: c_int = 19;
pub const SQLITE_MISMATCH: c_int = 20;
pub const SQLITE_MISUSE: c_int = 21;
pub const SQLITE_NOLFS: c_int = 22;
pub const SQLITE_AUTH: c_int = 23;
pub const SQLITE_FORMAT: c_int = 24;
pub const SQLITE_RANGE: c_int = 25;
pub const SQLITE_NOTADB: c_int = 26;
pub const SQLITE_NOTICE: c_int = 27;
pub const SQLITE_WARNING: c_int = 28;

pub const SQLITE_OK_SYMLINK: c_int = SQLITE_OK | (2 << 8);

pub const SQLITE_IOERR_READ: c_int = SQLITE_IOERR | (1 << 8);
pub const SQLITE_IOERR_SHORT_READ: c_int = SQLITE_IOERR | (2 << 8);
pub const SQLITE_IOERR_WRITE: c_int = SQLITE_IOERR | (3 << 8);
pub const SQLITE_IOERR_FSYNC: c_int = SQLITE_IOERR | (4 << 8);
pub const SQLITE_IOERR_DIR_FSYNC: c_int = SQLITE_IOERR | (5 << 8);
pub const SQLITE_IOERR_TRUNCATE: c_int = SQLITE_IOERR | (6 << 8);
pub const SQLITE_IOERR_FSTAT: c_int = SQLITE_IOERR | (7 << 8);
pub const SQLITE_IOERR_UNLOCK: c_int = SQLITE_IOERR | (8 << 8);
pub const SQLITE_IOERR_RDLOCK: c_int = SQLITE_IOERR | (9 << 8);
pub const SQLITE_IOERR_DELETE: c_int = SQLITE_IOERR | (10 << 8);
pub const SQLITE_IOERR_BLOCKED: c_int = SQLITE_IOERR | (11 << 8);
pub const SQLITE_IOERR_NOMEM: c_int = SQLITE_IOERR | (12 << 8);
pub const SQLITE_IOERR_ACCESS: c_int = SQLITE_IOERR | (13 << 8);
pub const SQLITE_IOERR_CHECKRESERVEDLOCK: c_int = SQLITE_IOERR | (14 << 8);
pub const SQLITE_IOERR_LOCK: c_int = SQLITE_IOERR | (15 << 8);
pub const SQLITE_IOERR_CLOSE: c_int = SQLITE_IOERR | (16 << 8);
pub const SQLITE_IOERR_DIR_CLOSE: c_int = SQLITE_IOERR | (17 << 8);
pub const SQLITE_IOERR_SHMOPEN: c_int = SQLITE_IOERR | (18 << 8);
pub const SQLITE_IOERR_SHMSIZE: c_int = SQLITE_IOERR | (19 << 8);
pub const SQLITE_IOERR_SHMLOCK: c_int = SQLITE_IOERR | (20 << 8);
pub const SQLITE_IOERR_SHMMAP: c_int = SQLITE_IOERR | (21 << 8);
pub const SQLITE_IOERR_SEEK: c_int = SQLITE_IOERR | (22 << 8);
pub const SQLITE_IOERR_DELETE_NOENT: c_int = SQLITE_IOERR | (23 << 8);
pub const SQLITE_IOERR_MMAP: c_int = SQLITE_IOERR | (24 << 8);
pub const SQLITE_IOERR_GETTEMPPATH: c_int = SQLITE_IOERR | (25 << 8);
pub const SQLITE_IOERR_CONVPATH: c_int = SQLITE_IOERR | (26 << 8);
pub const SQLITE_IOERR_VNODE: c_int = SQLITE_IOERR | (27 << 8);
pub const SQLITE_IOERR_AUTH: c_int = SQLITE_IOERR | (28 << 8);
pub const SQLITE_IOERR_BEGIN_ATOMIC: c_int = SQLITE_IOERR | (29 << 8);
pub const SQLITE_IOERR_COMMIT_ATOMIC: c_int = SQLITE_IOERR | (30 << 8);
pub const SQLITE_IOERR_ROLLBACK_ATOMIC: c_int = SQLITE_IOERR | (31 << 8);
pub const SQLITE_IOERR_DATA: c_int = SQLITE_IOERR | (32 << 8);
pub const SQLITE_IOERR_CORRUPTFS: c_int = SQLITE_IOERR | (33 << 8);

pub const SQLITE_LOCKED_SHAREDCACHE: c_int = SQLITE_LOCKED | (1 << 8);
pub const SQLITE_BUSY_RECOVERY: c_int = SQLITE_BUSY | (1 << 8);
pub const SQLITE_BUSY_SNAPSHOT: c_int = SQLITE_BUSY | (2 << 8);
pub const SQLITE_BUSY_TIMEOUT: c_int = SQLITE_BUSY | (3 << 8);
pub const SQLITE_CANTOPEN_NOTEMPDIR: c_int = SQLITE_CANTOPEN | (1 << 8);
pub const SQLITE_CANTOPEN_ISDIR: c_int = SQLITE_CANTOPEN | (2 << 8);
pub const SQLITE_CANTOPEN_FULLPATH: c_int = SQLITE_CANTOPEN | (3 << 8);
pub const SQLITE_CANTOPEN_CONVPATH: c_int = SQLITE_CANTOPEN | (4 << 8);
pub const SQLITE_CANTOPEN_SYMLINK: c_int = SQLITE_CANTOPEN | (6 << 8);
pub const SQLITE_READONLY_RECOVERY: c_int = SQLITE_READONLY | (1 << 8);
pub const SQLITE_READONLY_CANTLOCK: c_int = SQLITE_READONLY | (2 << 8);
pub const SQLITE_READONLY_ROLLBACK: c_int = SQLITE_READONLY | (3 << 8);
pub const SQLITE_READONLY_DBMOVED: c_int = SQLITE_READONLY | (4 << 8);
pub const SQLITE_READONLY_CANTINIT: c_int = SQLITE_READONLY | (5 << 8);
pub const SQLITE_ABORT_ROLLBACK: c_int = SQLITE_ABORT | (2 << 8);

pub const SQLITE_OPEN_READONLY: c_int = 0x0000_0001;
pub const SQLITE_OPEN_READWRITE: c_int = 0x0000_0002;
pub const SQLITE_OPEN_CREATE: c_int = 0x0000_0004;
pub const SQLITE_OPEN_DELETEONCLOSE: c_int = 0x0000_0008;
pub const SQLITE_OPEN_EXCLUSIVE: c_int = 0x0000_0010;
pub const SQLITE_OPEN_AUTOPROXY: c_int = 0x0000_0020;
pub const SQLITE_OPEN_URI: c_int = 0x0000_0040;
pub const SQLITE_OPEN_MEMORY: c_int = 0x0000_0080;
pub const SQLITE_OPEN_MAIN_DB: c_int = 0x0000_0100;
pub const SQLITE_OPEN_TEMP_DB: c_int = 0x0000_0200;
pub const SQLITE_OPEN_TRANSIENT_DB: c_int = 0x0000_0400;
pub const SQLITE_OPEN_MAIN_JOURNAL: c_int = 0x0000_0800;
pub const SQLITE_OPEN_TEMP_JOURNAL: c_int = 0x0000_1000;
pub const SQLITE_OPEN_SUBJOURNAL: c_int = 0x0000_2000;
pub const SQLITE_OPEN_SUPER_JOURNAL: c_int = 0x0000_4000;
pub const SQLITE_OPEN_NOMUTEX: c_int = 0x0000_8000;
pub const SQLITE_OPEN_FULLMUTEX: c_int = 0x0001_0000;
pub const SQLITE_OPEN_SHAREDCACHE: c_int = 0x0002_0000;
pub const SQLITE_OPEN_PRIVATECACHE: c_int = 0x0004_0000;
pub const SQLITE_OPEN_WAL: c_int = 0x0008_0000;
pub const SQLITE_OPEN_NOFOLLOW: c_int = 0x0100_0000;
pub const SQLITE_OPEN_EXRESCODE: c_int = 0x0200_0000;

pub const SQLITE_ACCESS_EXISTS: c_int = 0;
pub const SQLITE_ACCESS_READWRITE: c_int = 1;
pub const SQLITE_ACCESS_READ: c_int = 2;

pub const SQLITE_SYNC_NORMAL: c_int = 0x00002;
pub const SQLITE_SYNC_FULL: c_int = 0x00003;
pub const SQLITE_SYNC_DATAONLY: c_int = 0x00010;

pub const SQLITE_LOCK_NONE: c_int = 0;
pub const SQLITE_LOCK_SHARED: c_int = 1;
pub const SQLITE_LOCK_RESERVED: c_int = 2;
pub const SQLITE_LOCK_PENDING: c_int = 3;
pub const SQLITE_LOCK_EXCLUSIVE: c_int = 4;

pub const SQLITE_SHM_UNLOCK: c_int = 1;
pub const SQLITE_SHM_LOCK: c_int = 2;
pub const SQLITE_SHM_SHARED: c_int = 4;
pub const SQLITE_SHM_EXCLUSIVE: c_int = 8;
pub const SQLITE_SHM_NLOCK: c_int = 8;

pub const SQLITE_IOCAP_ATOMIC: c_int = 0x0000_0001;
pub const SQLITE_IOCAP_ATOMIC512: c_int = 0x0000_0002;
pub const SQLITE_IOCAP_ATOMIC1K: c_int = 0x0000_0004;
pub const SQLITE_IOCAP_ATOMIC2K: c_int = 0x0000_0008;
pub const SQLITE_IOCAP_ATOMIC4K: c_int = 0x0000_0010;
pub const SQLITE_IOCAP_ATOMIC8K: c_int = 0x0000_0020;
pub const SQLITE_IOCAP_ATOMIC16K: c_int = 0x0000_0040;
pub const SQLITE_IOCAP_ATOMIC32K: c_int = 0x0000_0080;
pub const SQLITE_IOCAP_ATOMIC64K: c_int = 0x0000_0100;
pub const SQLITE_IOCAP_SAFE_APPEND: c_int = 0x0000_0200;
pub const SQLITE_IOCAP_SEQUENTIAL: c_int = 0x0000_0400;
pub const SQLITE_IOCAP_UNDELETABLE_WHEN_OPEN: c_int = 0x0000_0800;
pub const SQLITE_IOCAP_POWERSAFE_OVERWRITE: c_int = 0x0000_1000;
pub const SQLITE_IOCAP_IMMUTABLE: c_int = 0x0000_2000;
pub const SQLITE_IOCAP_BATCH_ATOMIC: c_int = 0x0000_4000;
pub const SQLITE_IOCAP_SUBPAGE_READ: c_int = 0x0000_8000;

pub const SQLITE_FCNTL_LOCKSTATE: c_int = 1;
pub const SQLITE_FCNTL_GET_LOCKPROXYFILE: c_int = 2;
pub const SQLITE_FCNTL_SET_LOCKPROXYFILE: c_int = 3;
pub const SQLITE_FCNTL_LAST_ERRNO: c_int = 4;
pub const SQLITE_FCNTL_SIZE_HINT: c_int = 5;
pub const SQLITE_FCNTL_CHUNK_SIZE: c_int = 6;
pub const SQLITE_FCNTL_FILE_POINTER: c_int = 7;
pub const SQLITE_FCNTL_SYNC_OMITTED: c_int = 8;
pub const SQLITE_FCNTL_WIN32_AV_RETRY: c_int = 9;
pub const SQLITE_FCNTL_PERSIST_WAL: c_int = 10;
pub const SQLITE_FCNTL_OVERWRITE: c_int = 11;
pub const SQLITE_FCNTL_VFSNAME: c_int = 12;
pub const SQLITE_FCNTL_POWERSAFE_OVERWRITE: c_int = 13;
pub const SQLITE_FCNTL_PRAGMA: c_int = 14;
pub const SQLITE_FCNTL_BUSYHANDLER: c_int = 15;
pub const SQLITE_FCNTL_TEMPFILENAME: c_int = 16;
pub const SQLITE_FCNTL_MMAP_SIZE: c_int = 18;
pub const SQLITE_FCNTL_TRACE: c_int = 19;
pub const SQLITE_FCNTL_HAS_MOVED: c_int = 20;
pub const SQLITE_FCNTL_SYNC: c_int = 21;
pub const SQLITE_FCNTL_COMMIT_PHASETWO: c_int = 22;
pub const SQLITE_FCNTL_WIN32_SET_HANDLE: c_int = 23;
pub const SQLITE_FCNTL_WAL_BLOCK: c_int = 24;
pub const SQLITE_FCNTL_ZIPVFS: c_int = 25;
pub const SQLITE_FCNTL_RBU: c_int = 26;
pub const SQLITE_FCNTL_VFS_POINTER: c_int = 27;
pub const SQLITE_FCNTL_JOURNAL_POINTER: c_int = 28;
pub const SQLITE_FCNTL_WIN32_GET_HANDLE: c_int = 29;
pub const SQLITE_FCNTL_PDB: c_int = 30;
pub const SQLITE_FCNTL_BEGIN_ATOMIC_WRITE: c_int = 31;
pub const SQLITE_FCNTL_COMMIT_ATOMIC_WRITE: c_int = 32;
pub const SQLITE_FCNTL_ROLLBACK_ATOMIC_WRITE: c_int = 33;
pub const SQLITE_FCNTL_LOCK_TIMEOUT: c_int = 34;
pub const SQLITE_FCNTL_DATA_VERSION: c_int = 35;
pub const SQLITE_FCNTL_SIZE_LIMIT: c_int = 36;
pub const SQLITE_FCNTL_CKPT_DONE: c_int = 37;
pub const SQLITE_FCNTL_RESERVE_BYTES: c_int = 38;
pub const SQLITE_FCNTL_CKPT_START: c_int = 39;
pub const SQLITE_FCNTL_EXTERNAL_READER: c_int = 40;
pub const SQLITE_FCNTL_CKSM_FILE: c_int = 41;
pub const SQLITE_FCNTL_RESET_CACHE: c_int = 42;
pub const SQLITE_FCNTL_NULL_IO: c_int = 43;
pub const SQLITE_FCNTL_BLOCK_ON_CONNECT: c_int = 44;

/// Longest path the VFS reports through `mxPathname`.
pub const SQLITE_MAX_PATHNAME: usize = 512;

/// Offset of the name pointer inside `sqlite3_vfs`, as laid out by the
/// 32-bit engine.
pub const SQLITE_VFS_NAME_OFFSET: u32 = 16;

/// Offset of the host file id inside the engine's `sqlite3_file` subclass.
pub const SQLITE_FILE_ID_OFFSET: u32 = 4;

/// Size of the `struct tm` the engine passes to `go_localtime`.
pub const SQLITE_TM_SIZE: u32 = 9 * 4;

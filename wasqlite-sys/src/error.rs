use core::error;
use core::ffi::c_int;
use core::fmt;

/// Error Codes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCode {
    /// Internal logic error in SQLite
    InternalMalfunction,
    /// Access permission denied
    PermissionDenied,
    /// Callback routine requested an abort
    OperationAborted,
    /// The database file is locked
    DatabaseBusy,
    /// A table in the database is locked
    DatabaseLocked,
    /// A `malloc()` failed
    OutOfMemory,
    /// Attempt to write a readonly database
    ReadOnly,
    /// Operation terminated by `sqlite3_interrupt()`
    OperationInterrupted,
    /// Some kind of disk I/O error occurred
    SystemIoFailure,
    /// The database disk image is malformed
    DatabaseCorrupt,
    /// Unknown opcode in `sqlite3_file_control()`
    NotFound,
    /// Insertion failed because database is full
    DiskFull,
    /// Unable to open the database file
    CannotOpen,
    /// Database lock protocol error
    FileLockingProtocolFailed,
    /// The database schema changed
    SchemaChanged,
    /// String or BLOB exceeds size limit
    TooBig,
    /// Abort due to constraint violation
    ConstraintViolation,
    /// Data type mismatch
    TypeMismatch,
    /// Library used incorrectly
    ApiMisuse,
    /// Uses OS features not supported on host
    NoLargeFileSupport,
    /// Authorization denied
    AuthorizationForStatementDenied,
    /// 2nd parameter to `sqlite3_bind` out of range
    ParameterOutOfRange,
    /// File opened that is not a database file
    NotADatabase,
    /// SQL error or missing database
    Unknown,
}

/// A result code as the engine understands it.
///
/// `code` is the primary class (`extended_code & 0xff`); `extended_code` is
/// what crosses the sandbox boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Error {
    pub code: ErrorCode,
    pub extended_code: c_int,
}

impl Error {
    #[must_use]
    pub fn new(result_code: c_int) -> Self {
        let code = match result_code & 0xff {
            super::SQLITE_INTERNAL => ErrorCode::InternalMalfunction,
            super::SQLITE_PERM => ErrorCode::PermissionDenied,
            super::SQLITE_ABORT => ErrorCode::OperationAborted,
            super::SQLITE_BUSY => ErrorCode::DatabaseBusy,
            super::SQLITE_LOCKED => ErrorCode::DatabaseLocked,
            super::SQLITE_NOMEM => ErrorCode::OutOfMemory,
            super::SQLITE_READONLY => ErrorCode::ReadOnly,
            super::SQLITE_INTERRUPT => ErrorCode::OperationInterrupted,
            super::SQLITE_IOERR => ErrorCode::SystemIoFailure,
            super::SQLITE_CORRUPT => ErrorCode::DatabaseCorrupt,
            super::SQLITE_NOTFOUND => ErrorCode::NotFound,
            super::SQLITE_FULL => ErrorCode::DiskFull,
            super::SQLITE_CANTOPEN => ErrorCode::CannotOpen,
            super::SQLITE_PROTOCOL => ErrorCode::FileLockingProtocolFailed,
            super::SQLITE_SCHEMA => ErrorCode::SchemaChanged,
            super::SQLITE_TOOBIG => ErrorCode::TooBig,
            super::SQLITE_CONSTRAINT => ErrorCode::ConstraintViolation,
            super::SQLITE_MISMATCH => ErrorCode::TypeMismatch,
            super::SQLITE_MISUSE => ErrorCode::ApiMisuse,
            super::SQLITE_NOLFS => ErrorCode::NoLargeFileSupport,
            super::SQLITE_AUTH => ErrorCode::AuthorizationForStatementDenied,
            super::SQLITE_RANGE => ErrorCode::ParameterOutOfRange,
            super::SQLITE_NOTADB => ErrorCode::NotADatabase,
            _ => ErrorCode::Unknown,
        };

        Self {
            code,
            extended_code: result_code,
        }
    }

    /// The primary result code, without the extended bits.
    #[must_use]
    pub fn primary_code(&self) -> c_int {
        self.extended_code & 0xff
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Error code {}: {}",
            self.extended_code,
            code_to_str(self.extended_code)
        )
    }
}

impl error::Error for Error {}

/// Describes a result code the way `sqlite3_errstr` would.
#[must_use]
pub fn code_to_str(code: c_int) -> &'static str {
    match code {
        super::SQLITE_OK_SYMLINK => return "not an error (symlink)",
        super::SQLITE_IOERR_SHORT_READ => return "short read",
        super::SQLITE_IOERR_DATA => return "checksum mismatch",
        super::SQLITE_IOERR_DELETE_NOENT => return "no such file to delete",
        super::SQLITE_CANTOPEN_FULLPATH => return "path name too long",
        super::SQLITE_BUSY_RECOVERY => return "recovery in progress",
        super::SQLITE_BUSY_SNAPSHOT => return "snapshot out of date",
        super::SQLITE_BUSY_TIMEOUT => return "lock wait timed out",
        super::SQLITE_ABORT_ROLLBACK => return "abort due to ROLLBACK",
        _ => {}
    }
    match code & 0xff {
        super::SQLITE_OK => "not an error",
        super::SQLITE_ERROR => "SQL logic error",
        super::SQLITE_INTERNAL => "internal error",
        super::SQLITE_PERM => "access permission denied",
        super::SQLITE_ABORT => "query aborted",
        super::SQLITE_BUSY => "database is locked",
        super::SQLITE_LOCKED => "database table is locked",
        super::SQLITE_NOMEM => "out of memory",
        super::SQLITE_READONLY => "attempt to write a readonly database",
        super::SQLITE_INTERRUPT => "interrupted",
        super::SQLITE_IOERR => "disk I/O error",
        super::SQLITE_CORRUPT => "database disk image is malformed",
        super::SQLITE_NOTFOUND => "unknown operation",
        super::SQLITE_FULL => "database or disk is full",
        super::SQLITE_CANTOPEN => "unable to open database file",
        super::SQLITE_PROTOCOL => "locking protocol",
        super::SQLITE_SCHEMA => "database schema has changed",
        super::SQLITE_TOOBIG => "string or blob too big",
        super::SQLITE_CONSTRAINT => "constraint failed",
        super::SQLITE_MISMATCH => "datatype mismatch",
        super::SQLITE_MISUSE => "bad parameter or other API misuse",
        super::SQLITE_NOLFS => "large file support is disabled",
        super::SQLITE_AUTH => "authorization denied",
        super::SQLITE_RANGE => "column index out of range",
        super::SQLITE_NOTADB => "file is not a database",
        super::SQLITE_NOTICE => "notification message",
        super::SQLITE_WARNING => "warning message",
        _ => "unknown error",
    }
}

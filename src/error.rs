use crate::ffi;
use std::error;
use std::ffi::c_int;
use std::fmt;
use std::io;

/// Enum listing possible errors from the VFS layer.
///
/// Only the numeric code ever reaches the engine; the rest is kept for host
/// diagnostics.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// An engine result code, with an optional description of what went
    /// wrong.
    SqliteFailure(ffi::Error, Option<String>),

    /// An operating system error narrowed to an engine result code.
    SystemIoFailure(ffi::Error, io::Error),
}

impl Error {
    /// Creates an error carrying a bare result code.
    #[must_use]
    pub fn new(code: c_int) -> Self {
        Self::SqliteFailure(ffi::Error::new(code), None)
    }

    /// Creates an error carrying a result code and a message.
    #[must_use]
    pub fn with_message(code: c_int, message: impl Into<String>) -> Self {
        Self::SqliteFailure(ffi::Error::new(code), Some(message.into()))
    }

    /// Wraps an OS error, reporting `code` to the engine.
    #[must_use]
    pub fn io(code: c_int, err: io::Error) -> Self {
        Self::SystemIoFailure(ffi::Error::new(code), err)
    }

    /// An assertion about the caller's behavior did not hold.
    #[must_use]
    pub fn misuse(message: &'static str) -> Self {
        Self::with_message(ffi::SQLITE_MISUSE, message)
    }

    /// Returns the underlying engine error.
    #[inline]
    #[must_use]
    pub fn sqlite_error(&self) -> &ffi::Error {
        match self {
            Self::SqliteFailure(error, _) | Self::SystemIoFailure(error, _) => error,
        }
    }

    /// Returns the primary error class.
    #[inline]
    #[must_use]
    pub fn sqlite_error_code(&self) -> ffi::ErrorCode {
        self.sqlite_error().code
    }

    /// Returns the code handed to the engine.
    #[inline]
    #[must_use]
    pub fn extended_code(&self) -> c_int {
        self.sqlite_error().extended_code
    }

    /// True for contention that the engine's busy handler retries.
    #[inline]
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.sqlite_error_code() == ffi::ErrorCode::DatabaseBusy
    }

    /// Replaces the reported code, keeping the diagnostics.
    #[must_use]
    pub(crate) fn recode(self, code: c_int) -> Self {
        match self {
            Self::SqliteFailure(_, msg) => Self::SqliteFailure(ffi::Error::new(code), msg),
            Self::SystemIoFailure(_, err) => Self::SystemIoFailure(ffi::Error::new(code), err),
        }
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.extended_code() == other.extended_code()
    }
}

impl From<ffi::Error> for Error {
    #[cold]
    fn from(err: ffi::Error) -> Self {
        Self::SqliteFailure(err, None)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::SqliteFailure(ref err, None) => err.fmt(f),
            Self::SqliteFailure(_, Some(ref s)) => write!(f, "{s}"),
            Self::SystemIoFailure(ref err, ref io) => write!(f, "{err}: {io}"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Self::SqliteFailure(ref err, None) => Some(err),
            Self::SqliteFailure(_, Some(_)) => None,
            Self::SystemIoFailure(_, ref err) => Some(err),
        }
    }
}

/// Narrows a result to the code returned across the sandbox boundary.
pub trait IntoResultCodeExt {
    /// `SQLITE_OK` on success, the extended code otherwise.
    fn into_rc(self) -> c_int;
}

impl IntoResultCodeExt for Result<(), Error> {
    fn into_rc(self) -> c_int {
        match self {
            Ok(()) => ffi::SQLITE_OK,
            Err(err) => {
                if !err.is_busy() {
                    log::debug!("{err}");
                }
                err.extended_code()
            }
        }
    }
}

/// Adds a result code to OS errors.
pub(crate) trait IoResultExt<T> {
    fn or_code(self, code: c_int) -> Result<T, Error>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    #[inline]
    fn or_code(self, code: c_int) -> Result<T, Error> {
        self.map_err(|err| Error::io(code, err))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = Error::io(ffi::SQLITE_IOERR_READ, io::ErrorKind::UnexpectedEof.into());
        assert_eq!(err.extended_code(), ffi::SQLITE_IOERR_READ);
        assert_eq!(err.sqlite_error_code(), ffi::ErrorCode::SystemIoFailure);
        assert!(error::Error::source(&err).is_some());
        assert!(err.to_string().starts_with("Error code 266"));

        let err = Error::new(ffi::SQLITE_BUSY);
        assert!(err.is_busy());
        assert_eq!(Err::<(), _>(err).into_rc(), ffi::SQLITE_BUSY);
        assert_eq!(Ok::<(), Error>(()).into_rc(), ffi::SQLITE_OK);
    }

    #[test]
    fn test_recode_keeps_source() {
        let err = Error::io(ffi::SQLITE_IOERR_LOCK, io::ErrorKind::Other.into());
        let err = err.recode(ffi::SQLITE_IOERR_RDLOCK);
        assert_eq!(err.extended_code(), ffi::SQLITE_IOERR_RDLOCK);
        assert!(matches!(err, Error::SystemIoFailure(..)));

        let err = Error::misuse("bad lock level");
        assert_eq!(err.extended_code(), ffi::SQLITE_MISUSE);
        assert_eq!(err.to_string(), "bad lock level");
    }
}

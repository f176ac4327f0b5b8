use std::ffi::c_int;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::windows::fs::FileExt;
use std::os::windows::io::AsRawHandle;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use windows_sys::Win32::Foundation::{
    ERROR_IO_PENDING, ERROR_LOCK_VIOLATION, ERROR_NOT_LOCKED, ERROR_SHARING_VIOLATION, HANDLE,
};
use windows_sys::Win32::Storage::FileSystem::{
    LockFileEx, UnlockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
};
use windows_sys::Win32::System::IO::OVERLAPPED;

use crate::error::Error;
use crate::ffi;
use crate::vfs::lock::RangeLock;
use crate::vfs::{OpenFlags, Result, SyncOptions};

pub(crate) fn open(path: &Path, flags: OpenFlags, create_new: bool) -> io::Result<File> {
    // No O_NOFOLLOW; refuse links up front.
    if flags.contains(OpenFlags::NOFOLLOW)
        && fs::symlink_metadata(path).is_ok_and(|m| m.file_type().is_symlink())
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "refusing to open a symbolic link",
        ));
    }
    let mut options = OpenOptions::new();
    options.read(true);
    if !flags.contains(OpenFlags::READONLY) {
        options.write(true);
    }
    if create_new {
        options.create_new(true);
    } else if flags.contains(OpenFlags::CREATE) {
        if flags.contains(OpenFlags::EXCLUSIVE) {
            options.create_new(true);
        } else {
            options.create(true);
        }
    }
    options.open(path)
}

pub(crate) fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    file.seek_read(buf, offset)
}

pub(crate) fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

pub(crate) fn sync(file: &File, options: SyncOptions) -> io::Result<()> {
    if options.data_only {
        file.sync_data()
    } else {
        file.sync_all()
    }
}

pub(crate) fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

pub(crate) fn allocate(file: &File, size: u64) -> io::Result<()> {
    if file.metadata()?.len() < size {
        file.set_len(size)?;
    }
    Ok(())
}

/// Best effort: there is no cheap file identity to compare, so only checks
/// that the path still exists and looks like the same file.
pub(crate) fn same_file(file: &File, path: &Path) -> io::Result<bool> {
    let open = file.metadata()?;
    let named = fs::metadata(path)?;
    Ok(open.len() == named.len() && open.created().ok() == named.created().ok())
}

fn overlapped(start: u64) -> OVERLAPPED {
    // SAFETY: all-zero is a valid OVERLAPPED.
    let mut ov: OVERLAPPED = unsafe { std::mem::zeroed() };
    ov.Anonymous.Anonymous.Offset = start as u32;
    ov.Anonymous.Anonymous.OffsetHigh = (start >> 32) as u32;
    ov
}

fn lock_file(file: &File, flags: u32, start: u64, len: u64) -> io::Result<()> {
    let mut ov = overlapped(start);
    // SAFETY: the handle is open for the duration of the call.
    let ok = unsafe {
        LockFileEx(
            file.as_raw_handle() as HANDLE,
            flags,
            0,
            len as u32,
            (len >> 32) as u32,
            &mut ov,
        )
    };
    if ok == 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn set_lock(file: &File, exclusive: bool, start: u64, len: u64, timeout: Option<Duration>) -> io::Result<()> {
    let mut flags = if exclusive { LOCKFILE_EXCLUSIVE_LOCK } else { 0 };
    let Some(timeout) = timeout else {
        return lock_file(file, flags, start, len);
    };
    flags |= LOCKFILE_FAIL_IMMEDIATELY;
    let deadline = Instant::now() + timeout;
    loop {
        let err = match lock_file(file, flags, start, len) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        if !is_contention(&err) || Instant::now() >= deadline {
            return Err(err);
        }
        thread::sleep(Duration::from_millis(1));
    }
}

fn is_contention(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error().map(|e| e as u32),
        Some(ERROR_LOCK_VIOLATION | ERROR_IO_PENDING | ERROR_SHARING_VIOLATION)
    )
}

fn lock_error(err: io::Error, code: c_int) -> Error {
    if is_contention(&err) {
        Error::io(ffi::SQLITE_BUSY, err)
    } else {
        Error::io(code, err)
    }
}

impl RangeLock for File {
    fn read_lock(&self, start: u64, len: u64, timeout: Option<Duration>) -> Result<()> {
        set_lock(self, false, start, len, timeout)
            .map_err(|err| lock_error(err, ffi::SQLITE_IOERR_RDLOCK))
    }

    fn write_lock(&self, start: u64, len: u64, timeout: Option<Duration>) -> Result<()> {
        set_lock(self, true, start, len, timeout)
            .map_err(|err| lock_error(err, ffi::SQLITE_IOERR_LOCK))
    }

    fn unlock(&self, start: u64, len: u64) -> Result<()> {
        let len = if len == 0 { u64::MAX - start } else { len };
        let mut ov = overlapped(start);
        // SAFETY: the handle is open for the duration of the call.
        let ok = unsafe {
            UnlockFileEx(
                self.as_raw_handle() as HANDLE,
                0,
                len as u32,
                (len >> 32) as u32,
                &mut ov,
            )
        };
        if ok != 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error().map(|e| e as u32) == Some(ERROR_NOT_LOCKED) {
            return Ok(());
        }
        Err(Error::io(ffi::SQLITE_IOERR_UNLOCK, err))
    }

    fn check_lock(&self, start: u64, len: u64) -> Result<bool> {
        // Probe with a shared lock; an exclusive holder makes it fail.
        match set_lock(self, false, start, len, Some(Duration::ZERO)) {
            Ok(()) => {
                self.unlock(start, len)?;
                Ok(false)
            }
            Err(err) if is_contention(&err) => Ok(true),
            Err(err) => Err(Error::io(ffi::SQLITE_IOERR_CHECKRESERVEDLOCK, err)),
        }
    }
}

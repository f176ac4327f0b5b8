use std::ffi::c_int;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::ffi;
use crate::vfs::lock::RangeLock;
use crate::vfs::{OpenFlags, Result, SyncOptions};

// Open file description locks belong to the open file, not the process, so
// two handles on the same file in one process exclude each other.
#[cfg(target_os = "linux")]
mod cmd {
    pub const SETLK: libc::c_int = libc::F_OFD_SETLK;
    pub const SETLKW: libc::c_int = libc::F_OFD_SETLKW;
    pub const GETLK: libc::c_int = libc::F_OFD_GETLK;
}

#[cfg(target_vendor = "apple")]
mod cmd {
    pub const SETLK: libc::c_int = 90;
    pub const SETLKW: libc::c_int = 91;
    pub const GETLK: libc::c_int = 92;
}

#[cfg(not(any(target_os = "linux", target_vendor = "apple")))]
mod cmd {
    pub const SETLK: libc::c_int = libc::F_SETLK;
    pub const SETLKW: libc::c_int = libc::F_SETLKW;
    pub const GETLK: libc::c_int = libc::F_GETLK;
}

pub(crate) fn open(path: &Path, flags: OpenFlags, create_new: bool) -> io::Result<File> {
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
    let mut custom = libc::O_CLOEXEC;
    if flags.contains(OpenFlags::NOFOLLOW) {
        custom |= libc::O_NOFOLLOW;
    }
    options.custom_flags(custom).mode(0o644).open(path)
}

pub(crate) fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    file.read_at(buf, offset)
}

pub(crate) fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    file.write_all_at(buf, offset)
}

pub(crate) fn sync(file: &File, options: SyncOptions) -> io::Result<()> {
    #[cfg(target_vendor = "apple")]
    {
        if options.full {
            return file.sync_all();
        }
        return cvt(unsafe { libc::fsync(file.as_raw_fd()) });
    }
    #[cfg(not(target_vendor = "apple"))]
    {
        if options.data_only {
            file.sync_data()
        } else {
            file.sync_all()
        }
    }
}

pub(crate) fn sync_dir(dir: &Path) -> io::Result<()> {
    let dir = File::open(dir)?;
    cvt(unsafe { libc::fsync(dir.as_raw_fd()) })
}

/// Grows the file to at least `size` bytes, reserving disk blocks where the
/// platform supports it.
pub(crate) fn allocate(file: &File, size: u64) -> io::Result<()> {
    let current = file.metadata()?.len();
    if current >= size {
        return Ok(());
    }
    #[cfg(target_vendor = "apple")]
    {
        let len = libc::off_t::try_from(size - current)
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let mut store = libc::fstore_t {
            fst_flags: libc::F_ALLOCATECONTIG | libc::F_ALLOCATEALL,
            fst_posmode: libc::F_PEOFPOSMODE,
            fst_offset: 0,
            fst_length: len,
            fst_bytesalloc: 0,
        };
        let fd = file.as_raw_fd();
        if cvt(unsafe { libc::fcntl(fd, libc::F_PREALLOCATE, &mut store as *mut libc::fstore_t) }).is_err() {
            // Too fragmented for one contiguous run.
            store.fst_flags = libc::F_ALLOCATEALL;
            cvt(unsafe { libc::fcntl(fd, libc::F_PREALLOCATE, &mut store as *mut libc::fstore_t) })?;
        }
    }
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let len = libc::off_t::try_from(size)
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let rc = unsafe { libc::fallocate(file.as_raw_fd(), 0, 0, len) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EOPNOTSUPP) {
            return Err(err);
        }
    }
    file.set_len(size)
}

/// Whether `path` still names the open file.
pub(crate) fn same_file(file: &File, path: &Path) -> io::Result<bool> {
    let open = file.metadata()?;
    let named = fs::metadata(path)?;
    Ok(open.dev() == named.dev() && open.ino() == named.ino())
}

fn cvt(rc: c_int) -> io::Result<()> {
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn flock(kind: c_int, start: u64, len: u64) -> io::Result<libc::flock> {
    let offset = |v: u64| {
        libc::off_t::try_from(v).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))
    };
    // SAFETY: all-zero is a valid flock.
    let mut lock: libc::flock = unsafe { std::mem::zeroed() };
    lock.l_type = kind as _;
    lock.l_whence = libc::SEEK_SET as _;
    lock.l_start = offset(start)?;
    lock.l_len = offset(len)?;
    Ok(lock)
}

fn set_lock(file: &File, kind: c_int, start: u64, len: u64, timeout: Option<Duration>) -> io::Result<()> {
    let lock = flock(kind, start, len)?;
    let fd = file.as_raw_fd();
    let Some(timeout) = timeout else {
        loop {
            match cvt(unsafe { libc::fcntl(fd, cmd::SETLKW, &lock as *const libc::flock) }) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    };
    let deadline = Instant::now() + timeout;
    loop {
        let err = match cvt(unsafe { libc::fcntl(fd, cmd::SETLK, &lock as *const libc::flock) }) {
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
        err.raw_os_error(),
        Some(libc::EACCES | libc::EAGAIN | libc::EINTR | libc::EBUSY | libc::ETIMEDOUT | libc::EDEADLK | libc::ENOLCK)
    )
}

fn lock_error(err: io::Error, code: c_int) -> Error {
    if is_contention(&err) {
        Error::io(ffi::SQLITE_BUSY, err)
    } else if err.raw_os_error() == Some(libc::EPERM) {
        Error::io(ffi::SQLITE_PERM, err)
    } else {
        Error::io(code, err)
    }
}

impl RangeLock for File {
    fn read_lock(&self, start: u64, len: u64, timeout: Option<Duration>) -> Result<()> {
        set_lock(self, libc::F_RDLCK as c_int, start, len, timeout)
            .map_err(|err| lock_error(err, ffi::SQLITE_IOERR_RDLOCK))
    }

    fn write_lock(&self, start: u64, len: u64, timeout: Option<Duration>) -> Result<()> {
        set_lock(self, libc::F_WRLCK as c_int, start, len, timeout)
            .map_err(|err| lock_error(err, ffi::SQLITE_IOERR_LOCK))
    }

    fn unlock(&self, start: u64, len: u64) -> Result<()> {
        set_lock(self, libc::F_UNLCK as c_int, start, len, Some(Duration::ZERO))
            .map_err(|err| Error::io(ffi::SQLITE_IOERR_UNLOCK, err))
    }

    fn check_lock(&self, start: u64, len: u64) -> Result<bool> {
        let check = || -> io::Result<bool> {
            let mut lock = flock(libc::F_RDLCK as c_int, start, len)?;
            cvt(unsafe { libc::fcntl(self.as_raw_fd(), cmd::GETLK, &mut lock as *mut libc::flock) })?;
            Ok(c_int::from(lock.l_type) != libc::F_UNLCK as c_int)
        };
        check().map_err(|err| Error::io(ffi::SQLITE_IOERR_CHECKRESERVEDLOCK, err))
    }
}

/// Shared mappings of a file into memory owned by someone else.
pub(crate) mod mmap {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    pub(crate) fn page_size() -> usize {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(size).unwrap_or(4096)
    }

    /// Replaces `len` bytes at `addr` with a shared mapping of the file.
    ///
    /// # Safety
    ///
    /// `addr..addr + len` must be page aligned memory the caller owns, and
    /// nothing may hold references into it.
    pub(crate) unsafe fn map_shared(addr: *mut u8, len: usize, file: &File, offset: u64) -> io::Result<()> {
        let offset = libc::off_t::try_from(offset)
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let ptr = libc::mmap(
            addr.cast(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            file.as_raw_fd(),
            offset,
        );
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Replaces a shared mapping with private zeroed memory, so the range
    /// can go back to its allocator.
    ///
    /// # Safety
    ///
    /// As for [`map_shared`].
    pub(crate) unsafe fn map_anonymous(addr: *mut u8, len: usize) -> io::Result<()> {
        let ptr = libc::mmap(
            addr.cast(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const NOW: Option<Duration> = Some(Duration::ZERO);

    #[test]
    fn test_ofd_locks_conflict_in_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks");
        let flags = OpenFlags::READWRITE | OpenFlags::CREATE;
        let f1 = open(&path, flags, false).unwrap();
        let f2 = open(&path, flags, false).unwrap();

        f1.read_lock(10, 5, NOW).unwrap();
        f2.read_lock(10, 5, NOW).unwrap();
        let err = f2.write_lock(12, 1, NOW).unwrap_err();
        assert!(err.is_busy(), "{err}");
        assert!(!f2.check_lock(10, 5).unwrap());

        RangeLock::unlock(&f1, 0, 0).unwrap();
        f2.write_lock(10, 5, NOW).unwrap();
        assert!(f1.check_lock(10, 5).unwrap());
        assert!(f1.read_lock(10, 1, Some(Duration::from_millis(5))).unwrap_err().is_busy());
    }

    #[test]
    fn test_allocate_never_shrinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alloc");
        let file = open(&path, OpenFlags::READWRITE | OpenFlags::CREATE, false).unwrap();
        allocate(&file, 8192).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 8192);
        allocate(&file, 100).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 8192);
        assert!(same_file(&file, &path).unwrap());
    }

    #[cfg(target_vendor = "apple")]
    #[test]
    fn test_allocate_preallocates_and_extends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prealloc");
        let file = open(&path, OpenFlags::READWRITE | OpenFlags::CREATE, false).unwrap();
        file.write_all_at(&[1; 100], 0).unwrap();
        allocate(&file, 1 << 20).unwrap();
        let meta = file.metadata().unwrap();
        assert_eq!(meta.len(), 1 << 20);
        allocate(&file, 4096).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 1 << 20);
        let mut buf = [0xff; 4];
        assert_eq!(read_at(&file, &mut buf, 100).unwrap(), 4);
        assert_eq!(buf, [0; 4]);
    }

    #[test]
    fn test_nofollow() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        let link = dir.path().join("link");
        std::fs::write(&target, b"x").unwrap();
        std::os::unix::fs::symlink(&target, &link).unwrap();
        assert!(open(&link, OpenFlags::READWRITE | OpenFlags::NOFOLLOW, false).is_err());
        assert!(open(&link, OpenFlags::READWRITE, false).is_ok());
    }
}

//! Immutable databases read from any positional reader.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::sync::Arc;

use crate::error::{Error, IoResultExt};
use crate::ffi;
use crate::vfs::{
    AccessFlag, FileType, Filename, FullPathname, IoCapabilities, LockLevel, OpenFile, OpenFlags,
    Result, SyncOptions, Vfs, VfsFile,
};

/// A source of bytes with a known size, read at arbitrary offsets.
///
/// Implementations must not change while a database is open over them;
/// the engine caches pages and would report corruption.
pub trait SizeReaderAt: Send + Sync {
    /// Total number of bytes.
    fn size(&self) -> io::Result<u64>;

    /// Reads into `buf` from `offset`, returning how many bytes were read.
    /// Fewer than requested only at the end.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
}

fn read_slice(data: &[u8], buf: &mut [u8], offset: u64) -> usize {
    let Ok(start) = usize::try_from(offset) else {
        return 0;
    };
    if start >= data.len() {
        return 0;
    }
    let n = buf.len().min(data.len() - start);
    buf[..n].copy_from_slice(&data[start..start + n]);
    n
}

impl SizeReaderAt for Vec<u8> {
    fn size(&self) -> io::Result<u64> {
        Ok(self.len() as u64)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        Ok(read_slice(self, buf, offset))
    }
}

impl SizeReaderAt for Arc<[u8]> {
    fn size(&self) -> io::Result<u64> {
        Ok(self.len() as u64)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        Ok(read_slice(self, buf, offset))
    }
}

impl SizeReaderAt for &'static [u8] {
    fn size(&self) -> io::Result<u64> {
        Ok(self.len() as u64)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        Ok(read_slice(self, buf, offset))
    }
}

impl SizeReaderAt for File {
    fn size(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        #[cfg(unix)]
        use crate::vfs::os::unix::read_at;
        #[cfg(windows)]
        use crate::vfs::os::windows::read_at;

        let mut n = 0;
        while n < buf.len() {
            match read_at(self, &mut buf[n..], offset + n as u64) {
                Ok(0) => break,
                Ok(k) => n += k,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(n)
    }
}

/// The `reader` VFS.
///
/// Serves the readers added with [`ReaderVfs::create`] as read-only main
/// databases. Temporary files the engine needs alongside them go to the
/// fallback VFS.
pub struct ReaderVfs {
    readers: RwLock<HashMap<String, Arc<dyn SizeReaderAt>>>,
    fallback: Arc<dyn Vfs>,
}

impl ReaderVfs {
    /// Creates an empty VFS, sending temporary files to `fallback`.
    pub fn new(fallback: Arc<dyn Vfs>) -> Self {
        Self {
            readers: RwLock::new(HashMap::new()),
            fallback,
        }
    }

    /// Adds a database named `name`, replacing any with the same name.
    pub fn create(&self, name: impl Into<String>, reader: impl SizeReaderAt + 'static) {
        self.readers.write().insert(name.into(), Arc::new(reader));
    }

    /// Removes a database. Connections that already have it open keep
    /// reading it.
    pub fn delete(&self, name: &str) {
        self.readers.write().remove(name);
    }
}

impl Vfs for ReaderVfs {
    fn open(&self, name: Option<&Filename>, flags: OpenFlags) -> Result<OpenFile> {
        let name = match name.filter(|n| !n.path().is_empty()) {
            Some(name) if !flags.contains(OpenFlags::DELETEONCLOSE) => name,
            name => return self.fallback.open(name, flags),
        };
        if flags.file_type() != Some(FileType::MainDb) {
            return Err(Error::new(ffi::SQLITE_CANTOPEN));
        }
        let reader = self
            .readers
            .read()
            .get(name.path())
            .cloned()
            .ok_or_else(|| Error::new(ffi::SQLITE_CANTOPEN))?;
        log::debug!("open reader {}", name.path());
        Ok(OpenFile::new(ReaderFile { reader, lock: LockLevel::None }, flags).readonly())
    }

    fn delete(&self, _name: &str, _sync_dir: bool) -> Result<()> {
        Err(Error::new(ffi::SQLITE_IOERR_DELETE))
    }

    fn access(&self, _name: &str, _flag: AccessFlag) -> Result<bool> {
        Err(Error::new(ffi::SQLITE_IOERR_ACCESS))
    }

    fn full_pathname(&self, name: &str) -> Result<FullPathname> {
        Ok(FullPathname::new(name))
    }
}

/// A read-only database file over a [`SizeReaderAt`].
pub struct ReaderFile {
    reader: Arc<dyn SizeReaderAt>,
    lock: LockLevel,
}

impl VfsFile for ReaderFile {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.reader
            .read_at(buf, offset)
            .or_code(ffi::SQLITE_IOERR_READ)
    }

    fn write_at(&mut self, _buf: &[u8], _offset: u64) -> Result<()> {
        Err(Error::new(ffi::SQLITE_READONLY))
    }

    fn truncate(&mut self, _size: u64) -> Result<()> {
        Err(Error::new(ffi::SQLITE_READONLY))
    }

    fn sync(&mut self, _op: SyncOptions) -> Result<()> {
        Err(Error::new(ffi::SQLITE_IOERR_FSYNC))
    }

    fn len(&self) -> Result<u64> {
        self.reader.size().or_code(ffi::SQLITE_IOERR_SEEK)
    }

    fn lock(&mut self, level: LockLevel) -> Result<()> {
        if level >= LockLevel::Reserved {
            return Err(Error::new(ffi::SQLITE_READONLY));
        }
        self.lock = self.lock.max(level);
        Ok(())
    }

    fn unlock(&mut self, level: LockLevel) -> Result<()> {
        self.lock = self.lock.min(level);
        Ok(())
    }

    fn is_write_locked(&self) -> Result<bool> {
        Ok(false)
    }

    fn lock_level(&self) -> LockLevel {
        self.lock
    }

    fn sector_len(&self) -> u32 {
        0
    }

    fn io_capabilities(&self) -> IoCapabilities {
        IoCapabilities::IMMUTABLE | IoCapabilities::SUBPAGE_READ
    }
}

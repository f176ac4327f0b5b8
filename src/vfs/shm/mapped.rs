use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{SharedMemory, WalLock, WalLockMode, SHM_BASE, SHM_DMS};
use crate::bridge::{Module, ModuleExt};
use crate::error::{Error, IoResultExt};
use crate::ffi::{self, ptr_t};
use crate::vfs::lock::RangeLock;
use crate::vfs::os::unix::{self, mmap};
use crate::vfs::Result;

const NOW: Option<Duration> = Some(Duration::ZERO);

#[derive(Debug)]
struct Region {
    ptr: ptr_t,
    addr: usize,
    len: usize,
}

/// The WAL-index as the `-shm` file, mapped over sandbox memory.
///
/// Lock slots are byte-range locks on the file at offset 120; byte 128 is
/// the dead man's switch, read-locked while any connection has the file
/// open, so the first connection in knows to reset it.
#[derive(Debug)]
pub struct MappedShm {
    path: PathBuf,
    file: Option<File>,
    regions: Vec<Region>,
}

impl MappedShm {
    /// `path` is the `-shm` file; it is opened on first use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        MappedShm {
            path: path.into(),
            file: None,
            regions: Vec::new(),
        }
    }

    fn file(&mut self) -> Result<&File> {
        if self.file.is_none() {
            self.file = Some(open_shm(&self.path)?);
        }
        self.file
            .as_ref()
            .ok_or_else(|| Error::new(ffi::SQLITE_IOERR_SHMOPEN))
    }

    fn map_region(&self, module: &mut dyn Module, ptr: ptr_t, size: usize, index: u64) -> Result<Region> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| Error::new(ffi::SQLITE_IOERR_SHMMAP))?;
        let addr = module.view_mut(ptr, size)?.as_mut_ptr();
        if addr as usize % mmap::page_size() != 0 {
            return Err(Error::with_message(
                ffi::SQLITE_IOERR_SHMMAP,
                "module memory is not page aligned",
            ));
        }
        // SAFETY: the range was just allocated to us, page aligned, and no
        // reference into it outlives this call.
        unsafe { mmap::map_shared(addr, size, file, index * size as u64) }
            .or_code(ffi::SQLITE_IOERR_SHMMAP)?;
        Ok(Region {
            ptr,
            addr: addr as usize,
            len: size,
        })
    }

    fn unmap_regions(&mut self, mut module: Option<&mut dyn Module>) {
        for region in self.regions.drain(..) {
            // SAFETY: the range is ours until it is freed below.
            if let Err(err) = unsafe { mmap::map_anonymous(region.addr as *mut u8, region.len) } {
                log::warn!("cannot unmap shared memory region: {err}");
                continue;
            }
            if let Some(module) = module.as_deref_mut() {
                if let Err(err) = module.free(region.ptr) {
                    log::warn!("cannot free shared memory region: {err}");
                }
            }
        }
    }
}

fn open_shm(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(0o644)
        .custom_flags(libc::O_NOFOLLOW | libc::O_CLOEXEC)
        .open(path)
        .or_code(ffi::SQLITE_IOERR_SHMOPEN)?;

    // The first connection in finds nobody else holding the switch, and
    // resets whatever a crashed process left behind.
    match file.write_lock(SHM_DMS, 1, NOW) {
        Ok(()) => file.set_len(0).or_code(ffi::SQLITE_IOERR_SHMOPEN)?,
        Err(err) if err.is_busy() => {}
        Err(err) => return Err(err.recode(ffi::SQLITE_IOERR_SHMOPEN)),
    }
    file.read_lock(SHM_DMS, 1, NOW).map_err(|err| {
        if err.is_busy() {
            err
        } else {
            err.recode(ffi::SQLITE_IOERR_SHMOPEN)
        }
    })?;
    log::debug!("opened shared memory {}", path.display());
    Ok(file)
}

fn lock_error(err: Error) -> Error {
    if err.is_busy() {
        err
    } else {
        err.recode(ffi::SQLITE_IOERR_SHMLOCK)
    }
}

impl SharedMemory for MappedShm {
    fn map(&mut self, module: &mut dyn Module, region: u32, size: u32, extend: bool) -> Result<u32> {
        if let Some(mapped) = self.regions.get(region as usize) {
            return Ok(mapped.ptr);
        }
        let len = size as usize;
        if len == 0 || len % mmap::page_size() != 0 {
            return Err(Error::new(ffi::SQLITE_IOERR_SHMMAP));
        }

        let need = (u64::from(region) + 1) * u64::from(size);
        let file = self.file()?;
        let file_len = file.metadata().or_code(ffi::SQLITE_IOERR_SHMSIZE)?.len();
        if file_len < need {
            if !extend {
                return Ok(0);
            }
            unix::allocate(file, need).or_code(ffi::SQLITE_IOERR_SHMSIZE)?;
        }

        while self.regions.len() <= region as usize {
            let index = self.regions.len() as u64;
            let ptr = module.aligned_alloc(mmap::page_size() as u64, u64::from(size))?;
            match self.map_region(module, ptr, len, index) {
                Ok(mapped) => self.regions.push(mapped),
                Err(err) => {
                    module.free(ptr)?;
                    return Err(err);
                }
            }
        }
        Ok(self.regions[region as usize].ptr)
    }

    fn lock(&mut self, _module: &mut dyn Module, locks: WalLock, mode: WalLockMode) -> Result<()> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| Error::new(ffi::SQLITE_IOERR_SHMLOCK))?;
        let start = SHM_BASE + u64::from(locks.offset());
        let len = u64::from(locks.len());
        match mode {
            WalLockMode::Shared => file.read_lock(start, len, NOW),
            WalLockMode::Exclusive => file.write_lock(start, len, NOW),
        }
        .map_err(lock_error)
    }

    fn unlock(&mut self, _module: &mut dyn Module, locks: WalLock, _mode: WalLockMode) -> Result<()> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| Error::new(ffi::SQLITE_IOERR_SHMLOCK))?;
        RangeLock::unlock(file, SHM_BASE + u64::from(locks.offset()), u64::from(locks.len()))
            .map_err(lock_error)
    }

    fn unmap(&mut self, module: &mut dyn Module, delete: bool) -> Result<()> {
        self.unmap_regions(Some(module));
        self.file = None;
        if delete {
            match fs::remove_file(&self.path) {
                Err(err) if err.kind() != io::ErrorKind::NotFound => {
                    return Err(Error::io(ffi::SQLITE_IOERR_DELETE, err))
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        self.unmap_regions(None);
        self.file = None;
    }
}

impl Drop for MappedShm {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bridge::HeapModule;
    use crate::vfs::shm::SHM_REGION_SIZE;

    #[test]
    fn test_two_mappings_share_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db-shm");
        let mut m1 = HeapModule::new(1 << 20);
        let mut m2 = HeapModule::new(1 << 20);
        let mut s1 = MappedShm::new(&path);
        let mut s2 = MappedShm::new(&path);

        assert_eq!(s1.map(&mut m1, 0, SHM_REGION_SIZE, false).unwrap(), 0);
        let p1 = s1.map(&mut m1, 0, SHM_REGION_SIZE, true).unwrap();
        let p2 = s2.map(&mut m2, 0, SHM_REGION_SIZE, false).unwrap();
        assert_ne!(p1, 0);
        assert_ne!(p2, 0);

        m1.write_u32(p1 + 100, 0xdead_beef).unwrap();
        assert_eq!(m2.read_u32(p2 + 100).unwrap(), 0xdead_beef);

        let write = WalLock::WRITE;
        s1.lock(&mut m1, write, WalLockMode::Exclusive).unwrap();
        assert!(s2.lock(&mut m2, write, WalLockMode::Shared).unwrap_err().is_busy());
        s1.unlock(&mut m1, write, WalLockMode::Exclusive).unwrap();
        s2.lock(&mut m2, write, WalLockMode::Shared).unwrap();

        s1.unmap(&mut m1, false).unwrap();
        s2.unmap(&mut m2, true).unwrap();
        assert!(!path.exists());
        assert_eq!(m1.allocations(), 0);
    }
}

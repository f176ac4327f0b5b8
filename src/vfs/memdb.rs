//! Shared in-memory databases.
//!
//! A name starting with `/` opens a database shared by every connection in
//! the process that uses the same name; any other name opens a private
//! database. Data is kept in 64 KiB sectors, so the engine's page aligned
//! I/O never crosses one.
//!
//! Databases can be seeded with [`MemDbVfs::create`], which also keeps them
//! alive while no connection has them open.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::ffi;
use crate::vfs::lock::{FileLock, LockBackend};
use crate::vfs::{
    AccessFlag, FileType, Filename, FullPathname, IoCapabilities, LockLevel, OpenFile, OpenFlags,
    Result, SyncOptions, Vfs, VfsFile,
};

/// Must be a multiple of the largest page size.
pub const SECTOR_SIZE: usize = 65536;

/// How long lock requests wait for readers or a writer to finish.
const LOCK_SPIN: Duration = Duration::from_millis(1);

type Sector = Box<[u8]>;

fn new_sector() -> Sector {
    vec![0; SECTOR_SIZE].into_boxed_slice()
}

#[derive(Default)]
struct Data {
    sectors: Vec<Sector>,
    size: u64,
}

impl Data {
    fn truncate(&mut self, size: u64) {
        if size < self.size {
            let rest = (size % SECTOR_SIZE as u64) as usize;
            if rest != 0 {
                let base = (size / SECTOR_SIZE as u64) as usize;
                self.sectors[base][rest..].fill(0);
            }
        }
        let sectors = size.div_ceil(SECTOR_SIZE as u64) as usize;
        self.sectors.resize_with(sectors, new_sector);
        self.size = size;
    }
}

#[derive(Debug, Default)]
struct LockState {
    shared: usize,
    reserved: Option<u64>,
    pending: Option<u64>,
}

#[derive(Default)]
struct MemDb {
    data: RwLock<Data>,
    locks: Mutex<LockState>,
}

impl MemDb {
    fn with_bytes(bytes: &[u8]) -> Self {
        let mut data = Data::default();
        data.truncate(bytes.len() as u64);
        for (sector, chunk) in data.sectors.iter_mut().zip(bytes.chunks(SECTOR_SIZE)) {
            sector[..chunk.len()].copy_from_slice(chunk);
        }
        MemDb {
            data: RwLock::new(data),
            locks: Mutex::default(),
        }
    }
}

struct Entry {
    db: Arc<MemDb>,
    refs: usize,
}

type Databases = Mutex<HashMap<String, Entry>>;

/// The `memdb` VFS.
#[derive(Default)]
pub struct MemDbVfs {
    shared: Arc<Databases>,
}

impl MemDbVfs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a shared database holding `data`, opened as `"/" + name`.
    ///
    /// Replaces any database of the same name. Connections that already have
    /// the old one open keep using it.
    pub fn create(&self, name: &str, data: impl AsRef<[u8]>) {
        let db = Arc::new(MemDb::with_bytes(data.as_ref()));
        self.shared
            .lock()
            .insert(name.to_owned(), Entry { db, refs: 1 });
    }

    /// Forgets a shared database. It is freed once every connection using
    /// it closes.
    pub fn delete(&self, name: &str) {
        self.shared.lock().remove(name);
    }

    /// Whether a shared database of this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.shared.lock().contains_key(name)
    }
}

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

impl Vfs for MemDbVfs {
    fn open(&self, name: Option<&Filename>, flags: OpenFlags) -> Result<OpenFile> {
        // Databases only do page aligned I/O, and so does the sorter with its
        // temp journals.
        if !matches!(
            flags.file_type(),
            Some(FileType::MainDb | FileType::TempDb | FileType::TransientDb | FileType::TempJournal)
        ) {
            return Err(Error::new(ffi::SQLITE_CANTOPEN));
        }
        let create = flags.contains(OpenFlags::CREATE);

        let (db, key) = match name.and_then(|n| n.path().strip_prefix('/')) {
            Some(key) => {
                let mut shared = self.shared.lock();
                if !create && !shared.contains_key(key) {
                    return Err(Error::new(ffi::SQLITE_CANTOPEN));
                }
                let entry = shared.entry(key.to_owned()).or_insert_with(|| Entry {
                    db: Arc::default(),
                    refs: 0,
                });
                entry.refs += 1;
                (Arc::clone(&entry.db), Some(key.to_owned()))
            }
            None if create => (Arc::default(), None),
            None => return Err(Error::new(ffi::SQLITE_CANTOPEN)),
        };

        let file = MemFile {
            lock: FileLock::new(MemLock {
                db: Arc::clone(&db),
                owner: NEXT_OWNER.fetch_add(1, Ordering::Relaxed),
            }),
            db,
            shared: key.map(|key| (Arc::clone(&self.shared), key)),
            readonly: flags.contains(OpenFlags::READONLY),
        };
        Ok(OpenFile::new(file, flags | OpenFlags::MEMORY))
    }

    fn delete(&self, _name: &str, _sync_dir: bool) -> Result<()> {
        Err(Error::new(ffi::SQLITE_IOERR_DELETE))
    }

    fn access(&self, _name: &str, _flag: AccessFlag) -> Result<bool> {
        Ok(false)
    }

    fn full_pathname(&self, name: &str) -> Result<FullPathname> {
        Ok(FullPathname::new(name))
    }
}

/// The in-process locking protocol of one [`MemFile`].
struct MemLock {
    db: Arc<MemDb>,
    owner: u64,
}

impl MemLock {
    /// Waits briefly for `ready`, with the state unlocked in between.
    fn spin(&self, ready: impl Fn(&LockState) -> bool) -> Result<parking_lot::MutexGuard<'_, LockState>> {
        let deadline = Instant::now() + LOCK_SPIN;
        let mut state = self.db.locks.lock();
        while !ready(&*state) {
            if Instant::now() >= deadline {
                return Err(Error::new(ffi::SQLITE_BUSY));
            }
            drop(state);
            thread::yield_now();
            state = self.db.locks.lock();
        }
        Ok(state)
    }

    fn drop_writer(&self, state: &mut LockState) {
        if state.pending == Some(self.owner) {
            state.pending = None;
        }
        if state.reserved == Some(self.owner) {
            state.reserved = None;
        }
    }
}

impl LockBackend for MemLock {
    fn shared(&mut self, _timeout: Option<Duration>) -> Result<()> {
        let mut state = self.spin(|s| s.pending.is_none())?;
        state.shared += 1;
        Ok(())
    }

    fn reserved(&mut self, _timeout: Option<Duration>) -> Result<()> {
        let mut state = self.db.locks.lock();
        if state.reserved.is_some() {
            return Err(Error::new(ffi::SQLITE_BUSY));
        }
        state.reserved = Some(self.owner);
        Ok(())
    }

    fn pending(&mut self) -> Result<()> {
        let mut state = self.db.locks.lock();
        match state.pending {
            Some(owner) if owner != self.owner => Err(Error::new(ffi::SQLITE_BUSY)),
            _ => {
                state.pending = Some(self.owner);
                Ok(())
            }
        }
    }

    fn exclusive(&mut self, _timeout: Option<Duration>) -> Result<()> {
        // Only this file's own SHARED lock may remain.
        self.spin(|s| s.shared <= 1).map(drop)
    }

    fn release_pending(&mut self) -> Result<()> {
        let mut state = self.db.locks.lock();
        if state.pending == Some(self.owner) {
            state.pending = None;
        }
        Ok(())
    }

    fn downgrade(&mut self, _from: LockLevel) -> Result<()> {
        self.drop_writer(&mut self.db.locks.lock());
        Ok(())
    }

    fn release(&mut self, from: LockLevel) -> Result<()> {
        let mut state = self.db.locks.lock();
        self.drop_writer(&mut state);
        if from >= LockLevel::Shared {
            state.shared = state.shared.saturating_sub(1);
        }
        Ok(())
    }

    fn check_reserved(&self) -> Result<bool> {
        Ok(self.db.locks.lock().reserved.is_some())
    }
}

/// A file opened by [`MemDbVfs`].
pub struct MemFile {
    db: Arc<MemDb>,
    lock: FileLock,
    shared: Option<(Arc<Databases>, String)>,
    readonly: bool,
}

impl VfsFile for MemFile {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let data = self.db.data.read();
        if offset >= data.size {
            return Ok(0);
        }
        let base = (offset / SECTOR_SIZE as u64) as usize;
        let rest = (offset % SECTOR_SIZE as u64) as usize;
        let end = (data.size - base as u64 * SECTOR_SIZE as u64).min(SECTOR_SIZE as u64) as usize;
        let n = buf.len().min(end - rest);
        buf[..n].copy_from_slice(&data.sectors[base][rest..rest + n]);
        if n < buf.len() && offset + (n as u64) < data.size {
            return Err(Error::with_message(
                ffi::SQLITE_IOERR_READ,
                "read crosses a sector boundary",
            ));
        }
        Ok(n)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        let rest = (offset % SECTOR_SIZE as u64) as usize;
        if rest + buf.len() > SECTOR_SIZE {
            return Err(Error::with_message(
                ffi::SQLITE_IOERR_WRITE,
                "write crosses a sector boundary",
            ));
        }
        let base = (offset / SECTOR_SIZE as u64) as usize;
        let mut data = self.db.data.write();
        if data.sectors.len() <= base {
            data.sectors.resize_with(base + 1, new_sector);
        }
        data.sectors[base][rest..rest + buf.len()].copy_from_slice(buf);
        data.size = data.size.max(offset + buf.len() as u64);
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.db.data.write().truncate(size);
        Ok(())
    }

    fn sync(&mut self, _op: SyncOptions) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.db.data.read().size)
    }

    fn lock(&mut self, level: LockLevel) -> Result<()> {
        self.lock.lock(level, self.readonly, None)
    }

    fn unlock(&mut self, level: LockLevel) -> Result<()> {
        self.lock.unlock(level)
    }

    fn is_write_locked(&self) -> Result<bool> {
        self.lock.check_reserved()
    }

    fn lock_level(&self) -> LockLevel {
        self.lock.level()
    }

    fn sector_len(&self) -> u32 {
        SECTOR_SIZE as u32
    }

    fn io_capabilities(&self) -> IoCapabilities {
        IoCapabilities::ATOMIC
            | IoCapabilities::SEQUENTIAL
            | IoCapabilities::SAFE_APPEND
            | IoCapabilities::POWERSAFE_OVERWRITE
    }

    fn close(&mut self) -> Result<()> {
        self.lock.unlock(LockLevel::None)?;
        if let Some((shared, key)) = self.shared.take() {
            let mut shared = shared.lock();
            if let Some(entry) = shared.get_mut(&key) {
                if Arc::ptr_eq(&entry.db, &self.db) {
                    entry.refs -= 1;
                    if entry.refs == 0 {
                        shared.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    fn hint_size(&mut self, size: u64) -> Result<()> {
        let mut data = self.db.data.write();
        if size > data.size {
            data.truncate(size);
        }
        Ok(())
    }
}

impl Drop for MemFile {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("cannot close memdb file: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAIN_DB: OpenFlags = OpenFlags::READWRITE
        .union(OpenFlags::CREATE)
        .union(OpenFlags::MAIN_DB);

    fn open(vfs: &MemDbVfs, name: &str, flags: OpenFlags) -> Result<Box<dyn VfsFile>> {
        let name = Filename::new(name);
        vfs.open(Some(&name), flags).map(|f| f.into_parts().0)
    }

    #[test]
    fn test_write_read() {
        let vfs = MemDbVfs::new();
        let mut file = open(&vfs, "/test", MAIN_DB).unwrap();
        let page: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
        file.write_at(&page, 0).unwrap();
        file.write_at(&page, SECTOR_SIZE as u64).unwrap();
        assert_eq!(file.len().unwrap(), SECTOR_SIZE as u64 + 4096);

        let mut buf = vec![0u8; 4096];
        assert_eq!(file.read_at(&mut buf, 0).unwrap(), 4096);
        assert_eq!(buf, page);
        assert_eq!(file.read_at(&mut buf, SECTOR_SIZE as u64).unwrap(), 4096);
        assert_eq!(buf, page);
        assert_eq!(file.read_at(&mut buf, 1 << 20).unwrap(), 0);
    }

    #[test]
    fn test_unaligned_io() {
        let vfs = MemDbVfs::new();
        let mut file = open(&vfs, "/unaligned", MAIN_DB).unwrap();
        let err = file.write_at(&[1; 16], SECTOR_SIZE as u64 - 8).unwrap_err();
        assert_eq!(err.extended_code(), ffi::SQLITE_IOERR_WRITE);

        file.write_at(&[1; 16], SECTOR_SIZE as u64).unwrap();
        let mut buf = [0u8; 16];
        let err = file.read_at(&mut buf, SECTOR_SIZE as u64 - 8).unwrap_err();
        assert_eq!(err.extended_code(), ffi::SQLITE_IOERR_READ);

        // Straddling the end is a short read.
        assert_eq!(file.read_at(&mut buf, SECTOR_SIZE as u64 + 8).unwrap(), 8);
        assert_eq!(&buf[..8], &[1; 8]);
    }

    #[test]
    fn test_truncate_zeroes_tail() {
        let vfs = MemDbVfs::new();
        let mut file = open(&vfs, "/truncate", MAIN_DB).unwrap();
        file.write_at(&[7; 4096], 0).unwrap();
        file.truncate(100).unwrap();
        assert_eq!(file.len().unwrap(), 100);
        file.hint_size(4096).unwrap();
        assert_eq!(file.len().unwrap(), 4096);
        let mut buf = [0u8; 4096];
        assert_eq!(file.read_at(&mut buf, 0).unwrap(), 4096);
        assert!(buf[..100].iter().all(|&b| b == 7));
        assert!(buf[100..].iter().all(|&b| b == 0));
        file.hint_size(10).unwrap();
        assert_eq!(file.len().unwrap(), 4096);
    }

    #[test]
    fn test_shared_and_private() {
        let vfs = MemDbVfs::new();
        let mut f1 = open(&vfs, "/shared", MAIN_DB).unwrap();
        let f2 = open(&vfs, "/shared", MAIN_DB).unwrap();
        f1.write_at(b"hello", 0).unwrap();
        assert_eq!(f2.len().unwrap(), 5);

        let mut p1 = open(&vfs, "private", MAIN_DB).unwrap();
        let p2 = open(&vfs, "private", MAIN_DB).unwrap();
        p1.write_at(b"hello", 0).unwrap();
        assert_eq!(p2.len().unwrap(), 0);

        drop(f1);
        assert!(vfs.contains("shared"));
        drop(f2);
        assert!(!vfs.contains("shared"));
    }

    #[test]
    fn test_create_and_delete() {
        let vfs = MemDbVfs::new();
        assert_eq!(
            open(&vfs, "/seeded", OpenFlags::READWRITE | OpenFlags::MAIN_DB)
                .err()
                .unwrap()
                .extended_code(),
            ffi::SQLITE_CANTOPEN
        );

        vfs.create("seeded", vec![9u8; SECTOR_SIZE + 10]);
        let mut file = open(&vfs, "/seeded", OpenFlags::READWRITE | OpenFlags::MAIN_DB).unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(file.read_at(&mut buf, SECTOR_SIZE as u64).unwrap(), 10);
        assert_eq!(buf, [9; 10]);
        file.close().unwrap();
        assert!(vfs.contains("seeded"));

        let mut file = open(&vfs, "/seeded", OpenFlags::READWRITE | OpenFlags::MAIN_DB).unwrap();
        vfs.delete("seeded");
        assert!(!vfs.contains("seeded"));
        assert_eq!(file.len().unwrap(), SECTOR_SIZE as u64 + 10);
        file.close().unwrap();
    }

    #[test]
    fn test_open_rules() {
        let vfs = MemDbVfs::new();
        let flags = OpenFlags::READWRITE | OpenFlags::CREATE | OpenFlags::MAIN_JOURNAL;
        assert_eq!(
            open(&vfs, "/db", flags).err().unwrap().extended_code(),
            ffi::SQLITE_CANTOPEN
        );
        let file = vfs.open(Some(&Filename::new("/db")), MAIN_DB).unwrap();
        assert!(file.flags().contains(OpenFlags::MEMORY));
        assert_eq!(file.file.io_capabilities().bits(), 0x1601);
        assert_eq!(file.file.sector_len(), SECTOR_SIZE as u32);

        assert!(vfs.open(None, MAIN_DB).is_ok());
        assert!(Vfs::delete(&vfs, "/db", false).is_err());
        assert!(!vfs.access("/db", AccessFlag::Exists).unwrap());
        assert_eq!(vfs.full_pathname("/db").unwrap(), FullPathname::new("/db"));
    }

    #[test]
    fn test_locking() {
        let vfs = MemDbVfs::new();
        let mut f1 = open(&vfs, "/locks", MAIN_DB).unwrap();
        let mut f2 = open(&vfs, "/locks", MAIN_DB).unwrap();

        f1.lock(LockLevel::Shared).unwrap();
        f2.lock(LockLevel::Shared).unwrap();
        f1.lock(LockLevel::Reserved).unwrap();
        assert!(f2.is_write_locked().unwrap());
        assert!(f2.lock(LockLevel::Reserved).unwrap_err().is_busy());
        assert!(f1.lock(LockLevel::Exclusive).unwrap_err().is_busy());
        assert_eq!(f1.lock_level(), LockLevel::Reserved);

        f2.unlock(LockLevel::None).unwrap();
        f1.lock(LockLevel::Exclusive).unwrap();
        assert!(f2.lock(LockLevel::Shared).unwrap_err().is_busy());

        f1.unlock(LockLevel::Shared).unwrap();
        assert!(!f2.is_write_locked().unwrap());
        f2.lock(LockLevel::Shared).unwrap();

        let mut ro = open(&vfs, "/locks", OpenFlags::READONLY | OpenFlags::MAIN_DB).unwrap();
        ro.lock(LockLevel::Shared).unwrap();
        assert_eq!(
            ro.lock(LockLevel::Reserved).unwrap_err().extended_code(),
            ffi::SQLITE_IOERR_LOCK
        );
    }
}

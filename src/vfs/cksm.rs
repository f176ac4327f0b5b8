//! Page checksums for databases that reserve 8 bytes per page.
//!
//! A database created with `SQLITE_FCNTL_RESERVE_BYTES` set to 8 (and
//! rebuilt with `VACUUM`) stores a checksum in the last 8 bytes of every
//! page, in the database file and in WAL frames. [`wrap`] puts every main
//! database and WAL behind a [`CksmFile`], which notices the reserved bytes
//! in the database header and then fills in checksums on write and checks
//! them on read.

use parking_lot::Mutex;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::ffi;
use crate::vfs::filename::parse_bool;
use crate::vfs::{
    FileType, Filename, IoCapabilities, LockLevel, OpenFlags, PragmaResult, Result,
    SharedMemory, SyncOptions, VfsFile,
};

const HEADER_MAGIC: &[u8; 16] = b"SQLite format 3\0";
const HEADER_SIZE: usize = 100;
const CKSM_SIZE: usize = 8;

/// The checksum state of a database, shared with its WAL.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CksmFlags {
    /// Page size from the database header.
    pub page_size: usize,
    /// Fill in checksums on write.
    pub compute: bool,
    /// Check checksums on read.
    pub verify: bool,
    /// A checkpoint is copying frames that were already checked.
    pub in_ckpt: bool,
}

impl CksmFlags {
    fn update(&mut self, header: &[u8]) {
        self.page_size = 256 * usize::from(u16::from_le_bytes([header[16], header[17]]));
        let reserved = header[20] == CKSM_SIZE as u8;
        if reserved != self.compute {
            self.compute = reserved;
            self.verify = reserved;
        }
    }
}

pub type SharedFlags = Arc<Mutex<CksmFlags>>;

/// Computes the checksum of `data`, whose length must be a multiple of 8.
///
/// Trailing bytes that do not fill a whole 8 byte word are ignored.
pub fn checksum(data: &[u8]) -> [u8; CKSM_SIZE] {
    let (mut s1, mut s2) = (0u32, 0u32);
    for word in data.chunks_exact(8) {
        let w0 = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        let w1 = u32::from_le_bytes([word[4], word[5], word[6], word[7]]);
        s1 = s1.wrapping_add(w0).wrapping_add(s2);
        s2 = s2.wrapping_add(w1).wrapping_add(s1);
    }
    let mut out = [0; CKSM_SIZE];
    out[..4].copy_from_slice(&s1.to_le_bytes());
    out[4..].copy_from_slice(&s2.to_le_bytes());
    out
}

fn is_header(buf: &[u8], offset: u64) -> bool {
    offset == 0 && buf.len() >= HEADER_SIZE && buf.starts_with(HEADER_MAGIC)
}

/// Puts main databases and WALs behind a [`CksmFile`]; returns other files
/// unchanged.
///
/// A WAL shares the flags of the database named by
/// [`Filename::database_file`].
pub fn wrap(file: Box<dyn VfsFile>, flags: OpenFlags, name: Option<&Filename>) -> Box<dyn VfsFile> {
    match flags.file_type() {
        Some(FileType::MainDb) => Box::new(CksmFile {
            inner: file,
            flags: SharedFlags::default(),
            is_db: true,
        }),
        Some(FileType::Wal) => {
            let shared = name
                .and_then(Filename::database_file)
                .and_then(|db| db.lock().checksum_flags())
                .unwrap_or_default();
            Box::new(CksmFile {
                inner: file,
                flags: shared,
                is_db: false,
            })
        }
        _ => file,
    }
}

/// A file whose pages carry checksums. See the [module docs](self).
pub struct CksmFile {
    inner: Box<dyn VfsFile>,
    flags: SharedFlags,
    is_db: bool,
}

impl CksmFile {
    /// The current flags.
    pub fn flags(&self) -> CksmFlags {
        *self.flags.lock()
    }

    /// The wrapped file.
    pub fn get_ref(&self) -> &dyn VfsFile {
        self.inner.as_ref()
    }
}

impl VfsFile for CksmFile {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let n = self.inner.read_at(buf, offset)?;

        let mut flags = self.flags.lock();
        if self.is_db && is_header(buf, offset) {
            flags.update(buf);
        }
        if flags.verify && !flags.in_ckpt && buf.len() == flags.page_size && buf.len() > CKSM_SIZE {
            let (data, stored) = buf.split_at(buf.len() - CKSM_SIZE);
            if checksum(data) != stored {
                log::debug!("checksum mismatch at offset {offset}");
                return Err(Error::new(ffi::SQLITE_IOERR_DATA));
            }
        }
        Ok(n)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        let page = {
            let mut flags = self.flags.lock();
            if self.is_db && is_header(buf, offset) {
                flags.update(buf);
            }
            flags.compute && !flags.in_ckpt && buf.len() == flags.page_size && buf.len() > CKSM_SIZE
        };
        if !page {
            return self.inner.write_at(buf, offset);
        }

        let mut page = buf.to_vec();
        let (data, sum) = page.split_at_mut(buf.len() - CKSM_SIZE);
        sum.copy_from_slice(&checksum(data));
        self.inner.write_at(&page, offset)
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.inner.truncate(size)
    }

    fn sync(&mut self, op: SyncOptions) -> Result<()> {
        self.inner.sync(op)
    }

    fn len(&self) -> Result<u64> {
        self.inner.len()
    }

    fn lock(&mut self, level: LockLevel) -> Result<()> {
        self.inner.lock(level)
    }

    fn unlock(&mut self, level: LockLevel) -> Result<()> {
        self.inner.unlock(level)
    }

    fn is_write_locked(&self) -> Result<bool> {
        self.inner.is_write_locked()
    }

    fn lock_level(&self) -> LockLevel {
        self.inner.lock_level()
    }

    fn sector_len(&self) -> u32 {
        self.inner.sector_len()
    }

    fn io_capabilities(&self) -> IoCapabilities {
        self.inner.io_capabilities()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }

    fn hint_size(&mut self, size: u64) -> Result<()> {
        self.inner.hint_size(size)
    }

    fn hint_overwrite(&mut self) -> Result<()> {
        self.inner.hint_overwrite()
    }

    fn set_chunk_size(&mut self, size: u32) -> Result<()> {
        self.inner.set_chunk_size(size)
    }

    fn pragma(&mut self, name: &str, arg: Option<&str>) -> PragmaResult {
        {
            let mut flags = self.flags.lock();
            match name {
                "checksum_verification" => {
                    if let Some(verify) = arg.and_then(parse_bool) {
                        flags.verify = verify && flags.compute;
                    }
                    return Ok(Some(Cow::Borrowed(if flags.verify { "1" } else { "0" })));
                }
                // The page size of a checksummed database is fixed.
                "page_size" if flags.compute => {
                    return Ok(Some(Cow::Owned(flags.page_size.to_string())));
                }
                _ => {}
            }
        }
        self.inner.pragma(name, arg)
    }

    fn has_moved(&self) -> Result<bool> {
        self.inner.has_moved()
    }

    fn commit_phase_two(&mut self) -> Result<()> {
        self.inner.commit_phase_two()
    }

    fn begin_atomic(&mut self) -> Result<()> {
        self.inner.begin_atomic()
    }

    fn commit_atomic(&mut self) -> Result<()> {
        self.inner.commit_atomic()
    }

    fn rollback_atomic(&mut self) -> Result<()> {
        self.inner.rollback_atomic()
    }

    fn lock_timeout(&self) -> Option<Duration> {
        self.inner.lock_timeout()
    }

    fn set_lock_timeout(&mut self, timeout: Option<Duration>) -> Result<Option<Duration>> {
        self.inner.set_lock_timeout(timeout)
    }

    fn is_wal_persistent(&self) -> bool {
        self.inner.is_wal_persistent()
    }

    fn set_wal_persistent(&mut self, persist: bool) {
        self.inner.set_wal_persistent(persist);
    }

    fn is_powersafe_overwrite(&self) -> bool {
        self.inner.is_powersafe_overwrite()
    }

    fn set_powersafe_overwrite(&mut self, powersafe: bool) -> Result<()> {
        self.inner.set_powersafe_overwrite(powersafe)
    }

    fn on_checkpoint_start(&mut self) {
        self.inner.on_checkpoint_start();
        self.flags.lock().in_ckpt = true;
    }

    fn on_checkpoint_done(&mut self) {
        self.inner.on_checkpoint_done();
        self.flags.lock().in_ckpt = false;
    }

    fn shared_memory(&mut self) -> Option<&mut dyn SharedMemory> {
        self.inner.shared_memory()
    }

    fn checksum_flags(&self) -> Option<SharedFlags> {
        self.is_db.then(|| Arc::clone(&self.flags))
    }
}

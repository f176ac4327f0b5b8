//! The host functions a sandboxed engine imports to reach its VFSes.
//!
//! Every function receives 32-bit pointers into the module's memory. The
//! `sqlite3_vfs` pointer names the VFS to use; the `sqlite3_file` pointer
//! holds, at offset 4, the id of a host file in the [`Bridge`]'s handle
//! table. Errors are narrowed to the engine's result codes before they cross
//! back into the sandbox.
//!
//! [`Bridge`] is runtime agnostic: hosts adapt their runtime's memory and
//! exports to [`Module`] and forward each import. With the `wasmtime`
//! feature, [`wasmtime::add_to_linker`] does that for a wasmtime `Linker`.

mod arena;
mod handle;
mod module;
#[cfg(feature = "wasmtime")]
pub mod wasmtime;

pub use self::arena::{Arena, Mark, ARENA_SIZE};
pub use self::handle::HandleTable;
pub use self::module::{HeapModule, Module, ModuleExt};

use chrono::{Datelike, Local, Offset, TimeZone, Timelike};
use parking_lot::Mutex;
use std::any::Any;
use std::ffi::c_int;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, IntoResultCodeExt};
use crate::ffi::{self, ptr_t};
use crate::vfs::shm::WalLockOp;
use crate::vfs::{
    cksm, lock_timeout_from_millis, lock_timeout_to_millis, os, AccessFlag, FileHandle, FileType,
    Filename, LockLevel, OpenFlags, Result, SyncOptions, Vfs, VfsFile, VfsRegistry, WalLock,
    WalLockMode, WriteOutputResultExt,
};

enum Handle {
    File(FileHandle),
    Value(Box<dyn Any + Send>),
}

struct Inner {
    vfs: Arc<VfsRegistry>,
    handles: Mutex<HandleTable<Handle>>,
    arena: Mutex<Option<Arena>>,
}

/// The host side of one sandboxed module.
///
/// Owns the files the module opened. Cloning shares the same state; a
/// bridge must not be shared between modules, since handle ids are only
/// meaningful to the module that received them.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<Inner>,
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new(Arc::new(VfsRegistry::default()))
    }
}

fn offset(ptr: ptr_t, off: u32) -> Result<ptr_t> {
    ptr.checked_add(off)
        .ok_or_else(|| Error::misuse("pointer out of range"))
}

fn warn_err(what: &str, result: Result<()>) {
    if let Err(err) = result {
        log::warn!("{what}: {err}");
    }
}

impl Bridge {
    /// Creates a bridge resolving VFS names in `vfs`.
    pub fn new(vfs: Arc<VfsRegistry>) -> Self {
        Bridge {
            inner: Arc::new(Inner {
                vfs,
                handles: Mutex::new(HandleTable::new()),
                arena: Mutex::new(None),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<VfsRegistry> {
        &self.inner.vfs
    }

    /// Number of live handles, files and values.
    pub fn handles(&self) -> usize {
        self.inner.handles.lock().len()
    }

    /// Stores a host value for the module, returning its id.
    pub fn add_handle(&self, value: impl Any + Send) -> u32 {
        self.inner
            .handles
            .lock()
            .add(Handle::Value(Box::new(value)))
    }

    /// Runs `f` on the value stored under `id`, if it is a `T`.
    pub fn with_handle<T: Any, R>(&self, id: u32, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        match self.inner.handles.lock().get_mut(id)? {
            Handle::Value(value) => value.downcast_mut::<T>().map(f),
            Handle::File(_) => None,
        }
    }

    /// Drops the value stored under `id`.
    pub fn del_handle(&self, id: u32) -> Result<()> {
        let mut handles = self.inner.handles.lock();
        if !matches!(handles.get(id), Some(Handle::Value(_))) {
            return Err(Error::misuse("invalid handle"));
        }
        drop(handles.remove(id));
        Ok(())
    }

    /// Runs `f` with the module's scratch arena, releasing whatever `f`
    /// allocated from it afterward.
    pub fn with_arena<R>(
        &self,
        module: &mut dyn Module,
        f: impl FnOnce(&mut Arena, &mut dyn Module) -> Result<R>,
    ) -> Result<R> {
        let mut guard = self.inner.arena.lock();
        if guard.is_none() {
            *guard = Some(Arena::new(module, ARENA_SIZE)?);
        }
        let arena = guard.as_mut().ok_or_else(|| Error::new(ffi::SQLITE_NOMEM))?;
        let mark = arena.mark();
        let result = f(arena, module);
        warn_err("cannot reset arena", arena.reset(module, mark));
        result
    }

    /// Shuts the module down: unmaps shared memory and closes every open
    /// file, newest first, then frees the arena.
    pub fn close_all(&self, module: &mut dyn Module) {
        let handles: Vec<Handle> = self.inner.handles.lock().drain().collect();
        for handle in handles {
            let Handle::File(file) = handle else {
                continue;
            };
            let mut file = file.lock();
            if let Some(shm) = file.shared_memory() {
                warn_err("cannot unmap shared memory", shm.unmap(module, false));
            }
            warn_err("cannot close file", file.close());
        }
        if let Some(arena) = self.inner.arena.lock().take() {
            warn_err("cannot free arena", arena.free(module));
        }
    }

    fn vfs(&self, module: &dyn Module, p_vfs: ptr_t) -> Result<Arc<dyn Vfs>> {
        let z_name = module.read_u32(offset(p_vfs, ffi::SQLITE_VFS_NAME_OFFSET)?)?;
        let name = if z_name == 0 {
            String::new()
        } else {
            module.read_cstr(z_name, ffi::SQLITE_MAX_PATHNAME)?
        };
        self.inner
            .vfs
            .find(&name)
            .ok_or_else(|| Error::with_message(ffi::SQLITE_ERROR, format!("no such vfs: {name}")))
    }

    fn file(&self, module: &dyn Module, p_file: ptr_t) -> Result<(u32, FileHandle)> {
        let id = module.read_u32(offset(p_file, ffi::SQLITE_FILE_ID_OFFSET)?)?;
        match self.inner.handles.lock().get(id) {
            Some(Handle::File(file)) => Ok((id, file.clone())),
            _ => Err(Error::misuse("invalid file handle")),
        }
    }

    /// `go_vfs_find`: 1 if a VFS is registered under the name.
    pub fn vfs_find(&self, module: &mut dyn Module, z_vfs_name: ptr_t) -> c_int {
        let name = match z_vfs_name {
            0 => Ok(String::new()),
            ptr => module.read_cstr(ptr, ffi::SQLITE_MAX_PATHNAME),
        };
        let found = name.is_ok_and(|name| self.inner.vfs.find(&name).is_some());
        c_int::from(found)
    }

    /// `go_localtime`: fills a `struct tm` for `t` seconds since the epoch.
    pub fn localtime(&self, module: &mut dyn Module, p_tm: ptr_t, t: i64) -> c_int {
        self.localtime_impl(module, p_tm, t).into_rc()
    }

    fn localtime_impl(&self, module: &mut dyn Module, p_tm: ptr_t, t: i64) -> Result<()> {
        let fields = local_tm(t)?;
        let tm = module.view_mut(p_tm, ffi::SQLITE_TM_SIZE as usize)?;
        for (chunk, field) in tm.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&field.to_le_bytes());
        }
        Ok(())
    }

    /// `go_randomness`: returns the number of bytes written.
    pub fn randomness(&self, module: &mut dyn Module, p_vfs: ptr_t, n_byte: i32, z_byte: ptr_t) -> c_int {
        let result = (|| {
            let vfs = self.vfs(module, p_vfs)?;
            let n = usize::try_from(n_byte).unwrap_or(0);
            vfs.fill_random_bytes(module.view_mut(z_byte, n)?);
            Ok::<_, Error>(n_byte.max(0))
        })();
        result.unwrap_or_else(|err| {
            log::debug!("randomness: {err}");
            0
        })
    }

    /// `go_sleep`.
    pub fn sleep(&self, module: &mut dyn Module, p_vfs: ptr_t, n_micro: i32) -> c_int {
        self.vfs(module, p_vfs)
            .map(|vfs| vfs.sleep(Duration::from_micros(n_micro.max(0) as u64)))
            .into_rc()
    }

    /// `go_current_time_64`: milliseconds since the Julian epoch.
    pub fn current_time_64(&self, module: &mut dyn Module, p_vfs: ptr_t, pi_now: ptr_t) -> c_int {
        let result = (|| {
            let now = self.vfs(module, p_vfs)?.now()?;
            module.write_i64(pi_now, os::julian_day_millis(now))
        })();
        result.into_rc()
    }

    /// `go_full_pathname`.
    pub fn full_pathname(
        &self,
        module: &mut dyn Module,
        p_vfs: ptr_t,
        z_relative: ptr_t,
        n_full: i32,
        z_full: ptr_t,
    ) -> c_int {
        match self.full_pathname_impl(module, p_vfs, z_relative, n_full, z_full) {
            Ok(true) => ffi::SQLITE_OK_SYMLINK,
            result => result.map(drop).into_rc(),
        }
    }

    fn full_pathname_impl(
        &self,
        module: &mut dyn Module,
        p_vfs: ptr_t,
        z_relative: ptr_t,
        n_full: i32,
        z_full: ptr_t,
    ) -> Result<bool> {
        let vfs = self.vfs(module, p_vfs)?;
        let path = module
            .read_cstr(z_relative, ffi::SQLITE_MAX_PATHNAME)
            .map_err(|err| err.recode(ffi::SQLITE_CANTOPEN_FULLPATH))?;
        log::trace!("full_pathname {path}");
        let full = vfs.full_pathname(&path)?;
        let capacity = usize::try_from(n_full).unwrap_or(0);
        if full.path.len() >= capacity {
            return Err(Error::with_message(
                ffi::SQLITE_CANTOPEN_FULLPATH,
                format!("path too long: {}", full.path),
            ));
        }
        module.write_bytes(z_full, full.path.as_bytes())?;
        module.write_bytes(offset(z_full, full.path.len() as u32)?, &[0])?;
        Ok(full.symlink)
    }

    /// `go_delete`.
    pub fn delete(&self, module: &mut dyn Module, p_vfs: ptr_t, z_path: ptr_t, sync_dir: i32) -> c_int {
        let result = (|| {
            let vfs = self.vfs(module, p_vfs)?;
            let path = module.read_cstr(z_path, ffi::SQLITE_MAX_PATHNAME)?;
            log::trace!("delete {path}");
            vfs.delete(&path, sync_dir != 0)
        })();
        result.into_rc()
    }

    /// `go_access`.
    pub fn access(
        &self,
        module: &mut dyn Module,
        p_vfs: ptr_t,
        z_path: ptr_t,
        flags: i32,
        p_res_out: ptr_t,
    ) -> c_int {
        let result = (|| {
            let vfs = self.vfs(module, p_vfs)?;
            let path = module.read_cstr(z_path, ffi::SQLITE_MAX_PATHNAME)?;
            let flag = AccessFlag::from_raw(flags)?;
            let mut res = 0i32;
            vfs.access(&path, flag)
                .map(i32::from)
                .write_to_output(&mut res)?;
            log::trace!("access {path} {flag:?} = {res}");
            module.write_i32(p_res_out, res)
        })();
        result.into_rc()
    }

    /// `go_open`. `p_out_shm`, when not null, receives whether the file
    /// supports shared memory.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        &self,
        module: &mut dyn Module,
        p_vfs: ptr_t,
        z_name: ptr_t,
        p_file: ptr_t,
        flags: i32,
        p_out_flags: ptr_t,
        p_out_shm: ptr_t,
    ) -> c_int {
        self.open_impl(module, p_vfs, z_name, p_file, flags, p_out_flags, p_out_shm)
            .into_rc()
    }

    #[allow(clippy::too_many_arguments)]
    fn open_impl(
        &self,
        module: &mut dyn Module,
        p_vfs: ptr_t,
        z_name: ptr_t,
        p_file: ptr_t,
        flags: i32,
        p_out_flags: ptr_t,
        p_out_shm: ptr_t,
    ) -> Result<()> {
        let vfs = self.vfs(module, p_vfs)?;
        let flags = OpenFlags::from_bits_retain(flags);
        let name = match z_name {
            0 => None,
            _ => Some(self.filename(module, z_name, flags.file_type())?),
        };

        let open = match &name {
            Some(name) if flags.contains(OpenFlags::URI) => {
                vfs.open_with_params(Some(name), flags, name.uri_parameters())
            }
            name => vfs.open(name.as_ref(), flags),
        };
        let (file, out_flags) = open?.into_parts();
        let mut file = cksm::wrap(file, out_flags, name.as_ref());
        let has_shm = file.shared_memory().is_some();

        let id = self
            .inner
            .handles
            .lock()
            .add(Handle::File(Arc::new(Mutex::new(file))));
        log::trace!("[{id}] open {:?} {out_flags:?}", name.as_ref().map(Filename::path));

        let result = (|| {
            module.write_u32(offset(p_file, ffi::SQLITE_FILE_ID_OFFSET)?, id)?;
            if p_out_flags != 0 {
                module.write_i32(p_out_flags, out_flags.bits())?;
            }
            if p_out_shm != 0 {
                module.write_i32(p_out_shm, i32::from(has_shm))?;
            }
            Ok(())
        })();
        if result.is_err() {
            self.inner.handles.lock().remove(id);
        }
        result
    }

    fn filename(&self, module: &mut dyn Module, z_name: ptr_t, ty: Option<FileType>) -> Result<Filename> {
        match ty {
            Some(FileType::MainDb | FileType::MainJournal) => {
                Filename::from_engine(module.memory(), z_name as usize)
            }
            Some(FileType::Wal) => {
                let mut name = Filename::from_engine(module.memory(), z_name as usize)?;
                // The database is open before its WAL; share its state.
                let p_db = module.database_file_object(z_name)?;
                if p_db != 0 {
                    if let Ok((_, file)) = self.file(module, p_db) {
                        name.set_database_file(file);
                    }
                }
                Ok(name)
            }
            _ => module
                .read_cstr(z_name, ffi::SQLITE_MAX_PATHNAME)
                .map(Filename::new),
        }
    }

    /// `go_close`.
    pub fn close(&self, module: &mut dyn Module, p_file: ptr_t) -> c_int {
        self.close_impl(module, p_file).into_rc()
    }

    fn close_impl(&self, module: &mut dyn Module, p_file: ptr_t) -> Result<()> {
        let p_id = offset(p_file, ffi::SQLITE_FILE_ID_OFFSET)?;
        let id = module.read_u32(p_id)?;
        let mut handles = self.inner.handles.lock();
        if !matches!(handles.get(id), Some(Handle::File(_))) {
            return Err(Error::misuse("invalid file handle"));
        }
        let Some(Handle::File(file)) = handles.remove(id) else {
            return Err(Error::misuse("invalid file handle"));
        };
        drop(handles);
        log::trace!("[{id}] close");
        module.write_u32(p_id, 0)?;
        let mut file = file.lock();
        file.close()
    }

    /// `go_read`. A read past the end zero-fills the rest of the buffer and
    /// reports `SQLITE_IOERR_SHORT_READ`.
    pub fn read(&self, module: &mut dyn Module, p_file: ptr_t, z_buf: ptr_t, i_amt: i32, i_ofst: i64) -> c_int {
        self.read_impl(module, p_file, z_buf, i_amt, i_ofst).into_rc()
    }

    fn read_impl(&self, module: &mut dyn Module, p_file: ptr_t, z_buf: ptr_t, i_amt: i32, i_ofst: i64) -> Result<()> {
        let (id, file) = self.file(module, p_file)?;
        log::trace!("[{id}] read amt={i_amt} ofst={i_ofst}");
        let amt = usize::try_from(i_amt).map_err(|_| Error::misuse("negative read size"))?;
        let ofst = u64::try_from(i_ofst).map_err(|_| Error::misuse("negative offset"))?;
        let buf = module.view_mut(z_buf, amt)?;
        let n = file.lock().read_at(buf, ofst)?;
        if n >= amt {
            return Ok(());
        }
        buf[n..].fill(0);
        Err(Error::new(ffi::SQLITE_IOERR_SHORT_READ))
    }

    /// `go_write`.
    pub fn write(&self, module: &mut dyn Module, p_file: ptr_t, z_buf: ptr_t, i_amt: i32, i_ofst: i64) -> c_int {
        let result = (|| {
            let (id, file) = self.file(module, p_file)?;
            log::trace!("[{id}] write amt={i_amt} ofst={i_ofst}");
            let amt = usize::try_from(i_amt).map_err(|_| Error::misuse("negative write size"))?;
            let ofst = u64::try_from(i_ofst).map_err(|_| Error::misuse("negative offset"))?;
            let buf = module.view(z_buf, amt)?;
            let result = file.lock().write_at(buf, ofst);
            result
        })();
        result.into_rc()
    }

    /// `go_truncate`.
    pub fn truncate(&self, module: &mut dyn Module, p_file: ptr_t, n_byte: i64) -> c_int {
        let result = (|| {
            let (id, file) = self.file(module, p_file)?;
            log::trace!("[{id}] truncate size={n_byte}");
            let size = u64::try_from(n_byte).map_err(|_| Error::misuse("negative size"))?;
            let result = file.lock().truncate(size);
            result
        })();
        result.into_rc()
    }

    /// `go_sync`.
    pub fn sync(&self, module: &mut dyn Module, p_file: ptr_t, flags: i32) -> c_int {
        let result = (|| {
            let (id, file) = self.file(module, p_file)?;
            let options = SyncOptions::from_raw(flags);
            log::trace!("[{id}] sync {options:?}");
            let result = file.lock().sync(options);
            result
        })();
        result.into_rc()
    }

    /// `go_file_size`.
    pub fn file_size(&self, module: &mut dyn Module, p_file: ptr_t, p_size: ptr_t) -> c_int {
        let result = (|| {
            let (_, file) = self.file(module, p_file)?;
            let size = file.lock().len()?;
            let size = i64::try_from(size).map_err(|_| Error::new(ffi::SQLITE_IOERR_FSTAT))?;
            module.write_i64(p_size, size)
        })();
        result.into_rc()
    }

    /// `go_lock`.
    pub fn lock(&self, module: &mut dyn Module, p_file: ptr_t, level: i32) -> c_int {
        let result = (|| {
            let (id, file) = self.file(module, p_file)?;
            let level = LockLevel::from_raw(level)?;
            log::trace!("[{id}] lock {level:?}");
            let result = file.lock().lock(level);
            result
        })();
        result.into_rc()
    }

    /// `go_unlock`.
    pub fn unlock(&self, module: &mut dyn Module, p_file: ptr_t, level: i32) -> c_int {
        let result = (|| {
            let (id, file) = self.file(module, p_file)?;
            let level = LockLevel::from_raw(level)?;
            log::trace!("[{id}] unlock {level:?}");
            let result = file.lock().unlock(level);
            result
        })();
        result.into_rc()
    }

    /// `go_check_reserved_lock`.
    pub fn check_reserved_lock(&self, module: &mut dyn Module, p_file: ptr_t, p_res_out: ptr_t) -> c_int {
        let result = (|| {
            let (_, file) = self.file(module, p_file)?;
            let locked = file.lock().is_write_locked()?;
            module.write_i32(p_res_out, i32::from(locked))
        })();
        result.into_rc()
    }

    /// `go_sector_size`.
    pub fn sector_size(&self, module: &mut dyn Module, p_file: ptr_t) -> c_int {
        match self.file(module, p_file) {
            Ok((_, file)) => file.lock().sector_len() as c_int,
            Err(err) => {
                log::debug!("sector_size: {err}");
                0
            }
        }
    }

    /// `go_device_characteristics`.
    pub fn device_characteristics(&self, module: &mut dyn Module, p_file: ptr_t) -> c_int {
        match self.file(module, p_file) {
            Ok((_, file)) => file.lock().io_capabilities().bits(),
            Err(err) => {
                log::debug!("device_characteristics: {err}");
                0
            }
        }
    }

    /// `go_file_control`. Unknown opcodes report `SQLITE_NOTFOUND`.
    pub fn file_control(&self, module: &mut dyn Module, p_file: ptr_t, op: i32, p_arg: ptr_t) -> c_int {
        self.file_control_impl(module, p_file, op, p_arg).into_rc()
    }

    fn file_control_impl(&self, module: &mut dyn Module, p_file: ptr_t, op: i32, p_arg: ptr_t) -> Result<()> {
        let (id, file) = self.file(module, p_file)?;
        log::trace!("[{id}] file_control op={op}");
        let mut guard = file.lock();
        let file: &mut dyn VfsFile = &mut **guard;
        match op {
            ffi::SQLITE_FCNTL_LOCKSTATE => module.write_i32(p_arg, file.lock_level().to_raw()),
            ffi::SQLITE_FCNTL_LOCK_TIMEOUT => {
                let timeout = lock_timeout_from_millis(module.read_i32(p_arg)?);
                let old = file.set_lock_timeout(timeout)?;
                module.write_i32(p_arg, lock_timeout_to_millis(old))
            }
            ffi::SQLITE_FCNTL_SIZE_HINT => {
                let size = module.read_i64(p_arg)?;
                file.hint_size(u64::try_from(size).unwrap_or(0))
            }
            ffi::SQLITE_FCNTL_CHUNK_SIZE => {
                let size = module.read_i32(p_arg)?;
                file.set_chunk_size(u32::try_from(size).unwrap_or(0))
            }
            ffi::SQLITE_FCNTL_PERSIST_WAL => match module.read_i32(p_arg)? {
                query if query < 0 => module.write_i32(p_arg, i32::from(file.is_wal_persistent())),
                persist => {
                    file.set_wal_persistent(persist != 0);
                    Ok(())
                }
            },
            ffi::SQLITE_FCNTL_POWERSAFE_OVERWRITE => match module.read_i32(p_arg)? {
                query if query < 0 => {
                    module.write_i32(p_arg, i32::from(file.is_powersafe_overwrite()))
                }
                psow => file.set_powersafe_overwrite(psow != 0),
            },
            ffi::SQLITE_FCNTL_OVERWRITE => file.hint_overwrite(),
            ffi::SQLITE_FCNTL_HAS_MOVED => {
                let moved = file.has_moved()?;
                module.write_i32(p_arg, i32::from(moved))
            }
            ffi::SQLITE_FCNTL_COMMIT_PHASETWO => file.commit_phase_two(),
            ffi::SQLITE_FCNTL_BEGIN_ATOMIC_WRITE => file.begin_atomic(),
            ffi::SQLITE_FCNTL_COMMIT_ATOMIC_WRITE => file.commit_atomic(),
            ffi::SQLITE_FCNTL_ROLLBACK_ATOMIC_WRITE => file.rollback_atomic(),
            ffi::SQLITE_FCNTL_CKPT_START => {
                file.on_checkpoint_start();
                Ok(())
            }
            ffi::SQLITE_FCNTL_CKPT_DONE => {
                file.on_checkpoint_done();
                Ok(())
            }
            ffi::SQLITE_FCNTL_PRAGMA => pragma(module, file, p_arg),
            _ => Err(Error::new(ffi::SQLITE_NOTFOUND)),
        }
    }

    /// `go_shm_map`.
    pub fn shm_map(
        &self,
        module: &mut dyn Module,
        p_file: ptr_t,
        i_region: i32,
        sz_region: i32,
        b_extend: i32,
        pp: ptr_t,
    ) -> c_int {
        let result = (|| {
            let (id, file) = self.file(module, p_file)?;
            log::trace!("[{id}] shm_map region={i_region} size={sz_region} extend={b_extend}");
            let region = u32::try_from(i_region).map_err(|_| Error::misuse("negative region"))?;
            let size = u32::try_from(sz_region).map_err(|_| Error::misuse("negative region size"))?;
            let mut file = file.lock();
            let shm = file
                .shared_memory()
                .ok_or_else(|| Error::new(ffi::SQLITE_IOERR_SHMMAP))?;
            let ptr = match shm.map(module, region, size, b_extend != 0) {
                Ok(ptr) => ptr,
                Err(err) => {
                    module.write_u32(pp, 0)?;
                    return Err(err);
                }
            };
            module.write_u32(pp, ptr)
        })();
        result.into_rc()
    }

    /// `go_shm_lock`.
    pub fn shm_lock(&self, module: &mut dyn Module, p_file: ptr_t, offset: i32, n: i32, flags: i32) -> c_int {
        let result = (|| {
            let (id, file) = self.file(module, p_file)?;
            let (op, mode) = WalLockMode::from_flags(flags)?;
            let locks = WalLock::new(offset, n)?;
            if mode == WalLockMode::Shared && locks.len() != 1 {
                return Err(Error::misuse("shared shm lock spans several slots"));
            }
            log::trace!("[{id}] shm_lock {op:?} {mode:?} {locks:?}");
            let mut file = file.lock();
            let shm = file
                .shared_memory()
                .ok_or_else(|| Error::new(ffi::SQLITE_IOERR_SHMLOCK))?;
            match op {
                WalLockOp::Lock => shm.lock(module, locks, mode),
                WalLockOp::Unlock => shm.unlock(module, locks, mode),
            }
        })();
        result.into_rc()
    }

    /// `go_shm_barrier`.
    pub fn shm_barrier(&self, module: &mut dyn Module, p_file: ptr_t) {
        match self.file(module, p_file) {
            Ok((_, file)) => {
                let mut file = file.lock();
                match file.shared_memory() {
                    Some(shm) => shm.barrier(module),
                    None => std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst),
                }
            }
            Err(err) => log::debug!("shm_barrier: {err}"),
        }
    }

    /// `go_shm_unmap`.
    pub fn shm_unmap(&self, module: &mut dyn Module, p_file: ptr_t, b_delete: i32) -> c_int {
        let result = (|| {
            let (id, file) = self.file(module, p_file)?;
            log::trace!("[{id}] shm_unmap delete={b_delete}");
            let mut file = file.lock();
            match file.shared_memory() {
                Some(shm) => shm.unmap(module, b_delete != 0),
                None => Ok(()),
            }
        })();
        result.into_rc()
    }
}

/// `SQLITE_FCNTL_PRAGMA`: the argument is `char *[3]`, the result or error
/// message slot followed by the pragma name and argument.
fn pragma(module: &mut dyn Module, file: &mut dyn VfsFile, p_arg: ptr_t) -> Result<()> {
    let z_name = module.read_u32(offset(p_arg, 4)?)?;
    let z_arg = module.read_u32(offset(p_arg, 8)?)?;
    let name = module
        .read_cstr(z_name, ffi::SQLITE_MAX_PATHNAME)?
        .to_ascii_lowercase();
    let arg = match z_arg {
        0 => None,
        ptr => Some(module.read_cstr(ptr, ffi::SQLITE_MAX_PATHNAME)?),
    };

    match file.pragma(&name, arg.as_deref()) {
        Ok(None) => Ok(()),
        Ok(Some(value)) => {
            let ptr = module.new_cstr(&value)?;
            module.write_u32(p_arg, ptr)
        }
        Err(err) => {
            if let Some(message) = err.message {
                let ptr = module.new_cstr(&message)?;
                module.write_u32(p_arg, ptr)?;
            }
            Err(err.code)
        }
    }
}

/// The nine `struct tm` fields for `t` in the local time zone.
fn local_tm(t: i64) -> Result<[i32; 9]> {
    let tm = Local
        .timestamp_opt(t, 0)
        .single()
        .ok_or_else(|| Error::with_message(ffi::SQLITE_ERROR, format!("invalid time: {t}")))?;
    let year = tm.year();
    let offset = tm.offset().fix().local_minus_utc();
    // Standard time is the smaller of the winter and summer offsets.
    let standard = [1, 7]
        .into_iter()
        .filter_map(|month| Local.with_ymd_and_hms(year, month, 1, 0, 0, 0).earliest())
        .map(|dt| dt.offset().fix().local_minus_utc())
        .min()
        .unwrap_or(offset);
    Ok([
        tm.second() as i32,
        tm.minute() as i32,
        tm.hour() as i32,
        tm.day() as i32,
        tm.month0() as i32,
        year - 1900,
        tm.weekday().num_days_from_sunday() as i32,
        tm.ordinal0() as i32,
        i32::from(offset > standard),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        bridge: Bridge,
        module: HeapModule,
        vfs: ptr_t,
    }

    impl Fixture {
        fn new(vfs: &str) -> Self {
            let mut module = HeapModule::new(1 << 20);
            let vfs = module.new_vfs(vfs).unwrap();
            Fixture {
                bridge: Bridge::default(),
                module,
                vfs,
            }
        }

        fn open(&mut self, name: &str, flags: OpenFlags) -> (c_int, ptr_t) {
            let name = Filename::new(name).to_engine();
            let z_name = self.module.new_bytes(&name).unwrap() + 4;
            self.open_at(z_name, flags)
        }

        fn open_at(&mut self, z_name: ptr_t, flags: OpenFlags) -> (c_int, ptr_t) {
            let file = self.module.new_file().unwrap();
            let out = self.module.malloc(8).unwrap();
            let rc = self
                .bridge
                .open(&mut self.module, self.vfs, z_name, file, flags.bits(), out, out + 4);
            (rc, file)
        }
    }

    fn db_flags() -> OpenFlags {
        OpenFlags::READWRITE | OpenFlags::CREATE | OpenFlags::MAIN_DB
    }

    #[test]
    fn test_open_close() {
        let mut fx = Fixture::new("memdb");
        let (rc, file) = fx.open("/test.db", db_flags());
        assert_eq!(rc, ffi::SQLITE_OK);
        assert_eq!(fx.bridge.handles(), 1);

        assert_eq!(fx.bridge.close(&mut fx.module, file), ffi::SQLITE_OK);
        assert_eq!(fx.bridge.handles(), 0);
        assert_eq!(fx.bridge.close(&mut fx.module, file), ffi::SQLITE_MISUSE);
    }

    #[test]
    fn test_open_out_params() {
        let mut fx = Fixture::new("memdb");
        let file = fx.module.new_file().unwrap();
        let out = fx.module.malloc(8).unwrap();
        let name = Filename::new("/out.db").to_engine();
        let z_name = fx.module.new_bytes(&name).unwrap() + 4;
        let rc = fx
            .bridge
            .open(&mut fx.module, fx.vfs, z_name, file, db_flags().bits(), out, out + 4);
        assert_eq!(rc, ffi::SQLITE_OK);
        let flags = OpenFlags::from_bits_retain(fx.module.read_i32(out).unwrap());
        assert!(flags.contains(OpenFlags::MEMORY));
        assert_eq!(fx.module.read_i32(out + 4).unwrap(), 0);
        assert_ne!(fx.module.read_u32(file + 4).unwrap(), 0);
    }

    #[test]
    fn test_unknown_vfs() {
        let mut fx = Fixture::new("nope");
        let (rc, _) = fx.open("/test.db", db_flags());
        assert_eq!(rc, ffi::SQLITE_ERROR);

        let name = fx.module.new_cstr("nope").unwrap();
        assert_eq!(fx.bridge.vfs_find(&mut fx.module, name), 0);
        let name = fx.module.new_cstr("memdb").unwrap();
        assert_eq!(fx.bridge.vfs_find(&mut fx.module, name), 1);
        assert_eq!(fx.bridge.vfs_find(&mut fx.module, 0), 1);
    }

    #[test]
    fn test_read_write() {
        let mut fx = Fixture::new("memdb");
        let (_, file) = fx.open("/rw.db", db_flags());
        let buf = fx.module.new_bytes(b"0123456789").unwrap();
        assert_eq!(fx.bridge.write(&mut fx.module, file, buf, 10, 0), ffi::SQLITE_OK);

        let out = fx.module.malloc(16).unwrap();
        fx.module.write_bytes(out, &[0xff; 16]).unwrap();
        assert_eq!(
            fx.bridge.read(&mut fx.module, file, out, 16, 0),
            ffi::SQLITE_IOERR_SHORT_READ
        );
        let read = fx.module.view(out, 16).unwrap();
        assert_eq!(&read[..10], b"0123456789");
        assert_eq!(&read[10..], &[0; 6]);

        let size = fx.module.malloc(8).unwrap();
        assert_eq!(fx.bridge.file_size(&mut fx.module, file, size), ffi::SQLITE_OK);
        assert_eq!(fx.module.read_i64(size).unwrap(), 10);
        assert_eq!(fx.bridge.truncate(&mut fx.module, file, 4), ffi::SQLITE_OK);
        assert_eq!(fx.bridge.file_size(&mut fx.module, file, size), ffi::SQLITE_OK);
        assert_eq!(fx.module.read_i64(size).unwrap(), 4);
        assert_eq!(fx.bridge.sync(&mut fx.module, file, ffi::SQLITE_SYNC_NORMAL), ffi::SQLITE_OK);
        assert_eq!(fx.bridge.read(&mut fx.module, file, out, -1, 0), ffi::SQLITE_MISUSE);
    }

    #[test]
    fn test_locks_and_file_control() {
        let mut fx = Fixture::new("memdb");
        let (_, file) = fx.open("/lock.db", db_flags());
        let arg = fx.module.malloc(8).unwrap();

        assert_eq!(fx.bridge.lock(&mut fx.module, file, ffi::SQLITE_LOCK_SHARED), ffi::SQLITE_OK);
        assert_eq!(fx.bridge.lock(&mut fx.module, file, ffi::SQLITE_LOCK_RESERVED), ffi::SQLITE_OK);
        assert_eq!(fx.bridge.check_reserved_lock(&mut fx.module, file, arg), ffi::SQLITE_OK);
        assert_eq!(fx.module.read_i32(arg).unwrap(), 1);
        assert_eq!(
            fx.bridge.file_control(&mut fx.module, file, ffi::SQLITE_FCNTL_LOCKSTATE, arg),
            ffi::SQLITE_OK
        );
        assert_eq!(fx.module.read_i32(arg).unwrap(), ffi::SQLITE_LOCK_RESERVED);
        assert_eq!(fx.bridge.unlock(&mut fx.module, file, ffi::SQLITE_LOCK_NONE), ffi::SQLITE_OK);
        assert_eq!(fx.bridge.lock(&mut fx.module, file, 9), ffi::SQLITE_MISUSE);

        assert_eq!(
            fx.bridge.file_control(&mut fx.module, file, ffi::SQLITE_FCNTL_VFSNAME, arg),
            ffi::SQLITE_NOTFOUND
        );
        fx.module.write_i64(arg, 1 << 20).unwrap();
        assert_eq!(
            fx.bridge.file_control(&mut fx.module, file, ffi::SQLITE_FCNTL_SIZE_HINT, arg),
            ffi::SQLITE_OK
        );
        let size = fx.module.malloc(8).unwrap();
        fx.bridge.file_size(&mut fx.module, file, size);
        assert_eq!(fx.module.read_i64(size).unwrap(), 1 << 20);

        assert_eq!(fx.bridge.sector_size(&mut fx.module, file), 65536);
        assert_eq!(fx.bridge.device_characteristics(&mut fx.module, file), 0x1601);
        assert_eq!(fx.bridge.sector_size(&mut fx.module, 0), 0);
    }

    #[test]
    fn test_pragma() {
        let mut fx = Fixture::new("memdb");
        let (_, file) = fx.open("/pragma.db", db_flags());
        let arg = fx.module.malloc(12).unwrap();
        let name = fx.module.new_cstr("Checksum_Verification").unwrap();
        fx.module.write_u32(arg, 0).unwrap();
        fx.module.write_u32(arg + 4, name).unwrap();
        fx.module.write_u32(arg + 8, 0).unwrap();
        assert_eq!(
            fx.bridge.file_control(&mut fx.module, file, ffi::SQLITE_FCNTL_PRAGMA, arg),
            ffi::SQLITE_OK
        );
        let result = fx.module.read_u32(arg).unwrap();
        assert_eq!(fx.module.read_cstr(result, 8).unwrap(), "0");

        let name = fx.module.new_cstr("journal_mode").unwrap();
        fx.module.write_u32(arg, 0).unwrap();
        fx.module.write_u32(arg + 4, name).unwrap();
        assert_eq!(
            fx.bridge.file_control(&mut fx.module, file, ffi::SQLITE_FCNTL_PRAGMA, arg),
            ffi::SQLITE_NOTFOUND
        );
        assert_eq!(fx.module.read_u32(arg).unwrap(), 0);
    }

    #[test]
    fn test_full_pathname() {
        let mut fx = Fixture::new("memdb");
        let path = fx.module.new_cstr("/a/b.db").unwrap();
        let out = fx.module.malloc(64).unwrap();
        assert_eq!(
            fx.bridge.full_pathname(&mut fx.module, fx.vfs, path, 64, out),
            ffi::SQLITE_OK
        );
        assert_eq!(fx.module.read_cstr(out, 64).unwrap(), "/a/b.db");
        assert_eq!(
            fx.bridge.full_pathname(&mut fx.module, fx.vfs, path, 7, out),
            ffi::SQLITE_CANTOPEN_FULLPATH
        );
    }

    #[test]
    fn test_vfs_methods() {
        let mut fx = Fixture::new("os");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.db");
        std::fs::write(&path, b"x").unwrap();
        let z_path = fx.module.new_cstr(path.to_str().unwrap()).unwrap();
        let res = fx.module.malloc(4).unwrap();

        let rc = fx
            .bridge
            .access(&mut fx.module, fx.vfs, z_path, ffi::SQLITE_ACCESS_EXISTS, res);
        assert_eq!(rc, ffi::SQLITE_OK);
        assert_eq!(fx.module.read_i32(res).unwrap(), 1);
        assert_eq!(fx.bridge.delete(&mut fx.module, fx.vfs, z_path, 0), ffi::SQLITE_OK);
        fx.bridge
            .access(&mut fx.module, fx.vfs, z_path, ffi::SQLITE_ACCESS_EXISTS, res);
        assert_eq!(fx.module.read_i32(res).unwrap(), 0);
        assert_eq!(
            fx.bridge.delete(&mut fx.module, fx.vfs, z_path, 0),
            ffi::SQLITE_IOERR_DELETE_NOENT
        );

        let buf = fx.module.malloc(16).unwrap();
        assert_eq!(fx.bridge.randomness(&mut fx.module, fx.vfs, 16, buf), 16);
        assert_eq!(fx.bridge.sleep(&mut fx.module, fx.vfs, 10), ffi::SQLITE_OK);
        assert_eq!(fx.bridge.current_time_64(&mut fx.module, fx.vfs, buf), ffi::SQLITE_OK);
        // Later than 2020-01-01.
        assert!(fx.module.read_i64(buf).unwrap() > 212_444_596_800_000);
    }

    #[test]
    fn test_localtime() {
        let mut fx = Fixture::new("memdb");
        let tm = fx.module.malloc(u64::from(ffi::SQLITE_TM_SIZE)).unwrap();
        assert_eq!(fx.bridge.localtime(&mut fx.module, tm, 1_700_000_000), ffi::SQLITE_OK);
        let field = |i: u32| fx.module.read_i32(tm + 4 * i).unwrap();
        assert!((0..60).contains(&field(0)));
        assert!((0..12).contains(&field(4)));
        assert_eq!(field(5), 123);
        assert!((0..7).contains(&field(6)));
        assert!((0..=1).contains(&field(8)));
        assert_ne!(fx.bridge.localtime(&mut fx.module, tm, i64::MAX), ffi::SQLITE_OK);
    }

    #[test]
    fn test_value_handles() {
        let bridge = Bridge::default();
        let id = bridge.add_handle(41u64);
        assert_eq!(bridge.with_handle(id, |v: &mut u64| {
            *v += 1;
            *v
        }), Some(42));
        assert_eq!(bridge.with_handle(id, |v: &mut String| v.len()), None);
        bridge.del_handle(id).unwrap();
        assert!(bridge.del_handle(id).is_err());
    }

    #[test]
    fn test_arena_and_close_all() {
        let mut fx = Fixture::new("memdb");
        fx.open("/a.db", db_flags());
        fx.open("/b.db", db_flags());
        fx.bridge.add_handle("data");
        assert!(fx.bridge.registry().memdb().contains("a.db"));
        let before = fx.module.allocations();
        let ptr = fx
            .bridge
            .with_arena(&mut fx.module, |arena, module| arena.string(module, "main"))
            .unwrap();
        assert_ne!(ptr, 0);
        assert_eq!(fx.module.allocations(), before + 1);

        fx.bridge.close_all(&mut fx.module);
        assert_eq!(fx.bridge.handles(), 0);
        assert_eq!(fx.module.allocations(), before);
        assert!(!fx.bridge.registry().memdb().contains("a.db"));
    }
}

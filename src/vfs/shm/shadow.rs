use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{lock_slots, unlock_slots, SharedMemory, SlotCounts, SlotsHeld, WalLock, WalLockMode};
use super::SHM_REGION_SIZE;
use crate::bridge::{Module, ModuleExt};
use crate::error::Error;
use crate::ffi::{self, ptr_t};
use crate::vfs::os::dotlock::DotLocks;
use crate::vfs::Result;

/// Bytes of the WAL-index header: two 48 byte copies of the index header,
/// and the checkpoint information.
const HEADER_SIZE: usize = 136;
const PAGE: usize = SHM_REGION_SIZE as usize;

type Page = Box<[u8]>;

fn new_page() -> Page {
    vec![0; PAGE].into_boxed_slice()
}

#[derive(Default)]
struct Shared {
    pages: Vec<Page>,
    locks: SlotCounts,
}

struct Parent {
    shared: Arc<Mutex<Shared>>,
    refs: usize,
}

/// The shadowed WAL-indexes of this process, by `-shm` path.
#[derive(Default)]
pub struct ShadowRegistry {
    parents: Mutex<HashMap<PathBuf, Parent>>,
}

/// The WAL-index in host memory, shared by every connection in the process.
///
/// Each connection keeps a private copy in sandbox memory and a shadow of
/// what it last exchanged with the shared buffers. Changes move between
/// them a 32 bit word at a time, when locks are taken and released:
///
/// - The header is two checksummed copies of the same 48 bytes, read
///   between barriers, and 4 byte aligned checkpoint words.
/// - The hash tables only change under the exclusive write lock.
///
/// So a torn copy is either detected by the engine, or cannot happen.
pub struct ShadowShm {
    registry: Arc<ShadowRegistry>,
    path: PathBuf,
    dot_lock: bool,
    open: bool,
    shadow: Vec<Page>,
    ptrs: Vec<ptr_t>,
    held: SlotsHeld,
}

impl ShadowShm {
    /// `path` names the `-shm` file. With `dot_lock`, a `<path>.lock`
    /// directory keeps other processes out while the index is open.
    pub fn new(registry: &Arc<ShadowRegistry>, path: impl Into<PathBuf>, dot_lock: bool) -> Self {
        ShadowShm {
            registry: Arc::clone(registry),
            path: path.into(),
            dot_lock,
            open: false,
            shadow: Vec::new(),
            ptrs: Vec::new(),
            held: SlotsHeld::default(),
        }
    }

    fn open(&mut self) -> Result<()> {
        if self.open {
            return Ok(());
        }
        let mut parents = self.registry.parents.lock();
        match parents.get_mut(&self.path) {
            Some(parent) => parent.refs += 1,
            None => {
                if self.dot_lock {
                    DotLocks::create_dir(&self.path)?;
                }
                parents.insert(
                    self.path.clone(),
                    Parent {
                        shared: Arc::default(),
                        refs: 1,
                    },
                );
            }
        }
        self.open = true;
        Ok(())
    }

    /// Runs `f` with the shared state, if open. Only the entry for this
    /// path is locked while `f` runs.
    fn with_shared<T>(&mut self, f: impl FnOnce(&mut Self, &mut Shared) -> Result<T>) -> Result<T> {
        if !self.open {
            return Err(Error::new(ffi::SQLITE_IOERR_SHMLOCK));
        }
        let shared = self
            .registry
            .parents
            .lock()
            .get(&self.path)
            .map(|parent| Arc::clone(&parent.shared))
            .ok_or_else(|| Error::new(ffi::SQLITE_IOERR_SHMLOCK))?;
        let mut shared = shared.lock();
        f(self, &mut shared)
    }

    /// Copies words other connections changed into sandbox memory.
    fn acquire(&mut self, shared: &Shared, module: &mut dyn Module) -> Result<()> {
        let (Some(shadow), Some(page)) = (self.shadow.first(), shared.pages.first()) else {
            return Ok(());
        };
        if shadow[..HEADER_SIZE] == page[..HEADER_SIZE] {
            return Ok(());
        }
        for (i, &ptr) in self.ptrs.iter().enumerate() {
            let private = module.view_mut(ptr, PAGE)?;
            copy_changed(&shared.pages[i], &mut self.shadow[i], private);
        }
        Ok(())
    }

    /// Publishes words this connection changed.
    fn release(&mut self, shared: &mut Shared, module: &mut dyn Module) -> Result<()> {
        let Some(&first) = self.ptrs.first() else {
            return Ok(());
        };
        if self.shadow[0][..HEADER_SIZE] == *module.view(first, HEADER_SIZE)? {
            return Ok(());
        }
        for (i, &ptr) in self.ptrs.iter().enumerate() {
            let private = module.view(ptr, PAGE)?;
            copy_changed(private, &mut self.shadow[i], &mut shared.pages[i]);
        }
        Ok(())
    }

    fn detach(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let mut parents = self.registry.parents.lock();
        let Some(parent) = parents.get_mut(&self.path) else {
            return;
        };
        unlock_slots(
            &mut parent.shared.lock().locks,
            &mut self.held,
            WalLock::ALL,
        );
        parent.refs -= 1;
        if parent.refs == 0 {
            parents.remove(&self.path);
            if self.dot_lock {
                if let Err(err) = DotLocks::remove_dir(&self.path) {
                    log::warn!("cannot remove shared memory lock: {err}");
                }
            }
        }
    }
}

/// Copies the words of `src` that differ from `shadow` to both `shadow`
/// and `dst`.
fn copy_changed(src: &[u8], shadow: &mut [u8], dst: &mut [u8]) {
    let words = src
        .chunks_exact(4)
        .zip(shadow.chunks_exact_mut(4))
        .zip(dst.chunks_exact_mut(4));
    for ((src, shadow), dst) in words {
        if src != shadow {
            shadow.copy_from_slice(src);
            dst.copy_from_slice(src);
        }
    }
}

impl SharedMemory for ShadowShm {
    fn map(&mut self, module: &mut dyn Module, region: u32, size: u32, extend: bool) -> Result<u32> {
        if size != SHM_REGION_SIZE {
            return Err(Error::new(ffi::SQLITE_IOERR_SHMMAP));
        }
        self.open()?;
        let region = region as usize;
        self.with_shared(|this, shared| {
            if shared.pages.len() <= region {
                if !extend {
                    return Ok(0);
                }
                shared.pages.resize_with(region + 1, new_page);
            }
            while this.ptrs.len() <= region {
                let ptr = module.malloc(u64::from(SHM_REGION_SIZE))?;
                module.view_mut(ptr, PAGE)?.fill(0);
                this.ptrs.push(ptr);
                this.shadow.push(new_page());
            }
            // Force a full copy: byte 4 of the shared header is never set.
            this.shadow[0][4] = 1;
            this.acquire(shared, module)?;
            Ok(this.ptrs[region])
        })
    }

    fn lock(&mut self, module: &mut dyn Module, locks: WalLock, mode: WalLockMode) -> Result<()> {
        self.with_shared(|this, shared| {
            lock_slots(&mut shared.locks, &mut this.held, locks, mode)?;
            this.acquire(shared, module)
        })
    }

    fn unlock(&mut self, module: &mut dyn Module, locks: WalLock, mode: WalLockMode) -> Result<()> {
        self.with_shared(|this, shared| {
            if mode == WalLockMode::Exclusive {
                this.release(shared, module)?;
            }
            unlock_slots(&mut shared.locks, &mut this.held, locks);
            Ok(())
        })
    }

    fn barrier(&mut self, module: &mut dyn Module) {
        let rc = self.with_shared(|this, shared| {
            this.acquire(shared, module)?;
            this.release(shared, module)
        });
        if let Err(err) = rc {
            log::debug!("shared memory barrier: {err}");
        }
    }

    fn unmap(&mut self, module: &mut dyn Module, _delete: bool) -> Result<()> {
        if self.open {
            self.with_shared(|this, shared| this.release(shared, module))?;
        }
        for ptr in self.ptrs.drain(..) {
            module.free(ptr)?;
        }
        self.shadow.clear();
        self.detach();
        Ok(())
    }

    fn close(&mut self) {
        self.ptrs.clear();
        self.shadow.clear();
        self.detach();
    }
}

impl Drop for ShadowShm {
    fn drop(&mut self) {
        self.detach();
    }
}

impl ShadowRegistry {
    /// Number of `-shm` paths with open connections.
    pub fn len(&self) -> usize {
        self.parents.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `path` is open in this process.
    pub fn contains(&self, path: &Path) -> bool {
        self.parents.lock().contains_key(path)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bridge::HeapModule;

    fn setup() -> (Arc<ShadowRegistry>, [HeapModule; 2], [ShadowShm; 2]) {
        let registry = Arc::new(ShadowRegistry::default());
        let modules = [HeapModule::new(1 << 20), HeapModule::new(1 << 20)];
        let shms = [
            ShadowShm::new(&registry, "/db-shm", false),
            ShadowShm::new(&registry, "/db-shm", false),
        ];
        (registry, modules, shms)
    }

    #[test]
    fn test_writes_travel_through_exclusive_unlock() {
        let (registry, [mut m1, mut m2], [mut s1, mut s2]) = setup();
        assert_eq!(s1.map(&mut m1, 0, SHM_REGION_SIZE, false).unwrap(), 0);
        let p1 = s1.map(&mut m1, 0, SHM_REGION_SIZE, true).unwrap();
        let p2 = s2.map(&mut m2, 0, SHM_REGION_SIZE, false).unwrap();
        assert_eq!(registry.len(), 1);

        s1.lock(&mut m1, WalLock::WRITE, WalLockMode::Exclusive).unwrap();
        m1.write_u32(p1 + 16, 42).unwrap();
        m1.write_u32(p1 + 1000, 7).unwrap();
        assert!(s2
            .lock(&mut m2, WalLock::WRITE, WalLockMode::Shared)
            .unwrap_err()
            .is_busy());
        s1.unlock(&mut m1, WalLock::WRITE, WalLockMode::Exclusive).unwrap();

        assert_eq!(m2.read_u32(p2 + 16).unwrap(), 0);
        s2.lock(&mut m2, WalLock::read(0).unwrap(), WalLockMode::Shared).unwrap();
        assert_eq!(m2.read_u32(p2 + 16).unwrap(), 42);
        assert_eq!(m2.read_u32(p2 + 1000).unwrap(), 7);

        s1.unmap(&mut m1, false).unwrap();
        s2.unmap(&mut m2, false).unwrap();
        assert!(registry.is_empty());
        assert_eq!(m1.allocations(), 0);
    }

    #[test]
    fn test_unchanged_header_skips_tables() {
        let (_registry, [mut m1, mut m2], [mut s1, mut s2]) = setup();
        let p1 = s1.map(&mut m1, 0, SHM_REGION_SIZE, true).unwrap();
        let p2 = s2.map(&mut m2, 0, SHM_REGION_SIZE, true).unwrap();

        // A table word changed without touching the header is not published.
        s1.lock(&mut m1, WalLock::WRITE, WalLockMode::Exclusive).unwrap();
        m1.write_u32(p1 + 4096, 9).unwrap();
        s1.unlock(&mut m1, WalLock::WRITE, WalLockMode::Exclusive).unwrap();
        s2.barrier(&mut m2);
        assert_eq!(m2.read_u32(p2 + 4096).unwrap(), 0);

        s1.lock(&mut m1, WalLock::WRITE, WalLockMode::Exclusive).unwrap();
        m1.write_u32(p1, 1).unwrap();
        s1.unlock(&mut m1, WalLock::WRITE, WalLockMode::Exclusive).unwrap();
        s2.barrier(&mut m2);
        assert_eq!(m2.read_u32(p2 + 4096).unwrap(), 9);
    }

    #[test]
    fn test_close_releases_slots() {
        let (registry, [mut m1, mut m2], [mut s1, mut s2]) = setup();
        s1.map(&mut m1, 0, SHM_REGION_SIZE, true).unwrap();
        s2.map(&mut m2, 0, SHM_REGION_SIZE, true).unwrap();
        let recover = WalLock::RECOVER;
        s1.lock(&mut m1, recover, WalLockMode::Exclusive).unwrap();
        s1.close();
        s2.lock(&mut m2, recover, WalLockMode::Exclusive).unwrap();
        assert!(registry.contains(Path::new("/db-shm")));
        drop(s2);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_region_size_and_unopened_lock() {
        let (_registry, [mut m1, _], [mut s1, _]) = setup();
        assert_eq!(
            s1.map(&mut m1, 0, 4096, true).unwrap_err().extended_code(),
            ffi::SQLITE_IOERR_SHMMAP
        );
        assert_eq!(
            s1.lock(&mut m1, WalLock::WRITE, WalLockMode::Shared)
                .unwrap_err()
                .extended_code(),
            ffi::SQLITE_IOERR_SHMLOCK
        );
    }

    #[test]
    fn test_paths_do_not_serialize() {
        let (registry, [mut m1, mut m2], [mut s1, _]) = setup();
        let mut other = ShadowShm::new(&registry, "/other-shm", false);
        s1.map(&mut m1, 0, SHM_REGION_SIZE, true).unwrap();

        let (free, mapped) = s1
            .with_shared(|_, _| {
                let free = registry.parents.try_lock().is_some();
                // Another database opens and copies while this one is busy.
                let mapped = other.map(&mut m2, 0, SHM_REGION_SIZE, true)?;
                other.lock(&mut m2, WalLock::WRITE, WalLockMode::Exclusive)?;
                other.unlock(&mut m2, WalLock::WRITE, WalLockMode::Exclusive)?;
                Ok((free, mapped))
            })
            .unwrap();
        assert!(free);
        assert_ne!(mapped, 0);
        assert_eq!(registry.len(), 2);

        other.unmap(&mut m2, false).unwrap();
        assert!(!registry.contains(Path::new("/other-shm")));
    }
}

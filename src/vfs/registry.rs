//! Named VFSes, as found by `sqlite3_vfs_find`.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::VfsConfig;
use crate::vfs::memdb::MemDbVfs;
use crate::vfs::os::OsVfs;
use crate::vfs::reader::ReaderVfs;
use crate::vfs::Vfs;

/// Maps names to VFSes.
///
/// The empty name and `"os"` always resolve to the OS VFS and cannot be
/// registered. `"memdb"` and `"reader"` are registered on creation, and can
/// be replaced.
pub struct VfsRegistry {
    os: Arc<OsVfs>,
    memdb: Arc<MemDbVfs>,
    reader: Arc<ReaderVfs>,
    vfs: RwLock<HashMap<String, Arc<dyn Vfs>>>,
}

impl Default for VfsRegistry {
    fn default() -> Self {
        Self::new(VfsConfig::default())
    }
}

impl VfsRegistry {
    /// Creates a registry whose OS VFS uses `config`.
    pub fn new(config: VfsConfig) -> Self {
        let os = Arc::new(OsVfs::new(config));
        let memdb = Arc::new(MemDbVfs::new());
        let reader = Arc::new(ReaderVfs::new(os.clone()));

        let mut vfs: HashMap<String, Arc<dyn Vfs>> = HashMap::new();
        vfs.insert("memdb".to_owned(), memdb.clone());
        vfs.insert("reader".to_owned(), reader.clone());
        VfsRegistry {
            os,
            memdb,
            reader,
            vfs: RwLock::new(vfs),
        }
    }

    /// Looks up a VFS by name.
    pub fn find(&self, name: &str) -> Option<Arc<dyn Vfs>> {
        if is_reserved(name) {
            return Some(self.os.clone());
        }
        self.vfs.read().get(name).cloned()
    }

    /// Registers `vfs` under `name`, replacing any previous one. Reserved
    /// names are ignored.
    pub fn register(&self, name: &str, vfs: Arc<dyn Vfs>) {
        if is_reserved(name) {
            log::debug!("cannot register reserved VFS name {name:?}");
            return;
        }
        self.vfs.write().insert(name.to_owned(), vfs);
    }

    /// Removes the VFS registered under `name`. Files already open through
    /// it stay usable.
    pub fn unregister(&self, name: &str) {
        self.vfs.write().remove(name);
    }

    /// The OS VFS.
    pub fn os(&self) -> &Arc<OsVfs> {
        &self.os
    }

    /// The built-in `memdb` VFS, whether or not it is still registered.
    pub fn memdb(&self) -> &Arc<MemDbVfs> {
        &self.memdb
    }

    /// The built-in `reader` VFS, whether or not it is still registered.
    pub fn reader(&self) -> &Arc<ReaderVfs> {
        &self.reader
    }
}

fn is_reserved(name: &str) -> bool {
    name.is_empty() || name == "os"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{Filename, OpenFlags};

    #[test]
    fn test_reserved_names() {
        let registry = VfsRegistry::default();
        let os = registry.find("").unwrap();
        assert!(Arc::ptr_eq(&os, &registry.find("os").unwrap()));

        registry.register("os", Arc::new(MemDbVfs::new()));
        let flags = OpenFlags::READWRITE | OpenFlags::CREATE | OpenFlags::TEMP_JOURNAL;
        let file = registry.find("os").unwrap().open(None, flags).unwrap();
        assert!(!file.flags().contains(OpenFlags::MEMORY));
    }

    #[test]
    fn test_register_unregister() {
        let registry = VfsRegistry::default();
        assert!(registry.find("memdb").is_some());
        assert!(registry.find("reader").is_some());
        assert!(registry.find("custom").is_none());

        registry.register("custom", registry.memdb().clone());
        registry.register("custom", registry.memdb().clone());
        let custom = registry.find("custom").unwrap();
        let file = custom
            .open(
                Some(&Filename::new("/x")),
                OpenFlags::READWRITE | OpenFlags::CREATE | OpenFlags::MAIN_DB,
            )
            .unwrap();
        assert!(file.flags().contains(OpenFlags::MEMORY));

        registry.unregister("custom");
        assert!(registry.find("custom").is_none());
        registry.unregister("custom");
    }
}

//! Host-side virtual file systems for SQLite compiled to WebAssembly.
//!
//! The engine runs inside a sandbox with no access to the host. Every file
//! operation it performs is forwarded to host functions, which
//! [`bridge::Bridge`] implements on top of the [`vfs::Vfs`] implementations
//! in [`vfs`]:
//!
//! ```rust
//! use std::sync::Arc;
//! use wasqlite::bridge::{Bridge, HeapModule, ModuleExt};
//! use wasqlite::vfs::VfsRegistry;
//!
//! let bridge = Bridge::new(Arc::new(VfsRegistry::default()));
//! let mut module = HeapModule::new(1 << 16);
//! let name = module.new_cstr("memdb").unwrap();
//! assert_eq!(bridge.vfs_find(&mut module, name), 1);
//! ```
//!
//! A runtime adapter for `wasmtime` is available behind the `wasmtime`
//! feature.
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use wasqlite_sys as ffi;

pub use crate::error::Error;

#[allow(missing_docs)]
pub mod bridge;
pub mod config;
mod error;
#[allow(missing_docs)]
pub mod vfs;

pub use crate::error::IntoResultCodeExt;

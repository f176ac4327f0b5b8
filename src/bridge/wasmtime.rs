//! Host functions for a wasmtime [`Linker`].
//!
//! ```no_run
//! use wasqlite::bridge::{wasmtime::{add_to_linker, BridgeState}, Bridge};
//!
//! struct State(Bridge);
//!
//! impl BridgeState for State {
//!     fn bridge(&self) -> &Bridge {
//!         &self.0
//!     }
//! }
//!
//! # fn main() -> anyhow::Result<()> {
//! let engine = wasmtime::Engine::default();
//! let mut linker = wasmtime::Linker::<State>::new(&engine);
//! add_to_linker(&mut linker)?;
//! # Ok(())
//! # }
//! ```

use ::wasmtime::{Caller, Extern, Linker, Memory, WasmParams, WasmResults};

use super::{Bridge, Module};
use crate::error::Error;
use crate::ffi::{self, ptr_t};
use crate::vfs::Result;

/// Store data that carries the module's [`Bridge`].
pub trait BridgeState {
    fn bridge(&self) -> &Bridge;
}

/// A [`Module`] over the instance calling a host function.
struct CallerModule<'a, 'b, T> {
    caller: &'a mut Caller<'b, T>,
    memory: Memory,
}

impl<T> CallerModule<'_, '_, T> {
    fn call<P: WasmParams, R: WasmResults>(&mut self, name: &str, params: P) -> Result<R> {
        let func = self
            .caller
            .get_export(name)
            .and_then(Extern::into_func)
            .ok_or_else(|| Error::with_message(ffi::SQLITE_ERROR, format!("missing export {name}")))?;
        let func = func
            .typed::<P, R>(&*self.caller)
            .map_err(|err| Error::with_message(ffi::SQLITE_ERROR, err.to_string()))?;
        func.call(&mut *self.caller, params)
            .map_err(|err| Error::with_message(ffi::SQLITE_ERROR, err.to_string()))
    }
}

impl<T> Module for CallerModule<'_, '_, T> {
    fn memory(&self) -> &[u8] {
        self.memory.data(&*self.caller)
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        self.memory.data_mut(&mut *self.caller)
    }

    fn malloc(&mut self, size: u64) -> Result<ptr_t> {
        match self.call::<u64, u32>("sqlite3_malloc64", size)? {
            0 => Err(Error::new(ffi::SQLITE_NOMEM)),
            ptr => Ok(ptr),
        }
    }

    fn free(&mut self, ptr: ptr_t) -> Result<()> {
        self.call::<u32, ()>("sqlite3_free", ptr)
    }

    fn aligned_alloc(&mut self, align: u64, size: u64) -> Result<ptr_t> {
        let align = u32::try_from(align).map_err(|_| Error::misuse("invalid alignment"))?;
        let size = u32::try_from(size).map_err(|_| Error::new(ffi::SQLITE_NOMEM))?;
        match self.call::<(u32, u32), u32>("aligned_alloc", (align, size))? {
            0 => Err(Error::new(ffi::SQLITE_NOMEM)),
            ptr => Ok(ptr),
        }
    }

    fn database_file_object(&mut self, name: ptr_t) -> Result<ptr_t> {
        self.call::<u32, u32>("sqlite3_database_file_object", name)
    }
}

fn with_module<T: BridgeState, R>(
    caller: &mut Caller<'_, T>,
    f: impl FnOnce(&Bridge, &mut dyn Module) -> R,
) -> anyhow::Result<R> {
    let bridge = caller.data().bridge().clone();
    let memory = caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| anyhow::anyhow!("module does not export its memory"))?;
    let mut module = CallerModule { caller, memory };
    Ok(f(&bridge, &mut module))
}

/// Defines every `go_*` import of the `env` module in `linker`.
pub fn add_to_linker<T: BridgeState + 'static>(linker: &mut Linker<T>) -> anyhow::Result<()> {
    linker.func_wrap("env", "go_vfs_find", |mut caller: Caller<'_, T>, z_name: u32| {
        with_module(&mut caller, |b, m| b.vfs_find(m, z_name))
    })?;
    linker.func_wrap("env", "go_localtime", |mut caller: Caller<'_, T>, p_tm: u32, t: i64| {
        with_module(&mut caller, |b, m| b.localtime(m, p_tm, t))
    })?;
    linker.func_wrap(
        "env",
        "go_randomness",
        |mut caller: Caller<'_, T>, p_vfs: u32, n_byte: i32, z_byte: u32| {
            with_module(&mut caller, |b, m| b.randomness(m, p_vfs, n_byte, z_byte))
        },
    )?;
    linker.func_wrap("env", "go_sleep", |mut caller: Caller<'_, T>, p_vfs: u32, n_micro: i32| {
        with_module(&mut caller, |b, m| b.sleep(m, p_vfs, n_micro))
    })?;
    linker.func_wrap(
        "env",
        "go_current_time_64",
        |mut caller: Caller<'_, T>, p_vfs: u32, pi_now: u32| {
            with_module(&mut caller, |b, m| b.current_time_64(m, p_vfs, pi_now))
        },
    )?;
    linker.func_wrap(
        "env",
        "go_full_pathname",
        |mut caller: Caller<'_, T>, p_vfs: u32, z_relative: u32, n_full: i32, z_full: u32| {
            with_module(&mut caller, |b, m| {
                b.full_pathname(m, p_vfs, z_relative, n_full, z_full)
            })
        },
    )?;
    linker.func_wrap(
        "env",
        "go_delete",
        |mut caller: Caller<'_, T>, p_vfs: u32, z_path: u32, sync_dir: i32| {
            with_module(&mut caller, |b, m| b.delete(m, p_vfs, z_path, sync_dir))
        },
    )?;
    linker.func_wrap(
        "env",
        "go_access",
        |mut caller: Caller<'_, T>, p_vfs: u32, z_path: u32, flags: i32, p_res_out: u32| {
            with_module(&mut caller, |b, m| b.access(m, p_vfs, z_path, flags, p_res_out))
        },
    )?;
    linker.func_wrap(
        "env",
        "go_open",
        |mut caller: Caller<'_, T>,
         p_vfs: u32,
         z_name: u32,
         p_file: u32,
         flags: i32,
         p_out_flags: u32,
         p_out_shm: u32| {
            with_module(&mut caller, |b, m| {
                b.open(m, p_vfs, z_name, p_file, flags, p_out_flags, p_out_shm)
            })
        },
    )?;
    linker.func_wrap("env", "go_close", |mut caller: Caller<'_, T>, p_file: u32| {
        with_module(&mut caller, |b, m| b.close(m, p_file))
    })?;
    linker.func_wrap(
        "env",
        "go_read",
        |mut caller: Caller<'_, T>, p_file: u32, z_buf: u32, i_amt: i32, i_ofst: i64| {
            with_module(&mut caller, |b, m| b.read(m, p_file, z_buf, i_amt, i_ofst))
        },
    )?;
    linker.func_wrap(
        "env",
        "go_write",
        |mut caller: Caller<'_, T>, p_file: u32, z_buf: u32, i_amt: i32, i_ofst: i64| {
            with_module(&mut caller, |b, m| b.write(m, p_file, z_buf, i_amt, i_ofst))
        },
    )?;
    linker.func_wrap("env", "go_truncate", |mut caller: Caller<'_, T>, p_file: u32, n_byte: i64| {
        with_module(&mut caller, |b, m| b.truncate(m, p_file, n_byte))
    })?;
    linker.func_wrap("env", "go_sync", |mut caller: Caller<'_, T>, p_file: u32, flags: i32| {
        with_module(&mut caller, |b, m| b.sync(m, p_file, flags))
    })?;
    linker.func_wrap("env", "go_file_size", |mut caller: Caller<'_, T>, p_file: u32, p_size: u32| {
        with_module(&mut caller, |b, m| b.file_size(m, p_file, p_size))
    })?;
    linker.func_wrap("env", "go_lock", |mut caller: Caller<'_, T>, p_file: u32, level: i32| {
        with_module(&mut caller, |b, m| b.lock(m, p_file, level))
    })?;
    linker.func_wrap("env", "go_unlock", |mut caller: Caller<'_, T>, p_file: u32, level: i32| {
        with_module(&mut caller, |b, m| b.unlock(m, p_file, level))
    })?;
    linker.func_wrap(
        "env",
        "go_check_reserved_lock",
        |mut caller: Caller<'_, T>, p_file: u32, p_res_out: u32| {
            with_module(&mut caller, |b, m| b.check_reserved_lock(m, p_file, p_res_out))
        },
    )?;
    linker.func_wrap(
        "env",
        "go_file_control",
        |mut caller: Caller<'_, T>, p_file: u32, op: i32, p_arg: u32| {
            with_module(&mut caller, |b, m| b.file_control(m, p_file, op, p_arg))
        },
    )?;
    linker.func_wrap("env", "go_sector_size", |mut caller: Caller<'_, T>, p_file: u32| {
        with_module(&mut caller, |b, m| b.sector_size(m, p_file))
    })?;
    linker.func_wrap(
        "env",
        "go_device_characteristics",
        |mut caller: Caller<'_, T>, p_file: u32| {
            with_module(&mut caller, |b, m| b.device_characteristics(m, p_file))
        },
    )?;
    linker.func_wrap("env", "go_shm_barrier", |mut caller: Caller<'_, T>, p_file: u32| {
        with_module(&mut caller, |b, m| b.shm_barrier(m, p_file))
    })?;
    linker.func_wrap(
        "env",
        "go_shm_map",
        |mut caller: Caller<'_, T>, p_file: u32, i_region: i32, sz_region: i32, b_extend: i32, pp: u32| {
            with_module(&mut caller, |b, m| {
                b.shm_map(m, p_file, i_region, sz_region, b_extend, pp)
            })
        },
    )?;
    linker.func_wrap(
        "env",
        "go_shm_lock",
        |mut caller: Caller<'_, T>, p_file: u32, offset: i32, n: i32, flags: i32| {
            with_module(&mut caller, |b, m| b.shm_lock(m, p_file, offset, n, flags))
        },
    )?;
    linker.func_wrap(
        "env",
        "go_shm_unmap",
        |mut caller: Caller<'_, T>, p_file: u32, b_delete: i32| {
            with_module(&mut caller, |b, m| b.shm_unmap(m, p_file, b_delete))
        },
    )?;
    Ok(())
}

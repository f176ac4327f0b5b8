//! Access to the memory and allocator of a sandboxed module.

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;

use crate::error::Error;
use crate::ffi::{self, ptr_t};
use crate::vfs::Result;

/// The sandbox side of a host call: its linear memory, and the engine's
/// allocator.
///
/// Pointers are offsets into [`Module::memory`].
pub trait Module {
    /// The module's linear memory.
    fn memory(&self) -> &[u8];

    /// The module's linear memory, writable.
    fn memory_mut(&mut self) -> &mut [u8];

    /// `sqlite3_malloc64`. Fails with `SQLITE_NOMEM` when exhausted.
    fn malloc(&mut self, size: u64) -> Result<ptr_t>;

    /// `sqlite3_free`.
    fn free(&mut self, ptr: ptr_t) -> Result<()>;

    /// Allocates `size` bytes aligned to `align`, a power of two.
    fn aligned_alloc(&mut self, align: u64, size: u64) -> Result<ptr_t>;

    /// `sqlite3_database_file_object`: the engine's file object for the main
    /// database named at `name`, or 0.
    fn database_file_object(&mut self, name: ptr_t) -> Result<ptr_t>;
}

/// Typed, bounds-checked access to module memory.
pub trait ModuleExt: Module {
    fn view(&self, ptr: ptr_t, len: usize) -> Result<&[u8]> {
        let start = ptr as usize;
        start
            .checked_add(len)
            .and_then(|end| self.memory().get(start..end))
            .ok_or_else(|| Error::misuse("pointer out of range"))
    }

    fn view_mut(&mut self, ptr: ptr_t, len: usize) -> Result<&mut [u8]> {
        let start = ptr as usize;
        start
            .checked_add(len)
            .and_then(|end| self.memory_mut().get_mut(start..end))
            .ok_or_else(|| Error::misuse("pointer out of range"))
    }

    fn read_u32(&self, ptr: ptr_t) -> Result<u32> {
        let mut buf = [0; 4];
        buf.copy_from_slice(self.view(ptr, 4)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn write_u32(&mut self, ptr: ptr_t, value: u32) -> Result<()> {
        self.view_mut(ptr, 4)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn read_i32(&self, ptr: ptr_t) -> Result<i32> {
        self.read_u32(ptr).map(|v| v as i32)
    }

    fn write_i32(&mut self, ptr: ptr_t, value: i32) -> Result<()> {
        self.write_u32(ptr, value as u32)
    }

    fn read_i64(&self, ptr: ptr_t) -> Result<i64> {
        let mut buf = [0; 8];
        buf.copy_from_slice(self.view(ptr, 8)?);
        Ok(i64::from_le_bytes(buf))
    }

    fn write_i64(&mut self, ptr: ptr_t, value: i64) -> Result<()> {
        self.view_mut(ptr, 8)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Reads a NUL-terminated string of at most `max` bytes. Longer strings
    /// fail with `SQLITE_TOOBIG`.
    fn read_cstr(&self, ptr: ptr_t, max: usize) -> Result<String> {
        let memory = self.memory();
        let tail = memory
            .get(ptr as usize..)
            .ok_or_else(|| Error::misuse("pointer out of range"))?;
        let tail = &tail[..tail.len().min(max + 1)];
        let len = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::new(ffi::SQLITE_TOOBIG))?;
        String::from_utf8(tail[..len].to_vec()).map_err(|_| Error::misuse("string is not UTF-8"))
    }

    /// Copies `bytes` to `ptr`.
    fn write_bytes(&mut self, ptr: ptr_t, bytes: &[u8]) -> Result<()> {
        self.view_mut(ptr, bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    /// Allocates and writes a NUL-terminated copy of `s`.
    fn new_cstr(&mut self, s: &str) -> Result<ptr_t> {
        let ptr = self.malloc(s.len() as u64 + 1)?;
        self.write_bytes(ptr, s.as_bytes())?;
        self.write_bytes(ptr + s.len() as u32, &[0])?;
        Ok(ptr)
    }
}

impl<M: Module + ?Sized> ModuleExt for M {}

/// Alignment of [`HeapModule`] memory, as for a WebAssembly page.
const MEMORY_ALIGN: usize = 65536;

struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: AlignedBuf owns its allocation exclusively.
unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    fn new(len: usize) -> Self {
        let layout = Self::layout(len);
        // SAFETY: the layout has a nonzero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            alloc::handle_alloc_error(layout);
        };
        AlignedBuf { ptr, len }
    }

    fn layout(len: usize) -> Layout {
        Layout::from_size_align(len.max(1), MEMORY_ALIGN).unwrap_or(Layout::new::<u8>())
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len initialized bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for len initialized bytes, borrowed uniquely.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: allocated in new with the same layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), Self::layout(self.len)) }
    }
}

/// A [`Module`] whose memory is a host heap allocation.
///
/// Stands in for a sandbox where none is running: tests, and hosts driving
/// the bridge directly. Memory is aligned like WebAssembly pages, so shared
/// memory can be mapped into it.
pub struct HeapModule {
    memory: AlignedBuf,
    next: u32,
    live: HashMap<ptr_t, u32>,
    free: Vec<(ptr_t, u32)>,
    file_objects: HashMap<ptr_t, ptr_t>,
}

impl HeapModule {
    /// Allocates `size` bytes of memory, rounded up to whole pages.
    pub fn new(size: usize) -> Self {
        let size = size.div_ceil(MEMORY_ALIGN).max(1) * MEMORY_ALIGN;
        HeapModule {
            memory: AlignedBuf::new(size),
            next: 64,
            live: HashMap::new(),
            free: Vec::new(),
            file_objects: HashMap::new(),
        }
    }

    /// Writes `name` as a `sqlite3_vfs` whose `zName` is at the usual offset.
    pub fn new_vfs(&mut self, name: &str) -> Result<ptr_t> {
        let vfs = self.malloc(64)?;
        self.view_mut(vfs, 64)?.fill(0);
        let name = self.new_cstr(name)?;
        self.write_u32(vfs + ffi::SQLITE_VFS_NAME_OFFSET, name)?;
        Ok(vfs)
    }

    /// Allocates a zeroed `sqlite3_file` large enough for a handle id.
    pub fn new_file(&mut self) -> Result<ptr_t> {
        let file = self.malloc(16)?;
        self.view_mut(file, 16)?.fill(0);
        Ok(file)
    }

    /// Writes `bytes` to fresh memory.
    pub fn new_bytes(&mut self, bytes: &[u8]) -> Result<ptr_t> {
        let ptr = self.malloc(bytes.len().max(1) as u64)?;
        self.write_bytes(ptr, bytes)?;
        Ok(ptr)
    }

    /// Registers the `sqlite3_file` of the main database named at `name`, as
    /// the engine does when it opens it.
    pub fn set_database_file_object(&mut self, name: ptr_t, file: ptr_t) {
        self.file_objects.insert(name, file);
    }

    /// Number of live allocations.
    pub fn allocations(&self) -> usize {
        self.live.len()
    }

    fn alloc(&mut self, align: u32, size: u32) -> Result<ptr_t> {
        let size = size.max(1);
        if let Some(i) = self
            .free
            .iter()
            .position(|&(ptr, len)| len == size && ptr % align == 0)
        {
            let (ptr, _) = self.free.swap_remove(i);
            self.live.insert(ptr, size);
            return Ok(ptr);
        }
        let ptr = self
            .next
            .checked_next_multiple_of(align)
            .filter(|&p| p as usize + size as usize <= self.memory.len)
            .ok_or_else(|| Error::new(ffi::SQLITE_NOMEM))?;
        self.next = ptr + size;
        self.live.insert(ptr, size);
        Ok(ptr)
    }
}

impl Module for HeapModule {
    fn memory(&self) -> &[u8] {
        self.memory.as_slice()
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        self.memory.as_mut_slice()
    }

    fn malloc(&mut self, size: u64) -> Result<ptr_t> {
        let size = u32::try_from(size).map_err(|_| Error::new(ffi::SQLITE_NOMEM))?;
        self.alloc(8, size)
    }

    fn free(&mut self, ptr: ptr_t) -> Result<()> {
        if ptr == 0 {
            return Ok(());
        }
        let size = self
            .live
            .remove(&ptr)
            .ok_or_else(|| Error::misuse("free of unallocated pointer"))?;
        self.free.push((ptr, size));
        Ok(())
    }

    fn aligned_alloc(&mut self, align: u64, size: u64) -> Result<ptr_t> {
        let align = u32::try_from(align)
            .ok()
            .filter(|a| a.is_power_of_two())
            .ok_or_else(|| Error::misuse("invalid alignment"))?;
        let size = u32::try_from(size).map_err(|_| Error::new(ffi::SQLITE_NOMEM))?;
        self.alloc(align, size)
    }

    fn database_file_object(&mut self, name: ptr_t) -> Result<ptr_t> {
        Ok(self.file_objects.get(&name).copied().unwrap_or(0))
    }
}

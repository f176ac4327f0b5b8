//! Scratch memory in the sandbox for arguments of calls into the engine.

use crate::error::Error;
use crate::ffi::{self, ptr_t};
use crate::vfs::Result;

use super::{Module, ModuleExt};

/// Size of the block an [`Arena`] carves from.
pub const ARENA_SIZE: u32 = 4096;

/// A bump allocator over one block of sandbox memory.
///
/// Requests that do not fit in the block fall back to the engine's
/// allocator, and are freed on [`Arena::reset`]. Nothing is freed
/// individually.
#[derive(Debug)]
pub struct Arena {
    base: ptr_t,
    next: u32,
    size: u32,
    ptrs: Vec<ptr_t>,
}

/// A point to roll an [`Arena`] back to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Mark {
    ptrs: usize,
    next: u32,
}

impl Arena {
    /// Allocates the block from `module`.
    pub fn new(module: &mut dyn Module, size: u32) -> Result<Self> {
        let base = if size == 0 {
            0
        } else {
            module.malloc(u64::from(size))?
        };
        Ok(Arena {
            base,
            next: 0,
            size,
            ptrs: Vec::new(),
        })
    }

    /// Returns `size` bytes, aligned to 8 bytes when `size` is a multiple of
    /// 8 and to 4 otherwise.
    pub fn alloc(&mut self, module: &mut dyn Module, size: u64) -> Result<ptr_t> {
        let align = if size & 7 != 0 { 4 } else { 8 };
        self.next = self.next.next_multiple_of(align);
        if size <= u64::from(self.size.saturating_sub(self.next)) {
            let ptr = self.base + self.next;
            self.next += size as u32;
            return Ok(ptr);
        }
        let ptr = module.malloc(size)?;
        self.ptrs.push(ptr);
        Ok(ptr)
    }

    /// Copies `bytes` into the arena. Empty input is the null pointer.
    pub fn bytes(&mut self, module: &mut dyn Module, bytes: &[u8]) -> Result<ptr_t> {
        if bytes.is_empty() {
            return Ok(0);
        }
        let ptr = self.alloc(module, bytes.len() as u64)?;
        module.write_bytes(ptr, bytes)?;
        Ok(ptr)
    }

    /// Copies `s` into the arena as a NUL-terminated string.
    pub fn string(&mut self, module: &mut dyn Module, s: &str) -> Result<ptr_t> {
        if s.as_bytes().contains(&0) {
            return Err(Error::with_message(
                ffi::SQLITE_MISUSE,
                "string contains an interior NUL",
            ));
        }
        let ptr = self.alloc(module, s.len() as u64 + 1)?;
        module.write_bytes(ptr, s.as_bytes())?;
        module.write_bytes(ptr + s.len() as u32, &[0])?;
        Ok(ptr)
    }

    pub fn mark(&self) -> Mark {
        Mark {
            ptrs: self.ptrs.len(),
            next: self.next,
        }
    }

    /// Releases everything allocated since `mark`.
    pub fn reset(&mut self, module: &mut dyn Module, mark: Mark) -> Result<()> {
        let mut result = Ok(());
        for ptr in self.ptrs.drain(mark.ptrs.min(self.ptrs.len())..) {
            if let Err(err) = module.free(ptr) {
                result = Err(err);
            }
        }
        self.next = mark.next.min(self.next);
        result
    }

    /// Gives the block and any overflow allocations back to `module`.
    pub fn free(mut self, module: &mut dyn Module) -> Result<()> {
        self.reset(module, Mark { ptrs: 0, next: 0 })?;
        module.free(self.base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::HeapModule;

    #[test]
    fn test_alignment() {
        let mut module = HeapModule::new(1 << 16);
        let mut arena = Arena::new(&mut module, ARENA_SIZE).unwrap();
        let a = arena.alloc(&mut module, 3).unwrap();
        let b = arena.alloc(&mut module, 5).unwrap();
        let c = arena.alloc(&mut module, 8).unwrap();
        assert_eq!(b - a, 4);
        assert_eq!(c % 8, 0);
        assert_eq!(c - b, 12);
        assert_eq!(module.allocations(), 1);
    }

    #[test]
    fn test_overflow_and_reset() {
        let mut module = HeapModule::new(1 << 16);
        let mut arena = Arena::new(&mut module, 64).unwrap();
        let mark = arena.mark();
        let s = arena.string(&mut module, "main").unwrap();
        assert_eq!(module.read_cstr(s, 16).unwrap(), "main");
        arena.alloc(&mut module, 128).unwrap();
        assert_eq!(module.allocations(), 2);

        arena.reset(&mut module, mark).unwrap();
        assert_eq!(module.allocations(), 1);
        assert_eq!(arena.string(&mut module, "temp").unwrap(), s);

        assert_eq!(arena.bytes(&mut module, &[]).unwrap(), 0);
        let p = arena.bytes(&mut module, &[1, 2, 3]).unwrap();
        assert_eq!(module.view(p, 3).unwrap(), &[1, 2, 3]);
        assert!(arena.string(&mut module, "a\0b").is_err());

        arena.alloc(&mut module, 100).unwrap();
        arena.free(&mut module).unwrap();
        assert_eq!(module.allocations(), 0);
    }
}

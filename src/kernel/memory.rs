//! Memory primitives
//!
//! The physical allocator itself is external (see [`crate::platform`]); the
//! core only needs address types, the page size, and a record of which page
//! blocks a task owns so they can be released when it is destroyed.

use serde::Serialize;

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;

/// A physical address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PAddr(pub usize);

/// A kernel virtual address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct VAddr(pub usize);

impl VAddr {
    pub fn as_mut_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }
}

impl std::fmt::Display for PAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl std::fmt::Display for VAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// How a freshly allocated block is filled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    Zeroed,
    /// Contents are undefined; the caller overwrites them
    Uninitialized,
}

/// A page-aligned block owned by a task, freed when the task is destroyed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OwnedPages {
    pub paddr: PAddr,
    pub size: usize,
}

/// Round `value` up to a multiple of `align` (a power of two)
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

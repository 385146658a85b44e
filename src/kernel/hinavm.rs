//! HinaVM guest bytecode images
//!
//! A HinaVM task runs the in-kernel bytecode interpreter instead of native
//! code. At creation the instructions are copied into a page-aligned block
//! laid out as an [`Image`]; the interpreter's run routine gets the image's
//! address as its argument. The interpreter itself lives elsewhere.

use super::memory::{PAGE_SIZE, align_up};
use bytemuck::{Pod, Zeroable};

/// Maximum number of instructions in one program
pub const HINAVM_INSTS_MAX: usize = 128;

/// One precompiled instruction
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Instruction {
    pub opcode: u8,
    pub a: u8,
    pub b: u8,
    pub c: u8,
    pub imm: u32,
}

impl Instruction {
    pub const fn new(opcode: u8, a: u8, b: u8, c: u8, imm: u32) -> Self {
        Self {
            opcode,
            a,
            b,
            c,
            imm,
        }
    }
}

/// In-memory layout the interpreter reads
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Image {
    pub insts: [Instruction; HINAVM_INSTS_MAX],
    pub num_insts: u32,
    _reserved: u32,
}

impl Image {
    /// Build an image, or `None` if there are too many instructions
    pub fn new(insts: &[Instruction]) -> Option<Self> {
        if insts.len() > HINAVM_INSTS_MAX {
            return None;
        }
        let mut image = Image::zeroed();
        image.insts[..insts.len()].copy_from_slice(insts);
        image.num_insts = insts.len() as u32;
        Some(image)
    }

    /// Size of the block backing an image
    pub const fn block_size() -> usize {
        align_up(size_of::<Image>(), PAGE_SIZE)
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Read an image back from raw bytes (e.g. a copied-out block)
    pub fn from_bytes(bytes: &[u8]) -> Self {
        bytemuck::pod_read_unaligned(&bytes[..size_of::<Image>()])
    }

    pub fn program(&self) -> &[Instruction] {
        &self.insts[..self.num_insts as usize]
    }
}

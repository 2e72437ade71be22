//! # Block device view
//!
//! The durable state of the file system is one contiguous byte buffer,
//! logically partitioned into [`BLKSIZE`]-sized blocks. On-image
//! structures are read and written in place through typed views, so the
//! buffer is kept block-by-block with an alignment that satisfies every
//! `repr(C)` record stored on it.

use alloc::vec;
use alloc::vec::Vec;
use core::mem;

use crate::BLKSIZE;

/// One image block, over-aligned so that typed views taken at
/// word-aligned offsets are themselves properly aligned.
#[repr(C, align(8))]
#[derive(Clone)]
struct Block([u8; BLKSIZE]);

/// The simulated block device.
pub struct DiskImage {
    blocks: Vec<Block>,
}

impl DiskImage {
    /// An all-zero image of `total_blocks` blocks.
    pub fn blank(total_blocks: usize) -> Self {
        Self {
            blocks: vec![Block([0; BLKSIZE]); total_blocks],
        }
    }

    /// Adopt an existing image. The byte length must be a nonzero
    /// multiple of the block size.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() || bytes.len() % BLKSIZE != 0 {
            return None;
        }
        let mut image = Self::blank(bytes.len() / BLKSIZE);
        for (block, chunk) in image.blocks.iter_mut().zip(bytes.chunks_exact(BLKSIZE)) {
            block.0.copy_from_slice(chunk);
        }
        Some(image)
    }

    #[inline]
    pub fn total_blocks(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub fn block(&self, n: usize) -> &[u8; BLKSIZE] {
        &self.blocks[n].0
    }

    #[inline]
    pub fn block_mut(&mut self, n: usize) -> &mut [u8; BLKSIZE] {
        &mut self.blocks[n].0
    }

    pub fn zero_block(&mut self, n: usize) {
        self.blocks[n].0.fill(0);
    }

    /// Typed in-place view of the record at `offset` within block `n`.
    pub fn get_ref<T: Sized>(&self, n: usize, offset: usize) -> &T {
        let addr = self.record_addr::<T>(n, offset);
        unsafe { &*addr.cast() }
    }

    /// Mutable typed in-place view.
    pub fn get_mut<T: Sized>(&mut self, n: usize, offset: usize) -> &mut T {
        let addr = self.record_addr::<T>(n, offset);
        unsafe { &mut *addr.cast_mut().cast() }
    }

    /// Pointer slot `idx` of block `n`. Pointer-holding blocks are arrays
    /// of little-endian u32 block numbers.
    pub fn slot(&self, n: usize, idx: usize) -> u32 {
        let bytes = &self.block(n)[idx * 4..idx * 4 + 4];
        u32::from_le_bytes(bytes.try_into().unwrap())
    }

    pub fn set_slot(&mut self, n: usize, idx: usize, blockno: u32) {
        self.block_mut(n)[idx * 4..idx * 4 + 4].copy_from_slice(&blockno.to_le_bytes());
    }
}

impl DiskImage {
    fn record_addr<T: Sized>(&self, n: usize, offset: usize) -> *const u8 {
        assert!(offset + mem::size_of::<T>() <= BLKSIZE);
        debug_assert_eq!(offset % mem::align_of::<T>(), 0);
        self.blocks[n].0[offset..].as_ptr()
    }
}

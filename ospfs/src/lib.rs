#![no_std]

//! OSPFS: a small Unix-style file system whose whole image lives in one
//! contiguous in-memory byte buffer treated as a simulated block device.
//!
//! The crate is layered bottom-up:

extern crate alloc;

// Index node layer: file handles, byte I/O, namespace operations
mod vfs;
pub use vfs::{CopyIn, CopyOut, DirEntryInfo, DirRead, Inode, OpenFlag, Stat};

// Engine layer: allocation, block addressing, size changes
mod fs;
pub use fs::Ospfs;

// On-image data structures
mod layout;
pub use layout::FileType;

// Free-block bitmap
mod bitmap;

// Consistency audit over a whole image
mod check;

// The image itself, partitioned into fixed-size blocks
mod image;
pub use image::DiskImage;

mod error;
pub use error::FsError;

pub use enumflags2::BitFlags;

pub const MAGIC: u32 = 0x0131_01AC;

/// Block size in bytes. Everything on the image is block-aligned.
pub const BLKSIZE: usize = 1024;
/// Bits in one bitmap block.
pub const BLKBITSIZE: usize = BLKSIZE * 8;

/// Direct block pointers per inode.
pub const NDIRECT: usize = 10;
/// Block pointers held by one indirect block.
pub const NINDIRECT: usize = BLKSIZE / 4;
/// Largest number of data blocks a single file can address.
pub const MAXFILEBLKS: usize = NDIRECT + NINDIRECT + NINDIRECT * NINDIRECT;
pub const MAXFILESIZE: usize = MAXFILEBLKS * BLKSIZE;

/// Bytes of one on-image inode record.
pub const INODE_SIZE: usize = 64;
/// Longest symlink target, NUL excluded. The target shares the inode
/// record with the block pointers it replaces.
pub const MAXSYMLINKLEN: usize = INODE_SIZE - 3 * 4 - 1;

/// Bytes of one directory entry.
pub const DIRENTRY_SIZE: usize = 128;
/// Longest file name, NUL excluded.
pub const MAXNAMELEN: usize = DIRENTRY_SIZE - 4 - 1;

/// Block 0 is the reserved boot block; it doubles as the null block
/// pointer, so it must never be allocatable.
pub const SUPER_BLK: usize = 1;
/// First block of the free-block bitmap.
pub const FREEMAP_BLK: usize = 2;

/// Inode number of the root directory. Inode 0 is reserved so that a
/// directory entry with `ino == 0` always means "blank slot".
pub const ROOT_INO: u32 = 1;

//! # Engine layer
//!
//! [`Ospfs`] owns the image and implements everything that moves blocks:
//! inode table access, the three-level block addressing, and the file
//! size engine (`add_block` / `remove_block` / `change_size`). Size
//! changes are transactional per call: a failed growth step frees every
//! block it allocated and leaves the inode untouched.

use alloc::sync::Arc;

use log::{debug, info, warn};
use spin::Mutex;

use crate::bitmap::Bitmap;
use crate::image::DiskImage;
use crate::layout::{BlockAddr, DirEntry, DiskInode, FileType, SuperBlock};
use crate::vfs::Inode;
use crate::{
    FsError, BLKBITSIZE, BLKSIZE, DIRENTRY_SIZE, FREEMAP_BLK, INODE_SIZE, ROOT_INO, SUPER_BLK,
};

const INODES_PER_BLK: usize = BLKSIZE / INODE_SIZE;

pub struct Ospfs {
    pub(crate) image: DiskImage,
    pub(crate) freemap: Bitmap,
    pub(crate) nblocks: u32,
    pub(crate) ninodes: u32,
    pub(crate) firstinob: u32,
}

impl Ospfs {
    /// Build a fresh image: reserved boot block, superblock, free-block
    /// bitmap, inode table with a reserved inode 0 and an empty root
    /// directory.
    pub fn format(total_blocks: usize, ninodes: u32) -> Arc<Mutex<Self>> {
        let freemap_blocks = total_blocks.div_ceil(BLKBITSIZE);
        let firstinob = FREEMAP_BLK + freemap_blocks;
        let inode_blocks = (ninodes as usize).div_ceil(INODES_PER_BLK);
        let first_data = firstinob + inode_blocks;
        assert!(ninodes >= 2, "need at least the reserved inode and a root");
        assert!(first_data < total_blocks, "no room left for data blocks");

        let mut image = DiskImage::blank(total_blocks);
        image
            .get_mut::<SuperBlock>(SUPER_BLK, 0)
            .init(total_blocks as u32, ninodes, firstinob as u32);

        // A blank image reads as all-allocated; release the data region.
        let freemap = Bitmap::new(FREEMAP_BLK, freemap_blocks);
        for block in first_data..total_blocks {
            freemap.set(&mut image, block);
        }

        let mut fs = Self {
            image,
            freemap,
            nblocks: total_blocks as u32,
            ninodes,
            firstinob: firstinob as u32,
        };

        // Inode 0 is pinned with a link so the free scan never hands it
        // out and `ino == 0` stays the blank-slot sentinel.
        let mut reserved = DiskInode::zeroed();
        reserved.nlink = 1;
        fs.write_inode(0, &reserved);
        let mut root = DiskInode::zeroed();
        root.init(FileType::Directory, 0o755);
        fs.write_inode(ROOT_INO, &root);

        Arc::new(Mutex::new(fs))
    }

    /// Adopt an existing image, validating the superblock and auditing
    /// the allocation invariants before anything trusts it.
    pub fn open(image: DiskImage) -> Result<Arc<Mutex<Self>>, FsError> {
        if image.total_blocks() <= FREEMAP_BLK {
            return Err(FsError::Io);
        }
        let sb = image.get_ref::<SuperBlock>(SUPER_BLK, 0);
        if !sb.is_valid() {
            return Err(FsError::Io);
        }
        let (nblocks, ninodes, firstinob) = (sb.nblocks, sb.ninodes, sb.firstinob);
        let inode_blocks = (ninodes as usize).div_ceil(INODES_PER_BLK);
        if firstinob as usize <= FREEMAP_BLK
            || firstinob as usize + inode_blocks >= nblocks as usize
            || nblocks as usize != image.total_blocks()
            || ninodes < 2
        {
            return Err(FsError::Io);
        }

        let fs = Self {
            image,
            freemap: Bitmap::new(FREEMAP_BLK, firstinob as usize - FREEMAP_BLK),
            nblocks,
            ninodes,
            firstinob,
        };
        fs.audit()?;
        info!("opened image: {nblocks} blocks, {ninodes} inodes");
        Ok(Arc::new(Mutex::new(fs)))
    }

    /// Handle on the root directory.
    pub fn root_inode(fs: &Arc<Mutex<Self>>) -> Inode {
        Inode::new(ROOT_INO, Arc::clone(fs))
    }

    #[inline]
    pub fn image(&self) -> &DiskImage {
        &self.image
    }

    /// Allocatable blocks left on the image.
    pub fn free_blocks(&self) -> usize {
        self.freemap.count_free(&self.image)
    }
}

// Inode table
impl Ospfs {
    pub(crate) fn inode(&self, ino: u32) -> Result<DiskInode, FsError> {
        if ino >= self.ninodes {
            return Err(FsError::Io);
        }
        let (block, offset) = self.inode_pos(ino);
        Ok(*self.image.get_ref::<DiskInode>(block, offset))
    }

    pub(crate) fn write_inode(&mut self, ino: u32, inode: &DiskInode) {
        let (block, offset) = self.inode_pos(ino);
        *self.image.get_mut::<DiskInode>(block, offset) = *inode;
    }

    /// First inode with no links, scanning from inode 1.
    pub(crate) fn alloc_inode(&self) -> Result<u32, FsError> {
        (1..self.ninodes)
            .find(|&ino| {
                let (block, offset) = self.inode_pos(ino);
                self.image.get_ref::<DiskInode>(block, offset).nlink == 0
            })
            .ok_or(FsError::NoSpace)
    }

    fn inode_pos(&self, ino: u32) -> (usize, usize) {
        let ino = ino as usize;
        (
            self.firstinob as usize + ino / INODES_PER_BLK,
            ino % INODES_PER_BLK * INODE_SIZE,
        )
    }
}

// Block addressing
impl Ospfs {
    /// Data block holding the `offset`th byte of `oi`, or 0 when the
    /// offset is past the end or the inode has no data blocks at all.
    pub(crate) fn block_for_offset(&self, oi: &DiskInode, offset: u32) -> u32 {
        if offset >= oi.size || oi.is_symlink() {
            return 0;
        }
        match BlockAddr::classify(offset as usize / BLKSIZE) {
            Some(BlockAddr::Direct { slot }) => oi.direct[slot],
            Some(BlockAddr::Indirect { slot }) if oi.indirect != 0 => {
                self.image.slot(oi.indirect as usize, slot)
            }
            Some(BlockAddr::Indirect2 { indirect, slot }) if oi.indirect2 != 0 => {
                match self.image.slot(oi.indirect2 as usize, indirect) {
                    0 => 0,
                    ind => self.image.slot(ind as usize, slot),
                }
            }
            _ => 0,
        }
    }
}

// File size engine
impl Ospfs {
    /// Grow `oi` by one block, allocating indirect scaffolding on the
    /// way. Up to three blocks may be allocated in one call; on any
    /// failure mid-sequence every one of them is freed again and `oi` is
    /// left unchanged. New blocks are zeroed before a pointer to them is
    /// stored, so child slots are filled before the parent pointer is
    /// published.
    pub(crate) fn add_block(&mut self, oi: &mut DiskInode) -> Result<(), FsError> {
        let n = oi.data_blocks();
        match BlockAddr::classify(n).ok_or(FsError::Io)? {
            BlockAddr::Direct { slot } => {
                oi.direct[slot] = self.allocate_block()?;
            }
            BlockAddr::Indirect { slot } => {
                if oi.indirect == 0 {
                    let indirect = self.allocate_block()?;
                    let data = self.allocate_or_unwind(&[indirect])?;
                    self.image.set_slot(indirect as usize, slot, data);
                    oi.indirect = indirect;
                } else {
                    let data = self.allocate_block()?;
                    self.image.set_slot(oi.indirect as usize, slot, data);
                }
            }
            BlockAddr::Indirect2 { indirect, slot } => {
                if oi.indirect2 == 0 {
                    let indirect2 = self.allocate_block()?;
                    let ind = self.allocate_or_unwind(&[indirect2])?;
                    let data = self.allocate_or_unwind(&[ind, indirect2])?;
                    self.image.set_slot(ind as usize, slot, data);
                    self.image.set_slot(indirect2 as usize, indirect, ind);
                    oi.indirect2 = indirect2;
                } else {
                    match self.image.slot(oi.indirect2 as usize, indirect) {
                        0 => {
                            let ind = self.allocate_block()?;
                            let data = self.allocate_or_unwind(&[ind])?;
                            self.image.set_slot(ind as usize, slot, data);
                            self.image.set_slot(oi.indirect2 as usize, indirect, ind);
                        }
                        ind => {
                            let data = self.allocate_block()?;
                            self.image.set_slot(ind as usize, slot, data);
                        }
                    }
                }
            }
        }
        // Absorb a partial tail block, then account for the fresh one.
        oi.size = ((n + 1) * BLKSIZE) as u32;
        Ok(())
    }

    /// Shrink `oi` by one block, collapsing indirect scaffolding that
    /// the removal leaves empty.
    pub(crate) fn remove_block(&mut self, oi: &mut DiskInode) -> Result<(), FsError> {
        let n = oi.data_blocks();
        if n == 0 {
            return Err(FsError::Io);
        }
        let last = n - 1;
        match BlockAddr::classify(last).ok_or(FsError::Io)? {
            BlockAddr::Direct { slot } => {
                self.release(oi.direct[slot])?;
                oi.direct[slot] = 0;
            }
            BlockAddr::Indirect { slot } => {
                if oi.indirect == 0 {
                    return Err(FsError::Io);
                }
                self.release(self.image.slot(oi.indirect as usize, slot))?;
                self.image.set_slot(oi.indirect as usize, slot, 0);
                if slot == 0 {
                    // That was the indirect block's only remaining entry.
                    self.free_block(oi.indirect);
                    oi.indirect = 0;
                }
            }
            BlockAddr::Indirect2 { indirect, slot } => {
                if oi.indirect2 == 0 {
                    return Err(FsError::Io);
                }
                let ind = self.image.slot(oi.indirect2 as usize, indirect);
                if ind == 0 {
                    return Err(FsError::Io);
                }
                self.release(self.image.slot(ind as usize, slot))?;
                self.image.set_slot(ind as usize, slot, 0);
                if slot == 0 {
                    self.free_block(ind);
                    self.image.set_slot(oi.indirect2 as usize, indirect, 0);
                    if indirect == 0 {
                        self.free_block(oi.indirect2);
                        oi.indirect2 = 0;
                    }
                }
            }
        }
        oi.size = (last * BLKSIZE) as u32;
        Ok(())
    }

    /// Grow or shrink `oi` to hold exactly `new_size` bytes, one block
    /// at a time. Running out of space during growth unwinds back to the
    /// original block count before the error surfaces, so a failed call
    /// leaves both the size and the reachable block set untouched.
    pub(crate) fn change_size(&mut self, oi: &mut DiskInode, new_size: u32) -> Result<(), FsError> {
        if oi.is_symlink() {
            // The target lives inside the record; there are no blocks to
            // move, only the length.
            oi.size = new_size.min(crate::MAXSYMLINKLEN as u32);
            return Ok(());
        }

        let old_size = oi.size;
        let wanted = DiskInode::blocks_for_size(new_size);
        while oi.data_blocks() < wanted {
            match self.add_block(oi) {
                Ok(()) => {}
                Err(FsError::NoSpace) => {
                    warn!(
                        "out of space growing inode from {} to {} bytes; rolling back",
                        old_size, new_size
                    );
                    while oi.data_blocks() > DiskInode::blocks_for_size(old_size) {
                        self.remove_block(oi)?;
                    }
                    oi.size = old_size;
                    return Err(FsError::NoSpace);
                }
                Err(e) => return Err(e),
            }
        }
        while oi.data_blocks() > wanted {
            self.remove_block(oi)?;
        }
        oi.size = new_size;
        Ok(())
    }

    pub(crate) fn first_data_block(&self) -> usize {
        self.firstinob as usize + (self.ninodes as usize).div_ceil(INODES_PER_BLK)
    }

    fn allocate_block(&mut self) -> Result<u32, FsError> {
        let blockno = self.freemap.alloc(&mut self.image).ok_or(FsError::NoSpace)?;
        if (blockno as usize) < self.first_data_block() || blockno >= self.nblocks {
            // A free bit inside the reserved region or past the end of
            // the image means the bitmap itself is damaged.
            return Err(FsError::Io);
        }
        self.image.zero_block(blockno as usize);
        debug!("allocated block {blockno}");
        Ok(blockno)
    }

    /// Allocate one more block, freeing `held` again if the image is
    /// full. Keeps the multi-block growth paths transactional.
    fn allocate_or_unwind(&mut self, held: &[u32]) -> Result<u32, FsError> {
        match self.allocate_block() {
            Ok(blockno) => Ok(blockno),
            Err(e) => {
                for &blockno in held {
                    self.free_block(blockno);
                }
                debug!("growth step failed, released {} held block(s)", held.len());
                Err(e)
            }
        }
    }

    fn free_block(&mut self, blockno: u32) {
        debug_assert!((blockno as usize) >= self.first_data_block());
        self.freemap.free(&mut self.image, blockno);
    }

    /// Free a data block found through a pointer slot, treating a null
    /// pointer as corruption rather than freeing block 0.
    fn release(&mut self, blockno: u32) -> Result<(), FsError> {
        if blockno == 0 || blockno >= self.nblocks {
            return Err(FsError::Io);
        }
        self.free_block(blockno);
        Ok(())
    }
}

// Directory entries
impl Ospfs {
    pub(crate) fn read_dirent(&self, dir: &DiskInode, offset: u32) -> Result<DirEntry, FsError> {
        let blockno = self.block_for_offset(dir, offset);
        if blockno == 0 {
            return Err(FsError::Io);
        }
        Ok(self
            .image
            .get_ref::<DirEntry>(blockno as usize, offset as usize % BLKSIZE)
            .clone())
    }

    pub(crate) fn write_dirent(
        &mut self,
        dir: &DiskInode,
        offset: u32,
        entry: &DirEntry,
    ) -> Result<(), FsError> {
        let blockno = self.block_for_offset(dir, offset);
        if blockno == 0 {
            return Err(FsError::Io);
        }
        *self
            .image
            .get_mut::<DirEntry>(blockno as usize, offset as usize % BLKSIZE) = entry.clone();
        Ok(())
    }

    /// First live entry named `name`, with its byte offset.
    pub(crate) fn find_dirent(
        &self,
        dir: &DiskInode,
        name: &[u8],
    ) -> Result<Option<(u32, DirEntry)>, FsError> {
        for offset in (0..dir.size).step_by(DIRENTRY_SIZE) {
            let entry = self.read_dirent(dir, offset)?;
            if !entry.is_blank() && entry.name() == name {
                return Ok(Some((offset, entry)));
            }
        }
        Ok(None)
    }

    /// Byte offset of a blank slot, growing the directory by one block
    /// when every existing slot is taken. Freshly grown space is zeroed,
    /// so the first slot past the old end is known blank.
    pub(crate) fn blank_dirent(&mut self, dir: &mut DiskInode) -> Result<u32, FsError> {
        let old_size = dir.size;
        for offset in (0..old_size).step_by(DIRENTRY_SIZE) {
            if self.read_dirent(dir, offset)?.is_blank() {
                return Ok(offset);
            }
        }
        self.add_block(dir)?;
        Ok(old_size)
    }
}

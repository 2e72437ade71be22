//! # Image audit
//!
//! Walks every inode's block graph and cross-checks it against the
//! free-block bitmap and the directory contents. [`Ospfs::open`] runs
//! this before trusting a foreign image; tests run it after mutating
//! scenarios. The checks are exactly the allocation invariants:
//!
//! - a block is marked allocated iff some inode reaches it (as data or
//!   as indirect scaffolding), and no two inodes share a block;
//! - a file's size and its reachable block count agree;
//! - indirect pointers exist iff the block count requires them, and
//!   slots past the block count are zero;
//! - link counts equal the number of directory entries naming the inode.

use alloc::vec;

use log::error;

use crate::layout::{BlockAddr, DiskInode};
use crate::{FsError, Ospfs, BLKSIZE, DIRENTRY_SIZE, NDIRECT, NINDIRECT, ROOT_INO};

impl Ospfs {
    /// Verify the whole image; any violation is reported as [`FsError::Io`].
    pub fn audit(&self) -> Result<(), FsError> {
        let nblocks = self.nblocks as usize;
        let mut reachable = vec![false; nblocks];
        let mut links = vec![0u32; self.ninodes as usize];

        for ino in 0..self.ninodes {
            let oi = self.inode(ino)?;
            if oi.nlink == 0 {
                continue;
            }
            if oi.ftype().is_none() {
                error!("inode {ino}: unknown file type");
                return Err(FsError::Io);
            }
            if oi.is_symlink() {
                continue;
            }
            self.audit_blocks(ino, &oi, &mut reachable)?;
            if oi.is_dir() {
                self.audit_dir(ino, &oi, &mut links)?;
            }
        }

        for block in self.first_data_block()..nblocks {
            if self.freemap.test(&self.image, block) == reachable[block] {
                error!("block {block}: bitmap and reachability disagree");
                return Err(FsError::Io);
            }
        }
        // The reserved region must never look allocatable.
        for block in 0..self.first_data_block() {
            if self.freemap.test(&self.image, block) {
                error!("reserved block {block} is marked free");
                return Err(FsError::Io);
            }
        }

        for ino in 2..self.ninodes {
            let oi = self.inode(ino)?;
            if oi.nlink == 0 {
                continue;
            }
            let expected = if oi.is_symlink() { 1 } else { links[ino as usize] };
            if oi.nlink != expected {
                error!("inode {ino}: nlink {} but {expected} entries", oi.nlink);
                return Err(FsError::Io);
            }
        }
        Ok(())
    }
}

impl Ospfs {
    /// Mark every block `oi` reaches, checking counts and zero tails.
    fn audit_blocks(
        &self,
        ino: u32,
        oi: &DiskInode,
        reachable: &mut [bool],
    ) -> Result<(), FsError> {
        let n = oi.data_blocks();
        let mut claim = |blockno: u32| -> Result<(), FsError> {
            let block = blockno as usize;
            if block < self.first_data_block() || block >= reachable.len() {
                error!("inode {ino}: block {blockno} outside the data region");
                return Err(FsError::Io);
            }
            if reachable[block] {
                error!("inode {ino}: block {blockno} claimed twice");
                return Err(FsError::Io);
            }
            reachable[block] = true;
            Ok(())
        };

        for b in 0..NDIRECT {
            match (b < n, oi.direct[b]) {
                (true, 0) | (false, 1..) => return Err(FsError::Io),
                (true, blockno) => claim(blockno)?,
                (false, 0) => {}
            }
        }

        if (oi.indirect != 0) != (n > NDIRECT) {
            error!("inode {ino}: indirect pointer disagrees with size");
            return Err(FsError::Io);
        }
        if oi.indirect != 0 {
            claim(oi.indirect)?;
            self.audit_pointer_block(oi.indirect, n.saturating_sub(NDIRECT), &mut claim)?;
        }

        if (oi.indirect2 != 0) != (n > NDIRECT + NINDIRECT) {
            error!("inode {ino}: doubly-indirect pointer disagrees with size");
            return Err(FsError::Io);
        }
        if oi.indirect2 != 0 {
            claim(oi.indirect2)?;
            let tail = n - NDIRECT - NINDIRECT;
            let inds = tail.div_ceil(NINDIRECT);
            for idx in 0..NINDIRECT {
                let ind = self.image.slot(oi.indirect2 as usize, idx);
                if (ind != 0) != (idx < inds) {
                    error!("inode {ino}: indirect2 slot {idx} disagrees with size");
                    return Err(FsError::Io);
                }
                if ind != 0 {
                    claim(ind)?;
                    let filled = (tail - idx * NINDIRECT).min(NINDIRECT);
                    self.audit_pointer_block(ind, filled, &mut claim)?;
                }
            }
        }

        // Sanity on the far end: size must stay addressable at all.
        if BlockAddr::classify(n.saturating_sub(1)).is_none() {
            error!("inode {ino}: size {} beyond the addressing limit", oi.size);
            return Err(FsError::Io);
        }
        Ok(())
    }

    /// A pointer block whose first `filled` slots must be live and whose
    /// remaining slots must be zero.
    fn audit_pointer_block(
        &self,
        blockno: u32,
        filled: usize,
        claim: &mut impl FnMut(u32) -> Result<(), FsError>,
    ) -> Result<(), FsError> {
        for idx in 0..NINDIRECT {
            let slot = self.image.slot(blockno as usize, idx);
            if (slot != 0) != (idx < filled) {
                error!("pointer block {blockno}: slot {idx} breaks the zero-tail rule");
                return Err(FsError::Io);
            }
            if slot != 0 {
                claim(slot)?;
            }
        }
        Ok(())
    }

    /// Tally the live entries of one directory into `links`.
    fn audit_dir(&self, ino: u32, dir: &DiskInode, links: &mut [u32]) -> Result<(), FsError> {
        if dir.size as usize % DIRENTRY_SIZE != 0 {
            error!("directory {ino}: size {} not entry-aligned", dir.size);
            return Err(FsError::Io);
        }
        for offset in (0..dir.size).step_by(DIRENTRY_SIZE) {
            let entry = self.read_dirent(dir, offset)?;
            if entry.is_blank() {
                continue;
            }
            let target = entry.ino();
            if target == ROOT_INO || target >= self.ninodes {
                error!("directory {ino}: entry at {offset} names inode {target}");
                return Err(FsError::Io);
            }
            links[target as usize] += 1;
        }
        Ok(())
    }
}

// Directory entries never straddle blocks.
const _: () = assert!(BLKSIZE % DIRENTRY_SIZE == 0);

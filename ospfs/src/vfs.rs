//! # Index node layer
//!
//! [`Inode`] is a handle on one inode of a shared [`Ospfs`]; every
//! operation takes the image lock, runs to completion and releases it,
//! which is the whole concurrency story of the engine. Byte transfers in
//! and out go through the [`CopyIn`] / [`CopyOut`] traits so a host can
//! substitute its own user-memory copies; plain slices implement both.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use enumflags2::{bitflags, BitFlags};
use spin::Mutex;

use crate::layout::{DirEntry, DiskInode, FileType};
use crate::{FsError, Ospfs, BLKSIZE, DIRENTRY_SIZE, MAXFILESIZE, MAXNAMELEN, MAXSYMLINKLEN};

/// Handle on one inode of a mounted image.
#[derive(Clone)]
pub struct Inode {
    ino: u32,
    fs: Arc<Mutex<Ospfs>>,
}

impl core::fmt::Debug for Inode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Inode").field("ino", &self.ino).finish()
    }
}

/// Per-open write behaviour.
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFlag {
    /// Every write starts at end of file, whatever position was asked.
    Append = 0b01,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub ino: u32,
    pub kind: FileType,
    pub size: u32,
    pub nlink: u32,
    pub mode: u32,
}

/// One entry handed to the `readdir` callback.
#[derive(Debug)]
pub struct DirEntryInfo<'a> {
    pub name: &'a [u8],
    pub ino: u32,
    pub kind: FileType,
    /// Position the entry was read at; feeding it back resumes here.
    pub pos: u64,
}

/// How a `readdir` sweep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirRead {
    /// Every entry was seen.
    Done,
    /// The callback asked to stop; the position still points at the
    /// entry that was refused.
    Interrupted,
}

/// Destination of bytes leaving the image, typically a buffer in the
/// host's user space. Returning `false` reports a fault.
pub trait CopyOut {
    fn copy_out(&mut self, offset: usize, src: &[u8]) -> bool;
}

/// Source of bytes entering the image.
pub trait CopyIn {
    fn copy_in(&mut self, offset: usize, dst: &mut [u8]) -> bool;
}

impl CopyOut for [u8] {
    fn copy_out(&mut self, offset: usize, src: &[u8]) -> bool {
        match self.get_mut(offset..offset + src.len()) {
            Some(dst) => {
                dst.copy_from_slice(src);
                true
            }
            None => false,
        }
    }
}

impl CopyIn for [u8] {
    fn copy_in(&mut self, offset: usize, dst: &mut [u8]) -> bool {
        match self.get(offset..offset + dst.len()) {
            Some(src) => {
                dst.copy_from_slice(src);
                true
            }
            None => false,
        }
    }
}

impl Inode {
    #[inline]
    pub(crate) fn new(ino: u32, fs: Arc<Mutex<Ospfs>>) -> Self {
        Self { ino, fs }
    }

    #[inline]
    pub fn ino(&self) -> u32 {
        self.ino
    }

    pub fn stat(&self) -> Result<Stat, FsError> {
        let fs = self.fs.lock();
        let oi = fs.inode(self.ino)?;
        Ok(Stat {
            ino: self.ino,
            kind: oi.ftype().ok_or(FsError::Io)?,
            size: oi.size,
            nlink: oi.nlink,
            mode: oi.mode,
        })
    }

    /// Look the name up in this directory.
    pub fn find(&self, name: &str) -> Result<Option<Inode>, FsError> {
        if name.len() > MAXNAMELEN {
            return Err(FsError::NameTooLong);
        }
        let fs = self.fs.lock();
        let dir = self.dir_inode(&fs)?;
        Ok(fs
            .find_dirent(&dir, name.as_bytes())?
            .map(|(_, entry)| Inode::new(entry.ino(), Arc::clone(&self.fs))))
    }

    /// Create a regular file in this directory.
    pub fn create(&self, name: &str, mode: u32) -> Result<Inode, FsError> {
        let mut fs = self.fs.lock();
        let mut dir = self.dir_inode(&fs)?;
        let offset = self.claim_slot(&mut fs, &mut dir, name)?;

        let ino = fs.alloc_inode()?;
        let mut oi = DiskInode::zeroed();
        oi.init(FileType::Regular, mode);
        fs.write_inode(ino, &oi);
        // The inode is fully populated; only now may the name go live.
        fs.write_dirent(&dir, offset, &DirEntry::new(name.as_bytes(), ino))?;
        Ok(Inode::new(ino, Arc::clone(&self.fs)))
    }

    /// Add a hard link to `src` under `name` in this directory.
    /// Directories must not be hard-linked; that is the caller's
    /// contract, not checked here.
    pub fn link(&self, src: &Inode, name: &str) -> Result<(), FsError> {
        let mut fs = self.fs.lock();
        let mut dir = self.dir_inode(&fs)?;
        let offset = self.claim_slot(&mut fs, &mut dir, name)?;

        let mut oi = fs.inode(src.ino)?;
        oi.nlink += 1;
        fs.write_inode(src.ino, &oi);
        fs.write_dirent(&dir, offset, &DirEntry::new(name.as_bytes(), src.ino))?;
        Ok(())
    }

    /// Remove the entry named `name`; the last link of anything but a
    /// symlink also releases its data blocks.
    pub fn unlink(&self, name: &str) -> Result<(), FsError> {
        if name.len() > MAXNAMELEN {
            return Err(FsError::NameTooLong);
        }
        let mut fs = self.fs.lock();
        let dir = self.dir_inode(&fs)?;
        let (offset, mut entry) = fs
            .find_dirent(&dir, name.as_bytes())?
            .ok_or(FsError::NotFound)?;
        let ino = entry.ino();
        entry.clear_ino();
        fs.write_dirent(&dir, offset, &entry)?;

        let mut oi = fs.inode(ino)?;
        if oi.nlink == 0 {
            return Err(FsError::Io);
        }
        oi.nlink -= 1;
        fs.write_inode(ino, &oi);
        if oi.nlink == 0 && !oi.is_symlink() {
            // Symlink storage lives inside the record; everything else
            // hands its blocks back.
            let result = fs.change_size(&mut oi, 0);
            fs.write_inode(ino, &oi);
            result?;
        }
        Ok(())
    }

    /// Create a symlink named `name` pointing at `target`.
    pub fn symlink(&self, name: &str, target: &str) -> Result<Inode, FsError> {
        if target.len() > MAXSYMLINKLEN {
            return Err(FsError::NameTooLong);
        }
        let mut fs = self.fs.lock();
        let mut dir = self.dir_inode(&fs)?;
        let offset = self.claim_slot(&mut fs, &mut dir, name)?;

        let ino = fs.alloc_inode()?;
        let mut oi = DiskInode::zeroed();
        oi.init(FileType::Symlink, 0);
        oi.set_symlink_target(target.as_bytes());
        fs.write_inode(ino, &oi);
        fs.write_dirent(&dir, offset, &DirEntry::new(name.as_bytes(), ino))?;
        Ok(Inode::new(ino, Arc::clone(&self.fs)))
    }

    /// Resolve this symlink for a caller that is (or is not) the
    /// superuser. A target of the form `root?PRIMARY:FALLBACK` picks a
    /// side per call; the stored target is never rewritten.
    pub fn follow_link(&self, superuser: bool) -> Result<String, FsError> {
        let fs = self.fs.lock();
        let oi = fs.inode(self.ino)?;
        if !oi.is_symlink() {
            return Err(FsError::Io);
        }
        let picked = resolve_target(oi.symlink_target(), superuser);
        String::from_utf8(Vec::from(picked)).map_err(|_| FsError::Io)
    }

    /// Set the file length to exactly `new_size` bytes. Refused on
    /// directories; their size only moves through entry allocation.
    pub fn truncate(&self, new_size: u32) -> Result<(), FsError> {
        let mut fs = self.fs.lock();
        let mut oi = fs.inode(self.ino)?;
        if oi.is_dir() {
            return Err(FsError::PermissionDenied);
        }
        fs.change_size(&mut oi, new_size)?;
        fs.write_inode(self.ino, &oi);
        Ok(())
    }

    /// Walk this directory from `pos`, feeding each live entry to
    /// `emit`. Positions 0 and 1 produce the synthetic `.` and `..`
    /// entries (the latter naming `parent`); from 2 on, `pos - 2` is a
    /// byte offset into the directory file. Blank slots are skipped,
    /// still advancing the position. `emit` returning `false` stops the
    /// sweep with [`DirRead::Interrupted`] and leaves `pos` on the
    /// refused entry so the next call retries it.
    pub fn read_dir(
        &self,
        parent: u32,
        pos: &mut u64,
        mut emit: impl FnMut(DirEntryInfo<'_>) -> bool,
    ) -> Result<DirRead, FsError> {
        let fs = self.fs.lock();
        let dir = self.dir_inode(&fs)?;

        if *pos == 0 {
            if !emit(DirEntryInfo {
                name: b".",
                ino: self.ino,
                kind: FileType::Directory,
                pos: *pos,
            }) {
                return Ok(DirRead::Interrupted);
            }
            *pos = 1;
        }
        if *pos == 1 {
            if !emit(DirEntryInfo {
                name: b"..",
                ino: parent,
                kind: FileType::Directory,
                pos: *pos,
            }) {
                return Ok(DirRead::Interrupted);
            }
            *pos = 2;
        }

        loop {
            let offset = *pos - 2;
            if offset >= u64::from(dir.size) {
                return Ok(DirRead::Done);
            }
            if offset % DIRENTRY_SIZE as u64 != 0 {
                return Err(FsError::Io);
            }
            let entry = fs.read_dirent(&dir, offset as u32)?;
            if !entry.is_blank() {
                let kind = fs.inode(entry.ino())?.ftype().ok_or(FsError::Io)?;
                if !emit(DirEntryInfo {
                    name: entry.name(),
                    ino: entry.ino(),
                    kind,
                    pos: *pos,
                }) {
                    return Ok(DirRead::Interrupted);
                }
            }
            *pos += DIRENTRY_SIZE as u64;
        }
    }

    /// Read up to `count` bytes starting at `pos` into `dest`, clamped
    /// to the end of the file. Returns the bytes transferred; a fault
    /// with nothing transferred yet is an error.
    pub fn read_with(
        &self,
        pos: u32,
        count: u32,
        dest: &mut (impl CopyOut + ?Sized),
    ) -> Result<u32, FsError> {
        let fs = self.fs.lock();
        let oi = fs.inode(self.ino)?;
        let count = count.min(oi.size.saturating_sub(pos));

        let mut pos = pos;
        let mut amount = 0;
        while amount < count {
            let blockno = fs.block_for_offset(&oi, pos);
            if blockno == 0 {
                // The clamp guarantees a block here; 0 means corruption.
                return Err(FsError::Io);
            }
            let blk_off = pos as usize % BLKSIZE;
            let n = ((count - amount) as usize).min(BLKSIZE - blk_off);
            let data = &fs.image.block(blockno as usize)[blk_off..blk_off + n];
            if !dest.copy_out(amount as usize, data) {
                return partial(amount);
            }
            amount += n as u32;
            pos += n as u32;
        }
        Ok(amount)
    }

    /// Write `count` bytes from `src` at `pos` (or at end of file under
    /// [`OpenFlag::Append`]), extending the file first when the write
    /// lands past the current end. A failed extension leaves the file
    /// untouched and surfaces here.
    pub fn write_with(
        &self,
        pos: u32,
        count: u32,
        src: &mut (impl CopyIn + ?Sized),
        flags: BitFlags<OpenFlag>,
    ) -> Result<u32, FsError> {
        let mut fs = self.fs.lock();
        let mut oi = fs.inode(self.ino)?;
        if oi.is_symlink() {
            return Err(FsError::Io);
        }
        let pos = if flags.contains(OpenFlag::Append) {
            oi.size
        } else {
            pos
        };
        if count == 0 {
            return Ok(0);
        }
        let end = u64::from(pos) + u64::from(count);
        if end > MAXFILESIZE as u64 {
            return Err(FsError::Io);
        }
        if end > u64::from(oi.size) {
            fs.change_size(&mut oi, end as u32)?;
            fs.write_inode(self.ino, &oi);
        }

        let mut pos = pos;
        let mut amount = 0;
        while amount < count {
            let blockno = fs.block_for_offset(&oi, pos);
            if blockno == 0 {
                return Err(FsError::Io);
            }
            let blk_off = pos as usize % BLKSIZE;
            let n = ((count - amount) as usize).min(BLKSIZE - blk_off);
            let data = &mut fs.image.block_mut(blockno as usize)[blk_off..blk_off + n];
            if !src.copy_in(amount as usize, data) {
                return partial(amount);
            }
            amount += n as u32;
            pos += n as u32;
        }
        Ok(amount)
    }

    /// [`read_with`](Self::read_with) into a plain buffer.
    pub fn read_at(&self, pos: u32, buf: &mut [u8]) -> Result<u32, FsError> {
        let count = buf.len() as u32;
        self.read_with(pos, count, buf)
    }

    /// [`write_with`](Self::write_with) from a plain buffer, no flags.
    pub fn write_at(&self, pos: u32, buf: &[u8]) -> Result<u32, FsError> {
        let mut src = SliceSource(buf);
        self.write_with(pos, buf.len() as u32, &mut src, BitFlags::empty())
    }
}

impl Inode {
    /// This inode as a directory record; anything else is a caller bug
    /// surfaced as corruption.
    fn dir_inode(&self, fs: &Ospfs) -> Result<DiskInode, FsError> {
        let oi = fs.inode(self.ino)?;
        if !oi.is_dir() {
            return Err(FsError::Io);
        }
        Ok(oi)
    }

    /// Shared head of the namespace operations: validate the name,
    /// refuse duplicates, claim a blank slot (possibly growing the
    /// directory) and persist the grown directory inode.
    fn claim_slot(
        &self,
        fs: &mut Ospfs,
        dir: &mut DiskInode,
        name: &str,
    ) -> Result<u32, FsError> {
        if name.len() > MAXNAMELEN {
            return Err(FsError::NameTooLong);
        }
        if fs.find_dirent(dir, name.as_bytes())?.is_some() {
            return Err(FsError::Exists);
        }
        let offset = fs.blank_dirent(dir)?;
        fs.write_inode(self.ino, dir);
        Ok(offset)
    }
}

struct SliceSource<'a>(&'a [u8]);

impl CopyIn for SliceSource<'_> {
    fn copy_in(&mut self, offset: usize, dst: &mut [u8]) -> bool {
        match self.0.get(offset..offset + dst.len()) {
            Some(src) => {
                dst.copy_from_slice(src);
                true
            }
            None => false,
        }
    }
}

fn resolve_target(target: &[u8], superuser: bool) -> &[u8] {
    if let Some(rest) = target.strip_prefix(b"root?") {
        if let Some(colon) = rest.iter().position(|&b| b == b':') {
            return if superuser {
                &rest[..colon]
            } else {
                &rest[colon + 1..]
            };
        }
    }
    target
}

fn partial(amount: u32) -> Result<u32, FsError> {
    if amount == 0 {
        Err(FsError::Fault)
    } else {
        Ok(amount)
    }
}

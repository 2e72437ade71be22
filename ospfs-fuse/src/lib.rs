//! Hosted side of OSPFS: image file helpers and a thin adapter that a
//! host file system runtime (or a test) drives. The engine itself knows
//! nothing about paths or callers; this crate adds both.

#[cfg(test)]
mod tests;

use std::fs;
use std::io;
use std::path::Path;

use log::debug;
use ospfs::{DiskImage, FsError, Inode, BLKSIZE};

/// Symlink expansions tolerated on one path walk before giving up.
const LINK_BUDGET: usize = 8;

/// Read a whole image file into a [`DiskImage`].
pub fn load_image(path: &Path) -> io::Result<DiskImage> {
    let bytes = fs::read(path)?;
    DiskImage::from_bytes(&bytes)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "not a block-sized image"))
}

/// Write an image back out, block by block.
pub fn save_image(image: &DiskImage, path: &Path) -> io::Result<()> {
    let mut bytes = Vec::with_capacity(image.total_blocks() * BLKSIZE);
    for n in 0..image.total_blocks() {
        bytes.extend_from_slice(image.block(n));
    }
    fs::write(path, bytes)
}

/// A mounted image plus the identity every conditional symlink on it is
/// resolved against.
pub struct Mount {
    root: Inode,
    superuser: bool,
}

impl Mount {
    /// Adopt a root directory handle (see [`ospfs::Ospfs::root_inode`]).
    pub fn new(root: Inode, superuser: bool) -> Self {
        Self { root, superuser }
    }

    #[inline]
    pub fn root(&self) -> &Inode {
        &self.root
    }

    /// Walk an absolute `/`-separated path to its inode, expanding
    /// symlinks (conditional ones against this mount's identity) along
    /// the way. Exhausting the link budget reads as a cycle and fails.
    pub fn resolve(&self, path: &str) -> Result<Inode, FsError> {
        let mut budget = LINK_BUDGET;
        self.walk(self.root.clone(), path, &mut budget)
    }

    fn walk(&self, start: Inode, path: &str, budget: &mut usize) -> Result<Inode, FsError> {
        let mut current = start;
        for component in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            current = self.lookup(&current, component, budget)?;
        }
        Ok(current)
    }

    fn lookup(&self, dir: &Inode, name: &str, budget: &mut usize) -> Result<Inode, FsError> {
        let found = dir.find(name)?.ok_or(FsError::NotFound)?;
        if found.stat()?.kind != ospfs::FileType::Symlink {
            return Ok(found);
        }
        if *budget == 0 {
            debug!("link budget exhausted at {name:?}");
            return Err(FsError::Io);
        }
        *budget -= 1;
        let target = found.follow_link(self.superuser)?;
        debug!("following {name:?} -> {target:?}");
        if let Some(absolute) = target.strip_prefix('/') {
            self.walk(self.root.clone(), absolute, budget)
        } else {
            // Relative targets resolve within the owning directory.
            self.walk(dir.clone(), &target, budget)
        }
    }
}

/// Map an engine error to the negative errno a host runtime expects.
pub fn errno(e: FsError) -> i32 {
    match e {
        FsError::PermissionDenied => -1,
        FsError::NotFound => -2,
        FsError::Io => -5,
        FsError::Fault => -14,
        FsError::Exists => -17,
        FsError::NoSpace => -28,
        FsError::NameTooLong => -36,
    }
}

/// Host-side allocation failure; the engine never produces it itself.
pub const ENOMEM: i32 = -12;

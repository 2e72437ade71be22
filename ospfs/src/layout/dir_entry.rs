use crate::{DIRENTRY_SIZE, MAXNAMELEN};

/// One fixed-width entry of a directory file.
#[derive(Clone)]
#[repr(C)]
pub struct DirEntry {
    /// Owning inode number; 0 marks a blank slot
    ino: u32,
    // Last byte stays reserved for the terminating NUL
    name: [u8; MAXNAMELEN + 1],
}

impl DirEntry {
    /// Entry binding `name` to inode `ino`. Callers reject names longer
    /// than [`MAXNAMELEN`] before getting here.
    pub fn new(name: &[u8], ino: u32) -> Self {
        assert!(ino != 0 && name.len() <= MAXNAMELEN);
        let mut buf = [0; MAXNAMELEN + 1];
        buf[..name.len()].copy_from_slice(name);
        Self { ino, name: buf }
    }

    #[inline]
    pub fn ino(&self) -> u32 {
        self.ino
    }

    #[inline]
    pub fn is_blank(&self) -> bool {
        self.ino == 0
    }

    /// Blank the slot. The stale name bytes are left behind; only `ino`
    /// decides whether a slot is live.
    #[inline]
    pub fn clear_ino(&mut self) {
        self.ino = 0;
    }

    /// Name bytes up to the terminating NUL.
    pub fn name(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(self.name.len());
        &self.name[..len]
    }
}

const _: () = assert!(core::mem::size_of::<DirEntry>() == DIRENTRY_SIZE);

use thiserror::Error;

/// Everything a file system operation can fail with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FsError {
    /// The free-block bitmap, or the inode table, has no free slot left.
    #[error("no space left on image")]
    NoSpace,

    /// The image is corrupted: a block pointer or an index is not where
    /// the addressing invariants say it must be. Fatal for the current
    /// operation only; recovery is best effort.
    #[error("image inconsistency detected")]
    Io,

    #[error("entry already exists")]
    Exists,

    #[error("no such entry")]
    NotFound,

    #[error("name or symlink target too long")]
    NameTooLong,

    /// The host-supplied byte copy reported a fault in user memory.
    #[error("user memory fault")]
    Fault,

    #[error("operation not permitted")]
    PermissionDenied,
}

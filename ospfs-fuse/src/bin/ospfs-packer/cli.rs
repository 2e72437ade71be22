use clap::Parser;
use std::path::PathBuf;

/// Build an OSPFS image from the files of a source directory.
#[derive(Parser)]
pub struct Cli {
    /// Directory whose files populate the image root
    #[arg(long, short)]
    pub source: PathBuf,

    /// Where to write the finished image
    #[arg(long, short)]
    pub output: PathBuf,

    /// Image size in blocks
    #[arg(long, default_value_t = 16 * 1024)]
    pub blocks: usize,

    /// Inode table slots
    #[arg(long, default_value_t = 512)]
    pub inodes: u32,
}

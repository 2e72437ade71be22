mod cli;

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;

use clap::Parser;
use log::{info, warn};
use ospfs::Ospfs;

use cli::Cli;
use ospfs_fuse::save_image;

fn main() -> io::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let ospfs = Ospfs::format(cli.blocks, cli.inodes);
    let root = Ospfs::root_inode(&ospfs);

    for entry in fs::read_dir(&cli.source)? {
        let entry = entry?;
        let name = entry
            .file_name()
            .into_string()
            .map_err(|name| invalid(format!("file name {name:?} is not UTF-8")))?;
        let kind = entry.file_type()?;

        if kind.is_symlink() {
            let target = fs::read_link(entry.path())?;
            let target = target
                .to_str()
                .ok_or_else(|| invalid(format!("link target of {name:?} is not UTF-8")))?;
            root.symlink(&name, target)
                .map_err(|e| invalid(format!("symlink {name:?}: {e}")))?;
            info!("packed symlink {name} -> {target}");
        } else if kind.is_file() {
            let data = fs::read(entry.path())?;
            let mode = entry.metadata()?.permissions().mode() & 0o777;
            let inode = root
                .create(&name, mode)
                .map_err(|e| invalid(format!("create {name:?}: {e}")))?;
            inode
                .write_at(0, &data)
                .map_err(|e| invalid(format!("write {name:?}: {e}")))?;
            info!("packed {name}: {} bytes", data.len());
        } else {
            warn!("skipping {name}: not a regular file or symlink");
        }
    }

    let ospfs = ospfs.lock();
    save_image(ospfs.image(), &cli.output)?;
    info!(
        "image written to {}: {} blocks free",
        cli.output.display(),
        ospfs.free_blocks()
    );
    Ok(())
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

use std::sync::Arc;

use ospfs::{
    CopyIn, CopyOut, DirRead, DiskImage, FileType, FsError, Inode, OpenFlag, Ospfs, BLKSIZE,
    MAXNAMELEN, MAXSYMLINKLEN, NDIRECT, NINDIRECT, ROOT_INO,
};
use spin::Mutex;

use crate::Mount;

type FsRef = Arc<Mutex<Ospfs>>;

fn fresh(blocks: usize, inodes: u32) -> (FsRef, Inode) {
    let fs = Ospfs::format(blocks, inodes);
    let root = Ospfs::root_inode(&fs);
    (fs, root)
}

fn audit(fs: &FsRef) {
    fs.lock().audit().expect("image consistency");
}

fn free_blocks(fs: &FsRef) -> usize {
    fs.lock().free_blocks()
}

/// Deterministic non-repeating filler.
fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + 7) as u8).collect()
}

#[test]
fn create_then_read_empty() {
    let (fs, root) = fresh(256, 64);
    let a = root.create("a", 0o644).unwrap();

    let mut buf = [0u8; 10];
    assert_eq!(a.read_at(0, &mut buf).unwrap(), 0);
    assert_eq!(a.read_at(9999, &mut buf).unwrap(), 0);

    let st = a.stat().unwrap();
    assert_eq!(st.kind, FileType::Regular);
    assert_eq!(st.size, 0);
    assert_eq!(st.nlink, 1);
    assert_eq!(st.mode, 0o644);
    audit(&fs);
}

#[test]
fn write_read_roundtrip() {
    let (fs, root) = fresh(256, 64);
    let f = root.create("f", 0o644).unwrap();
    let data = pattern(3000);

    assert_eq!(f.write_at(0, &data).unwrap(), 3000);
    assert_eq!(f.stat().unwrap().size, 3000);

    let mut back = vec![0u8; 3000];
    assert_eq!(f.read_at(0, &mut back).unwrap(), 3000);
    assert_eq!(back, data);

    // A window that crosses a block boundary.
    let mut window = vec![0u8; 100];
    assert_eq!(f.read_at(1000, &mut window).unwrap(), 100);
    assert_eq!(window, data[1000..1100]);

    // The clamp: reading past the end transfers the remainder only.
    let mut tail = vec![0u8; 200];
    assert_eq!(f.read_at(2900, &mut tail).unwrap(), 100);
    assert_eq!(tail[..100], data[2900..]);
    audit(&fs);
}

#[test]
fn grow_across_direct_indirect_boundary() {
    let (fs, root) = fresh(512, 64);
    let f = root.create("f", 0o644).unwrap();
    let before = free_blocks(&fs);

    let len = NDIRECT * BLKSIZE + 17;
    let data = pattern(len);
    assert_eq!(f.write_at(0, &data).unwrap() as usize, len);
    assert_eq!(f.stat().unwrap().size as usize, len);

    // Eleven data blocks plus exactly one indirect block.
    assert_eq!(free_blocks(&fs), before - (NDIRECT + 1) - 1);

    let mut back = vec![0u8; len];
    assert_eq!(f.read_at(0, &mut back).unwrap() as usize, len);
    assert_eq!(back, data);
    audit(&fs);

    // Shrinking back to the direct range collapses the indirect block.
    f.truncate(BLKSIZE as u32).unwrap();
    assert_eq!(free_blocks(&fs), before - 1);
    audit(&fs);
}

#[test]
fn grow_into_doubly_indirect() {
    let (fs, root) = fresh(2048, 16);
    let f = root.create("f", 0o644).unwrap();
    let before = free_blocks(&fs);

    let blocks = NDIRECT + NINDIRECT + 1;
    let len = blocks * BLKSIZE + 5;
    let data = pattern(len);
    assert_eq!(f.write_at(0, &data).unwrap() as usize, len);

    // Data blocks plus one indirect, the doubly-indirect block and one
    // indirect block hanging off it.
    assert_eq!(free_blocks(&fs), before - (blocks + 1) - 3);

    let mut tail = vec![0u8; 5 + BLKSIZE];
    let tail_pos = (blocks - 1) * BLKSIZE;
    assert_eq!(
        f.read_at(tail_pos as u32, &mut tail).unwrap() as usize,
        len - tail_pos
    );
    assert_eq!(tail[..len - tail_pos], data[tail_pos..]);
    audit(&fs);

    f.truncate(BLKSIZE as u32).unwrap();
    assert_eq!(free_blocks(&fs), before - 1);
    audit(&fs);
}

#[test]
fn unlink_releases_blocks() {
    let (fs, root) = fresh(256, 64);
    let a = root.create("a", 0o644).unwrap();
    assert_eq!(a.write_at(0, &pattern(BLKSIZE)).unwrap() as usize, BLKSIZE);

    let before = free_blocks(&fs);
    root.unlink("a").unwrap();
    assert_eq!(free_blocks(&fs), before + 1);
    assert_eq!(a.stat().unwrap().nlink, 0);
    assert!(root.find("a").unwrap().is_none());
    audit(&fs);
}

#[test]
fn hard_link_then_unlink_preserves_content() {
    let (fs, root) = fresh(256, 64);
    let a = root.create("a", 0o644).unwrap();
    a.write_at(0, b"hello").unwrap();

    root.link(&a, "b").unwrap();
    assert_eq!(a.stat().unwrap().nlink, 2);
    audit(&fs);

    root.unlink("a").unwrap();
    assert!(root.find("a").unwrap().is_none());

    let b = root.find("b").unwrap().expect("b survives");
    let mut back = [0u8; 5];
    assert_eq!(b.read_at(0, &mut back).unwrap(), 5);
    assert_eq!(&back, b"hello");
    assert_eq!(b.stat().unwrap().nlink, 1);
    audit(&fs);
}

#[test]
fn conditional_symlink_picks_by_identity() {
    let (fs, root) = fresh(256, 64);
    let c = root.symlink("c", "root?/priv:/pub").unwrap();

    assert_eq!(c.follow_link(true).unwrap(), "/priv");
    assert_eq!(c.follow_link(false).unwrap(), "/pub");
    // The stored target must survive resolution unchanged.
    assert_eq!(c.follow_link(true).unwrap(), "/priv");
    assert_eq!(c.follow_link(false).unwrap(), "/pub");

    let st = c.stat().unwrap();
    assert_eq!(st.kind, FileType::Symlink);
    assert_eq!(st.size as usize, "root?/priv:/pub".len());
    audit(&fs);
}

#[test]
fn plain_symlink_resolves_verbatim() {
    let (fs, root) = fresh(256, 64);
    let l = root.symlink("l", "/somewhere/else").unwrap();
    assert_eq!(l.follow_link(true).unwrap(), "/somewhere/else");
    assert_eq!(l.follow_link(false).unwrap(), "/somewhere/else");

    // `root?` with no separator is not conditional.
    let odd = root.symlink("odd", "root?plain").unwrap();
    assert_eq!(odd.follow_link(false).unwrap(), "root?plain");
    audit(&fs);
}

#[test]
fn oversized_names_and_targets_rejected() {
    let (_fs, root) = fresh(256, 64);
    let long = "x".repeat(MAXNAMELEN + 1);
    assert_eq!(root.create(&long, 0o644).unwrap_err(), FsError::NameTooLong);
    assert_eq!(root.find(&long).unwrap_err(), FsError::NameTooLong);

    let target = "t".repeat(MAXSYMLINKLEN + 1);
    assert_eq!(root.symlink("s", &target).unwrap_err(), FsError::NameTooLong);

    // The limits themselves are fine.
    let edge = "y".repeat(MAXNAMELEN);
    root.create(&edge, 0o600).unwrap();
    assert!(root.find(&edge).unwrap().is_some());
    root.symlink("s", &"t".repeat(MAXSYMLINKLEN)).unwrap();
}

#[test]
fn duplicate_and_missing_names() {
    let (fs, root) = fresh(256, 64);
    root.create("a", 0o644).unwrap();
    assert_eq!(root.create("a", 0o644).unwrap_err(), FsError::Exists);
    assert_eq!(root.symlink("a", "/x").unwrap_err(), FsError::Exists);

    let b = root.create("b", 0o644).unwrap();
    assert_eq!(root.link(&b, "a").unwrap_err(), FsError::Exists);

    assert_eq!(root.unlink("missing").unwrap_err(), FsError::NotFound);
    root.unlink("a").unwrap();
    // Unlink is not idempotent: the name is gone now.
    assert_eq!(root.unlink("a").unwrap_err(), FsError::NotFound);
    assert!(root.find("a").unwrap().is_none());
    audit(&fs);
}

#[test]
fn no_space_growth_rolls_back() {
    let (fs, root) = fresh(64, 16);
    let filler = root.create("filler", 0o644).unwrap();

    // One block went to the root directory itself; fill the rest of the
    // image down to exactly two free blocks (56 data + 1 indirect).
    let keep = pattern(56 * BLKSIZE);
    assert_eq!(filler.write_at(0, &keep).unwrap() as usize, keep.len());
    assert_eq!(free_blocks(&fs), 2);

    let f = root.create("f", 0o644).unwrap();
    assert_eq!(free_blocks(&fs), 2);

    // Five blocks wanted, two available: the growth must unwind fully.
    let want = 5 * BLKSIZE as u32;
    assert_eq!(f.truncate(want).unwrap_err(), FsError::NoSpace);
    assert_eq!(f.stat().unwrap().size, 0);
    assert_eq!(free_blocks(&fs), 2);
    audit(&fs);

    assert_eq!(
        f.write_at(0, &pattern(5 * BLKSIZE)).unwrap_err(),
        FsError::NoSpace
    );
    assert_eq!(f.stat().unwrap().size, 0);
    assert_eq!(free_blocks(&fs), 2);

    // The neighbour is untouched by the failed growth.
    let mut window = vec![0u8; 100];
    filler.read_at(55 * BLKSIZE as u32, &mut window).unwrap();
    assert_eq!(window, keep[55 * BLKSIZE..55 * BLKSIZE + 100]);
    audit(&fs);
}

#[test]
fn readdir_emits_dots_and_skips_blanks() {
    let (fs, root) = fresh(256, 64);
    root.create("a", 0o644).unwrap();
    root.create("b", 0o644).unwrap();
    root.symlink("c", "/a").unwrap();
    root.unlink("b").unwrap();

    let mut seen = Vec::new();
    let mut pos = 0;
    let done = root
        .read_dir(ROOT_INO, &mut pos, |entry| {
            seen.push((entry.name.to_vec(), entry.kind));
            true
        })
        .unwrap();
    assert_eq!(done, DirRead::Done);
    assert_eq!(
        seen,
        vec![
            (b".".to_vec(), FileType::Directory),
            (b"..".to_vec(), FileType::Directory),
            (b"a".to_vec(), FileType::Regular),
            (b"c".to_vec(), FileType::Symlink),
        ]
    );
    audit(&fs);
}

#[test]
fn readdir_backpressure_resumes_where_refused() {
    let (_fs, root) = fresh(256, 64);
    root.create("a", 0o644).unwrap();
    root.create("b", 0o644).unwrap();

    let mut seen = Vec::new();
    let mut pos = 0;
    let mut budget = 3;
    let state = root
        .read_dir(ROOT_INO, &mut pos, |entry| {
            if budget == 0 {
                return false;
            }
            budget -= 1;
            seen.push(entry.name.to_vec());
            true
        })
        .unwrap();
    assert_eq!(state, DirRead::Interrupted);
    assert_eq!(seen, vec![b".".to_vec(), b"..".to_vec(), b"a".to_vec()]);

    // The refused entry comes back on the next sweep.
    let state = root
        .read_dir(ROOT_INO, &mut pos, |entry| {
            seen.push(entry.name.to_vec());
            true
        })
        .unwrap();
    assert_eq!(state, DirRead::Done);
    assert_eq!(seen.last().unwrap(), b"b");
}

#[test]
fn append_writes_land_at_end() {
    let (_fs, root) = fresh(256, 64);
    let f = root.create("f", 0o644).unwrap();
    f.write_at(0, b"abc").unwrap();

    let mut src = b"def".to_vec();
    let n = f
        .write_with(0, 3, src.as_mut_slice(), OpenFlag::Append.into())
        .unwrap();
    assert_eq!(n, 3);

    let mut back = [0u8; 6];
    assert_eq!(f.read_at(0, &mut back).unwrap(), 6);
    assert_eq!(&back, b"abcdef");
}

#[test]
fn directory_resize_refused() {
    let (_fs, root) = fresh(256, 64);
    root.create("a", 0o644).unwrap();
    assert_eq!(root.truncate(0).unwrap_err(), FsError::PermissionDenied);
}

#[test]
fn symlink_truncation_shortens_target() {
    let (fs, root) = fresh(256, 64);
    let s = root.symlink("s", "abcdef").unwrap();
    s.truncate(3).unwrap();
    assert_eq!(s.follow_link(false).unwrap(), "abc");
    assert_eq!(s.stat().unwrap().size, 3);
    audit(&fs);
}

#[test]
fn sparse_extension_reads_back_zero() {
    let (fs, root) = fresh(256, 64);
    let f = root.create("f", 0o644).unwrap();
    f.write_at(5000, b"xyz").unwrap();
    assert_eq!(f.stat().unwrap().size, 5003);

    let mut gap = vec![0xAA; 5000];
    assert_eq!(f.read_at(0, &mut gap).unwrap(), 5000);
    assert!(gap.iter().all(|&b| b == 0));

    let mut tail = [0u8; 3];
    f.read_at(5000, &mut tail).unwrap();
    assert_eq!(&tail, b"xyz");
    audit(&fs);
}

/// Copies into an internal buffer until a preset fault point.
struct FaultAfter {
    data: Vec<u8>,
    limit: usize,
}

impl CopyOut for FaultAfter {
    fn copy_out(&mut self, offset: usize, src: &[u8]) -> bool {
        if offset + src.len() > self.limit {
            return false;
        }
        if self.data.len() < offset + src.len() {
            self.data.resize(offset + src.len(), 0);
        }
        self.data[offset..offset + src.len()].copy_from_slice(src);
        true
    }
}

/// Supplies bytes until a preset fault point.
struct FaultySource {
    data: Vec<u8>,
    limit: usize,
}

impl CopyIn for FaultySource {
    fn copy_in(&mut self, offset: usize, dst: &mut [u8]) -> bool {
        if offset + dst.len() > self.limit {
            return false;
        }
        dst.copy_from_slice(&self.data[offset..offset + dst.len()]);
        true
    }
}

#[test]
fn faulting_copies_report_partial_transfers() {
    let (_fs, root) = fresh(256, 64);
    let f = root.create("f", 0o644).unwrap();
    let data = pattern(3000);
    f.write_at(0, &data).unwrap();

    // One whole block crosses before the destination faults.
    let mut out = FaultAfter {
        data: Vec::new(),
        limit: BLKSIZE,
    };
    assert_eq!(f.read_with(0, 3000, &mut out).unwrap() as usize, BLKSIZE);
    assert_eq!(out.data, data[..BLKSIZE]);

    // Faulting before the first byte is an error, not a zero transfer.
    let mut dead = FaultAfter {
        data: Vec::new(),
        limit: 0,
    };
    assert_eq!(f.read_with(0, 3000, &mut dead).unwrap_err(), FsError::Fault);

    let g = root.create("g", 0o644).unwrap();
    let mut source = FaultySource {
        data: pattern(3000),
        limit: BLKSIZE,
    };
    assert_eq!(
        g.write_with(0, 3000, &mut source, Default::default()).unwrap() as usize,
        BLKSIZE
    );
    // The extension stuck even though the copy stopped short; the
    // untouched tail reads back as zeros.
    assert_eq!(g.stat().unwrap().size, 3000);
    let mut back = vec![0xAA; 3000];
    g.read_at(0, &mut back).unwrap();
    assert_eq!(back[..BLKSIZE], source.data[..BLKSIZE]);
    assert!(back[BLKSIZE..].iter().all(|&b| b == 0));
}

#[test]
fn unlinked_slots_are_reused() {
    let (fs, root) = fresh(256, 64);
    root.create("a", 0o644).unwrap();
    root.unlink("a").unwrap();
    let size = root.stat().unwrap().size;

    root.create("b", 0o644).unwrap();
    assert_eq!(root.stat().unwrap().size, size);
    audit(&fs);
}

#[test]
fn reopened_image_passes_audit_and_reads_back() {
    let (fs, root) = fresh(256, 64);
    let f = root.create("f", 0o644).unwrap();
    let data = pattern(2500);
    f.write_at(0, &data).unwrap();
    root.symlink("l", "/f").unwrap();

    let bytes: Vec<u8> = {
        let guard = fs.lock();
        (0..guard.image().total_blocks())
            .flat_map(|n| guard.image().block(n).to_vec())
            .collect()
    };

    // `open` audits the adopted image before handing it out.
    let reopened = Ospfs::open(DiskImage::from_bytes(&bytes).unwrap()).unwrap();
    let root2 = Ospfs::root_inode(&reopened);
    let f2 = root2.find("f").unwrap().expect("file survives the trip");
    let mut back = vec![0u8; 2500];
    assert_eq!(f2.read_at(0, &mut back).unwrap(), 2500);
    assert_eq!(back, data);
}

#[test]
fn image_file_round_trip() {
    let (fs, root) = fresh(256, 64);
    let f = root.create("f", 0o644).unwrap();
    f.write_at(0, b"persisted").unwrap();

    let path = std::env::temp_dir().join(format!("ospfs-test-{}.img", std::process::id()));
    crate::save_image(fs.lock().image(), &path).unwrap();
    let image = crate::load_image(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    let reopened = Ospfs::open(image).unwrap();
    let root2 = Ospfs::root_inode(&reopened);
    let mut back = [0u8; 9];
    root2
        .find("f")
        .unwrap()
        .expect("file present")
        .read_at(0, &mut back)
        .unwrap();
    assert_eq!(&back, b"persisted");
}

#[test]
fn errno_mapping_matches_the_host_convention() {
    assert_eq!(crate::errno(FsError::NotFound), -2);
    assert_eq!(crate::errno(FsError::Io), -5);
    assert_eq!(crate::errno(FsError::NoSpace), -28);
    assert_eq!(crate::ENOMEM, -12);
}

#[test]
fn mount_resolves_paths_and_conditional_links() {
    let (fs, root) = fresh(256, 64);
    let f = root.create("f", 0o644).unwrap();
    f.write_at(0, b"file-f").unwrap();
    let g = root.create("g", 0o644).unwrap();
    g.write_at(0, b"file-g").unwrap();

    root.symlink("abs", "/f").unwrap();
    root.symlink("rel", "g").unwrap();
    root.symlink("cond", "root?/f:/g").unwrap();
    root.symlink("loop1", "/loop2").unwrap();
    root.symlink("loop2", "/loop1").unwrap();

    let admin = Mount::new(Ospfs::root_inode(&fs), true);
    let user = Mount::new(Ospfs::root_inode(&fs), false);

    let mut buf = [0u8; 6];
    admin.resolve("/abs").unwrap().read_at(0, &mut buf).unwrap();
    assert_eq!(&buf, b"file-f");
    user.resolve("/rel").unwrap().read_at(0, &mut buf).unwrap();
    assert_eq!(&buf, b"file-g");

    admin.resolve("/cond").unwrap().read_at(0, &mut buf).unwrap();
    assert_eq!(&buf, b"file-f");
    user.resolve("/cond").unwrap().read_at(0, &mut buf).unwrap();
    assert_eq!(&buf, b"file-g");

    assert_eq!(user.resolve("/missing").unwrap_err(), FsError::NotFound);
    assert_eq!(user.resolve("/loop1").unwrap_err(), FsError::Io);
}

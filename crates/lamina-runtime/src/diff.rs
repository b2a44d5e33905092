//! Changes of a build rootfs relative to its base.
//!
//! On btrfs the snapshot is compared against the extracted base. On overlay
//! the upper directory already is the change set, with deletions recorded as
//! 0/0 character devices or `.wh.` files and opaque directories marked by an
//! xattr or a `.wh..wh..opq` file.

use crate::rootfs::StorageBackend;
use crate::squashfs::{self, SquashfsOptions};
use crate::RuntimeError;
use lamina_store::{
    tree_changes, unpack_layer, write_changes, Change, StoreError, TarOptions, UnpackOptions,
    OPAQUE_WHITEOUT, WHITEOUT_PREFIX,
};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::fs::{self, File, Metadata};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Mount point of imports inside the rootfs. Never part of a layer.
pub const IMPORTS_DIR: &str = "stacker";

const OPAQUE_XATTRS: &[&str] = &[
    "trusted.overlay.opaque",
    "user.overlay.opaque",
    "user.fuseoverlayfs.opaque",
];

/// A diff to write, executed as namespace root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffRequest {
    pub backend: StorageBackend,
    /// btrfs: the rootfs subvolume. overlay: the upper directory.
    pub rootfs: PathBuf,
    /// btrfs only: the tree the rootfs was snapshotted from.
    pub base: Option<PathBuf>,
    pub output: PathBuf,
    pub preserve_mtime: bool,
    /// Package the diff as squashfs instead of tar.
    pub squashfs: Option<SquashfsOptions>,
}

fn walk_err(e: walkdir::Error) -> StoreError {
    StoreError::Io(io::Error::other(e))
}

fn rel_of(root: &Path, path: &Path) -> Result<PathBuf, RuntimeError> {
    path.strip_prefix(root)
        .map(Path::to_path_buf)
        .map_err(|e| RuntimeError::Io(io::Error::other(format!("path strip: {e}"))))
}

fn is_imports_dir(rel: &Path) -> bool {
    rel.components().next().map(|c| c.as_os_str()) == Some(OsStr::new(IMPORTS_DIR))
}

/// Same inode content as far as a layer is concerned.
fn unchanged(a: &Metadata, b: &Metadata, a_path: &Path, b_path: &Path) -> bool {
    if a.file_type() != b.file_type()
        || a.mode() != b.mode()
        || a.uid() != b.uid()
        || a.gid() != b.gid()
        || a.mtime() != b.mtime()
        || a.mtime_nsec() != b.mtime_nsec()
    {
        return false;
    }
    let ft = a.file_type();
    if ft.is_dir() {
        return true;
    }
    if ft.is_symlink() {
        return fs::read_link(a_path).ok() == fs::read_link(b_path).ok();
    }
    if ft.is_char_device() || ft.is_block_device() {
        return a.rdev() == b.rdev();
    }
    if a.size() != b.size() {
        return false;
    }
    (a.ctime() == b.ctime() && a.ctime_nsec() == b.ctime_nsec())
        || same_content(a_path, b_path).unwrap_or(false)
}

fn same_content(a: &Path, b: &Path) -> io::Result<bool> {
    let mut ra = BufReader::new(File::open(a)?);
    let mut rb = BufReader::new(File::open(b)?);
    loop {
        let (la, lb) = {
            let ba = ra.fill_buf()?;
            let bb = rb.fill_buf()?;
            let n = ba.len().min(bb.len());
            if n == 0 {
                return Ok(ba.is_empty() && bb.is_empty());
            }
            if ba[..n] != bb[..n] {
                return Ok(false);
            }
            (n, n)
        };
        ra.consume(la);
        rb.consume(lb);
    }
}

/// Compare `rootfs` against the tree it was seeded from.
pub fn compare_trees(base: &Path, rootfs: &Path) -> Result<Vec<Change>, RuntimeError> {
    let mut changes = Vec::new();

    for entry in walkdir::WalkDir::new(rootfs).min_depth(1).follow_links(false) {
        let entry = entry.map_err(walk_err)?;
        let rel = rel_of(rootfs, entry.path())?;
        let meta = entry.metadata().map_err(walk_err)?;
        let base_path = base.join(&rel);
        match base_path.symlink_metadata() {
            Ok(base_meta) if unchanged(&base_meta, &meta, &base_path, entry.path()) => {}
            _ => changes.push(Change::Upsert(rel)),
        }
    }

    let mut it = walkdir::WalkDir::new(base).min_depth(1).follow_links(false).into_iter();
    while let Some(entry) = it.next() {
        let entry = entry.map_err(walk_err)?;
        let rel = rel_of(base, entry.path())?;
        match rootfs.join(&rel).symlink_metadata() {
            Err(_) => {
                changes.push(Change::Delete(rel));
                if entry.file_type().is_dir() {
                    it.skip_current_dir();
                }
            }
            // Replaced by a non-directory; the upsert covers the subtree.
            Ok(m) if entry.file_type().is_dir() && !m.is_dir() => it.skip_current_dir(),
            Ok(_) => {}
        }
    }
    Ok(changes)
}

fn is_opaque(path: &Path) -> bool {
    OPAQUE_XATTRS.iter().any(|name| {
        matches!(xattr::get(path, name), Ok(Some(v)) if v.as_slice() == b"y")
    }) || path.join(OPAQUE_WHITEOUT).exists()
}

/// Read the change set recorded in an overlay upper directory.
pub fn overlay_changes(upper: &Path) -> Result<Vec<Change>, RuntimeError> {
    let mut changes = Vec::new();
    for entry in walkdir::WalkDir::new(upper).min_depth(1).follow_links(false) {
        let entry = entry.map_err(walk_err)?;
        let rel = rel_of(upper, entry.path())?;
        let name = entry.file_name().as_bytes();
        let ft = entry.file_type();

        if name == OPAQUE_WHITEOUT.as_bytes() {
            continue;
        }
        if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX.as_bytes()) {
            changes.push(Change::Delete(rel.with_file_name(OsStr::from_bytes(hidden))));
            continue;
        }
        if ft.is_char_device() {
            let meta = entry.metadata().map_err(walk_err)?;
            if meta.rdev() == 0 {
                changes.push(Change::Delete(rel));
                continue;
            }
        }
        if ft.is_dir() && is_opaque(entry.path()) {
            changes.push(Change::Opaque(rel.clone()));
        }
        changes.push(Change::Upsert(rel));
    }
    Ok(changes)
}

/// Changes of a rootfs, without the imports mount point.
pub fn rootfs_changes(
    backend: StorageBackend,
    rootfs: &Path,
    base: Option<&Path>,
) -> Result<Vec<Change>, RuntimeError> {
    let changes = match (backend, base) {
        (StorageBackend::Btrfs, Some(base)) => compare_trees(base, rootfs)?,
        (StorageBackend::Btrfs, None) => tree_changes(rootfs)?,
        (StorageBackend::Overlay, _) => overlay_changes(rootfs)?,
    };
    Ok(changes
        .into_iter()
        .filter(|c| !is_imports_dir(c.path()))
        .collect())
}

/// Write the diff described by `req` to `req.output`.
pub fn write_diff(req: &DiffRequest) -> Result<(), RuntimeError> {
    let changes = rootfs_changes(req.backend, &req.rootfs, req.base.as_deref())?;
    debug!("{} changes in {}", changes.len(), req.rootfs.display());
    let tar_opts = TarOptions {
        preserve_mtime: req.preserve_mtime,
    };

    let Some(squashfs_opts) = &req.squashfs else {
        let out = BufWriter::new(File::create(&req.output)?);
        write_changes(&req.rootfs, &changes, out, &tar_opts)?
            .into_inner()
            .map_err(io::IntoInnerError::into_error)?
            .sync_all()?;
        return Ok(());
    };

    // Squashfs keeps whiteouts as plain marker files: materialize the tar
    // without interpreting them, then pack the tree.
    let parent = req.output.parent().unwrap_or_else(|| Path::new("."));
    let staging = tempfile::Builder::new().prefix(".diff-").tempdir_in(parent)?;
    let tar_path = staging.path().join("layer.tar");
    let out = BufWriter::new(File::create(&tar_path)?);
    write_changes(&req.rootfs, &changes, out, &tar_opts)?.flush()?;

    let tree = staging.path().join("tree");
    unpack_layer(
        File::open(&tar_path)?,
        &tree,
        &UnpackOptions {
            preserve_ownership: true,
            apply_whiteouts: false,
        },
    )?;
    squashfs::mksquashfs(&tree, &req.output, squashfs_opts, req.preserve_mtime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::os::unix::fs::PermissionsExt;

    fn describe(changes: &[Change]) -> BTreeSet<String> {
        changes
            .iter()
            .map(|c| match c {
                Change::Upsert(p) => format!("+{}", p.display()),
                Change::Delete(p) => format!("-{}", p.display()),
                Change::Opaque(p) => format!("*{}", p.display()),
            })
            .collect()
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    fn copy_tree(src: &Path, dest: &Path) {
        let status = std::process::Command::new("cp")
            .arg("-a")
            .arg(src)
            .arg(dest)
            .status()
            .unwrap();
        assert!(status.success());
    }

    /// Path -> kind, permission bits and content, without `/stacker`.
    fn snapshot(root: &Path) -> std::collections::BTreeMap<String, String> {
        walkdir::WalkDir::new(root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .map(Result::unwrap)
            .filter(|e| !is_imports_dir(e.path().strip_prefix(root).unwrap()))
            .map(|e| {
                let rel = e.path().strip_prefix(root).unwrap().display().to_string();
                let meta = e.path().symlink_metadata().unwrap();
                let mode = meta.permissions().mode() & 0o7777;
                let kind = if meta.file_type().is_symlink() {
                    format!("link {}", fs::read_link(e.path()).unwrap().display())
                } else if meta.is_dir() {
                    format!("dir {mode:o}")
                } else {
                    let content = fs::read(e.path()).unwrap();
                    format!("file {mode:o} {}", String::from_utf8_lossy(&content))
                };
                (rel, kind)
            })
            .collect()
    }

    /// Write the diff of `rootfs`, then extract it over a copy of `base`.
    fn apply_diff(dir: &Path, backend: StorageBackend, base: &Path, rootfs: &Path) -> PathBuf {
        let output = dir.join("layer.tar");
        write_diff(&DiffRequest {
            backend,
            rootfs: rootfs.to_path_buf(),
            base: (backend == StorageBackend::Btrfs).then(|| base.to_path_buf()),
            output: output.clone(),
            preserve_mtime: false,
            squashfs: None,
        })
        .unwrap();

        let applied = dir.join("applied");
        copy_tree(base, &applied);
        unpack_layer(
            File::open(&output).unwrap(),
            &applied,
            &UnpackOptions {
                preserve_ownership: false,
                apply_whiteouts: true,
            },
        )
        .unwrap();
        applied
    }

    fn sample_base(base: &Path) {
        fs::create_dir_all(base.join("etc")).unwrap();
        fs::create_dir_all(base.join("var/cache/deep")).unwrap();
        fs::create_dir_all(base.join("thing/inner")).unwrap();
        fs::create_dir_all(base.join("data")).unwrap();
        fs::create_dir_all(base.join("opt/app/sub")).unwrap();
        fs::write(base.join("etc/keep"), b"same").unwrap();
        fs::write(base.join("etc/edit"), b"old").unwrap();
        fs::write(base.join("etc/gone"), b"bye").unwrap();
        fs::write(base.join("var/cache/deep/junk"), b"x").unwrap();
        fs::write(base.join("thing/inner/x"), b"x").unwrap();
        fs::write(base.join("opt/app/old"), b"old").unwrap();
        fs::write(base.join("opt/app/sub/older"), b"older").unwrap();
    }

    #[test]
    fn compared_diff_reproduces_rootfs() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base");
        sample_base(&base);

        let rootfs = dir.path().join("rootfs");
        copy_tree(&base, &rootfs);
        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(rootfs.join("etc/edit"), b"new content").unwrap();
        fs::write(rootfs.join("etc/added"), b"+").unwrap();
        std::os::unix::fs::symlink("keep", rootfs.join("etc/link")).unwrap();
        fs::remove_file(rootfs.join("etc/gone")).unwrap();
        fs::remove_dir_all(rootfs.join("var/cache")).unwrap();
        fs::create_dir_all(rootfs.join("srv/new/deep")).unwrap();
        fs::write(rootfs.join("srv/new/deep/file"), b"deep").unwrap();
        fs::remove_dir_all(rootfs.join("thing")).unwrap();
        fs::write(rootfs.join("thing"), b"file now").unwrap();
        fs::set_permissions(rootfs.join("data"), fs::Permissions::from_mode(0o700)).unwrap();
        fs::create_dir_all(rootfs.join("stacker")).unwrap();
        fs::write(rootfs.join("stacker/.lamina-run.sh"), b"#!/bin/sh").unwrap();

        let applied = apply_diff(dir.path(), StorageBackend::Btrfs, &base, &rootfs);
        assert_eq!(snapshot(&applied), snapshot(&rootfs));
        assert!(!applied.join("stacker").exists());
    }

    #[test]
    fn overlay_diff_reproduces_merged_view() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base");
        sample_base(&base);

        // What the build saw through the overlay mount.
        let merged = dir.path().join("merged");
        copy_tree(&base, &merged);
        fs::write(merged.join("etc/edit"), b"new content").unwrap();
        fs::write(merged.join("etc/added"), b"+").unwrap();
        fs::remove_file(merged.join("etc/gone")).unwrap();
        fs::remove_dir_all(merged.join("var/cache")).unwrap();
        fs::create_dir_all(merged.join("srv/new")).unwrap();
        fs::write(merged.join("srv/new/file"), b"deep").unwrap();
        fs::remove_dir_all(merged.join("thing")).unwrap();
        fs::write(merged.join("thing"), b"file now").unwrap();
        fs::remove_dir_all(merged.join("opt/app")).unwrap();
        fs::create_dir_all(merged.join("opt/app")).unwrap();
        fs::write(merged.join("opt/app/bin"), b"b").unwrap();

        // The upper directory the kernel would have recorded for it.
        let upper = dir.path().join("upper");
        fs::create_dir_all(upper.join("etc")).unwrap();
        fs::write(upper.join("etc/edit"), b"new content").unwrap();
        fs::write(upper.join("etc/added"), b"+").unwrap();
        fs::write(upper.join("etc/.wh.gone"), b"").unwrap();
        fs::create_dir_all(upper.join("var")).unwrap();
        fs::write(upper.join("var/.wh.cache"), b"").unwrap();
        fs::create_dir_all(upper.join("srv/new")).unwrap();
        fs::write(upper.join("srv/new/file"), b"deep").unwrap();
        fs::write(upper.join("thing"), b"file now").unwrap();
        fs::create_dir_all(upper.join("opt/app")).unwrap();
        fs::write(upper.join("opt/app/.wh..wh..opq"), b"").unwrap();
        fs::write(upper.join("opt/app/bin"), b"b").unwrap();
        fs::create_dir_all(upper.join("stacker")).unwrap();
        fs::write(upper.join("stacker/.lamina-run.sh"), b"#!/bin/sh").unwrap();

        let applied = apply_diff(dir.path(), StorageBackend::Overlay, &base, &upper);
        assert_eq!(snapshot(&applied), snapshot(&merged));
        assert!(!applied.join("stacker").exists());
        assert!(!applied.join("opt/app/old").exists());
    }

    #[test]
    fn compare_detects_add_modify_delete() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base");
        fs::create_dir_all(base.join("etc")).unwrap();
        fs::create_dir_all(base.join("var/cache")).unwrap();
        fs::write(base.join("etc/keep"), b"same").unwrap();
        fs::write(base.join("etc/edit"), b"old").unwrap();
        fs::write(base.join("var/cache/junk"), b"x").unwrap();

        let rootfs = dir.path().join("rootfs");
        copy_tree(&base, &rootfs);
        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(rootfs.join("etc/edit"), b"new!").unwrap();
        fs::write(rootfs.join("etc/added"), b"+").unwrap();
        fs::remove_dir_all(rootfs.join("var/cache")).unwrap();
        fs::create_dir_all(rootfs.join("stacker")).unwrap();
        fs::write(rootfs.join("stacker/.lamina-run.sh"), b"#!/bin/sh").unwrap();

        let changes = rootfs_changes(StorageBackend::Btrfs, &rootfs, Some(&base)).unwrap();
        assert_eq!(
            describe(&changes),
            set(&["+etc", "+etc/added", "+etc/edit", "+var", "-var/cache"])
        );
    }

    #[test]
    fn compare_detects_mode_change() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base");
        fs::create_dir_all(&base).unwrap();
        fs::write(base.join("tool"), b"#!/bin/sh").unwrap();
        let rootfs = dir.path().join("rootfs");
        copy_tree(&base, &rootfs);
        fs::set_permissions(rootfs.join("tool"), fs::Permissions::from_mode(0o755)).unwrap();

        let changes = compare_trees(&base, &rootfs).unwrap();
        assert!(describe(&changes).contains("+tool"));
    }

    #[test]
    fn dir_replaced_by_file_skips_subtree_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base");
        fs::create_dir_all(base.join("thing/inner")).unwrap();
        let rootfs = dir.path().join("rootfs");
        fs::create_dir_all(&rootfs).unwrap();
        fs::write(rootfs.join("thing"), b"file now").unwrap();

        let changes = compare_trees(&base, &rootfs).unwrap();
        assert_eq!(describe(&changes), set(&["+thing"]));
    }

    #[test]
    fn scratch_btrfs_takes_everything() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        fs::write(dir.path().join("bin/sh"), b"elf").unwrap();
        let changes = rootfs_changes(StorageBackend::Btrfs, dir.path(), None).unwrap();
        assert_eq!(describe(&changes), set(&["+bin", "+bin/sh"]));
    }

    #[test]
    fn overlay_upper_markers() {
        let dir = tempfile::tempdir().unwrap();
        let upper = dir.path();
        fs::create_dir_all(upper.join("etc")).unwrap();
        fs::write(upper.join("etc/new"), b"n").unwrap();
        fs::write(upper.join("etc/.wh.removed"), b"").unwrap();
        fs::create_dir_all(upper.join("opt/app")).unwrap();
        fs::write(upper.join("opt/app/.wh..wh..opq"), b"").unwrap();
        fs::write(upper.join("opt/app/bin"), b"b").unwrap();
        fs::create_dir_all(upper.join("stacker")).unwrap();

        let changes = rootfs_changes(StorageBackend::Overlay, upper, None).unwrap();
        assert_eq!(
            describe(&changes),
            set(&[
                "+etc",
                "+etc/new",
                "-etc/removed",
                "+opt",
                "*opt/app",
                "+opt/app",
                "+opt/app/bin",
            ])
        );
    }

    #[test]
    fn tar_diff_is_written_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let upper = dir.path().join("upper");
        fs::create_dir_all(upper.join("b")).unwrap();
        fs::write(upper.join("b/file"), b"x").unwrap();
        fs::write(upper.join("a"), b"y").unwrap();
        fs::write(upper.join(".wh.gone"), b"").unwrap();
        let output = dir.path().join("layer.tar");

        write_diff(&DiffRequest {
            backend: StorageBackend::Overlay,
            rootfs: upper,
            base: None,
            output: output.clone(),
            preserve_mtime: false,
            squashfs: None,
        })
        .unwrap();

        let file = File::open(&output).unwrap();
        let mut ar = tar::Archive::new(file);
        let entries: Vec<(String, u64)> = ar
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                (
                    e.path().unwrap().to_string_lossy().into_owned(),
                    e.header().mtime().unwrap(),
                )
            })
            .collect();
        let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec![".wh.gone", "a", "b/", "b/file"]);
        assert!(entries.iter().all(|(_, mtime)| *mtime == 0));
    }
}

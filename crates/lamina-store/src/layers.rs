//! Deterministic layer tars with OCI whiteouts.
//!
//! A layer is described as a list of [`Change`]s relative to a root
//! directory. Writing guarantees:
//! - entries sorted bytewise by path
//! - mtimes set to 0 unless preserved explicitly
//! - owners recorded as they appear on disk, which inside the build
//!   namespace are the namespace IDs
//! - deletions and opaque directories emitted as `.wh.` marker files

use crate::oci::LayerMediaType;
use crate::StoreError;
use lamina_schema::{Compression, LayerFormat};
use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

pub const WHITEOUT_PREFIX: &str = ".wh.";
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// One filesystem change in a layer, relative to the layer root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Path was added or modified. Only the path itself is recorded;
    /// directory contents need their own entries.
    Upsert(PathBuf),
    /// Path was removed.
    Delete(PathBuf),
    /// Directory content from lower layers is hidden.
    Opaque(PathBuf),
}

impl Change {
    pub fn path(&self) -> &Path {
        match self {
            Change::Upsert(p) | Change::Delete(p) | Change::Opaque(p) => p,
        }
    }

    /// Path of the archive entry this change produces.
    fn entry_path(&self) -> Result<PathBuf, StoreError> {
        let rel = sanitize(self.path())?;
        match self {
            Change::Upsert(_) => Ok(rel),
            Change::Opaque(_) => Ok(rel.join(OPAQUE_WHITEOUT)),
            Change::Delete(_) => {
                let name = rel
                    .file_name()
                    .ok_or_else(|| StoreError::UnsafePath(rel.display().to_string()))?;
                let mut marker = OsString::from(WHITEOUT_PREFIX);
                marker.push(name);
                Ok(rel.with_file_name(marker))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TarOptions {
    pub preserve_mtime: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct UnpackOptions {
    pub preserve_ownership: bool,
    /// Interpret `.wh.` entries instead of extracting them as files.
    pub apply_whiteouts: bool,
}

impl Default for UnpackOptions {
    fn default() -> Self {
        Self {
            preserve_ownership: false,
            apply_whiteouts: true,
        }
    }
}

/// Every path below `root` as an upsert.
pub fn tree_changes(root: &Path) -> Result<Vec<Change>, StoreError> {
    let mut changes = Vec::new();
    for entry in walkdir::WalkDir::new(root).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| StoreError::Io(io::Error::other(e)))?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| StoreError::Io(io::Error::other(format!("path strip: {e}"))))?;
        changes.push(Change::Upsert(rel.to_path_buf()));
    }
    Ok(changes)
}

/// Write `changes` under `root` as a tar stream into `out`.
pub fn write_changes<W: Write>(
    root: &Path,
    changes: &[Change],
    out: W,
    opts: &TarOptions,
) -> Result<W, StoreError> {
    let mut entries = changes
        .iter()
        .map(|c| Ok((c.entry_path()?, c)))
        .collect::<Result<Vec<_>, StoreError>>()?;
    entries.sort_by(|a, b| a.0.as_os_str().as_bytes().cmp(b.0.as_os_str().as_bytes()));
    entries.dedup_by(|a, b| a.0 == b.0);

    let mut ar = tar::Builder::new(out);
    ar.follow_symlinks(false);
    let mut inodes: HashMap<(u64, u64), PathBuf> = HashMap::new();

    for (name, change) in &entries {
        match change {
            Change::Upsert(rel) => {
                append_path(&mut ar, &root.join(rel), name, opts, &mut inodes)?;
            }
            Change::Delete(_) | Change::Opaque(_) => append_whiteout(&mut ar, name)?,
        }
    }
    debug!("wrote layer with {} entries", entries.len());
    Ok(ar.into_inner()?)
}

fn make_header(
    meta: &fs::Metadata,
    entry_type: tar::EntryType,
    opts: &TarOptions,
) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(meta.permissions().mode() & 0o7777);
    header.set_uid(u64::from(meta.uid()));
    header.set_gid(u64::from(meta.gid()));
    header.set_mtime(if opts.preserve_mtime {
        u64::try_from(meta.mtime()).unwrap_or(0)
    } else {
        0
    });
    header.set_size(0);
    header
}

fn append_path<W: Write>(
    ar: &mut tar::Builder<W>,
    full_path: &Path,
    name: &Path,
    opts: &TarOptions,
    inodes: &mut HashMap<(u64, u64), PathBuf>,
) -> Result<(), StoreError> {
    let meta = match full_path.symlink_metadata() {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!("skipping {}: vanished before packing", name.display());
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    let ft = meta.file_type();

    if ft.is_file() {
        if meta.nlink() > 1 {
            if let Some(first) = inodes.get(&(meta.dev(), meta.ino())) {
                let mut header = make_header(&meta, tar::EntryType::Link, opts);
                ar.append_link(&mut header, name, first)?;
                return Ok(());
            }
            inodes.insert((meta.dev(), meta.ino()), name.to_path_buf());
        }
        let mut header = make_header(&meta, tar::EntryType::Regular, opts);
        header.set_size(meta.len());
        ar.append_data(&mut header, name, fs::File::open(full_path)?)?;
    } else if ft.is_dir() {
        let mut header = make_header(&meta, tar::EntryType::Directory, opts);
        let mut dir_name = name.as_os_str().to_owned();
        dir_name.push("/");
        ar.append_data(&mut header, dir_name, io::empty())?;
    } else if ft.is_symlink() {
        let target = fs::read_link(full_path)?;
        let mut header = make_header(&meta, tar::EntryType::Symlink, opts);
        ar.append_link(&mut header, name, &target)?;
    } else if ft.is_char_device() || ft.is_block_device() {
        let kind = if ft.is_char_device() {
            tar::EntryType::Char
        } else {
            tar::EntryType::Block
        };
        let mut header = make_header(&meta, kind, opts);
        header.set_device_major(dev_major(meta.rdev()))?;
        header.set_device_minor(dev_minor(meta.rdev()))?;
        ar.append_data(&mut header, name, io::empty())?;
    } else if ft.is_fifo() {
        let mut header = make_header(&meta, tar::EntryType::Fifo, opts);
        ar.append_data(&mut header, name, io::empty())?;
    } else {
        warn!("skipping unsupported file type: {}", name.display());
    }
    Ok(())
}

fn append_whiteout<W: Write>(ar: &mut tar::Builder<W>, name: &Path) -> Result<(), StoreError> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_size(0);
    ar.append_data(&mut header, name, io::empty())?;
    Ok(())
}

#[allow(clippy::cast_possible_truncation)]
fn dev_major(rdev: u64) -> u32 {
    (((rdev >> 32) & 0xffff_f000) | ((rdev >> 8) & 0x0000_0fff)) as u32
}

#[allow(clippy::cast_possible_truncation)]
fn dev_minor(rdev: u64) -> u32 {
    (((rdev >> 12) & 0xffff_ff00) | (rdev & 0x0000_00ff)) as u32
}

/// Strip leading `/` and `.` components; reject `..`.
fn sanitize(path: &Path) -> Result<PathBuf, StoreError> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(c) => out.push(c),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(StoreError::UnsafePath(path.display().to_string()))
            }
        }
    }
    Ok(out)
}

/// Join `rel` onto `root`, refusing to traverse symlinks in the parent chain.
fn resolve_inside(root: &Path, rel: &Path) -> Result<PathBuf, StoreError> {
    let mut current = root.to_path_buf();
    if let Some(parent) = rel.parent() {
        for component in parent.components() {
            current.push(component);
            if let Ok(meta) = current.symlink_metadata() {
                if meta.file_type().is_symlink() {
                    return Err(StoreError::UnsafePath(rel.display().to_string()));
                }
            }
        }
    }
    Ok(root.join(rel))
}

fn remove_any(path: &Path) -> io::Result<()> {
    match path.symlink_metadata() {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Remove every child of `dir` not listed in `keep`.
fn clear_dir(dir: &Path, keep: &HashSet<PathBuf>) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let path = entry?.path();
        if !keep.contains(&path) {
            remove_any(&path)?;
        }
    }
    Ok(())
}

/// Wrap a layer blob in the decompressor its media type requires.
pub fn open_layer_reader<'a, R: Read + 'a>(
    reader: R,
    media_type: LayerMediaType,
) -> Result<Box<dyn Read + 'a>, StoreError> {
    if media_type.format != LayerFormat::Tar {
        return Err(StoreError::UnsupportedMediaType(media_type.to_string()));
    }
    Ok(match media_type.compression {
        Compression::None => Box::new(reader),
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(reader)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(reader)?),
    })
}

/// Extract a tar stream onto `dest`, applying whiteouts against what is
/// already there.
pub fn unpack_layer<R: Read>(
    reader: R,
    dest: &Path,
    opts: &UnpackOptions,
) -> Result<(), StoreError> {
    fs::create_dir_all(dest)?;
    let mut ar = tar::Archive::new(reader);
    ar.set_preserve_permissions(true);
    ar.set_preserve_mtime(true);
    ar.set_preserve_ownerships(opts.preserve_ownership);
    ar.set_unpack_xattrs(false);
    ar.set_overwrite(true);

    // Paths written by this layer survive its own opaque markers.
    let mut written: HashSet<PathBuf> = HashSet::new();

    for entry in ar.entries()? {
        let mut entry = entry?;
        let rel = sanitize(&entry.path()?)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let file_name = rel
            .file_name()
            .map(|n| n.as_bytes().to_vec())
            .unwrap_or_default();

        if opts.apply_whiteouts && file_name.starts_with(WHITEOUT_PREFIX.as_bytes()) {
            let target_dir = resolve_inside(dest, &rel)?
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| dest.to_path_buf());
            if file_name == OPAQUE_WHITEOUT.as_bytes() {
                clear_dir(&target_dir, &written)?;
            } else {
                let hidden = &file_name[WHITEOUT_PREFIX.len()..];
                let victim = target_dir.join(std::ffi::OsStr::from_bytes(hidden));
                remove_any(&victim)?;
            }
            continue;
        }

        let target = resolve_inside(dest, &rel)?;
        // A directory replaces a file and vice versa.
        if let Ok(existing) = target.symlink_metadata() {
            let entry_is_dir = entry.header().entry_type() == tar::EntryType::Directory;
            if existing.is_dir() != entry_is_dir || existing.file_type().is_symlink() {
                remove_any(&target)?;
            }
        }
        if !entry.unpack_in(dest)? {
            return Err(StoreError::UnsafePath(rel.display().to_string()));
        }
        written.insert(target);
    }
    Ok(())
}

/// Move the content of `src` onto `dest`, interpreting `.wh.` marker files
/// found in `src`. `src` is consumed.
pub fn merge_tree(src: &Path, dest: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(dest)?;

    // Whiteouts first, so that content from src is never hidden.
    for entry in walkdir::WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| StoreError::Io(io::Error::other(e)))?;
        let name = entry.file_name().as_bytes();
        if !name.starts_with(WHITEOUT_PREFIX.as_bytes()) {
            continue;
        }
        let rel = relative(src, entry.path())?;
        let target_dir = resolve_inside(dest, &rel)?
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| dest.to_path_buf());
        if name == OPAQUE_WHITEOUT.as_bytes() {
            clear_dir(&target_dir, &HashSet::new())?;
        } else {
            let hidden = std::ffi::OsStr::from_bytes(&name[WHITEOUT_PREFIX.len()..]);
            remove_any(&target_dir.join(hidden))?;
        }
    }

    for entry in walkdir::WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| StoreError::Io(io::Error::other(e)))?;
        if entry
            .file_name()
            .as_bytes()
            .starts_with(WHITEOUT_PREFIX.as_bytes())
        {
            continue;
        }
        let rel = relative(src, entry.path())?;
        let target = resolve_inside(dest, &rel)?;
        let meta = entry.path().symlink_metadata()?;

        if meta.is_dir() {
            match target.symlink_metadata() {
                Ok(existing) if existing.is_dir() => {}
                Ok(_) => {
                    fs::remove_file(&target)?;
                    fs::create_dir(&target)?;
                }
                Err(_) => fs::create_dir_all(&target)?,
            }
            fs::set_permissions(&target, meta.permissions())?;
            continue;
        }

        remove_any(&target)?;
        if let Err(e) = fs::rename(entry.path(), &target) {
            debug!("rename {} failed ({e}), copying", rel.display());
            copy_entry(entry.path(), &target, &meta)?;
        }
    }
    Ok(())
}

fn relative(root: &Path, path: &Path) -> Result<PathBuf, StoreError> {
    path.strip_prefix(root)
        .map(Path::to_path_buf)
        .map_err(|e| StoreError::Io(io::Error::other(format!("path strip: {e}"))))
}

fn copy_entry(src: &Path, dest: &Path, meta: &fs::Metadata) -> Result<(), StoreError> {
    let ft = meta.file_type();
    if ft.is_symlink() {
        std::os::unix::fs::symlink(fs::read_link(src)?, dest)?;
    } else if ft.is_file() {
        fs::copy(src, dest)?;
        fs::set_permissions(dest, meta.permissions())?;
    } else {
        warn!("cannot copy special file {}", src.display());
        return Ok(());
    }
    if let Err(e) = std::os::unix::fs::lchown(dest, Some(meta.uid()), Some(meta.gid())) {
        debug!("keeping copied owner of {}: {e}", dest.display());
    }
    Ok(())
}

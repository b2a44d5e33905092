use crate::RuntimeError;
use lamina_schema::Compression;
use lamina_store::merge_tree;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::io::{self, Read};
use std::path::Path;
use std::process::{Command, Output};
use tracing::{debug, warn};

/// Features of the installed `mksquashfs`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MksquashfsCaps {
    pub zstd: bool,
    pub all_time: bool,
}

impl MksquashfsCaps {
    pub fn from_help(text: &str) -> Self {
        Self {
            zstd: text.contains("zstd"),
            all_time: text.contains("-all-time"),
        }
    }

    /// Ask `mksquashfs -help`. Some versions exit non-zero after printing help.
    pub fn probe() -> Result<Self, RuntimeError> {
        let out = spawn_output(Command::new("mksquashfs").arg("-help"), "mksquashfs")?;
        let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&out.stderr));
        let caps = Self::from_help(&text);
        debug!("mksquashfs: {caps:?}");
        Ok(caps)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SquashfsOptions {
    pub compression: Compression,
    pub caps: MksquashfsCaps,
}

impl SquashfsOptions {
    /// The compression actually used; zstd falls back to gzip when the tool
    /// lacks it.
    pub fn effective_compression(&self) -> Compression {
        if self.compression == Compression::Zstd && !self.caps.zstd {
            warn!("mksquashfs has no zstd support, using gzip");
            return Compression::Gzip;
        }
        self.compression
    }
}

pub fn mksquashfs_args(
    src: &Path,
    out: &Path,
    opts: &SquashfsOptions,
    preserve_mtime: bool,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![src.into(), out.into(), "-noappend".into()];
    match opts.effective_compression() {
        Compression::None => {
            for flag in ["-noI", "-noD", "-noF", "-noX"] {
                args.push(flag.into());
            }
        }
        Compression::Gzip => args.extend(["-comp".into(), "gzip".into()]),
        Compression::Zstd => args.extend(["-comp".into(), "zstd".into()]),
    }
    if opts.caps.all_time && !preserve_mtime {
        args.extend(["-all-time".into(), "0".into(), "-mkfs-time".into(), "0".into()]);
    }
    args
}

/// Pack `src` into the squashfs image `out`.
pub fn mksquashfs(
    src: &Path,
    out: &Path,
    opts: &SquashfsOptions,
    preserve_mtime: bool,
) -> Result<(), RuntimeError> {
    let args = mksquashfs_args(src, out, opts, preserve_mtime);
    run_tool(Command::new("mksquashfs").args(&args), "mksquashfs")
}

/// Unpack `image` into the fresh directory `dest`.
pub fn unsquashfs(image: &Path, dest: &Path) -> Result<(), RuntimeError> {
    run_tool(
        Command::new("unsquashfs")
            .arg("-f")
            .arg("-d")
            .arg(dest)
            .arg(image),
        "unsquashfs",
    )
}

/// Apply a squashfs layer, including its whiteouts, onto `dest`.
pub fn extract_onto(image: &Path, dest: &Path) -> Result<(), RuntimeError> {
    let parent = dest.parent().unwrap_or(dest);
    let staging = tempfile::Builder::new()
        .prefix(".squashfs-")
        .tempdir_in(parent)?;
    let tree = staging.path().join("tree");
    unsquashfs(image, &tree)?;
    merge_tree(&tree, dest)?;
    Ok(())
}

fn spawn_output(cmd: &mut Command, name: &str) -> Result<Output, RuntimeError> {
    cmd.output().map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            RuntimeError::MissingHelper(name.to_owned())
        } else {
            RuntimeError::Io(e)
        }
    })
}

fn run_tool(cmd: &mut Command, name: &str) -> Result<(), RuntimeError> {
    debug!("spawn: {name}");
    let out = spawn_output(cmd, name)?;
    if out.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&out.stderr);
    warn!("{name} failed: {}", stderr.trim());
    Err(RuntimeError::ChildFailed {
        command: name.to_owned(),
        status: out.status.code().unwrap_or(-1),
    })
}

const SQUASHFS_MAGIC: &[u8; 4] = b"hsqs";

/// Bytes used by the squashfs image at the start of `path`, read from its
/// superblock. Data appended after the image (a verity tree) is not counted.
pub fn image_size(path: &Path) -> Result<u64, RuntimeError> {
    let mut sb = [0u8; 48];
    fs::File::open(path)?.read_exact(&mut sb)?;
    if &sb[..4] != SQUASHFS_MAGIC {
        return Err(RuntimeError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} is not a squashfs image", path.display()),
        )));
    }
    let mut bytes_used = [0u8; 8];
    bytes_used.copy_from_slice(&sb[40..48]);
    Ok(u64::from_le_bytes(bytes_used))
}

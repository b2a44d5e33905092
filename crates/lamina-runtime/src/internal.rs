//! Operations executed as namespace root.
//!
//! Extracted rootfs trees carry subordinate ids, so reading, writing and
//! removing them must happen inside the build namespace. The executor runs
//! these in-process when it already is root and otherwise re-executes the
//! binary with `internal <json>`.

use crate::diff::{write_diff, DiffRequest};
use crate::squashfs;
use crate::RuntimeError;
use lamina_schema::LayerFormat;
use lamina_store::{open_layer_reader, unpack_layer, LayerMediaType, StoreError, UnpackOptions};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One layer blob to apply during extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSource {
    pub path: PathBuf,
    pub media_type: String,
}

/// Extract `layers` in order onto `dest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnpackRequest {
    pub layers: Vec<LayerSource>,
    pub dest: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum InternalOp {
    Unpack(UnpackRequest),
    Diff(DiffRequest),
    Remove { path: PathBuf },
}

/// Parse and execute an operation passed on the command line.
pub fn dispatch(payload: &str) -> Result<(), RuntimeError> {
    let op: InternalOp = serde_json::from_str(payload)?;
    execute(&op)
}

pub fn execute(op: &InternalOp) -> Result<(), RuntimeError> {
    match op {
        InternalOp::Unpack(req) => unpack(req),
        InternalOp::Diff(req) => write_diff(req),
        InternalOp::Remove { path } => force_remove(path),
    }
}

fn unpack(req: &UnpackRequest) -> Result<(), RuntimeError> {
    fs::create_dir_all(&req.dest)?;
    let opts = UnpackOptions {
        preserve_ownership: true,
        apply_whiteouts: true,
    };
    for layer in &req.layers {
        let media_type = LayerMediaType::parse(&layer.media_type)
            .ok_or_else(|| StoreError::UnsupportedMediaType(layer.media_type.clone()))?;
        debug!("extracting {} ({media_type})", layer.path.display());
        match media_type.format {
            LayerFormat::Tar => {
                let file = BufReader::new(File::open(&layer.path)?);
                unpack_layer(open_layer_reader(file, media_type)?, &req.dest, &opts)?;
            }
            LayerFormat::Squashfs => squashfs::extract_onto(&layer.path, &req.dest)?,
        }
    }
    Ok(())
}

/// Remove a tree, restoring owner write permission on directories first.
pub fn force_remove(path: &Path) -> Result<(), RuntimeError> {
    match fs::symlink_metadata(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
        Ok(meta) if !meta.is_dir() => {
            fs::remove_file(path)?;
            return Ok(());
        }
        Ok(_) => {}
    }
    for entry in walkdir::WalkDir::new(path).follow_links(false) {
        let Ok(entry) = entry else { continue };
        if entry.file_type().is_dir() {
            if let Ok(meta) = entry.metadata() {
                let mode = meta.permissions().mode();
                if mode & 0o700 != 0o700 {
                    let _ = fs::set_permissions(
                        entry.path(),
                        fs::Permissions::from_mode(mode | 0o700),
                    );
                }
            }
        }
    }
    fs::remove_dir_all(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lamina_schema::Compression;
    use lamina_store::{write_changes, Change, TarOptions};

    #[test]
    fn remove_op_roundtrips_through_json() {
        let op = InternalOp::Remove {
            path: PathBuf::from("/tmp/x"),
        };
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"op\":\"remove\""));
        let back: InternalOp = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, InternalOp::Remove { path } if path == Path::new("/tmp/x")));
    }

    #[test]
    fn dispatch_rejects_garbage() {
        assert!(matches!(
            dispatch("{\"op\":\"explode\"}"),
            Err(RuntimeError::Serialization(_))
        ));
    }

    #[test]
    fn force_remove_handles_readonly_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        fs::create_dir_all(tree.join("locked/inner")).unwrap();
        fs::write(tree.join("locked/inner/file"), b"x").unwrap();
        fs::set_permissions(tree.join("locked"), fs::Permissions::from_mode(0o500)).unwrap();
        force_remove(&tree).unwrap();
        assert!(!tree.exists());
        force_remove(&tree).unwrap();
    }

    #[test]
    fn unpack_applies_layers_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("etc")).unwrap();
        fs::write(src.join("etc/motd"), b"hello").unwrap();
        fs::write(src.join("gone"), b"bye").unwrap();

        let first = dir.path().join("first.tar");
        let changes = vec![
            Change::Upsert("etc".into()),
            Change::Upsert("etc/motd".into()),
            Change::Upsert("gone".into()),
        ];
        write_changes(&src, &changes, File::create(&first).unwrap(), &TarOptions::default())
            .unwrap();
        let second = dir.path().join("second.tar");
        write_changes(
            &src,
            &[Change::Delete("gone".into())],
            File::create(&second).unwrap(),
            &TarOptions::default(),
        )
        .unwrap();

        let media_type = LayerMediaType::new(LayerFormat::Tar, Compression::None).to_string();
        let dest = dir.path().join("dest");
        execute(&InternalOp::Unpack(UnpackRequest {
            layers: vec![
                LayerSource {
                    path: first,
                    media_type: media_type.clone(),
                },
                LayerSource {
                    path: second,
                    media_type,
                },
            ],
            dest: dest.clone(),
        }))
        .unwrap();
        assert_eq!(fs::read(dest.join("etc/motd")).unwrap(), b"hello");
        assert!(!dest.join("gone").exists());
    }

    #[test]
    fn unpack_rejects_unknown_media_type() {
        let dir = tempfile::tempdir().unwrap();
        let err = unpack(&UnpackRequest {
            layers: vec![LayerSource {
                path: dir.path().join("x"),
                media_type: "text/plain".to_owned(),
            }],
            dest: dir.path().join("dest"),
        })
        .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Store(StoreError::UnsupportedMediaType(_))
        ));
    }
}

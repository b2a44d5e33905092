//! Content digests of imported host paths.
//!
//! A file digests its mode and contents; a directory digests a sorted walk of
//! `(relative path, mode, content digest)` records. Timestamps never take part.

use crate::definition::Import;
use crate::types::Digest;
use sha2::{Digest as _, Sha256};
use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("import '{}' does not exist", .0.display())]
    Missing(PathBuf),
    #[error("import '{}' hash mismatch: expected {expected}, got {actual}", path.display())]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("import '{}' has an expected hash but is not a regular file", .0.display())]
    HashOnDirectory(PathBuf),
    #[error("I/O error hashing '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Digest of one import, in recipe order.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ImportDigest {
    pub path: PathBuf,
    pub digest: Digest,
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> ImportError + '_ {
    move |source| ImportError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// SHA-256 of a file's contents, hex encoded.
pub fn sha256_file(path: &Path) -> Result<String, ImportError> {
    let mut file = File::open(path).map_err(io_err(path))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(io_err(path))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn entry_digest(path: &Path, meta: &fs::Metadata) -> Result<String, ImportError> {
    let ft = meta.file_type();
    if ft.is_file() {
        sha256_file(path)
    } else if ft.is_symlink() {
        let target = fs::read_link(path).map_err(io_err(path))?;
        Ok(hex::encode(Sha256::digest(
            target.as_os_str().as_encoded_bytes(),
        )))
    } else {
        Ok(String::new())
    }
}

/// Digest a single import path.
///
/// A symlinked import is digested by what it points at, since that is what
/// gets bound into the build. Symlinks inside a directory are digested by
/// their target text.
pub fn digest_path(path: &Path) -> Result<Digest, ImportError> {
    let meta = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ImportError::Missing(path.to_path_buf()))
        }
        Err(e) => return Err(io_err(path)(e)),
    };

    let mut hasher = Sha256::new();
    if meta.is_dir() {
        hasher.update(b"dir\0");
        let root = fs::canonicalize(path).map_err(io_err(path))?;
        let walker = WalkDir::new(&root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name();
        for entry in walker {
            let entry = entry.map_err(|e| ImportError::Io {
                path: path.to_path_buf(),
                source: e.into(),
            })?;
            let entry_meta = entry.metadata().map_err(|e| ImportError::Io {
                path: entry.path().to_path_buf(),
                source: e.into(),
            })?;
            let rel = entry.path().strip_prefix(&root).unwrap_or(entry.path());
            let content = entry_digest(entry.path(), &entry_meta)?;
            hasher.update(rel.as_os_str().as_encoded_bytes());
            hasher.update(b"\0");
            hasher.update(entry_meta.permissions().mode().to_le_bytes());
            hasher.update(content.as_bytes());
            hasher.update(b"\n");
        }
    } else {
        hasher.update(b"file\0");
        hasher.update(meta.permissions().mode().to_le_bytes());
        hasher.update(entry_digest(path, &meta)?.as_bytes());
    }
    Ok(Digest::sha256(&hasher.finalize()))
}

/// Digest every import of a layer, checking expected hashes.
///
/// Relative import paths are resolved against `base_dir`.
pub fn digest_imports(
    imports: &[Import],
    base_dir: &Path,
) -> Result<Vec<ImportDigest>, ImportError> {
    let mut out = Vec::with_capacity(imports.len());
    for import in imports {
        let path = base_dir.join(&import.path);
        if let Some(expected) = &import.hash {
            if !path.is_file() {
                if path.exists() {
                    return Err(ImportError::HashOnDirectory(path));
                }
                return Err(ImportError::Missing(path));
            }
            let actual = sha256_file(&path)?;
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(ImportError::HashMismatch {
                    path,
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        out.push(ImportDigest {
            digest: digest_path(&path)?,
            path: import.path.clone(),
        });
    }
    Ok(out)
}

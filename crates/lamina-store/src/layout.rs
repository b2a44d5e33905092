use crate::oci::ImageIndex;
use crate::StoreError;
use lamina_schema::Digest;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Version written to the `oci-layout` marker file.
pub const OCI_LAYOUT_VERSION: &str = "1.0.0";
const LAYOUT_FILE: &str = "oci-layout";
const INDEX_FILE: &str = "index.json";

/// Directory layout of an OCI image layout.
///
/// `initialize` creates `blobs/sha256`, the `oci-layout` marker and an empty
/// `index.json` when they do not exist yet.
#[derive(Debug, Clone)]
pub struct OciLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct LayoutMarker {
    #[serde(rename = "imageLayoutVersion")]
    image_layout_version: String,
}

impl OciLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs").join("sha256")
    }

    #[inline]
    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    #[inline]
    pub fn layout_file(&self) -> PathBuf {
        self.root.join(LAYOUT_FILE)
    }

    /// Advisory lock serializing `index.json` updates across processes.
    #[inline]
    pub fn index_lock_file(&self) -> PathBuf {
        self.root.join(".index.json.lock")
    }

    /// Path of a blob, rejecting digests that could escape the blob directory.
    pub fn blob_path(&self, digest: &Digest) -> Result<PathBuf, StoreError> {
        if !digest.is_valid_sha256() {
            return Err(StoreError::InvalidDigest(digest.to_string()));
        }
        Ok(self.blobs_dir().join(digest.hex()))
    }

    pub fn is_initialized(&self) -> bool {
        self.layout_file().is_file() && self.index_path().is_file()
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.blobs_dir())?;

        if self.layout_file().exists() {
            self.verify_version()?;
        } else {
            let marker = LayoutMarker {
                image_layout_version: OCI_LAYOUT_VERSION.to_owned(),
            };
            write_atomic(&self.root, &self.layout_file(), &serde_json::to_vec(&marker)?)?;
        }

        if !self.index_path().exists() {
            let index = serde_json::to_vec(&ImageIndex::default())?;
            write_atomic(&self.root, &self.index_path(), &index)?;
        }
        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let content = fs::read_to_string(self.layout_file())?;
        let marker: LayoutMarker = serde_json::from_str(&content)?;
        if marker.image_layout_version != OCI_LAYOUT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: OCI_LAYOUT_VERSION.to_owned(),
                found: marker.image_layout_version,
            });
        }
        Ok(())
    }
}

/// Write `data` to `dest` through a temp file in `dir`, then fsync the directory.
pub(crate) fn write_atomic(dir: &Path, dest: &Path, data: &[u8]) -> Result<(), StoreError> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    crate::fsync_dir(dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_are_correct() {
        let layout = OciLayout::new("/tmp/lamina-test/oci");
        assert_eq!(
            layout.blobs_dir(),
            PathBuf::from("/tmp/lamina-test/oci/blobs/sha256")
        );
        assert_eq!(
            layout.index_path(),
            PathBuf::from("/tmp/lamina-test/oci/index.json")
        );
        let d = Digest::sha256(&[0xcd; 32]);
        assert_eq!(
            layout.blob_path(&d).unwrap(),
            layout.blobs_dir().join("cd".repeat(32))
        );
    }

    #[test]
    fn blob_path_rejects_traversal() {
        let layout = OciLayout::new("/tmp/x");
        assert!(layout.blob_path(&Digest::new("sha256:../../etc")).is_err());
    }

    #[test]
    fn initialize_writes_marker_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OciLayout::new(dir.path());
        layout.initialize().unwrap();

        assert!(layout.blobs_dir().is_dir());
        assert!(layout.is_initialized());
        let marker = fs::read_to_string(layout.layout_file()).unwrap();
        assert_eq!(marker, r#"{"imageLayoutVersion":"1.0.0"}"#);
        let index: ImageIndex =
            serde_json::from_str(&fs::read_to_string(layout.index_path()).unwrap()).unwrap();
        assert!(index.manifests.is_empty());
    }

    #[test]
    fn initialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OciLayout::new(dir.path());
        layout.initialize().unwrap();
        layout.initialize().unwrap();
        layout.verify_version().unwrap();
    }

    #[test]
    fn foreign_layout_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("oci-layout"),
            r#"{"imageLayoutVersion":"2.0.0"}"#,
        )
        .unwrap();
        let layout = OciLayout::new(dir.path());
        assert!(matches!(
            layout.initialize(),
            Err(StoreError::VersionMismatch { .. })
        ));
    }
}

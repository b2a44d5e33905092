use crate::digest::{sha256_reader, HashingWriter};
use crate::layout::OciLayout;
use crate::oci::Descriptor;
use crate::retry::RetryPolicy;
use crate::{fsync_dir, StoreError};
use lamina_schema::Digest;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use tempfile::NamedTempFile;
use tracing::debug;

/// Content-addressed blob store inside an OCI layout.
///
/// Blobs are named by their SHA-256 digest. Writes stream into a temp file
/// in the blob directory, are fsynced and renamed into place, so readers
/// never observe a partial blob. Reads verify the digest on request.
#[derive(Debug, Clone)]
pub struct BlobStore {
    layout: OciLayout,
    retry: RetryPolicy,
}

impl BlobStore {
    pub fn new(layout: OciLayout) -> Self {
        Self {
            layout,
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn layout(&self) -> &OciLayout {
        &self.layout
    }

    /// Stream a blob into the store. Idempotent: an existing blob with the
    /// same digest is kept and the temp copy discarded.
    pub fn put_blob(&self, mut reader: impl Read) -> Result<(Digest, u64), StoreError> {
        let dir = self.layout.blobs_dir();
        let tmp = self
            .retry
            .run("create temp blob", || NamedTempFile::new_in(&dir))?;

        let mut writer = HashingWriter::new(tmp);
        io::copy(&mut reader, &mut writer)?;
        writer.flush()?;
        let (tmp, digest, size) = writer.finish();

        let dest = self.layout.blob_path(&digest)?;
        if dest.exists() {
            debug!("blob {digest} already present");
            return Ok((digest, size));
        }

        self.retry.run("sync blob", || tmp.as_file().sync_all())?;
        tmp.persist(&dest).map_err(|e| StoreError::Io(e.error))?;
        self.retry.run("fsync blob dir", || fsync_dir(&dir))?;
        debug!("stored blob {digest} ({size} bytes)");
        Ok((digest, size))
    }

    pub fn put_bytes(&self, data: &[u8]) -> Result<(Digest, u64), StoreError> {
        self.put_blob(data)
    }

    /// Serialize `value` as compact JSON, store it, and describe it.
    pub fn put_json<T: Serialize>(
        &self,
        media_type: &str,
        value: &T,
    ) -> Result<Descriptor, StoreError> {
        let data = serde_json::to_vec(value)?;
        let (digest, size) = self.put_bytes(&data)?;
        Ok(Descriptor::new(media_type, digest, size))
    }

    pub fn exists(&self, digest: &Digest) -> bool {
        self.layout
            .blob_path(digest)
            .is_ok_and(|p| p.is_file())
    }

    pub fn open(&self, digest: &Digest) -> Result<File, StoreError> {
        let path = self.layout.blob_path(digest)?;
        File::open(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StoreError::BlobNotFound(digest.to_string())
            } else {
                StoreError::Io(e)
            }
        })
    }

    /// Read a whole blob, verifying its digest.
    pub fn read(&self, digest: &Digest) -> Result<Vec<u8>, StoreError> {
        let mut data = Vec::new();
        self.open(digest)?.read_to_end(&mut data)?;
        let (actual, _) = sha256_reader(data.as_slice())?;
        if actual != *digest {
            return Err(StoreError::IntegrityFailure {
                digest: digest.to_string(),
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(data)
    }

    pub fn read_json<T: DeserializeOwned>(&self, digest: &Digest) -> Result<T, StoreError> {
        Ok(serde_json::from_slice(&self.read(digest)?)?)
    }

    /// Recompute a blob's digest from disk.
    pub fn verify(&self, digest: &Digest) -> Result<(), StoreError> {
        let (actual, _) = sha256_reader(BufReader::new(self.open(digest)?))?;
        if actual != *digest {
            return Err(StoreError::IntegrityFailure {
                digest: digest.to_string(),
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }

    pub fn size(&self, digest: &Digest) -> Result<u64, StoreError> {
        Ok(self.open(digest)?.metadata()?.len())
    }

    pub fn remove(&self, digest: &Digest) -> Result<(), StoreError> {
        let path = self.layout.blob_path(digest)?;
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// All blob digests, sorted. Temp files are skipped.
    pub fn list(&self) -> Result<Vec<Digest>, StoreError> {
        let dir = self.layout.blobs_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut digests = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                let digest = Digest::new(format!("sha256:{name}"));
                if digest.is_valid_sha256() {
                    digests.push(digest);
                }
            }
        }
        digests.sort();
        Ok(digests)
    }

    /// Copy a blob from another store, skipping it when already present.
    /// Returns true when bytes were copied.
    pub fn copy_from(&self, other: &BlobStore, digest: &Digest) -> Result<bool, StoreError> {
        if self.exists(digest) {
            return Ok(false);
        }
        let (copied, _) = self.put_blob(BufReader::new(other.open(digest)?))?;
        if copied != *digest {
            self.remove(&copied)?;
            return Err(StoreError::IntegrityFailure {
                digest: digest.to_string(),
                expected: digest.to_string(),
                actual: copied.to_string(),
            });
        }
        Ok(true)
    }
}

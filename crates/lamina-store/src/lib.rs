//! OCI image layout, blob store, build cache, and layer tars for Lamina.
//!
//! This crate provides the storage layer: `OciLayout` for the on-disk
//! directory structure, a content-addressed `BlobStore` with atomic writes and
//! verified reads, `ImageStore` for manifests, configs and `index.json`
//! references, `BuildCache` mapping fingerprints to built artifacts with
//! single-flight builds, deterministic whiteout-aware layer tars, and a
//! `GarbageCollector` for unreachable blobs.

pub mod blobs;
pub mod cache;
pub mod digest;
pub mod gc;
pub mod image;
pub mod layers;
pub mod layout;
pub mod oci;
pub mod retry;

pub use blobs::BlobStore;
pub use cache::{
    BuildCache, CacheEntry, CacheOutcome, LayerArtifact, PruneReport, CACHE_FORMAT_VERSION,
};
pub use digest::{sha256_reader, HashingReader, HashingWriter};
pub use gc::{GarbageCollector, GcReport};
pub use image::{ComposedImage, ImageStore, LayerBlob};
pub use layers::{
    merge_tree, open_layer_reader, tree_changes, unpack_layer, write_changes, Change, TarOptions,
    UnpackOptions, OPAQUE_WHITEOUT, WHITEOUT_PREFIX,
};
pub use layout::{OciLayout, OCI_LAYOUT_VERSION};
pub use oci::{
    ContainerConfig, Descriptor, History, ImageConfiguration, ImageIndex, LayerMediaType,
    Manifest, MEDIA_TYPE_CONFIG, MEDIA_TYPE_INDEX, MEDIA_TYPE_MANIFEST, REF_NAME_ANNOTATION,
    VERITY_ROOT_HASH_ANNOTATION,
};
pub use retry::RetryPolicy;

use std::path::Path;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity check failed for blob '{digest}': expected {expected}, got {actual}")]
    IntegrityFailure {
        digest: String,
        expected: String,
        actual: String,
    },
    #[error("blob not found: {0}")]
    BlobNotFound(String),
    #[error("reference not found: {0}")]
    ReferenceNotFound(String),
    #[error("invalid digest: {0}")]
    InvalidDigest(String),
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),
    #[error("unsafe path in layer: {0}")]
    UnsafePath(String),
    #[error("'{0}' is locked by another process")]
    Locked(String),
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
    #[error("OCI layout version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: String, found: String },
    #[error("build of {fingerprint} failed in another worker: {reason}")]
    FlightFailed { fingerprint: String, reason: String },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

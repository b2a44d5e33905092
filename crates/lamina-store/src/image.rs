//! Manifests, configs and references of an OCI layout.
//!
//! Every mutation of `index.json` holds an in-process mutex and an exclusive
//! advisory lock on the layout's lock file. Composite operations write all
//! blobs before touching the index, so a crash leaves at most unreferenced
//! blobs behind.

use crate::blobs::BlobStore;
use crate::digest::sha256_reader;
use crate::layers::open_layer_reader;
use crate::layout::{write_atomic, OciLayout};
use crate::oci::{
    Descriptor, History, ImageConfiguration, ImageIndex, LayerMediaType, Manifest,
    MEDIA_TYPE_CONFIG, MEDIA_TYPE_INDEX, MEDIA_TYPE_MANIFEST, REF_NAME_ANNOTATION,
};
use crate::StoreError;
use fs2::FileExt;
use lamina_schema::Digest;
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

/// A layer blob already in the store, with its uncompressed diff ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerBlob {
    pub descriptor: Descriptor,
    pub diff_id: Digest,
}

/// Descriptors of an image produced by adding one layer to a base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedImage {
    pub manifest: Descriptor,
    pub config: Descriptor,
    pub layer: Descriptor,
    pub diff_id: Digest,
}

pub struct ImageStore {
    blobs: BlobStore,
    index_guard: Mutex<()>,
}

impl ImageStore {
    /// Open (and create if needed) the layout at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let layout = OciLayout::new(root.as_ref());
        layout.initialize()?;
        Ok(Self {
            blobs: BlobStore::new(layout),
            index_guard: Mutex::new(()),
        })
    }

    pub fn layout(&self) -> &OciLayout {
        self.blobs.layout()
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn read_index(&self) -> Result<ImageIndex, StoreError> {
        let path = self.layout().index_path();
        match fs::read(&path) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ImageIndex::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Run `f` on the index under both locks and persist the result atomically.
    fn modify_index<T>(
        &self,
        f: impl FnOnce(&mut ImageIndex) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _guard = self
            .index_guard
            .lock()
            .map_err(|_| StoreError::LockFailed("index mutex poisoned".to_owned()))?;
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.layout().index_lock_file())?;
        lock_file
            .lock_exclusive()
            .map_err(|e| StoreError::LockFailed(format!("index.json: {e}")))?;

        let mut index = self.read_index()?;
        let out = f(&mut index)?;
        let data = serde_json::to_vec_pretty(&index)?;
        write_atomic(self.layout().root(), &self.layout().index_path(), &data)?;

        let _ = fs2::FileExt::unlock(&lock_file);
        Ok(out)
    }

    /// Point `name` at `descriptor`, replacing any previous target.
    pub fn update_reference(&self, name: &str, descriptor: &Descriptor) -> Result<(), StoreError> {
        let mut desc = descriptor.clone();
        desc.annotations
            .insert(REF_NAME_ANNOTATION.to_owned(), name.to_owned());
        self.modify_index(|index| {
            index.manifests.retain(|m| m.ref_name() != Some(name));
            index.manifests.push(desc);
            Ok(())
        })?;
        info!("updated reference {name} -> {}", descriptor.digest);
        Ok(())
    }

    pub fn remove_reference(&self, name: &str) -> Result<bool, StoreError> {
        self.modify_index(|index| {
            let before = index.manifests.len();
            index.manifests.retain(|m| m.ref_name() != Some(name));
            Ok(index.manifests.len() != before)
        })
    }

    /// All named references, sorted by name.
    pub fn references(&self) -> Result<BTreeMap<String, Descriptor>, StoreError> {
        Ok(self
            .read_index()?
            .manifests
            .into_iter()
            .filter_map(|d| d.ref_name().map(str::to_owned).map(|n| (n, d)))
            .collect())
    }

    pub fn lookup_descriptor(&self, name: &str) -> Result<Descriptor, StoreError> {
        self.read_index()?
            .manifests
            .into_iter()
            .find(|d| d.ref_name() == Some(name))
            .ok_or_else(|| StoreError::ReferenceNotFound(name.to_owned()))
    }

    pub fn lookup_manifest(&self, name: &str) -> Result<Manifest, StoreError> {
        let desc = self.lookup_descriptor(name)?;
        self.read_manifest(&desc)
    }

    pub fn read_manifest(&self, descriptor: &Descriptor) -> Result<Manifest, StoreError> {
        if descriptor.media_type == MEDIA_TYPE_INDEX {
            return Err(StoreError::UnsupportedMediaType(format!(
                "{} (nested index at {})",
                descriptor.media_type, descriptor.digest
            )));
        }
        self.blobs.read_json(&descriptor.digest)
    }

    pub fn lookup_config(&self, config: &Descriptor) -> Result<ImageConfiguration, StoreError> {
        self.blobs.read_json(&config.digest)
    }

    /// Add a stored layer on top of `base` (a manifest descriptor, or none for
    /// an empty image) and write the resulting config and manifest blobs.
    ///
    /// `mutate` edits the new config after the diff ID has been appended.
    /// No reference is updated.
    pub fn compose_layer(
        &self,
        base: Option<&Descriptor>,
        layer: &LayerBlob,
        mutate: impl FnOnce(&mut ImageConfiguration),
        manifest_annotations: &BTreeMap<String, String>,
    ) -> Result<ComposedImage, StoreError> {
        let (mut manifest, mut config) = match base {
            Some(desc) => {
                let manifest = self.read_manifest(desc)?;
                let config = self.lookup_config(&manifest.config)?;
                (manifest, config)
            }
            None => {
                let config = ImageConfiguration::empty();
                let placeholder = Descriptor::new(MEDIA_TYPE_CONFIG, Digest::new(""), 0);
                (Manifest::new(placeholder), config)
            }
        };

        if !self.blobs.exists(&layer.descriptor.digest) {
            return Err(StoreError::BlobNotFound(layer.descriptor.digest.to_string()));
        }

        config.rootfs.diff_ids.push(layer.diff_id.clone());
        config.history.push(History {
            created_by: Some("lamina build".to_owned()),
            ..History::default()
        });
        mutate(&mut config);

        let config_desc = self.blobs.put_json(MEDIA_TYPE_CONFIG, &config)?;
        manifest.schema_version = 2;
        manifest.media_type = Some(MEDIA_TYPE_MANIFEST.to_owned());
        manifest.config = config_desc.clone();
        manifest.layers.push(layer.descriptor.clone());
        for (k, v) in manifest_annotations {
            manifest.annotations.insert(k.clone(), v.clone());
        }
        let manifest_desc = self.blobs.put_json(MEDIA_TYPE_MANIFEST, &manifest)?;
        debug!(
            "composed manifest {} with {} layers",
            manifest_desc.digest,
            manifest.layers.len()
        );

        Ok(ComposedImage {
            manifest: manifest_desc,
            config: config_desc,
            layer: layer.descriptor.clone(),
            diff_id: layer.diff_id.clone(),
        })
    }

    /// Store a layer blob and compute its diff ID.
    pub fn put_layer(
        &self,
        blob: impl Read,
        media_type: LayerMediaType,
    ) -> Result<LayerBlob, StoreError> {
        let (digest, size) = self.blobs.put_blob(blob)?;
        let diff_id = if media_type.is_stream_compressed() {
            let reader = open_layer_reader(BufReader::new(self.blobs.open(&digest)?), media_type)?;
            sha256_reader(reader)?.0
        } else {
            digest.clone()
        };
        Ok(LayerBlob {
            descriptor: Descriptor::new(media_type.to_string(), digest, size),
            diff_id,
        })
    }

    /// Append a layer to the image referenced by `name` (or start a new image
    /// when `name` does not exist yet) and move the reference.
    pub fn append_layer(
        &self,
        name: &str,
        blob: impl Read,
        media_type: LayerMediaType,
    ) -> Result<ComposedImage, StoreError> {
        let base = match self.lookup_descriptor(name) {
            Ok(d) => Some(d),
            Err(StoreError::ReferenceNotFound(_)) => None,
            Err(e) => return Err(e),
        };
        let layer = self.put_layer(blob, media_type)?;
        let composed = self.compose_layer(base.as_ref(), &layer, |_| {}, &BTreeMap::new())?;
        self.update_reference(name, &composed.manifest)?;
        Ok(composed)
    }

    /// Digests of every blob reachable from `roots` (manifest descriptors).
    /// Missing blobs are skipped.
    pub fn reachable_from<'a>(
        &self,
        roots: impl IntoIterator<Item = &'a Descriptor>,
    ) -> Result<HashSet<Digest>, StoreError> {
        let mut live = HashSet::new();
        let mut pending: Vec<Descriptor> = roots.into_iter().cloned().collect();
        while let Some(desc) = pending.pop() {
            if !live.insert(desc.digest.clone()) || !self.blobs.exists(&desc.digest) {
                continue;
            }
            if desc.media_type == MEDIA_TYPE_INDEX {
                let nested: ImageIndex = self.blobs.read_json(&desc.digest)?;
                pending.extend(nested.manifests);
            } else if desc.media_type == MEDIA_TYPE_MANIFEST
                || desc.media_type == "application/vnd.docker.distribution.manifest.v2+json"
            {
                let manifest = self.read_manifest(&desc)?;
                live.insert(manifest.config.digest.clone());
                for layer in &manifest.layers {
                    live.insert(layer.digest.clone());
                }
            }
        }
        Ok(live)
    }

    /// Digests of every blob reachable from `index.json`.
    pub fn referenced_blobs(&self) -> Result<HashSet<Digest>, StoreError> {
        let index = self.read_index()?;
        self.reachable_from(&index.manifests)
    }
}

//! Image copy between references, and the local cache of external bases.
//!
//! `oci:` to `oci:` copies stay in-process and move blobs by digest. Any
//! registry side is handed to `skopeo copy`.

use crate::CoreError;
use lamina_runtime::RuntimeError;
use lamina_schema::{Digest, ImageRef};
use lamina_store::retry::is_transient_io;
use lamina_store::{Descriptor, ImageStore, OciLayout, RetryPolicy, StoreError};
use std::fs;
use std::io;
use std::path::Path;
use std::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct CopyOptions {
    pub retry: RetryPolicy,
    /// Program used for registry transfers.
    pub skopeo: String,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            skopeo: "skopeo".to_owned(),
        }
    }
}

impl CopyOptions {
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retry.retries = retries;
        self
    }
}

/// Copy the image at `src` to `dst`.
pub fn copy(src: &ImageRef, dst: &ImageRef, opts: &CopyOptions) -> Result<(), CoreError> {
    info!("copying {src} to {dst}");
    match (src, dst) {
        (
            ImageRef::Oci {
                dir: src_dir,
                tag: src_tag,
            },
            ImageRef::Oci {
                dir: dst_dir,
                tag: dst_tag,
            },
        ) => copy_local(src_dir, src_tag, dst_dir, dst_tag, opts),
        (ImageRef::Other { scheme, .. }, _) | (_, ImageRef::Other { scheme, .. }) => Err(
            CoreError::Config(format!("cannot copy '{scheme}:' references")),
        ),
        _ => skopeo_copy(src, dst, opts),
    }
}

fn open_existing(dir: &Path) -> Result<ImageStore, CoreError> {
    if !OciLayout::new(dir).is_initialized() {
        return Err(CoreError::Unknown(format!(
            "{} is not an OCI image layout",
            dir.display()
        )));
    }
    Ok(ImageStore::open(dir)?)
}

fn copy_local(
    src_dir: &Path,
    src_tag: &str,
    dst_dir: &Path,
    dst_tag: &str,
    opts: &CopyOptions,
) -> Result<(), CoreError> {
    let src = open_existing(src_dir)?;
    let desc = src.lookup_descriptor(src_tag)?;
    let dst = ImageStore::open(dst_dir)?;
    let copied = transfer(&src, &dst, &desc, &opts.retry)?;
    dst.update_reference(dst_tag, &desc)?;
    debug!("{copied} blobs copied for {dst_tag}");
    Ok(())
}

/// Copy every blob reachable from `manifest` into `dst`, skipping blobs it
/// already holds. Returns how many blobs were written.
pub fn transfer(
    src: &ImageStore,
    dst: &ImageStore,
    manifest: &Descriptor,
    retry: &RetryPolicy,
) -> Result<usize, CoreError> {
    let mut digests: Vec<Digest> = src.reachable_from([manifest])?.into_iter().collect();
    digests.sort();
    let mut copied = 0;
    for digest in &digests {
        if !src.blobs().exists(digest) {
            return Err(StoreError::BlobNotFound(digest.to_string()).into());
        }
        let written = retry.run_with(
            "copy blob",
            |e: &StoreError| matches!(e, StoreError::Io(err) if is_transient_io(err)),
            || dst.blobs().copy_from(src.blobs(), digest),
        )?;
        if written {
            copied += 1;
        }
    }
    Ok(copied)
}

fn skopeo_copy(src: &ImageRef, dst: &ImageRef, opts: &CopyOptions) -> Result<(), CoreError> {
    if let ImageRef::Oci { dir, .. } = dst {
        fs::create_dir_all(dir)?;
    }
    opts.retry.run_with(
        "skopeo copy",
        |e: &CoreError| matches!(e, CoreError::Runtime(RuntimeError::ChildFailed { .. })),
        || run_skopeo(&opts.skopeo, src, dst),
    )
}

fn run_skopeo(program: &str, src: &ImageRef, dst: &ImageRef) -> Result<(), CoreError> {
    let out = Command::new(program)
        .arg("copy")
        .arg(src.to_string())
        .arg(dst.to_string())
        .output()
        .map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                RuntimeError::MissingHelper(program.to_owned())
            } else {
                RuntimeError::Io(e)
            }
        })?;
    if out.status.success() {
        return Ok(());
    }
    warn!(
        "{program} copy failed: {}",
        String::from_utf8_lossy(&out.stderr).trim()
    );
    Err(RuntimeError::ChildFailed {
        command: format!("{program} copy"),
        status: out.status.code().unwrap_or(-1),
    }
    .into())
}

/// Local OCI layout holding copies of external base images.
///
/// An image is fetched once; later builds resolve it from the cache, so the
/// digest folded into fingerprints only changes when the cache is cleared.
pub struct BaseImageCache {
    store: ImageStore,
    copy: CopyOptions,
}

impl BaseImageCache {
    pub fn open(dir: &Path, copy: CopyOptions) -> Result<Self, CoreError> {
        Ok(Self {
            store: ImageStore::open(dir)?,
            copy,
        })
    }

    pub fn store(&self) -> &ImageStore {
        &self.store
    }

    /// Manifest descriptor of `image`, copying it into the cache first if
    /// needed.
    pub fn resolve(&self, image: &ImageRef) -> Result<Descriptor, CoreError> {
        let tag = image.cache_tag();
        match self.store.lookup_descriptor(&tag) {
            Ok(desc) => {
                debug!("base {image} cached as {}", desc.digest);
                return Ok(desc);
            }
            Err(StoreError::ReferenceNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        info!("caching base image {image}");
        let dst = ImageRef::Oci {
            dir: self.store.layout().root().to_path_buf(),
            tag: tag.clone(),
        };
        copy(image, &dst, &self.copy)?;
        Ok(self.store.lookup_descriptor(&tag)?)
    }

    /// Resolve `image` and make its blobs available in `into`.
    pub fn import(&self, image: &ImageRef, into: &ImageStore) -> Result<Descriptor, CoreError> {
        let desc = self.resolve(image)?;
        transfer(&self.store, into, &desc, &self.copy.retry)?;
        Ok(desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use lamina_schema::{Compression, LayerFormat};
    use lamina_store::LayerMediaType;
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    fn layer_tar(name: &str, content: &[u8]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, content).unwrap();
        builder.into_inner().unwrap()
    }

    fn seed_image(dir: &Path, tag: &str, content: &[u8]) -> Descriptor {
        let store = ImageStore::open(dir).unwrap();
        let data = layer_tar("foo", content);
        store
            .append_layer(
                tag,
                &data[..],
                LayerMediaType::new(LayerFormat::Tar, Compression::None),
            )
            .unwrap()
            .manifest
    }

    fn blob_names(dir: &Path) -> BTreeSet<String> {
        fs::read_dir(dir.join("blobs").join("sha256"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    fn oci(dir: PathBuf, tag: &str) -> ImageRef {
        ImageRef::Oci {
            dir,
            tag: tag.to_owned(),
        }
    }

    #[test]
    fn oci_copy_preserves_blob_names() {
        let tmp = tempfile::tempdir().unwrap();
        let src_dir = tmp.path().join("oci");
        let dst_dir = tmp.path().join("oci2");
        let manifest = seed_image(&src_dir, "foo", b"bar");

        copy(
            &oci(src_dir.clone(), "foo"),
            &oci(dst_dir.clone(), "foo"),
            &CopyOptions::default(),
        )
        .unwrap();

        assert_eq!(blob_names(&src_dir), blob_names(&dst_dir));
        let dst = ImageStore::open(&dst_dir).unwrap();
        assert_eq!(dst.lookup_descriptor("foo").unwrap().digest, manifest.digest);
    }

    #[test]
    fn transfer_skips_present_blobs() {
        let tmp = tempfile::tempdir().unwrap();
        let manifest = seed_image(&tmp.path().join("a"), "foo", b"bar");
        let src = ImageStore::open(tmp.path().join("a")).unwrap();
        let dst = ImageStore::open(tmp.path().join("b")).unwrap();

        let first = transfer(&src, &dst, &manifest, &RetryPolicy::none()).unwrap();
        assert_eq!(first, 3);
        let second = transfer(&src, &dst, &manifest, &RetryPolicy::none()).unwrap();
        assert_eq!(second, 0);
    }

    #[test]
    fn missing_source_tag_is_unknown() {
        let tmp = tempfile::tempdir().unwrap();
        let src_dir = tmp.path().join("oci");
        seed_image(&src_dir, "foo", b"bar");
        let err = copy(
            &oci(src_dir, "nope"),
            &oci(tmp.path().join("out"), "nope"),
            &CopyOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unknown);
    }

    #[test]
    fn missing_source_layout_is_unknown() {
        let tmp = tempfile::tempdir().unwrap();
        let err = copy(
            &oci(tmp.path().join("absent"), "foo"),
            &oci(tmp.path().join("out"), "foo"),
            &CopyOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unknown);
        assert!(!tmp.path().join("absent").exists());
    }

    #[test]
    fn registry_copy_without_skopeo_is_missing_helper() {
        let tmp = tempfile::tempdir().unwrap();
        let opts = CopyOptions {
            retry: RetryPolicy::none(),
            skopeo: "lamina-no-such-skopeo".to_owned(),
        };
        let err = copy(
            &ImageRef::Docker {
                reference: "//example.invalid/base:1".to_owned(),
            },
            &oci(tmp.path().join("out"), "base"),
            &opts,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingHelper);
    }

    #[test]
    fn custom_schemes_cannot_be_copied() {
        let tmp = tempfile::tempdir().unwrap();
        let err = copy(
            &ImageRef::Other {
                scheme: "zot".to_owned(),
                reference: "x".to_owned(),
            },
            &oci(tmp.path().join("out"), "x"),
            &CopyOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn base_cache_pins_first_resolution() {
        let tmp = tempfile::tempdir().unwrap();
        let src_dir = tmp.path().join("upstream");
        let first = seed_image(&src_dir, "base", b"one");
        let cache = BaseImageCache::open(&tmp.path().join("bases"), CopyOptions::default()).unwrap();
        let image = oci(src_dir.clone(), "base");

        assert_eq!(cache.resolve(&image).unwrap().digest, first.digest);

        // Upstream moves on; the cache keeps the seeded digest.
        let second = seed_image(&src_dir, "base", b"two");
        assert_ne!(first.digest, second.digest);
        assert_eq!(cache.resolve(&image).unwrap().digest, first.digest);
    }

    #[test]
    fn base_cache_import_fills_target_store() {
        let tmp = tempfile::tempdir().unwrap();
        let src_dir = tmp.path().join("upstream");
        seed_image(&src_dir, "base", b"one");
        let cache = BaseImageCache::open(&tmp.path().join("bases"), CopyOptions::default()).unwrap();
        let out = ImageStore::open(tmp.path().join("out")).unwrap();

        let desc = cache.import(&oci(src_dir, "base"), &out).unwrap();
        let manifest = out.read_manifest(&desc).unwrap();
        assert!(out.blobs().exists(&manifest.config.digest));
        assert!(out.blobs().exists(&manifest.layers[0].digest));
        assert!(out.references().unwrap().is_empty());
    }
}

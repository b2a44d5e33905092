use crate::cache::BuildCache;
use crate::image::ImageStore;
use crate::oci::Descriptor;
use crate::StoreError;
use lamina_schema::Digest;
use tracing::info;

/// Removes blobs that no reference, cache entry or extra root reaches.
pub struct GarbageCollector<'a> {
    images: &'a ImageStore,
    cache: Option<&'a BuildCache>,
}

#[derive(Debug, Default)]
pub struct GcReport {
    pub orphaned_blobs: Vec<Digest>,
    pub removed_blobs: usize,
    pub reclaimed_bytes: u64,
}

impl<'a> GarbageCollector<'a> {
    pub fn new(images: &'a ImageStore) -> Self {
        Self {
            images,
            cache: None,
        }
    }

    /// Keep blobs of cached artifacts alive as well.
    #[must_use]
    pub fn with_cache(mut self, cache: &'a BuildCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn collect(&self, dry_run: bool) -> Result<GcReport, StoreError> {
        self.collect_with_cancel(&[], dry_run, || false)
    }

    pub fn collect_with_cancel(
        &self,
        extra_roots: &[Descriptor],
        dry_run: bool,
        should_stop: impl Fn() -> bool,
    ) -> Result<GcReport, StoreError> {
        let mut roots: Vec<Descriptor> = self.images.read_index()?.manifests;
        roots.extend_from_slice(extra_roots);
        if let Some(cache) = self.cache {
            for entry in cache.list()? {
                let a = entry.artifact;
                roots.push(a.manifest_descriptor);
                roots.push(a.config_descriptor);
                roots.push(a.descriptor);
            }
        }
        let live = self.images.reachable_from(&roots)?;

        let blobs = self.images.blobs();
        let mut report = GcReport::default();
        for digest in blobs.list()? {
            if !live.contains(&digest) {
                report.orphaned_blobs.push(digest);
            }
        }

        if !dry_run {
            for digest in &report.orphaned_blobs {
                if should_stop() {
                    break;
                }
                report.reclaimed_bytes += blobs.size(digest).unwrap_or(0);
                blobs.remove(digest)?;
                report.removed_blobs += 1;
            }
        }

        info!(
            "gc: {} orphaned blobs, {} removed, {} bytes reclaimed",
            report.orphaned_blobs.len(),
            report.removed_blobs,
            report.reclaimed_bytes
        );
        Ok(report)
    }
}

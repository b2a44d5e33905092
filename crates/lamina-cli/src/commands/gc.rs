use super::{json_pretty, EXIT_SUCCESS};
use lamina_core::{BuildOptions, CoreError, StoreLock};
use lamina_store::{BuildCache, GarbageCollector, ImageStore};
use std::path::Path;

pub fn run(stacker_dir: &Path, oci_dir: &Path, dry_run: bool, json: bool) -> Result<u8, CoreError> {
    let options = BuildOptions {
        stacker_dir: stacker_dir.to_path_buf(),
        oci_dir: oci_dir.to_path_buf(),
        ..BuildOptions::default()
    };
    let _lock = StoreLock::acquire(&options.lock_path())?;

    let images = ImageStore::open(oci_dir)?;
    let cache = BuildCache::open(options.cache_dir(), images.blobs())?;
    let report = GarbageCollector::new(&images)
        .with_cache(&cache)
        .collect(dry_run)?;

    if json {
        let payload = serde_json::json!({
            "dry_run": dry_run,
            "orphaned_blobs": report
                .orphaned_blobs
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>(),
            "removed_blobs": report.removed_blobs,
            "reclaimed_bytes": report.reclaimed_bytes,
        });
        println!("{}", json_pretty(&payload)?);
    } else if dry_run {
        println!("gc: would remove {} blobs", report.orphaned_blobs.len());
        for digest in &report.orphaned_blobs {
            println!("  {digest}");
        }
    } else {
        println!(
            "gc: removed {} blobs, {} bytes reclaimed",
            report.removed_blobs, report.reclaimed_bytes
        );
    }
    Ok(EXIT_SUCCESS)
}

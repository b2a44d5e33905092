//! End-to-end tests that drive the real layer pipeline.
//!
//! These tests are `#[ignore]` by default because they require:
//! - Linux with user namespace support (or root)
//! - `lxc-usernsexec`, `unshare`, and `fuse-overlayfs` or a btrfs roots dir
//! - `mksquashfs` and `veritysetup` for the squashfs tests
//! - `LAMINA_E2E_BASE` naming an `oci:<dir>:<tag>` image that has `/bin/sh`
//!
//! Run with: `LAMINA_E2E_BASE=oci:/path/to/layout:busybox cargo test --test e2e -- --ignored`

use lamina_core::{BuildOptions, Orchestrator};
use lamina_runtime::prereq::command_exists;
use lamina_runtime::{squashfs, verity, Executor, StorageBackend};
use lamina_schema::{parse_recipe_str, Compression, LayerFormat, LayerOutput, SchemeRegistry};
use lamina_store::{ImageStore, VERITY_ROOT_HASH_ANNOTATION};
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::Path;

fn prereqs_available(squashfs: bool) -> Option<String> {
    let Ok(base) = std::env::var("LAMINA_E2E_BASE") else {
        eprintln!("skipping E2E: LAMINA_E2E_BASE not set");
        return None;
    };
    let rootless = Executor::detect().map(|e| e.is_rootless()).unwrap_or(true);
    let mut missing =
        lamina_runtime::check_build_prereqs(StorageBackend::Overlay, squashfs, rootless);
    if squashfs && !command_exists("veritysetup") {
        missing.extend(lamina_runtime::check_optional_prereqs());
    }
    if !missing.is_empty() {
        let msg = lamina_runtime::format_missing(&missing);
        assert!(
            std::env::var("CI").is_err(),
            "CI FATAL: E2E prerequisites missing, tests cannot silently skip in CI.\n{msg}"
        );
        eprintln!("skipping E2E: missing prerequisites: {msg}");
        return None;
    }
    Some(base)
}

fn options(dir: &Path, output: LayerOutput) -> BuildOptions {
    BuildOptions {
        stacker_dir: dir.join(".lamina"),
        oci_dir: dir.join("oci"),
        roots_dir: dir.join("roots"),
        backend: Some(StorageBackend::Overlay),
        output,
        ..BuildOptions::default()
    }
}

fn foo_recipe(dir: &Path, base: &str) -> lamina_schema::Recipe {
    let text = format!(
        r#"
format_version = 1

[[layer]]
name = "foo"
from = "{base}"
run = "echo bar > /foo"
"#
    );
    parse_recipe_str(&text, &BTreeMap::new(), &SchemeRegistry::default(), dir).unwrap()
}

#[test]
#[ignore = "requires user namespaces, fuse-overlayfs, and LAMINA_E2E_BASE"]
fn e2e_tar_layer_captures_step_output() {
    let Some(base) = prereqs_available(false) else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let output = LayerOutput {
        format: LayerFormat::Tar,
        compression: Compression::Gzip,
        verity: false,
    };
    let orch = Orchestrator::new(options(dir.path(), output)).unwrap();
    let report = orch
        .build(&foo_recipe(dir.path(), &base))
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(report.built, vec!["foo".to_owned()]);

    let images = ImageStore::open(dir.path().join("oci")).unwrap();
    let manifest = images.lookup_manifest("foo").unwrap();
    let top = manifest.layers.last().unwrap();
    assert_eq!(top.media_type, "application/vnd.oci.image.layer.v1.tar+gzip");

    let blob = images.blobs().open(&top.digest).unwrap();
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(blob));
    let mut found = false;
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        if entry.path().unwrap().to_string_lossy().trim_start_matches("./") == "foo" {
            let mut content = String::new();
            entry.read_to_string(&mut content).unwrap();
            assert_eq!(content, "bar\n");
            assert_eq!(entry.header().mtime().unwrap(), 0);
            found = true;
        }
    }
    assert!(found, "layer has no /foo");

    let again = orch.build(&foo_recipe(dir.path(), &base)).unwrap();
    assert_eq!(again.cache_hits, vec!["foo".to_owned()]);
}

#[test]
#[ignore = "requires user namespaces, fuse-overlayfs, mksquashfs, veritysetup, and LAMINA_E2E_BASE"]
fn e2e_verity_detects_tampering() {
    let Some(base) = prereqs_available(true) else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let output = LayerOutput {
        format: LayerFormat::Squashfs,
        compression: Compression::Gzip,
        verity: true,
    };
    let orch = Orchestrator::new(options(dir.path(), output)).unwrap();
    let report = orch
        .build(&foo_recipe(dir.path(), &base))
        .unwrap()
        .into_result()
        .unwrap();
    let artifact = &report.artifacts["foo"];
    let root_hash = artifact.verity_root_hash.clone().unwrap();
    assert_eq!(
        artifact.descriptor.annotations[VERITY_ROOT_HASH_ANNOTATION],
        root_hash
    );

    let images = ImageStore::open(dir.path().join("oci")).unwrap();
    let blob = images.layout().blob_path(&artifact.descriptor.digest).unwrap();
    let copy = dir.path().join("layer.squashfs");
    fs::copy(&blob, &copy).unwrap();

    let used = squashfs::image_size(&copy).unwrap();
    let offset = used.div_ceil(verity::DATA_ALIGNMENT) * verity::DATA_ALIGNMENT;
    verity::veritysetup_verify(&copy, &root_hash, offset).unwrap();
    verity::verify(&copy, &root_hash, offset).unwrap();

    let mut bytes = fs::read(&copy).unwrap();
    let at = bytes.len() - 4087;
    bytes[at] ^= 0xff;
    bytes[at + 1] ^= 0xff;
    fs::write(&copy, &bytes).unwrap();
    assert!(verity::veritysetup_verify(&copy, &root_hash, offset).is_err());
    assert!(verity::verify(&copy, &root_hash, offset).is_err());
}

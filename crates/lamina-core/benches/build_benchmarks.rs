use criterion::{criterion_group, criterion_main, Criterion};
use lamina_core::{BuildOptions, CoreError, NodeBuilder, NodeJob, Orchestrator};
use lamina_schema::{
    parse_recipe_str, Compression, LayerFormat, Recipe, SchemeRegistry,
};
use lamina_store::{ImageStore, LayerArtifact, LayerMediaType};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

const RECIPE: &str = r#"
format_version = 1

[[layer]]
name = "base"
from = "scratch"
run = "echo base"

[[layer]]
name = "tools"
from = "base"
run = "echo tools"
build_only = true

[[layer]]
name = "app"
from = "tools"
run = ["echo app", "echo more"]

[[layer]]
name = "docs"
from = "base"
run = "echo docs"

[[layer]]
name = "release"
from = "app"
run = "echo release"
"#;

/// Writes a single-file tar layer per node.
struct TarBuilder {
    images: Arc<ImageStore>,
}

impl NodeBuilder for TarBuilder {
    fn build(&self, job: &NodeJob<'_>) -> Result<LayerArtifact, CoreError> {
        let mut tar = tar::Builder::new(Vec::new());
        let content = job.definition.name.as_bytes();
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar.append_data(&mut header, "layer.txt", content)?;
        let data = tar.into_inner()?;

        let layer = self.images.put_layer(
            &data[..],
            LayerMediaType::new(LayerFormat::Tar, Compression::None),
        )?;
        let composed = self
            .images
            .compose_layer(job.base, &layer, |_| {}, &BTreeMap::new())?;
        Ok(LayerArtifact {
            fingerprint: job.fingerprint.clone(),
            descriptor: composed.layer,
            config_descriptor: composed.config,
            manifest_descriptor: composed.manifest,
            verity_root_hash: None,
            diff_id: composed.diff_id,
        })
    }
}

fn recipe(dir: &Path) -> Recipe {
    parse_recipe_str(RECIPE, &BTreeMap::new(), &SchemeRegistry::default(), dir).unwrap()
}

fn orchestrator(dir: &Path) -> Orchestrator {
    let images = Arc::new(ImageStore::open(dir.join("oci")).unwrap());
    let builder = Arc::new(TarBuilder {
        images: Arc::clone(&images),
    });
    let options = BuildOptions {
        stacker_dir: dir.join("state"),
        oci_dir: dir.join("oci"),
        roots_dir: dir.join("roots"),
        ..BuildOptions::default()
    };
    Orchestrator::with_builder(options, images, builder).unwrap()
}

fn bench_build(c: &mut Criterion) {
    c.bench_function("orchestrator_build_5_layers", |b| {
        b.iter_with_setup(
            || {
                let dir = tempfile::tempdir().unwrap();
                let recipe = recipe(dir.path());
                let orch = orchestrator(dir.path());
                (dir, recipe, orch)
            },
            |(_dir, recipe, orch)| {
                orch.build(&recipe).unwrap().into_result().unwrap();
            },
        );
    });
}

fn bench_rebuild_cached(c: &mut Criterion) {
    c.bench_function("orchestrator_rebuild_cached", |b| {
        b.iter_with_setup(
            || {
                let dir = tempfile::tempdir().unwrap();
                let recipe = recipe(dir.path());
                let orch = orchestrator(dir.path());
                orch.build(&recipe).unwrap().into_result().unwrap();
                (dir, recipe, orch)
            },
            |(_dir, recipe, orch)| {
                let report = orch.build(&recipe).unwrap();
                assert!(report.built.is_empty());
            },
        );
    });
}

fn bench_fingerprint(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let recipe = recipe(dir.path());
    let base = recipe.layer("base").unwrap();
    let output = lamina_schema::LayerOutput::default();
    c.bench_function("fingerprint_scratch_layer", |b| {
        b.iter(|| {
            lamina_schema::compute_fingerprint(
                base,
                lamina_schema::BaseInput::Scratch,
                &[],
                &output,
            )
            .unwrap()
        });
    });
}

criterion_group!(benches, bench_build, bench_rebuild_cached, bench_fingerprint);
criterion_main!(benches);

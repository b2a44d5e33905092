//! Authoring one layer: seed a rootfs, run the steps, capture the diff,
//! package it and register the resulting image.

use crate::engine::{NodeBuilder, NodeJob};
use crate::CoreError;
use chrono::SecondsFormat;
use flate2::read::GzEncoder;
use lamina_runtime::userns::DEFAULT_GRACE;
use lamina_runtime::{
    squashfs, verity, DiffOptions, InternalOp, LayerSource, MksquashfsCaps, RootfsHandle,
    RootfsManager, RunOptions, RuntimeError, SquashfsOptions, UnpackRequest, VerityParams,
};
use lamina_schema::{build_environment, Compression, LayerDefinition, LayerFormat, LayerOutput};
use lamina_store::oci::Empty;
use lamina_store::{
    Descriptor, ImageConfiguration, ImageStore, LayerArtifact, LayerBlob, LayerMediaType,
    StoreError, VERITY_ROOT_HASH_ANNOTATION,
};
use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// `PATH` given to steps and images that do not set one.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

const EPOCH: &str = "1970-01-01T00:00:00Z";
const ZSTD_LEVEL: i32 = 3;

struct Packaged {
    layer: LayerBlob,
    verity_root_hash: Option<String>,
}

/// Builds layers on a rootfs backend and registers them in an image store.
pub struct LayerPipeline {
    images: Arc<ImageStore>,
    rootfs: RootfsManager,
    output: LayerOutput,
    squashfs_caps: Option<MksquashfsCaps>,
    keep_on_failure: bool,
    grace: Duration,
    host_env: Vec<(String, String)>,
}

impl LayerPipeline {
    /// Probes `mksquashfs` once when squashfs output is requested.
    pub fn new(
        images: Arc<ImageStore>,
        rootfs: RootfsManager,
        output: LayerOutput,
    ) -> Result<Self, CoreError> {
        let squashfs_caps = match output.format {
            LayerFormat::Squashfs => Some(MksquashfsCaps::probe()?),
            LayerFormat::Tar => None,
        };
        Ok(Self {
            images,
            rootfs,
            output,
            squashfs_caps,
            keep_on_failure: false,
            grace: DEFAULT_GRACE,
            host_env: std::env::vars().collect(),
        })
    }

    #[must_use]
    pub fn keep_on_failure(mut self, keep: bool) -> Self {
        self.keep_on_failure = keep;
        self
    }

    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Host environment that passthrough patterns select from.
    #[must_use]
    pub fn with_host_env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.host_env = env.into_iter().collect();
        self
    }

    pub fn rootfs(&self) -> &RootfsManager {
        &self.rootfs
    }

    /// Extract the image behind `manifest` once, verifying sealed layers.
    fn extract_base(
        &self,
        manifest: &Descriptor,
        run: &RunOptions<'_>,
    ) -> Result<PathBuf, CoreError> {
        let parsed = self.images.read_manifest(manifest)?;
        let blobs = self.images.blobs();
        let dir = self.rootfs.ensure_base(&manifest.digest, |dest| {
            let mut layers = Vec::with_capacity(parsed.layers.len());
            for layer in &parsed.layers {
                if !blobs.exists(&layer.digest) {
                    return Err(StoreError::BlobNotFound(layer.digest.to_string()).into());
                }
                let path = blobs.layout().blob_path(&layer.digest)?;
                if let Some(root_hash) = layer.verity_root_hash() {
                    verify_sealed(&path, root_hash)?;
                }
                layers.push(LayerSource {
                    path,
                    media_type: layer.media_type.clone(),
                });
            }
            let op = InternalOp::Unpack(UnpackRequest {
                layers,
                dest: dest.to_path_buf(),
            });
            self.rootfs.executor().run_internal(&op, run)
        })?;
        Ok(dir)
    }

    fn author(
        &self,
        handle: &mut RootfsHandle,
        job: &NodeJob<'_>,
        run: &RunOptions<'_>,
    ) -> Result<LayerArtifact, CoreError> {
        let def = job.definition;
        let mut names = HashSet::new();
        for import in &def.imports {
            let name = import
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    CoreError::Config(format!(
                        "layer '{}': import '{}' has no file name",
                        def.name,
                        import.path.display()
                    ))
                })?;
            if !names.insert(name.clone()) {
                return Err(CoreError::Config(format!(
                    "layer '{}': two imports named '{name}'",
                    def.name
                )));
            }
            let host = job.reference_dir.join(&import.path);
            self.rootfs.bind_import(handle, &host, &name)?;
        }
        for bind in &def.binds {
            let host = job.reference_dir.join(&bind.source);
            self.rootfs.bind_rw(handle, &host, &bind.dest)?;
        }

        if let Some(script) = def.run_script() {
            self.run_steps(handle, def, &script, run)?;
        }
        let packaged = self.package(handle, def, run)?;

        let composed = self.images.compose_layer(
            job.base,
            &packaged.layer,
            |config| apply_config(config, def),
            &def.annotations,
        )?;
        Ok(LayerArtifact {
            fingerprint: job.fingerprint.clone(),
            descriptor: composed.layer,
            config_descriptor: composed.config,
            manifest_descriptor: composed.manifest,
            verity_root_hash: packaged.verity_root_hash,
            diff_id: composed.diff_id,
        })
    }

    fn run_steps(
        &self,
        handle: &RootfsHandle,
        def: &LayerDefinition,
        script: &str,
        run: &RunOptions<'_>,
    ) -> Result<(), CoreError> {
        self.rootfs.write_script(handle, script)?;
        let mut env = build_environment(def, self.host_env.iter().cloned())
            .map_err(|e| CoreError::Config(format!("layer '{}': {e}", def.name)))?;
        for (k, v) in &def.environment {
            env.entry(k.clone()).or_insert_with(|| v.clone());
        }
        env.entry("PATH".to_owned())
            .or_insert_with(|| DEFAULT_PATH.to_owned());

        // The sandbox script clears the environment itself.
        let opts = RunOptions {
            env: None,
            cwd: None,
            timeout: def.timeout.map(Duration::from_secs),
            deadline: run.deadline,
            grace: run.grace,
            should_stop: run.should_stop,
        };
        info!("running {} step(s) for {}", def.run.len(), def.name);
        match self.rootfs.run(handle, &env, &opts) {
            Ok(()) => Ok(()),
            Err(RuntimeError::ChildFailed { status, .. }) => Err(CoreError::BuildFailed {
                node: def.name.to_string(),
                status,
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn package(
        &self,
        handle: &RootfsHandle,
        def: &LayerDefinition,
        run: &RunOptions<'_>,
    ) -> Result<Packaged, CoreError> {
        let squashfs = self.squashfs_caps.map(|caps| SquashfsOptions {
            compression: self.output.compression,
            caps,
        });
        let out = handle.dir().join(match squashfs {
            Some(_) => "layer.squashfs",
            None => "layer.tar",
        });
        let diff = DiffOptions {
            preserve_mtime: def.preserve_timestamps,
            squashfs,
        };
        self.rootfs.diff(handle, &out, &diff, run)?;

        let Some(opts) = squashfs else {
            let media_type = LayerMediaType::new(LayerFormat::Tar, self.output.compression);
            let file = File::open(&out)?;
            let layer = match self.output.compression {
                Compression::None => self.images.put_layer(BufReader::new(file), media_type)?,
                Compression::Gzip => self.images.put_layer(
                    GzEncoder::new(BufReader::new(file), flate2::Compression::default()),
                    media_type,
                )?,
                Compression::Zstd => self
                    .images
                    .put_layer(zstd::stream::read::Encoder::new(file, ZSTD_LEVEL)?, media_type)?,
            };
            debug!("{}: tar layer {}", def.name, layer.descriptor.digest);
            return Ok(Packaged {
                layer,
                verity_root_hash: None,
            });
        };

        let media_type = LayerMediaType::new(LayerFormat::Squashfs, opts.effective_compression());
        let verity_root_hash = if self.output.verity {
            Some(seal(&out)?)
        } else {
            None
        };
        let mut layer = self
            .images
            .put_layer(BufReader::new(File::open(&out)?), media_type)?;
        if let Some(root_hash) = &verity_root_hash {
            layer
                .descriptor
                .annotations
                .insert(VERITY_ROOT_HASH_ANNOTATION.to_owned(), root_hash.clone());
        }
        debug!("{}: squashfs layer {}", def.name, layer.descriptor.digest);
        Ok(Packaged {
            layer,
            verity_root_hash,
        })
    }
}

impl NodeBuilder for LayerPipeline {
    fn build(&self, job: &NodeJob<'_>) -> Result<LayerArtifact, CoreError> {
        let def = job.definition;
        let stop = || job.cancel.is_cancelled();
        let run = RunOptions {
            deadline: job.cancel.deadline(),
            grace: self.grace,
            should_stop: &stop,
            ..RunOptions::default()
        };
        if stop() {
            return Err(CoreError::Cancelled);
        }

        let base_dir = job
            .base
            .map(|desc| self.extract_base(desc, &run))
            .transpose()?;
        let id = rootfs_id(&def.name);
        let mut handle = self.rootfs.seed(&id, base_dir.as_deref())?;

        let result = self.author(&mut handle, job, &run);
        if result.is_err() && self.keep_on_failure {
            warn!(
                "keeping rootfs of failed layer {} at {}",
                def.name,
                handle.dir().display()
            );
        } else if let Err(e) = self.rootfs.destroy(&id) {
            warn!("failed to remove rootfs of {}: {e}", def.name);
        }
        result
    }
}

/// Directory name of a layer's rootfs: the name with unsafe characters
/// replaced, suffixed with a hash of the full name so distinct names never
/// share a directory.
fn rootfs_id(name: &str) -> String {
    let readable: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let hash = blake3::hash(name.as_bytes()).to_hex();
    format!("{readable}-{}", &hash[..16])
}

fn seal(path: &Path) -> Result<String, CoreError> {
    let params = VerityParams::for_host()?;
    let seal = verity::seal(path, &params)?;
    verity::verify(path, &seal.root_hash, seal.hash_offset)?;
    Ok(seal.root_hash)
}

/// Check a sealed squashfs blob against its annotated root hash.
fn verify_sealed(path: &Path, root_hash: &str) -> Result<(), RuntimeError> {
    let used = squashfs::image_size(path)?;
    let hash_offset = used.div_ceil(verity::DATA_ALIGNMENT) * verity::DATA_ALIGNMENT;
    verity::verify(path, root_hash, hash_offset)
}

/// Write a layer definition's settings into the image configuration.
pub(crate) fn apply_config(config: &mut ImageConfiguration, def: &LayerDefinition) {
    let created = if def.preserve_timestamps {
        chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
    } else {
        EPOCH.to_owned()
    };
    config.created = Some(created.clone());
    if let Some(last) = config.history.last_mut() {
        last.created = Some(created);
        last.created_by = Some(format!("lamina build {}", def.name));
    }

    let c = &mut config.config;
    for (k, v) in &def.environment {
        c.set_env(k, v);
    }
    if c.env_var("PATH").is_none() {
        c.set_env("PATH", DEFAULT_PATH);
    }
    for (k, v) in &def.config.labels {
        c.labels.insert(k.clone(), v.clone());
    }
    for volume in &def.config.volumes {
        c.volumes.insert(volume.clone(), Empty::default());
    }
    if let Some(user) = &def.config.runtime_user {
        c.user = Some(user.clone());
    }
    if let Some(dir) = &def.config.working_dir {
        c.working_dir = Some(dir.clone());
    }
    if let Some(full) = &def.config.full_command {
        c.entrypoint = Some(full.clone());
        c.cmd = None;
    } else {
        if let Some(entrypoint) = &def.config.entrypoint {
            c.entrypoint = Some(entrypoint.clone());
        }
        if let Some(cmd) = &def.config.cmd {
            c.cmd = Some(cmd.clone());
        }
    }
}

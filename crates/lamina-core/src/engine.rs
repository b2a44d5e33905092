use crate::concurrency::{CancelToken, StoreLock};
use crate::copy::{BaseImageCache, CopyOptions};
use crate::lifecycle::{validate_transition, NodeState};
use crate::pipeline::LayerPipeline;
use crate::CoreError;
use lamina_runtime::{check_build_prereqs, format_missing, Executor, RootfsManager, RuntimeError, StorageBackend};
use lamina_schema::{
    compute_fingerprint, digest_imports, BaseInput, Fingerprint, ImageSource, LayerDefinition,
    LayerFormat, LayerOutput, Recipe,
};
use lamina_store::{BuildCache, CacheOutcome, Descriptor, ImageStore, LayerArtifact};
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const LOCK_FILE: &str = "lamina.lock";
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Everything a build needs besides the recipe.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Build state: cache entries, cached external bases, the store lock.
    pub stacker_dir: PathBuf,
    /// Output OCI layout.
    pub oci_dir: PathBuf,
    pub roots_dir: PathBuf,
    /// `None` picks btrfs when `roots_dir` lives on btrfs.
    pub backend: Option<StorageBackend>,
    pub output: LayerOutput,
    pub jobs: usize,
    pub keep_on_failure: bool,
    /// Fail with `Locked` instead of waiting on another process's build.
    pub no_wait: bool,
    pub deadline: Option<Duration>,
    pub grace: Duration,
    pub copy_retries: u32,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            stacker_dir: PathBuf::from(".lamina"),
            oci_dir: PathBuf::from("oci"),
            roots_dir: PathBuf::from("roots"),
            backend: None,
            output: LayerOutput::default(),
            jobs: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
            keep_on_failure: false,
            no_wait: false,
            deadline: None,
            grace: lamina_runtime::userns::DEFAULT_GRACE,
            copy_retries: 3,
        }
    }
}

impl BuildOptions {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.output.verity && self.output.format != LayerFormat::Squashfs {
            return Err(CoreError::Config(
                "verity requires squashfs layers".to_owned(),
            ));
        }
        if self.jobs == 0 {
            return Err(CoreError::Config("jobs must be at least 1".to_owned()));
        }
        Ok(())
    }

    pub fn lock_path(&self) -> PathBuf {
        self.stacker_dir.join(LOCK_FILE)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.stacker_dir.join("cache")
    }

    pub fn bases_dir(&self) -> PathBuf {
        self.stacker_dir.join("layer-bases").join("oci")
    }
}

/// Outcome of one `Orchestrator::build`.
///
/// On failure `error` holds the first error; `artifacts` still lists every
/// layer that completed before the build stopped.
#[derive(Debug, Default)]
pub struct BuildReport {
    pub artifacts: BTreeMap<String, LayerArtifact>,
    pub cache_hits: Vec<String>,
    pub built: Vec<String>,
    pub states: BTreeMap<String, NodeState>,
    pub error: Option<CoreError>,
}

impl BuildReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_result(mut self) -> Result<Self, CoreError> {
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }
}

/// One layer handed to a `NodeBuilder`.
pub struct NodeJob<'a> {
    pub definition: &'a LayerDefinition,
    pub fingerprint: &'a Fingerprint,
    /// Manifest of the base image in the output layout; `None` for scratch.
    pub base: Option<&'a Descriptor>,
    /// Directory relative imports and binds resolve against.
    pub reference_dir: &'a Path,
    pub cancel: &'a CancelToken,
}

/// Produces the artifact of one cache miss.
pub trait NodeBuilder: Send + Sync {
    fn build(&self, job: &NodeJob<'_>) -> Result<LayerArtifact, CoreError>;
}

enum ResolvedBase {
    Scratch,
    Built {
        fingerprint: Fingerprint,
        manifest: Descriptor,
    },
    External(Descriptor),
}

impl ResolvedBase {
    fn input(&self) -> BaseInput<'_> {
        match self {
            Self::Scratch => BaseInput::Scratch,
            Self::Built { fingerprint, .. } => BaseInput::Built(fingerprint),
            Self::External(desc) => BaseInput::External(&desc.digest),
        }
    }

    fn manifest(&self) -> Option<&Descriptor> {
        match self {
            Self::Scratch => None,
            Self::Built { manifest, .. } | Self::External(manifest) => Some(manifest),
        }
    }
}

struct NodeOutcome {
    fingerprint: Fingerprint,
    outcome: CacheOutcome,
}

type NodeResult = (String, Result<NodeOutcome, CoreError>);

/// Walks a recipe's graph with a bounded pool of worker threads.
pub struct Orchestrator {
    options: BuildOptions,
    images: Arc<ImageStore>,
    cache: BuildCache,
    bases: BaseImageCache,
    builder: Arc<dyn NodeBuilder>,
    token: CancelToken,
}

impl Orchestrator {
    /// An orchestrator that builds with the real layer pipeline.
    pub fn new(options: BuildOptions) -> Result<Self, CoreError> {
        options.validate()?;
        std::fs::create_dir_all(&options.roots_dir)?;
        let backend = options
            .backend
            .unwrap_or_else(|| StorageBackend::detect(&options.roots_dir));
        let executor = Executor::detect()?;

        let squashfs = options.output.format == LayerFormat::Squashfs;
        let missing = check_build_prereqs(backend, squashfs, executor.is_rootless());
        if !missing.is_empty() {
            return Err(RuntimeError::MissingHelper(format_missing(&missing)).into());
        }

        let images = Arc::new(ImageStore::open(&options.oci_dir)?);
        let rootfs = RootfsManager::new(&options.roots_dir, backend, Arc::new(executor))?;
        let pipeline = LayerPipeline::new(Arc::clone(&images), rootfs, options.output)?
            .keep_on_failure(options.keep_on_failure)
            .with_grace(options.grace);
        info!("storage backend: {backend}");
        Self::with_builder(options, images, Arc::new(pipeline))
    }

    /// An orchestrator with a caller-supplied builder for cache misses.
    pub fn with_builder(
        options: BuildOptions,
        images: Arc<ImageStore>,
        builder: Arc<dyn NodeBuilder>,
    ) -> Result<Self, CoreError> {
        options.validate()?;
        let mut cache = BuildCache::open(options.cache_dir(), images.blobs())?;
        if options.no_wait {
            cache = cache.non_blocking();
        }
        let bases = BaseImageCache::open(
            &options.bases_dir(),
            CopyOptions::default().with_retries(options.copy_retries),
        )?;
        Ok(Self {
            options,
            images,
            cache,
            bases,
            builder,
            token: CancelToken::new(),
        })
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    pub fn images(&self) -> &ImageStore {
        &self.images
    }

    pub fn cache(&self) -> &BuildCache {
        &self.cache
    }

    /// Token that stops the current and future builds when cancelled.
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Build every layer of `recipe`.
    ///
    /// Errors that prevent scheduling (store lock, graph, external bases)
    /// are returned directly; a failing layer is reported in
    /// `BuildReport::error`.
    pub fn build(&self, recipe: &Recipe) -> Result<BuildReport, CoreError> {
        let _lock = StoreLock::acquire_shared(&self.options.lock_path())?;
        let dag = recipe.graph()?;
        let order = dag.sort();
        let token = match self.options.deadline {
            Some(d) => self.token.child().with_deadline(Instant::now() + d),
            None => self.token.child(),
        };

        let externals = self.resolve_externals(order.iter().map(|(_, def)| *def))?;

        let mut report = BuildReport::default();
        let mut states: BTreeMap<&str, NodeState> =
            order.iter().map(|(name, _)| (*name, NodeState::Pending)).collect();
        let mut fingerprints: HashMap<String, Fingerprint> = HashMap::new();
        let mut first_error: Option<CoreError> = None;

        let (tx, rx) = mpsc::channel::<NodeResult>();
        std::thread::scope(|scope| {
            let mut in_flight = 0usize;
            let mut stopping = false;
            loop {
                if !stopping && token.is_cancelled() {
                    stopping = true;
                }
                if !stopping {
                    for (name, def) in &order {
                        if in_flight >= self.options.jobs {
                            break;
                        }
                        if states.get(name) != Some(&NodeState::Pending) {
                            continue;
                        }
                        let ready = dag
                            .dependencies(name)
                            .iter()
                            .all(|dep| states.get(dep) == Some(&NodeState::Complete));
                        if !ready {
                            continue;
                        }
                        let advanced = advance(&mut states, name, NodeState::Ready)
                            .and_then(|()| advance(&mut states, name, NodeState::Building));
                        if let Err(e) = advanced {
                            first_error.get_or_insert(e);
                            stopping = true;
                            break;
                        }
                        let base = match resolve_base(def, &report.artifacts, &fingerprints, &externals) {
                            Ok(base) => base,
                            Err(e) => {
                                let _ = advance(&mut states, name, NodeState::Failed);
                                first_error.get_or_insert(e);
                                stopping = true;
                                break;
                            }
                        };

                        debug!("dispatching {name}");
                        in_flight += 1;
                        let tx = tx.clone();
                        let token = &token;
                        let name = (*name).to_owned();
                        let def = *def;
                        let reference_dir = recipe.reference_dir.as_path();
                        scope.spawn(move || {
                            let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                                self.build_node(def, &base, reference_dir, token)
                            }))
                            .unwrap_or_else(|_| {
                                Err(CoreError::Internal(format!("worker for '{name}' panicked")))
                            });
                            let _ = tx.send((name, result));
                        });
                    }
                }

                if in_flight == 0 {
                    break;
                }

                match rx.recv_timeout(POLL_INTERVAL) {
                    Ok((name, result)) => {
                        in_flight -= 1;
                        let node = name.as_str();
                        match result {
                            Ok(NodeOutcome {
                                fingerprint,
                                outcome,
                            }) => {
                                if let Err(e) = advance(&mut states, node, NodeState::Complete) {
                                    first_error.get_or_insert(e);
                                    stopping = true;
                                }
                                if outcome.was_built() {
                                    report.built.push(name.clone());
                                } else {
                                    report.cache_hits.push(name.clone());
                                }
                                fingerprints.insert(name.clone(), fingerprint);
                                report.artifacts.insert(name, outcome.into_artifact());
                            }
                            Err(e) => {
                                let to = if e.is_cancellation() {
                                    NodeState::Cancelled
                                } else {
                                    NodeState::Failed
                                };
                                let _ = advance(&mut states, node, to);
                                if first_error.is_none() {
                                    if token.deadline_passed() {
                                        first_error = Some(self.deadline_error());
                                    } else if to == NodeState::Failed {
                                        warn!("layer {node} failed: {e}");
                                        first_error = Some(e);
                                    }
                                }
                                if !stopping {
                                    token.cancel();
                                    stopping = true;
                                }
                            }
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if !stopping && token.deadline_passed() {
                            first_error.get_or_insert_with(|| self.deadline_error());
                            token.cancel();
                            stopping = true;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });

        for (name, state) in &mut states {
            if *state == NodeState::Pending {
                debug!("{name} not started");
                *state = NodeState::Cancelled;
            }
        }
        if first_error.is_none() && states.values().any(|s| *s != NodeState::Complete) {
            first_error = Some(CoreError::Cancelled);
        }

        report.states = states
            .into_iter()
            .map(|(name, state)| (name.to_owned(), state))
            .collect();
        report.error = first_error;
        info!(
            "build finished: {} built, {} cached",
            report.built.len(),
            report.cache_hits.len()
        );
        Ok(report)
    }

    fn deadline_error(&self) -> CoreError {
        CoreError::DeadlineExceeded(self.options.deadline.map_or(0, |d| d.as_secs()))
    }

    /// Copy every distinct external base into the output layout once.
    fn resolve_externals<'r>(
        &self,
        defs: impl Iterator<Item = &'r LayerDefinition>,
    ) -> Result<HashMap<String, Descriptor>, CoreError> {
        let mut resolved = HashMap::new();
        for def in defs {
            if let ImageSource::External { image } = &def.from {
                let key = image.cache_tag();
                if resolved.contains_key(&key) {
                    continue;
                }
                let desc = self.bases.import(image, &self.images)?;
                info!("base {image} resolved to {}", desc.digest);
                resolved.insert(key, desc);
            }
        }
        Ok(resolved)
    }

    fn build_node(
        &self,
        def: &LayerDefinition,
        base: &ResolvedBase,
        reference_dir: &Path,
        token: &CancelToken,
    ) -> Result<NodeOutcome, CoreError> {
        if token.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        let imports = digest_imports(&def.imports, reference_dir)?;
        let fingerprint = compute_fingerprint(def, base.input(), &imports, &self.options.output)?;
        let job = NodeJob {
            definition: def,
            fingerprint: &fingerprint,
            base: base.manifest(),
            reference_dir,
            cancel: token,
        };

        let outcome = if def.is_cacheable() {
            self.cached_build(&job)?
        } else {
            info!("{} has read-write binds, not using the cache", def.name);
            CacheOutcome::Built(self.builder.build(&job)?)
        };
        match &outcome {
            CacheOutcome::Hit(_) => info!("{}: cache hit ({})", def.name, fingerprint.short()),
            CacheOutcome::Joined(_) => info!("{}: joined in-flight build", def.name),
            CacheOutcome::Built(_) => info!("{}: built ({})", def.name, fingerprint.short()),
        }

        if def.build_only {
            debug!("{} is build-only, not tagging", def.name);
        } else {
            self.images
                .update_reference(&def.name, &outcome.artifact().manifest_descriptor)?;
        }
        Ok(NodeOutcome {
            fingerprint,
            outcome,
        })
    }

    fn cached_build(&self, job: &NodeJob<'_>) -> Result<CacheOutcome, CoreError> {
        let outcome = self
            .cache
            .get_or_build(job.fingerprint, || self.builder.build(job))?;
        if let CacheOutcome::Hit(artifact) = &outcome {
            if !self.images.blobs().exists(&artifact.manifest_descriptor.digest) {
                warn!(
                    "cache entry {} points at a missing manifest, rebuilding",
                    job.fingerprint.short()
                );
                self.cache.remove(job.fingerprint)?;
                return self
                    .cache
                    .get_or_build(job.fingerprint, || self.builder.build(job));
            }
        }
        Ok(outcome)
    }
}

fn advance(
    states: &mut BTreeMap<&str, NodeState>,
    name: &str,
    to: NodeState,
) -> Result<(), CoreError> {
    let state = states
        .get_mut(name)
        .ok_or_else(|| CoreError::Unknown(name.to_owned()))?;
    validate_transition(name, *state, to)?;
    *state = to;
    Ok(())
}

fn resolve_base(
    def: &LayerDefinition,
    artifacts: &BTreeMap<String, LayerArtifact>,
    fingerprints: &HashMap<String, Fingerprint>,
    externals: &HashMap<String, Descriptor>,
) -> Result<ResolvedBase, CoreError> {
    match &def.from {
        ImageSource::Scratch => Ok(ResolvedBase::Scratch),
        ImageSource::Built { layer } => {
            let missing = || CoreError::Internal(format!("base {layer} of {} not built", def.name));
            let artifact = artifacts.get(layer.as_str()).ok_or_else(missing)?;
            let fingerprint = fingerprints.get(layer.as_str()).ok_or_else(missing)?;
            Ok(ResolvedBase::Built {
                fingerprint: fingerprint.clone(),
                manifest: artifact.manifest_descriptor.clone(),
            })
        }
        ImageSource::External { image } => externals
            .get(&image.cache_tag())
            .cloned()
            .map(ResolvedBase::External)
            .ok_or_else(|| CoreError::Unknown(image.to_string())),
    }
}

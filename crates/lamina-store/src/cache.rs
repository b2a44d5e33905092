//! Fingerprint-keyed build cache.
//!
//! Entries live in `<dir>/entries/<fingerprint>.json` and are immutable once
//! written. Concurrent requests for one fingerprint collapse onto a single
//! builder: in-process through a flight table, across processes through an
//! advisory lock on `<dir>/locks/<fingerprint>.lock`.

use crate::blobs::BlobStore;
use crate::image::ImageStore;
use crate::layout::write_atomic;
use crate::oci::Descriptor;
use crate::StoreError;
use fs2::FileExt;
use lamina_schema::{Digest, Fingerprint};
use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use tracing::{debug, info, warn};

/// Bumped whenever the artifact format changes; a mismatch drops all entries.
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// The result of building one layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerArtifact {
    pub fingerprint: Fingerprint,
    pub descriptor: Descriptor,
    pub config_descriptor: Descriptor,
    pub manifest_descriptor: Descriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verity_root_hash: Option<String>,
    pub diff_id: Digest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub artifact: LayerArtifact,
    pub created_at: String,
    /// sha256 over the entry serialized without this field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl CacheEntry {
    fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string_pretty(&copy)?;
        Ok(hex::encode(sha2::Sha256::digest(json.as_bytes())))
    }
}

/// How `get_or_build` obtained its artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Found in the cache.
    Hit(LayerArtifact),
    /// Built by this caller.
    Built(LayerArtifact),
    /// Built by another caller in this process while we waited.
    Joined(LayerArtifact),
}

impl CacheOutcome {
    pub fn artifact(&self) -> &LayerArtifact {
        match self {
            CacheOutcome::Hit(a) | CacheOutcome::Built(a) | CacheOutcome::Joined(a) => a,
        }
    }

    pub fn into_artifact(self) -> LayerArtifact {
        match self {
            CacheOutcome::Hit(a) | CacheOutcome::Built(a) | CacheOutcome::Joined(a) => a,
        }
    }

    pub fn was_built(&self) -> bool {
        matches!(self, CacheOutcome::Built(_))
    }
}

#[derive(Debug, Default)]
pub struct PruneReport {
    pub removed: Vec<Fingerprint>,
    pub kept: usize,
}

enum FlightState {
    Running,
    Done(Result<LayerArtifact, String>),
}

struct Flight {
    state: Mutex<FlightState>,
    done: Condvar,
}

/// Publishes the flight outcome even when the builder unwinds.
struct FlightGuard<'a> {
    cache: &'a BuildCache,
    fingerprint: &'a Fingerprint,
    flight: Arc<Flight>,
    outcome: Option<Result<LayerArtifact, String>>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let outcome = self
            .outcome
            .take()
            .unwrap_or_else(|| Err("builder panicked".to_owned()));
        if let Ok(mut state) = self.flight.state.lock() {
            *state = FlightState::Done(outcome);
        }
        self.flight.done.notify_all();
        if let Ok(mut flights) = self.cache.flights.lock() {
            flights.remove(self.fingerprint);
        }
    }
}

/// Exclusive advisory lock on one fingerprint, released on drop.
struct FingerprintLock {
    file: File,
}

impl Drop for FingerprintLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

pub struct BuildCache {
    dir: PathBuf,
    blocking: bool,
    flights: Mutex<HashMap<Fingerprint, Arc<Flight>>>,
}

impl BuildCache {
    /// Open the cache at `dir`, dropping entries written by another cache
    /// version and entries whose manifest blob has disappeared from `blobs`.
    pub fn open(dir: impl Into<PathBuf>, blobs: &BlobStore) -> Result<Self, StoreError> {
        let cache = Self {
            dir: dir.into(),
            blocking: true,
            flights: Mutex::new(HashMap::new()),
        };
        fs::create_dir_all(cache.entries_dir())?;
        fs::create_dir_all(cache.locks_dir())?;
        cache.check_version()?;

        for entry in cache.list()? {
            if !blobs.exists(&entry.artifact.manifest_descriptor.digest) {
                warn!(
                    "dropping cache entry {}: manifest blob missing",
                    entry.artifact.fingerprint.short()
                );
                cache.remove(&entry.artifact.fingerprint)?;
            }
        }
        Ok(cache)
    }

    /// Fail with `Locked` instead of waiting for another process.
    #[must_use]
    pub fn non_blocking(mut self) -> Self {
        self.blocking = false;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entries_dir(&self) -> PathBuf {
        self.dir.join("entries")
    }

    fn locks_dir(&self) -> PathBuf {
        self.dir.join("locks")
    }

    fn version_file(&self) -> PathBuf {
        self.dir.join("version")
    }

    fn entry_path(&self, fp: &Fingerprint) -> Result<PathBuf, StoreError> {
        validate_fingerprint(fp)?;
        Ok(self.entries_dir().join(format!("{fp}.json")))
    }

    fn lock_path(&self, fp: &Fingerprint) -> Result<PathBuf, StoreError> {
        validate_fingerprint(fp)?;
        Ok(self.locks_dir().join(format!("{fp}.lock")))
    }

    fn check_version(&self) -> Result<(), StoreError> {
        let expected = CACHE_FORMAT_VERSION.to_string();
        match fs::read_to_string(self.version_file()) {
            Ok(found) if found.trim() == expected => return Ok(()),
            Ok(found) => {
                info!(
                    "cache format changed ({} -> {expected}), clearing entries",
                    found.trim()
                );
                fs::remove_dir_all(self.entries_dir())?;
                fs::create_dir_all(self.entries_dir())?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        write_atomic(&self.dir, &self.version_file(), expected.as_bytes())
    }

    pub fn get(&self, fp: &Fingerprint) -> Result<Option<LayerArtifact>, StoreError> {
        let path = self.entry_path(fp)?;
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let entry: CacheEntry = serde_json::from_str(&content)?;
        if let Some(ref expected) = entry.checksum {
            let actual = entry.compute_checksum()?;
            if actual != *expected {
                return Err(StoreError::IntegrityFailure {
                    digest: fp.to_string(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(Some(entry.artifact))
    }

    /// Record an artifact. An existing entry is never overwritten.
    pub fn put(&self, artifact: &LayerArtifact) -> Result<(), StoreError> {
        let dest = self.entry_path(&artifact.fingerprint)?;
        if dest.exists() {
            debug!("cache entry {} already present", artifact.fingerprint.short());
            return Ok(());
        }
        let mut entry = CacheEntry {
            artifact: artifact.clone(),
            created_at: chrono::Utc::now().to_rfc3339(),
            checksum: None,
        };
        entry.checksum = Some(entry.compute_checksum()?);
        let content = serde_json::to_string_pretty(&entry)?;
        write_atomic(&self.entries_dir(), &dest, content.as_bytes())
    }

    pub fn remove(&self, fp: &Fingerprint) -> Result<(), StoreError> {
        let path = self.entry_path(fp)?;
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// All entries, sorted by fingerprint. Unreadable entries are skipped.
    pub fn list(&self) -> Result<Vec<CacheEntry>, StoreError> {
        let mut entries = Vec::new();
        for dirent in fs::read_dir(self.entries_dir())? {
            let path = dirent?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(StoreError::from)
                .and_then(|c| Ok(serde_json::from_str::<CacheEntry>(&c)?))
            {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("skipping cache entry {}: {e}", path.display()),
            }
        }
        entries.sort_by(|a, b| a.artifact.fingerprint.cmp(&b.artifact.fingerprint));
        Ok(entries)
    }

    fn lock(&self, fp: &Fingerprint) -> Result<FingerprintLock, StoreError> {
        let path = self.lock_path(fp)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        if self.blocking {
            file.lock_exclusive()
                .map_err(|e| StoreError::LockFailed(format!("{}: {e}", path.display())))?;
        } else if file.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked(path.display().to_string()));
        }
        Ok(FingerprintLock { file })
    }

    /// Return the cached artifact for `fp`, or run `build` exactly once
    /// across all concurrent callers and record its result.
    ///
    /// Callers waiting on a failed build receive `StoreError::FlightFailed`.
    pub fn get_or_build<E, F>(&self, fp: &Fingerprint, build: F) -> Result<CacheOutcome, E>
    where
        E: From<StoreError> + Display,
        F: FnOnce() -> Result<LayerArtifact, E>,
    {
        if let Some(artifact) = self.get(fp)? {
            return Ok(CacheOutcome::Hit(artifact));
        }

        let (flight, leader) = {
            let mut flights = self
                .flights
                .lock()
                .map_err(|_| StoreError::LockFailed("flight table poisoned".to_owned()))?;
            match flights.get(fp) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let flight = Arc::new(Flight {
                        state: Mutex::new(FlightState::Running),
                        done: Condvar::new(),
                    });
                    flights.insert(fp.clone(), Arc::clone(&flight));
                    (flight, true)
                }
            }
        };

        if !leader {
            debug!("waiting for in-flight build of {}", fp.short());
            return self.join(fp, &flight);
        }

        let mut guard = FlightGuard {
            cache: self,
            fingerprint: fp,
            flight,
            outcome: None,
        };
        let result = self.lead(fp, build);
        guard.outcome = Some(match &result {
            Ok(outcome) => Ok(outcome.artifact().clone()),
            Err(e) => Err(e.to_string()),
        });
        result
    }

    fn lead<E, F>(&self, fp: &Fingerprint, build: F) -> Result<CacheOutcome, E>
    where
        E: From<StoreError> + Display,
        F: FnOnce() -> Result<LayerArtifact, E>,
    {
        let _lock = self.lock(fp)?;
        // Another process may have finished while we waited for the lock.
        if let Some(artifact) = self.get(fp)? {
            return Ok(CacheOutcome::Hit(artifact));
        }
        let artifact = build()?;
        self.put(&artifact)?;
        Ok(CacheOutcome::Built(artifact))
    }

    fn join<E>(&self, fp: &Fingerprint, flight: &Flight) -> Result<CacheOutcome, E>
    where
        E: From<StoreError>,
    {
        let poisoned = || StoreError::LockFailed("flight state poisoned".to_owned());
        let mut state = flight.state.lock().map_err(|_| poisoned())?;
        while matches!(*state, FlightState::Running) {
            state = flight.done.wait(state).map_err(|_| poisoned())?;
        }
        match &*state {
            FlightState::Done(Ok(artifact)) => Ok(CacheOutcome::Joined(artifact.clone())),
            FlightState::Done(Err(reason)) => Err(StoreError::FlightFailed {
                fingerprint: fp.to_string(),
                reason: reason.clone(),
            }
            .into()),
            FlightState::Running => Err(poisoned().into()),
        }
    }

    /// Remove entries outside `live` whose blobs no reference in `images`
    /// still reaches.
    pub fn prune(
        &self,
        live: &HashSet<Fingerprint>,
        images: &ImageStore,
    ) -> Result<PruneReport, StoreError> {
        let referenced = images.referenced_blobs()?;
        let mut report = PruneReport::default();
        for entry in self.list()? {
            let artifact = &entry.artifact;
            let pinned = referenced.contains(&artifact.manifest_descriptor.digest)
                || referenced.contains(&artifact.descriptor.digest);
            if live.contains(&artifact.fingerprint) || pinned {
                report.kept += 1;
                continue;
            }
            self.remove(&artifact.fingerprint)?;
            let lock = self.lock_path(&artifact.fingerprint)?;
            if lock.exists() {
                fs::remove_file(lock)?;
            }
            report.removed.push(artifact.fingerprint.clone());
        }
        info!(
            "cache prune removed {} entries, kept {}",
            report.removed.len(),
            report.kept
        );
        Ok(report)
    }
}

fn validate_fingerprint(fp: &Fingerprint) -> Result<(), StoreError> {
    let s = fp.as_str();
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(StoreError::InvalidDigest(s.to_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::OciLayout;
    use crate::oci::{Manifest, MEDIA_TYPE_CONFIG, MEDIA_TYPE_MANIFEST};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Barrier};
    use std::time::Duration;

    #[derive(Debug)]
    enum TestError {
        Store(StoreError),
        Build(String),
    }

    impl From<StoreError> for TestError {
        fn from(e: StoreError) -> Self {
            TestError::Store(e)
        }
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                TestError::Store(e) => write!(f, "{e}"),
                TestError::Build(s) => write!(f, "{s}"),
            }
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        blobs: BlobStore,
        cache_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let layout = OciLayout::new(dir.path().join("oci"));
        layout.initialize().unwrap();
        let cache_dir = dir.path().join("cache");
        Fixture {
            blobs: BlobStore::new(layout),
            cache_dir,
            _dir: dir,
        }
    }

    fn fp(n: u8) -> Fingerprint {
        Fingerprint::new(hex::encode([n; 32]))
    }

    fn artifact(blobs: &BlobStore, n: u8) -> LayerArtifact {
        let layer = blobs.put_bytes(&[n; 16]).unwrap();
        let layer_desc = Descriptor::new(
            "application/vnd.oci.image.layer.v1.tar",
            layer.0.clone(),
            layer.1,
        );
        let config = blobs.put_json(MEDIA_TYPE_CONFIG, &n).unwrap();
        let mut m = Manifest::new(config.clone());
        m.layers.push(layer_desc.clone());
        let manifest = blobs.put_json(MEDIA_TYPE_MANIFEST, &m).unwrap();
        LayerArtifact {
            fingerprint: fp(n),
            descriptor: layer_desc,
            config_descriptor: config,
            manifest_descriptor: manifest,
            verity_root_hash: None,
            diff_id: layer.0,
        }
    }

    #[test]
    fn put_get_roundtrip() {
        let f = fixture();
        let cache = BuildCache::open(&f.cache_dir, &f.blobs).unwrap();
        let a = artifact(&f.blobs, 1);
        assert!(cache.get(&a.fingerprint).unwrap().is_none());
        cache.put(&a).unwrap();
        assert_eq!(cache.get(&a.fingerprint).unwrap(), Some(a));
    }

    #[test]
    fn entries_are_immutable() {
        let f = fixture();
        let cache = BuildCache::open(&f.cache_dir, &f.blobs).unwrap();
        let a = artifact(&f.blobs, 1);
        cache.put(&a).unwrap();
        let mut changed = a.clone();
        changed.verity_root_hash = Some("abc".to_owned());
        cache.put(&changed).unwrap();
        assert_eq!(cache.get(&a.fingerprint).unwrap(), Some(a));
    }

    #[test]
    fn tampered_entry_detected() {
        let f = fixture();
        let cache = BuildCache::open(&f.cache_dir, &f.blobs).unwrap();
        let a = artifact(&f.blobs, 1);
        cache.put(&a).unwrap();
        let path = cache.entry_path(&a.fingerprint).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        fs::write(&path, content.replace("\"size\": 16", "\"size\": 17")).unwrap();
        assert!(matches!(
            cache.get(&a.fingerprint),
            Err(StoreError::IntegrityFailure { .. })
        ));
    }

    #[test]
    fn version_change_clears_entries() {
        let f = fixture();
        let cache = BuildCache::open(&f.cache_dir, &f.blobs).unwrap();
        cache.put(&artifact(&f.blobs, 1)).unwrap();
        fs::write(f.cache_dir.join("version"), "0").unwrap();

        let reopened = BuildCache::open(&f.cache_dir, &f.blobs).unwrap();
        assert!(reopened.list().unwrap().is_empty());
        assert_eq!(
            fs::read_to_string(f.cache_dir.join("version")).unwrap(),
            CACHE_FORMAT_VERSION.to_string()
        );
    }

    #[test]
    fn open_drops_entries_with_missing_manifest() {
        let f = fixture();
        let cache = BuildCache::open(&f.cache_dir, &f.blobs).unwrap();
        let keep = artifact(&f.blobs, 1);
        let lose = artifact(&f.blobs, 2);
        cache.put(&keep).unwrap();
        cache.put(&lose).unwrap();
        f.blobs.remove(&lose.manifest_descriptor.digest).unwrap();

        let reopened = BuildCache::open(&f.cache_dir, &f.blobs).unwrap();
        assert!(reopened.get(&keep.fingerprint).unwrap().is_some());
        assert!(reopened.get(&lose.fingerprint).unwrap().is_none());
    }

    #[test]
    fn invalid_fingerprint_rejected() {
        let f = fixture();
        let cache = BuildCache::open(&f.cache_dir, &f.blobs).unwrap();
        assert!(matches!(
            cache.get(&Fingerprint::new("../escape")),
            Err(StoreError::InvalidDigest(_))
        ));
    }

    #[test]
    fn second_call_is_a_hit() {
        let f = fixture();
        let cache = BuildCache::open(&f.cache_dir, &f.blobs).unwrap();
        let a = artifact(&f.blobs, 3);
        let first = cache
            .get_or_build::<TestError, _>(&a.fingerprint, || Ok(a.clone()))
            .unwrap();
        assert!(first.was_built());
        let second = cache
            .get_or_build::<TestError, _>(&a.fingerprint, || {
                Err(TestError::Build("must not build".to_owned()))
            })
            .unwrap();
        assert_eq!(second, CacheOutcome::Hit(a));
    }

    #[test]
    fn concurrent_requests_build_once() {
        let f = fixture();
        let cache = Arc::new(BuildCache::open(&f.cache_dir, &f.blobs).unwrap());
        let a = artifact(&f.blobs, 4);
        let builds = Arc::new(AtomicUsize::new(0));
        let n = 8;
        let barrier = Arc::new(Barrier::new(n));

        let handles: Vec<_> = (0..n)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let builds = Arc::clone(&builds);
                let barrier = Arc::clone(&barrier);
                let a = a.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    cache
                        .get_or_build::<TestError, _>(&a.fingerprint.clone(), || {
                            builds.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(Duration::from_millis(100));
                            Ok(a)
                        })
                        .unwrap()
                        .into_artifact()
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| *r == a));
    }

    #[test]
    fn waiters_see_leader_failure() {
        let f = fixture();
        let cache = Arc::new(BuildCache::open(&f.cache_dir, &f.blobs).unwrap());
        let key = fp(5);
        let (started_tx, started_rx) = mpsc::channel();

        let leader = {
            let cache = Arc::clone(&cache);
            let key = key.clone();
            std::thread::spawn(move || {
                cache.get_or_build::<TestError, _>(&key, || {
                    started_tx.send(()).unwrap();
                    std::thread::sleep(Duration::from_millis(300));
                    Err(TestError::Build("step exited 1".to_owned()))
                })
            })
        };
        started_rx.recv().unwrap();
        let follower = cache.get_or_build::<TestError, _>(&key, || {
            Err(TestError::Build("follower must not build".to_owned()))
        });

        assert!(matches!(leader.join().unwrap(), Err(TestError::Build(_))));
        match follower {
            Err(TestError::Store(StoreError::FlightFailed { reason, .. })) => {
                assert!(reason.contains("step exited 1"));
            }
            other => panic!("unexpected follower result: {other:?}"),
        }
        assert!(cache.get(&key).unwrap().is_none());
    }

    #[test]
    fn non_blocking_caller_sees_locked() {
        let f = fixture();
        let cache = BuildCache::open(&f.cache_dir, &f.blobs)
            .unwrap()
            .non_blocking();
        let key = fp(6);
        let held = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(cache.lock_path(&key).unwrap())
            .unwrap();
        held.lock_exclusive().unwrap();

        let result = cache.get_or_build::<TestError, _>(&key, || {
            Err(TestError::Build("must not build".to_owned()))
        });
        assert!(matches!(
            result,
            Err(TestError::Store(StoreError::Locked(_)))
        ));
        fs2::FileExt::unlock(&held).unwrap();
    }

    #[test]
    fn prune_keeps_live_and_referenced_entries() {
        let f = fixture();
        let images = ImageStore::open(f.blobs.layout().root()).unwrap();
        let cache = BuildCache::open(&f.cache_dir, images.blobs()).unwrap();
        let live = artifact(images.blobs(), 1);
        let tagged = artifact(images.blobs(), 2);
        let dead = artifact(images.blobs(), 3);
        for a in [&live, &tagged, &dead] {
            cache.put(a).unwrap();
        }
        images
            .update_reference("tagged", &tagged.manifest_descriptor)
            .unwrap();

        let report = cache
            .prune(&HashSet::from([live.fingerprint.clone()]), &images)
            .unwrap();
        assert_eq!(report.removed, vec![dead.fingerprint.clone()]);
        assert_eq!(report.kept, 2);
        assert!(cache.get(&dead.fingerprint).unwrap().is_none());
        assert!(cache.get(&tagged.fingerprint).unwrap().is_some());
    }
}

//! Writable build roots on btrfs or overlay storage.
//!
//! Layout under the roots directory:
//!
//! ```text
//! roots/
//!   .bases/<hex>            extracted image, keyed by manifest digest
//!   .bases/<hex>.complete   extraction finished
//!   .bases/<hex>.lock       serializes extraction across processes
//!   <id>/rootfs             btrfs: snapshot of the base
//!   <id>/upper|work|merged  overlay: fuse-overlayfs directories
//!   <id>/lower              overlay: empty lower for scratch builds
//!   <id>/stacker            imports and the step script
//! ```

use crate::diff::{DiffRequest, IMPORTS_DIR};
use crate::internal::InternalOp;
use crate::sandbox::{self, BindMount, OverlayDirs, SandboxConfig, RUN_SCRIPT};
use crate::squashfs::SquashfsOptions;
use crate::userns::{Executor, RunOptions};
use crate::RuntimeError;
use fs2::FileExt;
use lamina_schema::Digest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

const BASES_DIR: &str = ".bases";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Btrfs,
    Overlay,
}

impl StorageBackend {
    /// btrfs when `path` lives on btrfs, overlay otherwise.
    pub fn detect(path: &Path) -> Self {
        match nix::sys::statfs::statfs(path) {
            Ok(st) if st.filesystem_type() == nix::sys::statfs::BTRFS_SUPER_MAGIC => Self::Btrfs,
            Ok(_) => Self::Overlay,
            Err(e) => {
                debug!("statfs {}: {e}, assuming overlay", path.display());
                Self::Overlay
            }
        }
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Btrfs => "btrfs",
            Self::Overlay => "overlay",
        })
    }
}

impl FromStr for StorageBackend {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "btrfs" => Ok(Self::Btrfs),
            "overlay" => Ok(Self::Overlay),
            other => Err(format!(
                "unknown storage backend '{other}' (expected btrfs or overlay)"
            )),
        }
    }
}

/// A seeded build root.
#[derive(Debug, Clone)]
pub struct RootfsHandle {
    id: String,
    dir: PathBuf,
    backend: StorageBackend,
    base: Option<PathBuf>,
    imports: Vec<BindMount>,
    binds: Vec<BindMount>,
}

impl RootfsHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn base(&self) -> Option<&Path> {
        self.base.as_deref()
    }

    /// Where the build's own writes land.
    pub fn changes_dir(&self) -> PathBuf {
        match self.backend {
            StorageBackend::Btrfs => self.dir.join("rootfs"),
            StorageBackend::Overlay => self.dir.join("upper"),
        }
    }

    /// The directory steps are chrooted into.
    pub fn mount_point(&self) -> PathBuf {
        match self.backend {
            StorageBackend::Btrfs => self.dir.join("rootfs"),
            StorageBackend::Overlay => self.dir.join("merged"),
        }
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.dir.join(IMPORTS_DIR)
    }

    pub fn imports(&self) -> &[BindMount] {
        &self.imports
    }

    pub fn binds(&self) -> &[BindMount] {
        &self.binds
    }
}

/// How a diff is packaged.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffOptions {
    pub preserve_mtime: bool,
    pub squashfs: Option<SquashfsOptions>,
}

pub struct RootfsManager {
    roots: PathBuf,
    backend: StorageBackend,
    executor: Arc<Executor>,
}

impl RootfsManager {
    pub fn new(
        roots: impl Into<PathBuf>,
        backend: StorageBackend,
        executor: Arc<Executor>,
    ) -> Result<Self, RuntimeError> {
        let roots = roots.into();
        fs::create_dir_all(roots.join(BASES_DIR))?;
        Ok(Self {
            roots,
            backend,
            executor,
        })
    }

    pub fn backend(&self) -> StorageBackend {
        self.backend
    }

    pub fn roots(&self) -> &Path {
        &self.roots
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Directory of root `id`. Ids are single path components that do not
    /// start with `.`, so they never reach outside the roots directory or
    /// into the extracted bases.
    fn node_dir(&self, id: &str) -> Result<PathBuf, RuntimeError> {
        let mut components = Path::new(id).components();
        let single = matches!(
            (components.next(), components.next()),
            (Some(std::path::Component::Normal(_)), None)
        );
        if !single || id.starts_with('.') {
            return Err(RuntimeError::StorageBackend(format!(
                "invalid rootfs id '{id}'"
            )));
        }
        Ok(self.roots.join(id))
    }

    pub fn base_dir(&self, digest: &Digest) -> PathBuf {
        self.roots.join(BASES_DIR).join(digest.hex())
    }

    fn btrfs(&self, args: &[&Path], action: &str) -> Result<(), RuntimeError> {
        let mut full: Vec<&std::ffi::OsStr> = vec!["subvolume".as_ref(), action.as_ref()];
        full.extend(args.iter().map(|p| p.as_os_str()));
        self.executor
            .run("btrfs", &full, &RunOptions::default())
            .map_err(|e| match e {
                RuntimeError::ChildFailed { status, .. } => RuntimeError::StorageBackend(format!(
                    "btrfs subvolume {action} exited with status {status}"
                )),
                other => other,
            })
    }

    fn make_empty_root(&self, path: &Path) -> Result<(), RuntimeError> {
        match self.backend {
            StorageBackend::Btrfs => self.btrfs(&[path], "create"),
            StorageBackend::Overlay => Ok(fs::create_dir_all(path)?),
        }
    }

    /// Extract an image once per manifest digest. `extract` fills the
    /// directory it is given; the result is published by rename.
    pub fn ensure_base(
        &self,
        digest: &Digest,
        extract: impl FnOnce(&Path) -> Result<(), RuntimeError>,
    ) -> Result<PathBuf, RuntimeError> {
        let bases = self.roots.join(BASES_DIR);
        let hex = digest.hex();
        let dest = bases.join(hex);
        let marker = bases.join(format!("{hex}.complete"));

        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(bases.join(format!("{hex}.lock")))?;
        lock.lock_exclusive()?;

        if marker.exists() && dest.exists() {
            debug!("base {hex} already extracted");
            return Ok(dest);
        }

        let tmp = bases.join(format!("{hex}.tmp"));
        self.remove_tree(&tmp)?;
        self.remove_tree(&dest)?;
        self.make_empty_root(&tmp)?;
        info!("extracting base {}", &hex[..hex.len().min(12)]);
        if let Err(e) = extract(&tmp) {
            let _ = self.remove_tree(&tmp);
            return Err(e);
        }
        fs::rename(&tmp, &dest)?;
        fs::write(&marker, b"")?;
        Ok(dest)
    }

    /// Materialize a writable root for node `id`, starting from `base` or
    /// from nothing.
    pub fn seed(&self, id: &str, base: Option<&Path>) -> Result<RootfsHandle, RuntimeError> {
        self.destroy(id)?;
        let dir = self.node_dir(id)?;
        fs::create_dir_all(&dir)?;
        let handle = RootfsHandle {
            id: id.to_owned(),
            dir: dir.clone(),
            backend: self.backend,
            base: base.map(Path::to_path_buf),
            imports: Vec::new(),
            binds: Vec::new(),
        };

        match (self.backend, base) {
            (StorageBackend::Btrfs, Some(base)) => {
                self.btrfs(&[base, &handle.mount_point()], "snapshot")?;
            }
            (StorageBackend::Btrfs, None) => self.btrfs(&[&handle.mount_point()], "create")?,
            (StorageBackend::Overlay, _) => {
                for sub in ["upper", "work", "merged", "lower"] {
                    fs::create_dir_all(dir.join(sub))?;
                }
            }
        }
        fs::create_dir_all(handle.staging_dir())?;
        info!("seeded {id} ({})", self.backend);
        Ok(handle)
    }

    /// Bind `host_path` read-only at `/stacker/<ns_name>`.
    pub fn bind_import(
        &self,
        handle: &mut RootfsHandle,
        host_path: &Path,
        ns_name: &str,
    ) -> Result<(), RuntimeError> {
        let meta = fs::metadata(host_path)?;
        let placeholder = handle.staging_dir().join(ns_name);
        if meta.is_dir() {
            fs::create_dir_all(&placeholder)?;
        } else {
            fs::write(&placeholder, b"")?;
        }
        handle.imports.push(BindMount {
            source: host_path.to_path_buf(),
            target: Path::new("/").join(IMPORTS_DIR).join(ns_name),
            read_only: true,
        });
        Ok(())
    }

    /// Bind a host directory read-write at `dest` for the build.
    pub fn bind_rw(
        &self,
        handle: &mut RootfsHandle,
        host_path: &Path,
        dest: &str,
    ) -> Result<(), RuntimeError> {
        if !host_path.is_dir() {
            return Err(RuntimeError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("bind source {} is not a directory", host_path.display()),
            )));
        }
        handle.binds.push(BindMount {
            source: host_path.to_path_buf(),
            target: Path::new("/").join(dest.trim_start_matches('/')),
            read_only: false,
        });
        Ok(())
    }

    /// Write the step script into the staging directory.
    pub fn write_script(&self, handle: &RootfsHandle, script: &str) -> Result<(), RuntimeError> {
        let path = handle.staging_dir().join(RUN_SCRIPT);
        fs::write(&path, script)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        Ok(())
    }

    /// Run the step script inside the root with `env` as its environment.
    pub fn run(
        &self,
        handle: &RootfsHandle,
        env: &BTreeMap<String, String>,
        opts: &RunOptions<'_>,
    ) -> Result<(), RuntimeError> {
        let overlay = match self.backend {
            StorageBackend::Btrfs => None,
            StorageBackend::Overlay => Some(OverlayDirs {
                lower: handle
                    .base
                    .clone()
                    .unwrap_or_else(|| handle.dir.join("lower")),
                upper: handle.dir.join("upper"),
                work: handle.dir.join("work"),
            }),
        };
        let config = SandboxConfig {
            mount_point: handle.mount_point(),
            overlay,
            staging: handle.staging_dir(),
            imports: handle.imports.clone(),
            binds: handle.binds.clone(),
            env: env.clone(),
        };
        sandbox::run_in_sandbox(&self.executor, &config, opts)
    }

    /// Write the layer diff of `handle` to `output`.
    pub fn diff(
        &self,
        handle: &RootfsHandle,
        output: &Path,
        opts: &DiffOptions,
        run: &RunOptions<'_>,
    ) -> Result<(), RuntimeError> {
        let req = DiffRequest {
            backend: self.backend,
            rootfs: handle.changes_dir(),
            base: handle.base.clone(),
            output: output.to_path_buf(),
            preserve_mtime: opts.preserve_mtime,
            squashfs: opts.squashfs,
        };
        self.executor.run_internal(&InternalOp::Diff(req), run)?;
        if !output.exists() {
            return Err(RuntimeError::StorageBackend(format!(
                "diff of {} produced no output",
                handle.id
            )));
        }
        Ok(())
    }

    fn remove_tree(&self, path: &Path) -> Result<(), RuntimeError> {
        if path.symlink_metadata().is_err() {
            return Ok(());
        }
        if self.backend == StorageBackend::Btrfs && path.is_dir() {
            if let Err(e) = self.btrfs(&[path], "delete") {
                debug!("{} is not a removable subvolume: {e}", path.display());
            }
        }
        if path.symlink_metadata().is_ok() {
            self.executor.run_internal(
                &InternalOp::Remove {
                    path: path.to_path_buf(),
                },
                &RunOptions::default(),
            )?;
        }
        Ok(())
    }

    /// Remove the root of node `id`. Removing a missing root succeeds.
    pub fn destroy(&self, id: &str) -> Result<(), RuntimeError> {
        let dir = self.node_dir(id)?;
        if !dir.exists() {
            return Ok(());
        }
        let merged = dir.join("merged");
        if is_mounted(&merged) {
            unmount(&merged);
        }
        if self.backend == StorageBackend::Btrfs {
            self.remove_tree(&dir.join("rootfs"))?;
        }
        self.remove_tree(&dir)?;
        info!("destroyed {id}");
        Ok(())
    }
}

/// Check if a path is currently a mount point by inspecting /proc/mounts.
fn is_mounted(path: &Path) -> bool {
    let canonical = match fs::canonicalize(path) {
        Ok(p) => p.to_string_lossy().to_string(),
        Err(_) => path.to_string_lossy().to_string(),
    };
    match fs::read_to_string("/proc/mounts") {
        Ok(mounts) => mounts
            .lines()
            .any(|line| line.split_whitespace().nth(1) == Some(&canonical)),
        Err(_) => false,
    }
}

fn unmount(path: &Path) {
    for tool in ["fusermount3", "fusermount"] {
        let _ = Command::new(tool)
            .arg("-u")
            .arg(path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if !is_mounted(path) {
            return;
        }
    }
    warn!("{} is still mounted", path.display());
}

#[cfg(test)]
mod tests {
    use super::*;
    use lamina_schema::Digest;

    fn manager(dir: &Path) -> RootfsManager {
        RootfsManager::new(
            dir.join("roots"),
            StorageBackend::Overlay,
            Arc::new(Executor::direct()),
        )
        .unwrap()
    }

    #[test]
    fn backend_parses_and_displays() {
        assert_eq!("btrfs".parse::<StorageBackend>().unwrap(), StorageBackend::Btrfs);
        assert_eq!(StorageBackend::Overlay.to_string(), "overlay");
        assert!("zfs".parse::<StorageBackend>().is_err());
    }

    #[test]
    fn detect_on_tmp_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let _ = StorageBackend::detect(dir.path());
    }

    #[test]
    fn overlay_seed_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let handle = mgr.seed("web", None).unwrap();
        for sub in ["upper", "work", "merged", "lower", "stacker"] {
            assert!(handle.dir().join(sub).is_dir(), "{sub}");
        }
        assert_eq!(handle.changes_dir(), handle.dir().join("upper"));
        assert_eq!(handle.mount_point(), handle.dir().join("merged"));
    }

    #[test]
    fn destroy_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let handle = mgr.seed("web", None).unwrap();
        fs::write(handle.changes_dir().join("file"), b"x").unwrap();
        mgr.destroy("web").unwrap();
        assert!(!handle.dir().exists());
        mgr.destroy("web").unwrap();
        mgr.destroy("never-seeded").unwrap();
    }

    #[test]
    fn ids_outside_roots_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let roots = dir.path().join("roots");
        fs::write(dir.path().join("keep.txt"), b"x").unwrap();
        let mgr = manager(dir.path());
        for id in ["..", ".", "", "a/b", ".bases", "/tmp"] {
            assert!(
                matches!(mgr.seed(id, None), Err(RuntimeError::StorageBackend(_))),
                "{id:?} accepted"
            );
            assert!(mgr.destroy(id).is_err());
        }
        assert!(dir.path().join("keep.txt").exists());
        assert!(roots.exists());
    }

    #[test]
    fn reseed_discards_stale_root() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let handle = mgr.seed("web", None).unwrap();
        fs::write(handle.changes_dir().join("stale"), b"x").unwrap();
        let handle = mgr.seed("web", None).unwrap();
        assert!(!handle.changes_dir().join("stale").exists());
    }

    #[test]
    fn imports_get_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let mut handle = mgr.seed("web", None).unwrap();
        let file = dir.path().join("app.conf");
        fs::write(&file, b"x").unwrap();
        let tree = dir.path().join("assets");
        fs::create_dir_all(&tree).unwrap();

        mgr.bind_import(&mut handle, &file, "app.conf").unwrap();
        mgr.bind_import(&mut handle, &tree, "assets").unwrap();
        assert!(handle.staging_dir().join("app.conf").is_file());
        assert!(handle.staging_dir().join("assets").is_dir());
        assert_eq!(handle.imports()[0].target, Path::new("/stacker/app.conf"));
        assert!(handle.imports().iter().all(|b| b.read_only));
        assert!(mgr
            .bind_import(&mut handle, &dir.path().join("missing"), "missing")
            .is_err());
    }

    #[test]
    fn rw_binds_are_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let mut handle = mgr.seed("web", None).unwrap();
        mgr.bind_rw(&mut handle, dir.path(), "var/cache").unwrap();
        assert_eq!(handle.binds()[0].target, Path::new("/var/cache"));
        assert!(!handle.binds()[0].read_only);
    }

    #[test]
    fn script_is_executable() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let handle = mgr.seed("web", None).unwrap();
        mgr.write_script(&handle, "#!/bin/sh -xe\ntrue\n").unwrap();
        let meta = fs::metadata(handle.staging_dir().join(RUN_SCRIPT)).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o755);
    }

    #[test]
    fn base_is_extracted_once() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let digest = Digest::sha256(b"manifest");
        let mut calls = 0;
        let path = mgr
            .ensure_base(&digest, |tmp| {
                calls += 1;
                fs::write(tmp.join("os-release"), b"ID=test")?;
                Ok(())
            })
            .unwrap();
        assert_eq!(path, mgr.base_dir(&digest));
        assert!(path.join("os-release").exists());

        let again = mgr
            .ensure_base(&digest, |_| panic!("extracted twice"))
            .unwrap();
        assert_eq!(again, path);
        assert_eq!(calls, 1);
    }

    #[test]
    fn failed_extraction_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let digest = Digest::sha256(b"broken");
        let err = mgr
            .ensure_base(&digest, |_| Err(RuntimeError::Cancelled))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Cancelled));
        assert!(!mgr.base_dir(&digest).exists());
    }

    #[test]
    fn overlay_diff_runs_in_process_as_root_executor() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let handle = mgr.seed("web", None).unwrap();
        fs::write(handle.changes_dir().join("hello"), b"world").unwrap();
        let out = dir.path().join("layer.tar");
        mgr.diff(&handle, &out, &DiffOptions::default(), &RunOptions::default())
            .unwrap();
        assert!(fs::metadata(&out).unwrap().len() > 0);
    }
}

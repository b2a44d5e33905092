//! Unprivileged execution, rootfs backends, squashfs and dm-verity for Lamina.
//!
//! This crate implements the execution layer: subordinate id resolution and the
//! `IdMapSet` handed to the userns-exec helper, the `Executor` that runs build
//! steps directly or inside a user namespace with SIGTERM/SIGKILL cancellation,
//! btrfs and overlay rootfs backends with whiteout-aware diffs, the build
//! sandbox script, `mksquashfs`/`unsquashfs` invocation, a native dm-verity
//! hash-tree writer and verifier, and external prerequisite checks.

pub mod diff;
pub mod filesystems;
pub mod idmap;
pub mod internal;
pub mod prereq;
pub mod rootfs;
pub mod sandbox;
pub mod squashfs;
pub mod userns;
pub mod verity;

pub use diff::{rootfs_changes, write_diff, DiffRequest};
pub use filesystems::{filesystem_supported, filesystem_supported_in};
pub use idmap::{
    ensure_allocation, next_allocation, resolve, resolve_current, IdKind, IdMapEntry, IdMapError,
    IdMapSet, UserIdentity,
};
pub use internal::{InternalOp, LayerSource, UnpackRequest};
pub use prereq::{check_build_prereqs, check_optional_prereqs, format_missing, MissingPrereq};
pub use rootfs::{DiffOptions, RootfsHandle, RootfsManager, StorageBackend};
pub use sandbox::{BindMount, SandboxConfig, RUN_SCRIPT};
pub use squashfs::{MksquashfsCaps, SquashfsOptions};
pub use userns::{ExecMode, Executor, RunOptions, USERNS_HELPER};
pub use verity::{VerityParams, VeritySeal, SALT_SIZE};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    IdMap(#[from] IdMapError),
    #[error(transparent)]
    Store(#[from] lamina_store::StoreError),
    #[error("required helper '{0}' is not installed")]
    MissingHelper(String),
    #[error("user namespace helper rejected the id map: {0}")]
    MapRejected(String),
    #[error("'{command}' exited with status {status}")]
    ChildFailed { command: String, status: i32 },
    #[error("'{command}' exceeded its time limit of {secs}s")]
    Timeout { command: String, secs: u64 },
    #[error("cancelled")]
    Cancelled,
    #[error("storage backend error: {0}")]
    StorageBackend(String),
    #[error("dm-verity root hash not available: {0}")]
    VerityUnsupported(String),
    #[error("dm-verity verification failed: {0}")]
    VerityMismatch(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_failed_display() {
        let e = RuntimeError::ChildFailed {
            command: "mksquashfs".to_owned(),
            status: 1,
        };
        let msg = e.to_string();
        assert!(msg.contains("mksquashfs"));
        assert!(msg.contains("status 1"));
    }

    #[test]
    fn missing_helper_display() {
        let e = RuntimeError::MissingHelper("lxc-usernsexec".to_owned());
        assert!(e.to_string().contains("lxc-usernsexec"));
    }

    #[test]
    fn idmap_error_converts() {
        let e: RuntimeError = IdMapError::NoSubordinateAllocation("bob".to_owned()).into();
        assert!(e.to_string().contains("bob"));
    }
}

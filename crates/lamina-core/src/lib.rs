//! Build orchestration for Lamina images.
//!
//! This crate ties the schema, store and runtime layers together: the
//! `Orchestrator` walks a recipe's dependency graph with a bounded worker
//! pool, consults the build cache, and drives the `LayerPipeline` that turns a
//! seeded rootfs into a tar or squashfs+verity layer. It also provides image
//! copy for external bases, the node lifecycle state machine, cancellation,
//! and the error classification behind the CLI's exit codes.

pub mod concurrency;
pub mod copy;
pub mod engine;
pub mod lifecycle;
pub mod pipeline;

pub use concurrency::{install_signal_handler, shutdown_requested, CancelToken, StoreLock};
pub use copy::{copy, BaseImageCache, CopyOptions};
pub use engine::{BuildOptions, BuildReport, NodeBuilder, NodeJob, Orchestrator};
pub use lifecycle::{validate_transition, NodeState};
pub use pipeline::{LayerPipeline, DEFAULT_PATH};

use lamina_runtime::{IdMapError, RuntimeError};
use lamina_schema::{DagError, ImportError, RecipeError, ReferenceError};
use lamina_store::StoreError;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("recipe error: {0}")]
    Recipe(#[from] RecipeError),
    #[error("graph error: {0}")]
    Dag(#[from] DagError),
    #[error("import error: {0}")]
    Import(#[from] ImportError),
    #[error("reference error: {0}")]
    Reference(#[from] ReferenceError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("id map error: {0}")]
    IdMap(#[from] IdMapError),
    #[error("build of layer '{node}' failed with status {status}")]
    BuildFailed { node: String, status: i32 },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("unknown layer or reference: {0}")]
    Unknown(String),
    #[error("invalid state transition for '{node}': {from} -> {to}")]
    InvalidTransition {
        node: String,
        from: NodeState,
        to: NodeState,
    },
    #[error("build deadline of {0}s exceeded")]
    DeadlineExceeded(u64),
    #[error("cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure classes surfaced to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    Unknown,
    Cycle,
    Duplicate,
    NoSubordinateAllocation,
    MissingHelper,
    MapRejected,
    ChildFailed,
    BuildFailed,
    StorageBackend,
    BlobIntegrity,
    VerityUnsupported,
    Locked,
    Cancelled,
    Timeout,
    Internal,
}

impl ErrorKind {
    /// Process exit code: 1 build failure, 2 usage or configuration,
    /// 3 host environment.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::BuildFailed
            | Self::ChildFailed
            | Self::Cancelled
            | Self::Timeout
            | Self::BlobIntegrity
            | Self::Locked
            | Self::Internal => 1,
            Self::Config | Self::Unknown | Self::Cycle | Self::Duplicate => 2,
            Self::NoSubordinateAllocation
            | Self::MissingHelper
            | Self::MapRejected
            | Self::StorageBackend
            | Self::VerityUnsupported => 3,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Config => "config",
            Self::Unknown => "unknown",
            Self::Cycle => "cycle",
            Self::Duplicate => "duplicate",
            Self::NoSubordinateAllocation => "no_subordinate_allocation",
            Self::MissingHelper => "missing_helper",
            Self::MapRejected => "map_rejected",
            Self::ChildFailed => "child_failed",
            Self::BuildFailed => "build_failed",
            Self::StorageBackend => "storage_backend",
            Self::BlobIntegrity => "blob_integrity",
            Self::VerityUnsupported => "verity_unsupported",
            Self::Locked => "locked",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

fn dag_kind(e: &DagError) -> ErrorKind {
    match e {
        DagError::Duplicate(_) => ErrorKind::Duplicate,
        DagError::Unknown(_) => ErrorKind::Unknown,
        DagError::Cycle { .. } => ErrorKind::Cycle,
    }
}

fn store_kind(e: &StoreError) -> ErrorKind {
    match e {
        StoreError::IntegrityFailure { .. }
        | StoreError::BlobNotFound(_)
        | StoreError::InvalidDigest(_)
        | StoreError::UnsafePath(_) => ErrorKind::BlobIntegrity,
        StoreError::ReferenceNotFound(_) => ErrorKind::Unknown,
        StoreError::UnsupportedMediaType(_) | StoreError::VersionMismatch { .. } => {
            ErrorKind::Config
        }
        StoreError::Locked(_) => ErrorKind::Locked,
        StoreError::FlightFailed { .. } => ErrorKind::BuildFailed,
        StoreError::Io(_) | StoreError::LockFailed(_) | StoreError::Serialization(_) => {
            ErrorKind::Internal
        }
    }
}

fn idmap_kind(e: &IdMapError) -> ErrorKind {
    match e {
        IdMapError::NoSubordinateAllocation(_) | IdMapError::UnknownUser(_) => {
            ErrorKind::NoSubordinateAllocation
        }
        IdMapError::Overlap(_) | IdMapError::HostIdIsSubordinate(_) => ErrorKind::MapRejected,
        IdMapError::Malformed { .. } => ErrorKind::Config,
        IdMapError::Io { .. } => ErrorKind::Internal,
    }
}

fn runtime_kind(e: &RuntimeError) -> ErrorKind {
    match e {
        RuntimeError::IdMap(inner) => idmap_kind(inner),
        RuntimeError::Store(inner) => store_kind(inner),
        RuntimeError::MissingHelper(_) => ErrorKind::MissingHelper,
        RuntimeError::MapRejected(_) => ErrorKind::MapRejected,
        RuntimeError::ChildFailed { .. } => ErrorKind::ChildFailed,
        RuntimeError::Timeout { .. } => ErrorKind::Timeout,
        RuntimeError::Cancelled => ErrorKind::Cancelled,
        RuntimeError::StorageBackend(_) => ErrorKind::StorageBackend,
        RuntimeError::VerityUnsupported(_) => ErrorKind::VerityUnsupported,
        RuntimeError::VerityMismatch(_) => ErrorKind::BlobIntegrity,
        RuntimeError::Io(_) | RuntimeError::Serialization(_) => ErrorKind::Internal,
    }
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Recipe(RecipeError::Graph(e)) | Self::Dag(e) => dag_kind(e),
            Self::Recipe(RecipeError::UnknownBase { .. }) | Self::Unknown(_) => ErrorKind::Unknown,
            Self::Recipe(_) | Self::Import(_) | Self::Reference(_) | Self::Config(_) => {
                ErrorKind::Config
            }
            Self::Store(e) => store_kind(e),
            Self::Runtime(e) => runtime_kind(e),
            Self::IdMap(e) => idmap_kind(e),
            Self::BuildFailed { .. } => ErrorKind::BuildFailed,
            Self::DeadlineExceeded(_) => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InvalidTransition { .. }
            | Self::Internal(_)
            | Self::Io(_)
            | Self::Serialization(_) => ErrorKind::Internal,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }

    /// True for errors that only report that work was stopped.
    pub fn is_cancellation(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}

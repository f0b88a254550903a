//! Crate-wide error taxonomy.
//!
//! Leaf modules (`rootfs`, `network`, `firecracker::api`) define their own
//! narrow `thiserror` enums; `RuntimeError` is the error surfaced by the
//! public `Runtime` operations and wraps them via `#[from]`, following
//! `spec.md` §7.

use thiserror::Error;

use crate::firecracker::SupervisorError;
use crate::image::OciLayoutError;
use crate::network::TapError;
use crate::rootfs::RootfsError;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("instance {0} not found")]
    ResourceNotFound(String),

    #[error("instance {0} is busy with a conflicting operation")]
    ResourceBusy(String),

    #[error("image {0} could not be materialized")]
    ImageUnavailable(String),

    #[error("rootfs mount failed: {0}")]
    RootfsMountFailed(String),

    #[error("rootfs injection failed: {0}")]
    RootfsInjectFailed(String),

    #[error("network setup failed: {0}")]
    NetworkSetupFailed(String),

    #[error("firecracker failed to spawn: {0}")]
    VmmSpawnFailed(String),

    #[error("firecracker API socket did not appear within the deadline")]
    ApiSocketTimeout,

    #[error("failed to stop instance: {0}")]
    StopFailed(String),

    #[error("operation not supported by this runtime")]
    NotSupported,

    #[error("operation was cancelled")]
    Cancelled,

    #[error("config render/write failed: {0}")]
    ConfigWriteFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<RootfsError> for RuntimeError {
    fn from(err: RootfsError) -> Self {
        match err {
            RootfsError::BaseMissing(_) | RootfsError::MountFailed(_) | RootfsError::UnmountFailed(_) => {
                RuntimeError::RootfsMountFailed(err.to_string())
            }
            _ => RuntimeError::RootfsInjectFailed(err.to_string()),
        }
    }
}

impl From<TapError> for RuntimeError {
    fn from(err: TapError) -> Self {
        RuntimeError::NetworkSetupFailed(err.to_string())
    }
}

impl From<OciLayoutError> for RuntimeError {
    fn from(err: OciLayoutError) -> Self {
        RuntimeError::ImageUnavailable(err.to_string())
    }
}

impl From<SupervisorError> for RuntimeError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::ApiSocketTimeout => RuntimeError::ApiSocketTimeout,
            SupervisorError::SpawnFailed(msg) => RuntimeError::VmmSpawnFailed(msg),
            SupervisorError::StopFailed(msg) => RuntimeError::StopFailed(msg),
            SupervisorError::Cancelled => RuntimeError::Cancelled,
        }
    }
}

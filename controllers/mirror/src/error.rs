//! Controller-specific error types.
//!
//! This module defines error types specific to the mirror controller
//! that are not covered by upstream library errors.

use mirror_sync::SyncError;
use thiserror::Error;

/// Errors that can occur in the mirror controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Kubernetes client configuration could not be inferred
    #[error("Kubernetes config error: {0}")]
    KubeConfig(#[from] kube::config::InferConfigError),

    /// Mirror sync engine error
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

//! Error types for containerized builds.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Docker daemon is not available or not running.
    #[error("Docker not available: {reason}")]
    DockerNotAvailable { reason: String },

    /// The image build itself failed.
    #[error("Image build failed: {reason}")]
    ImageBuildFailed { reason: String, output: String },

    #[error("Image build timed out after {0:?}")]
    Timeout(Duration),

    /// The build context could not be packed.
    #[error("Build context error: {reason}")]
    Context { reason: String },

    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Build log captured before the failure, if any.
    pub fn output(&self) -> &str {
        match self {
            SandboxError::ImageBuildFailed { output, .. } => output,
            _ => "",
        }
    }
}

/// Result type for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

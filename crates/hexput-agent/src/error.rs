// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Error types for the agent crate

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("release lookup failed: {0}")]
    ReleaseLookup(String),

    #[error("no release asset matches architecture tag '{tag}' (available: {})", available.join(", "))]
    NoMatchingAsset { tag: String, available: Vec<String> },

    #[error("release index did not report a version tag")]
    MissingVersion,

    #[error("download failed: {0}")]
    Download(String),

    #[error("artifact validation failed: {0}")]
    ArtifactValidation(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("install failed: {0}")]
    Install(String),

    #[error("service registration failed: {0}")]
    ServiceRegistration(String),

    #[error("native service did not start: {0}")]
    NativeServiceStart(String),

    #[error("fallback task registration failed: {0}")]
    FallbackRegistration(String),

    #[error("command failed: {0}")]
    Command(String),

    #[error("another agent run holds the lock: {0}")]
    Lock(String),
}

impl AgentError {
    /// Whether the error aborts the run with a non-zero exit.
    ///
    /// Unix registration failures are best-effort once the binary was swapped,
    /// and a native Windows service that never starts is handled by the
    /// scheduled-task fallback.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::ServiceRegistration(_) | Self::NativeServiceStart(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

//! Transport collaborator.
//!
//! Fetches metadata and images from the two repositories and delivers
//! manifests and device facts. HTTP specifics live in implementations.

use std::fmt;
use std::io::Read;

use serde_json::Value;
use thiserror::Error;

use crate::metadata::{RepositoryType, Role, Target, Version};

/// Failure to move bytes between this device and a repository or ECU.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("network error: {0}")]
    Network(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Downloaded content does not match the target description.
    #[error("content of {filename} does not match its target: {reason}")]
    ContentMismatch { filename: String, reason: String },

    #[error("local io error: {0}")]
    Io(String),

    #[error("download interrupted by shutdown")]
    Interrupted,
}

/// What a facts report describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactsKind {
    HardwareInfo,
    NetworkInfo,
    InstalledPackages,
}

impl fmt::Display for FactsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactsKind::HardwareInfo => write!(f, "hardware_info"),
            FactsKind::NetworkInfo => write!(f, "network_info"),
            FactsKind::InstalledPackages => write!(f, "installed_packages"),
        }
    }
}

pub trait Transport: Send + Sync {
    /// Fetch one metadata document. `version` is only used for roots.
    /// `Ok(None)` means the repository does not have it.
    fn fetch_meta(
        &self,
        repo: RepositoryType,
        role: Role,
        version: Option<Version>,
    ) -> Result<Option<Vec<u8>>, TransferError>;

    /// Open a stream of image content for `target`.
    fn fetch_image(&self, target: &Target) -> Result<Box<dyn Read + Send>, TransferError>;

    fn put_manifest(&self, manifest: &Value) -> Result<(), TransferError>;

    fn put_facts(&self, kind: FactsKind, facts: &Value) -> Result<(), TransferError>;
}

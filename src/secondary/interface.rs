//! Secondary ECU capability interface.
//!
//! The coordinator only ever sees secondaries through this trait; each
//! communication mechanism (in-process, CAN, IP) is one implementation.

use std::io::Read;

use ed25519_dalek::VerifyingKey;
use serde_json::Value;
use thiserror::Error;

use crate::ecu::{EcuSerial, HardwareIdentifier};
use crate::metadata::{RepositoryType, Target, Version};
use crate::repository::RepositoryBundle;

/// Per-ECU failure. Never aborts processing of other secondaries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecondaryError {
    #[error("secondary unreachable: {0}")]
    Unreachable(String),

    /// The secondary refused metadata or an image after its own checks.
    #[error("secondary rejected: {0}")]
    Rejected(String),

    #[error("bad secondary manifest: {0}")]
    BadManifest(String),

    /// Failure on the primary's side while serving this secondary.
    #[error("primary-side failure: {0}")]
    Local(String),

    #[error("skipped after shutdown request")]
    Cancelled,
}

/// Verified documents of both repositories, as shipped to secondaries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UptaneBundle {
    pub director: RepositoryBundle,
    pub image: RepositoryBundle,
}

impl UptaneBundle {
    pub fn get(&self, repo: RepositoryType) -> &RepositoryBundle {
        match repo {
            RepositoryType::Director => &self.director,
            RepositoryType::Image => &self.image,
        }
    }
}

pub trait SecondaryInterface: Send + Sync {
    fn serial(&self) -> &EcuSerial;

    fn hardware_id(&self) -> &HardwareIdentifier;

    /// Key the secondary signs its manifests with.
    fn public_key(&self) -> VerifyingKey;

    /// Trusted root version for `repo`; 0 when none is trusted yet.
    fn root_version(&self, repo: RepositoryType) -> Result<Version, SecondaryError>;

    /// Offer the next root of `repo`. The secondary verifies it itself.
    fn put_root(&self, repo: RepositoryType, raw: &[u8]) -> Result<(), SecondaryError>;

    fn send_metadata(&self, bundle: &UptaneBundle) -> Result<(), SecondaryError>;

    fn send_image(&self, target: &Target, content: &mut dyn Read) -> Result<(), SecondaryError>;

    /// Signed ECU version manifest envelope.
    fn manifest(&self) -> Result<Value, SecondaryError>;
}

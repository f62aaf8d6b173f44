//! Metadata verification errors.

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::types::{Role, Version};

/// Why a metadata document was not trusted.
///
/// Always fatal to the current fetch attempt; the trusted state of the
/// repository is left exactly as it was.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    /// A key authorized for the role produced an invalid signature and the
    /// remaining valid signatures did not reach the threshold.
    #[error("bad signature on {role} metadata from key {keyid}")]
    BadSignature { role: Role, keyid: String },

    #[error("signature threshold not met for {role}: need {required}, got {valid}")]
    ThresholdNotMet { role: Role, required: u32, valid: u32 },

    #[error("{role} metadata expired at {expires}")]
    Expired { role: Role, expires: DateTime<Utc> },

    #[error("{role} version rollback: trusted {trusted}, received {received}")]
    VersionRollback {
        role: Role,
        trusted: Version,
        received: Version,
    },

    #[error("expected {expected} metadata, got {found}")]
    RoleMismatch { expected: Role, found: String },

    #[error("malformed metadata: {0}")]
    MalformedDocument(String),

    /// A root rotation skipped at least one version.
    #[error("root chain gap: trusted {trusted}, received {received}")]
    RootChainGap { trusted: Version, received: Version },

    #[error("root metadata defines no keys for role {0}")]
    MissingRole(Role),

    /// Version or hash pinned by a snapshot/timestamp does not match.
    #[error("{role} metadata does not match its pinned description: {reason}")]
    MetaMismatch { role: Role, reason: String },
}

impl VerificationError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedDocument(reason.into())
    }
}

//! Repository refresh errors.

use thiserror::Error;

use crate::interfaces::TransferError;
use crate::metadata::{RepositoryType, Role, VerificationError};
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("{repo} metadata untrusted: {source}")]
    Verification {
        repo: RepositoryType,
        #[source]
        source: VerificationError,
    },

    #[error("{repo} metadata fetch failed: {source}")]
    Transfer {
        repo: RepositoryType,
        #[source]
        source: TransferError,
    },

    #[error("{repo} {role} metadata not available")]
    Missing { repo: RepositoryType, role: Role },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl MetadataError {
    /// The verification failure behind this error, if that is what it is.
    pub fn verification(&self) -> Option<&VerificationError> {
        match self {
            MetadataError::Verification { source, .. } => Some(source),
            _ => None,
        }
    }
}

//! Errors that end an iteration early.

use thiserror::Error;

use crate::repository::MetadataError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum IterationError {
    /// Nothing can be assigned without trusted Director metadata.
    #[error("director metadata untrusted: {0}")]
    DirectorUntrusted(MetadataError),

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("iteration cancelled by shutdown")]
    Cancelled,
}

impl IterationError {
    pub fn director(err: MetadataError) -> Self {
        match err {
            MetadataError::Storage(e) => IterationError::Storage(e),
            other => IterationError::DirectorUntrusted(other),
        }
    }
}

//! Where a repository refresh reads documents from.
//!
//! Online refreshes read through the transport, offline checks read
//! pre-staged documents from storage. The verifier runs the same pipeline
//! over either.

use crate::interfaces::Transport;
use crate::metadata::{RepositoryType, Role, VerificationError, Version};
use crate::storage::Storage;

use super::error::MetadataError;

/// Largest metadata document accepted from any source.
pub const MAX_METADATA_SIZE: usize = 8 * 1024 * 1024;

pub trait MetadataSource {
    fn name(&self) -> &'static str;

    fn root(&self, repo: RepositoryType, version: Version) -> Result<Option<Vec<u8>>, MetadataError>;

    fn role(&self, repo: RepositoryType, role: Role) -> Result<Option<Vec<u8>>, MetadataError>;
}

fn check_size(repo: RepositoryType, raw: Option<Vec<u8>>) -> Result<Option<Vec<u8>>, MetadataError> {
    match raw {
        Some(raw) if raw.len() > MAX_METADATA_SIZE => Err(MetadataError::Verification {
            repo,
            source: VerificationError::malformed(format!(
                "document of {} bytes exceeds limit of {}",
                raw.len(),
                MAX_METADATA_SIZE
            )),
        }),
        other => Ok(other),
    }
}

pub struct TransportSource<'a>(pub &'a dyn Transport);

impl MetadataSource for TransportSource<'_> {
    fn name(&self) -> &'static str {
        "transport"
    }

    fn root(&self, repo: RepositoryType, version: Version) -> Result<Option<Vec<u8>>, MetadataError> {
        let raw = self
            .0
            .fetch_meta(repo, Role::Root, Some(version))
            .map_err(|source| MetadataError::Transfer { repo, source })?;
        check_size(repo, raw)
    }

    fn role(&self, repo: RepositoryType, role: Role) -> Result<Option<Vec<u8>>, MetadataError> {
        let raw = self
            .0
            .fetch_meta(repo, role, None)
            .map_err(|source| MetadataError::Transfer { repo, source })?;
        check_size(repo, raw)
    }
}

pub struct StorageSource<'a>(pub &'a dyn Storage);

impl MetadataSource for StorageSource<'_> {
    fn name(&self) -> &'static str {
        "storage"
    }

    fn root(&self, repo: RepositoryType, version: Version) -> Result<Option<Vec<u8>>, MetadataError> {
        check_size(repo, self.0.load_root(repo, version)?)
    }

    fn role(&self, repo: RepositoryType, role: Role) -> Result<Option<Vec<u8>>, MetadataError> {
        check_size(repo, self.0.load_non_root(repo, role)?)
    }
}

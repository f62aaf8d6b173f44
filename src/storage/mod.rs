//! Storage module.
//!
//! The storage collaborator keeps trusted metadata, target files,
//! installed-version records and the ECU registry. Every operation is
//! idempotent under retry. `FsStorage` is the filesystem implementation.

pub mod fs;
pub mod models;

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::ecu::Ecu;
use crate::metadata::{RepositoryType, Role, Version};
use crate::security::NameRejection;

pub use fs::*;
pub use models::*;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] io::Error),

    #[error("storage record corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("invalid storage name: {0}")]
    InvalidName(#[from] NameRejection),
}

pub type StorageResult<T> = Result<T, StorageError>;

pub trait Storage: Send + Sync {
    fn store_root(&self, repo: RepositoryType, version: Version, raw: &[u8]) -> StorageResult<()>;

    fn load_root(&self, repo: RepositoryType, version: Version) -> StorageResult<Option<Vec<u8>>>;

    /// Highest root version stored for `repo`, if any.
    fn latest_root_version(&self, repo: RepositoryType) -> StorageResult<Option<Version>>;

    fn store_non_root(&self, repo: RepositoryType, role: Role, raw: &[u8]) -> StorageResult<()>;

    fn load_non_root(&self, repo: RepositoryType, role: Role) -> StorageResult<Option<Vec<u8>>>;

    fn clear_non_root_meta(&self, repo: RepositoryType) -> StorageResult<()>;

    fn store_ecu_serials(&self, ecus: &[Ecu]) -> StorageResult<()>;

    /// `None` when no registry has been stored yet.
    fn load_ecu_serials(&self) -> StorageResult<Option<Vec<Ecu>>>;

    fn store_misconfigured_ecus(&self, ecus: &[MisconfiguredEcu]) -> StorageResult<()>;

    fn load_misconfigured_ecus(&self) -> StorageResult<Vec<MisconfiguredEcu>>;

    fn store_installed_versions(&self, records: &[InstalledVersionRecord]) -> StorageResult<()>;

    /// `None` means the device has never recorded an installation, which
    /// is a legal state and not an error.
    fn load_installed_versions(&self) -> StorageResult<Option<Vec<InstalledVersionRecord>>>;

    /// Open a staging writer for `filename`. Staged content is invisible to
    /// `open_target` until committed.
    fn stage_target(&self, filename: &str) -> StorageResult<Box<dyn Write + Send>>;

    fn commit_target(&self, filename: &str) -> StorageResult<()>;

    fn discard_target(&self, filename: &str) -> StorageResult<()>;

    /// Read a committed target. `None` if it does not exist.
    fn open_target(&self, filename: &str) -> StorageResult<Option<Box<dyn Read + Send>>>;

    fn remove_target(&self, filename: &str) -> StorageResult<()>;
}

//! Filesystem storage.
//!
//! Layout under the storage root:
//! - `metadata/<repo>/<version>.root.json` every trusted root
//! - `metadata/<repo>/<role>.json` latest trusted non-root metadata
//! - `targets/<filename>` committed images, `targets/.<filename>.part` staged
//! - `ecus.json`, `misconfigured_ecus.json`, `installed_versions.json`
//!
//! Records are written to a temporary file and renamed into place.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::ecu::Ecu;
use crate::metadata::{RepositoryType, Role, Version};
use crate::security::validate_target_filename;

use super::models::{InstalledVersionRecord, MisconfiguredEcu};
use super::{Storage, StorageResult};

const ROOT_SUFFIX: &str = ".root.json";
const ECUS_FILE: &str = "ecus.json";
const MISCONFIGURED_FILE: &str = "misconfigured_ecus.json";
const INSTALLED_FILE: &str = "installed_versions.json";

#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    /// Open (and create if needed) storage rooted at `path`.
    pub fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = path.into();
        for repo in [RepositoryType::Director, RepositoryType::Image] {
            fs::create_dir_all(root.join("metadata").join(repo.as_str()))?;
        }
        fs::create_dir_all(root.join("targets"))?;
        log::info!("STORAGE_OPENED path={}", root.display());
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    fn meta_dir(&self, repo: RepositoryType) -> PathBuf {
        self.root.join("metadata").join(repo.as_str())
    }

    fn target_path(&self, filename: &str) -> StorageResult<PathBuf> {
        validate_target_filename(filename)?;
        Ok(self.root.join("targets").join(filename))
    }

    fn staged_path(&self, filename: &str) -> StorageResult<PathBuf> {
        validate_target_filename(filename)?;
        Ok(self.root.join("targets").join(format!(".{}.part", filename)))
    }

    fn write_atomic(path: &Path, data: &[u8]) -> StorageResult<()> {
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn read_optional(path: &Path) -> StorageResult<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store_record<T: Serialize + ?Sized>(&self, name: &str, record: &T) -> StorageResult<()> {
        let data = serde_json::to_vec_pretty(record)?;
        Self::write_atomic(&self.root.join(name), &data)
    }

    fn load_record<T: DeserializeOwned>(&self, name: &str) -> StorageResult<Option<T>> {
        match Self::read_optional(&self.root.join(name))? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    fn remove_if_exists(path: &Path) -> StorageResult<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Parse `<version>.root.json`.
fn root_version_of(file_name: &str) -> Option<Version> {
    file_name.strip_suffix(ROOT_SUFFIX)?.parse().ok()
}

impl Storage for FsStorage {
    fn store_root(&self, repo: RepositoryType, version: Version, raw: &[u8]) -> StorageResult<()> {
        let path = self.meta_dir(repo).join(format!("{}{}", version, ROOT_SUFFIX));
        Self::write_atomic(&path, raw)?;
        log::debug!("STORAGE_ROOT_STORED repo={} version={}", repo, version);
        Ok(())
    }

    fn load_root(&self, repo: RepositoryType, version: Version) -> StorageResult<Option<Vec<u8>>> {
        Self::read_optional(&self.meta_dir(repo).join(format!("{}{}", version, ROOT_SUFFIX)))
    }

    fn latest_root_version(&self, repo: RepositoryType) -> StorageResult<Option<Version>> {
        let mut latest = None;
        for entry in fs::read_dir(self.meta_dir(repo))? {
            let entry = entry?;
            if let Some(version) = entry.file_name().to_str().and_then(root_version_of) {
                latest = latest.max(Some(version));
            }
        }
        Ok(latest)
    }

    fn store_non_root(&self, repo: RepositoryType, role: Role, raw: &[u8]) -> StorageResult<()> {
        let path = self.meta_dir(repo).join(format!("{}.json", role));
        Self::write_atomic(&path, raw)
    }

    fn load_non_root(&self, repo: RepositoryType, role: Role) -> StorageResult<Option<Vec<u8>>> {
        Self::read_optional(&self.meta_dir(repo).join(format!("{}.json", role)))
    }

    fn clear_non_root_meta(&self, repo: RepositoryType) -> StorageResult<()> {
        for role in [Role::Targets, Role::Snapshot, Role::Timestamp] {
            Self::remove_if_exists(&self.meta_dir(repo).join(format!("{}.json", role)))?;
        }
        log::info!("STORAGE_NON_ROOT_CLEARED repo={}", repo);
        Ok(())
    }

    fn store_ecu_serials(&self, ecus: &[Ecu]) -> StorageResult<()> {
        self.store_record(ECUS_FILE, ecus)
    }

    fn load_ecu_serials(&self) -> StorageResult<Option<Vec<Ecu>>> {
        self.load_record(ECUS_FILE)
    }

    fn store_misconfigured_ecus(&self, ecus: &[MisconfiguredEcu]) -> StorageResult<()> {
        self.store_record(MISCONFIGURED_FILE, ecus)
    }

    fn load_misconfigured_ecus(&self) -> StorageResult<Vec<MisconfiguredEcu>> {
        Ok(self.load_record(MISCONFIGURED_FILE)?.unwrap_or_default())
    }

    fn store_installed_versions(&self, records: &[InstalledVersionRecord]) -> StorageResult<()> {
        self.store_record(INSTALLED_FILE, records)
    }

    fn load_installed_versions(&self) -> StorageResult<Option<Vec<InstalledVersionRecord>>> {
        self.load_record(INSTALLED_FILE)
    }

    fn stage_target(&self, filename: &str) -> StorageResult<Box<dyn Write + Send>> {
        let path = self.staged_path(filename)?;
        Ok(Box::new(File::create(path)?))
    }

    fn commit_target(&self, filename: &str) -> StorageResult<()> {
        fs::rename(self.staged_path(filename)?, self.target_path(filename)?)?;
        Ok(())
    }

    fn discard_target(&self, filename: &str) -> StorageResult<()> {
        Self::remove_if_exists(&self.staged_path(filename)?)
    }

    fn open_target(&self, filename: &str) -> StorageResult<Option<Box<dyn Read + Send>>> {
        match File::open(self.target_path(filename)?) {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_target(&self, filename: &str) -> StorageResult<()> {
        Self::remove_if_exists(&self.target_path(filename)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecu::{EcuSerial, HardwareIdentifier};
    use crate::storage::StorageError;

    fn storage() -> (tempfile::TempDir, FsStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::open(dir.path()).unwrap();
        (dir, storage)
    }

    #[test]
    fn test_latest_root_version() {
        let (_dir, storage) = storage();
        assert_eq!(storage.latest_root_version(RepositoryType::Director).unwrap(), None);

        storage.store_root(RepositoryType::Director, 1, b"r1").unwrap();
        storage.store_root(RepositoryType::Director, 3, b"r3").unwrap();
        storage.store_root(RepositoryType::Director, 2, b"r2").unwrap();
        storage.store_root(RepositoryType::Image, 7, b"i7").unwrap();

        assert_eq!(storage.latest_root_version(RepositoryType::Director).unwrap(), Some(3));
        assert_eq!(storage.latest_root_version(RepositoryType::Image).unwrap(), Some(7));
        assert_eq!(
            storage.load_root(RepositoryType::Director, 2).unwrap().as_deref(),
            Some(&b"r2"[..])
        );
    }

    #[test]
    fn test_non_root_clear_keeps_roots() {
        let (_dir, storage) = storage();
        storage.store_root(RepositoryType::Image, 1, b"root").unwrap();
        storage.store_non_root(RepositoryType::Image, Role::Targets, b"t").unwrap();
        storage.store_non_root(RepositoryType::Image, Role::Timestamp, b"ts").unwrap();

        storage.clear_non_root_meta(RepositoryType::Image).unwrap();
        // clearing twice is fine
        storage.clear_non_root_meta(RepositoryType::Image).unwrap();

        assert!(storage.load_non_root(RepositoryType::Image, Role::Targets).unwrap().is_none());
        assert!(storage.load_root(RepositoryType::Image, 1).unwrap().is_some());
    }

    #[test]
    fn test_staged_target_invisible_until_commit() {
        let (_dir, storage) = storage();
        {
            let mut writer = storage.stage_target("fw.bin").unwrap();
            writer.write_all(b"image").unwrap();
        }
        assert!(storage.open_target("fw.bin").unwrap().is_none());

        storage.commit_target("fw.bin").unwrap();
        let mut content = Vec::new();
        storage
            .open_target("fw.bin")
            .unwrap()
            .unwrap()
            .read_to_end(&mut content)
            .unwrap();
        assert_eq!(content, b"image");

        storage.remove_target("fw.bin").unwrap();
        assert!(storage.open_target("fw.bin").unwrap().is_none());
    }

    #[test]
    fn test_discard_staged_target() {
        let (_dir, storage) = storage();
        storage.stage_target("fw.bin").unwrap().write_all(b"bad").unwrap();
        storage.discard_target("fw.bin").unwrap();
        assert!(storage.commit_target("fw.bin").is_err());
    }

    #[test]
    fn test_traversal_filename_rejected() {
        let (_dir, storage) = storage();
        assert!(matches!(
            storage.stage_target("../escape.bin"),
            Err(StorageError::InvalidName(_))
        ));
    }

    #[test]
    fn test_installed_versions_absent_until_stored() {
        let (_dir, storage) = storage();
        assert!(storage.load_installed_versions().unwrap().is_none());
        storage.store_installed_versions(&[]).unwrap();
        assert_eq!(storage.load_installed_versions().unwrap(), Some(Vec::new()));
    }

    #[test]
    fn test_ecu_serials_round_trip() {
        let (_dir, storage) = storage();
        let ecus = vec![Ecu::primary(EcuSerial::new("P1"), HardwareIdentifier::new("hw"))];
        storage.store_ecu_serials(&ecus).unwrap();
        assert_eq!(storage.load_ecu_serials().unwrap(), Some(ecus));
        assert!(storage.load_misconfigured_ecus().unwrap().is_empty());
    }
}

//! Installer collaborator.
//!
//! Applies a verified image on the primary and reports what is installed.

use std::fs;
use std::io;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::metadata::Target;
use crate::storage::Storage;

/// Reason codes carried in manifests and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstallErrorCode {
    DownloadFailed,
    VerificationFailed,
    InstallFailed,
    SecondaryUnreachable,
    SecondaryRejected,
    InternalError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallFailure {
    pub code: InstallErrorCode,
    pub reason: String,
}

impl InstallFailure {
    pub fn new(code: InstallErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// Result of installing one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InstallOutcome {
    Success,
    Failure(InstallFailure),
    AlreadyInstalled,
}

impl InstallOutcome {
    pub fn failure(code: InstallErrorCode, reason: impl Into<String>) -> Self {
        InstallOutcome::Failure(InstallFailure::new(code, reason))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, InstallOutcome::Success | InstallOutcome::AlreadyInstalled)
    }
}

pub trait PackageManager: Send + Sync {
    fn name(&self) -> &str;

    /// Install a committed, verified target read from `storage`.
    fn install(&self, target: &Target, storage: &dyn Storage) -> InstallOutcome;

    /// What is currently installed on the primary, if known.
    fn installed_target(&self) -> Option<Target>;
}

/// Copies the image to a fixed firmware path.
///
/// Suitable for devices where "installing" is handing one image file to a
/// bootloader or an external updater that watches the path.
pub struct FileInstaller {
    firmware_path: PathBuf,
    current: Mutex<Option<Target>>,
}

impl FileInstaller {
    pub fn new(firmware_path: impl Into<PathBuf>, current: Option<Target>) -> Self {
        Self {
            firmware_path: firmware_path.into(),
            current: Mutex::new(current),
        }
    }

    fn copy_image(&self, target: &Target, storage: &dyn Storage) -> io::Result<bool> {
        let reader = storage
            .open_target(&target.filename)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        let Some(mut reader) = reader else {
            return Ok(false);
        };
        let tmp = self.firmware_path.with_extension("new");
        {
            let mut file = fs::File::create(&tmp)?;
            io::copy(&mut reader, &mut file)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.firmware_path)?;
        Ok(true)
    }
}

impl PackageManager for FileInstaller {
    fn name(&self) -> &str {
        "file"
    }

    fn install(&self, target: &Target, storage: &dyn Storage) -> InstallOutcome {
        if let Some(current) = self.current.lock().as_ref() {
            if current.same_content(target) {
                return InstallOutcome::AlreadyInstalled;
            }
        }

        match self.copy_image(target, storage) {
            Ok(true) => {
                log::info!(
                    "INSTALL_COMPLETE installer=file filename={} path={}",
                    target.filename,
                    self.firmware_path.display()
                );
                *self.current.lock() = Some(target.clone());
                InstallOutcome::Success
            }
            Ok(false) => InstallOutcome::failure(
                InstallErrorCode::InstallFailed,
                format!("{} not present in storage", target.filename),
            ),
            Err(e) => {
                log::warn!("INSTALL_FAILED installer=file filename={} error={}", target.filename, e);
                InstallOutcome::failure(InstallErrorCode::InstallFailed, e.to_string())
            }
        }
    }

    fn installed_target(&self) -> Option<Target> {
        self.current.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::hash_content;
    use crate::storage::FsStorage;
    use std::collections::BTreeMap;
    use std::io::Write;

    fn staged(storage: &FsStorage, name: &str, content: &[u8]) -> Target {
        storage.stage_target(name).unwrap().write_all(content).unwrap();
        storage.commit_target(name).unwrap();
        let (length, hashes) = hash_content(content);
        Target {
            filename: name.to_string(),
            length,
            hashes,
            ecus: BTreeMap::new(),
            hardware_ids: Vec::new(),
        }
    }

    #[test]
    fn test_install_copies_image() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::open(dir.path().join("storage")).unwrap();
        let target = staged(&storage, "fw.bin", b"firmware");
        let installer = FileInstaller::new(dir.path().join("firmware.img"), None);

        assert_eq!(installer.install(&target, &storage), InstallOutcome::Success);
        assert_eq!(fs::read(dir.path().join("firmware.img")).unwrap(), b"firmware");
        assert_eq!(installer.installed_target(), Some(target.clone()));

        // same content under another name is already installed
        let mut renamed = target.clone();
        renamed.filename = "other.bin".to_string();
        assert_eq!(installer.install(&renamed, &storage), InstallOutcome::AlreadyInstalled);
    }

    #[test]
    fn test_install_missing_image_fails() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::open(dir.path().join("storage")).unwrap();
        let installer = FileInstaller::new(dir.path().join("firmware.img"), None);
        let (length, hashes) = hash_content(b"x");
        let target = Target {
            filename: "absent.bin".to_string(),
            length,
            hashes,
            ecus: BTreeMap::new(),
            hardware_ids: Vec::new(),
        };

        assert!(matches!(
            installer.install(&target, &storage),
            InstallOutcome::Failure(InstallFailure {
                code: InstallErrorCode::InstallFailed,
                ..
            })
        ));
        assert!(installer.installed_target().is_none());
    }
}

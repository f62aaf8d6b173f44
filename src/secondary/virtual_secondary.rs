//! In-process secondary.
//!
//! Behaves like a full-verification secondary: it keeps its own Director
//! and Image verifiers, decides its own assignment from the metadata it
//! verified, checks image bytes against that assignment and writes the
//! firmware to a file.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use ed25519_dalek::{SigningKey, VerifyingKey};
use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::ecu::{Ecu, EcuRegistry, EcuSerial, HardwareIdentifier};
use crate::interfaces::{InstallErrorCode, InstallOutcome};
use crate::manifest::EcuVersionManifest;
use crate::metadata::{ContentHasher, RepositoryType, Target, Version};
use crate::reconcile::{compute_ecu_targets, is_installed};
use crate::repository::RepositoryVerifier;

use super::interface::{SecondaryError, SecondaryInterface, UptaneBundle};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

struct VirtualState {
    director: RepositoryVerifier,
    image: RepositoryVerifier,
    /// Assignment derived from the last verified Director metadata.
    pending: Option<Target>,
    installed: Option<Target>,
    last_result: Option<InstallOutcome>,
    report_counter: u64,
}

impl VirtualState {
    fn verifier(&mut self, repo: RepositoryType) -> &mut RepositoryVerifier {
        match repo {
            RepositoryType::Director => &mut self.director,
            RepositoryType::Image => &mut self.image,
        }
    }
}

pub struct VirtualSecondary {
    serial: EcuSerial,
    hardware_id: HardwareIdentifier,
    key: SigningKey,
    firmware_path: PathBuf,
    state: Mutex<VirtualState>,
}

/// Describe the firmware file currently at `path`, if any.
fn describe_firmware(path: &Path) -> io::Result<Option<Target>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut hasher = ContentHasher::new();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let (length, hashes) = hasher.finish();
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(Some(Target {
        filename,
        length,
        hashes,
        ecus: Default::default(),
        hardware_ids: Vec::new(),
    }))
}

/// Read a hex Ed25519 seed from `path`, creating one if the file is absent.
pub fn load_or_create_key(path: &Path) -> io::Result<SigningKey> {
    match fs::read_to_string(path) {
        Ok(text) => {
            let bytes = hex::decode(text.trim())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let seed: [u8; 32] = bytes.try_into().map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "key seed must be 32 bytes")
            })?;
            Ok(SigningKey::from_bytes(&seed))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let mut hasher = Sha256::new();
            hasher.update(Uuid::new_v4().as_bytes());
            hasher.update(Uuid::new_v4().as_bytes());
            let digest = hasher.finalize();
            let mut seed = [0u8; 32];
            seed.copy_from_slice(&digest);

            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, hex::encode(seed))?;
            log::info!("SIGNING_KEY_CREATED path={}", path.display());
            Ok(SigningKey::from_bytes(&seed))
        }
        Err(e) => Err(e),
    }
}

impl VirtualSecondary {
    pub fn new(
        serial: EcuSerial,
        hardware_id: HardwareIdentifier,
        key: SigningKey,
        firmware_path: impl Into<PathBuf>,
    ) -> io::Result<Self> {
        let firmware_path = firmware_path.into();
        let installed = describe_firmware(&firmware_path)?;
        Ok(Self {
            serial,
            hardware_id,
            key,
            firmware_path,
            state: Mutex::new(VirtualState {
                director: RepositoryVerifier::director(),
                image: RepositoryVerifier::image(),
                pending: None,
                installed,
                last_result: None,
                report_counter: 0,
            }),
        })
    }

    pub fn installed(&self) -> Option<Target> {
        self.state.lock().installed.clone()
    }

    pub fn firmware_path(&self) -> &Path {
        &self.firmware_path
    }

    fn write_firmware(&self, expected: &Target, content: &mut dyn Read) -> Result<(), SecondaryError> {
        let part = self.firmware_path.with_extension("part");
        let result = (|| -> io::Result<(u64, crate::metadata::Hashes)> {
            if let Some(parent) = part.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&part)?;
            let mut hasher = ContentHasher::new();
            // One byte past the declared length is enough to detect overflow.
            let mut limited = content.take(expected.length.saturating_add(1));
            let mut buf = vec![0u8; COPY_BUFFER_SIZE];
            loop {
                let n = limited.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                out.write_all(&buf[..n])?;
            }
            out.sync_all()?;
            Ok(hasher.finish())
        })();

        let (length, hashes) = match result {
            Ok(measured) => measured,
            Err(e) => {
                let _ = fs::remove_file(&part);
                return Err(SecondaryError::Rejected(format!("writing firmware: {}", e)));
            }
        };

        if !expected.matches_content(length, &hashes) {
            let _ = fs::remove_file(&part);
            return Err(SecondaryError::Rejected(format!(
                "image {} does not match its verified description",
                expected.filename
            )));
        }

        fs::rename(&part, &self.firmware_path)
            .map_err(|e| SecondaryError::Rejected(format!("committing firmware: {}", e)))
    }
}

impl SecondaryInterface for VirtualSecondary {
    fn serial(&self) -> &EcuSerial {
        &self.serial
    }

    fn hardware_id(&self) -> &HardwareIdentifier {
        &self.hardware_id
    }

    fn public_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    fn root_version(&self, repo: RepositoryType) -> Result<Version, SecondaryError> {
        Ok(self.state.lock().verifier(repo).root_version().unwrap_or(0))
    }

    fn put_root(&self, repo: RepositoryType, raw: &[u8]) -> Result<(), SecondaryError> {
        let mut state = self.state.lock();
        let verifier = state.verifier(repo);
        let result = if verifier.root_version().is_none() {
            verifier.load_trusted_root(raw)
        } else {
            verifier.verify_root(raw).map(|_| ())
        };
        result.map_err(|e| SecondaryError::Rejected(format!("{} root: {}", repo, e)))
    }

    fn send_metadata(&self, bundle: &UptaneBundle) -> Result<(), SecondaryError> {
        let mut state = self.state.lock();
        let now = Utc::now();

        let mut director = state.director.clone();
        let mut image = state.image.clone();
        director
            .verify_bundle(&bundle.director, now)
            .map_err(|e| SecondaryError::Rejected(format!("director metadata: {}", e)))?;
        image
            .verify_bundle(&bundle.image, now)
            .map_err(|e| SecondaryError::Rejected(format!("image metadata: {}", e)))?;

        let pending = {
            let director_targets = director.current_targets().ok_or_else(|| {
                SecondaryError::Rejected("director metadata incomplete".to_string())
            })?;
            let registry = EcuRegistry::new(Ecu::primary(self.serial.clone(), self.hardware_id.clone()));
            let plan = compute_ecu_targets(director_targets, image.current_targets(), &registry);
            if let Some(e) = plan.inconsistencies.iter().find(|e| e.serial() == &self.serial) {
                return Err(SecondaryError::Rejected(e.to_string()));
            }
            plan.assignments.get(&self.serial).cloned()
        };

        state.director = director;
        state.image = image;
        state.pending = pending;
        Ok(())
    }

    fn send_image(&self, target: &Target, content: &mut dyn Read) -> Result<(), SecondaryError> {
        let mut state = self.state.lock();
        let expected = state.pending.clone().ok_or_else(|| {
            SecondaryError::Rejected("no image assigned by verified metadata".to_string())
        })?;
        if !expected.same_content(target) {
            return Err(SecondaryError::Rejected(format!(
                "offered image {} is not the assigned one",
                target.filename
            )));
        }

        if is_installed(state.installed.as_ref(), &expected) {
            state.last_result = Some(InstallOutcome::AlreadyInstalled);
            state.pending = None;
            return Ok(());
        }

        match self.write_firmware(&expected, content) {
            Ok(()) => {
                log::info!(
                    "VIRTUAL_SECONDARY_INSTALLED serial={} filename={}",
                    self.serial,
                    expected.filename
                );
                state.installed = Some(expected);
                state.pending = None;
                state.last_result = Some(InstallOutcome::Success);
                Ok(())
            }
            Err(e) => {
                state.last_result = Some(InstallOutcome::failure(
                    InstallErrorCode::VerificationFailed,
                    e.to_string(),
                ));
                Err(e)
            }
        }
    }

    fn manifest(&self) -> Result<Value, SecondaryError> {
        let mut state = self.state.lock();
        state.report_counter += 1;
        let mut manifest = EcuVersionManifest::new(
            self.serial.clone(),
            self.hardware_id.clone(),
            state.installed.as_ref(),
        );
        manifest.report_counter = state.report_counter;
        manifest.installation_result = state.last_result.clone();
        Ok(manifest.sign(&self.key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{director_targets, image_targets, key, target_for, TestRepository};
    use std::io::Cursor;

    struct Fixture {
        _dir: tempfile::TempDir,
        secondary: VirtualSecondary,
        director: TestRepository,
        image: TestRepository,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let secondary = VirtualSecondary::new(
            EcuSerial::new("S1"),
            HardwareIdentifier::new("ecu-a"),
            key(70),
            dir.path().join("firmware.bin"),
        )
        .unwrap();
        let director = TestRepository::director(10);
        let image = TestRepository::image(20);
        secondary.put_root(RepositoryType::Director, &director.root(1)).unwrap();
        secondary.put_root(RepositoryType::Image, &image.root(1)).unwrap();
        Fixture {
            _dir: dir,
            secondary,
            director,
            image,
        }
    }

    fn bundle(f: &Fixture, content: &[u8], hardware_id: &str) -> UptaneBundle {
        UptaneBundle {
            director: f
                .director
                .bundle(1, director_targets(&[("fw.bin", content, "S1", hardware_id)])),
            image: f.image.bundle(1, image_targets(&[("fw.bin", content)])),
        }
    }

    #[test]
    fn test_verified_install_and_manifest() {
        let f = fixture();
        let content = b"secondary firmware".to_vec();
        f.secondary.send_metadata(&bundle(&f, &content, "ecu-a")).unwrap();

        let target = target_for("fw.bin", &content);
        f.secondary
            .send_image(&target, &mut Cursor::new(content.clone()))
            .unwrap();
        assert_eq!(fs::read(f.secondary.firmware_path()).unwrap(), content);

        let envelope = f.secondary.manifest().unwrap();
        let manifest = EcuVersionManifest::verify(&envelope, &f.secondary.public_key()).unwrap();
        assert_eq!(manifest.ecu_serial, EcuSerial::new("S1"));
        assert!(manifest.installed_target().unwrap().same_content(&target));
        assert_eq!(manifest.installation_result, Some(InstallOutcome::Success));
    }

    #[test]
    fn test_corrupt_image_rejected() {
        let f = fixture();
        let content = b"secondary firmware".to_vec();
        f.secondary.send_metadata(&bundle(&f, &content, "ecu-a")).unwrap();

        let target = target_for("fw.bin", &content);
        let result = f
            .secondary
            .send_image(&target, &mut Cursor::new(b"secondary firmwarX".to_vec()));
        assert!(matches!(result, Err(SecondaryError::Rejected(_))));
        assert!(f.secondary.installed().is_none());
        assert!(!f.secondary.firmware_path().exists());
    }

    #[test]
    fn test_max_length_firmware_rejected_without_overflow() {
        let f = fixture();
        let mut target = target_for("fw.bin", b"tiny");
        target.length = u64::MAX;

        let result = f.secondary.write_firmware(&target, &mut Cursor::new(b"tiny".to_vec()));
        assert!(matches!(result, Err(SecondaryError::Rejected(_))));
        assert!(!f.secondary.firmware_path().exists());
    }

    #[test]
    fn test_unassigned_image_rejected() {
        let f = fixture();
        let content = b"other".to_vec();
        let result = f
            .secondary
            .send_image(&target_for("fw.bin", &content), &mut Cursor::new(content.clone()));
        assert!(matches!(result, Err(SecondaryError::Rejected(_))));
    }

    #[test]
    fn test_wrong_hardware_metadata_rejected() {
        let f = fixture();
        let result = f.secondary.send_metadata(&bundle(&f, b"fw", "ecu-b"));
        assert!(matches!(result, Err(SecondaryError::Rejected(_))));
    }

    #[test]
    fn test_tampered_metadata_rejected() {
        let f = fixture();
        let mut tampered = bundle(&f, b"fw", "ecu-a");
        let evil = director_targets(&[("fw.bin", &b"evil"[..], "S1", "ecu-a")]);
        tampered.director.targets = Some(TestRepository::director(90).targets(2, evil));

        assert!(f.secondary.send_metadata(&tampered).is_err());
        assert_eq!(f.secondary.root_version(RepositoryType::Director).unwrap(), 1);
    }

    #[test]
    fn test_key_seed_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("s1.seed");
        let first = load_or_create_key(&path).unwrap();
        let second = load_or_create_key(&path).unwrap();
        assert_eq!(first.verifying_key(), second.verifying_key());
    }
}

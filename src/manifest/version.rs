//! ECU version manifest.
//!
//! What one ECU reports about itself: its identity, the image it runs and
//! the outcome of its last installation. Each ECU signs its own manifest.

use std::collections::BTreeMap;

use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ecu::{EcuSerial, HardwareIdentifier};
use crate::interfaces::InstallOutcome;
use crate::metadata::{sign_document, verify_single_signer, Hashes, Target, VerificationError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub length: u64,
    pub hashes: Hashes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledImage {
    pub filepath: String,
    pub fileinfo: FileInfo,
}

impl InstalledImage {
    pub fn from_target(target: &Target) -> Self {
        Self {
            filepath: target.filename.clone(),
            fileinfo: FileInfo {
                length: target.length,
                hashes: target.hashes.clone(),
            },
        }
    }

    pub fn to_target(&self) -> Target {
        Target {
            filename: self.filepath.clone(),
            length: self.fileinfo.length,
            hashes: self.fileinfo.hashes.clone(),
            ecus: BTreeMap::new(),
            hardware_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcuVersionManifest {
    pub ecu_serial: EcuSerial,
    pub hardware_id: HardwareIdentifier,
    /// `None` when nothing has ever been installed through this client.
    pub installed_image: Option<InstalledImage>,
    #[serde(default)]
    pub attacks_detected: String,
    #[serde(default)]
    pub report_counter: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installation_result: Option<InstallOutcome>,
}

impl EcuVersionManifest {
    pub fn new(ecu_serial: EcuSerial, hardware_id: HardwareIdentifier, installed: Option<&Target>) -> Self {
        Self {
            ecu_serial,
            hardware_id,
            installed_image: installed.map(InstalledImage::from_target),
            attacks_detected: String::new(),
            report_counter: 0,
            installation_result: None,
        }
    }

    pub fn installed_target(&self) -> Option<Target> {
        self.installed_image.as_ref().map(InstalledImage::to_target)
    }

    pub fn sign(&self, key: &SigningKey) -> Value {
        // Serializing a struct of plain fields into a Value cannot fail.
        let signed = serde_json::to_value(self).unwrap_or(Value::Null);
        sign_document(signed, &[key])
    }

    /// Verify `envelope` against `key` and parse its body.
    pub fn verify(envelope: &Value, key: &VerifyingKey) -> Result<Self, VerificationError> {
        let signed = verify_single_signer(envelope, key)?;
        serde_json::from_value(signed)
            .map_err(|e| VerificationError::malformed(format!("ecu manifest body: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{key, target_for};

    #[test]
    fn test_sign_and_verify_manifest() {
        let signer = key(40);
        let target = target_for("fw.bin", b"firmware");
        let mut manifest = EcuVersionManifest::new(
            EcuSerial::new("S1"),
            HardwareIdentifier::new("ecu-a"),
            Some(&target),
        );
        manifest.installation_result = Some(InstallOutcome::Success);

        let envelope = manifest.sign(&signer);
        assert_eq!(envelope["signed"]["installed_image"]["filepath"], "fw.bin");

        let verified = EcuVersionManifest::verify(&envelope, &signer.verifying_key()).unwrap();
        assert_eq!(verified, manifest);
        assert!(verified.installed_target().unwrap().same_content(&target));
        assert!(EcuVersionManifest::verify(&envelope, &key(41).verifying_key()).is_err());
    }

    #[test]
    fn test_never_installed_is_null() {
        let manifest = EcuVersionManifest::new(EcuSerial::new("S1"), HardwareIdentifier::new("ecu-a"), None);
        let envelope = manifest.sign(&key(40));
        assert!(envelope["signed"]["installed_image"].is_null());
        assert!(manifest.installed_target().is_none());
    }
}

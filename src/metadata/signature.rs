//! Ed25519 signature verification and threshold counting.
//!
//! Verifies metadata signatures against the keys a trusted root delegates
//! to a role, and signs payloads for manifests.

use std::collections::{BTreeMap, BTreeSet};

use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::error::VerificationError;
use super::types::{Role, RoleKeys};

/// The only signature method this client accepts.
pub const SIGNATURE_METHOD: &str = "ed25519";

/// One detached signature as carried in a document envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureEntry {
    pub keyid: String,
    pub method: String,
    pub sig: String,
}

/// Outcome of checking a single signature.
#[derive(Debug)]
pub struct SignatureVerificationResult {
    pub verified: bool,
    pub keyid: String,
    pub error: Option<String>,
}

impl SignatureVerificationResult {
    pub fn verified(keyid: &str) -> Self {
        Self {
            verified: true,
            keyid: keyid.to_string(),
            error: None,
        }
    }

    pub fn invalid(keyid: &str, error: &str) -> Self {
        Self {
            verified: false,
            keyid: keyid.to_string(),
            error: Some(error.to_string()),
        }
    }
}

/// Key id: lowercase hex SHA-256 of the raw public key bytes.
pub fn compute_key_id(key: &VerifyingKey) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Verify one Ed25519 signature over `payload`.
pub fn verify_signature(
    payload: &[u8],
    entry: &SignatureEntry,
    key: &VerifyingKey,
) -> SignatureVerificationResult {
    if !entry.method.eq_ignore_ascii_case(SIGNATURE_METHOD) {
        return SignatureVerificationResult::invalid(
            &entry.keyid,
            &format!("Unsupported method: {}", entry.method),
        );
    }

    // Standard base64 first, URL-safe as a fallback
    let signature_bytes = general_purpose::STANDARD
        .decode(&entry.sig)
        .or_else(|_| general_purpose::URL_SAFE_NO_PAD.decode(&entry.sig));

    let signature_bytes = match signature_bytes {
        Ok(bytes) => bytes,
        Err(e) => {
            return SignatureVerificationResult::invalid(&entry.keyid, &format!("Decode error: {}", e))
        }
    };

    let signature = match Signature::from_slice(&signature_bytes) {
        Ok(sig) => sig,
        Err(e) => {
            return SignatureVerificationResult::invalid(&entry.keyid, &format!("Parse error: {}", e))
        }
    };

    match key.verify(payload, &signature) {
        Ok(()) => SignatureVerificationResult::verified(&entry.keyid),
        Err(e) => SignatureVerificationResult::invalid(
            &entry.keyid,
            &format!("Verification failed: {}", e),
        ),
    }
}

/// Count distinct valid signatures from keys delegated to `role`.
///
/// Signatures from keys outside the delegation are ignored. Each key id
/// counts at most once. Returns the number of valid signatures when the
/// threshold is met.
pub fn verify_threshold(
    role: Role,
    payload: &[u8],
    signatures: &[SignatureEntry],
    keys: &BTreeMap<String, VerifyingKey>,
    delegation: &RoleKeys,
) -> Result<u32, VerificationError> {
    let mut valid: BTreeSet<&str> = BTreeSet::new();
    let mut bad_keyid: Option<&str> = None;

    for entry in signatures {
        if !delegation.keyids.iter().any(|k| k == &entry.keyid) {
            log::debug!(
                "SIGNATURE_KEY_LOOKUP role={} keyid={} authorized=false",
                role,
                entry.keyid
            );
            continue;
        }
        if valid.contains(entry.keyid.as_str()) {
            continue;
        }
        let Some(key) = keys.get(entry.keyid.as_str()) else {
            log::debug!(
                "SIGNATURE_KEY_LOOKUP role={} keyid={} found=false",
                role,
                entry.keyid
            );
            continue;
        };

        let result = verify_signature(payload, entry, key);
        if result.verified {
            log::debug!("SIGNATURE_VERIFY role={} keyid={} valid=true", role, entry.keyid);
            valid.insert(entry.keyid.as_str());
        } else {
            log::warn!(
                "SIGNATURE_INVALID role={} keyid={} error={}",
                role,
                entry.keyid,
                result.error.as_deref().unwrap_or("unknown")
            );
            bad_keyid.get_or_insert(entry.keyid.as_str());
        }
    }

    let valid_count = valid.len() as u32;
    if valid_count >= delegation.threshold {
        return Ok(valid_count);
    }

    match bad_keyid {
        Some(keyid) => Err(VerificationError::BadSignature {
            role,
            keyid: keyid.to_string(),
        }),
        None => Err(VerificationError::ThresholdNotMet {
            role,
            required: delegation.threshold,
            valid: valid_count,
        }),
    }
}

/// Sign `payload` with `key`.
pub fn sign_payload(payload: &[u8], key: &SigningKey) -> SignatureEntry {
    let signature = key.sign(payload);
    SignatureEntry {
        keyid: compute_key_id(&key.verifying_key()),
        method: SIGNATURE_METHOD.to_string(),
        sig: general_purpose::STANDARD.encode(signature.to_bytes()),
    }
}

//! Signed document envelope.
//!
//! Every metadata document and every manifest uses the same envelope:
//! `{"signatures": [...], "signed": {...}}`. Signatures cover the canonical
//! serialization of `signed` (compact JSON, object keys sorted).

use chrono::{DateTime, Utc};
use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::Deserialize;
use serde_json::Value;

use super::error::VerificationError;
use super::signature::{sign_payload, verify_signature, verify_threshold, SignatureEntry};
use super::types::{
    parse_root, parse_snapshot, parse_targets, parse_timestamp, Role, Root, Snapshot, Targets,
    Timestamp, Version,
};

/// A role body that can be parsed out of a `signed` section.
pub trait RoleBody: Sized {
    const ROLE: Role;

    fn parse(signed: &Value) -> Result<Self, VerificationError>;
}

impl RoleBody for Root {
    const ROLE: Role = Role::Root;

    fn parse(signed: &Value) -> Result<Self, VerificationError> {
        parse_root(signed)
    }
}

impl RoleBody for Targets {
    const ROLE: Role = Role::Targets;

    fn parse(signed: &Value) -> Result<Self, VerificationError> {
        parse_targets(signed)
    }
}

impl RoleBody for Snapshot {
    const ROLE: Role = Role::Snapshot;

    fn parse(signed: &Value) -> Result<Self, VerificationError> {
        parse_snapshot(signed)
    }
}

impl RoleBody for Timestamp {
    const ROLE: Role = Role::Timestamp;

    fn parse(signed: &Value) -> Result<Self, VerificationError> {
        parse_timestamp(signed)
    }
}

#[derive(Deserialize)]
struct Envelope {
    signatures: Vec<SignatureEntry>,
    signed: Value,
}

#[derive(Deserialize)]
struct CommonFields {
    #[serde(rename = "_type")]
    type_name: String,
    version: Version,
    expires: DateTime<Utc>,
}

/// A parsed, not yet trusted, metadata document.
#[derive(Debug, Clone)]
pub struct SignedDocument<T> {
    pub version: Version,
    pub expires: DateTime<Utc>,
    pub body: T,
    signatures: Vec<SignatureEntry>,
    canonical: Vec<u8>,
    raw: Vec<u8>,
}

impl<T: RoleBody> SignedDocument<T> {
    /// Parse raw bytes. Fails with `RoleMismatch` if the document declares
    /// a different role than `T`.
    pub fn parse(raw: &[u8]) -> Result<Self, VerificationError> {
        let envelope: Envelope = serde_json::from_slice(raw)
            .map_err(|e| VerificationError::malformed(format!("{} envelope: {}", T::ROLE, e)))?;

        let common: CommonFields = serde_json::from_value(envelope.signed.clone())
            .map_err(|e| VerificationError::malformed(format!("{} header: {}", T::ROLE, e)))?;

        if Role::from_name(&common.type_name) != Some(T::ROLE) {
            return Err(VerificationError::RoleMismatch {
                expected: T::ROLE,
                found: common.type_name,
            });
        }

        let body = T::parse(&envelope.signed)?;

        Ok(Self {
            version: common.version,
            expires: common.expires,
            body,
            signatures: envelope.signatures,
            canonical: canonical_json(&envelope.signed),
            raw: raw.to_vec(),
        })
    }

    pub fn role(&self) -> Role {
        T::ROLE
    }

    /// Check the signatures against the keys `root` delegates to this role.
    pub fn verify_signatures(&self, root: &Root) -> Result<u32, VerificationError> {
        let delegation = root.role_keys(T::ROLE)?;
        verify_threshold(
            T::ROLE,
            &self.canonical,
            &self.signatures,
            root.keys(),
            delegation,
        )
    }

    pub fn check_expiry(&self, now: DateTime<Utc>) -> Result<(), VerificationError> {
        if self.expires <= now {
            return Err(VerificationError::Expired {
                role: T::ROLE,
                expires: self.expires,
            });
        }
        Ok(())
    }

    /// Versions never regress. Equal versions are accepted so a re-fetch of
    /// the same document is idempotent.
    pub fn check_version(&self, trusted: Option<Version>) -> Result<(), VerificationError> {
        match trusted {
            Some(trusted) if self.version < trusted => Err(VerificationError::VersionRollback {
                role: T::ROLE,
                trusted,
                received: self.version,
            }),
            _ => Ok(()),
        }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

/// Canonical serialization: compact JSON with object keys in sorted order.
pub fn canonical_json(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                out.extend_from_slice(Value::from(key.as_str()).to_string().as_bytes());
                out.push(b':');
                write_canonical(&map[key], out);
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        scalar => out.extend_from_slice(scalar.to_string().as_bytes()),
    }
}

/// Wrap `signed` in an envelope signed by every key in `keys`.
pub fn sign_document(signed: Value, keys: &[&SigningKey]) -> Value {
    let payload = canonical_json(&signed);
    let signatures: Vec<SignatureEntry> = keys.iter().map(|k| sign_payload(&payload, k)).collect();
    serde_json::json!({ "signatures": signatures, "signed": signed })
}

/// Verify an envelope signed by a single known key (ECU manifests) and
/// return its `signed` section.
pub fn verify_single_signer(
    envelope: &Value,
    key: &VerifyingKey,
) -> Result<Value, VerificationError> {
    let envelope: Envelope = serde_json::from_value(envelope.clone())
        .map_err(|e| VerificationError::malformed(format!("manifest envelope: {}", e)))?;
    let payload = canonical_json(&envelope.signed);
    let keyid = super::signature::compute_key_id(key);

    let entry = envelope
        .signatures
        .iter()
        .find(|s| s.keyid == keyid)
        .ok_or_else(|| VerificationError::malformed(format!("no signature by key {}", keyid)))?;

    let result = verify_signature(&payload, entry, key);
    if !result.verified {
        return Err(VerificationError::malformed(format!(
            "manifest signature by {} invalid: {}",
            keyid,
            result.error.unwrap_or_default()
        )));
    }
    Ok(envelope.signed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::types::encode_public_key;
    use crate::metadata::signature::compute_key_id;
    use chrono::Duration;
    use serde_json::json;

    fn root_signed(key: &SigningKey, version: Version, expires: DateTime<Utc>) -> Value {
        let id = compute_key_id(&key.verifying_key());
        json!({
            "_type": "Root",
            "version": version,
            "expires": expires.to_rfc3339(),
            "keys": { id.clone(): encode_public_key(&key.verifying_key()) },
            "roles": { "root": { "keyids": [id], "threshold": 1 } }
        })
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let value = json!({ "b": 1, "a": { "d": [1, "x"], "c": null } });
        assert_eq!(
            String::from_utf8(canonical_json(&value)).unwrap(),
            r#"{"a":{"c":null,"d":[1,"x"]},"b":1}"#
        );
    }

    #[test]
    fn test_parse_and_self_verify_root() {
        let key = SigningKey::from_bytes(&[9u8; 32]);
        let doc = sign_document(root_signed(&key, 1, Utc::now() + Duration::days(1)), &[&key]);
        let raw = serde_json::to_vec(&doc).unwrap();

        let parsed = SignedDocument::<Root>::parse(&raw).unwrap();
        assert_eq!(parsed.version, 1);
        assert_eq!(parsed.verify_signatures(&parsed.body), Ok(1));
        assert!(parsed.check_expiry(Utc::now()).is_ok());
    }

    #[test]
    fn test_role_mismatch() {
        let key = SigningKey::from_bytes(&[9u8; 32]);
        let doc = sign_document(root_signed(&key, 1, Utc::now()), &[&key]);
        let raw = serde_json::to_vec(&doc).unwrap();

        let result = SignedDocument::<Targets>::parse(&raw);
        assert!(matches!(
            result,
            Err(VerificationError::RoleMismatch { expected: Role::Targets, .. })
        ));
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            SignedDocument::<Root>::parse(b"not json"),
            Err(VerificationError::MalformedDocument(_))
        ));
    }

    #[test]
    fn test_expired_and_rollback() {
        let key = SigningKey::from_bytes(&[9u8; 32]);
        let doc = sign_document(root_signed(&key, 3, Utc::now() - Duration::days(1)), &[&key]);
        let parsed = SignedDocument::<Root>::parse(&serde_json::to_vec(&doc).unwrap()).unwrap();

        assert!(matches!(
            parsed.check_expiry(Utc::now()),
            Err(VerificationError::Expired { .. })
        ));
        assert!(parsed.check_version(Some(3)).is_ok());
        assert_eq!(
            parsed.check_version(Some(4)),
            Err(VerificationError::VersionRollback {
                role: Role::Root,
                trusted: 4,
                received: 3
            })
        );
    }

    #[test]
    fn test_tampered_body_fails_signature() {
        let key = SigningKey::from_bytes(&[9u8; 32]);
        let mut doc = sign_document(root_signed(&key, 1, Utc::now()), &[&key]);
        doc["signed"]["version"] = json!(2);
        let parsed = SignedDocument::<Root>::parse(&serde_json::to_vec(&doc).unwrap()).unwrap();
        assert!(matches!(
            parsed.verify_signatures(&parsed.body),
            Err(VerificationError::BadSignature { .. })
        ));
    }

    #[test]
    fn test_verify_single_signer() {
        let key = SigningKey::from_bytes(&[4u8; 32]);
        let other = SigningKey::from_bytes(&[5u8; 32]);
        let doc = sign_document(json!({ "ecu_serial": "S1" }), &[&key]);

        let signed = verify_single_signer(&doc, &key.verifying_key()).unwrap();
        assert_eq!(signed["ecu_serial"], "S1");
        assert!(verify_single_signer(&doc, &other.verifying_key()).is_err());
    }
}

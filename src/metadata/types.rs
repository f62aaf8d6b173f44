//! Typed metadata bodies.
//!
//! Wire shapes are parsed through private `Raw*` structs and converted into
//! validated types, so nothing downstream ever sees an unchecked key,
//! threshold or hash.

use std::collections::BTreeMap;
use std::fmt;

use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ecu::{EcuSerial, HardwareIdentifier};

use super::error::VerificationError;
use super::signature::compute_key_id;

pub type Version = u64;

/// File name under which a snapshot pins the targets metadata.
pub const TARGETS_META_FILE: &str = "targets.json";
/// File name under which a timestamp pins the snapshot metadata.
pub const SNAPSHOT_META_FILE: &str = "snapshot.json";

/// Which of the two independent trust roots a document belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryType {
    Director,
    Image,
}

impl RepositoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepositoryType::Director => "director",
            RepositoryType::Image => "image",
        }
    }
}

impl fmt::Display for RepositoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Root,
    Targets,
    Snapshot,
    Timestamp,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Root => "root",
            Role::Targets => "targets",
            Role::Snapshot => "snapshot",
            Role::Timestamp => "timestamp",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "root" => Some(Role::Root),
            "targets" => Some(Role::Targets),
            "snapshot" => Some(Role::Snapshot),
            "timestamp" => Some(Role::Timestamp),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sha256" => Some(HashAlgorithm::Sha256),
            "sha512" => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
        }
    }
}

/// Algorithm-tagged content digests, hex encoded in lowercase.
pub type Hashes = BTreeMap<HashAlgorithm, String>;

/// Keys and threshold delegated to one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleKeys {
    pub keyids: Vec<String>,
    pub threshold: u32,
}

/// Root body: every key of the repository and the role delegations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Root {
    keys: BTreeMap<String, VerifyingKey>,
    roles: BTreeMap<Role, RoleKeys>,
}

impl Root {
    pub fn keys(&self) -> &BTreeMap<String, VerifyingKey> {
        &self.keys
    }

    pub fn role_keys(&self, role: Role) -> Result<&RoleKeys, VerificationError> {
        self.roles.get(&role).ok_or(VerificationError::MissingRole(role))
    }

    /// Whether the key set or any threshold differs from `other`.
    pub fn keys_differ(&self, other: &Root) -> bool {
        self != other
    }
}

#[derive(Deserialize)]
struct RawKey {
    keytype: String,
    keyval: RawKeyValue,
}

#[derive(Deserialize)]
struct RawKeyValue {
    public: String,
}

#[derive(Deserialize)]
struct RawRoleKeys {
    keyids: Vec<String>,
    threshold: u32,
}

#[derive(Deserialize)]
struct RawRoot {
    keys: BTreeMap<String, RawKey>,
    roles: BTreeMap<String, RawRoleKeys>,
}

/// Decode a base64 Ed25519 public key.
pub fn parse_public_key(public_key_base64: &str) -> Result<VerifyingKey, VerificationError> {
    let key_bytes = general_purpose::STANDARD
        .decode(public_key_base64)
        .map_err(|e| VerificationError::malformed(format!("public key base64: {}", e)))?;

    let key_array: [u8; 32] = key_bytes.try_into().map_err(|bytes: Vec<u8>| {
        VerificationError::malformed(format!(
            "invalid key length: expected 32, got {}",
            bytes.len()
        ))
    })?;

    VerifyingKey::from_bytes(&key_array)
        .map_err(|e| VerificationError::malformed(format!("invalid public key: {}", e)))
}

/// Encode a public key the way root metadata carries it.
pub fn encode_public_key(key: &VerifyingKey) -> Value {
    serde_json::json!({
        "keytype": "ed25519",
        "keyval": { "public": general_purpose::STANDARD.encode(key.to_bytes()) },
    })
}

/// Parse the body of a root document.
pub fn parse_root(signed: &Value) -> Result<Root, VerificationError> {
    let raw: RawRoot = serde_json::from_value(signed.clone())
        .map_err(|e| VerificationError::malformed(format!("root body: {}", e)))?;

    let mut keys = BTreeMap::new();
    for (keyid, raw_key) in raw.keys {
        if !raw_key.keytype.eq_ignore_ascii_case("ed25519") {
            return Err(VerificationError::malformed(format!(
                "unsupported key type {} for key {}",
                raw_key.keytype, keyid
            )));
        }
        let key = parse_public_key(&raw_key.keyval.public)?;
        // A key listed under a foreign id could be counted twice.
        if compute_key_id(&key) != keyid {
            return Err(VerificationError::malformed(format!(
                "key id {} does not match its key",
                keyid
            )));
        }
        keys.insert(keyid, key);
    }

    let mut roles = BTreeMap::new();
    for (name, raw_role) in raw.roles {
        let Some(role) = Role::from_name(&name) else {
            log::debug!("ROOT_PARSE_SKIP_ROLE role={}", name);
            continue;
        };
        if raw_role.threshold == 0 {
            return Err(VerificationError::malformed(format!(
                "threshold of role {} must be at least 1",
                role
            )));
        }
        roles.insert(
            role,
            RoleKeys {
                keyids: raw_role.keyids,
                threshold: raw_role.threshold,
            },
        );
    }

    if !roles.contains_key(&Role::Root) {
        return Err(VerificationError::MissingRole(Role::Root));
    }

    Ok(Root { keys, roles })
}

/// A described software image.
///
/// Identity is the hash set plus length. Filenames are not trusted
/// identifiers and never take part in equality checks between targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub filename: String,
    pub length: u64,
    pub hashes: Hashes,
    /// Director assignments: serial the image is destined for and the
    /// hardware id the Director expects that ECU to have.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ecus: BTreeMap<EcuSerial, HardwareIdentifier>,
    /// Image repository: hardware ids the image is built for.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hardware_ids: Vec<HardwareIdentifier>,
}

impl Target {
    /// Same content as `other`: identical length and identical hash sets.
    pub fn same_content(&self, other: &Target) -> bool {
        self.length == other.length && self.hashes == other.hashes
    }

    pub fn sha256(&self) -> Option<&str> {
        self.hashes.get(&HashAlgorithm::Sha256).map(|h| h.as_str())
    }

    /// Whether measured content satisfies every hash this target declares.
    pub fn matches_content(&self, length: u64, measured: &Hashes) -> bool {
        length == self.length
            && self
                .hashes
                .iter()
                .all(|(alg, expected)| measured.get(alg) == Some(expected))
    }

    /// The `fileinfo` object used in version manifests.
    pub fn file_info(&self) -> Value {
        let hashes: BTreeMap<&str, &str> = self
            .hashes
            .iter()
            .map(|(alg, h)| (alg.as_str(), h.as_str()))
            .collect();
        serde_json::json!({ "length": self.length, "hashes": hashes })
    }
}

#[derive(Deserialize)]
struct RawTarget {
    length: u64,
    hashes: BTreeMap<String, String>,
    #[serde(default)]
    custom: Option<RawTargetCustom>,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTargetCustom {
    #[serde(default)]
    ecu_identifiers: BTreeMap<String, RawEcuIdentifier>,
    #[serde(default)]
    hardware_ids: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEcuIdentifier {
    hardware_id: String,
}

#[derive(Deserialize)]
struct RawTargets {
    targets: BTreeMap<String, RawTarget>,
}

/// Targets body: every target the role describes, by filename.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Targets {
    targets: BTreeMap<String, Target>,
}

impl Targets {
    pub fn get(&self, filename: &str) -> Option<&Target> {
        self.targets.get(filename)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Target> {
        self.targets.values()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

fn parse_hashes(filename: &str, raw: BTreeMap<String, String>) -> Result<Hashes, VerificationError> {
    let mut hashes = Hashes::new();
    for (name, digest) in raw {
        match HashAlgorithm::from_name(&name) {
            Some(alg) => {
                if hex::decode(&digest).is_err() {
                    return Err(VerificationError::malformed(format!(
                        "target {} has a non-hex {} hash",
                        filename, name
                    )));
                }
                hashes.insert(alg, digest.to_ascii_lowercase());
            }
            None => log::debug!("TARGET_HASH_SKIPPED filename={} algorithm={}", filename, name),
        }
    }
    if hashes.is_empty() {
        return Err(VerificationError::malformed(format!(
            "target {} has no supported hash",
            filename
        )));
    }
    Ok(hashes)
}

/// Parse the body of a targets document.
pub fn parse_targets(signed: &Value) -> Result<Targets, VerificationError> {
    let raw: RawTargets = serde_json::from_value(signed.clone())
        .map_err(|e| VerificationError::malformed(format!("targets body: {}", e)))?;

    let mut targets = BTreeMap::new();
    for (filename, raw_target) in raw.targets {
        let hashes = parse_hashes(&filename, raw_target.hashes)?;
        let custom = raw_target.custom.unwrap_or_default();
        let ecus = custom
            .ecu_identifiers
            .into_iter()
            .map(|(serial, id)| (EcuSerial::new(serial), HardwareIdentifier::new(id.hardware_id)))
            .collect();
        let hardware_ids = custom
            .hardware_ids
            .into_iter()
            .map(HardwareIdentifier::new)
            .collect();
        let target = Target {
            filename: filename.clone(),
            length: raw_target.length,
            hashes,
            ecus,
            hardware_ids,
        };
        targets.insert(filename, target);
    }
    Ok(Targets { targets })
}

/// Version (and optionally length/hashes) of a metadata file pinned by a
/// snapshot or timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaFileInfo {
    pub version: Version,
    pub length: Option<u64>,
    pub hashes: Hashes,
}

#[derive(Deserialize)]
struct RawMetaFileInfo {
    version: Version,
    #[serde(default)]
    length: Option<u64>,
    #[serde(default)]
    hashes: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct RawMeta {
    meta: BTreeMap<String, RawMetaFileInfo>,
}

fn parse_meta(signed: &Value, role: Role) -> Result<BTreeMap<String, MetaFileInfo>, VerificationError> {
    let raw: RawMeta = serde_json::from_value(signed.clone())
        .map_err(|e| VerificationError::malformed(format!("{} body: {}", role, e)))?;

    raw.meta
        .into_iter()
        .map(|(name, info)| {
            let hashes = if info.hashes.is_empty() {
                Hashes::new()
            } else {
                parse_hashes(&name, info.hashes)?
            };
            Ok((
                name,
                MetaFileInfo {
                    version: info.version,
                    length: info.length,
                    hashes,
                },
            ))
        })
        .collect()
}

/// Snapshot body: pins the version of the targets metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub targets: MetaFileInfo,
}

pub fn parse_snapshot(signed: &Value) -> Result<Snapshot, VerificationError> {
    let mut meta = parse_meta(signed, Role::Snapshot)?;
    let targets = meta.remove(TARGETS_META_FILE).ok_or_else(|| {
        VerificationError::malformed(format!("snapshot does not describe {}", TARGETS_META_FILE))
    })?;
    Ok(Snapshot { targets })
}

/// Timestamp body: pins the version and content of the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timestamp {
    pub snapshot: MetaFileInfo,
}

pub fn parse_timestamp(signed: &Value) -> Result<Timestamp, VerificationError> {
    let mut meta = parse_meta(signed, Role::Timestamp)?;
    let snapshot = meta.remove(SNAPSHOT_META_FILE).ok_or_else(|| {
        VerificationError::malformed(format!("timestamp does not describe {}", SNAPSHOT_META_FILE))
    })?;
    Ok(Timestamp { snapshot })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_director_target() {
        let signed = json!({
            "targets": {
                "fw-2.0.bin": {
                    "length": 1024,
                    "hashes": { "sha256": "AABB", "md5": "zz" },
                    "custom": { "ecuIdentifiers": { "S1": { "hardwareId": "ecu-a" } } }
                }
            }
        });

        let targets = parse_targets(&signed).unwrap();
        let target = targets.get("fw-2.0.bin").unwrap();
        assert_eq!(target.length, 1024);
        // unknown algorithms dropped, digests normalized to lowercase
        assert_eq!(target.hashes.len(), 1);
        assert_eq!(target.sha256(), Some("aabb"));
        assert_eq!(
            target.ecus.get(&EcuSerial::new("S1")),
            Some(&HardwareIdentifier::new("ecu-a"))
        );
    }

    #[test]
    fn test_target_without_supported_hash_is_malformed() {
        let signed = json!({
            "targets": { "a.bin": { "length": 1, "hashes": { "md5": "00" } } }
        });
        assert!(matches!(
            parse_targets(&signed),
            Err(VerificationError::MalformedDocument(_))
        ));
    }

    #[test]
    fn test_same_content_ignores_filename() {
        let hashes = Hashes::from([(HashAlgorithm::Sha256, "aa".to_string())]);
        let a = Target {
            filename: "a.bin".to_string(),
            length: 10,
            hashes: hashes.clone(),
            ecus: BTreeMap::new(),
            hardware_ids: Vec::new(),
        };
        let mut b = a.clone();
        b.filename = "b.bin".to_string();
        assert!(a.same_content(&b));

        b.length = 11;
        assert!(!a.same_content(&b));
    }

    #[test]
    fn test_root_rejects_mismatched_key_id() {
        let key = ed25519_dalek::SigningKey::from_bytes(&[7u8; 32]).verifying_key();
        let signed = json!({
            "keys": { "not-the-id": encode_public_key(&key) },
            "roles": { "root": { "keyids": ["not-the-id"], "threshold": 1 } }
        });
        assert!(matches!(
            parse_root(&signed),
            Err(VerificationError::MalformedDocument(_))
        ));
    }

    #[test]
    fn test_root_requires_root_role() {
        let signed = json!({ "keys": {}, "roles": {} });
        assert_eq!(
            parse_root(&signed),
            Err(VerificationError::MissingRole(Role::Root))
        );
    }

    #[test]
    fn test_zero_threshold_is_malformed() {
        let signed = json!({
            "keys": {},
            "roles": { "root": { "keyids": [], "threshold": 0 } }
        });
        assert!(matches!(
            parse_root(&signed),
            Err(VerificationError::MalformedDocument(_))
        ));
    }

    #[test]
    fn test_snapshot_pins_targets_version() {
        let signed = json!({ "meta": { "targets.json": { "version": 4 } } });
        assert_eq!(parse_snapshot(&signed).unwrap().targets.version, 4);

        let missing = json!({ "meta": {} });
        assert!(parse_snapshot(&missing).is_err());
    }
}

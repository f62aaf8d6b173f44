//! Test fixtures: signed repositories built from deterministic keys and
//! in-memory collaborators.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{SigningKey, VerifyingKey};
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::ecu::{EcuSerial, HardwareIdentifier};
use crate::interfaces::{FactsKind, FactsProvider, Transport, TransferError};
use crate::metadata::{
    compute_key_id, encode_public_key, hash_content, sign_document, RepositoryType, Role, Target,
    Version,
};
use crate::repository::RepositoryBundle;
use crate::secondary::{SecondaryError, SecondaryInterface, UptaneBundle};
use crate::storage::FsStorage;

pub fn key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

pub fn days_from_now(days: i64) -> DateTime<Utc> {
    Utc::now() + Duration::days(days)
}

pub fn temp_storage() -> (tempfile::TempDir, FsStorage) {
    let dir = tempfile::tempdir().unwrap();
    let storage = FsStorage::open(dir.path().join("storage")).unwrap();
    (dir, storage)
}

fn to_raw(value: &Value) -> Vec<u8> {
    serde_json::to_vec(value).unwrap()
}

fn hashes_json(content: &[u8]) -> (u64, Value) {
    let (length, hashes) = hash_content(content);
    let hashes: BTreeMap<&str, String> = hashes
        .into_iter()
        .map(|(alg, h)| (alg.as_str(), h))
        .collect();
    (length, json!(hashes))
}

/// `targets` entry for a Director target assigned to one ECU.
pub fn director_targets(entries: &[(&str, &[u8], &str, &str)]) -> Value {
    let mut targets = serde_json::Map::new();
    for (name, content, serial, hardware_id) in entries {
        let (length, hashes) = hashes_json(content);
        targets.insert(
            name.to_string(),
            json!({
                "length": length,
                "hashes": hashes,
                "custom": { "ecuIdentifiers": { *serial: { "hardwareId": hardware_id } } }
            }),
        );
    }
    Value::Object(targets)
}

/// `targets` entry for Image repository targets.
pub fn image_targets(entries: &[(&str, &[u8])]) -> Value {
    let mut targets = serde_json::Map::new();
    for (name, content) in entries {
        let (length, hashes) = hashes_json(content);
        targets.insert(name.to_string(), json!({ "length": length, "hashes": hashes }));
    }
    Value::Object(targets)
}

/// A parsed target for `content`, as the Director would describe it.
pub fn target_for(name: &str, content: &[u8]) -> Target {
    let (length, hashes) = hash_content(content);
    Target {
        filename: name.to_string(),
        length,
        hashes,
        ecus: BTreeMap::new(),
        hardware_ids: Vec::new(),
    }
}

/// A repository signing its own documents with fixed keys.
pub struct TestRepository {
    pub repo: RepositoryType,
    pub root_keys: Vec<SigningKey>,
    pub targets_key: SigningKey,
    pub snapshot_key: SigningKey,
    pub timestamp_key: SigningKey,
    pub expires: DateTime<Utc>,
    roots: Vec<Vec<u8>>,
}

impl TestRepository {
    pub fn new(repo: RepositoryType, seed: u8) -> Self {
        let mut repository = Self {
            repo,
            root_keys: vec![key(seed)],
            targets_key: key(seed + 1),
            snapshot_key: key(seed + 2),
            timestamp_key: key(seed + 3),
            expires: days_from_now(30),
            roots: Vec::new(),
        };
        let first_key = repository.root_keys[0].clone();
        let first = repository.sign_root_with(1, &[&first_key]);
        repository.roots.push(first);
        repository
    }

    pub fn director(seed: u8) -> Self {
        Self::new(RepositoryType::Director, seed)
    }

    pub fn image(seed: u8) -> Self {
        Self::new(RepositoryType::Image, seed)
    }

    fn role_entry(keys: &[&SigningKey]) -> Value {
        let ids: Vec<String> = keys.iter().map(|k| compute_key_id(&k.verifying_key())).collect();
        json!({ "keyids": ids, "threshold": 1 })
    }

    /// Root body for the current key set, signed by `signers`.
    pub fn sign_root_with(&self, version: Version, signers: &[&SigningKey]) -> Vec<u8> {
        let mut keys = serde_json::Map::new();
        let root_keys: Vec<&SigningKey> = self.root_keys.iter().collect();
        for k in root_keys
            .iter()
            .copied()
            .chain([&self.targets_key, &self.snapshot_key, &self.timestamp_key])
        {
            keys.insert(
                compute_key_id(&k.verifying_key()),
                encode_public_key(&k.verifying_key()),
            );
        }
        let signed = json!({
            "_type": "Root",
            "version": version,
            "expires": self.expires.to_rfc3339(),
            "keys": keys,
            "roles": {
                "root": Self::role_entry(&root_keys),
                "targets": Self::role_entry(&[&self.targets_key]),
                "snapshot": Self::role_entry(&[&self.snapshot_key]),
                "timestamp": Self::role_entry(&[&self.timestamp_key]),
            }
        });
        to_raw(&sign_document(signed, signers))
    }

    pub fn root(&self, version: Version) -> Vec<u8> {
        self.roots[(version - 1) as usize].clone()
    }

    pub fn latest_root_version(&self) -> Version {
        self.roots.len() as Version
    }

    /// Publish the next root, signed by the previous and the new root key.
    pub fn rotate_root(&mut self, new_key: Option<SigningKey>) {
        let old = self.root_keys.clone();
        if let Some(new_key) = new_key {
            self.root_keys = vec![new_key];
        }
        let mut signers: Vec<&SigningKey> = old.iter().collect();
        for k in &self.root_keys {
            if !old.iter().any(|o| o.verifying_key() == k.verifying_key()) {
                signers.push(k);
            }
        }
        let next = self.latest_root_version() + 1;
        let raw = self.sign_root_with(next, &signers);
        self.roots.push(raw);
    }

    pub fn targets(&self, version: Version, targets: Value) -> Vec<u8> {
        let signed = json!({
            "_type": "Targets",
            "version": version,
            "expires": self.expires.to_rfc3339(),
            "targets": targets,
        });
        to_raw(&sign_document(signed, &[&self.targets_key]))
    }

    pub fn snapshot_with_expiry(&self, version: Version, targets_version: Version, expires: DateTime<Utc>) -> Vec<u8> {
        let signed = json!({
            "_type": "Snapshot",
            "version": version,
            "expires": expires.to_rfc3339(),
            "meta": { "targets.json": { "version": targets_version } },
        });
        to_raw(&sign_document(signed, &[&self.snapshot_key]))
    }

    pub fn snapshot(&self, version: Version, targets_version: Version) -> Vec<u8> {
        self.snapshot_with_expiry(version, targets_version, self.expires)
    }

    pub fn timestamp(&self, version: Version, snapshot: &[u8], snapshot_version: Version) -> Vec<u8> {
        let (length, hashes) = hashes_json(snapshot);
        let signed = json!({
            "_type": "Timestamp",
            "version": version,
            "expires": self.expires.to_rfc3339(),
            "meta": {
                "snapshot.json": { "version": snapshot_version, "length": length, "hashes": hashes }
            },
        });
        to_raw(&sign_document(signed, &[&self.timestamp_key]))
    }

    /// Consistent documents with every non-root role at `version`, plus the
    /// latest root.
    pub fn bundle(&self, version: Version, targets: Value) -> RepositoryBundle {
        let mut bundle = RepositoryBundle {
            root: Some(self.root(self.latest_root_version())),
            targets: Some(self.targets(version, targets)),
            ..Default::default()
        };
        if self.repo == RepositoryType::Image {
            let snapshot = self.snapshot(version, version);
            bundle.timestamp = Some(self.timestamp(version, &snapshot, version));
            bundle.snapshot = Some(snapshot);
        }
        bundle
    }
}

/// In-memory repositories and report sink.
#[derive(Default)]
pub struct MemTransport {
    roots: Mutex<BTreeMap<(RepositoryType, Version), Vec<u8>>>,
    roles: Mutex<BTreeMap<(RepositoryType, Role), Vec<u8>>>,
    images: Mutex<BTreeMap<String, Vec<u8>>>,
    pub manifests: Mutex<Vec<Value>>,
    pub facts: Mutex<Vec<(FactsKind, Value)>>,
    pub fail_manifest: AtomicBool,
    pub unreachable: AtomicBool,
    /// Number of upcoming image fetches that fail.
    pub image_failures: AtomicUsize,
    pub image_fetches: AtomicUsize,
}

impl MemTransport {
    /// Serve every root of `repo` and a consistent bundle at `version`.
    pub fn publish(&self, repo: &TestRepository, version: Version, targets: Value) {
        for v in 1..=repo.latest_root_version() {
            self.put_root(repo.repo, v, repo.root(v));
        }
        let bundle = repo.bundle(version, targets);
        for role in [Role::Timestamp, Role::Snapshot, Role::Targets] {
            if let Some(raw) = bundle.get(role) {
                self.put_role(repo.repo, role, raw.to_vec());
            }
        }
    }

    pub fn put_root(&self, repo: RepositoryType, version: Version, raw: Vec<u8>) {
        self.roots.lock().insert((repo, version), raw);
    }

    pub fn put_role(&self, repo: RepositoryType, role: Role, raw: Vec<u8>) {
        self.roles.lock().insert((repo, role), raw);
    }

    pub fn put_image(&self, filename: &str, content: &[u8]) {
        self.images.lock().insert(filename.to_string(), content.to_vec());
    }
}

impl Transport for MemTransport {
    fn fetch_meta(
        &self,
        repo: RepositoryType,
        role: Role,
        version: Option<Version>,
    ) -> Result<Option<Vec<u8>>, TransferError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(TransferError::Network("unreachable".to_string()));
        }
        Ok(match (role, version) {
            (Role::Root, Some(v)) => self.roots.lock().get(&(repo, v)).cloned(),
            _ => self.roles.lock().get(&(repo, role)).cloned(),
        })
    }

    fn fetch_image(&self, target: &Target) -> Result<Box<dyn Read + Send>, TransferError> {
        self.image_fetches.fetch_add(1, Ordering::SeqCst);
        let pending = self.image_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.image_failures.store(pending - 1, Ordering::SeqCst);
            return Err(TransferError::Network("connection reset".to_string()));
        }
        let content = self
            .images
            .lock()
            .get(&target.filename)
            .cloned()
            .ok_or_else(|| TransferError::NotFound(target.filename.clone()))?;
        Ok(Box::new(Cursor::new(content)))
    }

    fn put_manifest(&self, manifest: &Value) -> Result<(), TransferError> {
        if self.fail_manifest.load(Ordering::SeqCst) {
            return Err(TransferError::Network("manifest upload failed".to_string()));
        }
        self.manifests.lock().push(manifest.clone());
        Ok(())
    }

    fn put_facts(&self, kind: FactsKind, facts: &Value) -> Result<(), TransferError> {
        self.facts.lock().push((kind, facts.clone()));
        Ok(())
    }
}

/// Facts with a network section the test can change.
#[derive(Default)]
pub struct FixedFacts {
    pub network: Mutex<Value>,
}

impl FactsProvider for FixedFacts {
    fn hardware_info(&self) -> Value {
        json!({ "arch": "test" })
    }

    fn network_info(&self) -> Value {
        self.network.lock().clone()
    }
}

/// A secondary that never answers.
pub struct UnreachableSecondary {
    serial: EcuSerial,
    hardware_id: HardwareIdentifier,
}

impl UnreachableSecondary {
    pub fn new(serial: &str, hardware_id: &str) -> Self {
        Self {
            serial: EcuSerial::new(serial),
            hardware_id: HardwareIdentifier::new(hardware_id),
        }
    }

    fn down<T>(&self) -> Result<T, SecondaryError> {
        Err(SecondaryError::Unreachable(format!("{} does not answer", self.serial)))
    }
}

impl SecondaryInterface for UnreachableSecondary {
    fn serial(&self) -> &EcuSerial {
        &self.serial
    }

    fn hardware_id(&self) -> &HardwareIdentifier {
        &self.hardware_id
    }

    fn public_key(&self) -> VerifyingKey {
        key(1).verifying_key()
    }

    fn root_version(&self, _repo: RepositoryType) -> Result<Version, SecondaryError> {
        self.down()
    }

    fn put_root(&self, _repo: RepositoryType, _raw: &[u8]) -> Result<(), SecondaryError> {
        self.down()
    }

    fn send_metadata(&self, _bundle: &UptaneBundle) -> Result<(), SecondaryError> {
        self.down()
    }

    fn send_image(&self, _target: &Target, _content: &mut dyn Read) -> Result<(), SecondaryError> {
        self.down()
    }

    fn manifest(&self) -> Result<Value, SecondaryError> {
        self.down()
    }
}

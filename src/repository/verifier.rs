//! Repository verifier.
//!
//! One verifier per repository. It owns the trusted documents of that
//! repository and only ever replaces them with documents that passed the
//! full check for their role. Every check runs against a candidate copy
//! that is committed on success, so a failure never leaves a partial
//! update behind.

use chrono::{DateTime, Utc};

use crate::metadata::{
    hash_content, MetaFileInfo, RepositoryType, Role, Root, SignedDocument, Snapshot, Targets,
    Timestamp, VerificationError, Version,
};
use crate::storage::Storage;

use super::error::MetadataError;
use super::source::{MetadataSource, StorageSource};

/// Upper bound on root versions walked in one refresh.
pub const MAX_ROOT_ROTATIONS: u64 = 1024;

/// Which roles a repository publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepositoryConfig {
    pub repo: RepositoryType,
    pub roles: &'static [Role],
}

impl RepositoryConfig {
    pub const DIRECTOR: Self = Self {
        repo: RepositoryType::Director,
        roles: &[Role::Root, Role::Targets],
    };

    pub const IMAGE: Self = Self {
        repo: RepositoryType::Image,
        roles: &[Role::Root, Role::Timestamp, Role::Snapshot, Role::Targets],
    };

    pub fn uses(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// Non-root roles in verification order.
    pub fn non_root_roles(&self) -> impl Iterator<Item = Role> + '_ {
        [Role::Timestamp, Role::Snapshot, Role::Targets]
            .into_iter()
            .filter(|role| self.uses(*role))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifierState {
    Uninitialized,
    RootEstablished,
    MetadataCurrent,
}

/// Raw documents of one repository, as fetched or as trusted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryBundle {
    pub root: Option<Vec<u8>>,
    pub timestamp: Option<Vec<u8>>,
    pub snapshot: Option<Vec<u8>>,
    pub targets: Option<Vec<u8>>,
}

impl RepositoryBundle {
    pub fn get(&self, role: Role) -> Option<&[u8]> {
        match role {
            Role::Root => self.root.as_deref(),
            Role::Timestamp => self.timestamp.as_deref(),
            Role::Snapshot => self.snapshot.as_deref(),
            Role::Targets => self.targets.as_deref(),
        }
    }

    pub fn set(&mut self, role: Role, raw: Vec<u8>) {
        let slot = match role {
            Role::Root => &mut self.root,
            Role::Timestamp => &mut self.timestamp,
            Role::Snapshot => &mut self.snapshot,
            Role::Targets => &mut self.targets,
        };
        *slot = Some(raw);
    }
}

/// Outcome of one accepted root rotation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootRotation {
    pub version: Version,
    pub keys_changed: bool,
}

#[derive(Debug, Clone)]
pub struct RepositoryVerifier {
    config: RepositoryConfig,
    root: Option<SignedDocument<Root>>,
    timestamp: Option<SignedDocument<Timestamp>>,
    snapshot: Option<SignedDocument<Snapshot>>,
    targets: Option<SignedDocument<Targets>>,
}

fn check_pin(role: Role, pin: &MetaFileInfo, version: Version, raw: &[u8]) -> Result<(), VerificationError> {
    if pin.version != version {
        return Err(VerificationError::MetaMismatch {
            role,
            reason: format!("pinned version {}, received {}", pin.version, version),
        });
    }
    if pin.length.is_none() && pin.hashes.is_empty() {
        return Ok(());
    }

    let (length, measured) = hash_content(raw);
    if let Some(expected) = pin.length {
        if expected != length {
            return Err(VerificationError::MetaMismatch {
                role,
                reason: format!("pinned length {}, received {}", expected, length),
            });
        }
    }
    for (alg, expected) in &pin.hashes {
        if measured.get(alg) != Some(expected) {
            return Err(VerificationError::MetaMismatch {
                role,
                reason: format!("{} hash differs from pin", alg.as_str()),
            });
        }
    }
    Ok(())
}

impl RepositoryVerifier {
    pub fn new(config: RepositoryConfig) -> Self {
        Self {
            config,
            root: None,
            timestamp: None,
            snapshot: None,
            targets: None,
        }
    }

    pub fn director() -> Self {
        Self::new(RepositoryConfig::DIRECTOR)
    }

    pub fn image() -> Self {
        Self::new(RepositoryConfig::IMAGE)
    }

    pub fn repo(&self) -> RepositoryType {
        self.config.repo
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn state(&self) -> VerifierState {
        if self.root.is_none() {
            return VerifierState::Uninitialized;
        }
        let complete = self.config.non_root_roles().all(|role| match role {
            Role::Timestamp => self.timestamp.is_some(),
            Role::Snapshot => self.snapshot.is_some(),
            Role::Targets => self.targets.is_some(),
            Role::Root => true,
        });
        if complete {
            VerifierState::MetadataCurrent
        } else {
            VerifierState::RootEstablished
        }
    }

    pub fn root_version(&self) -> Option<Version> {
        self.root.as_ref().map(|r| r.version)
    }

    /// Trusted version of a role, if any document of it is trusted.
    pub fn trusted_version(&self, role: Role) -> Option<Version> {
        match role {
            Role::Root => self.root_version(),
            Role::Timestamp => self.timestamp.as_ref().map(|d| d.version),
            Role::Snapshot => self.snapshot.as_ref().map(|d| d.version),
            Role::Targets => self.targets.as_ref().map(|d| d.version),
        }
    }

    fn trusted_root(&self) -> Result<&SignedDocument<Root>, VerificationError> {
        self.root
            .as_ref()
            .ok_or_else(|| VerificationError::malformed("no trusted root established"))
    }

    /// Establish the initial trust anchor. The document must be signed to
    /// its own root threshold.
    pub fn load_trusted_root(&mut self, raw: &[u8]) -> Result<(), VerificationError> {
        let root = SignedDocument::<Root>::parse(raw)?;
        root.verify_signatures(&root.body)?;

        log::info!(
            "ROOT_TRUST_ESTABLISHED repo={} version={}",
            self.config.repo,
            root.version
        );
        self.root = Some(root);
        self.clear_non_root();
        Ok(())
    }

    /// Accept the next root in the chain.
    ///
    /// The candidate must be exactly one version ahead and carry enough
    /// signatures for both the trusted root and itself. Non-root documents
    /// are dropped when the key set changes.
    pub fn verify_root(&mut self, raw: &[u8]) -> Result<RootRotation, VerificationError> {
        let trusted = self.trusted_root()?;
        let candidate = SignedDocument::<Root>::parse(raw)?;

        if candidate.version <= trusted.version {
            return Err(VerificationError::VersionRollback {
                role: Role::Root,
                trusted: trusted.version,
                received: candidate.version,
            });
        }
        if candidate.version != trusted.version + 1 {
            return Err(VerificationError::RootChainGap {
                trusted: trusted.version,
                received: candidate.version,
            });
        }

        candidate.verify_signatures(&trusted.body)?;
        candidate.verify_signatures(&candidate.body)?;

        let rotation = RootRotation {
            version: candidate.version,
            keys_changed: trusted.body.keys_differ(&candidate.body),
        };

        log::info!(
            "ROOT_ROTATED repo={} version={} keys_changed={}",
            self.config.repo,
            rotation.version,
            rotation.keys_changed
        );
        self.root = Some(candidate);
        if rotation.keys_changed {
            self.clear_non_root();
        }
        Ok(rotation)
    }

    /// The final root of a chain must not be expired.
    pub fn check_root_freshness(&self, now: DateTime<Utc>) -> Result<(), VerificationError> {
        self.trusted_root()?.check_expiry(now)
    }

    pub fn verify_timestamp(&mut self, raw: &[u8], now: DateTime<Utc>) -> Result<(), VerificationError> {
        let candidate = SignedDocument::<Timestamp>::parse(raw)?;
        candidate.verify_signatures(&self.trusted_root()?.body)?;
        candidate.check_version(self.trusted_version(Role::Timestamp))?;
        candidate.check_expiry(now)?;

        if let Some(trusted) = &self.timestamp {
            let old = trusted.body.snapshot.version;
            let new = candidate.body.snapshot.version;
            if new < old {
                return Err(VerificationError::VersionRollback {
                    role: Role::Snapshot,
                    trusted: old,
                    received: new,
                });
            }
        }

        self.timestamp = Some(candidate);
        Ok(())
    }

    pub fn verify_snapshot(&mut self, raw: &[u8], now: DateTime<Utc>) -> Result<(), VerificationError> {
        let candidate = SignedDocument::<Snapshot>::parse(raw)?;
        candidate.verify_signatures(&self.trusted_root()?.body)?;
        candidate.check_version(self.trusted_version(Role::Snapshot))?;

        if self.config.uses(Role::Timestamp) {
            let timestamp = self.timestamp.as_ref().ok_or_else(|| VerificationError::MetaMismatch {
                role: Role::Snapshot,
                reason: "no trusted timestamp pins this snapshot".to_string(),
            })?;
            check_pin(Role::Snapshot, &timestamp.body.snapshot, candidate.version, raw)?;
        }
        candidate.check_expiry(now)?;

        if let Some(trusted) = &self.snapshot {
            let old = trusted.body.targets.version;
            let new = candidate.body.targets.version;
            if new < old {
                return Err(VerificationError::VersionRollback {
                    role: Role::Targets,
                    trusted: old,
                    received: new,
                });
            }
        }

        self.snapshot = Some(candidate);
        Ok(())
    }

    pub fn verify_targets(&mut self, raw: &[u8], now: DateTime<Utc>) -> Result<(), VerificationError> {
        let candidate = SignedDocument::<Targets>::parse(raw)?;
        candidate.verify_signatures(&self.trusted_root()?.body)?;
        candidate.check_version(self.trusted_version(Role::Targets))?;

        if self.config.uses(Role::Snapshot) {
            let snapshot = self.snapshot.as_ref().ok_or_else(|| VerificationError::MetaMismatch {
                role: Role::Targets,
                reason: "no trusted snapshot pins these targets".to_string(),
            })?;
            check_pin(Role::Targets, &snapshot.body.targets, candidate.version, raw)?;
        }
        candidate.check_expiry(now)?;

        self.targets = Some(candidate);
        Ok(())
    }

    /// Verify a complete set of documents for this repository.
    ///
    /// A root in the bundle that is one version ahead is rotated in first;
    /// the same root as trusted is accepted as is. Either every document is
    /// accepted or the verifier is left untouched.
    pub fn verify_bundle(&mut self, bundle: &RepositoryBundle, now: DateTime<Utc>) -> Result<(), VerificationError> {
        let mut candidate = self.clone();

        if let Some(raw) = &bundle.root {
            match candidate.root_version() {
                None => candidate.load_trusted_root(raw)?,
                Some(trusted) => {
                    let version = SignedDocument::<Root>::parse(raw)?.version;
                    if version != trusted {
                        candidate.verify_root(raw)?;
                    }
                }
            }
        }
        candidate.check_root_freshness(now)?;

        for role in self.config.non_root_roles() {
            let raw = bundle.get(role).ok_or_else(|| {
                VerificationError::malformed(format!("{} bundle lacks {} metadata", self.config.repo, role))
            })?;
            match role {
                Role::Timestamp => candidate.verify_timestamp(raw, now)?,
                Role::Snapshot => candidate.verify_snapshot(raw, now)?,
                Role::Targets => candidate.verify_targets(raw, now)?,
                Role::Root => {}
            }
        }

        *self = candidate;
        log::debug!(
            "BUNDLE_VERIFIED repo={} root_version={:?} targets_version={:?}",
            self.config.repo,
            self.root_version(),
            self.trusted_version(Role::Targets)
        );
        Ok(())
    }

    /// Trusted targets, only once the whole chain for this repository is
    /// current.
    pub fn current_targets(&self) -> Option<&Targets> {
        if self.state() != VerifierState::MetadataCurrent {
            return None;
        }
        self.targets.as_ref().map(|t| &t.body)
    }

    /// Raw trusted documents, for forwarding to secondaries.
    pub fn bundle(&self) -> RepositoryBundle {
        RepositoryBundle {
            root: self.root.as_ref().map(|d| d.raw().to_vec()),
            timestamp: self.timestamp.as_ref().map(|d| d.raw().to_vec()),
            snapshot: self.snapshot.as_ref().map(|d| d.raw().to_vec()),
            targets: self.targets.as_ref().map(|d| d.raw().to_vec()),
        }
    }

    fn clear_non_root(&mut self) {
        self.timestamp = None;
        self.snapshot = None;
        self.targets = None;
    }

    fn verification(&self, source: VerificationError) -> MetadataError {
        MetadataError::Verification {
            repo: self.config.repo,
            source,
        }
    }

    /// Rebuild trust from storage: the stored root chain, then whatever
    /// non-root documents still verify under the final root. Stored
    /// documents are restored without an expiry check so their versions
    /// keep acting as a rollback floor.
    fn restore(&mut self, storage: &dyn Storage) -> Result<bool, MetadataError> {
        let repo = self.config.repo;
        let Some(first) = storage.load_root(repo, 1)? else {
            return Ok(false);
        };
        self.load_trusted_root(&first)
            .map_err(|e| self.verification(e))?;

        for _ in 0..MAX_ROOT_ROTATIONS {
            let next = self.root_version().unwrap_or_default() + 1;
            let Some(raw) = storage.load_root(repo, next)? else {
                break;
            };
            self.verify_root(&raw).map_err(|e| self.verification(e))?;
        }

        let Some(root) = self.root.clone() else {
            return Ok(true);
        };
        for role in self.config.non_root_roles() {
            let Some(raw) = storage.load_non_root(repo, role)? else {
                continue;
            };
            let restored = match role {
                Role::Timestamp => SignedDocument::<Timestamp>::parse(&raw)
                    .and_then(|d| d.verify_signatures(&root.body).map(|_| d))
                    .map(|d| self.timestamp = Some(d)),
                Role::Snapshot => SignedDocument::<Snapshot>::parse(&raw)
                    .and_then(|d| d.verify_signatures(&root.body).map(|_| d))
                    .map(|d| self.snapshot = Some(d)),
                Role::Targets => SignedDocument::<Targets>::parse(&raw)
                    .and_then(|d| d.verify_signatures(&root.body).map(|_| d))
                    .map(|d| self.targets = Some(d)),
                Role::Root => Ok(()),
            };
            if let Err(e) = restored {
                log::warn!("STORED_META_DISCARDED repo={} role={} error={}", repo, role, e);
            }
        }
        Ok(true)
    }

    /// Full update of this repository from `source`.
    ///
    /// Walks the root chain one version at a time, persisting each link
    /// once trusted, then verifies and persists the non-root documents.
    /// An untrusted link stops the walk; the verifier stays at the last
    /// trusted root.
    pub fn refresh(
        &mut self,
        source: &dyn MetadataSource,
        storage: &dyn Storage,
        now: DateTime<Utc>,
    ) -> Result<(), MetadataError> {
        let repo = self.config.repo;

        if self.root.is_none() && !self.restore(storage)? {
            let raw = source
                .root(repo, 1)?
                .ok_or(MetadataError::Missing { repo, role: Role::Root })?;
            self.load_trusted_root(&raw)
                .map_err(|e| self.verification(e))?;
            storage.store_root(repo, 1, &raw)?;
            log::warn!("ROOT_TRUST_ON_FIRST_USE repo={} source={}", repo, source.name());
        }

        for _ in 0..MAX_ROOT_ROTATIONS {
            let next = self.root_version().unwrap_or_default() + 1;
            let Some(raw) = source.root(repo, next)? else {
                break;
            };
            let rotation = self.verify_root(&raw).map_err(|e| self.verification(e))?;
            storage.store_root(repo, rotation.version, &raw)?;
            if rotation.keys_changed {
                storage.clear_non_root_meta(repo)?;
            }
        }

        self.check_root_freshness(now)
            .map_err(|e| self.verification(e))?;

        let mut bundle = RepositoryBundle::default();
        for role in self.config.non_root_roles() {
            let raw = source.role(repo, role)?.ok_or(MetadataError::Missing { repo, role })?;
            bundle.set(role, raw);
        }
        self.verify_bundle(&bundle, now)
            .map_err(|e| self.verification(e))?;

        for role in self.config.non_root_roles() {
            if let Some(raw) = bundle.get(role) {
                storage.store_non_root(repo, role, raw)?;
            }
        }

        log::info!(
            "REPOSITORY_REFRESHED repo={} source={} root_version={:?} targets_version={:?}",
            repo,
            source.name(),
            self.root_version(),
            self.trusted_version(Role::Targets)
        );
        Ok(())
    }

    /// The refresh pipeline over documents already present in storage.
    pub fn check_offline(&mut self, storage: &dyn Storage, now: DateTime<Utc>) -> Result<(), MetadataError> {
        self.refresh(&StorageSource(storage), storage, now)
    }
}

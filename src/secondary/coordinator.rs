//! Secondary coordinator.
//!
//! Owns the ECU registry and the secondary handles discovered at startup.
//! Every operation runs per ECU and collects a result per serial; one
//! secondary failing never stops the others.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::ecu::{Ecu, EcuRegistry, EcuSerial};
use crate::logging::LogContext;
use crate::manifest::EcuVersionManifest;
use crate::metadata::{RepositoryType, Target};
use crate::orchestrator::ShutdownToken;
use crate::storage::{MisconfiguredEcu, MisconfiguredState, Storage, StorageResult};

use super::interface::{SecondaryError, SecondaryInterface, UptaneBundle};

/// Per-ECU outcome of a batch operation.
pub type EcuResults<T> = BTreeMap<EcuSerial, Result<T, SecondaryError>>;

pub struct SecondaryCoordinator {
    registry: EcuRegistry,
    secondaries: BTreeMap<EcuSerial, Box<dyn SecondaryInterface>>,
    /// Last manifest from each secondary that passed verification.
    manifests: BTreeMap<EcuSerial, Value>,
    /// Why the latest manifest request failed, per secondary. Cleared by
    /// the next verified manifest.
    manifest_errors: BTreeMap<EcuSerial, String>,
}

fn local(e: impl std::fmt::Display) -> SecondaryError {
    SecondaryError::Local(e.to_string())
}

impl SecondaryCoordinator {
    pub fn new(primary: Ecu) -> Self {
        Self {
            registry: EcuRegistry::new(primary),
            secondaries: BTreeMap::new(),
            manifests: BTreeMap::new(),
            manifest_errors: BTreeMap::new(),
        }
    }

    /// Register a discovered secondary. Returns false for a duplicate serial.
    pub fn add_secondary(&mut self, secondary: Box<dyn SecondaryInterface>) -> bool {
        let ecu = Ecu::secondary(secondary.serial().clone(), secondary.hardware_id().clone());
        if !self.registry.add_secondary(ecu) {
            log::warn!("SECONDARY_DUPLICATE serial={}", secondary.serial());
            return false;
        }
        log::info!(
            "SECONDARY_ADDED serial={} hardware_id={}",
            secondary.serial(),
            secondary.hardware_id()
        );
        self.secondaries.insert(secondary.serial().clone(), secondary);
        true
    }

    pub fn registry(&self) -> &EcuRegistry {
        &self.registry
    }

    pub fn secondaries(&self) -> impl Iterator<Item = &dyn SecondaryInterface> {
        self.secondaries.values().map(|s| s.as_ref())
    }

    pub fn get(&self, serial: &EcuSerial) -> Option<&dyn SecondaryInterface> {
        self.secondaries.get(serial).map(|s| s.as_ref())
    }

    pub fn last_manifests(&self) -> &BTreeMap<EcuSerial, Value> {
        &self.manifests
    }

    /// Secondaries whose latest manifest request failed. Their entry in
    /// `last_manifests`, if any, is stale.
    pub fn manifest_errors(&self) -> &BTreeMap<EcuSerial, String> {
        &self.manifest_errors
    }

    /// Bring `secondary` up to the primary's latest stored root for `repo`,
    /// one version at a time.
    pub fn rotate_secondary_root(
        &self,
        repo: RepositoryType,
        secondary: &dyn SecondaryInterface,
        storage: &dyn Storage,
    ) -> Result<(), SecondaryError> {
        let latest = storage.latest_root_version(repo).map_err(local)?.unwrap_or(0);
        let current = secondary.root_version(repo)?;
        if current > latest {
            log::warn!(
                "SECONDARY_ROOT_AHEAD serial={} repo={} secondary={} primary={}",
                secondary.serial(),
                repo,
                current,
                latest
            );
            return Ok(());
        }

        for version in current + 1..=latest {
            let raw = storage
                .load_root(repo, version)
                .map_err(local)?
                .ok_or_else(|| local(format!("{} root {} missing from storage", repo, version)))?;
            secondary.put_root(repo, &raw)?;
            log::debug!(
                "SECONDARY_ROOT_SENT serial={} repo={} version={}",
                secondary.serial(),
                repo,
                version
            );
        }
        Ok(())
    }

    /// Rotate roots and push the verified bundle to every secondary.
    pub fn send_metadata_to_ecus(
        &self,
        bundle: &UptaneBundle,
        storage: &dyn Storage,
        ctx: &LogContext,
        shutdown: &ShutdownToken,
    ) -> EcuResults<()> {
        let mut results = EcuResults::new();
        for (serial, secondary) in &self.secondaries {
            let ecu_ctx = ctx.with_ecu(serial);
            if shutdown.is_requested() {
                results.insert(serial.clone(), Err(SecondaryError::Cancelled));
                continue;
            }
            let result = self
                .rotate_secondary_root(RepositoryType::Director, secondary.as_ref(), storage)
                .and_then(|_| self.rotate_secondary_root(RepositoryType::Image, secondary.as_ref(), storage))
                .and_then(|_| secondary.send_metadata(bundle));
            match &result {
                Ok(()) => log::info!("{} SECONDARY_METADATA_ACCEPTED", ecu_ctx),
                Err(e) => log::warn!("{} SECONDARY_METADATA_FAILED error={}", ecu_ctx, e),
            }
            results.insert(serial.clone(), result);
        }
        results
    }

    /// Ship each secondary the image assigned to its serial, and nothing
    /// else.
    pub fn send_images_to_ecus(
        &self,
        assignments: &BTreeMap<EcuSerial, Target>,
        storage: &dyn Storage,
        ctx: &LogContext,
        shutdown: &ShutdownToken,
    ) -> EcuResults<()> {
        let mut results = EcuResults::new();
        for (serial, target) in assignments {
            let Some(secondary) = self.secondaries.get(serial) else {
                continue;
            };
            let ecu_ctx = ctx.with_ecu(serial);
            if shutdown.is_requested() {
                results.insert(serial.clone(), Err(SecondaryError::Cancelled));
                continue;
            }

            let result = storage
                .open_target(&target.filename)
                .map_err(local)
                .and_then(|reader| {
                    reader.ok_or_else(|| local(format!("{} is not staged", target.filename)))
                })
                .and_then(|mut reader| secondary.send_image(target, &mut reader));
            match &result {
                Ok(()) => log::info!("{} SECONDARY_IMAGE_SENT filename={}", ecu_ctx, target.filename),
                Err(e) => log::warn!(
                    "{} SECONDARY_IMAGE_FAILED filename={} error={}",
                    ecu_ctx,
                    target.filename,
                    e
                ),
            }
            results.insert(serial.clone(), result);
        }
        results
    }

    /// Compare discovered secondaries with the registered set.
    ///
    /// The first run registers what was discovered. Later runs record
    /// secondaries that appeared (`NotRegistered`) or disappeared (`Old`).
    pub fn verify_secondaries(&self, storage: &dyn Storage) -> StorageResult<Vec<MisconfiguredEcu>> {
        let discovered: Vec<Ecu> = self.registry.all().cloned().collect();
        let Some(registered) = storage.load_ecu_serials()? else {
            storage.store_ecu_serials(&discovered)?;
            storage.store_misconfigured_ecus(&[])?;
            log::info!("ECUS_REGISTERED count={}", discovered.len());
            return Ok(Vec::new());
        };

        let mut misconfigured = Vec::new();
        for ecu in &discovered {
            if !registered.contains(ecu) {
                misconfigured.push(MisconfiguredEcu {
                    serial: ecu.serial.clone(),
                    hardware_id: ecu.hardware_id.clone(),
                    state: MisconfiguredState::NotRegistered,
                });
            }
        }
        for ecu in &registered {
            if !discovered.contains(ecu) {
                misconfigured.push(MisconfiguredEcu {
                    serial: ecu.serial.clone(),
                    hardware_id: ecu.hardware_id.clone(),
                    state: MisconfiguredState::Old,
                });
            }
        }

        for ecu in &misconfigured {
            log::warn!(
                "ECU_MISCONFIGURED serial={} hardware_id={} state={:?}",
                ecu.serial,
                ecu.hardware_id,
                ecu.state
            );
        }
        storage.store_misconfigured_ecus(&misconfigured)?;
        Ok(misconfigured)
    }

    /// Fetch and verify every secondary's manifest.
    ///
    /// A manifest is accepted only if it carries a valid signature by the
    /// secondary's key and names the secondary's own serial.
    pub fn collect_manifests(&mut self, ctx: &LogContext) -> EcuResults<EcuVersionManifest> {
        let mut results = EcuResults::new();
        for (serial, secondary) in &self.secondaries {
            let ecu_ctx = ctx.with_ecu(serial);
            let result = secondary.manifest().and_then(|envelope| {
                let manifest = EcuVersionManifest::verify(&envelope, &secondary.public_key())
                    .map_err(|e| SecondaryError::BadManifest(e.to_string()))?;
                if &manifest.ecu_serial != serial {
                    return Err(SecondaryError::BadManifest(format!(
                        "manifest names ECU {}",
                        manifest.ecu_serial
                    )));
                }
                Ok((envelope, manifest))
            });
            match result {
                Ok((envelope, manifest)) => {
                    self.manifests.insert(serial.clone(), envelope);
                    self.manifest_errors.remove(serial);
                    results.insert(serial.clone(), Ok(manifest));
                }
                Err(e) => {
                    log::warn!(
                        "{} SECONDARY_MANIFEST_REJECTED error={} stale={}",
                        ecu_ctx,
                        e,
                        self.manifests.contains_key(serial)
                    );
                    self.manifest_errors.insert(serial.clone(), e.to_string());
                    results.insert(serial.clone(), Err(e));
                }
            }
        }
        results
    }
}

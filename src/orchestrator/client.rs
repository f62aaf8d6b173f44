//! Update orchestrator.
//!
//! Drives one update iteration at a time:
//! 1. Metadata update (Director, then Image, with root rotation)
//! 2. Reconciliation into a per-ECU plan
//! 3. Pending detection from reported installed versions
//! 4. Image download (or pre-staged check when offline)
//! 5. Metadata and image distribution to secondaries
//! 6. Primary installation
//! 7. Confirmation from secondary manifests
//! 8. Manifest assembly and submission
//!
//! Only an untrusted Director, a storage failure or shutdown end an
//! iteration early. Every other failure is recorded for the ECU it
//! concerns and the remaining ECUs carry on.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use ed25519_dalek::SigningKey;
use serde_json::{json, Value};

use crate::config::{ClientConfig, UptaneConfig};
use crate::ecu::{Ecu, EcuSerial, HardwareIdentifier};
use crate::interfaces::{
    FactsKind, FactsProvider, InstallErrorCode, InstallOutcome, PackageManager, ReportQueue,
    TransferError, Transport,
};
use crate::logging::LogContext;
use crate::manifest::{
    assemble_manifest, enqueue_download_report, enqueue_installation_report, put_manifest,
    ManifestInputs,
};
use crate::metadata::{RepositoryType, Role, Target};
use crate::reconcile::{compute_ecu_targets, has_pending_updates, is_installed, is_installed_on_primary};
use crate::repository::{MetadataError, RepositoryVerifier, TransportSource};
use crate::secondary::{
    load_or_create_key, SecondaryCoordinator, SecondaryError, UptaneBundle, VirtualSecondary,
};
use crate::storage::{
    current_installed, mark_installed, FsStorage, InstalledVersionRecord, Storage, StorageError,
};

use super::commands::Command;
use super::context::{IterationContext, IterationMode};
use super::download::{download_target, verify_stored_target};
use super::error::IterationError;
use super::events::{event_channel, Event, EventSender};
use super::report::{EcuUpdateStatus, IterationReport};
use super::shutdown::ShutdownToken;

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub download_retries: u32,
    pub command_poll_interval: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            download_retries: 3,
            command_poll_interval: Duration::from_millis(1000),
        }
    }
}

impl From<&UptaneConfig> for ClientSettings {
    fn from(config: &UptaneConfig) -> Self {
        Self {
            download_retries: config.download_retries,
            command_poll_interval: Duration::from_millis(config.command_poll_interval_ms),
        }
    }
}

/// External collaborators the client talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub storage: Arc<dyn Storage>,
    pub transport: Arc<dyn Transport>,
    pub installer: Arc<dyn PackageManager>,
    pub report_queue: Arc<dyn ReportQueue>,
    pub facts: Arc<dyn FactsProvider>,
}

pub struct UptaneClient {
    storage: Arc<dyn Storage>,
    transport: Arc<dyn Transport>,
    installer: Arc<dyn PackageManager>,
    report_queue: Arc<dyn ReportQueue>,
    facts: Arc<dyn FactsProvider>,
    primary_key: SigningKey,
    coordinator: SecondaryCoordinator,
    director: RepositoryVerifier,
    image: RepositoryVerifier,
    events: EventSender,
    /// Installation results of the last iteration that attempted any.
    last_results: BTreeMap<EcuSerial, InstallOutcome>,
    last_network_info: Option<Value>,
    settings: ClientSettings,
}

fn download_outcome(e: &TransferError) -> InstallOutcome {
    let code = match e {
        TransferError::ContentMismatch { .. } => InstallErrorCode::VerificationFailed,
        _ => InstallErrorCode::DownloadFailed,
    };
    InstallOutcome::failure(code, e.to_string())
}

fn secondary_outcome(e: &SecondaryError) -> InstallOutcome {
    let code = match e {
        SecondaryError::Unreachable(_) => InstallErrorCode::SecondaryUnreachable,
        SecondaryError::Rejected(_) | SecondaryError::BadManifest(_) => {
            InstallErrorCode::SecondaryRejected
        }
        SecondaryError::Local(_) | SecondaryError::Cancelled => InstallErrorCode::InternalError,
    };
    InstallOutcome::failure(code, e.to_string())
}

fn installed_packages(records: &[InstalledVersionRecord]) -> Value {
    let current: Vec<Value> = records
        .iter()
        .filter(|r| r.is_current)
        .map(|r| {
            json!({
                "ecu_serial": r.ecu_serial,
                "filename": r.target.filename,
                "fileinfo": r.target.file_info(),
            })
        })
        .collect();
    Value::Array(current)
}

impl UptaneClient {
    pub fn new(
        collaborators: Collaborators,
        primary_key: SigningKey,
        coordinator: SecondaryCoordinator,
        events: EventSender,
        settings: ClientSettings,
    ) -> Self {
        Self {
            storage: collaborators.storage,
            transport: collaborators.transport,
            installer: collaborators.installer,
            report_queue: collaborators.report_queue,
            facts: collaborators.facts,
            primary_key,
            coordinator,
            director: RepositoryVerifier::director(),
            image: RepositoryVerifier::image(),
            events,
            last_results: BTreeMap::new(),
            last_network_info: None,
            settings,
        }
    }

    /// Build a client from its configuration: filesystem storage, the
    /// primary signing key and the configured virtual secondaries.
    pub fn from_config(
        config: &ClientConfig,
        transport: Arc<dyn Transport>,
        installer: Arc<dyn PackageManager>,
        report_queue: Arc<dyn ReportQueue>,
        facts: Arc<dyn FactsProvider>,
    ) -> anyhow::Result<(Self, Receiver<Event>)> {
        let storage = FsStorage::open(&config.storage.path)
            .with_context(|| format!("opening storage at {}", config.storage.path.display()))?;
        let primary_key = load_or_create_key(&config.uptane.primary_key_path).with_context(|| {
            format!(
                "loading primary key from {}",
                config.uptane.primary_key_path.display()
            )
        })?;

        let mut coordinator = SecondaryCoordinator::new(Ecu::primary(
            EcuSerial::new(config.uptane.primary_serial.as_str()),
            HardwareIdentifier::new(config.uptane.primary_hardware_id.as_str()),
        ));
        for secondary in &config.secondary.virtuals {
            let key = load_or_create_key(&secondary.key_path)
                .with_context(|| format!("loading key for secondary {}", secondary.serial))?;
            let ecu = VirtualSecondary::new(
                EcuSerial::new(secondary.serial.as_str()),
                HardwareIdentifier::new(secondary.hardware_id.as_str()),
                key,
                secondary.firmware_path.clone(),
            )
            .with_context(|| format!("reading firmware of secondary {}", secondary.serial))?;
            coordinator.add_secondary(Box::new(ecu));
        }

        let (events, receiver) = event_channel(config.uptane.event_channel_capacity);
        let collaborators = Collaborators {
            storage: Arc::new(storage),
            transport,
            installer,
            report_queue,
            facts,
        };
        let client = Self::new(
            collaborators,
            primary_key,
            coordinator,
            events,
            ClientSettings::from(&config.uptane),
        );
        Ok((client, receiver))
    }

    pub fn coordinator(&self) -> &SecondaryCoordinator {
        &self.coordinator
    }

    pub fn director(&self) -> &RepositoryVerifier {
        &self.director
    }

    pub fn image(&self) -> &RepositoryVerifier {
        &self.image
    }

    pub fn last_results(&self) -> &BTreeMap<EcuSerial, InstallOutcome> {
        &self.last_results
    }

    fn primary_serial(&self) -> &EcuSerial {
        &self.coordinator.registry().primary().serial
    }

    fn check_cancel(&self, shutdown: &ShutdownToken) -> Result<(), IterationError> {
        if shutdown.is_requested() {
            return Err(IterationError::Cancelled);
        }
        Ok(())
    }

    /// Startup bookkeeping: compare discovered secondaries with the
    /// registered set and report device facts.
    pub fn initialize(&mut self) {
        match self.coordinator.verify_secondaries(self.storage.as_ref()) {
            Ok(misconfigured) if !misconfigured.is_empty() => {
                log::warn!("ECUS_MISCONFIGURED count={}", misconfigured.len());
            }
            Ok(_) => {}
            Err(e) => log::error!("ECU_REGISTRY_CHECK_FAILED error={}", e),
        }
        self.report_facts();
    }

    fn put_facts(&self, kind: FactsKind, facts: &Value) -> bool {
        match self.transport.put_facts(kind, facts) {
            Ok(()) => {
                log::info!("FACTS_SENT kind={}", kind);
                true
            }
            Err(e) => {
                log::warn!("FACTS_SEND_FAILED kind={} error={}", kind, e);
                false
            }
        }
    }

    /// Report hardware info, installed packages and, when it changed,
    /// network info.
    pub fn report_facts(&mut self) {
        self.put_facts(FactsKind::HardwareInfo, &self.facts.hardware_info());
        match self.storage.load_installed_versions() {
            Ok(records) => {
                let packages = installed_packages(records.as_deref().unwrap_or(&[]));
                self.put_facts(FactsKind::InstalledPackages, &packages);
            }
            Err(e) => log::warn!("INSTALLED_VERSIONS_UNREADABLE error={}", e),
        }
        self.report_network_if_changed();
    }

    pub fn report_network_if_changed(&mut self) {
        let network = self.facts.network_info();
        if self.last_network_info.as_ref() == Some(&network) {
            log::debug!("NETWORK_INFO_UNCHANGED");
            return;
        }
        if self.put_facts(FactsKind::NetworkInfo, &network) {
            self.last_network_info = Some(network);
        }
    }

    pub fn online_iteration(&mut self, shutdown: &ShutdownToken) -> Result<IterationReport, IterationError> {
        self.run_iteration(IterationMode::Online, shutdown)
    }

    /// Same pipeline as [`online_iteration`](Self::online_iteration), fed
    /// from metadata and images already in storage.
    pub fn offline_iteration(&mut self, shutdown: &ShutdownToken) -> Result<IterationReport, IterationError> {
        self.run_iteration(IterationMode::Offline, shutdown)
    }

    fn run_iteration(&mut self, mode: IterationMode, shutdown: &ShutdownToken) -> Result<IterationReport, IterationError> {
        let it = IterationContext::new(mode);
        let log = it.log_context();
        log::info!("{} ITERATION_START mode={}", log, mode);
        self.events.emit(Event::IterationStarted {
            iteration_id: it.iteration_id.clone(),
            mode,
        });

        match self.iterate(&it, shutdown) {
            Ok(report) => {
                log::info!(
                    "{} ITERATION_COMPLETE assigned={} updated={} failed={} inconsistencies={} manifest_delivered={}",
                    log,
                    report.assignments.len(),
                    report.updated(),
                    report.failed(),
                    report.inconsistencies.len(),
                    report.manifest_delivered
                );
                self.events.emit(Event::IterationFinished {
                    iteration_id: it.iteration_id.clone(),
                    updated: report.updated(),
                    failed: report.failed(),
                });
                Ok(report)
            }
            Err(e) => {
                log::error!("{} ITERATION_FAILED error={}", log, e);
                self.events.emit(Event::IterationFailed {
                    iteration_id: it.iteration_id.clone(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn iterate(&mut self, it: &IterationContext, shutdown: &ShutdownToken) -> Result<IterationReport, IterationError> {
        let log = it.log_context();
        let primary = self.primary_serial().clone();

        // [1] METADATA
        let image_trusted = self.update_meta(it.mode, &log, Utc::now())?;
        self.check_cancel(shutdown)?;

        // [2] RECONCILIATION
        let plan = {
            let director = self.director.current_targets().ok_or_else(|| {
                IterationError::DirectorUntrusted(MetadataError::Missing {
                    repo: RepositoryType::Director,
                    role: Role::Targets,
                })
            })?;
            let image = if image_trusted {
                self.image.current_targets()
            } else {
                None
            };
            compute_ecu_targets(director, image, self.coordinator.registry())
        };

        let mut statuses: BTreeMap<EcuSerial, EcuUpdateStatus> = self
            .coordinator
            .registry()
            .all()
            .map(|ecu| (ecu.serial.clone(), EcuUpdateStatus::UpToDate))
            .collect();
        for inconsistency in &plan.inconsistencies {
            log::warn!(
                "{} ASSIGNMENT_DROPPED error={}",
                log.with_ecu(inconsistency.serial()),
                inconsistency
            );
            if let Some(status) = statuses.get_mut(inconsistency.serial()) {
                *status = EcuUpdateStatus::UpdateFailed {
                    reason: inconsistency.to_string(),
                };
            }
        }

        // [3] PENDING
        let mut installed: BTreeMap<EcuSerial, Target> = BTreeMap::new();
        for (serial, manifest) in self.coordinator.collect_manifests(&log) {
            match manifest {
                Ok(manifest) => {
                    if let Some(target) = manifest.installed_target() {
                        installed.insert(serial, target);
                    }
                }
                Err(e) => {
                    let reason = e.to_string();
                    statuses.insert(serial, EcuUpdateStatus::UpdateFailed { reason });
                }
            }
        }
        if let Some(target) = self.installer.installed_target() {
            installed.insert(primary.clone(), target);
        }
        let pending: BTreeMap<EcuSerial, Target> = plan
            .assignments
            .iter()
            .filter(|(serial, target)| !is_installed(installed.get(*serial), target))
            .map(|(serial, target)| (serial.clone(), target.clone()))
            .collect();
        log::info!(
            "{} UPDATE_PLAN assigned={} pending={} any_pending={}",
            log,
            plan.assignments.len(),
            pending.len(),
            has_pending_updates(&installed, &plan.assignments)
        );
        self.check_cancel(shutdown)?;

        // [4] DOWNLOAD
        let mut results: BTreeMap<EcuSerial, InstallOutcome> = BTreeMap::new();
        let ready = self.fetch_images(it.mode, &pending, &log, shutdown, &mut results)?;
        self.check_cancel(shutdown)?;

        // [5] SECONDARIES
        let for_secondaries: BTreeMap<EcuSerial, Target> = ready
            .iter()
            .filter(|(serial, _)| **serial != primary)
            .map(|(serial, target)| (serial.clone(), target.clone()))
            .collect();
        if !for_secondaries.is_empty() {
            self.distribute(&for_secondaries, &log, shutdown, &mut results)?;
        }

        // [6] PRIMARY
        if let Some(target) = ready.get(&primary) {
            self.check_cancel(shutdown)?;
            let outcome = if is_installed_on_primary(self.installer.as_ref(), target) {
                InstallOutcome::AlreadyInstalled
            } else {
                self.installer.install(target, self.storage.as_ref())
            };
            log::info!(
                "{} PRIMARY_INSTALL installer={} filename={} success={}",
                log.with_ecu(&primary),
                self.installer.name(),
                target.filename,
                outcome.is_success()
            );
            results.insert(primary.clone(), outcome);
        }

        // [7] CONFIRMATION
        let confirmed = if for_secondaries.is_empty() {
            BTreeMap::new()
        } else {
            self.coordinator.collect_manifests(&log)
        };
        for (serial, outcome) in results.iter_mut() {
            let Some(target) = pending.get(serial) else {
                continue;
            };
            if *serial != primary && *outcome == InstallOutcome::Success {
                let reported = confirmed
                    .get(serial)
                    .and_then(|m| m.as_ref().ok())
                    .and_then(|m| m.installed_target());
                if !is_installed(reported.as_ref(), target) {
                    *outcome = InstallOutcome::failure(
                        InstallErrorCode::SecondaryRejected,
                        "secondary manifest does not report the new image",
                    );
                }
            }
            if outcome.is_success() {
                self.record_installed(serial, target)?;
            }

            let status = match outcome {
                InstallOutcome::Success => EcuUpdateStatus::UpdateApplied,
                InstallOutcome::AlreadyInstalled => EcuUpdateStatus::UpToDate,
                InstallOutcome::Failure(failure) => EcuUpdateStatus::UpdateFailed {
                    reason: failure.reason.clone(),
                },
            };
            enqueue_installation_report(self.report_queue.as_ref(), &log, serial, target, outcome);
            self.events.emit(Event::InstallCompleted {
                serial: serial.clone(),
                outcome: outcome.clone(),
            });
            statuses.insert(serial.clone(), status);
        }
        if !results.is_empty() {
            self.last_results = results;
        }

        // [8] MANIFEST
        let manifest_delivered = self.submit_manifest(&log)?;

        Ok(IterationReport {
            iteration_id: it.iteration_id.clone(),
            mode: it.mode,
            assignments: plan.assignments,
            ecus: statuses,
            inconsistencies: plan.inconsistencies,
            manifest_delivered,
        })
    }

    /// Refresh both repositories. Returns whether Image metadata is
    /// trusted; an untrusted Director ends the iteration.
    fn update_meta(&mut self, mode: IterationMode, log: &LogContext, now: DateTime<Utc>) -> Result<bool, IterationError> {
        let storage = self.storage.as_ref();
        let source = TransportSource(self.transport.as_ref());

        let director = match mode {
            IterationMode::Online => self.director.refresh(&source, storage, now),
            IterationMode::Offline => self.director.check_offline(storage, now),
        };
        self.events.emit(Event::MetadataUpdated {
            repo: RepositoryType::Director,
            trusted: director.is_ok(),
        });
        if let Err(e) = director {
            log::error!("{} DIRECTOR_METADATA_REJECTED error={}", log, e);
            return Err(IterationError::director(e));
        }

        let image = match mode {
            IterationMode::Online => self.image.refresh(&source, storage, now),
            IterationMode::Offline => self.image.check_offline(storage, now),
        };
        self.events.emit(Event::MetadataUpdated {
            repo: RepositoryType::Image,
            trusted: image.is_ok(),
        });
        match image {
            Ok(()) => Ok(true),
            Err(MetadataError::Storage(e)) => Err(e.into()),
            Err(e) => {
                log::warn!(
                    "{} IMAGE_METADATA_REJECTED error={} action=drop_assignments",
                    log,
                    e
                );
                Ok(false)
            }
        }
    }

    /// Download (or check) every pending image once per filename.
    /// Returns the assignments whose image is in storage and verified.
    fn fetch_images(
        &self,
        mode: IterationMode,
        pending: &BTreeMap<EcuSerial, Target>,
        log: &LogContext,
        shutdown: &ShutdownToken,
        results: &mut BTreeMap<EcuSerial, InstallOutcome>,
    ) -> Result<BTreeMap<EcuSerial, Target>, IterationError> {
        let mut fetched: BTreeMap<String, Result<(), TransferError>> = BTreeMap::new();
        let mut ready = BTreeMap::new();

        for (serial, target) in pending {
            self.check_cancel(shutdown)?;
            let result = match fetched.get(&target.filename) {
                Some(previous) => previous.clone(),
                None => {
                    let ecu_log = log.with_ecu(serial);
                    let result = match mode {
                        IterationMode::Online => download_target(
                            self.transport.as_ref(),
                            self.storage.as_ref(),
                            target,
                            self.settings.download_retries,
                            &ecu_log,
                            shutdown,
                            &self.events,
                        ),
                        IterationMode::Offline => verify_stored_target(self.storage.as_ref(), target),
                    };
                    enqueue_download_report(self.report_queue.as_ref(), log, target, &result);
                    self.events.emit(Event::DownloadCompleted {
                        filename: target.filename.clone(),
                        success: result.is_ok(),
                    });
                    fetched.insert(target.filename.clone(), result.clone());
                    result
                }
            };

            match result {
                Ok(()) => {
                    ready.insert(serial.clone(), target.clone());
                }
                Err(TransferError::Interrupted) => return Err(IterationError::Cancelled),
                Err(e) => {
                    log::warn!(
                        "{} IMAGE_UNAVAILABLE filename={} error={}",
                        log.with_ecu(serial),
                        target.filename,
                        e
                    );
                    results.insert(serial.clone(), download_outcome(&e));
                }
            }
        }
        Ok(ready)
    }

    /// Send verified metadata, then each secondary's image.
    fn distribute(
        &self,
        assignments: &BTreeMap<EcuSerial, Target>,
        log: &LogContext,
        shutdown: &ShutdownToken,
        results: &mut BTreeMap<EcuSerial, InstallOutcome>,
    ) -> Result<(), IterationError> {
        let bundle = UptaneBundle {
            director: self.director.bundle(),
            image: self.image.bundle(),
        };
        let accepted = self
            .coordinator
            .send_metadata_to_ecus(&bundle, self.storage.as_ref(), log, shutdown);
        self.check_cancel(shutdown)?;

        let mut deliverable = BTreeMap::new();
        for (serial, target) in assignments {
            match accepted.get(serial) {
                Some(Err(e)) => {
                    results.insert(serial.clone(), secondary_outcome(e));
                }
                _ => {
                    deliverable.insert(serial.clone(), target.clone());
                }
            }
        }

        let sent = self
            .coordinator
            .send_images_to_ecus(&deliverable, self.storage.as_ref(), log, shutdown);
        for (serial, result) in sent {
            let outcome = match result {
                Ok(()) => InstallOutcome::Success,
                Err(e) => secondary_outcome(&e),
            };
            results.insert(serial, outcome);
        }
        self.check_cancel(shutdown)
    }

    fn record_installed(&self, serial: &EcuSerial, target: &Target) -> Result<(), StorageError> {
        let mut records = self.storage.load_installed_versions()?.unwrap_or_default();
        if is_installed(current_installed(&records, serial), target) {
            return Ok(());
        }
        mark_installed(&mut records, serial, target, Utc::now());
        self.storage.store_installed_versions(&records)
    }

    fn submit_manifest(&self, log: &LogContext) -> Result<bool, IterationError> {
        let records = self.storage.load_installed_versions()?;
        let inputs = ManifestInputs {
            primary: self.coordinator.registry().primary(),
            key: &self.primary_key,
            installed: records.as_deref(),
            secondary_manifests: self.coordinator.last_manifests(),
            secondary_errors: self.coordinator.manifest_errors(),
            installation_results: &self.last_results,
            hardware_info: self.facts.hardware_info(),
            network_info: self.facts.network_info(),
        };
        let manifest = assemble_manifest(&inputs, Utc::now());
        let delivered = put_manifest(self.transport.as_ref(), self.report_queue.as_ref(), &manifest, log);
        self.events.emit(Event::ManifestSent { delivered });
        Ok(delivered)
    }

    /// Refresh secondary manifests and submit a vehicle manifest.
    pub fn send_manifest(&mut self) -> Result<bool, IterationError> {
        let log = LogContext::background();
        self.coordinator.collect_manifests(&log);
        self.submit_manifest(&log)
    }

    /// Consume commands until `Shutdown`, a closed channel or the shutdown
    /// token. Update failures never end the loop.
    pub fn run_forever(&mut self, commands: &Receiver<Command>, shutdown: &ShutdownToken) {
        log::info!(
            "CLIENT_START primary={} ecus={}",
            self.primary_serial(),
            self.coordinator.registry().len()
        );
        self.initialize();

        loop {
            if shutdown.is_requested() {
                log::info!("CLIENT_STOP reason=shutdown_token");
                break;
            }
            let command = match commands.recv_timeout(self.settings.command_poll_interval) {
                Ok(command) => command,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    log::info!("CLIENT_STOP reason=channel_closed");
                    break;
                }
            };
            log::debug!("COMMAND_RECEIVED command={:?}", command);

            match command {
                Command::Shutdown => {
                    log::info!("CLIENT_STOP reason=command");
                    break;
                }
                Command::CheckUpdates => {
                    self.report_network_if_changed();
                    // failures are logged and reported by the iteration itself
                    let _ = self.online_iteration(shutdown);
                }
                Command::OfflineUpdate => {
                    let _ = self.offline_iteration(shutdown);
                }
                Command::SendManifest => {
                    if let Err(e) = self.send_manifest() {
                        log::warn!("MANIFEST_NOT_ASSEMBLED error={}", e);
                    }
                }
            }
        }
    }
}

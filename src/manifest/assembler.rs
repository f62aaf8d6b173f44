//! Vehicle manifest assembly and delivery.
//!
//! The vehicle manifest wraps the primary's own ECU version manifest, an
//! entry for every secondary, the installation results of the last
//! iteration and the device facts, all signed by the primary.
//!
//! A secondary that answered with a verified manifest is listed with that
//! envelope. One whose latest manifest request failed is listed as
//! `{"error": ..., "last_known": <envelope or null>}` so the server never
//! mistakes a stale version for the current one.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ed25519_dalek::SigningKey;
use serde_json::{json, Map, Value};

use crate::ecu::{Ecu, EcuSerial};
use crate::interfaces::{InstallOutcome, ReportQueue, TransferError, Transport};
use crate::logging::LogContext;
use crate::metadata::{sign_document, Target};
use crate::storage::{current_installed, InstalledVersionRecord};

use super::version::EcuVersionManifest;

/// Everything a manifest is built from.
pub struct ManifestInputs<'a> {
    pub primary: &'a Ecu,
    pub key: &'a SigningKey,
    /// `None` when the device has never recorded an installation.
    pub installed: Option<&'a [InstalledVersionRecord]>,
    pub secondary_manifests: &'a BTreeMap<EcuSerial, Value>,
    /// Secondaries whose latest manifest request failed, with the reason.
    pub secondary_errors: &'a BTreeMap<EcuSerial, String>,
    pub installation_results: &'a BTreeMap<EcuSerial, InstallOutcome>,
    pub hardware_info: Value,
    pub network_info: Value,
}

pub fn assemble_manifest(inputs: &ManifestInputs<'_>, now: DateTime<Utc>) -> Value {
    let primary_serial = &inputs.primary.serial;
    let installed = inputs
        .installed
        .and_then(|records| current_installed(records, primary_serial));

    let mut primary_manifest = EcuVersionManifest::new(
        primary_serial.clone(),
        inputs.primary.hardware_id.clone(),
        installed,
    );
    primary_manifest.installation_result = inputs.installation_results.get(primary_serial).cloned();

    let mut ecu_manifests = Map::new();
    ecu_manifests.insert(primary_serial.to_string(), primary_manifest.sign(inputs.key));
    for (serial, envelope) in inputs.secondary_manifests {
        if !inputs.secondary_errors.contains_key(serial) {
            ecu_manifests.insert(serial.to_string(), envelope.clone());
        }
    }
    for (serial, reason) in inputs.secondary_errors {
        ecu_manifests.insert(
            serial.to_string(),
            json!({
                "error": reason,
                "last_known": inputs.secondary_manifests.get(serial),
            }),
        );
    }

    let results: Map<String, Value> = inputs
        .installation_results
        .iter()
        .map(|(serial, outcome)| {
            (
                serial.to_string(),
                serde_json::to_value(outcome).unwrap_or(Value::Null),
            )
        })
        .collect();

    let signed = json!({
        "primary_ecu_serial": primary_serial,
        "generated_at": now.to_rfc3339(),
        "ecu_version_manifests": ecu_manifests,
        "installation_report": results,
        "attestation": {
            "hardware": inputs.hardware_info,
            "network": inputs.network_info,
        },
    });
    sign_document(signed, &[inputs.key])
}

/// Installed targets per ECU as a vehicle manifest reports them.
///
/// Entries that do not parse are skipped; signatures are not checked here.
pub fn installed_images(manifest: &Value) -> BTreeMap<EcuSerial, Target> {
    let Some(ecus) = manifest["signed"]["ecu_version_manifests"].as_object() else {
        return BTreeMap::new();
    };
    ecus.values()
        .filter_map(|envelope| {
            serde_json::from_value::<EcuVersionManifest>(envelope["signed"].clone()).ok()
        })
        .filter_map(|m| m.installed_target().map(|t| (m.ecu_serial, t)))
        .collect()
}

/// Submit `manifest`. On failure it goes to the report queue instead of
/// being dropped. Returns whether the transport accepted it.
pub fn put_manifest(
    transport: &dyn Transport,
    queue: &dyn ReportQueue,
    manifest: &Value,
    ctx: &LogContext,
) -> bool {
    match transport.put_manifest(manifest) {
        Ok(()) => {
            log::info!("{} MANIFEST_SENT", ctx);
            true
        }
        Err(e) => {
            log::warn!("{} MANIFEST_SEND_FAILED error={} action=enqueued", ctx, e);
            queue.enqueue(json!({ "type": "manifest", "manifest": manifest }));
            false
        }
    }
}

pub fn enqueue_download_report(
    queue: &dyn ReportQueue,
    ctx: &LogContext,
    target: &Target,
    result: &Result<(), TransferError>,
) {
    let (success, reason) = match result {
        Ok(()) => (true, None),
        Err(e) => (false, Some(e.to_string())),
    };
    queue.enqueue(json!({
        "type": "download_report",
        "iteration": ctx.iteration_id,
        "filename": target.filename,
        "length": target.length,
        "success": success,
        "reason": reason,
    }));
}

pub fn enqueue_installation_report(
    queue: &dyn ReportQueue,
    ctx: &LogContext,
    serial: &EcuSerial,
    target: &Target,
    outcome: &InstallOutcome,
) {
    queue.enqueue(json!({
        "type": "installation_report",
        "iteration": ctx.iteration_id,
        "ecu_serial": serial,
        "filename": target.filename,
        "result": outcome,
    }));
}

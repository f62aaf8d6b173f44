//! Persistent records.
//!
//! These models represent what the storage collaborator keeps between
//! iterations and across restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ecu::{EcuSerial, HardwareIdentifier};
use crate::metadata::Target;

/// One installation of a target on an ECU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledVersionRecord {
    pub ecu_serial: EcuSerial,
    pub target: Target,
    pub installed_at: DateTime<Utc>,
    /// The version currently running on the ECU.
    pub is_current: bool,
}

/// The current target of `serial` in a set of records.
pub fn current_installed<'a>(
    records: &'a [InstalledVersionRecord],
    serial: &EcuSerial,
) -> Option<&'a Target> {
    records
        .iter()
        .rev()
        .find(|r| r.is_current && &r.ecu_serial == serial)
        .map(|r| &r.target)
}

/// Record a new current target for `serial`; earlier records for the same
/// ECU stay as history.
pub fn mark_installed(
    records: &mut Vec<InstalledVersionRecord>,
    serial: &EcuSerial,
    target: &Target,
    installed_at: DateTime<Utc>,
) {
    for record in records.iter_mut().filter(|r| &r.ecu_serial == serial) {
        record.is_current = false;
    }
    records.push(InstalledVersionRecord {
        ecu_serial: serial.clone(),
        target: target.clone(),
        installed_at,
        is_current: true,
    });
}

/// Why a discovered or registered ECU does not line up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisconfiguredState {
    /// Discovered now but absent from the registered set.
    NotRegistered,
    /// Registered earlier but no longer discovered.
    Old,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MisconfiguredEcu {
    pub serial: EcuSerial,
    pub hardware_id: HardwareIdentifier,
    pub state: MisconfiguredState,
}

//! ECU identity.
//!
//! Serials and hardware identifiers are kept as distinct newtypes so a
//! hardware id can never be compared against a serial by accident.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier of one ECU.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EcuSerial(String);

impl EcuSerial {
    pub fn new(serial: impl Into<String>) -> Self {
        Self(serial.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EcuSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hardware type of an ECU. Many ECUs may share one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HardwareIdentifier(String);

impl HardwareIdentifier {
    pub fn new(hardware_id: impl Into<String>) -> Self {
        Self(hardware_id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HardwareIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EcuRole {
    Primary,
    Secondary,
}

/// One registered ECU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ecu {
    pub serial: EcuSerial,
    pub hardware_id: HardwareIdentifier,
    pub role: EcuRole,
}

impl Ecu {
    pub fn primary(serial: EcuSerial, hardware_id: HardwareIdentifier) -> Self {
        Self {
            serial,
            hardware_id,
            role: EcuRole::Primary,
        }
    }

    pub fn secondary(serial: EcuSerial, hardware_id: HardwareIdentifier) -> Self {
        Self {
            serial,
            hardware_id,
            role: EcuRole::Secondary,
        }
    }
}

/// Every ECU known to this device, keyed by serial.
///
/// Built once at startup; read-only for the rest of the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcuRegistry {
    primary: Ecu,
    secondaries: BTreeMap<EcuSerial, Ecu>,
}

impl EcuRegistry {
    pub fn new(primary: Ecu) -> Self {
        Self {
            primary,
            secondaries: BTreeMap::new(),
        }
    }

    /// Register a secondary. Returns false if the serial is already taken.
    pub fn add_secondary(&mut self, ecu: Ecu) -> bool {
        if ecu.serial == self.primary.serial || self.secondaries.contains_key(&ecu.serial) {
            return false;
        }
        self.secondaries.insert(ecu.serial.clone(), ecu);
        true
    }

    pub fn primary(&self) -> &Ecu {
        &self.primary
    }

    pub fn is_primary(&self, serial: &EcuSerial) -> bool {
        &self.primary.serial == serial
    }

    pub fn get(&self, serial: &EcuSerial) -> Option<&Ecu> {
        if self.is_primary(serial) {
            Some(&self.primary)
        } else {
            self.secondaries.get(serial)
        }
    }

    pub fn hardware_id(&self, serial: &EcuSerial) -> Option<&HardwareIdentifier> {
        self.get(serial).map(|ecu| &ecu.hardware_id)
    }

    pub fn secondaries(&self) -> impl Iterator<Item = &Ecu> {
        self.secondaries.values()
    }

    /// Primary first, then secondaries in serial order.
    pub fn all(&self) -> impl Iterator<Item = &Ecu> {
        std::iter::once(&self.primary).chain(self.secondaries.values())
    }

    pub fn len(&self) -> usize {
        1 + self.secondaries.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

//! Reconciliation inconsistencies.

use serde::Serialize;
use thiserror::Error;

use crate::ecu::{EcuSerial, HardwareIdentifier};

/// Why a Director assignment was dropped. Never fatal to the batch.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconciliationError {
    #[error("{filename} for {serial}: director and image repositories disagree on length or hashes")]
    HashMismatchAcrossRepos { filename: String, serial: EcuSerial },

    #[error("{filename}: assigned to unknown ECU {serial}")]
    UnknownEcuSerial { filename: String, serial: EcuSerial },

    #[error("{filename}: ECU {serial} is {registered}, target is for {declared}")]
    HardwareIdMismatch {
        filename: String,
        serial: EcuSerial,
        registered: HardwareIdentifier,
        declared: HardwareIdentifier,
    },

    #[error("{filename} for {serial}: not described by the image repository")]
    MissingImageTarget { filename: String, serial: EcuSerial },

    #[error("ECU {serial} assigned more than one target: {filenames:?}")]
    ConflictingAssignment {
        serial: EcuSerial,
        filenames: Vec<String>,
    },
}

impl ReconciliationError {
    /// The ECU whose assignment was dropped.
    pub fn serial(&self) -> &EcuSerial {
        match self {
            ReconciliationError::HashMismatchAcrossRepos { serial, .. }
            | ReconciliationError::UnknownEcuSerial { serial, .. }
            | ReconciliationError::HardwareIdMismatch { serial, .. }
            | ReconciliationError::MissingImageTarget { serial, .. }
            | ReconciliationError::ConflictingAssignment { serial, .. } => serial,
        }
    }
}

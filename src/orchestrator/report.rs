//! Iteration results.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::ecu::EcuSerial;
use crate::metadata::Target;
use crate::reconcile::ReconciliationError;

use super::context::IterationMode;

/// What happened to one ECU during an iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EcuUpdateStatus {
    UpToDate,
    UpdateApplied,
    UpdateFailed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct IterationReport {
    pub iteration_id: String,
    pub mode: IterationMode,
    /// Reconciled plan: the one target each ECU should run.
    pub assignments: BTreeMap<EcuSerial, Target>,
    pub ecus: BTreeMap<EcuSerial, EcuUpdateStatus>,
    pub inconsistencies: Vec<ReconciliationError>,
    pub manifest_delivered: bool,
}

impl IterationReport {
    pub fn status(&self, serial: &EcuSerial) -> Option<&EcuUpdateStatus> {
        self.ecus.get(serial)
    }

    pub fn updated(&self) -> usize {
        self.count(|s| matches!(s, EcuUpdateStatus::UpdateApplied))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, EcuUpdateStatus::UpdateFailed { .. }))
    }

    fn count(&self, pred: impl Fn(&EcuUpdateStatus) -> bool) -> usize {
        self.ecus.values().filter(|s| pred(s)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_report_serializes_with_status_tag() {
        let mut ecus = BTreeMap::new();
        ecus.insert(EcuSerial::new("P0"), EcuUpdateStatus::UpToDate);
        ecus.insert(EcuSerial::new("S1"), EcuUpdateStatus::UpdateApplied);
        ecus.insert(
            EcuSerial::new("S2"),
            EcuUpdateStatus::UpdateFailed {
                reason: "unreachable".to_string(),
            },
        );
        let report = IterationReport {
            iteration_id: "it-1".to_string(),
            mode: IterationMode::Online,
            assignments: BTreeMap::new(),
            ecus,
            inconsistencies: Vec::new(),
            manifest_delivered: true,
        };

        assert_eq!(report.updated(), 1);
        assert_eq!(report.failed(), 1);
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["mode"], "online");
        assert_eq!(value["ecus"]["S1"], json!({ "status": "update_applied" }));
        assert_eq!(value["ecus"]["S2"]["reason"], "unreachable");
    }
}

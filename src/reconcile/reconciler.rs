//! Director/Image cross-check.
//!
//! Every Director target names the ECUs it is destined for. A pair
//! (target, serial) becomes an assignment only when the ECU is known with
//! the declared hardware id and the Image repository describes the same
//! content under the same filename.

use std::collections::BTreeMap;

use crate::ecu::{EcuRegistry, EcuSerial};
use crate::interfaces::PackageManager;
use crate::metadata::{Target, Targets};

use super::error::ReconciliationError;

/// Authoritative per-ECU plan for one iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub assignments: BTreeMap<EcuSerial, Target>,
    pub inconsistencies: Vec<ReconciliationError>,
}

impl Reconciliation {
    pub fn target_for(&self, serial: &EcuSerial) -> Option<&Target> {
        self.assignments.get(serial)
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}

fn check_pair(
    director: &Target,
    serial: &EcuSerial,
    image: Option<&Targets>,
    registry: &EcuRegistry,
) -> Result<Target, ReconciliationError> {
    let filename = &director.filename;

    let registered = registry
        .hardware_id(serial)
        .ok_or_else(|| ReconciliationError::UnknownEcuSerial {
            filename: filename.clone(),
            serial: serial.clone(),
        })?;

    if let Some(declared) = director.ecus.get(serial) {
        if declared != registered {
            return Err(ReconciliationError::HardwareIdMismatch {
                filename: filename.clone(),
                serial: serial.clone(),
                registered: registered.clone(),
                declared: declared.clone(),
            });
        }
    }

    let image_target = image
        .and_then(|targets| targets.get(filename))
        .ok_or_else(|| ReconciliationError::MissingImageTarget {
            filename: filename.clone(),
            serial: serial.clone(),
        })?;

    if !director.same_content(image_target) {
        return Err(ReconciliationError::HashMismatchAcrossRepos {
            filename: filename.clone(),
            serial: serial.clone(),
        });
    }

    // Image targets may restrict the hardware they are built for.
    if !image_target.hardware_ids.is_empty() && !image_target.hardware_ids.contains(registered) {
        let declared = image_target.hardware_ids[0].clone();
        return Err(ReconciliationError::HardwareIdMismatch {
            filename: filename.clone(),
            serial: serial.clone(),
            registered: registered.clone(),
            declared,
        });
    }

    let mut assigned = director.clone();
    assigned.hardware_ids = image_target.hardware_ids.clone();
    Ok(assigned)
}

/// Cross-check Director assignments against the Image repository.
///
/// `image` is `None` when Image metadata is not trusted this iteration, in
/// which case no assignment survives. Offending pairs are dropped and
/// reported; the rest of the batch proceeds.
pub fn compute_ecu_targets(
    director: &Targets,
    image: Option<&Targets>,
    registry: &EcuRegistry,
) -> Reconciliation {
    let mut candidates: BTreeMap<EcuSerial, Vec<Target>> = BTreeMap::new();
    let mut inconsistencies = Vec::new();

    for target in director.iter() {
        if target.ecus.is_empty() {
            log::debug!("RECONCILE_SKIP_UNASSIGNED filename={}", target.filename);
            continue;
        }
        for serial in target.ecus.keys() {
            match check_pair(target, serial, image, registry) {
                Ok(assigned) => candidates.entry(serial.clone()).or_default().push(assigned),
                Err(e) => {
                    log::warn!("RECONCILE_DROPPED serial={} error={}", serial, e);
                    inconsistencies.push(e);
                }
            }
        }
    }

    let mut assignments = BTreeMap::new();
    for (serial, mut targets) in candidates {
        let first = targets.remove(0);
        if targets.iter().all(|t| t.same_content(&first)) {
            assignments.insert(serial, first);
            continue;
        }
        let mut filenames = vec![first.filename];
        filenames.extend(targets.into_iter().map(|t| t.filename));
        let e = ReconciliationError::ConflictingAssignment {
            serial: serial.clone(),
            filenames,
        };
        log::warn!("RECONCILE_DROPPED serial={} error={}", serial, e);
        inconsistencies.push(e);
    }

    Reconciliation {
        assignments,
        inconsistencies,
    }
}

/// Whether `installed` is the same image as `target`. Filenames are ignored.
pub fn is_installed(installed: Option<&Target>, target: &Target) -> bool {
    installed.map_or(false, |current| current.same_content(target))
}

pub fn is_installed_on_primary(installer: &dyn PackageManager, target: &Target) -> bool {
    is_installed(installer.installed_target().as_ref(), target)
}

/// Whether any assigned ECU reports something other than its assignment.
pub fn has_pending_updates(
    installed: &BTreeMap<EcuSerial, Target>,
    assignments: &BTreeMap<EcuSerial, Target>,
) -> bool {
    assignments
        .iter()
        .any(|(serial, target)| !is_installed(installed.get(serial), target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecu::{Ecu, HardwareIdentifier};
    use crate::metadata::parse_targets;
    use crate::testing::{director_targets, image_targets, target_for};
    use proptest::prelude::*;
    use serde_json::{json, Value};

    fn targets(entries: Value) -> Targets {
        parse_targets(&json!({ "targets": entries })).unwrap()
    }

    fn registry() -> EcuRegistry {
        let mut registry = EcuRegistry::new(Ecu::primary(
            EcuSerial::new("P0"),
            HardwareIdentifier::new("primary-hw"),
        ));
        registry.add_secondary(Ecu::secondary(EcuSerial::new("S1"), HardwareIdentifier::new("ecu-a")));
        registry.add_secondary(Ecu::secondary(EcuSerial::new("S2"), HardwareIdentifier::new("ecu-b")));
        registry
    }

    fn fw(len: usize, fill: u8) -> Vec<u8> {
        vec![fill; len]
    }

    #[test]
    fn test_single_assignment_leaves_other_ecu_unassigned() {
        let content = fw(1024, 1);
        let director = targets(director_targets(&[("fw-2.0.bin", &content[..], "S1", "ecu-a")]));
        let image = targets(image_targets(&[("fw-2.0.bin", &content[..])]));

        let result = compute_ecu_targets(&director, Some(&image), &registry());

        assert!(result.inconsistencies.is_empty());
        assert_eq!(result.assignments.len(), 1);
        let assigned = result.target_for(&EcuSerial::new("S1")).unwrap();
        assert_eq!(assigned.filename, "fw-2.0.bin");
        assert_eq!(assigned.length, 1024);
        assert!(assigned.same_content(&target_for("fw-2.0.bin", &content[..])));
        assert!(result.target_for(&EcuSerial::new("S2")).is_none());
    }

    #[test]
    fn test_hardware_mismatch_dropped() {
        let content = fw(64, 3);
        let director = targets(director_targets(&[("fw-3.0.bin", &content[..], "S1", "ecu-b")]));
        let image = targets(image_targets(&[("fw-3.0.bin", &content[..])]));

        let result = compute_ecu_targets(&director, Some(&image), &registry());

        assert!(result.is_empty());
        assert_eq!(
            result.inconsistencies,
            vec![ReconciliationError::HardwareIdMismatch {
                filename: "fw-3.0.bin".to_string(),
                serial: EcuSerial::new("S1"),
                registered: HardwareIdentifier::new("ecu-a"),
                declared: HardwareIdentifier::new("ecu-b"),
            }]
        );
    }

    #[test]
    fn test_image_hardware_ids_restrict_assignment() {
        let content = fw(64, 4);
        let director = targets(director_targets(&[("fw.bin", &content[..], "S1", "ecu-a")]));
        let mut image_entries = image_targets(&[("fw.bin", &content[..])]);
        image_entries["fw.bin"]["custom"] = json!({ "hardwareIds": ["ecu-b"] });
        let image = targets(image_entries);

        let result = compute_ecu_targets(&director, Some(&image), &registry());
        assert!(result.is_empty());
        assert!(matches!(
            result.inconsistencies[0],
            ReconciliationError::HardwareIdMismatch { .. }
        ));
    }

    #[test]
    fn test_unknown_serial_and_missing_image() {
        let a = fw(10, 1);
        let b = fw(10, 2);
        let director = targets(director_targets(&[
            ("a.bin", &a[..], "S9", "ecu-a"),
            ("b.bin", &b[..], "S2", "ecu-b"),
        ]));
        let image = targets(image_targets(&[("a.bin", &a[..])]));

        let result = compute_ecu_targets(&director, Some(&image), &registry());
        assert!(result.is_empty());
        assert!(result.inconsistencies.contains(&ReconciliationError::UnknownEcuSerial {
            filename: "a.bin".to_string(),
            serial: EcuSerial::new("S9"),
        }));
        assert!(result.inconsistencies.contains(&ReconciliationError::MissingImageTarget {
            filename: "b.bin".to_string(),
            serial: EcuSerial::new("S2"),
        }));
    }

    #[test]
    fn test_untrusted_image_drops_everything() {
        let content = fw(10, 1);
        let director = targets(director_targets(&[("a.bin", &content[..], "S1", "ecu-a")]));
        let result = compute_ecu_targets(&director, None, &registry());
        assert!(result.is_empty());
        assert_eq!(result.inconsistencies.len(), 1);
    }

    #[test]
    fn test_conflicting_assignment_dropped() {
        let a = fw(10, 1);
        let b = fw(10, 2);
        let director = targets(director_targets(&[
            ("a.bin", &a[..], "S1", "ecu-a"),
            ("b.bin", &b[..], "S1", "ecu-a"),
        ]));
        let image = targets(image_targets(&[("a.bin", &a[..]), ("b.bin", &b[..])]));

        let result = compute_ecu_targets(&director, Some(&image), &registry());
        assert!(result.is_empty());
        assert_eq!(
            result.inconsistencies,
            vec![ReconciliationError::ConflictingAssignment {
                serial: EcuSerial::new("S1"),
                filenames: vec!["a.bin".to_string(), "b.bin".to_string()],
            }]
        );
    }

    #[test]
    fn test_pending_updates() {
        let current = target_for("v1.bin", b"one");
        let next = target_for("v2.bin", b"two");
        let s1 = EcuSerial::new("S1");
        let assignments = BTreeMap::from([(s1.clone(), next.clone())]);

        let mut installed = BTreeMap::from([(s1.clone(), current)]);
        assert!(has_pending_updates(&installed, &assignments));

        // same content under another name counts as installed
        let mut renamed = next;
        renamed.filename = "renamed.bin".to_string();
        installed.insert(s1, renamed);
        assert!(!has_pending_updates(&installed, &assignments));
        assert!(!has_pending_updates(&installed, &BTreeMap::new()));
    }

    proptest! {
        #[test]
        fn prop_assignment_iff_identical_content(
            director_content in proptest::collection::vec(any::<u8>(), 0..64),
            image_content in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let director = targets(director_targets(&[("fw.bin", &director_content[..], "S1", "ecu-a")]));
            let image = targets(image_targets(&[("fw.bin", &image_content[..])]));

            let result = compute_ecu_targets(&director, Some(&image), &registry());
            prop_assert_eq!(result.assignments.len() == 1, director_content == image_content);
        }

        #[test]
        fn prop_never_assigns_across_hardware(declared in "ecu-[a-c]", serial in "S[1-3]") {
            let content = fw(8, 7);
            let director = targets(director_targets(&[("fw.bin", &content[..], serial.as_str(), declared.as_str())]));
            let image = targets(image_targets(&[("fw.bin", &content[..])]));
            let registry = registry();

            let result = compute_ecu_targets(&director, Some(&image), &registry);
            for (serial, _) in &result.assignments {
                prop_assert_eq!(
                    registry.hardware_id(serial),
                    Some(&HardwareIdentifier::new(declared.clone()))
                );
            }
        }

        #[test]
        fn prop_installed_ignores_filename(name_a in "[a-z]{1,8}\\.bin", name_b in "[a-z]{1,8}\\.bin") {
            let installed = target_for(&name_a, b"image");
            let candidate = target_for(&name_b, b"image");
            prop_assert!(is_installed(Some(&installed), &candidate));
            prop_assert!(!is_installed(Some(&installed), &target_for(&name_b, b"other")));
        }
    }
}

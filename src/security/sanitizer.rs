//! Validation of untrusted names.
//!
//! Target filenames come from remote metadata and ECU serials from
//! discovery; both end up in filesystem paths. Rejected patterns:
//! - Path traversal and path separators
//! - Absolute and drive-letter paths
//! - Control characters
//! - Oversized names

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

/// Longest accepted name, in bytes.
pub const MAX_NAME_LENGTH: usize = 255;

lazy_static! {
    /// Path traversal / path-like patterns
    static ref PATH_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(^|[\\/])\.\.([\\/]|$)").unwrap(),
        Regex::new(r"^[\\/]").unwrap(),
        Regex::new(r"^[A-Za-z]:").unwrap(),
        Regex::new(r"[\\/]").unwrap(),
    ];

    /// Control characters
    static ref CONTROL_PATTERN: Regex = Regex::new(r"[\x00-\x1f\x7f]").unwrap();

    /// Characters allowed in an ECU serial
    static ref SERIAL_PATTERN: Regex = Regex::new(r"^[A-Za-z0-9._:\-]+$").unwrap();
}

/// Why a name was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameRejection {
    #[error("name is empty")]
    Empty,

    #[error("name is {len} bytes, limit is {max}")]
    TooLong { len: usize, max: usize },

    #[error("name contains a path component: {0}")]
    PathLike(String),

    #[error("name contains control characters")]
    ControlCharacter,

    #[error("name contains characters outside [A-Za-z0-9._:-]")]
    InvalidCharacters,
}

fn check_common(name: &str) -> Result<(), NameRejection> {
    if name.is_empty() || name == "." {
        return Err(NameRejection::Empty);
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(NameRejection::TooLong {
            len: name.len(),
            max: MAX_NAME_LENGTH,
        });
    }
    if CONTROL_PATTERN.is_match(name) {
        return Err(NameRejection::ControlCharacter);
    }
    for pattern in PATH_PATTERNS.iter() {
        if pattern.is_match(name) {
            log::debug!(
                "PATTERN_DETECTED type=path pattern={} name={:?}",
                pattern.as_str(),
                name
            );
            return Err(NameRejection::PathLike(pattern.as_str().to_string()));
        }
    }
    Ok(())
}

/// Validate a target filename before it is used as a storage key.
pub fn validate_target_filename(filename: &str) -> Result<(), NameRejection> {
    check_common(filename).map_err(|e| {
        log::warn!("TARGET_FILENAME_REJECTED filename={:?} reason={}", filename, e);
        e
    })
}

/// Validate an ECU serial.
pub fn validate_ecu_serial(serial: &str) -> Result<(), NameRejection> {
    check_common(serial)?;
    if !SERIAL_PATTERN.is_match(serial) {
        log::warn!("ECU_SERIAL_REJECTED serial={:?}", serial);
        return Err(NameRejection::InvalidCharacters);
    }
    Ok(())
}

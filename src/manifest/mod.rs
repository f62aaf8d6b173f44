//! Manifest module.
//!
//! - `version` - per-ECU version manifest, signed by each ECU
//! - `assembler` - vehicle manifest assembly, delivery and reports

pub mod assembler;
pub mod version;

pub use assembler::*;
pub use version::*;

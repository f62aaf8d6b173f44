//! Security module.
//!
//! Validation of untrusted names before they reach the filesystem.

pub mod sanitizer;

pub use sanitizer::*;

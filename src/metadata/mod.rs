//! Metadata document model.
//!
//! Typed, versioned, signed documents and pure verification over supplied
//! trust material:
//! - Envelope parsing and canonical signable payloads
//! - Ed25519 signature threshold checks
//! - Version and expiry checks
//! - Content hashing for targets

pub mod document;
pub mod error;
pub mod hash;
pub mod signature;
pub mod types;

pub use document::*;
pub use error::*;
pub use hash::*;
pub use signature::*;
pub use types::*;

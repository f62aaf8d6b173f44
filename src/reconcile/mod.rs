//! Target reconciliation module.
//!
//! Turns trusted Director and Image targets plus the ECU registry into the
//! per-ECU update plan, and answers "is this already installed" by content
//! identity.

pub mod error;
pub mod reconciler;

pub use error::*;
pub use reconciler::*;

//! Secondary ECU module.
//!
//! - `interface` - capability trait every secondary channel implements
//! - `coordinator` - owns the secondaries and drives them per ECU
//! - `virtual_secondary` - in-process full-verification secondary

pub mod coordinator;
pub mod interface;
pub mod virtual_secondary;

pub use coordinator::*;
pub use interface::*;
pub use virtual_secondary::*;

//! Structured logging with iteration context.
//!
//! Every log line carries the iteration id (and the ECU serial where one
//! applies) so a full update cycle can be followed across components.

pub mod structured;

pub use structured::*;

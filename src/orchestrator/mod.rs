//! Update orchestration module.
//!
//! - `client` - the iteration pipeline and the command loop
//! - `download` - verified image download into storage
//! - `context` - iteration identity for logs and reports
//! - `commands` / `events` - bounded control and lifecycle channels
//! - `report` - per-ECU iteration results
//! - `shutdown` - cooperative cancellation token

pub mod client;
pub mod commands;
pub mod context;
pub mod download;
pub mod error;
pub mod events;
pub mod report;
pub mod shutdown;

pub use client::*;
pub use commands::*;
pub use context::*;
pub use download::*;
pub use error::*;
pub use events::*;
pub use report::*;
pub use shutdown::*;

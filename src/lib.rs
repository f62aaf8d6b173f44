//! Uptane client - two-repository, multi-ECU secure update client
//!
//! This crate fetches signed metadata from a Director repository (which
//! assigns images to ECUs) and an Image repository (which describes the
//! images), reconciles the two into a per-ECU plan, downloads and verifies
//! images, distributes them to secondary ECUs, installs on the primary and
//! reports the result in a signed manifest. The implementation prioritizes:
//!
//! 1. **Security** - nothing reaches an ECU without verified metadata and content
//! 2. **Logging** - every decision point logged with iteration and ECU context
//! 3. **Isolation** - one ECU failing never stops the others
//!
//! ## Architecture
//!
//! The crate is organized into modules:
//! - `metadata` - signed document model and pure verification
//! - `repository` - per-repository trust state, root rotation, refresh
//! - `reconcile` - Director/Image reconciliation into ECU assignments
//! - `secondary` - secondary ECU interface, coordinator, virtual secondary
//! - `orchestrator` - iteration pipeline, downloads, command loop
//! - `manifest` - ECU and vehicle manifests, report delivery
//! - `interfaces` - transport, installer, report queue and facts traits
//! - `storage` - persistent storage trait and filesystem implementation
//! - `ecu` - ECU identity and registry
//! - `security` - validation of untrusted names
//! - `config` - TOML client configuration
//! - `logging` - structured logging with iteration context

pub mod config;
pub mod ecu;
pub mod interfaces;
pub mod logging;
pub mod manifest;
pub mod metadata;
pub mod orchestrator;
pub mod reconcile;
pub mod repository;
pub mod secondary;
pub mod security;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;

pub use config::ClientConfig;
pub use orchestrator::{Command, ShutdownToken, UptaneClient};

/// Initialize the process-wide logger.
///
/// Safe to call more than once; later calls leave the first logger in place.
pub fn init_logger() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_millis()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logger_is_idempotent() {
        init_logger();
        init_logger();
        log::info!("LOGGER_READY");
    }
}

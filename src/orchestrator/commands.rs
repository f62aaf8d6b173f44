//! Control commands consumed by the orchestrator loop.

use crossbeam_channel::{bounded, Receiver, Sender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Run an online iteration.
    CheckUpdates,
    /// Run an iteration from pre-staged metadata and images.
    OfflineUpdate,
    /// Assemble and submit a manifest without updating.
    SendManifest,
    Shutdown,
}

/// Bounded FIFO command queue. Senders block when it is full.
pub fn command_channel(capacity: usize) -> (Sender<Command>, Receiver<Command>) {
    bounded(capacity.max(1))
}

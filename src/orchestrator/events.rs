//! Lifecycle events emitted by the orchestrator.
//!
//! Events are fire-and-forget: a full or abandoned channel never slows the
//! update pipeline down, the event is dropped and logged instead.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::ecu::EcuSerial;
use crate::interfaces::InstallOutcome;
use crate::metadata::RepositoryType;

use super::context::IterationMode;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    IterationStarted {
        iteration_id: String,
        mode: IterationMode,
    },
    MetadataUpdated {
        repo: RepositoryType,
        trusted: bool,
    },
    /// Bytes of `filename` received so far in the current attempt.
    DownloadProgress {
        filename: String,
        received: u64,
        total: u64,
    },
    DownloadCompleted {
        filename: String,
        success: bool,
    },
    InstallCompleted {
        serial: EcuSerial,
        outcome: InstallOutcome,
    },
    ManifestSent {
        delivered: bool,
    },
    IterationFinished {
        iteration_id: String,
        updated: usize,
        failed: usize,
    },
    IterationFailed {
        iteration_id: String,
        reason: String,
    },
}

impl Event {
    fn name(&self) -> &'static str {
        match self {
            Event::IterationStarted { .. } => "iteration_started",
            Event::MetadataUpdated { .. } => "metadata_updated",
            Event::DownloadProgress { .. } => "download_progress",
            Event::DownloadCompleted { .. } => "download_completed",
            Event::InstallCompleted { .. } => "install_completed",
            Event::ManifestSent { .. } => "manifest_sent",
            Event::IterationFinished { .. } => "iteration_finished",
            Event::IterationFailed { .. } => "iteration_failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<Event>,
}

impl EventSender {
    pub fn new(tx: Sender<Event>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                log::warn!("EVENT_DROPPED event={} reason=channel_full", event.name());
            }
            Err(TrySendError::Disconnected(event)) => {
                log::debug!("EVENT_DROPPED event={} reason=no_listener", event.name());
            }
        }
    }
}

pub fn event_channel(capacity: usize) -> (EventSender, Receiver<Event>) {
    let (tx, rx) = bounded(capacity.max(1));
    (EventSender::new(tx), rx)
}

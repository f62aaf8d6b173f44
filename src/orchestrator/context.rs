//! Iteration context.
//!
//! Identifies one pass of the update pipeline for logging and reporting.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::logging::LogContext;

/// Where an iteration takes its metadata and images from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationMode {
    Online,
    Offline,
}

impl fmt::Display for IterationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IterationMode::Online => write!(f, "online"),
            IterationMode::Offline => write!(f, "offline"),
        }
    }
}

/// Context for a single update iteration.
#[derive(Debug, Clone)]
pub struct IterationContext {
    pub iteration_id: String,
    pub started_at: DateTime<Utc>,
    pub mode: IterationMode,
}

impl IterationContext {
    pub fn new(mode: IterationMode) -> Self {
        Self {
            iteration_id: format!("it-{}", &Uuid::new_v4().to_string()[..8]),
            started_at: Utc::now(),
            mode,
        }
    }

    pub fn log_context(&self) -> LogContext {
        LogContext::for_iteration(&self.iteration_id, self.mode)
    }
}

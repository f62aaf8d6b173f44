//! Log line prefixes.
//!
//! Every pipeline log line starts with the iteration it belongs to, the
//! mode of that iteration and, while one ECU is being served, its serial:
//!
//! ```text
//! [iteration=it-1a2b3c4d mode=online] [ecu=S1] SECONDARY_IMAGE_SENT filename=fw.bin
//! ```
//!
//! Work that runs outside an iteration (startup, manual manifest sends)
//! logs under `[background]`.

use std::fmt;

use crate::ecu::EcuSerial;
use crate::orchestrator::IterationMode;

/// Iteration id used for work outside an iteration. Reports carry it as is.
pub const BACKGROUND_ITERATION: &str = "-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogContext {
    pub iteration_id: String,
    pub mode: Option<IterationMode>,
    pub ecu: Option<EcuSerial>,
}

impl LogContext {
    pub fn new(iteration_id: &str) -> Self {
        Self {
            iteration_id: iteration_id.to_string(),
            mode: None,
            ecu: None,
        }
    }

    pub fn for_iteration(iteration_id: &str, mode: IterationMode) -> Self {
        Self {
            mode: Some(mode),
            ..Self::new(iteration_id)
        }
    }

    pub fn background() -> Self {
        Self::new(BACKGROUND_ITERATION)
    }

    pub fn is_background(&self) -> bool {
        self.iteration_id == BACKGROUND_ITERATION
    }

    /// Same iteration, narrowed to one ECU.
    pub fn with_ecu(&self, serial: &EcuSerial) -> Self {
        Self {
            ecu: Some(serial.clone()),
            ..self.clone()
        }
    }
}

impl fmt::Display for LogContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_background() {
            f.write_str("[background]")?;
        } else {
            write!(f, "[iteration={}", self.iteration_id)?;
            if let Some(mode) = self.mode {
                write!(f, " mode={}", mode)?;
            }
            f.write_str("]")?;
        }
        if let Some(serial) = &self.ecu {
            write!(f, " [ecu={}]", serial)?;
        }
        Ok(())
    }
}

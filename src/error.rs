//! Custom error types for the engine.
//!
//! This module defines the primary error type, `IsiError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to classify the failure modes of the acquisition and
//! analysis pipeline.
//!
//! ## Error Taxonomy
//!
//! - **`TransientIo`**: a single dropped frame or comparable recoverable
//!   glitch. These are counted and the affected loop continues; they are
//!   never fatal on their own.
//! - **`HardwareUnavailable`**: camera or display not ready. Fatal when
//!   starting an acquisition; forces an abort if it occurs mid-run.
//! - **`Desynchronization`**: stimulus/camera timestamp offset exceeded the
//!   configured tolerance. Advisory: reported through health telemetry and
//!   recorded on the sync log, it does not abort a run unless the
//!   coordinator's drift policy says otherwise.
//! - **`Configuration`**: semantically invalid parameters or missing
//!   direction data. Aborts only the affected operation (e.g. an analysis
//!   request), never the whole process.
//! - **`Transport`**: control/broadcast channel failure. Reported to the
//!   frontend, but hardware timing must never block on it.
//!
//! `Io` and `Serialization` wrap the ambient layers so call sites can use
//! the `?` operator throughout.

use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type IsiResult<T> = std::result::Result<T, IsiError>;

/// Central error type for the acquisition and analysis engine.
#[derive(Error, Debug)]
pub enum IsiError {
    #[error("Transient I/O fault: {0}")]
    TransientIo(String),

    #[error("Hardware unavailable: {subsystem}: {reason}")]
    HardwareUnavailable {
        /// Which subsystem reported the failure ("camera", "display", ...).
        subsystem: String,
        /// Human-readable reason.
        reason: String,
    },

    #[error("Desynchronization: offset {offset_us}us exceeds tolerance {tolerance_us}us")]
    Desynchronization {
        /// Measured stimulus/camera offset in microseconds.
        offset_us: i64,
        /// Configured tolerance window in microseconds.
        tolerance_us: i64,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transport fault: {0}")]
    Transport(String),

    #[error("Frame source silent for longer than {timeout_ms}ms")]
    FrameSourceSilent {
        /// Watchdog deadline that expired.
        timeout_ms: u64,
    },

    #[error("Torn shared-memory read on slot {slot} after {retries} retries")]
    TornRead {
        /// Slot index that could not be read consistently.
        slot: usize,
        /// Number of retries attempted.
        retries: usize,
    },

    #[error("Acquisition aborted: {0}")]
    Aborted(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IsiError {
    /// Whether the affected loop may simply continue after logging.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IsiError::TransientIo(_) | IsiError::Desynchronization { .. } | IsiError::TornRead { .. }
        )
    }

    /// Structured reason string delivered over the broadcast channel when a
    /// fatal condition transitions the coordinator to `Aborted`.
    pub fn reason_code(&self) -> &'static str {
        match self {
            IsiError::TransientIo(_) => "transient_io",
            IsiError::HardwareUnavailable { .. } => "hardware_unavailable",
            IsiError::Desynchronization { .. } => "desynchronization",
            IsiError::Configuration(_) => "configuration",
            IsiError::Transport(_) => "transport",
            IsiError::FrameSourceSilent { .. } => "frame_source_silent",
            IsiError::TornRead { .. } => "torn_read",
            IsiError::Aborted(_) => "aborted",
            IsiError::Io(_) => "io",
            IsiError::Serialization(_) => "serialization",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(IsiError::TransientIo("dropped frame".into()).is_transient());
        assert!(IsiError::Desynchronization {
            offset_us: 7_000,
            tolerance_us: 5_000
        }
        .is_transient());
        assert!(!IsiError::HardwareUnavailable {
            subsystem: "camera".into(),
            reason: "not ready".into()
        }
        .is_transient());
        assert!(!IsiError::Configuration("missing direction".into()).is_transient());
    }

    #[test]
    fn reason_codes_are_stable() {
        let err = IsiError::FrameSourceSilent { timeout_ms: 500 };
        assert_eq!(err.reason_code(), "frame_source_silent");
        let err = IsiError::Transport("connection reset".into());
        assert_eq!(err.reason_code(), "transport");
    }
}

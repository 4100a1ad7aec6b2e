//! Typed errors for the two collaborator boundaries the tick loop must
//! discriminate on. Everything else in the crate uses `anyhow`.

use thiserror::Error;

/// Frame acquisition failure.
#[derive(Error, Debug)]
pub enum FrameError {
    /// The source could not deliver a frame this tick. Skip the tick and retry.
    #[error("frame unavailable: {0}")]
    Unavailable(String),

    /// The source cannot recover without operator action.
    #[error("frame source failed: {0}")]
    Fatal(#[from] anyhow::Error),
}

impl FrameError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        FrameError::Unavailable(reason.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, FrameError::Unavailable(_))
    }
}

/// Actuator failed to honor a command.
#[derive(Error, Debug)]
pub enum ActuatorError {
    #[error("actuator rejected angle {angle:.1}: {reason}")]
    Rejected { angle: f32, reason: String },

    #[error("actuator already released")]
    Released,

    #[error("actuator output I/O error: {0}")]
    Io(#[from] std::io::Error),
}

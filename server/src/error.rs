//! Error taxonomy for the relay server.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Ingest payload could not produce a frame; nothing was stored.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Read or seek outside the retained history `[first, end)`.
    #[error("Frame index {index} out of range [{first}, {end})")]
    IndexOutOfRange { index: i64, first: u64, end: u64 },

    #[error("No frames have been recorded yet")]
    EmptyHistory,

    /// Calibration points cannot define a projective transform.
    #[error("Degenerate calibration: {0}")]
    DegenerateConfiguration(String),

    /// A point mapped onto the line at infinity.
    #[error("Point ({x}, {y}) projects to infinity")]
    SingularProjection { x: f64, y: f64 },

    #[error("Unknown session {0}")]
    UnknownSession(u32),

    #[error("Snapshot write failed: {0}")]
    PersistenceFailure(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RelayError {
    pub fn invalid_frame(msg: impl Into<String>) -> Self {
        Self::InvalidFrame(msg.into())
    }

    pub fn degenerate(msg: impl Into<String>) -> Self {
        Self::DegenerateConfiguration(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

//! Error types for photonpix-core.

use thiserror::Error;

/// Result type alias for photonpix operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for photonpix operations.
///
/// Every variant maps to a stable identifier (see [`Error::id`]) so the
/// invoking process can report failures without parsing messages.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input data (calibration files, event lists, metadata).
    #[error("data format error: {0}")]
    Format(String),

    /// Settings rejected during validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid pixel coordinate.
    #[error("invalid pixel coordinate: ({x}, {y})")]
    InvalidCoordinate { x: u16, y: u16 },

    /// Reading from the event accessor failed.
    #[error("event accessor error: {0}")]
    Accessor(String),

    /// Writing to an output sink failed.
    #[error("output error: {0}")]
    Output(String),

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable identifier for this error kind.
    #[must_use]
    pub fn id(&self) -> &'static str {
        match self {
            Self::Format(_) => "photonpix.Error.Format",
            Self::InvalidConfig(_) => "photonpix.Error.InvalidConfiguration",
            Self::InvalidCoordinate { .. } => "photonpix.Error.InvalidCoordinate",
            Self::Accessor(_) => "photonpix.Error.Accessor",
            Self::Output(_) => "photonpix.Error.Output",
            Self::Cancelled => "photonpix.Error.Cancelled",
            Self::Io(_) => "photonpix.Error.Io",
        }
    }
}

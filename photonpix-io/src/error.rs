//! I/O error types.

use thiserror::Error;

/// Result type for I/O operations.
pub type Result<T> = std::result::Result<T, Error>;

/// I/O error types.
#[derive(Error, Debug)]
pub enum Error {
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid file format.
    #[error("invalid file format: {0}")]
    InvalidFormat(String),

    /// Sidecar or settings JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Calibration or detector metadata error.
    #[error("detector error: {0}")]
    Detector(#[from] photonpix_tpx::Error),

    /// Core library error.
    #[error(transparent)]
    CoreError(#[from] photonpix_core::Error),
}

impl Error {
    /// Stable identifier, shared with [`photonpix_core::Error::id`].
    #[must_use]
    pub fn id(&self) -> &'static str {
        match self {
            Self::Io(_) => "photonpix.Error.Io",
            Self::InvalidFormat(_) | Self::Json(_) => "photonpix.Error.Format",
            Self::Detector(photonpix_tpx::Error::Io(_)) => "photonpix.Error.Io",
            Self::Detector(photonpix_tpx::Error::InvalidGeometry(_)) => {
                "photonpix.Error.InvalidConfiguration"
            }
            Self::Detector(_) => "photonpix.Error.Format",
            Self::CoreError(err) => err.id(),
        }
    }

    /// True if the run stopped because the caller cancelled it.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::CoreError(photonpix_core::Error::Cancelled))
    }
}

impl From<Error> for photonpix_core::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => Self::Io(e),
            Error::CoreError(e) => e,
            Error::Detector(e) => e.into(),
            other => Self::Format(other.to_string()),
        }
    }
}

//! Detector-specific error types.

use thiserror::Error;

/// Result type for calibration and detector metadata operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while loading calibration data or detector metadata.
#[derive(Error, Debug)]
pub enum Error {
    /// No chipset element below the document root.
    #[error("calibration file has no chipset element")]
    MissingChipset,

    /// A coefficient blob is absent from the chipset element.
    #[error("calibration coefficient '{0}' is missing")]
    MissingCoefficients(&'static str),

    /// A coefficient blob decoded to the wrong number of bytes.
    #[error("calibration coefficient '{name}' has {actual} bytes, expected {expected}")]
    SizeMismatch {
        name: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Malformed XML.
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    /// Malformed base64 payload.
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Malformed detector metadata.
    #[error("detector metadata error: {0}")]
    Json(#[from] serde_json::Error),

    /// Detector metadata with unusable values.
    #[error("invalid detector geometry: {0}")]
    InvalidGeometry(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<Error> for photonpix_core::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => Self::Io(e),
            Error::InvalidGeometry(msg) => Self::InvalidConfig(msg),
            other => Self::Format(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converts_to_core_format_error() {
        let core: photonpix_core::Error = Error::MissingCoefficients("calibb").into();
        assert_eq!(core.id(), "photonpix.Error.Format");
        assert!(core.to_string().contains("calibb"));
    }
}

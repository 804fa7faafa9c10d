//! Detector metadata: chipboard identity, geometry and calibration file.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use photonpix_core::hit::MATRIX_SIZE;

use crate::calibration::CalibrationTable;
use crate::error::{Error, Result};

/// Rotation, scale and offset mapping pixel coordinates to detector units.
///
/// ```text
/// x' = sx * ( cos·x + sin·y) + ox
/// y' = sy * (-sin·x + cos·y) + oy
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct DetectorGeometry {
    rotation: f64,
    origin: [f64; 2],
    pixel_size: [f64; 2],
    matrix: [f64; 4],
}

impl Default for DetectorGeometry {
    fn default() -> Self {
        Self::identity()
    }
}

impl DetectorGeometry {
    /// Creates a geometry from a rotation (radians), origin and pixel size.
    #[must_use]
    pub fn new(rotation: f64, origin: [f64; 2], pixel_size: [f64; 2]) -> Self {
        let (sin, cos) = rotation.sin_cos();
        let [sx, sy] = pixel_size;
        Self {
            rotation,
            origin,
            pixel_size,
            matrix: [sx * cos, sx * sin, -sy * sin, sy * cos],
        }
    }

    /// Geometry that leaves pixel coordinates unchanged.
    #[must_use]
    pub fn identity() -> Self {
        Self::new(0.0, [0.0, 0.0], [1.0, 1.0])
    }

    /// Rotation in radians.
    #[inline]
    #[must_use]
    pub fn rotation(&self) -> f64 {
        self.rotation
    }

    /// Origin offset in detector units.
    #[inline]
    #[must_use]
    pub fn origin(&self) -> [f64; 2] {
        self.origin
    }

    /// Pixel pitch along x and y.
    #[inline]
    #[must_use]
    pub fn pixel_size(&self) -> [f64; 2] {
        self.pixel_size
    }

    /// Maps a point from pixel to detector coordinates.
    #[inline]
    #[must_use]
    pub fn transform_point(&self, x: f64, y: f64) -> (f64, f64) {
        let [m00, m01, m10, m11] = self.matrix;
        (
            m00 * x + m01 * y + self.origin[0],
            m10 * x + m11 * y + self.origin[1],
        )
    }

    /// Detector-space extent of the full 256x256 pixel area.
    #[must_use]
    pub fn bounding_box(&self) -> BoundingBox {
        BoundingBox::pixel_matrix().transform(self)
    }

    fn validate(&self) -> Result<()> {
        let finite = self.rotation.is_finite()
            && self.origin.iter().all(|v| v.is_finite())
            && self.pixel_size.iter().all(|v| v.is_finite());
        if !finite {
            return Err(Error::InvalidGeometry(
                "rotation, origin and pixel size must be finite".to_string(),
            ));
        }
        if self.pixel_size.iter().any(|v| *v == 0.0) {
            return Err(Error::InvalidGeometry(format!(
                "pixel size must be non-zero, got {:?}",
                self.pixel_size
            )));
        }
        Ok(())
    }
}

/// Axis-aligned rectangle in detector units.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Default for BoundingBox {
    /// Fallback extent used when a stream reports no bounding box.
    fn default() -> Self {
        Self::from_origin_size(0.0, 0.0, 255.0, 255.0)
    }
}

impl BoundingBox {
    /// Creates a box from its corners.
    #[must_use]
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Creates a box from `[x, y, width, height]`.
    #[must_use]
    pub fn from_origin_size(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self::new(x, y, x + width, y + height)
    }

    /// The untransformed pixel area `[0, 256] x [0, 256]`.
    #[must_use]
    pub fn pixel_matrix() -> Self {
        let size = f64::from(MATRIX_SIZE);
        Self::new(0.0, 0.0, size, size)
    }

    #[inline]
    #[must_use]
    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    #[inline]
    #[must_use]
    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Smallest box containing both boxes.
    #[must_use]
    pub fn combine(&self, other: &Self) -> Self {
        Self::new(
            self.min_x.min(other.min_x),
            self.min_y.min(other.min_y),
            self.max_x.max(other.max_x),
            self.max_y.max(other.max_y),
        )
    }

    /// Box enclosing the four transformed corners.
    #[must_use]
    pub fn transform(&self, geometry: &DetectorGeometry) -> Self {
        let corners = [
            geometry.transform_point(self.min_x, self.min_y),
            geometry.transform_point(self.max_x, self.min_y),
            geometry.transform_point(self.min_x, self.max_y),
            geometry.transform_point(self.max_x, self.max_y),
        ];
        corners.iter().skip(1).fold(
            Self::new(corners[0].0, corners[0].1, corners[0].0, corners[0].1),
            |acc, &(x, y)| Self::new(acc.min_x.min(x), acc.min_y.min(y), acc.max_x.max(x), acc.max_y.max(y)),
        )
    }
}

/// Per-detector metadata as stored in the detector JSON file.
#[derive(Clone, Debug, Default)]
pub struct DetectorConfig {
    /// Chipboard identifier (e.g. `"W0005_E02"`).
    pub chipboard_id: String,
    /// Pixel-to-detector transform.
    pub geometry: DetectorGeometry,
    /// Calibration XML, already resolved against the metadata file location.
    pub calibration_file: Option<PathBuf>,
}

#[derive(Deserialize)]
struct JsonConfig {
    detector: JsonDetector,
}

#[derive(Deserialize)]
#[serde(default)]
struct JsonDetector {
    #[serde(alias = "chipboardID")]
    chipboard_id: String,
    rotation: f64,
    origin: [f64; 2],
    #[serde(alias = "pixelSize")]
    pixel_size: [f64; 2],
    #[serde(alias = "calibrationFile")]
    calibration_file: Option<PathBuf>,
}

impl Default for JsonDetector {
    fn default() -> Self {
        Self {
            chipboard_id: String::new(),
            rotation: 0.0,
            origin: [0.0, 0.0],
            pixel_size: [1.0, 1.0],
            calibration_file: None,
        }
    }
}

impl DetectorConfig {
    /// Loads detector metadata from a JSON file.
    ///
    /// A relative `calibration_file` is resolved against the directory of
    /// `path`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, is not valid JSON or
    /// describes an unusable geometry.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let json_config: JsonConfig = serde_json::from_reader(BufReader::new(file))?;
        let mut config = Self::from_json_config(json_config)?;

        if let (Some(calibration), Some(dir)) = (config.calibration_file.as_mut(), path.parent()) {
            if calibration.is_relative() {
                *calibration = dir.join(&*calibration);
            }
        }
        Ok(config)
    }

    /// Loads detector metadata from a JSON string.
    ///
    /// # Errors
    /// Returns an error for invalid JSON or an unusable geometry.
    pub fn from_json(json: &str) -> Result<Self> {
        let json_config: JsonConfig = serde_json::from_str(json)?;
        Self::from_json_config(json_config)
    }

    fn from_json_config(config: JsonConfig) -> Result<Self> {
        let detector = config.detector;
        let geometry = DetectorGeometry::new(detector.rotation, detector.origin, detector.pixel_size);
        geometry.validate()?;
        Ok(Self {
            chipboard_id: detector.chipboard_id,
            geometry,
            calibration_file: detector.calibration_file,
        })
    }

    /// Loads the calibration referenced by this metadata.
    ///
    /// Without a calibration file the default calibration is returned.
    ///
    /// # Errors
    /// Returns an error if the referenced calibration file cannot be loaded.
    pub fn load_calibration(&self) -> Result<CalibrationTable> {
        match &self.calibration_file {
            Some(path) => CalibrationTable::from_xml_file(path),
            None => {
                log::warn!(
                    "Detector '{}' has no calibration file, using default calibration",
                    self.chipboard_id
                );
                Ok(CalibrationTable::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_identity_transform() {
        let geometry = DetectorGeometry::identity();
        assert_eq!(geometry.transform_point(12.5, 3.5), (12.5, 3.5));
        assert_eq!(geometry.bounding_box(), BoundingBox::pixel_matrix());
    }

    #[test]
    fn test_rotated_scaled_transform() {
        let geometry = DetectorGeometry::new(FRAC_PI_2, [10.0, 20.0], [0.055, 0.055]);
        let (x, y) = geometry.transform_point(1.0, 0.0);
        assert_relative_eq!(x, 10.0, epsilon = 1e-12);
        assert_relative_eq!(y, 20.0 - 0.055, epsilon = 1e-12);

        let bbox = geometry.bounding_box();
        assert_relative_eq!(bbox.width(), 256.0 * 0.055, epsilon = 1e-9);
        assert_relative_eq!(bbox.min_y, 20.0 - 256.0 * 0.055, epsilon = 1e-9);
    }

    #[test]
    fn test_bounding_box_combine() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::from_origin_size(5.0, -5.0, 10.0, 10.0);
        assert_eq!(a.combine(&b), BoundingBox::new(0.0, -5.0, 15.0, 10.0));
        assert_relative_eq!(BoundingBox::default().width(), 255.0);
    }

    #[test]
    fn test_json_loading() {
        let json = r#"{
            "detector": {
                "chipboardID": "W0005_E02",
                "rotation": 0.0,
                "origin": [1.0, 2.0],
                "pixelSize": [0.055, 0.055]
            }
        }"#;
        let config = DetectorConfig::from_json(json).unwrap();
        assert_eq!(config.chipboard_id, "W0005_E02");
        assert_eq!(config.geometry.origin(), [1.0, 2.0]);
        assert!(config.calibration_file.is_none());
        assert!(config.load_calibration().is_ok());
    }

    #[test]
    fn test_json_defaults_and_validation() {
        let config = DetectorConfig::from_json(r#"{"detector": {}}"#).unwrap();
        assert_eq!(config.geometry, DetectorGeometry::identity());

        let err = DetectorConfig::from_json(r#"{"detector": {"pixel_size": [0.0, 1.0]}}"#)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidGeometry(_)));
    }
}

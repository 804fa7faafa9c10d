//! Clustering and projection settings.
//!
//! All times are detector clock ticks. The `Host*` variants (behind the
//! `serde` feature) accept nanoseconds/seconds and string enums as supplied
//! by an invoking process and convert them with validation.

use std::fmt;
use std::str::FromStr;

use crate::hit::Timestamp;
use crate::{Error, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Largest accepted projection image, in pixels (an 8192x8192 image).
pub const MAX_IMAGE_PIXELS: u64 = 1 << 26;

/// Settings for merging fluorescence-escape cluster pairs.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct XrfSettings {
    /// Whether XRF correction runs at all.
    pub enabled: bool,
    /// Lower energy bound for merge candidates (keV).
    pub min_energy: f64,
    /// Upper energy bound for merge candidates (keV).
    pub max_energy: f64,
    /// Maximum time difference between partners (ticks).
    pub temporal_margin: f64,
    /// Maximum centroid distance between partners (pixels).
    pub distance_limit: f64,
}

impl Default for XrfSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            min_energy: 0.0,
            max_energy: 100.0,
            temporal_margin: 64.0, // 100 ns
            distance_limit: 10.0,
        }
    }
}

impl XrfSettings {
    /// Enables or disables the correction.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the candidate energy window.
    #[must_use]
    pub fn with_energy_range(mut self, min_energy: f64, max_energy: f64) -> Self {
        self.min_energy = min_energy;
        self.max_energy = max_energy;
        self
    }

    /// Sets the partner time window.
    #[must_use]
    pub fn with_temporal_margin(mut self, ticks: f64) -> Self {
        self.temporal_margin = ticks;
        self
    }

    /// Sets the partner distance limit.
    #[must_use]
    pub fn with_distance_limit(mut self, pixels: f64) -> Self {
        self.distance_limit = pixels;
        self
    }

    /// Returns true if `energy` lies inside the candidate window.
    #[inline]
    #[must_use]
    pub fn accepts_energy(&self, energy: f64) -> bool {
        energy >= self.min_energy && energy <= self.max_energy
    }

    /// Validates the settings.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] for negative or non-finite margins and
    /// inverted energy windows.
    pub fn validate(&self) -> Result<()> {
        check_margin("xrf temporal margin", self.temporal_margin)?;
        check_margin("xrf distance limit", self.distance_limit)?;
        check_window("xrf energy", self.min_energy, self.max_energy)
    }
}

/// Settings for the clustering stage.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ClusteringSettings {
    /// Maximum gap between connected events (ticks).
    pub temporal_margin: f64,
    /// XRF correction settings.
    pub xrf: XrfSettings,
    /// Emit every event as its own cluster.
    pub passthrough: bool,
}

impl Default for ClusteringSettings {
    fn default() -> Self {
        Self {
            temporal_margin: 64.0, // 100 ns
            xrf: XrfSettings::default(),
            passthrough: false,
        }
    }
}

impl ClusteringSettings {
    /// Creates settings with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the temporal margin.
    #[must_use]
    pub fn with_temporal_margin(mut self, ticks: f64) -> Self {
        self.temporal_margin = ticks;
        self
    }

    /// Sets the XRF correction settings.
    #[must_use]
    pub fn with_xrf(mut self, xrf: XrfSettings) -> Self {
        self.xrf = xrf;
        self
    }

    /// Enables or disables passthrough mode.
    #[must_use]
    pub fn with_passthrough(mut self, passthrough: bool) -> Self {
        self.passthrough = passthrough;
        self
    }

    /// Whether the XRF stage should run. Passthrough disables it.
    #[inline]
    #[must_use]
    pub fn xrf_active(&self) -> bool {
        self.xrf.enabled && !self.passthrough
    }

    /// Validates the settings.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if any margin is negative or not finite.
    pub fn validate(&self) -> Result<()> {
        check_margin("temporal margin", self.temporal_margin)?;
        self.xrf.validate()
    }
}

/// Per-cluster value accumulated into the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ProjectionAttribute {
    /// Cluster energy (keV).
    #[default]
    Energy,
    /// Constant 1 per cluster.
    EventCount,
    /// Cluster timestamp in seconds.
    TimeOfArrival,
}

impl FromStr for ProjectionAttribute {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "energy" => Ok(Self::Energy),
            "eventcount" | "count" => Ok(Self::EventCount),
            "timeofarrival" | "time" => Ok(Self::TimeOfArrival),
            other => Err(Error::InvalidConfig(format!(
                "unknown projection attribute '{other}'"
            ))),
        }
    }
}

impl fmt::Display for ProjectionAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Energy => "Energy",
            Self::EventCount => "EventCount",
            Self::TimeOfArrival => "TimeOfArrival",
        };
        f.write_str(name)
    }
}

/// How values landing on the same pixel are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ProjectionMode {
    /// Bilinear sum.
    #[default]
    Sum,
    /// Bilinear sum divided by the bilinear count.
    Mean,
    /// Smallest value on the nearest pixel.
    Minimum,
    /// Largest value on the nearest pixel.
    Maximum,
}

impl FromStr for ProjectionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sum" => Ok(Self::Sum),
            "mean" | "average" => Ok(Self::Mean),
            "minimum" | "min" => Ok(Self::Minimum),
            "maximum" | "max" => Ok(Self::Maximum),
            other => Err(Error::InvalidConfig(format!(
                "unknown projection mode '{other}'"
            ))),
        }
    }
}

impl fmt::Display for ProjectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sum => "Sum",
            Self::Mean => "Mean",
            Self::Minimum => "Minimum",
            Self::Maximum => "Maximum",
        };
        f.write_str(name)
    }
}

/// Settings for projecting clusters into an image.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProjectionSettings {
    /// Value accumulated per cluster.
    pub attribute: ProjectionAttribute,
    /// Combination mode.
    pub mode: ProjectionMode,
    /// Inclusive lower energy bound (keV).
    pub min_energy: f64,
    /// Inclusive upper energy bound (keV).
    pub max_energy: f64,
    /// Inclusive lower time bound (ticks).
    pub min_time: Timestamp,
    /// Inclusive upper time bound (ticks).
    pub max_time: Timestamp,
    /// Output width in pixels.
    pub image_width: u64,
    /// Output height in pixels.
    pub image_height: u64,
    /// Normalise by a white (flat-field) projection.
    pub enable_white_image: bool,
}

impl Default for ProjectionSettings {
    fn default() -> Self {
        Self {
            attribute: ProjectionAttribute::Energy,
            mode: ProjectionMode::Sum,
            min_energy: 0.0,
            max_energy: f64::MAX,
            min_time: 0,
            max_time: Timestamp::MAX,
            image_width: 256,
            image_height: 256,
            enable_white_image: false,
        }
    }
}

impl ProjectionSettings {
    /// Creates settings with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the projected attribute.
    #[must_use]
    pub fn with_attribute(mut self, attribute: ProjectionAttribute) -> Self {
        self.attribute = attribute;
        self
    }

    /// Sets the combination mode.
    #[must_use]
    pub fn with_mode(mut self, mode: ProjectionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the energy window.
    #[must_use]
    pub fn with_energy_range(mut self, min_energy: f64, max_energy: f64) -> Self {
        self.min_energy = min_energy;
        self.max_energy = max_energy;
        self
    }

    /// Sets the time window (ticks).
    #[must_use]
    pub fn with_time_range(mut self, min_time: Timestamp, max_time: Timestamp) -> Self {
        self.min_time = min_time;
        self.max_time = max_time;
        self
    }

    /// Sets the output image size.
    #[must_use]
    pub fn with_image_size(mut self, width: u64, height: u64) -> Self {
        self.image_width = width;
        self.image_height = height;
        self
    }

    /// Enables or disables white-image normalisation.
    #[must_use]
    pub fn with_white_image(mut self, enable: bool) -> Self {
        self.enable_white_image = enable;
        self
    }

    /// Validates the settings.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] for an empty image, an image larger
    /// than [`MAX_IMAGE_PIXELS`], inverted windows or non-finite energy bounds.
    pub fn validate(&self) -> Result<()> {
        if self.image_width == 0 || self.image_height == 0 {
            return Err(Error::InvalidConfig(format!(
                "image size must be positive, got {}x{}",
                self.image_width, self.image_height
            )));
        }
        if self
            .image_width
            .checked_mul(self.image_height)
            .filter(|&pixels| pixels <= MAX_IMAGE_PIXELS)
            .is_none()
        {
            return Err(Error::InvalidConfig(format!(
                "image size {}x{} exceeds {MAX_IMAGE_PIXELS} pixels",
                self.image_width, self.image_height
            )));
        }
        check_window("energy", self.min_energy, self.max_energy)?;
        if self.min_time > self.max_time {
            return Err(Error::InvalidConfig(format!(
                "time window is inverted: {} > {}",
                self.min_time, self.max_time
            )));
        }
        Ok(())
    }
}

fn check_margin(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(Error::InvalidConfig(format!(
            "{name} must be finite and non-negative, got {value}"
        )));
    }
    Ok(())
}

fn check_window(name: &str, min: f64, max: f64) -> Result<()> {
    if !min.is_finite() || !max.is_finite() {
        return Err(Error::InvalidConfig(format!(
            "{name} window must be finite, got [{min}, {max}]"
        )));
    }
    if min > max {
        return Err(Error::InvalidConfig(format!(
            "{name} window is inverted: {min} > {max}"
        )));
    }
    Ok(())
}

#[cfg(feature = "serde")]
pub use host::{HostClusteringSettings, HostProjectionSettings};

#[cfg(feature = "serde")]
mod host {
    use serde::{Deserialize, Serialize};

    use super::{ClusteringSettings, ProjectionSettings, XrfSettings};
    use crate::hit::{ticks_from_nanoseconds, ticks_from_seconds};
    use crate::{Error, Result};

    /// Clustering settings in host units (nanoseconds).
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct HostClusteringSettings {
        pub temporal_margin: f64,
        pub xrf_correction: bool,
        pub xrf_min_energy: f64,
        pub xrf_max_energy: f64,
        pub xrf_temporal_margin: f64,
        pub xrf_distance_limit: f64,
        pub passthrough: bool,
    }

    impl Default for HostClusteringSettings {
        fn default() -> Self {
            Self {
                temporal_margin: 100.0,
                xrf_correction: false,
                xrf_min_energy: 0.0,
                xrf_max_energy: 100.0,
                xrf_temporal_margin: 100.0,
                xrf_distance_limit: 10.0,
                passthrough: false,
            }
        }
    }

    impl TryFrom<HostClusteringSettings> for ClusteringSettings {
        type Error = Error;

        fn try_from(host: HostClusteringSettings) -> Result<Self> {
            let settings = ClusteringSettings {
                temporal_margin: ticks_from_nanoseconds(host.temporal_margin),
                xrf: XrfSettings {
                    enabled: host.xrf_correction,
                    min_energy: host.xrf_min_energy,
                    max_energy: host.xrf_max_energy,
                    temporal_margin: ticks_from_nanoseconds(host.xrf_temporal_margin),
                    distance_limit: host.xrf_distance_limit,
                },
                passthrough: host.passthrough,
            };
            settings.validate()?;
            Ok(settings)
        }
    }

    /// Projection settings in host units (seconds, string enums).
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct HostProjectionSettings {
        pub attribute: String,
        pub mode: String,
        pub min_energy: f64,
        pub max_energy: f64,
        pub min_time: f64,
        pub max_time: f64,
        pub image_width: u64,
        pub image_height: u64,
        pub enable_white_image: bool,
    }

    impl Default for HostProjectionSettings {
        fn default() -> Self {
            Self {
                attribute: "Energy".to_string(),
                mode: "Sum".to_string(),
                min_energy: 0.0,
                max_energy: f64::MAX,
                min_time: 0.0,
                max_time: f64::MAX,
                image_width: 256,
                image_height: 256,
                enable_white_image: false,
            }
        }
    }

    impl TryFrom<HostProjectionSettings> for ProjectionSettings {
        type Error = Error;

        fn try_from(host: HostProjectionSettings) -> Result<Self> {
            for (name, value) in [("min time", host.min_time), ("max time", host.max_time)] {
                if value.is_nan() || value < 0.0 {
                    return Err(Error::InvalidConfig(format!(
                        "{name} must be non-negative, got {value}"
                    )));
                }
            }
            let settings = ProjectionSettings {
                attribute: host.attribute.parse()?,
                mode: host.mode.parse()?,
                min_energy: host.min_energy,
                max_energy: host.max_energy,
                min_time: ticks_from_seconds(host.min_time),
                max_time: ticks_from_seconds(host.max_time),
                image_width: host.image_width,
                image_height: host.image_height,
                enable_white_image: host.enable_white_image,
            };
            settings.validate()?;
            Ok(settings)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clustering_settings_builder() {
        let settings = ClusteringSettings::new()
            .with_temporal_margin(32.0)
            .with_passthrough(true)
            .with_xrf(XrfSettings::default().with_enabled(true));

        assert!((settings.temporal_margin - 32.0).abs() < f64::EPSILON);
        assert!(settings.passthrough);
        assert!(!settings.xrf_active());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_clustering_settings_rejects_bad_margins() {
        assert!(ClusteringSettings::new()
            .with_temporal_margin(-1.0)
            .validate()
            .is_err());
        assert!(ClusteringSettings::new()
            .with_temporal_margin(f64::NAN)
            .validate()
            .is_err());
        let xrf = XrfSettings::default().with_distance_limit(-0.5);
        assert!(ClusteringSettings::new().with_xrf(xrf).validate().is_err());
        let xrf = XrfSettings::default().with_energy_range(20.0, 10.0);
        assert!(ClusteringSettings::new().with_xrf(xrf).validate().is_err());
    }

    #[test]
    fn test_projection_settings_validation() {
        assert!(ProjectionSettings::default().validate().is_ok());
        assert!(ProjectionSettings::new()
            .with_image_size(0, 10)
            .validate()
            .is_err());
        assert!(ProjectionSettings::new()
            .with_energy_range(5.0, 1.0)
            .validate()
            .is_err());
        assert!(ProjectionSettings::new()
            .with_energy_range(0.0, f64::INFINITY)
            .validate()
            .is_err());
        assert!(ProjectionSettings::new()
            .with_time_range(10, 5)
            .validate()
            .is_err());
        assert!(ProjectionSettings::new()
            .with_image_size(u64::MAX, u64::MAX)
            .validate()
            .is_err());
    }

    #[test]
    fn test_attribute_and_mode_parsing() {
        assert_eq!(
            "count".parse::<ProjectionAttribute>().unwrap(),
            ProjectionAttribute::EventCount
        );
        assert_eq!(
            "TimeOfArrival".parse::<ProjectionAttribute>().unwrap(),
            ProjectionAttribute::TimeOfArrival
        );
        assert_eq!("AVERAGE".parse::<ProjectionMode>().unwrap(), ProjectionMode::Mean);
        assert_eq!("min".parse::<ProjectionMode>().unwrap(), ProjectionMode::Minimum);
        assert!("median".parse::<ProjectionMode>().is_err());

        for mode in [
            ProjectionMode::Sum,
            ProjectionMode::Mean,
            ProjectionMode::Minimum,
            ProjectionMode::Maximum,
        ] {
            assert_eq!(mode.to_string().parse::<ProjectionMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_image_size_limit() {
        let settings = ProjectionSettings::default();
        assert!(settings.clone().with_image_size(8192, 8192).validate().is_ok());
        assert!(matches!(
            settings.clone().with_image_size(8193, 8192).validate(),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            settings.with_image_size(1 << 40, 1 << 30).validate(),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_host_clustering_scaling() {
        let host: HostClusteringSettings =
            serde_json::from_str(r#"{"temporalMargin": 250.0, "xrfCorrection": true}"#).unwrap();
        let settings = ClusteringSettings::try_from(host).unwrap();
        assert!((settings.temporal_margin - 160.0).abs() < 1e-9);
        assert!(settings.xrf.enabled);
        assert!((settings.xrf.temporal_margin - 64.0).abs() < 1e-9);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_host_projection_conversion() {
        let host: HostProjectionSettings = serde_json::from_str(
            r#"{"attribute": "count", "mode": "max", "minTime": 0.5, "maxTime": 1.0,
                "imageWidth": 64, "imageHeight": 32}"#,
        )
        .unwrap();
        let settings = ProjectionSettings::try_from(host).unwrap();
        assert_eq!(settings.attribute, ProjectionAttribute::EventCount);
        assert_eq!(settings.mode, ProjectionMode::Maximum);
        assert_eq!(settings.min_time, 320_000_000);
        assert_eq!(settings.max_time, 640_000_000);
        assert_eq!(settings.image_width, 64);

        let bad = HostProjectionSettings {
            mode: "median".to_string(),
            ..HostProjectionSettings::default()
        };
        assert!(ProjectionSettings::try_from(bad).is_err());
    }
}

//! Pixel, timing and event types for Timepix3 photon data.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Width and height of a single detector chip, in pixels.
pub const MATRIX_SIZE: u16 = 256;

/// Number of pixels on a single chip.
pub const PIXEL_COUNT: usize = MATRIX_SIZE as usize * MATRIX_SIZE as usize;

/// Absolute detector clock value (1 tick = 25/16 ns).
pub type Timestamp = u64;

/// Bounded time-over-threshold value in hardware clock ticks.
pub type ShortTimestamp = u16;

/// Detector clock ticks per nanosecond.
pub const TICKS_PER_NANOSECOND: f64 = 16.0 / 25.0;

/// Length of one detector clock tick in seconds.
pub const SECONDS_PER_TICK: f64 = 25.0e-9 / 16.0;

/// Converts a duration in nanoseconds to fractional ticks.
#[inline]
#[must_use]
pub fn ticks_from_nanoseconds(nanoseconds: f64) -> f64 {
    nanoseconds * TICKS_PER_NANOSECOND
}

/// Converts seconds to a timestamp, saturating at the `u64` range.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn ticks_from_seconds(seconds: f64) -> Timestamp {
    (seconds / SECONDS_PER_TICK).round() as Timestamp
}

/// Converts a tick count to seconds.
#[inline]
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn seconds_from_ticks(ticks: Timestamp) -> f64 {
    ticks as f64 * SECONDS_PER_TICK
}

/// Pixel coordinate on the detector matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PixelCoord {
    /// X coordinate (column).
    pub x: u16,
    /// Y coordinate (row).
    pub y: u16,
}

impl PixelCoord {
    /// Creates a new pixel coordinate without range checks.
    #[inline]
    #[must_use]
    pub fn new(x: u16, y: u16) -> Self {
        Self { x, y }
    }

    /// Creates a coordinate, rejecting values outside the 256x256 matrix.
    ///
    /// # Errors
    /// Returns [`Error::InvalidCoordinate`] if either axis is out of range.
    pub fn checked(x: u16, y: u16) -> Result<Self> {
        if x >= MATRIX_SIZE || y >= MATRIX_SIZE {
            return Err(Error::InvalidCoordinate { x, y });
        }
        Ok(Self { x, y })
    }

    /// Dense row-major index `x + y * 256`.
    #[inline]
    #[must_use]
    pub fn index(&self) -> usize {
        self.x as usize + self.y as usize * MATRIX_SIZE as usize
    }

    /// Inverse of [`PixelCoord::index`].
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_index(index: usize) -> Self {
        let size = MATRIX_SIZE as usize;
        Self {
            x: (index % size) as u16,
            y: (index / size) as u16,
        }
    }

    /// Computes the squared Euclidean distance to another coordinate.
    #[inline]
    #[must_use]
    pub fn distance_squared(&self, other: &Self) -> u32 {
        let dx = u32::from(self.x.abs_diff(other.x));
        let dy = u32::from(self.y.abs_diff(other.y));
        dx * dx + dy * dy
    }

    /// Checks whether `other` lies in the 3x3 neighbourhood of this pixel
    /// (8-connectivity, the pixel itself included).
    #[inline]
    #[must_use]
    pub fn is_neighbor(&self, other: &Self) -> bool {
        self.x.abs_diff(other.x) <= 1 && self.y.abs_diff(other.y) <= 1
    }

    /// Iterates over the in-bounds pixels of the 3x3 neighbourhood.
    pub fn neighborhood(&self) -> impl Iterator<Item = PixelCoord> {
        let x_range = self.x.saturating_sub(1)..=self.x.saturating_add(1).min(MATRIX_SIZE - 1);
        let y_range = self.y.saturating_sub(1)..=self.y.saturating_add(1).min(MATRIX_SIZE - 1);
        y_range.flat_map(move |y| x_range.clone().map(move |x| PixelCoord { x, y }))
    }
}

/// A single per-pixel hit as delivered by the event accessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RawEvent {
    /// Pixel coordinate.
    pub coord: PixelCoord,
    /// Absolute timestamp (ticks, non-decreasing across a stream).
    pub timestamp: Timestamp,
    /// Time over threshold (proportional to deposited charge).
    pub tot: ShortTimestamp,
}

impl RawEvent {
    /// Creates a new raw event.
    #[inline]
    #[must_use]
    pub fn new(x: u16, y: u16, timestamp: Timestamp, tot: ShortTimestamp) -> Self {
        Self {
            coord: PixelCoord::new(x, y),
            timestamp,
            tot,
        }
    }
}

/// A raw event with its calibrated energy.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CalibratedEvent {
    /// The underlying raw hit.
    pub raw: RawEvent,
    /// Calibrated energy (keV).
    pub energy: f64,
    /// True when the calibration was degenerate and `energy` is the 0.0 fallback.
    pub degenerate: bool,
}

impl CalibratedEvent {
    /// Creates a calibrated event from a raw event and its energy.
    #[inline]
    #[must_use]
    pub fn new(raw: RawEvent, energy: f64) -> Self {
        Self {
            raw,
            energy,
            degenerate: false,
        }
    }
}

/// Common read access to per-pixel hit data.
pub trait Hit {
    /// Returns the pixel coordinate of the hit.
    fn coord(&self) -> PixelCoord;

    /// Returns the absolute timestamp.
    fn timestamp(&self) -> Timestamp;

    /// Returns the time over threshold.
    fn tot(&self) -> ShortTimestamp;

    /// Returns the x coordinate.
    #[inline]
    fn x(&self) -> u16 {
        self.coord().x
    }

    /// Returns the y coordinate.
    #[inline]
    fn y(&self) -> u16 {
        self.coord().y
    }
}

impl Hit for RawEvent {
    #[inline]
    fn coord(&self) -> PixelCoord {
        self.coord
    }

    #[inline]
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    #[inline]
    fn tot(&self) -> ShortTimestamp {
        self.tot
    }
}

impl Hit for CalibratedEvent {
    #[inline]
    fn coord(&self) -> PixelCoord {
        self.raw.coord
    }

    #[inline]
    fn timestamp(&self) -> Timestamp {
        self.raw.timestamp
    }

    #[inline]
    fn tot(&self) -> ShortTimestamp {
        self.raw.tot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_coord_distance() {
        let p1 = PixelCoord::new(0, 0);
        let p2 = PixelCoord::new(3, 4);
        assert_eq!(p1.distance_squared(&p2), 25);
    }

    #[test]
    fn test_pixel_coord_neighborhood() {
        let center = PixelCoord::new(5, 5);

        assert!(center.is_neighbor(&PixelCoord::new(4, 4)));
        assert!(center.is_neighbor(&PixelCoord::new(5, 4)));
        assert!(center.is_neighbor(&PixelCoord::new(6, 6)));
        assert!(center.is_neighbor(&center));

        assert!(!center.is_neighbor(&PixelCoord::new(7, 5)));
        assert!(!center.is_neighbor(&PixelCoord::new(5, 7)));

        assert_eq!(center.neighborhood().count(), 9);
        assert!(center.neighborhood().all(|p| center.is_neighbor(&p)));
    }

    #[test]
    fn test_neighborhood_clipped_at_edges() {
        assert_eq!(PixelCoord::new(0, 0).neighborhood().count(), 4);
        assert_eq!(PixelCoord::new(255, 255).neighborhood().count(), 4);
        assert_eq!(PixelCoord::new(0, 100).neighborhood().count(), 6);
    }

    #[test]
    fn test_dense_index_roundtrip() {
        let p = PixelCoord::new(17, 201);
        assert_eq!(p.index(), 17 + 201 * 256);
        assert_eq!(PixelCoord::from_index(p.index()), p);
    }

    #[test]
    fn test_checked_rejects_out_of_range() {
        assert!(PixelCoord::checked(255, 255).is_ok());
        assert!(matches!(
            PixelCoord::checked(256, 0),
            Err(Error::InvalidCoordinate { x: 256, y: 0 })
        ));
    }

    #[test]
    fn test_tick_conversions() {
        assert!((ticks_from_nanoseconds(25.0) - 16.0).abs() < 1e-12);
        assert_eq!(ticks_from_seconds(1.0), 640_000_000);
        assert!((seconds_from_ticks(640_000_000) - 1.0).abs() < 1e-12);
        assert_eq!(ticks_from_seconds(f64::INFINITY), u64::MAX);
        assert_eq!(ticks_from_seconds(-1.0), 0);
    }

    #[test]
    fn test_calibrated_event_accessors() {
        let event = CalibratedEvent::new(RawEvent::new(10, 20, 1000, 50), 12.5);
        assert_eq!(event.x(), 10);
        assert_eq!(event.y(), 20);
        assert_eq!(event.timestamp(), 1000);
        assert_eq!(event.tot(), 50);
        assert!(!event.degenerate);
    }
}

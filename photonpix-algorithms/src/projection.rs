//! Projection of cluster streams into 2D images.

use photonpix_core::hit::{seconds_from_ticks, Timestamp};
use photonpix_core::{
    Cluster, Error, Operation, ProjectionAttribute, ProjectionMode, ProjectionSettings, Result,
};
use photonpix_tpx::BoundingBox;

use crate::cluster_builder::CANCEL_CHECK_INTERVAL;

/// Row-major `f64` image with an exposure time.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionImage {
    width: usize,
    height: usize,
    data: Vec<f64>,
    exposure_time: f64,
}

impl ProjectionImage {
    /// Creates a zero-filled image.
    ///
    /// The size is not checked; [`Projector::new`] only allocates sizes
    /// accepted by [`ProjectionSettings::validate`].
    #[must_use]
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width * height],
            exposure_time: 0.0,
        }
    }

    /// Creates an image from row-major data.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if `data` does not hold `width * height` values.
    pub fn from_data(width: usize, height: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != width * height {
            return Err(Error::InvalidConfig(format!(
                "image data has {} values, expected {width}x{height}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
            exposure_time: 0.0,
        })
    }

    /// Width in pixels.
    #[inline]
    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Height in pixels.
    #[inline]
    #[must_use]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Pixel values, row-major.
    #[must_use]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Exposure time in seconds.
    #[inline]
    #[must_use]
    pub fn exposure_time(&self) -> f64 {
        self.exposure_time
    }

    /// Sets the exposure time in seconds.
    pub fn set_exposure_time(&mut self, seconds: f64) {
        self.exposure_time = seconds;
    }

    /// Value at integer pixel `(x, y)`; 0.0 outside the image.
    #[inline]
    #[must_use]
    pub fn get(&self, x: usize, y: usize) -> f64 {
        if x < self.width && y < self.height {
            self.data[y * self.width + x]
        } else {
            0.0
        }
    }

    /// Sets integer pixel `(x, y)`; ignored outside the image.
    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: f64) {
        if x < self.width && y < self.height {
            self.data[y * self.width + x] = value;
        }
    }

    /// Adds to integer pixel `(x, y)`; ignored outside the image.
    #[inline]
    pub fn add(&mut self, x: usize, y: usize, value: f64) {
        if x < self.width && y < self.height {
            self.data[y * self.width + x] += value;
        }
    }

    /// Pixel containing the continuous point `(x, y)`, if inside the image.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn pixel_at(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        if !(x >= 0.0 && y >= 0.0) {
            return None;
        }
        let (px, py) = (x.floor() as usize, y.floor() as usize);
        (px < self.width && py < self.height).then_some((px, py))
    }

    /// Distributes `value` bilinearly over the four pixels whose centres
    /// surround the continuous point `(x, y)`. Pixel `i` covers `[i, i + 1)`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn splat_add(&mut self, x: f64, y: f64, value: f64) {
        let fx = x - 0.5;
        let fy = y - 0.5;
        if !(fx.is_finite() && fy.is_finite()) {
            return;
        }
        let x0 = fx.floor();
        let y0 = fy.floor();
        let wx = fx - x0;
        let wy = fy - y0;
        let (x0, y0) = (x0 as i64, y0 as i64);

        for (dx, dy, weight) in [
            (0, 0, (1.0 - wx) * (1.0 - wy)),
            (1, 0, wx * (1.0 - wy)),
            (0, 1, (1.0 - wx) * wy),
            (1, 1, wx * wy),
        ] {
            if weight == 0.0 {
                continue;
            }
            if let (Ok(px), Ok(py)) = (usize::try_from(x0 + dx), usize::try_from(y0 + dy)) {
                self.add(px, py, value * weight);
            }
        }
    }
}

/// Accumulates clusters into a [`ProjectionImage`].
///
/// Positions are mapped from detector units to image pixels through the
/// source bounding box: `px = x·W/bbox.w − bbox.min_x·W/bbox.w`.
#[derive(Debug, Clone)]
pub struct Projector {
    settings: ProjectionSettings,
    image: ProjectionImage,
    counts: ProjectionImage,
    scale_x: f64,
    scale_y: f64,
    offset_x: f64,
    offset_y: f64,
    min_time: Timestamp,
    max_time: Timestamp,
    accepted: usize,
}

impl Projector {
    /// Creates a projector for a source with the given extent and time range.
    ///
    /// The effective time window is the intersection of the stream range
    /// `[stream_start, stream_end]` and the settings window.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if the settings fail validation or the
    /// bounding box is empty.
    #[allow(clippy::cast_precision_loss)]
    pub fn new(
        settings: ProjectionSettings,
        bbox: BoundingBox,
        stream_start: Timestamp,
        stream_end: Timestamp,
    ) -> Result<Self> {
        settings.validate()?;
        if !(bbox.width() > 0.0 && bbox.height() > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "bounding box must have a positive extent, got {bbox:?}"
            )));
        }
        let width = usize::try_from(settings.image_width)
            .map_err(|_| Error::InvalidConfig("image width too large".to_string()))?;
        let height = usize::try_from(settings.image_height)
            .map_err(|_| Error::InvalidConfig("image height too large".to_string()))?;

        let scale_x = width as f64 / bbox.width();
        let scale_y = height as f64 / bbox.height();
        let min_time = stream_start.max(settings.min_time);
        let max_time = stream_end.min(settings.max_time);

        let mut image = ProjectionImage::new(width, height);
        image.set_exposure_time(seconds_from_ticks(max_time.saturating_sub(min_time)));

        Ok(Self {
            counts: ProjectionImage::new(width, height),
            image,
            scale_x,
            scale_y,
            offset_x: bbox.min_x * scale_x,
            offset_y: bbox.min_y * scale_y,
            min_time,
            max_time,
            accepted: 0,
            settings,
        })
    }

    /// Effective time window `(min, max)` in ticks.
    #[must_use]
    pub fn time_window(&self) -> (Timestamp, Timestamp) {
        (self.min_time, self.max_time)
    }

    /// Clusters accepted so far.
    #[must_use]
    pub fn accepted(&self) -> usize {
        self.accepted
    }

    /// Maps a detector-space point to continuous image coordinates.
    #[inline]
    #[must_use]
    pub fn to_image(&self, x: f64, y: f64) -> (f64, f64) {
        (
            x * self.scale_x - self.offset_x,
            y * self.scale_y - self.offset_y,
        )
    }

    /// Adds one cluster; returns false if it was filtered out.
    pub fn accumulate(&mut self, cluster: &Cluster) -> bool {
        let energy = cluster.energy;
        if !(energy >= self.settings.min_energy && energy <= self.settings.max_energy) {
            return false;
        }
        if cluster.timestamp < self.min_time || cluster.timestamp > self.max_time {
            return false;
        }

        let value = match self.settings.attribute {
            ProjectionAttribute::Energy => energy,
            ProjectionAttribute::EventCount => 1.0,
            ProjectionAttribute::TimeOfArrival => seconds_from_ticks(cluster.timestamp),
        };
        let (x, y) = self.to_image(cluster.x, cluster.y);

        match self.settings.mode {
            ProjectionMode::Sum => self.image.splat_add(x, y, value),
            ProjectionMode::Mean => {
                self.image.splat_add(x, y, value);
                self.counts.splat_add(x, y, 1.0);
            }
            ProjectionMode::Minimum => self.aggregate(x, y, value, f64::min),
            ProjectionMode::Maximum => self.aggregate(x, y, value, f64::max),
        }
        self.accepted += 1;
        true
    }

    fn aggregate(&mut self, x: f64, y: f64, value: f64, combine: fn(f64, f64) -> f64) {
        let Some((px, py)) = self.image.pixel_at(x, y) else {
            return;
        };
        if self.counts.get(px, py) == 0.0 {
            self.image.set(px, py, value);
        } else {
            let current = self.image.get(px, py);
            self.image.set(px, py, combine(current, value));
        }
        self.counts.add(px, py, 1.0);
    }

    /// Consumes a cluster stream and returns the finished image.
    ///
    /// # Errors
    /// Propagates stream errors and returns [`Error::Cancelled`] if `operation`
    /// is cancelled.
    pub fn project<I, O>(mut self, clusters: I, operation: &O) -> Result<ProjectionImage>
    where
        I: IntoIterator<Item = Result<Cluster>>,
        O: Operation + ?Sized,
    {
        for (index, cluster) in clusters.into_iter().enumerate() {
            self.accumulate(&cluster?);
            if (index + 1) % CANCEL_CHECK_INTERVAL == 0 {
                operation.check_cancelled()?;
            }
        }
        log::debug!("Projected {} clusters", self.accepted);
        Ok(self.finish())
    }

    /// Finishes accumulation; in mean mode divides by the splatted counts.
    #[must_use]
    pub fn finish(mut self) -> ProjectionImage {
        if self.settings.mode == ProjectionMode::Mean {
            for (value, &count) in self.image.data.iter_mut().zip(&self.counts.data) {
                if count.abs() > f64::EPSILON {
                    *value /= count;
                }
            }
        }
        self.image
    }
}

/// Normalises `image` by a white (flat-field) image.
///
/// Each pixel becomes `image / white · (white.exposure / image.exposure)`;
/// pixels with a zero white value become 0.0.
///
/// # Errors
/// Returns [`Error::InvalidConfig`] if the image sizes differ.
pub fn normalize_with_white(
    image: &ProjectionImage,
    white: &ProjectionImage,
) -> Result<ProjectionImage> {
    if image.width != white.width || image.height != white.height {
        return Err(Error::InvalidConfig(format!(
            "white image is {}x{}, expected {}x{}",
            white.width, white.height, image.width, image.height
        )));
    }
    let time_factor = if image.exposure_time > 0.0 {
        white.exposure_time / image.exposure_time
    } else {
        1.0
    };
    let data = image
        .data
        .iter()
        .zip(&white.data)
        .map(|(&value, &flat)| {
            if flat == 0.0 {
                0.0
            } else {
                value / flat * time_factor
            }
        })
        .collect();
    Ok(ProjectionImage {
        width: image.width,
        height: image.height,
        data,
        exposure_time: image.exposure_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use photonpix_core::hit::{CalibratedEvent, RawEvent};
    use photonpix_core::NoopOperation;

    fn cluster_at(x: f64, y: f64, ts: u64, energy: f64) -> Cluster {
        let mut cluster = Cluster::singleton(CalibratedEvent::new(RawEvent::new(0, 0, ts, 10), energy));
        cluster.set_position(x, y);
        cluster
    }

    fn projector(settings: ProjectionSettings) -> Projector {
        Projector::new(settings, BoundingBox::pixel_matrix(), 0, 1_000_000).unwrap()
    }

    #[test]
    fn test_splat_centered_lands_on_one_pixel() {
        let mut image = ProjectionImage::new(4, 4);
        image.splat_add(1.5, 2.5, 3.0);
        assert_relative_eq!(image.get(1, 2), 3.0);
        assert_relative_eq!(image.data().iter().sum::<f64>(), 3.0);
    }

    #[test]
    fn test_splat_between_pixels_splits_weight() {
        let mut image = ProjectionImage::new(4, 4);
        image.splat_add(2.0, 1.5, 4.0);
        assert_relative_eq!(image.get(1, 1), 2.0);
        assert_relative_eq!(image.get(2, 1), 2.0);

        // Weight falling outside the image is dropped.
        let mut edge = ProjectionImage::new(4, 4);
        edge.splat_add(0.0, 0.5, 4.0);
        assert_relative_eq!(edge.get(0, 0), 2.0);
        assert_relative_eq!(edge.data().iter().sum::<f64>(), 2.0);
    }

    #[test]
    fn test_energy_and_time_windows() {
        let settings = ProjectionSettings::new()
            .with_energy_range(5.0, 10.0)
            .with_time_range(100, 200);
        let mut projector = projector(settings);

        assert!(projector.accumulate(&cluster_at(10.5, 10.5, 150, 5.0)));
        assert!(projector.accumulate(&cluster_at(10.5, 10.5, 200, 10.0)));
        assert!(!projector.accumulate(&cluster_at(10.5, 10.5, 150, 4.9)));
        assert!(!projector.accumulate(&cluster_at(10.5, 10.5, 150, 10.1)));
        assert!(!projector.accumulate(&cluster_at(10.5, 10.5, 99, 7.0)));
        assert!(!projector.accumulate(&cluster_at(10.5, 10.5, 201, 7.0)));

        let image = projector.finish();
        assert_relative_eq!(image.get(10, 10), 15.0);
        assert_relative_eq!(image.exposure_time(), seconds_from_ticks(100));
    }

    #[test]
    fn test_oversized_image_rejected_before_allocation() {
        let settings = ProjectionSettings::new().with_image_size(1 << 20, 1 << 20);
        let result = Projector::new(settings, BoundingBox::pixel_matrix(), 0, 1);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_time_window_clipped_to_stream() {
        let settings = ProjectionSettings::new().with_time_range(0, 5_000_000);
        let projector = Projector::new(settings, BoundingBox::pixel_matrix(), 1000, 3000).unwrap();
        assert_eq!(projector.time_window(), (1000, 3000));
    }

    #[test]
    fn test_mean_mode() {
        let settings = ProjectionSettings::new().with_mode(ProjectionMode::Mean);
        let mut projector = projector(settings);
        projector.accumulate(&cluster_at(3.5, 3.5, 1, 2.0));
        projector.accumulate(&cluster_at(3.5, 3.5, 2, 6.0));
        let image = projector.finish();
        assert_relative_eq!(image.get(3, 3), 4.0);
        assert_relative_eq!(image.get(4, 4), 0.0);
    }

    #[test]
    fn test_min_max_modes_initialize_with_first_value() {
        for (mode, expected) in [(ProjectionMode::Minimum, 3.0), (ProjectionMode::Maximum, 9.0)] {
            let mut projector = projector(ProjectionSettings::new().with_mode(mode));
            for energy in [5.0, 3.0, 9.0] {
                projector.accumulate(&cluster_at(7.2, 8.9, 1, energy));
            }
            let image = projector.finish();
            assert_relative_eq!(image.get(7, 8), expected);
            assert_eq!(image.data().iter().filter(|v| **v != 0.0).count(), 1);
        }
    }

    #[test]
    fn test_attributes() {
        let mut count = projector(
            ProjectionSettings::new().with_attribute(ProjectionAttribute::EventCount),
        );
        count.accumulate(&cluster_at(0.5, 0.5, 1, 50.0));
        count.accumulate(&cluster_at(0.5, 0.5, 2, 70.0));
        assert_relative_eq!(count.finish().get(0, 0), 2.0);

        let mut toa = projector(
            ProjectionSettings::new()
                .with_attribute(ProjectionAttribute::TimeOfArrival)
                .with_mode(ProjectionMode::Maximum),
        );
        toa.accumulate(&cluster_at(0.5, 0.5, 640_000, 1.0));
        assert_relative_eq!(toa.finish().get(0, 0), 1e-3, max_relative = 1e-12);
    }

    #[test]
    fn test_bounding_box_mapping() {
        let bbox = BoundingBox::new(10.0, 20.0, 30.0, 60.0);
        let settings = ProjectionSettings::new().with_image_size(100, 200);
        let projector = Projector::new(settings, bbox, 0, 10).unwrap();
        let (x, y) = projector.to_image(20.0, 40.0);
        assert_relative_eq!(x, 50.0);
        assert_relative_eq!(y, 100.0);

        assert!(Projector::new(
            ProjectionSettings::new(),
            BoundingBox::new(0.0, 0.0, 0.0, 5.0),
            0,
            10
        )
        .is_err());
    }

    #[test]
    fn test_project_stream_and_cancel() {
        let clusters: Vec<Result<Cluster>> =
            (0..10).map(|i| Ok(cluster_at(1.5, 1.5, i, 1.0))).collect();
        let image = projector(ProjectionSettings::new())
            .project(clusters, &NoopOperation)
            .unwrap();
        assert_relative_eq!(image.get(1, 1), 10.0);

        let handle = photonpix_core::OperationHandle::new();
        handle.cancel();
        let many: Vec<Result<Cluster>> = (0..CANCEL_CHECK_INTERVAL as u64)
            .map(|i| Ok(cluster_at(1.5, 1.5, i, 1.0)))
            .collect();
        let result = projector(ProjectionSettings::new()).project(many, &handle);
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn test_white_normalization() {
        let mut image = ProjectionImage::from_data(2, 1, vec![4.0, 3.0]).unwrap();
        image.set_exposure_time(2.0);
        let mut white = ProjectionImage::from_data(2, 1, vec![2.0, 0.0]).unwrap();
        white.set_exposure_time(4.0);

        let normalized = normalize_with_white(&image, &white).unwrap();
        assert_relative_eq!(normalized.get(0, 0), 4.0);
        assert_relative_eq!(normalized.get(1, 0), 0.0);

        let wrong = ProjectionImage::new(3, 1);
        assert!(normalize_with_white(&image, &wrong).is_err());
    }
}

//! End-to-end runners: event stream -> clusters -> cluster list or image.

use std::sync::Arc;

use photonpix_algorithms::{
    normalize_with_white, ClusterBuilder, ProjectionImage, Projector, XrfCorrector,
};
use photonpix_core::{Cluster, ClusteringSettings, Error, Operation, ProjectionSettings};
use photonpix_tpx::{BoundingBox, CalibrationTable, DetectorGeometry};

use crate::accessor::EventAccessor;
use crate::sink::{ClusterSink, DataVersion, ImageSink};
use crate::source::{EventSource, DEFAULT_BLOCK_SIZE};
use crate::Result;

/// One event stream together with how to interpret it.
pub struct EventInput<A> {
    /// Accessor holding the stream.
    pub accessor: A,
    /// Stream index within the accessor.
    pub stream: usize,
    /// Shared ToT to energy calibration.
    pub calibration: Arc<CalibrationTable>,
    /// Pixel to detector transform applied to cluster positions.
    pub geometry: DetectorGeometry,
    /// Events requested per accessor read.
    pub block_size: usize,
}

impl<A: EventAccessor> EventInput<A> {
    /// Stream 0 of `accessor` with identity geometry.
    #[must_use]
    pub fn new(accessor: A, calibration: Arc<CalibrationTable>) -> Self {
        Self {
            accessor,
            stream: 0,
            calibration,
            geometry: DetectorGeometry::identity(),
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    /// Selects the stream to read.
    #[must_use]
    pub fn with_stream(mut self, stream: usize) -> Self {
        self.stream = stream;
        self
    }

    /// Sets the detector geometry.
    #[must_use]
    pub fn with_geometry(mut self, geometry: DetectorGeometry) -> Self {
        self.geometry = geometry;
        self
    }

    /// Sets the number of events requested per read.
    #[must_use]
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Opens a calibrated event source over this input.
    ///
    /// # Errors
    /// Returns the accessor error if the stream cannot be described.
    pub fn source<'a, O>(&'a self, operation: &'a O) -> Result<EventSource<&'a A, &'a O>>
    where
        O: Operation + ?Sized,
    {
        let source = EventSource::new(
            &self.accessor,
            self.stream,
            Arc::clone(&self.calibration),
            operation,
        )?;
        Ok(source.with_block_size(self.block_size))
    }
}

/// Lazy cluster stream, optionally XRF-corrected.
pub enum ClusterStream<I, O>
where
    I: Iterator<Item = photonpix_core::Result<photonpix_core::CalibratedEvent>>,
    O: Operation,
{
    /// Plain clustering output.
    Plain(ClusterBuilder<I, O>),
    /// Clustering output passed through XRF correction.
    Corrected(XrfCorrector<ClusterBuilder<I, O>>),
}

impl<I, O> Iterator for ClusterStream<I, O>
where
    I: Iterator<Item = photonpix_core::Result<photonpix_core::CalibratedEvent>>,
    O: Operation,
{
    type Item = photonpix_core::Result<Cluster>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Plain(builder) => builder.next(),
            Self::Corrected(corrector) => corrector.next(),
        }
    }
}

/// Builds the lazy cluster stream for `input`.
///
/// XRF correction is applied when enabled and not in passthrough mode.
///
/// # Errors
/// Returns an error if the settings are invalid or the stream cannot be opened.
pub fn cluster_stream<'a, A, O>(
    input: &'a EventInput<A>,
    settings: &ClusteringSettings,
    operation: &'a O,
) -> Result<ClusterStream<EventSource<&'a A, &'a O>, &'a O>>
where
    A: EventAccessor,
    O: Operation + ?Sized,
{
    let source = input.source(operation)?;
    let builder = ClusterBuilder::new(source, settings, input.geometry.clone(), operation)?;
    if settings.xrf_active() {
        Ok(ClusterStream::Corrected(XrfCorrector::new(
            builder,
            settings.xrf.clone(),
        )?))
    } else {
        Ok(ClusterStream::Plain(builder))
    }
}

/// Clusters `input` into `sink` and commits it.
///
/// # Errors
/// Returns the first error from the accessor, the settings, the sink or
/// cancellation; the sink is not committed in that case.
pub fn run_clustering<A, S, O>(
    input: &EventInput<A>,
    settings: &ClusteringSettings,
    sink: &mut S,
    operation: &O,
) -> Result<DataVersion>
where
    A: EventAccessor,
    S: ClusterSink + ?Sized,
    O: Operation + ?Sized,
{
    log::info!(
        "Clustering stream {} (margin {} ticks, xrf {}, passthrough {})",
        input.stream,
        settings.temporal_margin,
        settings.xrf_active(),
        settings.passthrough
    );
    let mut count = 0u64;
    for cluster in cluster_stream(input, settings, operation)? {
        sink.push(cluster?)?;
        count += 1;
    }
    operation.set_progress(1.0);
    let version = sink.finish()?;
    log::info!("Emitted {count} clusters to {}", version.object);
    Ok(version)
}

/// Projects the clusters of `input` into an image.
///
/// The image spans the stream's bounding box, or the default extent when
/// the stream records none.
///
/// # Errors
/// Returns the first error from the accessor, the settings or cancellation.
pub fn project_input<A, O>(
    input: &EventInput<A>,
    clustering: &ClusteringSettings,
    projection: &ProjectionSettings,
    operation: &O,
) -> Result<ProjectionImage>
where
    A: EventAccessor,
    O: Operation + ?Sized,
{
    let info = input.accessor.stream_info(input.stream)?;
    let bbox = info.bounding_box.unwrap_or_else(|| {
        log::debug!("Stream {} has no bounding box, using default extent", input.stream);
        BoundingBox::default()
    });
    let projector = Projector::new(
        projection.clone(),
        bbox,
        info.min_timestamp,
        info.max_timestamp,
    )?;
    let clusters = cluster_stream(input, clustering, operation)?;
    Ok(projector.project(clusters, operation)?)
}

/// Projects `input` into `sink`, normalising by `white` when enabled.
///
/// # Errors
/// Returns [`Error::InvalidConfig`] if the white image is enabled but no
/// white input is given, and otherwise the first error from the accessors,
/// the settings, the sink or cancellation.
pub fn run_projection<A, W, S, O>(
    input: &EventInput<A>,
    white: Option<&EventInput<W>>,
    clustering: &ClusteringSettings,
    projection: &ProjectionSettings,
    sink: &mut S,
    operation: &O,
) -> Result<DataVersion>
where
    A: EventAccessor,
    W: EventAccessor,
    S: ImageSink + ?Sized,
    O: Operation + ?Sized,
{
    projection.validate()?;
    let white = match (projection.enable_white_image, white) {
        (true, None) => {
            return Err(Error::InvalidConfig(
                "white image normalisation enabled but no white input given".to_string(),
            )
            .into())
        }
        (true, Some(white)) => Some(white),
        (false, _) => None,
    };

    log::info!(
        "Projecting stream {} ({} / {}, {}x{})",
        input.stream,
        projection.attribute,
        projection.mode,
        projection.image_width,
        projection.image_height
    );
    let mut image = project_input(input, clustering, projection, operation)?;
    if let Some(white) = white {
        log::info!("Projecting white stream {}", white.stream);
        let white_image = project_input(white, clustering, projection, operation)?;
        image = normalize_with_white(&image, &white_image)?;
    }

    operation.set_progress(1.0);
    sink.write_image(&image)?;
    sink.finish()
}

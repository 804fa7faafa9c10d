//! photonpix-core: shared types for Timepix3 photon event processing.
//!
//! This crate holds the value types every other photonpix crate speaks:
//! pixel coordinates and events, clusters, clustering and projection
//! settings, the error taxonomy and the progress/cancellation context.

pub mod cluster;
pub mod error;
pub mod hit;
pub mod operation;
pub mod settings;

pub use cluster::Cluster;
pub use error::{Error, Result};
pub use hit::{
    seconds_from_ticks, ticks_from_nanoseconds, ticks_from_seconds, CalibratedEvent, Hit,
    PixelCoord, RawEvent, ShortTimestamp, Timestamp, MATRIX_SIZE, PIXEL_COUNT, SECONDS_PER_TICK,
    TICKS_PER_NANOSECOND,
};
pub use operation::{NoopOperation, Operation, OperationHandle};
pub use settings::{
    ClusteringSettings, ProjectionAttribute, ProjectionMode, ProjectionSettings, XrfSettings,
    MAX_IMAGE_PIXELS,
};

#[cfg(feature = "serde")]
pub use settings::{HostClusteringSettings, HostProjectionSettings};

//! photonpix-algorithms: stream processing for calibrated photon events.
//!
//! This crate provides the processing stages between a calibrated event
//! stream and an image:
//! - **Clustering** - single-pass spatio-temporal grouping of events
//! - **XRF correction** - re-joins fluorescence-escape cluster pairs
//! - **Projection** - accumulates clusters into a 2D image
//!
#![warn(missing_docs)]

mod cluster_builder;
mod projection;
pub mod spatial;
mod xrf;

pub use cluster_builder::{
    cluster_events, ClusterBuilder, ClusteringStatistics, CANCEL_CHECK_INTERVAL,
};
pub use projection::{normalize_with_white, ProjectionImage, Projector};
pub use spatial::PixelOwnerMap;
pub use xrf::{XrfCorrector, XrfStatistics};

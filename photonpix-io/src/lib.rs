//! photonpix-io: event access, output sinks and pipeline runners.
//!
//! This crate connects stored event streams to the processing stages:
//! - [`EventAccessor`] implementations for in-memory streams and
//!   memory-mapped event-list files (via memmap2)
//! - [`EventSource`], a lazy calibrated event stream read in blocks
//! - [`ClusterSink`] / [`ImageSink`] outputs returning a [`DataVersion`]
//! - [`run_clustering`] / [`run_projection`] end-to-end runners
//!

mod accessor;
mod error;
pub mod pipeline;
mod reader;
mod sink;
mod source;
mod writer;

pub use accessor::{EventAccessor, MemoryEventAccessor, StreamInfo};
pub use error::{Error, Result};
pub use pipeline::{
    cluster_stream, project_input, run_clustering, run_projection, ClusterStream, EventInput,
};
pub use reader::{
    EventListFile, MappedFileReader, EVENT_LIST_HEADER_BYTES, EVENT_LIST_MAGIC, EVENT_RECORD_BYTES,
};
pub use sink::{ClusterList, ClusterSink, DataVersion, ImageBuffer, ImageSink};
pub use source::{EventSource, DEFAULT_BLOCK_SIZE};
pub use writer::{
    ClusterFileFormat, ClusterFileWriter, EventListWriter, ImageFileFormat, ImageFileWriter,
    CLUSTER_RECORD_BYTES,
};

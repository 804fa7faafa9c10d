//! Event accessors: time-range queries over stored raw event streams.

use std::sync::Arc;

use photonpix_core::hit::{RawEvent, Timestamp};
use photonpix_core::{Error, Result};
use photonpix_tpx::BoundingBox;

/// Summary of one event stream.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamInfo {
    /// Number of events in the stream.
    pub event_count: u64,
    /// Earliest timestamp (0 for an empty stream).
    pub min_timestamp: Timestamp,
    /// Latest timestamp (0 for an empty stream).
    pub max_timestamp: Timestamp,
    /// Detector-space extent, if the stream records one.
    pub bounding_box: Option<BoundingBox>,
}

/// Read access to time-ordered raw event streams.
///
/// Implementations return events in non-decreasing timestamp order.
pub trait EventAccessor {
    /// Number of streams.
    fn stream_count(&self) -> usize;

    /// Summary of stream `stream`.
    ///
    /// # Errors
    /// Returns [`Error::Accessor`] for an unknown stream or a failed read.
    fn stream_info(&self, stream: usize) -> Result<StreamInfo>;

    /// Appends to `out` the earliest events of `stream` with
    /// `first_ts <= timestamp <= last_ts`, at most `max_count` of them.
    ///
    /// Returns the number of events appended.
    ///
    /// # Errors
    /// Returns [`Error::Accessor`] for an unknown stream or a failed read.
    fn read_events(
        &self,
        stream: usize,
        first_ts: Timestamp,
        last_ts: Timestamp,
        max_count: usize,
        out: &mut Vec<RawEvent>,
    ) -> Result<usize>;
}

impl<T: EventAccessor + ?Sized> EventAccessor for &T {
    fn stream_count(&self) -> usize {
        (**self).stream_count()
    }

    fn stream_info(&self, stream: usize) -> Result<StreamInfo> {
        (**self).stream_info(stream)
    }

    fn read_events(
        &self,
        stream: usize,
        first_ts: Timestamp,
        last_ts: Timestamp,
        max_count: usize,
        out: &mut Vec<RawEvent>,
    ) -> Result<usize> {
        (**self).read_events(stream, first_ts, last_ts, max_count, out)
    }
}

impl<T: EventAccessor + ?Sized> EventAccessor for Arc<T> {
    fn stream_count(&self) -> usize {
        (**self).stream_count()
    }

    fn stream_info(&self, stream: usize) -> Result<StreamInfo> {
        (**self).stream_info(stream)
    }

    fn read_events(
        &self,
        stream: usize,
        first_ts: Timestamp,
        last_ts: Timestamp,
        max_count: usize,
        out: &mut Vec<RawEvent>,
    ) -> Result<usize> {
        (**self).read_events(stream, first_ts, last_ts, max_count, out)
    }
}

pub(crate) fn check_stream(stream: usize, count: usize) -> Result<()> {
    if stream >= count {
        return Err(Error::Accessor(format!(
            "stream {stream} out of range ({count} streams)"
        )));
    }
    Ok(())
}

#[derive(Clone, Debug, Default)]
struct MemoryStream {
    events: Vec<RawEvent>,
    bounding_box: Option<BoundingBox>,
}

/// Event streams held in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryEventAccessor {
    streams: Vec<MemoryStream>,
}

impl MemoryEventAccessor {
    /// Creates an accessor without streams.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an accessor holding a single stream.
    #[must_use]
    pub fn from_events(events: Vec<RawEvent>) -> Self {
        let mut accessor = Self::new();
        accessor.add_stream(events, None);
        accessor
    }

    /// Adds a stream and returns its index.
    ///
    /// Events are sorted by timestamp (stable, so equal timestamps keep
    /// their insertion order).
    pub fn add_stream(&mut self, mut events: Vec<RawEvent>, bounding_box: Option<BoundingBox>) -> usize {
        events.sort_by_key(|e| e.timestamp);
        self.streams.push(MemoryStream {
            events,
            bounding_box,
        });
        self.streams.len() - 1
    }

    fn stream(&self, stream: usize) -> Result<&MemoryStream> {
        check_stream(stream, self.streams.len())?;
        Ok(&self.streams[stream])
    }
}

impl EventAccessor for MemoryEventAccessor {
    fn stream_count(&self) -> usize {
        self.streams.len()
    }

    fn stream_info(&self, stream: usize) -> Result<StreamInfo> {
        let stream = self.stream(stream)?;
        Ok(StreamInfo {
            event_count: stream.events.len() as u64,
            min_timestamp: stream.events.first().map_or(0, |e| e.timestamp),
            max_timestamp: stream.events.last().map_or(0, |e| e.timestamp),
            bounding_box: stream.bounding_box,
        })
    }

    fn read_events(
        &self,
        stream: usize,
        first_ts: Timestamp,
        last_ts: Timestamp,
        max_count: usize,
        out: &mut Vec<RawEvent>,
    ) -> Result<usize> {
        let events = &self.stream(stream)?.events;
        let start = events.partition_point(|e| e.timestamp < first_ts);
        let before = out.len();
        out.extend(
            events[start..]
                .iter()
                .take_while(|e| e.timestamp <= last_ts)
                .take(max_count),
        );
        Ok(out.len() - before)
    }
}

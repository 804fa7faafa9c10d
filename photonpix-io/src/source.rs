//! Lazy calibrated event stream over an [`EventAccessor`].

use std::sync::Arc;

use photonpix_core::hit::{CalibratedEvent, PixelCoord, RawEvent, Timestamp};
use photonpix_core::{Operation, Result};
use photonpix_tpx::CalibrationTable;

use crate::accessor::{EventAccessor, StreamInfo};

/// Default number of events requested per accessor read.
pub const DEFAULT_BLOCK_SIZE: usize = 1 << 16;

/// Forward-only iterator yielding calibrated events of one stream.
///
/// Events are read from the accessor in blocks. Each block starts at the
/// timestamp of the last event already delivered; events at that timestamp
/// which were part of the previous block are skipped, so events sharing a
/// timestamp across a block boundary are neither lost nor repeated.
pub struct EventSource<A, O> {
    accessor: A,
    stream: usize,
    calibration: Arc<CalibrationTable>,
    operation: O,
    info: StreamInfo,
    first_ts: Timestamp,
    last_ts: Timestamp,
    block_size: usize,
    buffer: Vec<RawEvent>,
    position: usize,
    next_ts: Timestamp,
    seen_at_next_ts: usize,
    exhausted: bool,
    finished: bool,
    events_read: u64,
    blocks_read: u64,
    degenerate_count: u64,
}

impl<A, O> EventSource<A, O>
where
    A: EventAccessor,
    O: Operation,
{
    /// Creates a source over the full time range of `stream`.
    ///
    /// # Errors
    /// Returns the accessor error if the stream cannot be described.
    pub fn new(
        accessor: A,
        stream: usize,
        calibration: Arc<CalibrationTable>,
        operation: O,
    ) -> Result<Self> {
        let info = accessor.stream_info(stream)?;
        Ok(Self {
            accessor,
            stream,
            calibration,
            operation,
            first_ts: info.min_timestamp,
            last_ts: info.max_timestamp,
            next_ts: info.min_timestamp,
            exhausted: info.event_count == 0,
            info,
            block_size: DEFAULT_BLOCK_SIZE,
            buffer: Vec::new(),
            position: 0,
            seen_at_next_ts: 0,
            finished: false,
            events_read: 0,
            blocks_read: 0,
            degenerate_count: 0,
        })
    }

    /// Sets the number of events requested per read (at least 1).
    #[must_use]
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    /// Restricts the stream to `[first_ts, last_ts]`, clipped to the stream range.
    ///
    /// Must be called before the first event is read.
    #[must_use]
    pub fn with_time_range(mut self, first_ts: Timestamp, last_ts: Timestamp) -> Self {
        self.first_ts = first_ts.max(self.info.min_timestamp);
        self.last_ts = last_ts.min(self.info.max_timestamp);
        self.next_ts = self.first_ts;
        if self.first_ts > self.last_ts {
            self.exhausted = true;
        }
        self
    }

    /// Summary of the underlying stream.
    #[must_use]
    pub fn stream_info(&self) -> &StreamInfo {
        &self.info
    }

    /// Effective time range `(first, last)`.
    #[must_use]
    pub fn time_range(&self) -> (Timestamp, Timestamp) {
        (self.first_ts, self.last_ts)
    }

    /// Events delivered so far.
    #[must_use]
    pub fn events_read(&self) -> u64 {
        self.events_read
    }

    /// Events whose calibration was degenerate (energy reported as 0.0).
    #[must_use]
    pub fn degenerate_count(&self) -> u64 {
        self.degenerate_count
    }

    #[allow(clippy::cast_precision_loss)]
    fn progress(&self) -> f64 {
        if self.exhausted || self.last_ts <= self.first_ts {
            return 1.0;
        }
        (self.next_ts - self.first_ts) as f64 / (self.last_ts - self.first_ts) as f64
    }

    fn fill_block(&mut self) -> Result<()> {
        self.operation.check_cancelled()?;

        self.buffer.clear();
        let requested = self.seen_at_next_ts.saturating_add(self.block_size);
        let read = self.accessor.read_events(
            self.stream,
            self.next_ts,
            self.last_ts,
            requested,
            &mut self.buffer,
        )?;
        self.blocks_read += 1;
        self.position = self.seen_at_next_ts.min(self.buffer.len());

        if read < requested {
            self.exhausted = true;
        } else if let Some(last) = self.buffer.last().map(|e| e.timestamp) {
            self.seen_at_next_ts = self
                .buffer
                .iter()
                .rev()
                .take_while(|e| e.timestamp == last)
                .count();
            self.next_ts = last;
        }

        log::debug!(
            "Block {} of stream {}: {} new events, resuming at {}",
            self.blocks_read,
            self.stream,
            self.buffer.len() - self.position,
            self.next_ts
        );
        self.operation.set_progress(self.progress());
        Ok(())
    }

    fn calibrate(&mut self, raw: RawEvent) -> Result<CalibratedEvent> {
        let coord = PixelCoord::checked(raw.coord.x, raw.coord.y)?;
        let estimate = self.calibration.estimate(coord, raw.tot);
        if estimate.degenerate {
            self.degenerate_count += 1;
        }
        self.events_read += 1;
        Ok(CalibratedEvent {
            raw,
            energy: estimate.value,
            degenerate: estimate.degenerate,
        })
    }

    fn finish(&mut self) {
        self.finished = true;
        if self.degenerate_count > 0 {
            log::warn!(
                "Stream {}: {} of {} events had degenerate calibration, energy set to 0",
                self.stream,
                self.degenerate_count,
                self.events_read
            );
        }
        log::debug!(
            "Stream {} done: {} events in {} blocks",
            self.stream,
            self.events_read,
            self.blocks_read
        );
    }
}

impl<A, O> Iterator for EventSource<A, O>
where
    A: EventAccessor,
    O: Operation,
{
    type Item = Result<CalibratedEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }
            if let Some(&raw) = self.buffer.get(self.position) {
                self.position += 1;
                let event = self.calibrate(raw);
                if event.is_err() {
                    self.finished = true;
                }
                return Some(event);
            }
            if self.exhausted {
                self.finish();
                return None;
            }
            if let Err(err) = self.fill_block() {
                self.finished = true;
                return Some(Err(err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessor::MemoryEventAccessor;
    use photonpix_core::{Error, NoopOperation, OperationHandle};

    fn source(
        events: Vec<RawEvent>,
        block_size: usize,
    ) -> EventSource<MemoryEventAccessor, NoopOperation> {
        EventSource::new(
            MemoryEventAccessor::from_events(events),
            0,
            Arc::new(CalibrationTable::default()),
            NoopOperation,
        )
        .unwrap()
        .with_block_size(block_size)
    }

    #[test]
    fn test_shared_timestamps_across_blocks() {
        let mut events = Vec::new();
        for (i, ts) in [1u64, 2, 2, 2, 2, 2, 3, 3, 7].into_iter().enumerate() {
            events.push(RawEvent::new(u16::try_from(i).unwrap(), 0, ts, 4));
        }
        for block_size in 1..=10 {
            let out: Vec<CalibratedEvent> = source(events.clone(), block_size)
                .collect::<Result<_>>()
                .unwrap();
            let xs: Vec<u16> = out.iter().map(|e| e.raw.coord.x).collect();
            assert_eq!(xs, (0..9).collect::<Vec<u16>>(), "block size {block_size}");
        }
    }

    #[test]
    fn test_calibrates_with_shared_table() {
        let out: Vec<_> = source(vec![RawEvent::new(3, 3, 5, 10)], 4)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(out.len(), 1);
        assert!((out[0].energy - 20.0).abs() < 1e-12);
        assert!(!out[0].degenerate);
    }

    #[test]
    fn test_time_range_and_empty_stream() {
        let events = (0..10u16).map(|i| RawEvent::new(i, 0, u64::from(i) * 10, 1)).collect();
        let window: Vec<_> = source(events, 3)
            .with_time_range(25, 60)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(
            window.iter().map(|e| e.raw.timestamp).collect::<Vec<_>>(),
            vec![30, 40, 50, 60]
        );
        assert_eq!(source(Vec::new(), 3).count(), 0);
    }

    #[test]
    fn test_counts_degenerate_events() {
        let table = CalibrationTable::uniform(0.0, 1.0, 0.0, 0.0);
        let mut source = EventSource::new(
            MemoryEventAccessor::from_events(vec![RawEvent::new(0, 0, 1, 3), RawEvent::new(1, 0, 2, 3)]),
            0,
            Arc::new(table),
            NoopOperation,
        )
        .unwrap();
        let energies: Vec<f64> = source.by_ref().map(|e| e.unwrap().energy).collect();
        assert_eq!(energies, vec![0.0, 0.0]);
        assert_eq!(source.degenerate_count(), 2);
    }

    #[test]
    fn test_invalid_coordinate_aborts() {
        let mut source = source(vec![RawEvent::new(300, 0, 1, 1), RawEvent::new(1, 0, 2, 1)], 8);
        assert!(matches!(
            source.next(),
            Some(Err(Error::InvalidCoordinate { x: 300, y: 0 }))
        ));
        assert!(source.next().is_none());
    }

    #[test]
    fn test_cancellation_and_progress() {
        let handle = OperationHandle::new();
        let events = (0..8u16).map(|i| RawEvent::new(i, 0, u64::from(i), 1)).collect();
        let mut source = EventSource::new(
            MemoryEventAccessor::from_events(events),
            0,
            Arc::new(CalibrationTable::default()),
            handle.clone(),
        )
        .unwrap()
        .with_block_size(4);

        assert!(source.next().unwrap().is_ok());
        assert!(handle.progress() > 0.0 && handle.progress() < 1.0);
        handle.cancel();
        let rest: Vec<_> = source.collect();
        assert_eq!(rest.len(), 4);
        assert!(matches!(rest.last(), Some(Err(Error::Cancelled))));
    }

    #[test]
    fn test_unknown_stream() {
        let result = EventSource::new(
            MemoryEventAccessor::new(),
            0,
            Arc::new(CalibrationTable::default()),
            NoopOperation,
        );
        assert!(matches!(result, Err(Error::Accessor(_))));
    }
}

//! Memory-mapped file readers.
//!
//! Event-list files (`PPXEVT01`) hold one time-ordered stream:
//!
//! ```text
//! header  : magic "PPXEVT01" (8 bytes) + event count (u64 LE)
//! records : x u16, y u16, tot u16, reserved u16, timestamp u64 (all LE)
//! ```

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use photonpix_core::hit::{RawEvent, Timestamp};
use photonpix_tpx::BoundingBox;

use crate::accessor::{check_stream, EventAccessor, StreamInfo};
use crate::{Error, Result};

/// Magic bytes opening an event-list file.
pub const EVENT_LIST_MAGIC: [u8; 8] = *b"PPXEVT01";
/// Size of the event-list header in bytes.
pub const EVENT_LIST_HEADER_BYTES: usize = 16;
/// Size of one event record in bytes.
pub const EVENT_RECORD_BYTES: usize = 16;

/// A memory-mapped file reader.
///
/// Uses memmap2 to efficiently access file contents without
/// loading the entire file into memory.
pub struct MappedFileReader {
    mmap: Mmap,
    path: PathBuf,
}

impl MappedFileReader {
    /// Opens a file for memory-mapped reading.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or memory-mapped.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)?;
        // SAFETY: The file is opened read-only and we assume it is not modified concurrently.
        // This is the standard safety contract for memory mapping.
        #[allow(unsafe_code)]
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self {
            mmap,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Returns the file contents as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap[..]
    }

    /// Returns the file size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// Returns true if the file is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Path the file was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Memory-mapped event-list file exposed as a single-stream accessor.
///
/// Records must be sorted by timestamp; [`EventListWriter`](crate::EventListWriter)
/// produces such files.
pub struct EventListFile {
    reader: MappedFileReader,
    count: usize,
    bounding_box: Option<BoundingBox>,
}

impl EventListFile {
    /// Opens and validates an event-list file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be mapped, has the wrong magic or
    /// its size does not match the event count in the header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = MappedFileReader::open(path)?;
        let bytes = reader.as_bytes();
        if bytes.len() < EVENT_LIST_HEADER_BYTES || bytes[..8] != EVENT_LIST_MAGIC {
            return Err(Error::InvalidFormat(format!(
                "{} is not an event-list file",
                reader.path.display()
            )));
        }
        let count = usize::try_from(read_u64(bytes, 8)).map_err(|_| {
            Error::InvalidFormat(format!("event count too large in {}", reader.path.display()))
        })?;
        let expected = count
            .checked_mul(EVENT_RECORD_BYTES)
            .and_then(|n| n.checked_add(EVENT_LIST_HEADER_BYTES));
        if expected != Some(bytes.len()) {
            return Err(Error::InvalidFormat(format!(
                "file size {} does not match {count} events (file: {})",
                bytes.len(),
                reader.path.display()
            )));
        }
        log::debug!("Opened {} with {count} events", reader.path.display());
        Ok(Self {
            reader,
            count,
            bounding_box: None,
        })
    }

    /// Attaches the detector-space extent reported by [`EventAccessor::stream_info`].
    #[must_use]
    pub fn with_bounding_box(mut self, bounding_box: BoundingBox) -> Self {
        self.bounding_box = Some(bounding_box);
        self
    }

    /// Number of events in the file.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns true if the file holds no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Decodes event `index`.
    ///
    /// # Panics
    /// Panics if `index >= self.len()`.
    #[must_use]
    pub fn event(&self, index: usize) -> RawEvent {
        let record = self.record(index);
        RawEvent::new(
            read_u16(record, 0),
            read_u16(record, 2),
            read_u64(record, 8),
            read_u16(record, 4),
        )
    }

    /// Iterates over all events in file order.
    pub fn iter(&self) -> impl Iterator<Item = RawEvent> + '_ {
        (0..self.count).map(|index| self.event(index))
    }

    fn record(&self, index: usize) -> &[u8] {
        let start = EVENT_LIST_HEADER_BYTES + index * EVENT_RECORD_BYTES;
        &self.reader.as_bytes()[start..start + EVENT_RECORD_BYTES]
    }

    fn timestamp(&self, index: usize) -> Timestamp {
        read_u64(self.record(index), 8)
    }

    /// Index of the first event with `timestamp >= ts`.
    fn lower_bound(&self, ts: Timestamp) -> usize {
        let (mut low, mut high) = (0, self.count);
        while low < high {
            let mid = low + (high - low) / 2;
            if self.timestamp(mid) < ts {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        low
    }
}

impl EventAccessor for EventListFile {
    fn stream_count(&self) -> usize {
        1
    }

    fn stream_info(&self, stream: usize) -> photonpix_core::Result<StreamInfo> {
        check_stream(stream, 1)?;
        let (min_timestamp, max_timestamp) = if self.is_empty() {
            (0, 0)
        } else {
            (self.timestamp(0), self.timestamp(self.count - 1))
        };
        Ok(StreamInfo {
            event_count: self.count as u64,
            min_timestamp,
            max_timestamp,
            bounding_box: self.bounding_box,
        })
    }

    fn read_events(
        &self,
        stream: usize,
        first_ts: Timestamp,
        last_ts: Timestamp,
        max_count: usize,
        out: &mut Vec<RawEvent>,
    ) -> photonpix_core::Result<usize> {
        check_stream(stream, 1)?;
        let start = self.lower_bound(first_ts);
        let before = out.len();
        out.extend(
            (start..self.count)
                .map(|index| self.event(index))
                .take_while(|e| e.timestamp <= last_ts)
                .take(max_count),
        );
        Ok(out.len() - before)
    }
}

#[inline]
fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

#[inline]
fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

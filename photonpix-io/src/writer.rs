//! File writers for event lists, clusters and images.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use photonpix_algorithms::ProjectionImage;
use photonpix_core::hit::RawEvent;
use photonpix_core::Cluster;

use crate::reader::EVENT_LIST_MAGIC;
use crate::sink::{ClusterSink, DataVersion, HashingWriter, ImageSink};
use crate::Result;

/// Bytes per cluster in the binary cluster format.
pub const CLUSTER_RECORD_BYTES: usize = 36;

/// Binary cluster record:
/// u64 (timestamp) + f64 (x) + f64 (y) + f64 (energy) + u32 (event count).
pub(crate) fn encode_cluster(cluster: &Cluster) -> [u8; CLUSTER_RECORD_BYTES] {
    let mut record = [0u8; CLUSTER_RECORD_BYTES];
    record[0..8].copy_from_slice(&cluster.timestamp.to_le_bytes());
    record[8..16].copy_from_slice(&cluster.x.to_le_bytes());
    record[16..24].copy_from_slice(&cluster.y.to_le_bytes());
    record[24..32].copy_from_slice(&cluster.energy.to_le_bytes());
    let size = u32::try_from(cluster.len()).unwrap_or(u32::MAX);
    record[32..36].copy_from_slice(&size.to_le_bytes());
    record
}

/// Writer producing `PPXEVT01` event-list files.
///
/// Events must be written in non-decreasing timestamp order. The event
/// count in the header is patched in by [`EventListWriter::finish`].
pub struct EventListWriter {
    writer: BufWriter<File>,
    count: u64,
}

impl EventListWriter {
    /// Creates a new event-list file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(&EVENT_LIST_MAGIC)?;
        writer.write_all(&0u64.to_le_bytes())?;
        Ok(Self { writer, count: 0 })
    }

    /// Appends one event.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub fn write_event(&mut self, event: &RawEvent) -> Result<()> {
        self.writer.write_all(&event.coord.x.to_le_bytes())?;
        self.writer.write_all(&event.coord.y.to_le_bytes())?;
        self.writer.write_all(&event.tot.to_le_bytes())?;
        self.writer.write_all(&0u16.to_le_bytes())?;
        self.writer.write_all(&event.timestamp.to_le_bytes())?;
        self.count += 1;
        Ok(())
    }

    /// Appends a slice of events.
    ///
    /// # Errors
    /// Returns an error if a write fails.
    pub fn write_events(&mut self, events: &[RawEvent]) -> Result<()> {
        events.iter().try_for_each(|event| self.write_event(event))
    }

    /// Writes the header count and flushes; returns the number of events.
    ///
    /// # Errors
    /// Returns an error if the file cannot be updated.
    pub fn finish(mut self) -> Result<u64> {
        self.writer.seek(SeekFrom::Start(8))?;
        self.writer.write_all(&self.count.to_le_bytes())?;
        self.writer.flush()?;
        Ok(self.count)
    }
}

/// On-disk cluster encoding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClusterFileFormat {
    /// One header line then `timestamp,x,y,centroid_x,centroid_y,energy,size` rows.
    #[default]
    Csv,
    /// Packed little-endian records of [`CLUSTER_RECORD_BYTES`] bytes.
    Binary,
}

/// Writer for processed cluster data.
pub struct ClusterFileWriter {
    writer: HashingWriter<BufWriter<File>>,
    path: PathBuf,
    format: ClusterFileFormat,
    count: u64,
}

impl ClusterFileWriter {
    /// Creates a new file writer.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P, format: ClusterFileFormat) -> Result<Self> {
        let file = File::create(&path)?;
        let mut writer = HashingWriter::new(BufWriter::new(file));
        if format == ClusterFileFormat::Csv {
            writeln!(writer, "timestamp,x,y,centroid_x,centroid_y,energy,size")?;
        }
        Ok(Self {
            writer,
            path: path.as_ref().to_path_buf(),
            format,
            count: 0,
        })
    }

    /// Clusters written so far.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }
}

impl ClusterSink for ClusterFileWriter {
    fn push(&mut self, cluster: Cluster) -> Result<()> {
        match self.format {
            ClusterFileFormat::Csv => writeln!(
                self.writer,
                "{},{},{},{},{},{},{}",
                cluster.timestamp,
                cluster.x,
                cluster.y,
                cluster.centroid_x,
                cluster.centroid_y,
                cluster.energy,
                cluster.len()
            )?,
            ClusterFileFormat::Binary => self.writer.write_all(&encode_cluster(&cluster))?,
        }
        self.count += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<DataVersion> {
        self.writer.flush()?;
        log::info!("Wrote {} clusters to {}", self.count, self.path.display());
        Ok(DataVersion {
            object: self.path.display().to_string(),
            version: self.writer.hash(),
        })
    }
}

/// On-disk image encoding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ImageFileFormat {
    /// One text row per image row.
    #[default]
    Csv,
    /// Row-major little-endian `f32` with a `.json` sidecar.
    RawF32,
}

#[derive(serde::Serialize)]
struct ImageSidecar<'a> {
    width: usize,
    height: usize,
    exposure_time: f64,
    dtype: &'a str,
}

/// Writer for projected images.
pub struct ImageFileWriter {
    path: PathBuf,
    format: ImageFileFormat,
    version: Option<u64>,
}

impl ImageFileWriter {
    /// Creates a writer targeting `path`; nothing is written until an image arrives.
    #[must_use]
    pub fn new<P: AsRef<Path>>(path: P, format: ImageFileFormat) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            format,
            version: None,
        }
    }

    /// Path of the JSON sidecar written next to raw images.
    #[must_use]
    pub fn sidecar_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".json");
        PathBuf::from(name)
    }

    fn write_csv(&self, image: &ProjectionImage) -> Result<u64> {
        let mut writer = HashingWriter::new(BufWriter::new(File::create(&self.path)?));
        for row in image.data().chunks(image.width().max(1)) {
            let line = row
                .iter()
                .map(f64::to_string)
                .collect::<Vec<_>>()
                .join(",");
            writeln!(writer, "{line}")?;
        }
        writer.flush()?;
        Ok(writer.hash())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write_raw(&self, image: &ProjectionImage) -> Result<u64> {
        let mut writer = HashingWriter::new(BufWriter::new(File::create(&self.path)?));
        for &value in image.data() {
            writer.write_all(&(value as f32).to_le_bytes())?;
        }
        writer.flush()?;

        let sidecar = ImageSidecar {
            width: image.width(),
            height: image.height(),
            exposure_time: image.exposure_time(),
            dtype: "f32le",
        };
        let file = File::create(self.sidecar_path())?;
        serde_json::to_writer_pretty(BufWriter::new(file), &sidecar)?;
        Ok(writer.hash())
    }
}

impl ImageSink for ImageFileWriter {
    fn write_image(&mut self, image: &ProjectionImage) -> Result<()> {
        let hash = match self.format {
            ImageFileFormat::Csv => self.write_csv(image)?,
            ImageFileFormat::RawF32 => self.write_raw(image)?,
        };
        self.version = Some(hash);
        log::info!(
            "Wrote {}x{} image to {}",
            image.width(),
            image.height(),
            self.path.display()
        );
        Ok(())
    }

    fn finish(&mut self) -> Result<DataVersion> {
        let version = self.version.ok_or_else(|| {
            photonpix_core::Error::Output(format!("no image written to {}", self.path.display()))
        })?;
        Ok(DataVersion {
            object: self.path.display().to_string(),
            version,
        })
    }
}

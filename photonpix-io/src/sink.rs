//! Output sinks for cluster lists and projected images.

use std::io::{self, Write};

use photonpix_algorithms::ProjectionImage;
use photonpix_core::Cluster;

use crate::Result;

/// Handle to a finalized output.
///
/// `version` is a content hash: two sinks that committed the same data
/// report the same version.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct DataVersion {
    /// Name of the output object (a path for file sinks).
    pub object: String,
    /// Content hash of the committed data.
    pub version: u64,
}

/// Destination for a cluster stream.
pub trait ClusterSink {
    /// Appends one cluster.
    ///
    /// # Errors
    /// Returns an error if the cluster cannot be stored.
    fn push(&mut self, cluster: Cluster) -> Result<()>;

    /// Commits all pushed clusters.
    ///
    /// # Errors
    /// Returns an error if the output cannot be finalized.
    fn finish(&mut self) -> Result<DataVersion>;
}

/// Destination for a projected image.
pub trait ImageSink {
    /// Stores the image, replacing any previous one.
    ///
    /// # Errors
    /// Returns an error if the image cannot be stored.
    fn write_image(&mut self, image: &ProjectionImage) -> Result<()>;

    /// Commits the stored image.
    ///
    /// # Errors
    /// Returns an error if the output cannot be finalized.
    fn finish(&mut self) -> Result<DataVersion>;
}

/// 64-bit FNV-1a hash over committed bytes.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ContentHash(u64);

impl Default for ContentHash {
    fn default() -> Self {
        Self(0xcbf2_9ce4_8422_2325)
    }
}

impl ContentHash {
    pub(crate) fn update(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.0 ^= u64::from(byte);
            self.0 = self.0.wrapping_mul(0x0100_0000_01b3);
        }
    }

    pub(crate) fn value(self) -> u64 {
        self.0
    }
}

/// Writer adapter hashing everything written through it.
pub(crate) struct HashingWriter<W> {
    inner: W,
    hash: ContentHash,
}

impl<W: Write> HashingWriter<W> {
    pub(crate) fn new(inner: W) -> Self {
        Self {
            inner,
            hash: ContentHash::default(),
        }
    }

    pub(crate) fn hash(&self) -> u64 {
        self.hash.value()
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hash.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// In-memory cluster list.
#[derive(Clone, Debug, Default)]
pub struct ClusterList {
    name: String,
    clusters: Vec<Cluster>,
    hash: ContentHash,
}

impl ClusterList {
    /// Creates an empty list reported under `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Clusters pushed so far.
    #[must_use]
    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    /// Consumes the list and returns its clusters.
    #[must_use]
    pub fn into_clusters(self) -> Vec<Cluster> {
        self.clusters
    }
}

impl ClusterSink for ClusterList {
    fn push(&mut self, cluster: Cluster) -> Result<()> {
        self.hash.update(&crate::writer::encode_cluster(&cluster));
        self.clusters.push(cluster);
        Ok(())
    }

    fn finish(&mut self) -> Result<DataVersion> {
        Ok(DataVersion {
            object: self.name.clone(),
            version: self.hash.value(),
        })
    }
}

/// In-memory image slot.
#[derive(Clone, Debug, Default)]
pub struct ImageBuffer {
    name: String,
    image: Option<ProjectionImage>,
}

impl ImageBuffer {
    /// Creates an empty slot reported under `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: None,
        }
    }

    /// The stored image, if any.
    #[must_use]
    pub fn image(&self) -> Option<&ProjectionImage> {
        self.image.as_ref()
    }

    /// Consumes the slot and returns the stored image.
    #[must_use]
    pub fn into_image(self) -> Option<ProjectionImage> {
        self.image
    }
}

impl ImageSink for ImageBuffer {
    fn write_image(&mut self, image: &ProjectionImage) -> Result<()> {
        self.image = Some(image.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<DataVersion> {
        let mut hash = ContentHash::default();
        if let Some(image) = &self.image {
            for value in image.data() {
                hash.update(&value.to_le_bytes());
            }
        }
        Ok(DataVersion {
            object: self.name.clone(),
            version: hash.value(),
        })
    }
}

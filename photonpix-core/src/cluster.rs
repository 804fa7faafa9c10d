//! Cluster type produced by the clustering stage.

use crate::hit::{CalibratedEvent, Hit, Timestamp};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A group of spatially and temporally connected events, interpreted as one
/// photon or particle interaction.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Cluster {
    /// Member events in arrival order.
    pub events: Vec<CalibratedEvent>,
    /// Timestamp of the most energetic member.
    pub timestamp: Timestamp,
    /// Mean member column plus half a pixel.
    pub centroid_x: f64,
    /// Mean member row plus half a pixel.
    pub centroid_y: f64,
    /// Centroid X in detector units.
    pub x: f64,
    /// Centroid Y in detector units.
    pub y: f64,
    /// Sum of member energies (keV).
    pub energy: f64,
}

impl Cluster {
    /// Builds a cluster from its member events.
    ///
    /// The detector position is initialised to the pixel centroid; callers
    /// that know the detector geometry overwrite it with [`Cluster::set_position`].
    /// Returns `None` for an empty member list.
    #[must_use]
    pub fn from_events(events: Vec<CalibratedEvent>) -> Option<Self> {
        let first = events.first()?;
        let mut representative = first;
        let mut energy = 0.0;
        let mut sum_x = 0.0;
        let mut sum_y = 0.0;

        for event in &events {
            if event.energy > representative.energy {
                representative = event;
            }
            energy += event.energy;
            sum_x += f64::from(event.x());
            sum_y += f64::from(event.y());
        }

        #[allow(clippy::cast_precision_loss)]
        let n = events.len() as f64;
        let centroid_x = sum_x / n + 0.5;
        let centroid_y = sum_y / n + 0.5;
        let timestamp = representative.timestamp();

        Some(Self {
            events,
            timestamp,
            centroid_x,
            centroid_y,
            x: centroid_x,
            y: centroid_y,
            energy,
        })
    }

    /// Wraps a single event as a one-member cluster.
    #[must_use]
    pub fn singleton(event: CalibratedEvent) -> Self {
        let centroid_x = f64::from(event.x()) + 0.5;
        let centroid_y = f64::from(event.y()) + 0.5;
        Self {
            timestamp: event.timestamp(),
            centroid_x,
            centroid_y,
            x: centroid_x,
            y: centroid_y,
            energy: event.energy,
            events: vec![event],
        }
    }

    /// Wraps an event that was not clustered.
    ///
    /// The centroid is the raw pixel coordinate, without the half-pixel
    /// offset applied to grouped clusters.
    #[must_use]
    pub fn unclustered(event: CalibratedEvent) -> Self {
        let centroid_x = f64::from(event.x());
        let centroid_y = f64::from(event.y());
        Self {
            timestamp: event.timestamp(),
            centroid_x,
            centroid_y,
            x: centroid_x,
            y: centroid_y,
            energy: event.energy,
            events: vec![event],
        }
    }

    /// Sets the detector-space position.
    #[inline]
    pub fn set_position(&mut self, x: f64, y: f64) {
        self.x = x;
        self.y = y;
    }

    /// Number of member events.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns true if the cluster has no members.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Euclidean distance between the pixel centroids of two clusters.
    #[must_use]
    pub fn centroid_distance(&self, other: &Self) -> f64 {
        (self.centroid_x - other.centroid_x).hypot(self.centroid_y - other.centroid_y)
    }

    /// Combines two clusters into one.
    ///
    /// Members are concatenated and energies summed. Timestamp, centroid and
    /// position come from the more energetic of the two; `self` wins ties.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        let stronger = if other.energy > self.energy {
            &other
        } else {
            &self
        };
        let timestamp = stronger.timestamp;
        let (centroid_x, centroid_y) = (stronger.centroid_x, stronger.centroid_y);
        let (x, y) = (stronger.x, stronger.y);
        let energy = self.energy + other.energy;

        let mut events = self.events;
        events.extend(other.events);

        Self {
            events,
            timestamp,
            centroid_x,
            centroid_y,
            x,
            y,
            energy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hit::RawEvent;
    use approx::assert_relative_eq;

    fn event(x: u16, y: u16, ts: u64, energy: f64) -> CalibratedEvent {
        CalibratedEvent::new(RawEvent::new(x, y, ts, 10), energy)
    }

    #[test]
    fn test_from_events_aggregates() {
        let cluster = Cluster::from_events(vec![
            event(10, 10, 100, 2.0),
            event(11, 10, 102, 5.0),
            event(11, 11, 101, 1.0),
        ])
        .unwrap();

        assert_eq!(cluster.len(), 3);
        assert_eq!(cluster.timestamp, 102);
        assert_relative_eq!(cluster.energy, 8.0);
        assert_relative_eq!(cluster.centroid_x, 32.0 / 3.0 + 0.5);
        assert_relative_eq!(cluster.centroid_y, 31.0 / 3.0 + 0.5);
        assert_relative_eq!(cluster.x, cluster.centroid_x);
    }

    #[test]
    fn test_timestamp_tie_keeps_first() {
        let cluster =
            Cluster::from_events(vec![event(0, 0, 50, 3.0), event(1, 0, 60, 3.0)]).unwrap();
        assert_eq!(cluster.timestamp, 50);
    }

    #[test]
    fn test_empty_cluster_is_none() {
        assert!(Cluster::from_events(Vec::new()).is_none());
    }

    #[test]
    fn test_singleton_matches_from_events() {
        let e = event(7, 9, 1234, 4.5);
        assert_eq!(Cluster::singleton(e), Cluster::from_events(vec![e]).unwrap());
    }

    #[test]
    fn test_unclustered_keeps_raw_pixel() {
        let cluster = Cluster::unclustered(event(4, 6, 77, 3.0));
        assert_eq!(cluster.len(), 1);
        assert_eq!(cluster.timestamp, 77);
        assert_relative_eq!(cluster.centroid_x, 4.0);
        assert_relative_eq!(cluster.centroid_y, 6.0);
        assert_relative_eq!(cluster.energy, 3.0);
    }

    #[test]
    fn test_merge_takes_attributes_from_stronger() {
        let weak = Cluster::singleton(event(10, 10, 100, 2.0));
        let strong = Cluster::singleton(event(12, 10, 105, 6.0));

        let merged = weak.merge(strong);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.timestamp, 105);
        assert_relative_eq!(merged.energy, 8.0);
        assert_relative_eq!(merged.centroid_x, 12.5);
    }

    #[test]
    fn test_centroid_distance() {
        let a = Cluster::singleton(event(0, 0, 0, 1.0));
        let b = Cluster::singleton(event(3, 4, 0, 1.0));
        assert_relative_eq!(a.centroid_distance(&b), 5.0);
    }
}

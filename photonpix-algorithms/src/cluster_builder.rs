//! Streaming spatio-temporal clustering.
//!
//! Key characteristics:
//! - Single ordered pass, one event at a time
//! - Slot pool with a free list for open clusters
//! - Dense 256x256 owner table for O(1) neighbour lookup
//! - FIFO expiry queue for closing clusters as time advances
//! - Clusters released in non-decreasing timestamp order

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, BinaryHeap, VecDeque};

use photonpix_core::hit::{CalibratedEvent, Hit, Timestamp, MATRIX_SIZE};
use photonpix_core::{Cluster, ClusteringSettings, Error, Operation, Result};
use photonpix_tpx::DetectorGeometry;

use crate::spatial::{PixelOwner, PixelOwnerMap, SlotId};

/// Number of events between cancellation checks.
pub const CANCEL_CHECK_INTERVAL: usize = 4096;

/// Counters collected while clustering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusteringStatistics {
    /// Events consumed from the input.
    pub events_processed: usize,
    /// Clusters handed to the consumer.
    pub clusters_emitted: usize,
    /// Times two or more open clusters were joined by a bridging event.
    pub merges: usize,
    /// Largest number of simultaneously open clusters.
    pub peak_open_clusters: usize,
}

/// Open cluster held in the slot pool.
#[derive(Debug, Default)]
struct Slot {
    events: Vec<CalibratedEvent>,
    first_time: Timestamp,
    last_time: Timestamp,
    generation: u32,
    active: bool,
}

/// Closed cluster waiting for release.
struct ReadyCluster {
    sequence: u64,
    cluster: Cluster,
}

impl ReadyCluster {
    fn key(&self) -> (Timestamp, u64) {
        (self.cluster.timestamp, self.sequence)
    }
}

impl PartialEq for ReadyCluster {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ReadyCluster {}

impl PartialOrd for ReadyCluster {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyCluster {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Lazy clustering of a time-ordered calibrated event stream.
///
/// A cluster stays open while its latest member is within the temporal
/// margin of the current event. An event joins every open cluster owning a
/// pixel in its 8-neighbourhood (the pixel itself included), merging them
/// when there are several, and opens a new cluster otherwise. A cluster is
/// closed once the stream has moved more than the margin past its latest
/// member.
///
/// Closed clusters are released in timestamp order, so none is released
/// before every cluster that opened earlier has closed. A cluster kept open
/// by a continuously firing pixel holds back all output behind it; the
/// number of clusters waiting is reported by [`ClusterBuilder::held_clusters`].
///
/// The input must be ordered by non-decreasing timestamp. Out-of-order input
/// is not detected and produces undefined groupings.
pub struct ClusterBuilder<I, O> {
    events: I,
    operation: O,
    temporal_margin: f64,
    passthrough: bool,
    geometry: DetectorGeometry,

    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    owners: PixelOwnerMap,
    expiry: VecDeque<(SlotId, Timestamp)>,
    open_first_times: BTreeSet<(Timestamp, u32)>,
    ready: BinaryHeap<Reverse<ReadyCluster>>,

    neighbor_scratch: Vec<PixelOwner>,
    slot_scratch: Vec<SlotId>,
    current_time: Timestamp,
    next_sequence: u64,
    open_count: usize,
    finished: bool,
    stats: ClusteringStatistics,
}

impl<I, O> ClusterBuilder<I, O>
where
    I: Iterator<Item = Result<CalibratedEvent>>,
    O: Operation,
{
    /// Creates a builder over `events`.
    ///
    /// Cluster positions are mapped through `geometry`. `operation` is
    /// polled for cancellation every [`CANCEL_CHECK_INTERVAL`] events.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if `settings` fail validation.
    pub fn new(
        events: I,
        settings: &ClusteringSettings,
        geometry: DetectorGeometry,
        operation: O,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            events,
            operation,
            temporal_margin: settings.temporal_margin,
            passthrough: settings.passthrough,
            geometry,
            slots: Vec::new(),
            free_slots: Vec::new(),
            owners: PixelOwnerMap::new(),
            expiry: VecDeque::new(),
            open_first_times: BTreeSet::new(),
            ready: BinaryHeap::new(),
            neighbor_scratch: Vec::with_capacity(9),
            slot_scratch: Vec::with_capacity(9),
            current_time: 0,
            next_sequence: 0,
            open_count: 0,
            finished: false,
            stats: ClusteringStatistics::default(),
        })
    }

    /// Counters collected so far.
    #[must_use]
    pub fn statistics(&self) -> ClusteringStatistics {
        self.stats
    }

    /// Number of currently open clusters.
    #[must_use]
    pub fn open_clusters(&self) -> usize {
        self.open_count
    }

    /// Number of closed clusters waiting for earlier open clusters to close.
    #[must_use]
    pub fn held_clusters(&self) -> usize {
        self.ready.len()
    }

    fn process(&mut self, event: CalibratedEvent) -> Result<()> {
        let pixel = event.coord();
        if pixel.x >= MATRIX_SIZE || pixel.y >= MATRIX_SIZE {
            return Err(Error::InvalidCoordinate {
                x: pixel.x,
                y: pixel.y,
            });
        }

        let time = event.timestamp();
        self.current_time = time;

        if self.passthrough {
            let mut cluster = Cluster::unclustered(event);
            let (x, y) = self
                .geometry
                .transform_point(f64::from(pixel.x), f64::from(pixel.y));
            cluster.set_position(x, y);
            self.queue(cluster);
            return Ok(());
        }

        self.expire(time);

        // Distinct open clusters owning a neighbouring pixel. A cluster is
        // open while its latest member, wherever it lies, is within the margin.
        self.owners
            .query_neighborhood(pixel, &mut self.neighbor_scratch);
        self.slot_scratch.clear();
        for owner in &self.neighbor_scratch {
            if self.is_open_at(owner.slot, time) && !self.slot_scratch.contains(&owner.slot) {
                self.slot_scratch.push(owner.slot);
            }
        }

        let target = match self.slot_scratch.len() {
            0 => self.open_slot(time),
            1 => self.slot_scratch[0],
            _ => self.merge_slots(),
        };

        let slot = &mut self.slots[target.index as usize];
        slot.events.push(event);
        slot.last_time = time;
        self.owners.insert(pixel, target, time);
        self.expiry.push_back((target, time));
        Ok(())
    }

    fn is_live(&self, id: SlotId) -> bool {
        self.slots
            .get(id.index as usize)
            .is_some_and(|slot| slot.active && slot.generation == id.generation)
    }

    /// True if `id` is live and its latest member is within the margin of `time`.
    fn is_open_at(&self, id: SlotId, time: Timestamp) -> bool {
        self.is_live(id) && {
            #[allow(clippy::cast_precision_loss)]
            let gap = time.saturating_sub(self.slots[id.index as usize].last_time) as f64;
            gap <= self.temporal_margin
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn open_slot(&mut self, time: Timestamp) -> SlotId {
        let index = self.free_slots.pop().unwrap_or_else(|| {
            self.slots.push(Slot::default());
            (self.slots.len() - 1) as u32
        });
        let slot = &mut self.slots[index as usize];
        slot.active = true;
        slot.first_time = time;
        slot.last_time = time;
        slot.events.clear();

        self.open_first_times.insert((time, index));
        self.open_count += 1;
        self.stats.peak_open_clusters = self.stats.peak_open_clusters.max(self.open_count);

        SlotId {
            index,
            generation: slot.generation,
        }
    }

    /// Joins every slot in `slot_scratch` into the largest one.
    fn merge_slots(&mut self) -> SlotId {
        let mut ids = std::mem::take(&mut self.slot_scratch);
        ids.sort_by_key(|id| Reverse(self.slots[id.index as usize].events.len()));
        let target = ids[0];

        for &other in &ids[1..] {
            let other_slot = &mut self.slots[other.index as usize];
            let events = std::mem::take(&mut other_slot.events);
            let (first, last) = (other_slot.first_time, other_slot.last_time);
            self.release_slot(other, first);

            for event in &events {
                self.owners.reassign(event.coord(), other, target);
            }

            let target_slot = &mut self.slots[target.index as usize];
            target_slot.events.extend(events);
            target_slot.last_time = target_slot.last_time.max(last);
            if first < target_slot.first_time {
                self.open_first_times
                    .remove(&(target_slot.first_time, target.index));
                self.open_first_times.insert((first, target.index));
                target_slot.first_time = first;
            }
        }

        self.stats.merges += 1;
        self.slot_scratch = ids;
        target
    }

    fn release_slot(&mut self, id: SlotId, first_time: Timestamp) {
        let slot = &mut self.slots[id.index as usize];
        slot.active = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.open_first_times.remove(&(first_time, id.index));
        self.free_slots.push(id.index);
        self.open_count -= 1;
    }

    /// Closes clusters whose latest member is more than the margin behind `time`.
    fn expire(&mut self, time: Timestamp) {
        while let Some(&(id, last)) = self.expiry.front() {
            #[allow(clippy::cast_precision_loss)]
            let gap = time.saturating_sub(last) as f64;
            if gap <= self.temporal_margin {
                break;
            }
            self.expiry.pop_front();
            if self.is_live(id) && self.slots[id.index as usize].last_time == last {
                self.close(id);
            }
        }
    }

    fn close(&mut self, id: SlotId) {
        let slot = &mut self.slots[id.index as usize];
        let events = std::mem::take(&mut slot.events);
        let first = slot.first_time;
        self.release_slot(id, first);

        for event in &events {
            self.owners.remove(event.coord(), id);
        }
        self.push_ready(events);
    }

    #[allow(clippy::cast_possible_truncation)]
    fn close_all(&mut self) {
        let open: Vec<SlotId> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.active)
            .map(|(index, slot)| SlotId {
                index: index as u32,
                generation: slot.generation,
            })
            .collect();
        for id in open {
            self.close(id);
        }
        self.expiry.clear();
    }

    /// Builds the cluster for closed members and queues it for release.
    fn push_ready(&mut self, mut events: Vec<CalibratedEvent>) {
        events.sort_by_key(Hit::timestamp);
        let Some(mut cluster) = Cluster::from_events(events) else {
            return;
        };
        let (x, y) = self
            .geometry
            .transform_point(cluster.centroid_x, cluster.centroid_y);
        cluster.set_position(x, y);
        self.queue(cluster);
    }

    fn queue(&mut self, cluster: Cluster) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.ready.push(Reverse(ReadyCluster { sequence, cluster }));
    }

    /// Earliest timestamp any cluster not yet closed could still carry.
    fn watermark(&self) -> Timestamp {
        self.open_first_times
            .first()
            .map_or(self.current_time, |&(first, _)| first.min(self.current_time))
    }

    fn pop_ready(&mut self) -> Option<Cluster> {
        let limit = if self.finished {
            Timestamp::MAX
        } else {
            self.watermark()
        };
        if self.ready.peek()?.0.cluster.timestamp <= limit {
            let Reverse(ready) = self.ready.pop()?;
            self.stats.clusters_emitted += 1;
            Some(ready.cluster)
        } else {
            None
        }
    }

    fn abort(&mut self) {
        self.finished = true;
        self.ready.clear();
        self.expiry.clear();
        self.owners.clear();
        self.open_first_times.clear();
    }
}

impl<I, O> Iterator for ClusterBuilder<I, O>
where
    I: Iterator<Item = Result<CalibratedEvent>>,
    O: Operation,
{
    type Item = Result<Cluster>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(cluster) = self.pop_ready() {
                return Some(Ok(cluster));
            }
            if self.finished {
                return None;
            }

            match self.events.next() {
                Some(Ok(event)) => {
                    if let Err(err) = self.process(event) {
                        self.abort();
                        return Some(Err(err));
                    }
                    self.stats.events_processed += 1;
                    if self.stats.events_processed % CANCEL_CHECK_INTERVAL == 0 {
                        if let Err(err) = self.operation.check_cancelled() {
                            self.abort();
                            return Some(Err(err));
                        }
                    }
                }
                Some(Err(err)) => {
                    self.abort();
                    return Some(Err(err));
                }
                None => {
                    self.close_all();
                    self.finished = true;
                    log::debug!(
                        "Clustering finished: {} events, {} merges, peak {} open clusters",
                        self.stats.events_processed,
                        self.stats.merges,
                        self.stats.peak_open_clusters
                    );
                }
            }
        }
    }
}

/// Convenience constructor for builders that never get cancelled.
///
/// # Errors
/// Returns [`Error::InvalidConfig`] if `settings` fail validation.
pub fn cluster_events<I>(
    events: I,
    settings: &ClusteringSettings,
) -> Result<ClusterBuilder<I::IntoIter, photonpix_core::NoopOperation>>
where
    I: IntoIterator<Item = Result<CalibratedEvent>>,
{
    ClusterBuilder::new(
        events.into_iter(),
        settings,
        DetectorGeometry::identity(),
        photonpix_core::NoopOperation,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use photonpix_core::hit::RawEvent;
    use photonpix_core::{NoopOperation, OperationHandle};

    fn ev(x: u16, y: u16, ts: u64, energy: f64) -> Result<CalibratedEvent> {
        Ok(CalibratedEvent::new(RawEvent::new(x, y, ts, 10), energy))
    }

    fn run(events: Vec<Result<CalibratedEvent>>, margin: f64) -> Vec<Cluster> {
        let settings = ClusteringSettings::new().with_temporal_margin(margin);
        cluster_events(events, &settings)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_two_separate_clusters() {
        let clusters = run(
            vec![
                ev(10, 10, 100, 1.0),
                ev(11, 11, 102, 2.0),
                ev(50, 50, 200, 3.0),
                ev(51, 51, 202, 4.0),
            ],
            10.0,
        );
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].len(), 2);
        assert_eq!(clusters[0].timestamp, 102);
        assert_relative_eq!(clusters[0].energy, 3.0);
        assert_eq!(clusters[1].timestamp, 202);
    }

    #[test]
    fn test_temporal_gap_splits_same_pixel() {
        let clusters = run(vec![ev(5, 5, 0, 1.0), ev(5, 5, 11, 1.0)], 10.0);
        assert_eq!(clusters.len(), 2);

        let clusters = run(vec![ev(5, 5, 0, 1.0), ev(5, 5, 10, 1.0)], 10.0);
        assert_eq!(clusters.len(), 1);
    }

    #[test]
    fn test_bridging_event_merges_clusters() {
        // Two open clusters two pixels apart, joined by an event between them.
        let clusters = run(
            vec![
                ev(10, 10, 0, 1.0),
                ev(12, 10, 1, 1.0),
                ev(13, 10, 2, 1.0),
                ev(11, 10, 3, 5.0),
            ],
            10.0,
        );
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 4);
        assert_eq!(clusters[0].timestamp, 3);
        let times: Vec<u64> = clusters[0].events.iter().map(Hit::timestamp).collect();
        assert_eq!(times, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_diagonal_neighbors_connect() {
        let clusters = run(vec![ev(0, 0, 0, 1.0), ev(1, 1, 1, 1.0), ev(3, 3, 2, 1.0)], 10.0);
        assert_eq!(clusters.len(), 2);
    }

    #[test]
    fn test_emission_is_time_ordered() {
        // A long-lived cluster keeps growing while short ones close around it.
        let mut events = Vec::new();
        for i in 0..20u64 {
            events.push(ev(100, 100, i * 5, 1.0));
            events.push(ev(10 + (i as u16) * 3, 200, i * 5 + 1, 2.0));
        }
        let clusters = run(events, 6.0);
        assert!(clusters.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(clusters.iter().map(Cluster::len).sum::<usize>(), 40);
        assert_eq!(clusters.len(), 21);
    }

    #[test]
    fn test_passthrough_is_identity() {
        let settings = ClusteringSettings::new().with_passthrough(true);
        let input = vec![ev(1, 1, 0, 1.0), ev(1, 2, 0, 2.0), ev(1, 1, 3, 3.0)];
        let clusters: Vec<Cluster> = cluster_events(input, &settings)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(clusters.len(), 3);
        for (cluster, (x, y, ts)) in clusters.iter().zip([(1, 1, 0), (1, 2, 0), (1, 1, 3)]) {
            assert_eq!(cluster.len(), 1);
            assert_eq!(cluster.timestamp, ts);
            assert_relative_eq!(cluster.centroid_x, f64::from(x));
            assert_relative_eq!(cluster.centroid_y, f64::from(y));
            assert_relative_eq!(cluster.x, f64::from(x));
            assert_relative_eq!(cluster.y, f64::from(y));
        }
    }

    #[test]
    fn test_passthrough_maps_raw_pixel() {
        let geometry = DetectorGeometry::new(0.0, [100.0, 0.0], [2.0, 2.0]);
        let settings = ClusteringSettings::new().with_passthrough(true);
        let clusters: Vec<Cluster> =
            ClusterBuilder::new(vec![ev(4, 6, 0, 1.0)].into_iter(), &settings, geometry, NoopOperation)
                .unwrap()
                .collect::<Result<_>>()
                .unwrap();
        assert_relative_eq!(clusters[0].x, 100.0 + 2.0 * 4.0);
        assert_relative_eq!(clusters[0].y, 2.0 * 6.0);
    }

    #[test]
    fn test_join_uses_latest_member_of_cluster() {
        // (0,1) touches only members older than the margin, but the cluster's
        // latest member at t=16 keeps it open.
        let clusters = run(
            vec![
                ev(0, 0, 0, 1.0),
                ev(1, 0, 8, 1.0),
                ev(2, 0, 16, 1.0),
                ev(0, 1, 20, 1.0),
            ],
            10.0,
        );
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 4);
    }

    #[test]
    fn test_long_lived_cluster_holds_back_output() {
        let mut events = Vec::new();
        for i in 0..20u64 {
            events.push(ev(100, 100, i * 5, 1.0));
        }
        for (i, ts) in [1u64, 21, 41].into_iter().enumerate() {
            events.push(ev(10 + 3 * i as u16, 10, ts, 2.0));
        }
        events.sort_by_key(|e| e.as_ref().map(Hit::timestamp).unwrap_or_default());

        let settings = ClusteringSettings::new().with_temporal_margin(10.0);
        let mut builder = cluster_events(events, &settings).unwrap();
        let first = builder.next().unwrap().unwrap();
        assert_eq!(first.len(), 20);
        assert_eq!(first.timestamp, 0);
        assert_eq!(builder.statistics().events_processed, 23);
        assert_eq!(builder.held_clusters(), 3);

        let rest: Vec<u64> = builder.map(|c| c.unwrap().timestamp).collect();
        assert_eq!(rest, vec![1, 21, 41]);
    }

    #[test]
    fn test_geometry_applied_to_position() {
        let geometry = DetectorGeometry::new(0.0, [100.0, 0.0], [2.0, 2.0]);
        let settings = ClusteringSettings::new();
        let clusters: Vec<Cluster> =
            ClusterBuilder::new(vec![ev(4, 6, 0, 1.0)].into_iter(), &settings, geometry, NoopOperation)
                .unwrap()
                .collect::<Result<_>>()
                .unwrap();
        assert_relative_eq!(clusters[0].x, 100.0 + 2.0 * 4.5);
        assert_relative_eq!(clusters[0].y, 2.0 * 6.5);
    }

    #[test]
    fn test_invalid_coordinate_aborts() {
        let settings = ClusteringSettings::new();
        let mut builder = cluster_events(vec![ev(300, 0, 0, 1.0), ev(0, 0, 1, 1.0)], &settings).unwrap();
        assert!(matches!(
            builder.next(),
            Some(Err(Error::InvalidCoordinate { x: 300, y: 0 }))
        ));
        assert!(builder.next().is_none());
    }

    #[test]
    fn test_cancellation_aborts() {
        let handle = OperationHandle::new();
        handle.cancel();
        let events: Vec<_> = (0..CANCEL_CHECK_INTERVAL as u64)
            .map(|i| ev(0, 0, i * 100, 1.0))
            .collect();
        let builder = ClusterBuilder::new(
            events.into_iter(),
            &ClusteringSettings::new(),
            DetectorGeometry::identity(),
            handle,
        )
        .unwrap();
        let result: Result<Vec<Cluster>> = builder.collect();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn test_statistics() {
        let settings = ClusteringSettings::new().with_temporal_margin(10.0);
        let mut builder = cluster_events(
            vec![ev(10, 10, 0, 1.0), ev(12, 10, 1, 1.0), ev(11, 10, 2, 1.0)],
            &settings,
        )
        .unwrap();
        let clusters: Vec<Cluster> = builder.by_ref().collect::<Result<_>>().unwrap();
        assert_eq!(clusters.len(), 1);
        let stats = builder.statistics();
        assert_eq!(stats.events_processed, 3);
        assert_eq!(stats.clusters_emitted, 1);
        assert_eq!(stats.merges, 1);
        assert_eq!(stats.peak_open_clusters, 2);
        assert_eq!(builder.open_clusters(), 0);
    }
}

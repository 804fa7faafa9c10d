//! Fluorescence-escape (XRF) correction.
//!
//! A photon absorbed in the sensor can emit a fluorescence photon that is
//! reabsorbed nearby, splitting one interaction into two clusters. This
//! stage re-joins such pairs on a time-ordered cluster stream.

use std::collections::VecDeque;

use photonpix_core::{Cluster, Result, XrfSettings};

/// Counters collected by the corrector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XrfStatistics {
    /// Clusters read from the input.
    pub clusters_in: usize,
    /// Clusters emitted.
    pub clusters_out: usize,
    /// Pairs merged.
    pub merges: usize,
}

struct Pending {
    cluster: Cluster,
    /// Already merged; not eligible for another merge.
    done: bool,
}

/// Iterator adapter merging XRF partner clusters.
///
/// The earliest pending cluster is resolved once the input has moved more
/// than the XRF margin past it. If its energy is in range, the partner is
/// the later pending cluster (also in range, not yet merged) within the
/// time and distance limits with the smallest time difference, then the
/// smallest centroid distance, then the earliest arrival. Output stays in
/// non-decreasing timestamp order.
pub struct XrfCorrector<I> {
    clusters: I,
    settings: XrfSettings,
    pending: VecDeque<Pending>,
    latest_time: u64,
    input_done: bool,
    failed: bool,
    stats: XrfStatistics,
}

impl<I> XrfCorrector<I>
where
    I: Iterator<Item = Result<Cluster>>,
{
    /// Wraps a time-ordered cluster stream.
    ///
    /// # Errors
    /// Returns [`photonpix_core::Error::InvalidConfig`] if `settings` fail
    /// validation.
    pub fn new(clusters: I, settings: XrfSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            clusters,
            settings,
            pending: VecDeque::new(),
            latest_time: 0,
            input_done: false,
            failed: false,
            stats: XrfStatistics::default(),
        })
    }

    /// Counters collected so far.
    #[must_use]
    pub fn statistics(&self) -> XrfStatistics {
        self.stats
    }

    /// True once no future input can partner the front cluster.
    fn front_is_settled(&self) -> bool {
        let Some(front) = self.pending.front() else {
            return false;
        };
        if self.input_done || front.done || !self.settings.accepts_energy(front.cluster.energy) {
            return true;
        }
        #[allow(clippy::cast_precision_loss)]
        let ahead = self.latest_time.saturating_sub(front.cluster.timestamp) as f64;
        ahead > self.settings.temporal_margin
    }

    fn find_partner(&self) -> Option<usize> {
        let front = &self.pending.front()?.cluster;
        let mut best: Option<(u64, f64, usize)> = None;

        for (index, candidate) in self.pending.iter().enumerate().skip(1) {
            if candidate.done || !self.settings.accepts_energy(candidate.cluster.energy) {
                continue;
            }
            let dt = candidate.cluster.timestamp.saturating_sub(front.timestamp);
            #[allow(clippy::cast_precision_loss)]
            let dt_ticks = dt as f64;
            if dt_ticks > self.settings.temporal_margin {
                break;
            }
            let distance = front.centroid_distance(&candidate.cluster);
            if distance > self.settings.distance_limit {
                continue;
            }
            let better = match best {
                None => true,
                Some((best_dt, best_distance, _)) => {
                    dt < best_dt || (dt == best_dt && distance < best_distance)
                }
            };
            if better {
                best = Some((dt, distance, index));
            }
        }
        best.map(|(_, _, index)| index)
    }

    /// Inserts a merged cluster keeping `pending` sorted by timestamp.
    fn insert_sorted(&mut self, cluster: Cluster) {
        let position = self
            .pending
            .iter()
            .position(|p| p.cluster.timestamp > cluster.timestamp)
            .unwrap_or(self.pending.len());
        self.pending.insert(
            position,
            Pending {
                cluster,
                done: true,
            },
        );
    }

    /// Resolves the front cluster; returns it if it can be emitted now.
    fn resolve_front(&mut self) -> Option<Cluster> {
        let front = self.pending.front()?;
        if front.done || !self.settings.accepts_energy(front.cluster.energy) {
            return self.pending.pop_front().map(|p| p.cluster);
        }

        match self.find_partner() {
            Some(index) => {
                let partner = self.pending.remove(index)?.cluster;
                let first = self.pending.pop_front()?.cluster;
                self.stats.merges += 1;
                self.insert_sorted(first.merge(partner));
                None
            }
            None => self.pending.pop_front().map(|p| p.cluster),
        }
    }
}

impl<I> Iterator for XrfCorrector<I>
where
    I: Iterator<Item = Result<Cluster>>,
{
    type Item = Result<Cluster>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            while self.front_is_settled() {
                if let Some(cluster) = self.resolve_front() {
                    self.stats.clusters_out += 1;
                    return Some(Ok(cluster));
                }
            }
            if self.input_done {
                return None;
            }

            match self.clusters.next() {
                Some(Ok(cluster)) => {
                    self.stats.clusters_in += 1;
                    self.latest_time = self.latest_time.max(cluster.timestamp);
                    self.pending.push_back(Pending {
                        cluster,
                        done: false,
                    });
                }
                Some(Err(err)) => {
                    self.failed = true;
                    self.pending.clear();
                    return Some(Err(err));
                }
                None => {
                    self.input_done = true;
                    log::debug!(
                        "XRF correction merged {} pairs out of {} clusters",
                        self.stats.merges,
                        self.stats.clusters_in
                    );
                }
            }
        }
    }
}

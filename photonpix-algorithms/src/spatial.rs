//! Dense per-pixel ownership index for open clusters.

use photonpix_core::hit::{PixelCoord, Timestamp, PIXEL_COUNT};

/// Handle to a slot in the open-cluster pool.
///
/// The generation distinguishes successive clusters reusing the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    /// Index into the slot pool.
    pub index: u32,
    /// Generation of the slot when the handle was issued.
    pub generation: u32,
}

/// Owner of a pixel: the open cluster holding its latest event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelOwner {
    /// Owning cluster.
    pub slot: SlotId,
    /// Timestamp of the latest event at this pixel.
    pub timestamp: Timestamp,
}

/// Maps every pixel of the 256x256 matrix to the open cluster owning it.
#[derive(Debug, Clone)]
pub struct PixelOwnerMap {
    cells: Vec<Option<PixelOwner>>,
}

impl Default for PixelOwnerMap {
    fn default() -> Self {
        Self::new()
    }
}

impl PixelOwnerMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cells: vec![None; PIXEL_COUNT],
        }
    }

    /// Clear all owners.
    pub fn clear(&mut self) {
        self.cells.fill(None);
    }

    /// Current owner of a pixel.
    #[inline]
    #[must_use]
    pub fn get(&self, pixel: PixelCoord) -> Option<PixelOwner> {
        self.cells[pixel.index()]
    }

    /// Records `slot` as owner of `pixel` with the given event time.
    #[inline]
    pub fn insert(&mut self, pixel: PixelCoord, slot: SlotId, timestamp: Timestamp) {
        self.cells[pixel.index()] = Some(PixelOwner { slot, timestamp });
    }

    /// Removes the owner of `pixel` if it is `slot`.
    #[inline]
    pub fn remove(&mut self, pixel: PixelCoord, slot: SlotId) {
        let cell = &mut self.cells[pixel.index()];
        if cell.is_some_and(|owner| owner.slot == slot) {
            *cell = None;
        }
    }

    /// Transfers ownership of `pixel` from `from` to `to`, keeping its time.
    #[inline]
    pub fn reassign(&mut self, pixel: PixelCoord, from: SlotId, to: SlotId) {
        if let Some(owner) = self.cells[pixel.index()].as_mut() {
            if owner.slot == from {
                owner.slot = to;
            }
        }
    }

    /// Collects the owners in the 3x3 neighbourhood of `pixel` (the pixel
    /// itself included) into `out`.
    pub fn query_neighborhood(&self, pixel: PixelCoord, out: &mut Vec<PixelOwner>) {
        out.clear();
        out.extend(pixel.neighborhood().filter_map(|p| self.cells[p.index()]));
    }
}

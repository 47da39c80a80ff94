//! The render/update collaborator invoked for `UpdateRegion` requests.

use shmq_wire::SegmentId;

/// A bounds-checked update ready for the consumer.
#[derive(Debug, Clone, Copy)]
pub struct RegionUpdate<'a> {
    /// Opaque id of the object to update.
    pub target_id: u32,
    /// Sub-level index within the target.
    pub level: u32,
    pub segment_id: SegmentId,
    /// Offset of `bytes` within the segment.
    pub offset: u64,
    /// Exactly the requested `[offset, offset + count)` window. The client may
    /// still be writing to it.
    pub bytes: &'a [u8],
}

/// Consumer of validated region updates.
///
/// Only called after the segment lookup and bounds check succeeded. Returning
/// `false` makes the host reply `false` to the client.
pub trait UpdateHook: Send + Sync {
    fn apply_update(&self, update: RegionUpdate<'_>) -> bool;
}

impl<F> UpdateHook for F
where
    F: Fn(RegionUpdate<'_>) -> bool + Send + Sync,
{
    fn apply_update(&self, update: RegionUpdate<'_>) -> bool {
        self(update)
    }
}

/// Hook for hosts without an update consumer: every update fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectAllUpdates;

impl UpdateHook for RejectAllUpdates {
    fn apply_update(&self, update: RegionUpdate<'_>) -> bool {
        tracing::debug!(
            target_id = update.target_id,
            segment = %update.segment_id,
            "no update consumer installed"
        );
        false
    }
}

//! Shared-memory segment registry.
//!
//! Maps [`SegmentId`]s to live segments. Every segment is mapped into the host
//! once, when it enters the table, so that `UpdateRegion` validation only has
//! to do arithmetic against an immutable size.
//!
//! The table is a single map behind a mutex. The lock is held only for the map
//! operation itself: creating, validating and mapping shared memory happens
//! before the lock is taken, and removed entries are dropped (unmapped,
//! closed) after it is released.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use parking_lot::Mutex;
use shm_primitives::{MmapRegion, ShmObject};
use shmq_wire::SegmentId;

use crate::config::{DEFAULT_MAX_SEGMENT_SIZE, DEFAULT_MAX_SEGMENTS};
use crate::connection::ConnectionId;
use crate::error::RegistryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryLimits {
    /// Largest accepted segment, in bytes.
    pub max_segment_size: u64,
    /// Largest number of live segments.
    pub max_segments: usize,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            max_segments: DEFAULT_MAX_SEGMENTS,
        }
    }
}

/// Where a segment's memory came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentOrigin {
    /// Created by the host in answer to `AllocateSharedMemory`.
    HostAllocated,
    /// Supplied by the client with `RegisterSharedMemory`.
    ClientRegistered,
}

/// An immutable snapshot of one registered segment.
///
/// Snapshots stay valid after the segment is released; the memory is unmapped
/// when the last one is dropped.
#[derive(Debug)]
pub struct SegmentEntry {
    id: SegmentId,
    owner: ConnectionId,
    origin: SegmentOrigin,
    size: u64,
    // Declared before `object` so the mapping goes away first.
    mapping: MmapRegion,
    object: ShmObject,
}

impl SegmentEntry {
    #[inline]
    pub fn id(&self) -> SegmentId {
        self.id
    }

    #[inline]
    pub fn owner(&self) -> ConnectionId {
        self.owner
    }

    #[inline]
    pub fn origin(&self) -> SegmentOrigin {
        self.origin
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The `[offset, offset + count)` window, or `None` if any part of it is
    /// outside the segment (overflow included).
    ///
    /// The client can write to this memory at any time; treat it as input.
    pub fn bytes(&self, offset: u64, count: u64) -> Option<&[u8]> {
        let end = offset.checked_add(count)?;
        if end > self.size {
            return None;
        }
        self.mapping
            .bytes(usize::try_from(offset).ok()?, usize::try_from(count).ok()?)
    }

    /// Host-side handle of the segment.
    pub fn object(&self) -> &ShmObject {
        &self.object
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    segments: HashMap<SegmentId, Arc<SegmentEntry>>,
    next_id: u32,
    exhausted: bool,
}

/// Thread-safe table of live segments.
#[derive(Debug, Default)]
pub struct SegmentRegistry {
    limits: RegistryLimits,
    state: Mutex<RegistryState>,
}

impl SegmentRegistry {
    pub fn new(limits: RegistryLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(RegistryState::default()),
        }
    }

    pub fn limits(&self) -> RegistryLimits {
        self.limits
    }

    /// Create a fresh segment of exactly `size` bytes owned by `owner`.
    ///
    /// Returns the new id and a duplicate of the segment's handle for the
    /// client; the host keeps its own handle and mapping.
    pub fn allocate(
        &self,
        size: u64,
        owner: ConnectionId,
    ) -> Result<(SegmentId, OwnedFd), RegistryError> {
        self.check_size(size)?;
        self.check_capacity()?;

        let object = ShmObject::create(size)
            .map_err(|e| RegistryError::OutOfResources(format!("create {size} bytes: {e}")))?;
        let mapping = object
            .map()
            .map_err(|e| RegistryError::OutOfResources(format!("map {size} bytes: {e}")))?;
        let client_fd = object
            .try_clone_fd()
            .map_err(|e| RegistryError::OutOfResources(format!("duplicate handle: {e}")))?;

        let id = self.insert(owner, SegmentOrigin::HostAllocated, size, mapping, object)?;
        tracing::debug!(segment = %id, size, owner = %owner, "allocated segment");
        Ok((id, client_fd))
    }

    /// Adopt a client-supplied handle claimed to be `size` bytes.
    pub fn register_external(
        &self,
        handle: OwnedFd,
        size: u64,
        owner: ConnectionId,
    ) -> Result<SegmentId, RegistryError> {
        self.check_size(size)?;
        self.check_capacity()?;

        let object = ShmObject::from_fd(handle, size)
            .map_err(|e| RegistryError::InvalidHandle(e.to_string()))?;
        let mapping = object
            .map()
            .map_err(|e| RegistryError::OutOfResources(format!("map {size} bytes: {e}")))?;

        let id = self.insert(owner, SegmentOrigin::ClientRegistered, size, mapping, object)?;
        tracing::debug!(segment = %id, size, owner = %owner, "registered external segment");
        Ok(id)
    }

    pub fn lookup(&self, id: SegmentId) -> Option<Arc<SegmentEntry>> {
        self.state.lock().segments.get(&id).cloned()
    }

    /// Like [`lookup`](Self::lookup), but only if `owner` owns the segment.
    pub fn lookup_owned(&self, id: SegmentId, owner: ConnectionId) -> Option<Arc<SegmentEntry>> {
        self.lookup(id).filter(|entry| entry.owner == owner)
    }

    /// Remove a segment. Returns `false` if `id` is not live.
    pub fn release(&self, id: SegmentId) -> bool {
        let removed = self.state.lock().segments.remove(&id);
        if removed.is_some() {
            tracing::debug!(segment = %id, "released segment");
        }
        removed.is_some()
    }

    /// Remove a segment only if `owner` owns it. A segment owned by someone
    /// else is reported exactly like an unknown one.
    pub fn release_owned(&self, id: SegmentId, owner: ConnectionId) -> bool {
        let removed = {
            let mut state = self.state.lock();
            match state.segments.get(&id) {
                Some(entry) if entry.owner == owner => state.segments.remove(&id),
                _ => None,
            }
        };
        if removed.is_some() {
            tracing::debug!(segment = %id, owner = %owner, "released segment");
        }
        removed.is_some()
    }

    /// Remove every segment owned by `owner`. Returns how many were removed.
    pub fn release_owned_by(&self, owner: ConnectionId) -> usize {
        let removed: Vec<Arc<SegmentEntry>> = {
            let mut state = self.state.lock();
            let ids: Vec<SegmentId> = state
                .segments
                .values()
                .filter(|entry| entry.owner == owner)
                .map(|entry| entry.id)
                .collect();
            ids.iter()
                .filter_map(|id| state.segments.remove(id))
                .collect()
        };
        if !removed.is_empty() {
            tracing::debug!(owner = %owner, count = removed.len(), "released owned segments");
        }
        removed.len()
    }

    /// Ids owned by `owner`, ascending.
    pub fn owned_by(&self, owner: ConnectionId) -> Vec<SegmentId> {
        let mut ids: Vec<SegmentId> = self
            .state
            .lock()
            .segments
            .values()
            .filter(|entry| entry.owner == owner)
            .map(|entry| entry.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.state.lock().segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_size(&self, size: u64) -> Result<(), RegistryError> {
        if size == 0 || size > self.limits.max_segment_size {
            return Err(RegistryError::InvalidSize(size));
        }
        Ok(())
    }

    /// Early rejection before any OS work; `insert` re-checks under the lock.
    fn check_capacity(&self) -> Result<(), RegistryError> {
        if self.len() >= self.limits.max_segments {
            return Err(full(self.limits.max_segments));
        }
        Ok(())
    }

    fn insert(
        &self,
        owner: ConnectionId,
        origin: SegmentOrigin,
        size: u64,
        mapping: MmapRegion,
        object: ShmObject,
    ) -> Result<SegmentId, RegistryError> {
        let mut state = self.state.lock();
        if state.segments.len() >= self.limits.max_segments {
            drop(state);
            return Err(full(self.limits.max_segments));
        }
        if state.exhausted {
            drop(state);
            return Err(RegistryError::OutOfResources("segment ids exhausted".into()));
        }

        let id = SegmentId(state.next_id);
        match state.next_id.checked_add(1) {
            Some(next) => state.next_id = next,
            None => state.exhausted = true,
        }

        let entry = Arc::new(SegmentEntry {
            id,
            owner,
            origin,
            size,
            mapping,
            object,
        });
        state.segments.insert(id, entry);
        Ok(id)
    }
}

fn full(max: usize) -> RegistryError {
    RegistryError::OutOfResources(format!("segment table full ({max} segments)"))
}

//! OS collaborators for the shmq message queue.
//!
//! - [`ShmObject`]: an fd-backed shared-memory object of a fixed size
//! - [`MmapRegion`]: a `MAP_SHARED` mapping of such an object
//! - [`Region`]: a borrowed, offset-addressed view of mapped memory
//! - [`fdpass`]: datagram send/receive with `SCM_RIGHTS` handle transfer
//!
//! Unix only.

#![cfg(unix)]

pub mod fdpass;
pub mod mmap;
pub mod region;
pub mod shm;

pub use fdpass::{ChannelKind, Received};
pub use mmap::MmapRegion;
pub use region::Region;
pub use shm::ShmObject;

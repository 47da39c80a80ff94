//! Cross-process message queue for shared memory.
//!
//! A trusted host process runs a [`MessageQueue`]; untrusted clients connect
//! with a [`Client`] through the queue's rendezvous address and then ask the
//! host to allocate, register and unregister shared-memory segments, and to
//! consume byte windows of those segments through an [`UpdateHook`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use shmq::{Client, ClientConfig, MessageQueue, QueueConfig, RegionUpdate, SegmentRegistry};
//!
//! let config = QueueConfig::default();
//! let registry = Arc::new(SegmentRegistry::new(config.registry_limits()));
//! let queue = MessageQueue::new(
//!     config,
//!     registry,
//!     Arc::new(|update: RegionUpdate<'_>| !update.bytes.is_empty()),
//! )?;
//! let address = queue.get_rendezvous_address().to_path_buf();
//!
//! let worker = std::thread::spawn(move || -> Result<bool, shmq::ClientError> {
//!     let mut client = Client::connect(&address, ClientConfig::default())?;
//!     let mut segment = client.allocate_shared_memory(65536)?;
//!     segment.as_mut_slice().fill(0xFF);
//!     client.request_update(7, 0, segment.id(), 0, 65536)
//! });
//!
//! while !worker.is_finished() {
//!     if !queue.poll_once() {
//!         std::thread::sleep(std::time::Duration::from_millis(1));
//!     }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![cfg(unix)]

mod client;
mod config;
mod connection;
mod error;
mod handshake;
mod hook;
mod queue;
mod registry;
mod stats;

pub use client::{Client, MappedSegment};
pub use config::{ClientConfig, ConfigError, QueueConfig};
pub use connection::ConnectionId;
pub use error::{ClientError, QueueError, RegistryError};
pub use hook::{RegionUpdate, RejectAllUpdates, UpdateHook};
pub use queue::MessageQueue;
pub use registry::{RegistryLimits, SegmentEntry, SegmentOrigin, SegmentRegistry};
pub use stats::StatsSnapshot;

pub use shm_primitives::ChannelKind;
pub use shmq_wire::{ErrorCode, SegmentId};

//! Standalone queue host.
//!
//! Binds a rendezvous socket (configured through `SHMQ_*` environment
//! variables), prints its address, and services clients until Ctrl-C. Region
//! updates are logged and accepted.
//!
//! Usage:
//!   RUST_LOG=shmq=debug cargo run -p shmq --bin shmq-host

use std::sync::Arc;
use std::time::Duration;

use shmq::{MessageQueue, QueueConfig, RegionUpdate, SegmentRegistry};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often the queue is polled when idle.
const IDLE_INTERVAL: Duration = Duration::from_millis(2);

/// Back-to-back polls allowed before yielding to the runtime.
const MAX_BUSY_POLLS: usize = 256;

fn log_update(update: RegionUpdate<'_>) -> bool {
    let checksum = update
        .bytes
        .iter()
        .fold(0u32, |acc, b| acc.rotate_left(5) ^ u32::from(*b));
    tracing::info!(
        target_id = update.target_id,
        level = update.level,
        segment = %update.segment_id,
        offset = update.offset,
        count = update.bytes.len(),
        checksum = format_args!("{checksum:08x}"),
        "region update"
    );
    true
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,shmq=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match QueueConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };

    let registry = Arc::new(SegmentRegistry::new(config.registry_limits()));
    let queue = match MessageQueue::new(config, registry.clone(), Arc::new(log_update)) {
        Ok(queue) => queue,
        Err(e) => {
            tracing::error!(error = %e, "failed to start message queue");
            std::process::exit(1);
        }
    };

    println!("{}", queue.get_rendezvous_address().display());

    let mut ticker = tokio::time::interval(IDLE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let mut polls = 0;
                while queue.poll_once() && polls < MAX_BUSY_POLLS {
                    polls += 1;
                }
            }
        }
    }

    let stats = queue.stats();
    tracing::info!(
        messages = stats.messages_handled,
        malformed = stats.malformed_dropped,
        accepted = stats.handshakes_accepted,
        refused = stats.handshakes_refused,
        closed = stats.connections_closed,
        live_connections = queue.connection_count(),
        live_segments = registry.len(),
        "shutting down"
    );
}

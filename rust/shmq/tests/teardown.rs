#![cfg(unix)]

mod support;

use std::sync::Arc;
use std::time::Duration;

use shm_primitives::ShmObject;
use shmq::{ChannelKind, Client, ClientConfig, MessageQueue, QueueConfig, SegmentRegistry};
use shmq_wire::Message;
use support::{Host, RawPeer, WORKER_TIMEOUT, run_workers};

fn connect(address: &std::path::Path) -> Client {
    Client::connect(address, ClientConfig::default()).unwrap()
}

#[test]
fn dropped_client_releases_its_segments() {
    if !ChannelKind::preferred().reports_eof() {
        return;
    }
    let host = Host::new();

    run_workers(&host.queue, 1, WORKER_TIMEOUT, |_, address| {
        let mut client = connect(address);
        for _ in 0..3 {
            client.allocate_shared_memory(4096).unwrap();
        }
        let object = ShmObject::create(4096).unwrap();
        client.register_shared_memory(&object, 4096).unwrap();
    });

    host.pump_until(Duration::from_secs(5), |queue| queue.connection_count() == 0);
    assert!(host.queue.registry().is_empty());
    assert_eq!(host.queue.stats().connections_closed, 1);
}

#[test]
fn teardown_only_releases_the_departed_client() {
    if !ChannelKind::preferred().reports_eof() {
        return;
    }
    let host = Host::new();
    let survivor = RawPeer::connect(&host);
    survivor.send(Message::AllocateSharedMemory { size: 64 });
    host.drain();
    assert!(survivor.try_reply().is_some());

    run_workers(&host.queue, 1, WORKER_TIMEOUT, |_, address| {
        let mut client = connect(address);
        client.allocate_shared_memory(64).unwrap();
    });

    host.pump_until(Duration::from_secs(5), |queue| queue.connection_count() == 1);
    assert_eq!(host.queue.registry().len(), 1);
}

#[test]
fn close_connection_releases_segments() {
    let host = Host::new();
    let peer = RawPeer::connect(&host);
    peer.send(Message::AllocateSharedMemory { size: 64 });
    peer.send(Message::AllocateSharedMemory { size: 64 });
    host.drain();

    let id = host.queue.connection_ids()[0];
    assert_eq!(host.queue.registry().owned_by(id).len(), 2);

    assert!(host.queue.close_connection(id));
    assert!(host.queue.registry().is_empty());
    assert_eq!(host.queue.connection_count(), 0);
    assert_eq!(host.queue.stats().connections_closed, 1);

    assert!(!host.queue.close_connection(id));
}

#[test]
fn client_mapping_outlives_host_release() {
    let host = Host::new();

    let mut segments = run_workers(&host.queue, 1, WORKER_TIMEOUT, |_, address| {
        let mut client = connect(address);
        let mut segment = client.allocate_shared_memory(4096).unwrap();
        segment.as_mut_slice()[0] = 1;
        (segment, client)
    });

    let id = host.queue.connection_ids()[0];
    assert!(host.queue.close_connection(id));

    let (segment, _client) = &mut segments[0];
    segment.as_mut_slice()[4095] = 2;
    assert_eq!(segment.as_slice()[0], 1);
    assert_eq!(segment.as_slice()[4095], 2);
}

#[test]
fn dropping_the_queue_releases_everything() {
    let dir = tempfile::tempdir().unwrap();
    let config = QueueConfig {
        socket_dir: dir.path().to_path_buf(),
        ..QueueConfig::default()
    };
    let registry = Arc::new(SegmentRegistry::new(config.registry_limits()));
    let queue = MessageQueue::new(config, registry.clone(), Arc::new(shmq::RejectAllUpdates)).unwrap();
    let address = queue.get_rendezvous_address().to_path_buf();

    let clients = run_workers(&queue, 2, WORKER_TIMEOUT, |_, address| {
        let mut client = connect(address);
        let segment = client.allocate_shared_memory(256).unwrap();
        (segment, client)
    });
    assert_eq!(registry.len(), 2);

    drop(queue);
    assert!(registry.is_empty());
    assert!(!address.exists());
    drop(clients);
}

#![cfg(unix)]

mod support;

use std::os::fd::AsFd;

use shm_primitives::{ShmObject, fdpass};
use shmq::SegmentId;
use shmq_wire::{Message, MessageKind};
use support::{Host, RawPeer};

fn assert_no_reply(peer: &RawPeer) {
    assert!(peer.try_reply().is_none(), "malformed input must not be answered");
}

#[test]
fn garbage_is_dropped_and_loop_continues() {
    let host = Host::new();
    let peer = RawPeer::connect(&host);

    peer.send_raw(b"\xde\xad");
    peer.send_raw(&0x42u32.to_le_bytes());
    peer.send_raw(&[0xAB; 64]);
    assert!(host.queue.poll_once());
    assert_no_reply(&peer);
    assert_eq!(host.queue.stats().malformed_dropped, 3);

    peer.send(Message::UnregisterSharedMemory {
        segment_id: SegmentId(999),
    });
    host.drain();
    assert!(matches!(
        peer.try_reply(),
        Some(Message::UnregisterSharedMemoryReply { ok: false })
    ));

    let stats = host.queue.stats();
    assert_eq!(stats.messages_handled, 1);
    assert_eq!(stats.malformed_dropped, 3);
    assert_eq!(host.queue.connection_count(), 1);
}

#[test]
fn wrong_length_is_dropped() {
    let host = Host::new();
    let peer = RawPeer::connect(&host);

    // AllocateSharedMemory missing half of its size field.
    let mut short = MessageKind::AllocateSharedMemory.tag().to_le_bytes().to_vec();
    short.extend_from_slice(&64u32.to_le_bytes());
    peer.send_raw(&short);

    // UnregisterSharedMemory with a trailing byte.
    let mut long = MessageKind::UnregisterSharedMemory.tag().to_le_bytes().to_vec();
    long.extend_from_slice(&0u32.to_le_bytes());
    long.push(0);
    peer.send_raw(&long);

    host.drain();
    assert_no_reply(&peer);
    assert_eq!(host.queue.stats().malformed_dropped, 2);
    assert!(host.queue.registry().is_empty());
}

#[test]
fn handle_count_mismatch_is_dropped() {
    let host = Host::new();
    let peer = RawPeer::connect(&host);
    let object = ShmObject::create(4096).unwrap();

    // RegisterSharedMemory without its handle.
    let mut register = MessageKind::RegisterSharedMemory.tag().to_le_bytes().to_vec();
    register.extend_from_slice(&4096u64.to_le_bytes());
    peer.send_raw(&register);

    // AllocateSharedMemory with a stray handle.
    let mut allocate = MessageKind::AllocateSharedMemory.tag().to_le_bytes().to_vec();
    allocate.extend_from_slice(&4096u64.to_le_bytes());
    fdpass::send_with_fds(peer.channel.as_fd(), &allocate, &[object.as_fd()], None).unwrap();

    host.drain();
    assert_no_reply(&peer);
    assert_eq!(host.queue.stats().malformed_dropped, 2);
    assert!(host.queue.registry().is_empty());
}

#[test]
fn replies_and_hello_on_channel_are_dropped() {
    let host = Host::new();
    let peer = RawPeer::connect(&host);
    let (_a, b) = fdpass::socketpair(shmq::ChannelKind::preferred()).unwrap();

    peer.send(Message::HelloReply { ok: true });
    peer.send(Message::UpdateRegionReply { ok: false });
    peer.send(Message::Hello { channel: b.as_fd() });

    host.drain();
    assert_no_reply(&peer);
    assert_eq!(host.queue.stats().malformed_dropped, 3);
    assert_eq!(host.queue.stats().messages_handled, 0);
    assert_eq!(host.queue.connection_count(), 1);
}

#[test]
fn bad_handle_in_register_gets_error_reply() {
    let host = Host::new();
    let peer = RawPeer::connect(&host);
    let (_a, socket) = fdpass::socketpair(shmq::ChannelKind::preferred()).unwrap();

    peer.send(Message::RegisterSharedMemory {
        size: 4096,
        handle: socket.as_fd(),
    });
    host.drain();

    assert!(matches!(
        peer.try_reply(),
        Some(Message::ErrorReply {
            request: MessageKind::RegisterSharedMemory,
            code: shmq::ErrorCode::InvalidHandle,
        })
    ));
    assert!(host.queue.registry().is_empty());
}

#[test]
fn one_bad_peer_does_not_starve_another() {
    let host = Host::new();
    let noisy = RawPeer::connect(&host);
    let quiet = RawPeer::connect(&host);

    for _ in 0..10 {
        noisy.send_raw(b"junk");
    }
    quiet.send(Message::AllocateSharedMemory { size: 128 });
    host.drain();

    match quiet.try_reply() {
        Some(Message::AllocateSharedMemoryReply { size, .. }) => assert_eq!(size, 128),
        other => panic!("unexpected reply {other:?}"),
    }
    assert_eq!(host.queue.stats().malformed_dropped, 10);
}

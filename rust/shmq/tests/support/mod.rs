//! Shared helpers for the queue integration tests.

#![allow(dead_code)]

use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use shm_primitives::fdpass;
use shmq::{ChannelKind, MessageQueue, QueueConfig, RegionUpdate, SegmentId, SegmentRegistry, UpdateHook};
use shmq_wire::Message;

pub const WORKER_TIMEOUT: Duration = Duration::from_secs(20);

/// A host rooted in its own temporary directory.
pub struct Host {
    pub dir: tempfile::TempDir,
    pub queue: MessageQueue,
    pub hook: Arc<RecordingHook>,
}

impl Host {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut QueueConfig)) -> Self {
        let dir = tempfile::Builder::new()
            .prefix("shmq-test-")
            .tempdir()
            .unwrap();
        let mut config = QueueConfig {
            socket_dir: dir.path().to_path_buf(),
            ..QueueConfig::default()
        };
        tweak(&mut config);

        let hook = Arc::new(RecordingHook::default());
        let registry = Arc::new(SegmentRegistry::new(config.registry_limits()));
        let queue = MessageQueue::new(config, registry, hook.clone()).unwrap();
        Self { dir, queue, hook }
    }

    pub fn address(&self) -> PathBuf {
        self.queue.get_rendezvous_address().to_path_buf()
    }

    /// Poll until nothing is pending.
    pub fn drain(&self) {
        while self.queue.poll_once() {}
    }

    /// Poll until `done` holds or `timeout` passes.
    pub fn pump_until(&self, timeout: Duration, mut done: impl FnMut(&MessageQueue) -> bool) {
        let deadline = Instant::now() + timeout;
        while !done(&self.queue) {
            assert!(Instant::now() < deadline, "condition not reached in {timeout:?}");
            if !self.queue.poll_once() {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

/// Run `worker` on `count` threads while pumping `queue` from this thread.
///
/// Each worker gets its index and the rendezvous address. Results come back
/// in index order; a panicking worker fails the test.
pub fn run_workers<T, F>(queue: &MessageQueue, count: usize, timeout: Duration, worker: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(usize, &Path) -> T + Send + Sync + 'static,
{
    let worker = Arc::new(worker);
    let address = queue.get_rendezvous_address().to_path_buf();

    let handles: Vec<_> = (0..count)
        .map(|index| {
            let worker = worker.clone();
            let address = address.clone();
            thread::Builder::new()
                .name(format!("shmq-worker-{index}"))
                .spawn(move || worker(index, &address))
                .unwrap()
        })
        .collect();

    let deadline = Instant::now() + timeout;
    while !handles.iter().all(|h| h.is_finished()) {
        assert!(
            Instant::now() < deadline,
            "workers still running after {timeout:?}"
        );
        if !queue.poll_once() {
            thread::sleep(Duration::from_micros(200));
        }
    }

    handles
        .into_iter()
        .enumerate()
        .map(|(index, handle)| match handle.join() {
            Ok(value) => value,
            Err(panic) => {
                eprintln!("worker {index} panicked");
                std::panic::resume_unwind(panic)
            }
        })
        .collect()
}

/// One call observed by [`RecordingHook`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedUpdate {
    pub target_id: u32,
    pub level: u32,
    pub segment_id: SegmentId,
    pub offset: u64,
    pub bytes: Vec<u8>,
}

/// Accepts every update and remembers it.
#[derive(Debug, Default)]
pub struct RecordingHook {
    updates: Mutex<Vec<RecordedUpdate>>,
}

impl RecordingHook {
    pub fn updates(&self) -> Vec<RecordedUpdate> {
        self.updates.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.updates.lock().len()
    }
}

impl UpdateHook for RecordingHook {
    fn apply_update(&self, update: RegionUpdate<'_>) -> bool {
        self.updates.lock().push(RecordedUpdate {
            target_id: update.target_id,
            level: update.level,
            segment_id: update.segment_id,
            offset: update.offset,
            bytes: update.bytes.to_vec(),
        });
        true
    }
}

/// A hand-driven client channel, for sending bytes a real client never would.
pub struct RawPeer {
    pub ack: UnixDatagram,
    pub channel: OwnedFd,
    _dir: tempfile::TempDir,
}

impl RawPeer {
    /// Handshake with `host` from this thread.
    pub fn connect(host: &Host) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let ack = UnixDatagram::bind(dir.path().join("ack.sock")).unwrap();
        let (channel, theirs) = fdpass::socketpair(ChannelKind::preferred()).unwrap();

        let (bytes, fds) = shmq_wire::encode(Message::Hello {
            channel: theirs.as_fd(),
        });
        fdpass::send_with_fds(ack.as_fd(), &bytes, &fds, Some(&host.address())).unwrap();
        drop(theirs);

        assert!(host.queue.poll_once());
        let mut buf = [0u8; 16];
        let n = ack.recv(&mut buf).unwrap();
        assert!(matches!(
            shmq_wire::decode::<OwnedFd>(&buf[..n], vec![]),
            Ok(Message::HelloReply { ok: true })
        ));

        Self {
            ack,
            channel,
            _dir: dir,
        }
    }

    pub fn send_raw(&self, bytes: &[u8]) {
        fdpass::send_with_fds(self.channel.as_fd(), bytes, &[], None).unwrap();
    }

    pub fn send(&self, message: Message<std::os::fd::BorrowedFd<'_>>) {
        let (bytes, fds) = shmq_wire::encode(message);
        fdpass::send_with_fds(self.channel.as_fd(), &bytes, &fds, None).unwrap();
    }

    /// The next reply, if one is already queued.
    pub fn try_reply(&self) -> Option<Message<OwnedFd>> {
        let mut buf = [0u8; shmq_wire::MAX_MESSAGE_LEN + 1];
        match fdpass::recv_with_fds(self.channel.as_fd(), &mut buf, 2, true) {
            Ok(received) => Some(shmq_wire::decode(&buf[..received.len], received.fds).unwrap()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => None,
            Err(e) => panic!("reply receive failed: {e}"),
        }
    }
}

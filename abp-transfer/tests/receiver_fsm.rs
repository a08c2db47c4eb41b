//! Receiver behaviour driven by hand-crafted datagrams.
//!
//! A bare [`Socket`] plays the sender so every test controls exactly which
//! flags arrive and in what order, then inspects the receiver's replies, its
//! session table and the output directory.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use abp_transfer::packet::{flags, Packet};
use abp_transfer::socket::Socket;
use abp_transfer::timer::TimerConfig;
use abp_transfer::{Receiver, ReceiverConfig, ReceiverState, StaleFinPolicy};

const REPLY_WAIT: Duration = Duration::from_secs(2);
const SILENCE: Duration = Duration::from_millis(200);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn config(dir: &Path) -> ReceiverConfig {
    ReceiverConfig {
        output_dir: dir.to_path_buf(),
        ..ReceiverConfig::default()
    }
}

/// Config whose sessions expire after `timeout`, without the periodic sweep.
fn short_lived(dir: &Path, timeout: Duration) -> ReceiverConfig {
    ReceiverConfig {
        timer: TimerConfig {
            session_timeout: timeout,
            ..TimerConfig::default()
        },
        reap_interval: None,
        ..config(dir)
    }
}

async fn start(config: ReceiverConfig) -> Arc<Receiver> {
    let receiver = Receiver::bind(loopback(), config).await.unwrap();
    tokio::spawn(receiver.clone().run());
    receiver
}

/// A scripted sender.
struct Peer {
    socket: Socket,
    receiver: SocketAddr,
}

impl Peer {
    async fn new(receiver: &Receiver) -> Self {
        Self {
            socket: Socket::bind(loopback()).await.unwrap(),
            receiver: receiver.local_addr(),
        }
    }

    fn addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    async fn send(&self, packet_flags: u16, payload: &[u8]) {
        let packet = Packet::new(packet_flags, payload.to_vec()).unwrap();
        self.socket.send_to(&packet, self.receiver).await.unwrap();
    }

    /// Send and return the flags of the reply.
    async fn exchange(&self, packet_flags: u16, payload: &[u8]) -> u16 {
        self.send(packet_flags, payload).await;
        self.reply().await
    }

    async fn reply(&self) -> u16 {
        let (packet, from) = tokio::time::timeout(REPLY_WAIT, self.socket.recv_from())
            .await
            .expect("no reply from receiver")
            .expect("reply failed verification");
        assert_eq!(from, self.receiver);
        assert!(packet.payload.is_empty(), "replies carry no payload");
        packet.flags()
    }

    async fn expect_silence(&self) {
        let got = tokio::time::timeout(SILENCE, self.socket.recv_from()).await;
        assert!(got.is_err(), "unexpected reply: {got:?}");
    }
}

// ---------------------------------------------------------------------------
// Happy path and duplicates
// ---------------------------------------------------------------------------

#[tokio::test]
async fn acks_echo_the_accepted_flags() {
    let dir = tempfile::tempdir().unwrap();
    let receiver = start(config(dir.path())).await;
    let peer = Peer::new(&receiver).await;

    assert_eq!(peer.exchange(flags::FILENAME, b"out.txt").await, 0);
    assert_eq!(peer.exchange(flags::ALTERNATING, b"one ").await, flags::ALTERNATING);
    assert_eq!(peer.exchange(0, b"two ").await, 0);
    let fin1 = flags::ALTERNATING | flags::FIN;
    assert_eq!(peer.exchange(fin1, b"three").await, fin1);

    assert_eq!(std::fs::read(dir.path().join("out.txt")).unwrap(), b"one two three");
    let snap = receiver.snapshot(&peer.addr()).await.unwrap();
    assert_eq!(snap.state, ReceiverState::Closed1);
    assert_eq!(snap.filename.as_deref(), Some("out.txt"));
    assert_eq!(snap.bytes_written, 13);
}

#[tokio::test]
async fn replayed_chunk_is_acked_but_not_rewritten() {
    let dir = tempfile::tempdir().unwrap();
    let receiver = start(config(dir.path())).await;
    let peer = Peer::new(&receiver).await;

    peer.exchange(flags::FILENAME, b"dup.bin").await;
    assert_eq!(peer.exchange(flags::ALTERNATING, b"abc").await, flags::ALTERNATING);
    // The ACK was "lost": the same chunk arrives again.
    assert_eq!(peer.exchange(flags::ALTERNATING, b"abc").await, flags::ALTERNATING);

    let snap = receiver.snapshot(&peer.addr()).await.unwrap();
    assert_eq!(snap.state, ReceiverState::WaitData0);
    assert_eq!(snap.bytes_written, 3);
    assert_eq!(std::fs::read(dir.path().join("dup.bin")).unwrap(), b"abc");
}

#[tokio::test]
async fn repeated_filename_after_open_resends_ack() {
    let dir = tempfile::tempdir().unwrap();
    let receiver = start(config(dir.path())).await;
    let peer = Peer::new(&receiver).await;

    assert_eq!(peer.exchange(flags::FILENAME, b"f").await, 0);
    assert_eq!(peer.exchange(flags::FILENAME, b"f").await, 0);
    assert_eq!(
        receiver.snapshot(&peer.addr()).await.unwrap().state,
        ReceiverState::WaitData1
    );
}

#[tokio::test]
async fn fin_after_close_is_acked_again() {
    let dir = tempfile::tempdir().unwrap();
    let receiver = start(config(dir.path())).await;
    let peer = Peer::new(&receiver).await;

    let fin1 = flags::ALTERNATING | flags::FIN;
    peer.exchange(flags::FILENAME, b"done.txt").await;
    assert_eq!(peer.exchange(fin1, b"xyz").await, fin1);
    assert_eq!(peer.exchange(fin1, b"xyz").await, fin1);
    assert_eq!(peer.exchange(fin1, b"xyz").await, fin1);

    let snap = receiver.snapshot(&peer.addr()).await.unwrap();
    assert_eq!(snap.state, ReceiverState::Closed1);
    assert_eq!(snap.bytes_written, 3);
    assert_eq!(std::fs::read(dir.path().join("done.txt")).unwrap(), b"xyz");
}

#[tokio::test]
async fn every_reply_leaves_a_timer_armed() {
    let dir = tempfile::tempdir().unwrap();
    let receiver = start(config(dir.path())).await;
    let peer = Peer::new(&receiver).await;

    peer.exchange(flags::FILENAME, b"t").await;
    assert!(receiver.snapshot(&peer.addr()).await.unwrap().timer_armed);
    peer.exchange(flags::ALTERNATING, b"1").await;
    let snap = receiver.snapshot(&peer.addr()).await.unwrap();
    assert!(snap.timer_armed);
    assert!(snap.file_open);
    assert_eq!(snap.last_reply_flags, Some(flags::ALTERNATING));
}

// ---------------------------------------------------------------------------
// Filtering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn corrupt_datagram_creates_no_session() {
    let dir = tempfile::tempdir().unwrap();
    let receiver = start(config(dir.path())).await;
    let peer = Peer::new(&receiver).await;

    let mut bytes = Packet::new(flags::FILENAME, b"x.txt".to_vec()).unwrap().encode();
    bytes[9] ^= 0x10;
    peer.socket.send_raw(&bytes, peer.receiver).await.unwrap();

    peer.expect_silence().await;
    assert!(receiver.sessions().is_empty());
    assert!(!dir.path().join("x.txt").exists());
}

#[tokio::test]
async fn unrecognised_flags_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let receiver = start(config(dir.path())).await;
    let peer = Peer::new(&receiver).await;

    peer.send(flags::FILENAME | flags::FIN, b"weird").await;
    peer.expect_silence().await;

    // The session exists but is still waiting for its filename.
    let snap = receiver.snapshot(&peer.addr()).await.unwrap();
    assert_eq!(snap.state, ReceiverState::WaitFilename);
    assert_eq!(peer.exchange(flags::FILENAME, b"ok").await, 0);
}

// ---------------------------------------------------------------------------
// Violations
// ---------------------------------------------------------------------------

#[tokio::test]
async fn data_before_filename_tears_down() {
    let dir = tempfile::tempdir().unwrap();
    let receiver = start(config(dir.path())).await;
    let peer = Peer::new(&receiver).await;

    peer.send(0, b"too early").await;
    peer.expect_silence().await;
    assert!(receiver.snapshot(&peer.addr()).await.is_none());

    // A new attempt starts from scratch.
    assert_eq!(peer.exchange(flags::FILENAME, b"retry").await, 0);
}

#[tokio::test]
async fn directory_filename_tears_down_without_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let receiver = start(config(dir.path())).await;

    for name in [&b".."[..], b".", b""] {
        let peer = Peer::new(&receiver).await;
        peer.send(flags::FILENAME, name).await;
        peer.expect_silence().await;

        assert!(receiver.snapshot(&peer.addr()).await.is_none(), "{name:?}");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0, "{name:?}");

        // The same peer can start over with a usable name.
        assert_eq!(peer.exchange(flags::FILENAME, b"fine.txt").await, 0);
        std::fs::remove_file(dir.path().join("fine.txt")).unwrap();
    }
}

#[tokio::test]
async fn wrong_bit_fin_removes_partial_file() {
    let dir = tempfile::tempdir().unwrap();
    let receiver = start(config(dir.path())).await;
    let peer = Peer::new(&receiver).await;

    peer.exchange(flags::FILENAME, b"half.bin").await;
    peer.exchange(flags::ALTERNATING, b"first").await;
    assert!(dir.path().join("half.bin").exists());

    // WAIT_DATA0 expects bit 0; FIN1 is a violation.
    peer.send(flags::ALTERNATING | flags::FIN, b"bad").await;
    peer.expect_silence().await;

    assert!(receiver.snapshot(&peer.addr()).await.is_none());
    assert!(!dir.path().join("half.bin").exists());
}

#[tokio::test]
async fn unexpected_packet_after_close_keeps_file() {
    let dir = tempfile::tempdir().unwrap();
    let receiver = start(config(dir.path())).await;
    let peer = Peer::new(&receiver).await;

    peer.exchange(flags::FILENAME, b"kept.txt").await;
    peer.exchange(flags::ALTERNATING | flags::FIN, b"all").await;

    peer.send(0, b"extra").await;
    peer.expect_silence().await;

    assert!(receiver.snapshot(&peer.addr()).await.is_none());
    assert_eq!(std::fs::read(dir.path().join("kept.txt")).unwrap(), b"all");
}

#[tokio::test]
async fn stale_fin_policy_decides_other_bit_fin_after_close() {
    for (policy, survives) in [(StaleFinPolicy::Violation, false), (StaleFinPolicy::Tolerate, true)] {
        let dir = tempfile::tempdir().unwrap();
        let receiver = start(ReceiverConfig {
            stale_fin_policy: policy,
            ..config(dir.path())
        })
        .await;
        let peer = Peer::new(&receiver).await;

        peer.exchange(flags::FILENAME, b"fin.txt").await;
        peer.exchange(flags::ALTERNATING | flags::FIN, b"end").await;

        peer.send(flags::FIN, b"").await;
        peer.expect_silence().await;

        let snap = receiver.snapshot(&peer.addr()).await;
        assert_eq!(snap.is_some(), survives, "{policy:?}");
        if let Some(snap) = snap {
            assert_eq!(snap.state, ReceiverState::Closed1);
        }
        assert_eq!(std::fs::read(dir.path().join("fin.txt")).unwrap(), b"end");
    }
}

// ---------------------------------------------------------------------------
// Timeouts and reclamation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn silent_peer_in_transfer_loses_partial_file() {
    let dir = tempfile::tempdir().unwrap();
    let receiver = start(short_lived(dir.path(), Duration::from_millis(150))).await;
    let peer = Peer::new(&receiver).await;

    peer.exchange(flags::FILENAME, b"stalled.bin").await;
    peer.exchange(flags::ALTERNATING, b"part").await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let snap = receiver.snapshot(&peer.addr()).await.unwrap();
    assert_eq!(snap.state, ReceiverState::Dead);
    assert!(!snap.timer_armed);
    assert!(!snap.file_open);
    assert!(!dir.path().join("stalled.bin").exists());
}

#[tokio::test]
async fn closed_session_times_out_and_keeps_file() {
    let dir = tempfile::tempdir().unwrap();
    let receiver = start(short_lived(dir.path(), Duration::from_millis(150))).await;
    let peer = Peer::new(&receiver).await;

    peer.exchange(flags::FILENAME, b"final.txt").await;
    let fin1 = flags::ALTERNATING | flags::FIN;
    assert_eq!(peer.exchange(fin1, b"done").await, fin1);
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(
        receiver.snapshot(&peer.addr()).await.unwrap().state,
        ReceiverState::Dead
    );
    assert!(dir.path().join("final.txt").exists());
}

#[tokio::test]
async fn peer_that_never_names_a_file_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let receiver = start(short_lived(dir.path(), Duration::from_millis(150))).await;
    let peer = Peer::new(&receiver).await;

    peer.send(flags::FILENAME | flags::ALTERNATING, b"?").await;
    peer.expect_silence().await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(
        receiver.snapshot(&peer.addr()).await.unwrap().state,
        ReceiverState::Dead
    );
}

#[tokio::test]
async fn dead_session_is_replaced_by_next_datagram() {
    let dir = tempfile::tempdir().unwrap();
    let receiver = start(short_lived(dir.path(), Duration::from_millis(150))).await;
    let peer = Peer::new(&receiver).await;

    peer.exchange(flags::FILENAME, b"first.bin").await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(receiver.snapshot(&peer.addr()).await.unwrap().state.is_dead());

    assert_eq!(peer.exchange(flags::FILENAME, b"second.bin").await, 0);
    let snap = receiver.snapshot(&peer.addr()).await.unwrap();
    assert_eq!(snap.state, ReceiverState::WaitData1);
    assert_eq!(snap.filename.as_deref(), Some("second.bin"));
    assert_eq!(receiver.sessions().len(), 1);
}

#[tokio::test]
async fn reaper_sweeps_dead_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let receiver = start(ReceiverConfig {
        reap_interval: Some(Duration::from_millis(100)),
        ..short_lived(dir.path(), Duration::from_millis(100))
    })
    .await;
    let peer = Peer::new(&receiver).await;

    peer.exchange(flags::FILENAME, b"gone.bin").await;
    assert_eq!(receiver.sessions().len(), 1);
    tokio::time::sleep(Duration::from_millis(700)).await;

    assert!(receiver.sessions().is_empty());
}

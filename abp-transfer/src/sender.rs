//! Sending side: stop-and-wait file upload with an alternating bit.
//!
//! [`Sender`] owns a socket and drives the whole transfer sequentially.  It
//! never has more than one packet outstanding.
//!
//! # Stop-and-Wait contract
//! - The FILENAME packet is re-sent until the receiver answers with flags `0`.
//! - Each data chunk carries the current alternating bit, plus FIN when the
//!   read reached end-of-input (the final chunk may be empty).
//! - A chunk is re-sent unchanged on timeout, on a corrupt reply and on a
//!   reply whose flags differ from the flags sent.
//! - A reply with exactly the sent flags flips the bit and moves on; after the
//!   FIN chunk is acknowledged the transfer is complete.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{timeout_at, Instant};

use crate::packet::{flags, Packet, PacketError, MAX_PAYLOAD};
use crate::socket::{Socket, SocketError};
use crate::timer::TimerConfig;

/// Sender settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderConfig {
    /// How long to wait for a matching reply before re-sending.
    pub ack_timeout: Duration,
    /// Give up after this many transmissions of a single packet.
    /// `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            ack_timeout: TimerConfig::default().ack_timeout,
            max_retries: None,
        }
    }
}

/// Errors that end a transfer.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("network failure: {0}")]
    Socket(#[source] SocketError),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error("no matching reply for flags {flags:#x} after {attempts} transmissions")]
    RetriesExhausted { flags: u16, attempts: u32 },
}

/// Counters for a finished transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferReport {
    /// Payload bytes delivered.
    pub bytes: u64,
    /// Data chunks acknowledged, including the final FIN chunk.
    pub chunks: u64,
    /// Datagrams put on the wire, retransmissions included.
    pub transmissions: u64,
}

/// How a wait for a reply ended.
enum Reply {
    Matched,
    Mismatch,
    TimedOut,
}

/// Stop-and-wait sender bound to one receiver.
#[derive(Debug)]
pub struct Sender {
    socket: Socket,
    peer: SocketAddr,
    config: SenderConfig,
    /// Alternating bit for the next data chunk.
    bit: bool,
    report: TransferReport,
}

impl Sender {
    /// Bind an ephemeral local socket of the peer's address family.
    pub async fn connect(peer: SocketAddr, config: SenderConfig) -> Result<Self, SendError> {
        let local: SocketAddr = if peer.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = Socket::bind(local).await.map_err(SendError::Socket)?;
        Ok(Self::with_socket(socket, peer, config))
    }

    /// Use an already bound socket (for example one with a fault simulator).
    pub fn with_socket(socket: Socket, peer: SocketAddr, config: SenderConfig) -> Self {
        Self {
            socket,
            peer,
            config,
            bit: true,
            report: TransferReport::default(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    /// Upload the file at `path`, announcing it under the path as given.
    ///
    /// The file is opened before anything is sent, so a missing or unreadable
    /// source aborts without touching the network.
    pub async fn send_file(&mut self, path: &Path) -> Result<TransferReport, SendError> {
        let file = tokio::fs::File::open(path).await.map_err(|source| SendError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let name = path.to_string_lossy().into_owned();
        self.transfer(name.as_bytes(), file, path).await
    }

    /// Announce `name`, then stream everything `reader` yields.
    ///
    /// `origin` is only used in error messages.
    pub async fn transfer<R>(&mut self, name: &[u8], mut reader: R, origin: &Path) -> Result<TransferReport, SendError>
    where
        R: AsyncRead + Unpin,
    {
        let announce = Packet::new(flags::FILENAME, name.to_vec())?;
        self.exchange(&announce, 0).await?;
        log::info!("[send] receiver {} accepted filename {:?}", self.peer, String::from_utf8_lossy(name));

        let mut buf = vec![0u8; MAX_PAYLOAD];
        loop {
            let n = read_chunk(&mut reader, &mut buf).await.map_err(|source| SendError::Io {
                path: origin.to_path_buf(),
                source,
            })?;
            let fin = n < MAX_PAYLOAD;

            let mut chunk_flags = if self.bit { flags::ALTERNATING } else { 0 };
            if fin {
                chunk_flags |= flags::FIN;
            }

            let packet = Packet::new(chunk_flags, buf[..n].to_vec())?;
            self.exchange(&packet, chunk_flags).await?;

            self.bit = !self.bit;
            self.report.chunks += 1;
            self.report.bytes += n as u64;

            if fin {
                log::info!(
                    "[send] FIN acknowledged: {} bytes in {} chunks, {} datagrams sent",
                    self.report.bytes,
                    self.report.chunks,
                    self.report.transmissions
                );
                return Ok(self.report);
            }
        }
    }

    /// Send `packet` until a reply with exactly `expect` flags comes back.
    async fn exchange(&mut self, packet: &Packet, expect: u16) -> Result<(), SendError> {
        let bytes = packet.encode();
        let mut attempts = 0u32;

        loop {
            if self.config.max_retries.is_some_and(|max| attempts >= max) {
                return Err(SendError::RetriesExhausted {
                    flags: packet.flags(),
                    attempts,
                });
            }

            self.socket
                .send_raw(&bytes, self.peer)
                .await
                .map_err(SendError::Socket)?;
            attempts += 1;
            self.report.transmissions += 1;
            log::debug!(
                "[send] → flags={:#x} len={} (attempt {attempts})",
                packet.flags(),
                packet.payload.len()
            );

            match self.await_reply(expect).await? {
                Reply::Matched => return Ok(()),
                Reply::Mismatch => {}
                Reply::TimedOut => {
                    log::debug!("[send] no reply within {:?}, resending", self.config.ack_timeout);
                }
            }
        }
    }

    /// Wait up to `ack_timeout` for the next reply from the peer.
    ///
    /// Datagrams from other addresses are skipped without ending the wait.
    async fn await_reply(&self, expect: u16) -> Result<Reply, SendError> {
        let deadline = Instant::now() + self.config.ack_timeout;
        loop {
            let received = match timeout_at(deadline, self.socket.recv_from()).await {
                Ok(received) => received,
                Err(_elapsed) => return Ok(Reply::TimedOut),
            };

            match received {
                Ok((reply, from)) if from == self.peer => {
                    if reply.flags() == expect {
                        return Ok(Reply::Matched);
                    }
                    log::debug!(
                        "[send] ← unexpected reply flags={:#x}, want {expect:#x}",
                        reply.flags()
                    );
                    return Ok(Reply::Mismatch);
                }
                Ok((_, from)) => log::debug!("[send] ignoring datagram from stranger {from}"),
                Err(SocketError::Packet { from, source }) if from == self.peer => {
                    log::debug!("[send] ← corrupt reply: {source}");
                    return Ok(Reply::Mismatch);
                }
                Err(SocketError::Packet { .. }) => {}
                Err(e) => return Err(SendError::Socket(e)),
            }
        }
    }
}

/// Fill `buf` from `reader`, stopping early only at end-of-input.
async fn read_chunk<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

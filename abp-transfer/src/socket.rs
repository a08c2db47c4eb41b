//! Datagram I/O shared by both ends of a transfer.
//!
//! [`Socket`] wraps a `tokio::net::UdpSocket`: outbound packets are encoded
//! (and optionally perturbed by a [`Simulator`]), inbound datagrams are
//! verified and decoded before anyone sees them.

use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::UdpSocket;

use crate::packet::{Packet, PacketError, MAX_DATAGRAM};
use crate::simulator::Simulator;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SocketError {
    /// The OS refused a bind, send or receive.
    #[error("UDP I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// A datagram from `from` was truncated or failed its checksum.
    #[error("rejected datagram from {from}: {source}")]
    Packet {
        from: SocketAddr,
        #[source]
        source: PacketError,
    },
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

/// UDP endpoint that sends and receives whole [`Packet`]s.
///
/// Every method takes `&self`; one socket serves the receive loop and all
/// reply paths at once.
#[derive(Debug)]
pub struct Socket {
    /// The bound address, with the OS-assigned port when bound to port 0.
    pub local_addr: SocketAddr,
    inner: UdpSocket,
    simulator: Option<Simulator>,
}

impl Socket {
    pub async fn bind(addr: SocketAddr) -> Result<Self, SocketError> {
        let inner = UdpSocket::bind(addr).await?;
        Ok(Self {
            local_addr: inner.local_addr()?,
            inner,
            simulator: None,
        })
    }

    /// Route every outbound datagram through `simulator`.
    pub fn with_simulator(mut self, simulator: Simulator) -> Self {
        self.simulator = Some(simulator);
        self
    }

    pub async fn send_to(&self, packet: &Packet, dest: SocketAddr) -> Result<(), SocketError> {
        self.send_raw(&packet.encode(), dest).await
    }

    /// Put already encoded bytes on the wire.
    ///
    /// With a simulator attached this may send nothing, one copy, two copies
    /// or a corrupted copy.
    pub async fn send_raw(&self, bytes: &[u8], dest: SocketAddr) -> Result<(), SocketError> {
        let Some(sim) = &self.simulator else {
            self.inner.send_to(bytes, dest).await?;
            return Ok(());
        };
        for copy in sim.perturb(bytes) {
            self.inner.send_to(&copy, dest).await?;
        }
        Ok(())
    }

    /// Wait for the next datagram and return it with its source address.
    ///
    /// A datagram that fails verification comes back as
    /// [`SocketError::Packet`] so the caller can log it and keep reading.
    pub async fn recv_from(&self) -> Result<(Packet, SocketAddr), SocketError> {
        let mut buf = [0u8; MAX_DATAGRAM];
        let (n, from) = self.inner.recv_from(&mut buf).await?;
        match Packet::decode(&buf[..n]) {
            Ok(packet) => Ok((packet, from)),
            Err(source) => Err(SocketError::Packet { from, source }),
        }
    }
}

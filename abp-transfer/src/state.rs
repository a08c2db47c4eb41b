//! Receiver finite-state machine (FSM) types.
//!
//! This module defines every state a receiver-side
//! [`crate::session::Session`] can occupy, the events that drive it, and the
//! transition table itself.  [`transition`] is a pure function: it decides
//! *what* should happen and returns it as a [`Transition`], while all I/O
//! (file writes, replies, timers) is carried out by [`crate::receiver`].
//!
//! ```text
//!                FILENAME                DATA1                 DATA0
//!  WAIT_FILENAME ────────▶ WAIT_DATA1 ─────────▶ WAIT_DATA0 ─────────▶ WAIT_DATA1 ...
//!                              │                     │
//!                         FIN1 │                FIN0 │
//!                              ▼                     ▼
//!                           CLOSED1               CLOSED0 ──TIMEOUT──▶ (removed)
//! ```
//!
//! The bit a wait state expects decides between new data and a duplicate: a
//! packet carrying the bit that was already acknowledged means the peer never
//! saw that ACK, so only the ACK is sent again and the payload is never
//! rewritten.

use crate::packet::flags;

/// All possible states of a receiver session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReceiverState {
    /// Fresh session; nothing but a FILENAME packet is legal.
    #[default]
    WaitFilename,
    /// Expecting a chunk with the alternating bit clear.
    WaitData0,
    /// Expecting a chunk with the alternating bit set.
    WaitData1,
    /// Final chunk (bit clear) accepted; only its retransmission is legal.
    Closed0,
    /// Final chunk (bit set) accepted; only its retransmission is legal.
    Closed1,
    /// Torn down.  Resources are released and the session awaits eviction.
    Dead,
}

impl ReceiverState {
    /// `true` once the session has been torn down.
    pub fn is_dead(self) -> bool {
        self == ReceiverState::Dead
    }

    /// `true` once the final chunk has been accepted.
    pub fn is_closed(self) -> bool {
        matches!(self, ReceiverState::Closed0 | ReceiverState::Closed1)
    }
}

impl std::fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ReceiverState::WaitFilename => "WAIT_FILENAME",
            ReceiverState::WaitData0 => "WAIT_DATA0",
            ReceiverState::WaitData1 => "WAIT_DATA1",
            ReceiverState::Closed0 => "CLOSED0",
            ReceiverState::Closed1 => "CLOSED1",
            ReceiverState::Dead => "DEAD",
        };
        f.write_str(name)
    }
}

/// Inputs to the FSM.
///
/// All but [`Event::Timeout`] are derived from a verified packet's flags via
/// [`Event::classify`]; `Timeout` is injected by the session timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Filename,
    Data0,
    Data1,
    Fin0,
    Fin1,
    Timeout,
}

impl Event {
    /// Map a packet's flag bits to an event.
    ///
    /// Only exact flag combinations are recognised; anything else (for example
    /// FILENAME together with FIN) yields `None` and the packet is ignored.
    pub fn classify(packet_flags: u16) -> Option<Event> {
        match packet_flags {
            flags::FILENAME => Some(Event::Filename),
            0 => Some(Event::Data0),
            flags::ALTERNATING => Some(Event::Data1),
            flags::FIN => Some(Event::Fin0),
            f if f == flags::FIN | flags::ALTERNATING => Some(Event::Fin1),
            _ => None,
        }
    }

    /// Flags of the acknowledgement for an accepted packet of this kind.
    ///
    /// The ACK echoes the packet's own flags; the sender waits for exactly
    /// that value before advancing.
    fn ack_flags(self) -> u16 {
        match self {
            Event::Filename | Event::Data0 | Event::Timeout => 0,
            Event::Data1 => flags::ALTERNATING,
            Event::Fin0 => flags::FIN,
            Event::Fin1 => flags::FIN | flags::ALTERNATING,
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Event::Filename => "FILENAME",
            Event::Data0 => "DATA0",
            Event::Data1 => "DATA1",
            Event::Fin0 => "FIN0",
            Event::Fin1 => "FIN1",
            Event::Timeout => "TIMEOUT",
        };
        f.write_str(name)
    }
}

/// How a closed session treats a FIN carrying the *other* alternating bit
/// (FIN0 while `CLOSED1`, FIN1 while `CLOSED0`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StaleFinPolicy {
    /// Treat it as a protocol violation and tear the session down.
    #[default]
    Violation,
    /// Treat it as a stale duplicate and ignore it.
    Tolerate,
}

/// The decision for one `(state, event)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Create the destination file named by the payload, move to `next` and
    /// reply with `reply`.
    OpenFile { next: ReceiverState, reply: u16 },
    /// Write and persist the payload, move to `next` and reply with `reply`.
    Accept { next: ReceiverState, reply: u16 },
    /// Reply again with the last flags sent; no state change, no write.
    ResendAck,
    /// Tear the session down, keeping whatever was written.
    Delete,
    /// Tear the session down and remove the partially written file.
    DeleteAndRemoveFile,
    /// Do nothing.
    NoOp,
}

/// The receiver transition table.
pub fn transition(state: ReceiverState, event: Event, policy: StaleFinPolicy) -> Transition {
    use Event as E;
    use ReceiverState as S;
    use Transition as T;

    let accept = |next| T::Accept {
        next,
        reply: event.ack_flags(),
    };

    match (state, event) {
        (S::WaitFilename, E::Filename) => T::OpenFile {
            next: S::WaitData1,
            reply: event.ack_flags(),
        },
        (S::WaitFilename, _) => T::DeleteAndRemoveFile,

        (S::WaitData0, E::Data0) => accept(S::WaitData1),
        (S::WaitData0, E::Fin0) => accept(S::Closed0),
        (S::WaitData0, E::Filename | E::Data1) => T::ResendAck,
        (S::WaitData0, E::Fin1 | E::Timeout) => T::DeleteAndRemoveFile,

        (S::WaitData1, E::Data1) => accept(S::WaitData0),
        (S::WaitData1, E::Fin1) => accept(S::Closed1),
        (S::WaitData1, E::Filename | E::Data0) => T::ResendAck,
        (S::WaitData1, E::Fin0 | E::Timeout) => T::DeleteAndRemoveFile,

        (S::Closed0, E::Fin0) | (S::Closed1, E::Fin1) => T::ResendAck,
        (S::Closed0, E::Fin1) | (S::Closed1, E::Fin0) => match policy {
            StaleFinPolicy::Violation => T::Delete,
            StaleFinPolicy::Tolerate => T::NoOp,
        },
        (S::Closed0 | S::Closed1, _) => T::Delete,

        (S::Dead, _) => T::NoOp,
    }
}

//! `abp-transfer`: reliable file transfer over UDP with the Alternating Bit
//! Protocol.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────┐  FILENAME, DATA0/1, FIN0/1  ┌──────────┐
//!  │  Sender  │────────────────────────────▶│ Receiver │──▶ file on disk
//!  └────┬─────┘                             └────┬─────┘
//!       │◀──────────────── ACKs ─────────────────┘
//!       │                                        │ per peer
//!       │                                  ┌─────▼──────────────────────┐
//!       │                                  │ Session (FSM state, file,  │
//!       │                                  │ last reply, single timer)  │
//!       │                                  └────────────────────────────┘
//!  ┌────▼──────┐
//!  │  Socket   │  (thin async wrapper around tokio UdpSocket + Simulator)
//!  └───────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]    : wire format (serialise / verify / deserialise)
//! - [`state`]     : receiver FSM types and the pure transition table
//! - [`session`]   : per-peer session records and the session table
//! - [`receiver`]  : receive loop executing FSM transitions
//! - [`sender`]    : stop-and-wait upload loop
//! - [`timer`]     : session timeouts with race-free cancellation
//! - [`simulator`] : optional drop / duplicate / bit-flip fault injection
//! - [`socket`]    : async UDP socket abstraction

pub mod packet;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod timer;

pub use packet::{Header, Packet, PacketError};
pub use receiver::{Receiver, ReceiverConfig, SessionSnapshot};
pub use sender::{SendError, Sender, SenderConfig, TransferReport};
pub use state::{Event, ReceiverState, StaleFinPolicy, Transition};

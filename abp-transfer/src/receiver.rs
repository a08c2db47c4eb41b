//! Receiver engine: turns verified datagrams into an exactly-once file.
//!
//! The [`Receiver`] owns the UDP socket and the [`SessionTable`].  Its receive
//! loop handles one datagram at a time to completion:
//!
//! ```text
//!  datagram ─▶ verify ─▶ checkout session ─▶ classify flags ─▶ transition()
//!                                                                  │
//!           re-arm timer ◀── reply ◀── write + sync payload ◀──────┘
//! ```
//!
//! Session timers run as separate tasks.  On expiry a timer locks its session,
//! checks that it is still the armed generation and then feeds
//! [`Event::Timeout`] through exactly the same execution path, so a timeout
//! and a datagram for the same peer can never interleave.
//!
//! [`crate::state::transition`] decides; this module performs the I/O.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

use crate::packet::Packet;
use crate::session::{Session, SessionError, SessionRef, SessionTable};
use crate::socket::{Socket, SocketError};
use crate::state::{transition, Event, ReceiverState, StaleFinPolicy, Transition};
use crate::timer::TimerConfig;

/// Receiver settings.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub timer: TimerConfig,
    /// Directory in which received files are created.
    pub output_dir: PathBuf,
    pub stale_fin_policy: StaleFinPolicy,
    /// How often dead sessions are swept from the table (`None` disables the
    /// sweep; dead sessions are then only evicted by their next datagram).
    pub reap_interval: Option<Duration>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            timer: TimerConfig::default(),
            output_dir: PathBuf::from("."),
            stale_fin_policy: StaleFinPolicy::default(),
            reap_interval: Some(Duration::from_secs(60)),
        }
    }
}

/// Errors raised while executing one transition.  They abort the affected
/// session only.
#[derive(Debug, Error)]
enum TransitionError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("cannot send reply: {0}")]
    Reply(#[source] SocketError),
}

/// Point-in-time view of one session, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: ReceiverState,
    pub filename: Option<String>,
    pub bytes_written: u64,
    pub last_reply_flags: Option<u16>,
    pub timer_armed: bool,
    pub file_open: bool,
}

impl From<&Session> for SessionSnapshot {
    fn from(s: &Session) -> Self {
        Self {
            state: s.state,
            filename: s.filename.clone(),
            bytes_written: s.bytes_written,
            last_reply_flags: s.last_reply_flags,
            timer_armed: s.timer.is_armed(),
            file_open: s.has_open_file(),
        }
    }
}

/// The receiving side of the protocol, serving any number of peers.
#[derive(Debug)]
pub struct Receiver {
    socket: Socket,
    sessions: SessionTable,
    config: ReceiverConfig,
}

impl Receiver {
    /// Bind to `addr` and build a receiver around the socket.
    pub async fn bind(addr: SocketAddr, config: ReceiverConfig) -> Result<Arc<Self>, SocketError> {
        let socket = Socket::bind(addr).await?;
        Ok(Self::from_socket(socket, config))
    }

    /// Build a receiver around an already bound socket (for example one with
    /// a fault simulator attached).
    pub fn from_socket(socket: Socket, config: ReceiverConfig) -> Arc<Self> {
        Arc::new(Self {
            socket,
            sessions: SessionTable::new(),
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    /// Current view of the session for `peer`, if one exists.
    pub async fn snapshot(&self, peer: &SocketAddr) -> Option<SessionSnapshot> {
        let session = self.sessions.get(peer)?;
        let guard = session.lock().await;
        Some(SessionSnapshot::from(&*guard))
    }

    /// Serve datagrams until the socket fails.
    pub async fn run(self: Arc<Self>) -> Result<(), SocketError> {
        if let Some(every) = self.config.reap_interval {
            tokio::spawn(reap_loop(Arc::downgrade(&self), every));
        }
        log::info!(
            "waiting for senders on {} (output dir {})",
            self.local_addr(),
            self.config.output_dir.display()
        );

        loop {
            match self.socket.recv_from().await {
                Ok((packet, from)) => self.handle_datagram(from, packet).await,
                Err(SocketError::Packet { from, source }) => {
                    log::debug!("[net] discarding datagram from {from}: {source}");
                }
                Err(SocketError::Io(e)) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                    // ICMP port-unreachable from a peer that went away.
                    log::debug!("[net] ignoring connection reset: {e}");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Process one verified datagram from `from` to completion.
    pub async fn handle_datagram(self: &Arc<Self>, from: SocketAddr, packet: Packet) {
        let (session, mut guard) = self.checkout_live(from).await;

        log::debug!(
            "[net] {from} (state={}) flags={:#x} len={}",
            guard.state,
            packet.flags(),
            packet.header.length
        );

        let event = Event::classify(packet.flags());
        guard.last_packet = Some(packet);
        match event {
            Some(event) => self.apply(&session, &mut guard, event).await,
            None => log::debug!("[fsm] {from}: ignoring unrecognised flag combination"),
        }
    }

    /// Look up the session for `peer`, replacing a dead one with a fresh
    /// session.  Returns the session together with its held lock.
    async fn checkout_live(self: &Arc<Self>, peer: SocketAddr) -> (SessionRef, OwnedMutexGuard<Session>) {
        loop {
            let (session, created) = self.sessions.checkout(peer);
            let mut guard = session.clone().lock_owned().await;

            if guard.state.is_dead() {
                log::info!("[net] session {peer} is dead, evicting");
                drop(guard);
                self.sessions.evict(&peer, &session);
                continue;
            }
            if created {
                log::info!("[net] new session {peer}");
                // Reclaims a peer that never gets as far as a valid FILENAME.
                self.arm_timer(&session, &mut guard);
            }
            return (session, guard);
        }
    }

    /// Execute the transition for `event` on a locked session.
    async fn apply(self: &Arc<Self>, session: &SessionRef, s: &mut Session, event: Event) {
        let before = s.state;
        let decision = transition(before, event, self.config.stale_fin_policy);
        log::debug!("[fsm] {} {before} + {event} -> {decision:?}", s.peer);

        if let Err(e) = self.execute(session, s, event, decision).await {
            log::warn!("[fsm] {}: aborting session: {e}", s.peer);
            // A file that reached its final chunk is complete and stays.
            let cleanup = if before.is_closed() || s.state.is_closed() {
                s.release().await
            } else {
                s.release_and_remove().await
            };
            if let Err(e) = cleanup {
                log::warn!("[fsm] {}: cleanup failed: {e}", s.peer);
            }
            self.sessions.evict(&s.peer, session);
        }
    }

    async fn execute(
        self: &Arc<Self>,
        session: &SessionRef,
        s: &mut Session,
        event: Event,
        decision: Transition,
    ) -> Result<(), TransitionError> {
        let payload = match (&s.last_packet, event) {
            (Some(packet), e) if e != Event::Timeout => packet.payload.clone(),
            _ => Vec::new(),
        };

        match decision {
            Transition::OpenFile { next, reply } => {
                s.open(&self.config.output_dir, &payload).await?;
                s.state = next;
                self.reply(session, s, reply).await
            }
            Transition::Accept { next, reply } => {
                s.append(&payload).await?;
                s.state = next;
                log::debug!(
                    "[fsm] {}: wrote {} bytes ({} total), now {next}",
                    s.peer,
                    payload.len(),
                    s.bytes_written
                );
                if next.is_closed() {
                    log::info!(
                        "[fsm] {}: final chunk received, {:?} complete ({} bytes)",
                        s.peer,
                        s.filename.as_deref().unwrap_or_default(),
                        s.bytes_written
                    );
                }
                self.reply(session, s, reply).await
            }
            Transition::ResendAck => match s.last_reply_flags {
                Some(flags) => {
                    log::debug!("[fsm] {}: duplicate {event}, resending ACK {flags:#x}", s.peer);
                    self.reply(session, s, flags).await
                }
                None => Ok(()),
            },
            Transition::Delete => {
                log::info!(
                    "[fsm] {}: closing session, keeping {:?}",
                    s.peer,
                    s.filename.as_deref().unwrap_or_default()
                );
                s.release().await?;
                self.forget_unless_timeout(session, s, event);
                Ok(())
            }
            Transition::DeleteAndRemoveFile => {
                log::info!("[fsm] {}: {event} in {} tears the session down", s.peer, s.state);
                s.release_and_remove().await?;
                self.forget_unless_timeout(session, s, event);
                Ok(())
            }
            Transition::NoOp => Ok(()),
        }
    }

    /// A teardown caused by a datagram removes the session at once; one caused
    /// by a timeout leaves the dead marker for the next datagram or the reaper.
    fn forget_unless_timeout(&self, session: &SessionRef, s: &Session, event: Event) {
        if event != Event::Timeout {
            self.sessions.evict(&s.peer, session);
        }
    }

    /// Send one ACK carrying `flags`, remember it and re-arm the timer.
    async fn reply(
        self: &Arc<Self>,
        session: &SessionRef,
        s: &mut Session,
        flags: u16,
    ) -> Result<(), TransitionError> {
        s.last_reply_flags = Some(flags);
        self.arm_timer(session, s);
        self.socket
            .send_to(&Packet::ack(flags), s.peer)
            .await
            .map_err(TransitionError::Reply)?;
        log::debug!("[net] ACK flags={flags:#x} sent to {}", s.peer);
        Ok(())
    }

    fn arm_timer(self: &Arc<Self>, session: &SessionRef, s: &mut Session) {
        let receiver = Arc::downgrade(self);
        let target = Arc::downgrade(session);
        s.timer.arm(self.config.timer.session_timeout, move |generation| {
            on_timeout(receiver, target, generation)
        });
    }
}

/// Body of every session timer.
async fn on_timeout(receiver: Weak<Receiver>, session: Weak<tokio::sync::Mutex<Session>>, generation: u64) {
    let (Some(receiver), Some(session)) = (receiver.upgrade(), session.upgrade()) else {
        return;
    };
    let mut guard = session.lock().await;
    if !guard.timer.claim(generation) {
        // Superseded by a re-arm or cancel that won the lock first.
        return;
    }
    log::info!("[timer] {} timed out in state {}", guard.peer, guard.state);
    receiver.apply(&session, &mut guard, Event::Timeout).await;
}

async fn reap_loop(receiver: Weak<Receiver>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(receiver) = receiver.upgrade() else {
            return;
        };
        let reaped = receiver.sessions.reap_dead();
        if reaped > 0 {
            log::debug!("[table] reaped {reaped} dead session(s)");
        }
    }
}

//! Receiver-side per-peer sessions and the table that owns them.
//!
//! A [`Session`] holds everything the receiver knows about one remote
//! endpoint: its FSM state, the destination file, the last packet seen, the
//! flags of the last reply (for idempotent ACK resends) and its single
//! pending timer.  Sessions live behind their own async mutex so that every
//! transition for one peer, whether triggered by a datagram or by a timer, is
//! serialized.
//!
//! The [`SessionTable`] maps endpoints to sessions.  Its own lock is held only
//! for insert / lookup / remove; FSM execution happens after checkout.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::packet::Packet;
use crate::state::ReceiverState;
use crate::timer::SessionTimer;

/// Local resource faults while serving one session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("filename {0:?} is empty or refers to a directory")]
    InvalidFilename(String),
    #[error("cannot create {}: {source}", .path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot remove {}: {source}", .path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no destination file is open")]
    NotOpen,
}

/// Turn the raw filename bytes from a FILENAME packet into a name that stays
/// inside the output directory.
///
/// Path separators (`/` and `\`) become `.`; names that would still refer to
/// a directory (`""`, `"."`, `".."`) are rejected.
pub fn sanitize_filename(raw: &[u8]) -> Result<String, SessionError> {
    let name: String = String::from_utf8_lossy(raw)
        .chars()
        .map(|c| if c == '/' || c == '\\' { '.' } else { c })
        .collect();
    match name.as_str() {
        "" | "." | ".." => Err(SessionError::InvalidFilename(name)),
        _ => Ok(name),
    }
}

/// Receiver state for one remote endpoint.
#[derive(Debug)]
pub struct Session {
    pub peer: SocketAddr,
    pub state: ReceiverState,
    /// Sanitized filename, set once by the FILENAME packet.
    pub filename: Option<String>,
    /// Where the file lives on disk.
    pub path: Option<PathBuf>,
    /// Most recent verified packet from the peer.
    pub last_packet: Option<Packet>,
    /// Flags of the last reply sent, replayed by ACK resends.
    pub last_reply_flags: Option<u16>,
    /// Payload bytes persisted so far.
    pub bytes_written: u64,
    /// The session's single pending timeout.
    pub timer: SessionTimer,
    file: Option<File>,
}

impl Session {
    /// A fresh session in [`ReceiverState::WaitFilename`].
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            state: ReceiverState::WaitFilename,
            filename: None,
            path: None,
            last_packet: None,
            last_reply_flags: None,
            bytes_written: 0,
            timer: SessionTimer::default(),
            file: None,
        }
    }

    /// `true` while the destination file handle is held.
    pub fn has_open_file(&self) -> bool {
        self.file.is_some()
    }

    /// Create the destination file named by `raw_name` inside `output_dir`.
    ///
    /// An existing file of the same name is truncated.
    pub async fn open(&mut self, output_dir: &Path, raw_name: &[u8]) -> Result<(), SessionError> {
        let filename = sanitize_filename(raw_name)?;
        let path = output_dir.join(&filename);
        let file = File::create(&path).await.map_err(|source| SessionError::Create {
            path: path.clone(),
            source,
        })?;

        log::info!("[session {}] receiving {filename:?} into {}", self.peer, path.display());
        self.filename = Some(filename);
        self.path = Some(path);
        self.file = Some(file);
        Ok(())
    }

    /// Append `payload` to the file and make it durable before returning.
    pub async fn append(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        let (Some(file), Some(path)) = (self.file.as_mut(), self.path.as_ref()) else {
            return Err(SessionError::NotOpen);
        };
        let write_err = |source| SessionError::Write {
            path: path.clone(),
            source,
        };

        file.write_all(payload).await.map_err(write_err)?;
        file.flush().await.map_err(write_err)?;
        file.sync_data().await.map_err(write_err)?;
        self.bytes_written += payload.len() as u64;
        Ok(())
    }

    /// Tear the session down, keeping the file.
    ///
    /// Cancels the timer, syncs and closes the file and marks the session
    /// [`ReceiverState::Dead`].  Safe to call more than once.
    pub async fn release(&mut self) -> Result<(), SessionError> {
        self.timer.cancel();
        self.state = ReceiverState::Dead;

        if let Some(mut file) = self.file.take() {
            let path = self.path.clone().unwrap_or_default();
            file.flush().await.map_err(|source| SessionError::Write {
                path: path.clone(),
                source,
            })?;
            file.sync_all()
                .await
                .map_err(|source| SessionError::Write { path, source })?;
        }
        Ok(())
    }

    /// Tear the session down and delete the partially written file.
    pub async fn release_and_remove(&mut self) -> Result<(), SessionError> {
        self.timer.cancel();
        self.state = ReceiverState::Dead;
        // Close the handle before unlinking.
        drop(self.file.take());

        if let Some(path) = self.path.take() {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => log::info!("[session {}] removed partial file {}", self.peer, path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(SessionError::Remove { path, source }),
            }
        }
        Ok(())
    }
}

/// Shared handle to one session.
pub type SessionRef = Arc<tokio::sync::Mutex<Session>>;

/// All sessions, keyed by remote endpoint.
#[derive(Debug, Default)]
pub struct SessionTable {
    inner: Mutex<HashMap<SocketAddr, SessionRef>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<SocketAddr, SessionRef>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the session for `peer`, creating it if absent.
    ///
    /// The flag is `true` when a new session was created.
    pub fn checkout(&self, peer: SocketAddr) -> (SessionRef, bool) {
        let mut map = self.map();
        if let Some(existing) = map.get(&peer) {
            return (existing.clone(), false);
        }
        let session = Arc::new(tokio::sync::Mutex::new(Session::new(peer)));
        map.insert(peer, session.clone());
        (session, true)
    }

    pub fn get(&self, peer: &SocketAddr) -> Option<SessionRef> {
        self.map().get(peer).cloned()
    }

    pub fn remove(&self, peer: &SocketAddr) -> Option<SessionRef> {
        self.map().remove(peer)
    }

    /// Remove `peer` only if it still maps to `session`.
    ///
    /// Guards against evicting a newer session that replaced the one the
    /// caller was looking at.
    pub fn evict(&self, peer: &SocketAddr, session: &SessionRef) -> bool {
        let mut map = self.map();
        match map.get(peer) {
            Some(current) if Arc::ptr_eq(current, session) => {
                map.remove(peer);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }

    /// Evict every session marked dead.  Returns how many were removed.
    ///
    /// Sessions busy with a transition are skipped and picked up next time.
    pub fn reap_dead(&self) -> usize {
        let snapshot: Vec<(SocketAddr, SessionRef)> =
            self.map().iter().map(|(k, v)| (*k, v.clone())).collect();

        let mut reaped = 0;
        for (peer, session) in snapshot {
            let dead = session.try_lock().is_ok_and(|s| s.state.is_dead());
            if dead && self.evict(&peer, &session) {
                log::debug!("[table] reaped dead session {peer}");
                reaped += 1;
            }
        }
        reaped
    }
}

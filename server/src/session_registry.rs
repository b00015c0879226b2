//! Session registry and the login handoff mailbox.
//!
//! This module owns everything that session tasks mutate concurrently:
//! - the live session table, keyed by session id
//! - the handoff table, where the login center deposits credentials ahead of
//!   a player's connection
//! - cumulative traffic counters for [`NetworkStats`]
//!
//! Both tables are `scc::HashMap`s, so unrelated connects and disconnects
//! never contend on a single lock. The tick driver only ever reads from here
//! or sends through sessions; it never waits on a connection.

use crate::error::RegistryError;
use crate::session::{HandoffInfo, Session, SessionId};
use crate::time_system::{TimeContext, TimeSubscriber};
use chrono::NaiveDateTime;
use log::{debug, info, warn};
use realm_shared::Packet;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Point-in-time traffic snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub active_sessions: usize,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

pub struct SessionRegistry {
    sessions: scc::HashMap<SessionId, Arc<Session>>,
    handoffs: scc::HashMap<u32, HandoffInfo>,
    next_session_id: AtomicU32,
    /// Reserved seats, including registrations still in flight.
    occupied: AtomicUsize,
    max_sessions: usize,
    handoff_timeout: Duration,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize, handoff_timeout: Duration) -> Self {
        Self {
            sessions: scc::HashMap::new(),
            handoffs: scc::HashMap::new(),
            next_session_id: AtomicU32::new(1),
            occupied: AtomicUsize::new(0),
            max_sessions,
            handoff_timeout,
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    /// Hands out the next sequential session id, starting at 1.
    pub fn next_session_id(&self) -> SessionId {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Adds a session to the table.
    ///
    /// Fails if the server is full or the id is already taken; the caller is
    /// expected to close the connection in either case.
    pub fn register(&self, session: Arc<Session>) -> Result<(), RegistryError> {
        let reserved = self.occupied.fetch_add(1, Ordering::AcqRel);
        if reserved >= self.max_sessions {
            self.occupied.fetch_sub(1, Ordering::AcqRel);
            return Err(RegistryError::AtCapacity(self.max_sessions));
        }

        let id = session.id;
        let addr = session.addr;
        if self.sessions.insert_sync(id, session).is_err() {
            self.occupied.fetch_sub(1, Ordering::AcqRel);
            return Err(RegistryError::DuplicateSession(id));
        }

        info!("Session {} registered from {}", id, addr);
        Ok(())
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read_sync(&id, |_, session| session.clone())
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.read_sync(&id, |_, _| ()).is_some()
    }

    /// Drops a session from the table. Only the first call for a given id
    /// returns it.
    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove_sync(&id)?;
        self.occupied.fetch_sub(1, Ordering::AcqRel);
        info!("Session {} removed", id);
        Some(session)
    }

    /// Removes and closes a session. A second call is a no-op returning false.
    pub fn disconnect(&self, id: SessionId) -> bool {
        match self.remove(id) {
            Some(session) => {
                session.close();
                true
            }
            None => {
                debug!("Disconnect for session {} ignored, already gone", id);
                false
            }
        }
    }

    /// Tells the peer why, then closes. The session's own task removes it.
    pub fn kick(&self, id: SessionId, reason: &str) -> bool {
        let Some(session) = self.get(id) else {
            return false;
        };
        session.send(Packet::Disconnected {
            reason: reason.to_string(),
        });
        session.close();
        true
    }

    pub fn kick_all(&self, reason: &str) -> usize {
        let mut kicked = 0;
        self.sessions.iter_sync(|_, session| {
            session.send(Packet::Disconnected {
                reason: reason.to_string(),
            });
            session.close();
            kicked += 1;
            true
        });
        kicked
    }

    /// Removes and closes every session.
    pub fn disconnect_all(&self) -> usize {
        let mut ids = Vec::new();
        self.sessions.iter_sync(|id, _| {
            ids.push(*id);
            true
        });
        ids.into_iter().filter(|id| self.disconnect(*id)).count()
    }

    /// Sends to every session that has completed the handshake.
    pub fn broadcast(&self, packet: &Packet) -> usize {
        let mut delivered = 0;
        self.sessions.iter_sync(|_, session| {
            if session.is_authenticated() && session.send(packet.clone()) {
                delivered += 1;
            }
            true
        });
        delivered
    }

    pub fn send_to(&self, id: SessionId, packet: Packet) -> bool {
        self.sessions
            .read_sync(&id, |_, session| session.send(packet.clone()))
            .unwrap_or(false)
    }

    /// Deposits credentials for a login that is about to connect. A second
    /// deposit for the same login replaces the first.
    pub fn add_handoff_info(&self, login_id: u32, info: HandoffInfo) {
        debug!("Handoff deposited for login {} ({})", login_id, info.account);
        if self.handoffs.upsert_sync(login_id, info).is_some() {
            warn!("Replaced pending handoff for login {}", login_id);
        }
    }

    pub fn get_handoff_info(&self, login_id: u32) -> Option<HandoffInfo> {
        self.handoffs.read_sync(&login_id, |_, info| info.clone())
    }

    /// Takes the entry out of the mailbox. Of several concurrent claims for
    /// the same login only one gets the entry.
    pub fn remove_handoff_info(&self, login_id: u32) -> Option<HandoffInfo> {
        self.handoffs.remove_sync(&login_id).map(|(_, info)| info)
    }

    pub fn handoff_timeout(&self) -> Duration {
        self.handoff_timeout
    }

    pub fn pending_handoffs(&self) -> usize {
        self.handoffs.len()
    }

    /// Drops every handoff older than the configured timeout.
    pub fn purge_expired_handoffs(&self, now: Instant) -> usize {
        let timeout = self.handoff_timeout;
        let mut purged = 0;
        self.handoffs.retain_sync(|login_id, info| {
            let expired = info.is_expired(now, timeout);
            if expired {
                info!(
                    "Handoff for login {} ({}) expired unclaimed",
                    login_id, info.account
                );
                purged += 1;
            }
            !expired
        });
        purged
    }

    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            active_sessions: self.sessions.len(),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Sweeps stale handoff entries on every minute boundary.
pub struct HandoffSweeper {
    registry: Arc<SessionRegistry>,
}

impl HandoffSweeper {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }
}

impl TimeSubscriber for HandoffSweeper {
    fn on_minute_changed(&mut self, _now: NaiveDateTime, ctx: &mut TimeContext<'_>) {
        let purged = self.registry.purge_expired_handoffs(ctx.instant());
        if purged > 0 {
            debug!("Purged {} expired handoffs", purged);
        }
    }
}

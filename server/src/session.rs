//! One connected peer, as seen from the rest of the server.
//!
//! A [`Session`] is shared between its connection tasks and the registry.
//! Outgoing packets go through an unbounded queue drained by the session's
//! writer task, so sending never blocks the tick.

use log::{debug, trace};
use realm_shared::Packet;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

pub type SessionId = u32;

/// Identity a session acquires by completing the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub login_id: u32,
    pub account: String,
    pub character_name: String,
}

#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub addr: SocketAddr,
    pub connected_at: Instant,
    cancel_token: CancellationToken,
    outgoing: UnboundedSender<Packet>,
    login: OnceLock<Login>,
}

impl Session {
    /// Creates the session and the receiving half of its outgoing queue.
    pub fn new(
        id: SessionId,
        addr: SocketAddr,
        cancel_token: CancellationToken,
    ) -> (Self, UnboundedReceiver<Packet>) {
        let (outgoing, recv) = mpsc::unbounded_channel();
        let session = Self {
            id,
            addr,
            connected_at: Instant::now(),
            cancel_token,
            outgoing,
            login: OnceLock::new(),
        };
        (session, recv)
    }

    /// Queues a packet for the writer task. Returns false once the writer is
    /// gone.
    pub fn send(&self, packet: Packet) -> bool {
        match self.outgoing.send(packet) {
            Ok(()) => true,
            Err(_) => {
                trace!("Dropped packet for closed session {}", self.id);
                false
            }
        }
    }

    /// Asks the connection tasks to wind down. Queued packets are still
    /// flushed by the writer before it exits.
    pub fn close(&self) {
        if !self.cancel_token.is_cancelled() {
            debug!("Closing session {} ({})", self.id, self.addr);
        }
        self.cancel_token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// Attaches the login identity. A session authenticates at most once.
    pub fn authenticate(&self, login: Login) -> bool {
        self.login.set(login).is_ok()
    }

    pub fn login(&self) -> Option<&Login> {
        self.login.get()
    }

    pub fn is_authenticated(&self) -> bool {
        self.login.get().is_some()
    }
}

/// Credentials deposited by the login center ahead of a player's
/// connection, keyed by login id in the registry.
#[derive(Debug, Clone)]
pub struct HandoffInfo {
    pub account: String,
    pub character_name: String,
    pub auth_token: Vec<u8>,
    pub deposited_at: Instant,
}

impl HandoffInfo {
    pub fn new(account: String, character_name: String, auth_token: Vec<u8>) -> Self {
        Self {
            account,
            character_name,
            auth_token,
            deposited_at: Instant::now(),
        }
    }

    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.deposited_at) >= timeout
    }

    pub fn token_matches(&self, token: &[u8]) -> bool {
        !self.auth_token.is_empty() && self.auth_token == token
    }
}

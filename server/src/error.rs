//! Error types for the server core.

use crate::entity::EntityId;
use crate::process::{ProcessId, ProcessKind};
use crate::session::SessionId;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EntityError {
    /// A reference was released more times than it was acquired.
    #[error("reference count underflow on slot {slot} (entity {entity:?})")]
    ReferenceUnderflow { slot: u32, entity: Option<EntityId> },
    #[error("slot {slot} is out of range")]
    UnknownSlot { slot: u32 },
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("process {id} ({kind:?}) failed: {reason}")]
    Failed {
        id: ProcessId,
        kind: ProcessKind,
        reason: String,
    },
    #[error("process {id} ({kind:?}) is missing its text parameter")]
    MissingText { id: ProcessId, kind: ProcessKind },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session {0} is already registered")]
    DuplicateSession(SessionId),
    #[error("session capacity of {0} reached")]
    AtCapacity(usize),
}

/// Why a session's processing task gave up on its peer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("protocol version {got} is not supported (expected {expected})")]
    ProtocolVersion { expected: u32, got: u32 },
    #[error("no pending login {0}")]
    UnknownLogin(u32),
    #[error("authorization failed for login {0}")]
    BadToken(u32),
    #[error("login {0} handoff expired")]
    HandoffExpired(u32),
    #[error("already authenticated")]
    AlreadyAuthenticated,
    #[error("{0} requires a completed handshake")]
    NotAuthenticated(&'static str),
    #[error("handoff deposit from untrusted peer {0}")]
    UntrustedDeposit(IpAddr),
    #[error("unexpected {0} packet from client")]
    UnexpectedPacket(&'static str),
    #[error("chat message of {0} bytes is too long")]
    ChatTooLong(usize),
    #[error("world is not accepting events")]
    WorldUnavailable,
}

impl SessionError {
    /// Handshake failures are answered with `Rejected`, everything else with
    /// `Disconnected`.
    pub fn is_handshake_failure(&self) -> bool {
        matches!(
            self,
            SessionError::ProtocolVersion { .. }
                | SessionError::UnknownLogin(_)
                | SessionError::BadToken(_)
                | SessionError::HandoffExpired(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("world initialization failed: {0}")]
    WorldInit(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("tick task ended abnormally: {0}")]
    TickTask(#[from] tokio::task::JoinError),
}

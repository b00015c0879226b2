//! Wire protocol shared by the realm server, its probe client and the
//! center service link.
//!
//! Every message travels as a single frame: a 4-byte big-endian payload
//! length followed by a bincode-encoded [`Packet`]. Frames larger than
//! [`MAX_FRAME_LEN`] are refused before any payload is read, so a peer
//! cannot make the server allocate arbitrary buffers.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_PORT: u16 = 8080;
pub const MAX_FRAME_LEN: usize = 64 * 1024;
pub const FRAME_HEADER_LEN: usize = 4;

pub const WORLD_WIDTH: f32 = 4096.0;
pub const WORLD_HEIGHT: f32 = 4096.0;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    // Client -> server
    Hello {
        protocol_version: u32,
        login_id: u32,
        auth_token: Vec<u8>,
    },
    Move {
        dx: f32,
        dy: f32,
    },
    Chat {
        text: String,
    },
    Ping {
        timestamp: u64,
    },
    Disconnect,

    // Center service -> server
    DepositHandoff {
        login_id: u32,
        account: String,
        character_name: String,
        auth_token: Vec<u8>,
    },

    // Server -> client
    Welcome {
        session_id: u32,
        entity_id: u64,
        character_name: String,
    },
    Rejected {
        reason: String,
    },
    Pong {
        timestamp: u64,
    },
    Notice {
        text: String,
    },
    ChatRelay {
        from: String,
        text: String,
    },
    GameTime {
        bucket: u8,
    },
    EntityState {
        entity_id: u64,
        x: f32,
        y: f32,
    },
    Disconnected {
        reason: String,
    },
}

/// Failures while moving frames on or off a stream.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    Oversized { len: usize, max: usize },
    #[error("malformed payload: {0}")]
    Malformed(#[from] bincode::Error),
}

/// Serializes a packet into a complete frame (header included).
pub fn encode_frame(packet: &Packet) -> Result<Vec<u8>, FrameError> {
    let payload = bincode::serialize(packet)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::Oversized {
            len: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Writes one packet and flushes. Returns the number of bytes put on the wire.
pub async fn write_frame<W>(writer: &mut W, packet: &Packet) -> Result<usize, FrameError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(packet)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(frame.len())
}

/// Reads one packet.
///
/// Returns `Ok(None)` when the peer closed the stream on a frame
/// boundary, which is how a graceful disconnect looks from this side.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<(Packet, usize)>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if len > MAX_FRAME_LEN {
        return Err(FrameError::Oversized {
            len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    let packet = bincode::deserialize(&payload)?;
    Ok(Some((packet, FRAME_HEADER_LEN + len)))
}

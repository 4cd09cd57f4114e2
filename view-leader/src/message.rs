use std::time::Duration;

use bincode::Options;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};

use crate::error::SessionError;

/// Upper bound on a single frame's payload.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

pub type RequestId = u64;

/// Little-endian fixed-width integers; a frame must hold exactly one request.
fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// A client request as it travels over the wire (bincode encoded).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Request {
    pub request_id: RequestId,
    pub command: Command,
}

/// Variant order is part of the wire format: bincode encodes the variant
/// index, so new commands must be appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Command {
    Heartbeat { identity: String, port: String },
    QueryServers,
    LockGet { name: String, client_id: String },
    LockRelease { name: String, client_id: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Status {
    Ok,
    Forbidden,
    Retry,
    Granted,
}

/// The view leader's reply (JSON encoded).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum Response {
    Executed {
        request_id: RequestId,
        status: Status,
    },
    QueryServersResponse {
        request_id: RequestId,
        epoch: u64,
        servers: Vec<String>,
    },
}

impl Request {
    pub fn new(request_id: RequestId, command: Command) -> Self {
        Self {
            request_id,
            command,
        }
    }

    pub fn encode(&self) -> bincode::Result<Vec<u8>> {
        wire_options().serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> bincode::Result<Self> {
        wire_options().deserialize(bytes)
    }
}

impl Response {
    pub fn executed(request_id: RequestId, status: Status) -> Self {
        Self::Executed { request_id, status }
    }

    pub fn request_id(&self) -> RequestId {
        match self {
            Response::Executed { request_id, .. }
            | Response::QueryServersResponse { request_id, .. } => *request_id,
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// Reads one length-prefixed frame, giving up after `limit`.
///
/// Frames are a 4-byte big-endian length followed by exactly that many
/// payload bytes. Oversized prefixes are rejected before allocating.
pub async fn read_frame<R>(reader: &mut R, limit: Duration) -> Result<Vec<u8>, SessionError>
where
    R: AsyncRead + Unpin,
{
    timeout(limit, read_length_prefixed(reader))
        .await
        .map_err(|_| SessionError::ReceiveTimeout(limit))?
}

async fn read_length_prefixed<R>(reader: &mut R) -> Result<Vec<u8>, SessionError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(SessionError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Writes `payload` as one length-prefixed frame, giving up after `limit`.
pub async fn write_frame<W>(
    writer: &mut W,
    payload: &[u8],
    limit: Duration,
) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(SessionError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }

    let write = async {
        writer.write_u32(payload.len() as u32).await?;
        writer.write_all(payload).await?;
        writer.flush().await
    };
    timeout(limit, write)
        .await
        .map_err(|_| SessionError::SendTimeout(limit))??;
    Ok(())
}

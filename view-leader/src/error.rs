use std::{io, time::Duration};

use thiserror::Error;

/// Reasons a single client session is abandoned.
///
/// None of these are fatal to the server: the session task logs the error and
/// drops its connection.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("timed out after {0:?} waiting for a frame")]
    ReceiveTimeout(Duration),
    #[error("timed out after {0:?} sending a frame")]
    SendTimeout(Duration),
    #[error("failed to decode request: {0}")]
    Decode(bincode::Error),
    #[error("failed to encode response: {0}")]
    Encode(serde_json::Error),
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum BindError {
    #[error("port range {start}..={end} is empty")]
    EmptyRange { start: u16, end: u16 },
    #[error("no port available on {host} in {start}..={end}")]
    NoPortAvailable { host: String, start: u16, end: u16 },
}

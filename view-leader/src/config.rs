use std::{ops::RangeInclusive, time::Duration};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT_START: u16 = 39000;
pub const DEFAULT_PORT_END: u16 = 39010;

/// How long a server may go without an accepted heartbeat before it is
/// considered expired.
pub const LIVENESS_WINDOW: Duration = Duration::from_secs(30);

pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Inclusive range of TCP ports the view leader may listen on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn single(port: u16) -> Self {
        Self::new(port, port)
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn ports(&self) -> RangeInclusive<u16> {
        self.start..=self.end
    }
}

/// Runtime knobs for the server side of the service.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bound on waiting for a client's request frame.
    pub receive_timeout: Duration,
    /// Bound on writing the response frame back.
    pub send_timeout: Duration,
    pub liveness_window: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            receive_timeout: RECEIVE_TIMEOUT,
            send_timeout: SEND_TIMEOUT,
            liveness_window: LIVENESS_WINDOW,
        }
    }
}

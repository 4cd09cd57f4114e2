use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::config::{
    DEFAULT_HOST, DEFAULT_PORT_END, DEFAULT_PORT_START, PortRange, ServerConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the view leader on the first free port in the range.
    Serve(ServeArgs),
    /// Send a single heartbeat.
    Heartbeat(HeartbeatArgs),
    /// Print the current epoch and the active servers.
    Query(ConnectArgs),
    /// Try once to take a lock.
    LockGet(LockArgs),
    /// Release a lock held by this client.
    LockRelease(LockArgs),
    /// Take a lock, retrying with backoff while it is busy.
    Acquire(AcquireArgs),
    /// Heartbeat periodically until expired or interrupted.
    Worker(WorkerArgs),
}

#[derive(Args, Debug, Clone)]
pub struct EndpointArgs {
    /// Host the view leader listens on.
    #[arg(long, default_value = DEFAULT_HOST)]
    pub host: String,

    /// First port of the view leader's port range. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = DEFAULT_PORT_START)]
    pub port_start: u16,

    /// Last port of the view leader's port range (inclusive).
    #[arg(long, default_value_t = DEFAULT_PORT_END)]
    pub port_end: u16,
}

impl EndpointArgs {
    pub fn port_range(&self) -> PortRange {
        PortRange::new(self.port_start, self.port_end)
    }
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub endpoint: EndpointArgs,

    /// How long to wait for a client's request.
    #[arg(long, default_value_t = 5000)]
    pub receive_timeout_ms: u64,

    /// How long to wait while sending a response.
    #[arg(long, default_value_t = 5000)]
    pub send_timeout_ms: u64,

    /// Seconds without a heartbeat before a server is considered expired.
    #[arg(long, default_value_t = 30)]
    pub liveness_window_secs: u64,
}

impl ServeArgs {
    pub fn config(&self) -> ServerConfig {
        ServerConfig {
            receive_timeout: Duration::from_millis(self.receive_timeout_ms),
            send_timeout: Duration::from_millis(self.send_timeout_ms),
            liveness_window: Duration::from_secs(self.liveness_window_secs),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    #[command(flatten)]
    pub endpoint: EndpointArgs,

    /// Per-request connect, send and receive timeout.
    #[arg(long, default_value_t = 5000)]
    pub timeout_ms: u64,
}

impl ConnectArgs {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Args, Debug, Clone)]
pub struct HeartbeatArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Identity the worker registers under.
    #[arg(long)]
    pub identity: String,

    /// Port the worker serves on.
    #[arg(long)]
    pub port: String,
}

#[derive(Args, Debug, Clone)]
pub struct LockArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Name of the lock.
    #[arg(long)]
    pub name: String,

    /// Client identifier. A fresh one is generated and printed when omitted.
    #[arg(long)]
    pub client: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct AcquireArgs {
    #[command(flatten)]
    pub lock: LockArgs,

    /// Number of lock requests before giving up.
    #[arg(long, default_value_t = 10)]
    pub attempts: u32,
}

#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Identity to heartbeat under. A fresh one is generated when omitted.
    #[arg(long)]
    pub identity: Option<String>,

    /// Port the worker serves on.
    #[arg(long)]
    pub port: String,

    /// Seconds between heartbeats; keep it well under the liveness window.
    #[arg(long, default_value_t = 10)]
    pub interval_secs: u64,
}

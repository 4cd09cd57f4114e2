//! A single-process view leader: membership, epochs and named locks.
//!
//! Worker servers heartbeat to the leader, which tracks which of them are
//! alive and bumps an epoch whenever that view changes. Clients query the
//! view and compete for exclusive named locks. Each module has one job:
//!
//! - [`state`] is the coordination state machine (heartbeats, epoch, locks)
//!   and the event logged for every command.
//! - [`leader`] shares that state between connections and applies each
//!   command as one serialized transaction.
//! - [`server`] binds a port from a range, accepts TCP connections and
//!   serves one request per connection under receive and send timeouts.
//! - [`message`] defines the wire types (bincode requests, JSON responses)
//!   and the length-prefixed framing used in both directions.
//! - [`client`] is a small client library plus the worker heartbeat loop.
//! - [`cli`] and [`config`] hold command-line parsing and defaults.
//!
//! All state is in memory and lives as long as the process.

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod leader;
pub mod message;
pub mod server;
pub mod state;

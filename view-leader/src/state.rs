//! The coordination state machine.
//!
//! [`ViewState`] owns the heartbeat table, the epoch counter and the lock
//! table. Every command is applied by [`ViewState::apply`], which mutates the
//! state in place and reports the single [`Event`] describing what happened.
//! Time is passed in explicitly so expiry is deterministic under test.

use std::{
    collections::{BTreeMap, HashMap, hash_map::Entry},
    net::SocketAddr,
    time::{Duration, Instant},
};

use tracing::{info, warn};

use crate::message::{Command, RequestId, Response, Status};

/// Liveness record for one worker identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCondition {
    /// Time of the last accepted heartbeat. Expired heartbeats leave it alone.
    pub last_heartbeat: Instant,
    pub is_active: bool,
    pub server_addr: SocketAddr,
}

/// Outcome of one command, logged once the transition is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ServerAdmitted {
        identity: String,
        addr: SocketAddr,
        port: String,
        epoch: u64,
    },
    HeartbeatReceived {
        identity: String,
        addr: SocketAddr,
    },
    HeartbeatExpired {
        identity: String,
        epoch: u64,
    },
    ServersQueried {
        epoch: u64,
        active: usize,
    },
    LockGranted {
        name: String,
        client_id: String,
    },
    LockBusy {
        name: String,
        holder: String,
        requester: String,
    },
    LockReleased {
        name: String,
        client_id: String,
    },
    ReleaseForbidden {
        name: String,
        holder: String,
        requester: String,
    },
    ReleaseUnheld {
        name: String,
        client_id: String,
    },
}

impl Event {
    pub fn emit(&self) {
        match self {
            Event::ServerAdmitted {
                identity,
                addr,
                port,
                epoch,
            } => info!(%identity, %addr, %port, epoch, "new server"),
            Event::HeartbeatReceived { identity, addr } => {
                info!(%identity, %addr, "heartbeat received")
            }
            Event::HeartbeatExpired { identity, epoch } => {
                warn!(%identity, epoch, "expired heartbeat")
            }
            Event::ServersQueried { epoch, active } => info!(epoch, active, "servers queried"),
            Event::LockGranted { name, client_id } => {
                info!(lock = %name, client = %client_id, "lock granted")
            }
            Event::LockBusy {
                name,
                holder,
                requester,
            } => info!(lock = %name, %holder, %requester, "lock busy, retry later"),
            Event::LockReleased { name, client_id } => {
                info!(lock = %name, client = %client_id, "lock released")
            }
            Event::ReleaseForbidden {
                name,
                holder,
                requester,
            } => info!(lock = %name, %holder, %requester, "release refused, not the holder"),
            Event::ReleaseUnheld { name, client_id } => {
                info!(lock = %name, client = %client_id, "release of a lock nobody holds")
            }
        }
    }
}

/// Result of applying one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub response: Response,
    pub event: Event,
}

/// Consistent copy of the externally visible state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewSnapshot {
    pub epoch: u64,
    /// Addresses of active servers, sorted.
    pub servers: Vec<String>,
    pub locks: BTreeMap<String, String>,
}

#[derive(Debug)]
pub struct ViewState {
    heartbeats: HashMap<String, ServerCondition>,
    epoch: u64,
    locks: HashMap<String, String>,
    liveness_window: Duration,
}

impl ViewState {
    pub fn new(liveness_window: Duration) -> Self {
        Self {
            heartbeats: HashMap::new(),
            epoch: 0,
            locks: HashMap::new(),
            liveness_window,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn condition(&self, identity: &str) -> Option<&ServerCondition> {
        self.heartbeats.get(identity)
    }

    pub fn holder(&self, name: &str) -> Option<&str> {
        self.locks.get(name).map(String::as_str)
    }

    /// Applies one command and returns the response together with the event
    /// to log for it.
    pub fn apply(
        &mut self,
        request_id: RequestId,
        command: Command,
        peer: SocketAddr,
        now: Instant,
    ) -> Transition {
        let (status, event) = match command {
            Command::Heartbeat { identity, port } => self.heartbeat(identity, port, peer, now),
            Command::QueryServers => return self.query_servers(request_id),
            Command::LockGet { name, client_id } => self.lock_get(name, client_id),
            Command::LockRelease { name, client_id } => self.lock_release(name, client_id),
        };

        Transition {
            response: Response::executed(request_id, status),
            event,
        }
    }

    fn heartbeat(
        &mut self,
        identity: String,
        port: String,
        peer: SocketAddr,
        now: Instant,
    ) -> (Status, Event) {
        let window = self.liveness_window;
        match self.heartbeats.entry(identity) {
            Entry::Vacant(slot) => {
                let identity = slot.key().clone();
                slot.insert(ServerCondition {
                    last_heartbeat: now,
                    is_active: true,
                    server_addr: peer,
                });
                self.epoch += 1;
                let event = Event::ServerAdmitted {
                    identity,
                    addr: peer,
                    port,
                    epoch: self.epoch,
                };
                (Status::Ok, event)
            }
            Entry::Occupied(mut slot) => {
                let condition = slot.get_mut();
                if condition.is_active
                    && now.saturating_duration_since(condition.last_heartbeat) < window
                {
                    condition.last_heartbeat = now;
                    let event = Event::HeartbeatReceived {
                        identity: slot.key().clone(),
                        addr: peer,
                    };
                    (Status::Ok, event)
                } else {
                    // The clock stays frozen so the identity can never revive itself.
                    condition.is_active = false;
                    self.epoch += 1;
                    let event = Event::HeartbeatExpired {
                        identity: slot.key().clone(),
                        epoch: self.epoch,
                    };
                    (Status::Forbidden, event)
                }
            }
        }
    }

    fn active_servers(&self) -> Vec<String> {
        self.heartbeats
            .values()
            .filter(|condition| condition.is_active)
            .map(|condition| condition.server_addr.to_string())
            .collect()
    }

    /// Epoch and server list come from the same borrow of the state.
    fn query_servers(&self, request_id: RequestId) -> Transition {
        let servers = self.active_servers();

        Transition {
            event: Event::ServersQueried {
                epoch: self.epoch,
                active: servers.len(),
            },
            response: Response::QueryServersResponse {
                request_id,
                epoch: self.epoch,
                servers,
            },
        }
    }

    fn lock_get(&mut self, name: String, client_id: String) -> (Status, Event) {
        // Re-entrant acquisition is contention like any other.
        if let Some(holder) = self.locks.get(&name) {
            let event = Event::LockBusy {
                holder: holder.clone(),
                name,
                requester: client_id,
            };
            return (Status::Retry, event);
        }

        self.locks.insert(name.clone(), client_id.clone());
        (Status::Granted, Event::LockGranted { name, client_id })
    }

    fn lock_release(&mut self, name: String, client_id: String) -> (Status, Event) {
        match self.locks.get(&name).cloned() {
            Some(holder) if holder == client_id => {
                self.locks.remove(&name);
                (Status::Ok, Event::LockReleased { name, client_id })
            }
            Some(holder) => {
                let event = Event::ReleaseForbidden {
                    name,
                    holder,
                    requester: client_id,
                };
                (Status::Forbidden, event)
            }
            None => (Status::Ok, Event::ReleaseUnheld { name, client_id }),
        }
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        let mut servers = self.active_servers();
        servers.sort();

        ViewSnapshot {
            epoch: self.epoch,
            servers,
            locks: self
                .locks
                .iter()
                .map(|(name, holder)| (name.clone(), holder.clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{Arc, Mutex},
    };

    use tracing_subscriber::{EnvFilter, fmt::MakeWriter};

    use super::*;
    use crate::config::LIVENESS_WINDOW;

    /// Collects formatted log output in memory.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().expect("log buffer").clone()).expect("utf-8 logs")
        }
    }

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("log buffer").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn heartbeat(identity: &str) -> Command {
        Command::Heartbeat {
            identity: identity.into(),
            port: "9001".into(),
        }
    }

    fn lock_get(name: &str, client: &str) -> Command {
        Command::LockGet {
            name: name.into(),
            client_id: client.into(),
        }
    }

    fn lock_release(name: &str, client: &str) -> Command {
        Command::LockRelease {
            name: name.into(),
            client_id: client.into(),
        }
    }

    fn status_of(transition: &Transition) -> Status {
        match transition.response {
            Response::Executed { status, .. } => status,
            ref other => panic!("expected Executed, got {other:?}"),
        }
    }

    #[test]
    fn unknown_identity_is_admitted_and_bumps_epoch() {
        let mut state = ViewState::new(LIVENESS_WINDOW);
        let now = Instant::now();

        let transition = state.apply(1, heartbeat("s1"), peer(5000), now);

        assert_eq!(transition.response, Response::executed(1, Status::Ok));
        assert!(matches!(
            transition.event,
            Event::ServerAdmitted { ref identity, epoch: 1, .. } if identity == "s1"
        ));
        assert_eq!(state.epoch(), 1);
        let condition = state.condition("s1").expect("entry created");
        assert!(condition.is_active);
        assert_eq!(condition.last_heartbeat, now);
        assert_eq!(condition.server_addr, peer(5000));
    }

    #[test]
    fn fresh_heartbeat_refreshes_without_epoch_change() {
        let mut state = ViewState::new(LIVENESS_WINDOW);
        let start = Instant::now();
        state.apply(1, heartbeat("s1"), peer(5000), start);

        let later = start + Duration::from_secs(29);
        let transition = state.apply(2, heartbeat("s1"), peer(5000), later);

        assert_eq!(status_of(&transition), Status::Ok);
        assert!(matches!(transition.event, Event::HeartbeatReceived { .. }));
        assert_eq!(state.epoch(), 1);
        assert_eq!(state.condition("s1").map(|c| c.last_heartbeat), Some(later));
    }

    #[test]
    fn heartbeat_at_window_boundary_expires() {
        let mut state = ViewState::new(LIVENESS_WINDOW);
        let start = Instant::now();
        state.apply(1, heartbeat("s1"), peer(5000), start);

        let transition = state.apply(2, heartbeat("s1"), peer(5000), start + LIVENESS_WINDOW);

        assert_eq!(status_of(&transition), Status::Forbidden);
        assert!(matches!(
            transition.event,
            Event::HeartbeatExpired { epoch: 2, .. }
        ));
        let condition = state.condition("s1").expect("entry kept");
        assert!(!condition.is_active);
        assert_eq!(condition.last_heartbeat, start);
        assert_eq!(state.epoch(), 2);
    }

    #[test]
    fn inactive_identity_stays_forbidden_and_keeps_bumping_epoch() {
        let mut state = ViewState::new(LIVENESS_WINDOW);
        let start = Instant::now();
        state.apply(1, heartbeat("s1"), peer(5000), start);
        let expired_at = start + Duration::from_secs(45);
        state.apply(2, heartbeat("s1"), peer(5000), expired_at);

        for (offset, request_id) in [(1, 3), (2, 4)] {
            let now = expired_at + Duration::from_secs(offset);
            let transition = state.apply(request_id, heartbeat("s1"), peer(5000), now);
            assert_eq!(status_of(&transition), Status::Forbidden);
        }

        assert_eq!(state.epoch(), 4);
        assert_eq!(state.condition("s1").map(|c| c.last_heartbeat), Some(start));
    }

    #[test]
    fn query_lists_only_active_servers_with_current_epoch() {
        let mut state = ViewState::new(LIVENESS_WINDOW);
        let start = Instant::now();
        state.apply(1, heartbeat("s1"), peer(5001), start);
        state.apply(2, heartbeat("s2"), peer(5002), start);
        state.apply(3, heartbeat("s1"), peer(5001), start + Duration::from_secs(31));

        let transition = state.apply(4, Command::QueryServers, peer(6000), start);

        assert_eq!(
            transition.response,
            Response::QueryServersResponse {
                request_id: 4,
                epoch: 3,
                servers: vec!["127.0.0.1:5002".into()],
            }
        );
        assert_eq!(
            transition.event,
            Event::ServersQueried {
                epoch: 3,
                active: 1
            }
        );
    }

    #[test]
    fn held_lock_answers_retry_even_for_its_holder() {
        let mut state = ViewState::new(LIVENESS_WINDOW);
        let now = Instant::now();

        assert_eq!(
            status_of(&state.apply(1, lock_get("build", "c1"), peer(1), now)),
            Status::Granted
        );
        assert_eq!(
            status_of(&state.apply(2, lock_get("build", "c1"), peer(1), now)),
            Status::Retry
        );
        let contended = state.apply(3, lock_get("build", "c2"), peer(2), now);
        assert_eq!(status_of(&contended), Status::Retry);
        assert_eq!(
            contended.event,
            Event::LockBusy {
                name: "build".into(),
                holder: "c1".into(),
                requester: "c2".into(),
            }
        );
        assert_eq!(state.holder("build"), Some("c1"));
    }

    #[test]
    fn only_the_holder_may_release() {
        let mut state = ViewState::new(LIVENESS_WINDOW);
        let now = Instant::now();
        state.apply(1, lock_get("build", "a"), peer(1), now);

        let refused = state.apply(2, lock_release("build", "b"), peer(2), now);
        assert_eq!(status_of(&refused), Status::Forbidden);
        assert!(matches!(refused.event, Event::ReleaseForbidden { .. }));
        assert_eq!(state.holder("build"), Some("a"));

        let released = state.apply(3, lock_release("build", "a"), peer(1), now);
        assert_eq!(status_of(&released), Status::Ok);
        assert_eq!(state.holder("build"), None);
    }

    #[test]
    fn releasing_a_free_lock_is_a_no_op() {
        let mut state = ViewState::new(LIVENESS_WINDOW);
        let transition = state.apply(1, lock_release("ghost", "c9"), peer(1), Instant::now());

        assert_eq!(status_of(&transition), Status::Ok);
        assert_eq!(
            transition.event,
            Event::ReleaseUnheld {
                name: "ghost".into(),
                client_id: "c9".into(),
            }
        );
        assert!(state.snapshot().locks.is_empty());
    }

    #[test]
    fn lock_commands_leave_epoch_alone() {
        let mut state = ViewState::new(LIVENESS_WINDOW);
        let now = Instant::now();
        state.apply(1, lock_get("x", "a"), peer(1), now);
        state.apply(2, lock_release("x", "a"), peer(1), now);
        state.apply(3, Command::QueryServers, peer(1), now);
        assert_eq!(state.epoch(), 0);
    }

    #[test]
    fn scenario_from_registration_to_lock_handoff() {
        let mut state = ViewState::new(LIVENESS_WINDOW);
        let now = Instant::now();
        let worker = peer(9001);

        assert_eq!(status_of(&state.apply(1, heartbeat("s1"), worker, now)), Status::Ok);
        assert_eq!(state.epoch(), 1);

        let query = state.apply(2, Command::QueryServers, peer(7000), now);
        assert_eq!(
            query.response,
            Response::QueryServersResponse {
                request_id: 2,
                epoch: 1,
                servers: vec![worker.to_string()],
            }
        );

        let steps = [
            (lock_get("build", "c1"), Status::Granted),
            (lock_get("build", "c2"), Status::Retry),
            (lock_release("build", "c2"), Status::Forbidden),
            (lock_release("build", "c1"), Status::Ok),
            (lock_get("build", "c2"), Status::Granted),
        ];
        for (request_id, (command, expected)) in (3..).zip(steps) {
            let transition = state.apply(request_id, command, peer(7000), now);
            assert_eq!(transition.response, Response::executed(request_id, expected));
        }
        assert_eq!(state.holder("build"), Some("c2"));
    }

    #[test]
    fn every_outcome_is_logged_at_the_default_level() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("info"))
            .with_writer(logs.clone())
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let mut state = ViewState::new(LIVENESS_WINDOW);
            let start = Instant::now();
            let commands = [
                heartbeat("s1"),
                heartbeat("s1"),
                Command::QueryServers,
                lock_get("build", "c1"),
                lock_get("build", "c2"),
                lock_release("build", "c2"),
                lock_release("build", "c1"),
                lock_release("build", "c1"),
            ];
            for (request_id, command) in (1..).zip(commands) {
                state.apply(request_id, command, peer(5000), start).event.emit();
            }
            state
                .apply(9, heartbeat("s1"), peer(5000), start + LIVENESS_WINDOW)
                .event
                .emit();
        });

        let output = logs.contents();
        for message in [
            "new server",
            "heartbeat received",
            "servers queried",
            "lock granted",
            "lock busy",
            "release refused",
            "lock released",
            "release of a lock nobody holds",
            "expired heartbeat",
        ] {
            assert!(output.contains(message), "missing {message:?} in:\n{output}");
        }
        assert_eq!(output.lines().count(), 9);
    }
}

use std::{net::SocketAddr, time::Instant};

use tokio::sync::Mutex;

use crate::{
    config::ServerConfig,
    message::{Request, Response},
    state::{Transition, ViewSnapshot, ViewState},
};

/// Shared handle on the coordination state.
///
/// Every command runs as one critical section over the heartbeat table, the
/// epoch and the lock table together, so commands are serialized. The event
/// for a command is logged inside that same critical section, after the
/// transition has been applied, which keeps the log in commit order.
pub struct ViewLeader {
    state: Mutex<ViewState>,
}

impl ViewLeader {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            state: Mutex::new(ViewState::new(config.liveness_window)),
        }
    }

    pub async fn process(&self, request: Request, peer: SocketAddr) -> Response {
        let mut state = self.state.lock().await;
        // Read the clock only once the guard is held so accepted heartbeat
        // times never move backwards.
        let now = Instant::now();
        commit(&mut state, request, peer, now)
    }

    /// Like [`ViewLeader::process`] but evaluated at a caller-chosen instant.
    pub async fn process_at(&self, request: Request, peer: SocketAddr, now: Instant) -> Response {
        let mut state = self.state.lock().await;
        commit(&mut state, request, peer, now)
    }

    pub async fn snapshot(&self) -> ViewSnapshot {
        self.state.lock().await.snapshot()
    }
}

fn commit(state: &mut ViewState, request: Request, peer: SocketAddr, now: Instant) -> Response {
    let Transition { response, event } =
        state.apply(request.request_id, request.command, peer, now);
    event.emit();
    response
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::message::{Command, Status};

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn concurrent_admissions_bump_epoch_once_each() {
        let leader = Arc::new(ViewLeader::new(&ServerConfig::default()));

        let tasks: Vec<_> = (0..32u16)
            .map(|i| {
                let leader = Arc::clone(&leader);
                tokio::spawn(async move {
                    let command = Command::Heartbeat {
                        identity: format!("server-{i}"),
                        port: "9000".into(),
                    };
                    leader.process(Request::new(i.into(), command), peer(i)).await
                })
            })
            .collect();

        for task in tasks {
            let response = task.await.expect("task panicked");
            assert!(matches!(
                response,
                Response::Executed {
                    status: Status::Ok,
                    ..
                }
            ));
        }

        let snapshot = leader.snapshot().await;
        assert_eq!(snapshot.epoch, 32);
        assert_eq!(snapshot.servers.len(), 32);
    }

    #[tokio::test]
    async fn contended_lock_is_granted_exactly_once() {
        let leader = Arc::new(ViewLeader::new(&ServerConfig::default()));

        let tasks: Vec<_> = (0..16u16)
            .map(|i| {
                let leader = Arc::clone(&leader);
                tokio::spawn(async move {
                    let command = Command::LockGet {
                        name: "build".into(),
                        client_id: format!("client-{i}"),
                    };
                    leader.process(Request::new(i.into(), command), peer(i)).await
                })
            })
            .collect();

        let mut granted = 0;
        for task in tasks {
            if let Response::Executed {
                status: Status::Granted,
                ..
            } = task.await.expect("task panicked")
            {
                granted += 1;
            }
        }

        assert_eq!(granted, 1);
        assert_eq!(leader.snapshot().await.locks.len(), 1);
    }

    #[tokio::test]
    async fn injected_clock_drives_expiry() {
        let leader = ViewLeader::new(&ServerConfig {
            liveness_window: Duration::from_secs(10),
            ..ServerConfig::default()
        });
        let start = Instant::now();
        let heartbeat = || {
            Request::new(
                1,
                Command::Heartbeat {
                    identity: "s1".into(),
                    port: "9001".into(),
                },
            )
        };

        leader.process_at(heartbeat(), peer(1), start).await;
        let response = leader
            .process_at(heartbeat(), peer(1), start + Duration::from_secs(10))
            .await;

        assert_eq!(response, Response::executed(1, Status::Forbidden));
        let snapshot = leader.snapshot().await;
        assert_eq!(snapshot.epoch, 2);
        assert!(snapshot.servers.is_empty());
    }
}

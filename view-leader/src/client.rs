use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use rand::Rng;
use tokio::{net::TcpStream, select, time::timeout};
use tracing::{debug, info, warn};

use crate::{
    config::PortRange,
    message::{Command, Request, RequestId, Response, Status, read_frame, write_frame},
};

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(2);

/// Epoch and active membership as reported by the view leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerView {
    pub epoch: u64,
    pub servers: Vec<String>,
}

/// Talks to a view leader somewhere in a port range.
///
/// The server answers one request per connection, so every call opens a
/// fresh connection.
pub struct ViewLeaderClient {
    host: String,
    ports: PortRange,
    timeout: Duration,
    next_request_id: RequestId,
}

impl ViewLeaderClient {
    pub fn new(host: impl Into<String>, ports: PortRange, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            ports,
            timeout,
            next_request_id: 1,
        }
    }

    async fn connect(&self) -> Result<TcpStream> {
        for port in self.ports.ports() {
            match timeout(self.timeout, TcpStream::connect((self.host.as_str(), port))).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(err)) => debug!(port, error = %err, "connect failed"),
                Err(_) => debug!(port, "connect timed out"),
            }
        }

        bail!(
            "no view leader reachable on {} ports {}..={}",
            self.host,
            self.ports.start,
            self.ports.end
        )
    }

    /// Sends one command and waits for the matching response.
    pub async fn send(&mut self, command: Command) -> Result<Response> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let mut stream = self.connect().await?;
        let payload = Request::new(request_id, command)
            .encode()
            .context("failed to encode request")?;
        write_frame(&mut stream, &payload, self.timeout)
            .await
            .context("failed to send request")?;
        let frame = read_frame(&mut stream, self.timeout)
            .await
            .context("no response from view leader")?;
        let response = Response::decode(&frame).context("failed to decode response")?;

        ensure!(
            response.request_id() == request_id,
            "response is for request {}, expected {request_id}",
            response.request_id()
        );
        Ok(response)
    }

    async fn send_expecting_status(&mut self, command: Command) -> Result<Status> {
        match self.send(command).await? {
            Response::Executed { status, .. } => Ok(status),
            other => Err(anyhow!("unexpected response: {other:?}")),
        }
    }

    pub async fn heartbeat(&mut self, identity: &str, port: &str) -> Result<Status> {
        self.send_expecting_status(Command::Heartbeat {
            identity: identity.to_string(),
            port: port.to_string(),
        })
        .await
    }

    pub async fn query_servers(&mut self) -> Result<ServerView> {
        match self.send(Command::QueryServers).await? {
            Response::QueryServersResponse { epoch, servers, .. } => {
                Ok(ServerView { epoch, servers })
            }
            other => Err(anyhow!("unexpected response: {other:?}")),
        }
    }

    pub async fn lock_get(&mut self, name: &str, client_id: &str) -> Result<Status> {
        self.send_expecting_status(Command::LockGet {
            name: name.to_string(),
            client_id: client_id.to_string(),
        })
        .await
    }

    pub async fn lock_release(&mut self, name: &str, client_id: &str) -> Result<Status> {
        self.send_expecting_status(Command::LockRelease {
            name: name.to_string(),
            client_id: client_id.to_string(),
        })
        .await
    }

    /// Asks for `name` until it is granted, backing off with jitter between
    /// `Retry` answers. Returns `false` if every attempt was refused.
    pub async fn acquire(&mut self, name: &str, client_id: &str, attempts: u32) -> Result<bool> {
        for attempt in 0..attempts {
            match self.lock_get(name, client_id).await? {
                Status::Granted => return Ok(true),
                Status::Retry => {
                    let delay = backoff(attempt);
                    debug!(lock = %name, attempt, ?delay, "lock busy, backing off");
                    tokio::time::sleep(delay).await;
                }
                other => bail!("unexpected status {other:?} for lock {name}"),
            }
        }
        Ok(false)
    }
}

fn backoff(attempt: u32) -> Duration {
    let exponential = BACKOFF_BASE.saturating_mul(1 << attempt.min(5));
    let capped = exponential.min(BACKOFF_CAP);
    let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 2);
    capped / 2 + Duration::from_millis(jitter_ms)
}

/// Heartbeats under `identity` every `interval` until the leader answers
/// `Forbidden` or Ctrl-C is pressed. Transport failures are logged and the
/// next beat is tried as usual.
pub async fn run_worker(
    client: &mut ViewLeaderClient,
    identity: &str,
    port: &str,
    interval: Duration,
) -> Result<()> {
    info!(%identity, %port, "worker heartbeating");

    loop {
        match client.heartbeat(identity, port).await {
            Ok(Status::Ok) => debug!(%identity, "heartbeat accepted"),
            Ok(Status::Forbidden) => {
                warn!(%identity, "heartbeat rejected as expired; re-register under a new identity");
                return Ok(());
            }
            Ok(other) => warn!(%identity, status = ?other, "unexpected heartbeat status"),
            Err(err) => warn!(%identity, error = ?err, "heartbeat failed"),
        }

        select! {
            _ = tokio::time::sleep(interval) => {}
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_stays_within_cap() {
        for attempt in 0..20 {
            let delay = backoff(attempt);
            assert!(delay <= BACKOFF_CAP, "attempt {attempt} waited {delay:?}");
            assert!(delay >= BACKOFF_BASE / 2);
        }
    }

    #[tokio::test]
    async fn unreachable_leader_is_reported() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        drop(listener);

        let mut client =
            ViewLeaderClient::new("127.0.0.1", PortRange::single(port), Duration::from_millis(200));
        assert!(client.query_servers().await.is_err());
    }
}

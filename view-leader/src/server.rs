use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{debug, info, warn};

use crate::{
    config::{PortRange, ServerConfig},
    error::{BindError, SessionError},
    leader::ViewLeader,
    message::{Request, read_frame, write_frame},
};

/// Binds the first port in `range` that is free on `host`.
pub async fn bind_in_range(host: &str, range: PortRange) -> Result<TcpListener, BindError> {
    if range.is_empty() {
        return Err(BindError::EmptyRange {
            start: range.start,
            end: range.end,
        });
    }

    for port in range.ports() {
        match TcpListener::bind((host, port)).await {
            Ok(listener) => return Ok(listener),
            Err(err) => debug!(port, error = %err, "port unavailable"),
        }
    }

    Err(BindError::NoPortAvailable {
        host: host.to_string(),
        start: range.start,
        end: range.end,
    })
}

pub struct Server {
    listener: TcpListener,
    leader: Arc<ViewLeader>,
    config: ServerConfig,
}

impl Server {
    pub fn new(listener: TcpListener, config: ServerConfig) -> Self {
        Self {
            listener,
            leader: Arc::new(ViewLeader::new(&config)),
            config,
        }
    }

    pub fn leader(&self) -> Arc<ViewLeader> {
        Arc::clone(&self.leader)
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` resolves. Sessions already in
    /// flight are left to finish on their own.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            leader,
            config,
        } = self;
        let config = Arc::new(config);
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("view leader shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &leader, &config);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    leader: &Arc<ViewLeader>,
    config: &Arc<ServerConfig>,
) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, leader, config),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    leader: &Arc<ViewLeader>,
    config: &Arc<ServerConfig>,
) {
    let leader = Arc::clone(leader);
    let config = Arc::clone(config);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, peer, &leader, &config).await {
            warn!(peer = %peer, error = %err, "connection abandoned");
        }
    });
}

/// Serves exactly one request on `stream`. The connection is closed when the
/// stream is dropped, whether or not a response was sent.
async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    leader: &ViewLeader,
    config: &ServerConfig,
) -> Result<(), SessionError> {
    let frame = read_frame(&mut stream, config.receive_timeout).await?;
    let request = Request::decode(&frame).map_err(SessionError::Decode)?;

    let response = leader.process(request, peer).await;

    let payload = response.encode().map_err(SessionError::Encode)?;
    write_frame(&mut stream, &payload, config.send_timeout).await
}

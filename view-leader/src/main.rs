use std::io::IsTerminal;

use anyhow::{Context, Result};
use clap::Parser;
use nanoid::nanoid;
use tracing::{info, warn};

use view_leader::{
    cli::{AcquireArgs, Cli, Command, ConnectArgs, LockArgs, ServeArgs, WorkerArgs},
    client::{self, ViewLeaderClient},
    server::{self, Server},
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::stdout().is_terminal())
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await?,
        Command::Heartbeat(args) => {
            let mut client = connect(&args.connect);
            let status = client.heartbeat(&args.identity, &args.port).await?;
            println!("{status:?}");
        }
        Command::Query(args) => {
            let view = connect(&args).query_servers().await?;
            println!("epoch {}", view.epoch);
            for server in view.servers {
                println!("{server}");
            }
        }
        Command::LockGet(args) => {
            let client_id = client_id(&args);
            let status = connect(&args.connect).lock_get(&args.name, &client_id).await?;
            println!("{status:?}");
        }
        Command::LockRelease(args) => {
            let client_id = client_id(&args);
            let status = connect(&args.connect)
                .lock_release(&args.name, &client_id)
                .await?;
            println!("{status:?}");
        }
        Command::Acquire(args) => acquire(args).await?,
        Command::Worker(args) => worker(args).await?,
    }

    Ok(())
}

async fn serve(args: ServeArgs) -> Result<()> {
    let range = args.endpoint.port_range();
    let listener = server::bind_in_range(&args.endpoint.host, range)
        .await
        .context("failed to start view leader")?;
    let server = Server::new(listener, args.config());
    let addr = server.local_addr()?;
    info!("view leader listening on {}", addr);
    if let Err(err) = server.run_until_ctrl_c().await {
        warn!("view leader exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}

async fn acquire(args: AcquireArgs) -> Result<()> {
    let client_id = client_id(&args.lock);
    let mut client = connect(&args.lock.connect);
    if client.acquire(&args.lock.name, &client_id, args.attempts).await? {
        println!("Granted");
    } else {
        println!("Retry");
    }
    Ok(())
}

async fn worker(args: WorkerArgs) -> Result<()> {
    let identity = args.identity.clone().unwrap_or_else(|| nanoid!());
    println!("identity {identity}");
    let mut client = connect(&args.connect);
    let interval = std::time::Duration::from_secs(args.interval_secs);
    client::run_worker(&mut client, &identity, &args.port, interval).await
}

fn connect(args: &ConnectArgs) -> ViewLeaderClient {
    ViewLeaderClient::new(
        args.endpoint.host.clone(),
        args.endpoint.port_range(),
        args.timeout(),
    )
}

/// Uses the given client id, or generates one and prints it so the caller
/// can release the lock later.
fn client_id(args: &LockArgs) -> String {
    match &args.client {
        Some(id) => id.clone(),
        None => {
            let id = nanoid!();
            println!("client {id}");
            id
        }
    }
}

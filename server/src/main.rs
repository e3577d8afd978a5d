//! Bolorama server entry point: configuration, context construction,
//! shutdown wiring, and the top-level task spawn.

use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use server::config::Config;
use server::ports::{PortAllocator, FIRST_PLAYER_PORT, MAX_PLAYERS};
use server::state::{ServerContext, ServerState};
use server::{relay, stats, tracker, util};

/// Any datagram on this port requests a graceful shutdown, in addition
/// to SIGINT/SIGTERM.
const SHUTDOWN_PORT: u16 = 49999;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to the configuration file
    #[clap(short, long, default_value = "config.txt")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Warning: RUST_LOG environment variable not set. Set it to display logs!");
        eprintln!("Recommended: RUST_LOG=info bolorama");
    }

    let args = Args::parse();
    let config = Config::load(&args.config)?;
    let proxy_ip = util::get_outbound_ip()?;

    info!("Hostname: {}", config.hostname);
    info!("IP Address: {}", proxy_ip);

    let shutdown = CancellationToken::new();
    let tasks = TaskTracker::new();

    let tracker_socket = Arc::new(UdpSocket::bind(("0.0.0.0", config.tracker_port)).await?);

    let (ingress_tx, ingress_rx) = mpsc::unbounded_channel();
    let (pong_tx, pong_rx) = mpsc::unbounded_channel();
    let (start_ping_tx, start_ping_rx) = mpsc::unbounded_channel();
    let (stats_tx, stats_rx) = stats::channel();

    let ctx = Arc::new(ServerContext {
        state: RwLock::new(ServerState::new(
            PortAllocator::new(FIRST_PLAYER_PORT, MAX_PLAYERS),
            stats_tx,
        )),
        proxy_ip,
        hostname: config.hostname.clone(),
        tracker_port: config.tracker_port,
        tracker_socket,
        ingress_tx,
        player_pong_tx: pong_tx,
        start_player_ping_tx: start_ping_tx,
        shutdown: shutdown.clone(),
        tasks: tasks.clone(),
        debug: config.debug,
        game_info_ping_interval: config.game_info_ping_interval,
        player_timeout: config.player_timeout,
    });

    spawn_signal_handler(ctx.clone());
    tasks.spawn(shutdown_listener(ctx.clone()));
    tasks.spawn(debug_listener(ctx.clone(), config.tracker_debug_port));

    let pool = if config.enable_statistics {
        Some(stats::init_database(&config.database_filename).await?)
    } else {
        None
    };
    tasks.spawn(stats::logger(ctx.clone(), stats_rx, pool));

    tasks.spawn(tracker::run(ctx.clone(), start_ping_rx, pong_rx));

    relay::run(ctx.clone(), ingress_rx).await;

    tasks.close();
    tasks.wait().await;
    info!("Shutdown completed");

    Ok(())
}

fn spawn_signal_handler(ctx: Arc<ServerContext>) {
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                error!("cannot install SIGTERM handler: {}", err);
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
            _ = ctx.shutdown.cancelled() => return,
        }

        info!("Shutdown requested by signal");
        ctx.shutdown.cancel();
    });
}

/// Fires the shutdown token when anything arrives on the shutdown port.
async fn shutdown_listener(ctx: Arc<ServerContext>) {
    let socket = match UdpSocket::bind(("0.0.0.0", SHUTDOWN_PORT)).await {
        Ok(socket) => socket,
        Err(err) => {
            error!("failed to bind shutdown port {}: {}", SHUTDOWN_PORT, err);
            return;
        }
    };

    let mut buffer = [0u8; 16];
    tokio::select! {
        _ = ctx.shutdown.cancelled() => {}
        result = socket.recv_from(&mut buffer) => {
            if let Ok((_, addr)) = result {
                info!("Shutdown requested via UDP port {} by {}", SHUTDOWN_PORT, addr);
                ctx.shutdown.cancel();
            }
        }
    }
}

/// Answers any datagram on the diagnostic port with the player table.
async fn debug_listener(ctx: Arc<ServerContext>, port: u16) {
    let socket = match UdpSocket::bind(("0.0.0.0", port)).await {
        Ok(socket) => socket,
        Err(err) => {
            error!("failed to bind debug port {}: {}", port, err);
            return;
        }
    };

    let mut buffer = [0u8; 64];
    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            result = socket.recv_from(&mut buffer) => match result {
                Ok((_, addr)) => {
                    let table = ctx.state.read().await.sprint_server_state("\n");
                    let _ = socket.send_to(table.as_bytes(), addr).await;
                }
                Err(_) => break,
            }
        }
    }
}

//! The tracker.
//!
//! Three subordinate tasks share the well-known port: a UDP intake that
//! feeds game-info advertisements (and liveness) into the tracker loop,
//! a TCP server that answers every connection with the current tracker
//! text, and the liveness monitor that turns silence into timeouts. The
//! tracker loop itself owns game-info ingestion, keepalive scheduling
//! and timeout-driven eviction.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use log::{debug, error, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::interval_at;
use tokio_util::task::TaskTracker;

use shared::game_info::{self, parse_packet_game_info, rewrite_packet_game_info};
use shared::packet::{
    self, PACKET_TYPE_GAME_INFO, PACKET_TYPE_NAT_PROBE_REPLY,
};
use shared::MAX_UDP_PACKET_SIZE;

use crate::route::UdpPacket;
use crate::state::{Player, PlayerAddr, ServerContext};
use crate::text;

/// Runs the tracker until shutdown.
///
/// `start_ping_rx` carries players created elsewhere (the relay
/// dispatcher) whose keepalives start here; `pong_rx` carries liveness
/// refreshes from every part of the server.
pub async fn run(
    ctx: Arc<ServerContext>,
    mut start_ping_rx: UnboundedReceiver<Player>,
    pong_rx: UnboundedReceiver<PlayerAddr>,
) {
    let (udp_tx, mut udp_rx) = mpsc::unbounded_channel();
    let (tcp_tx, mut tcp_rx) = mpsc::unbounded_channel();
    let (timeout_tx, mut timeout_rx) = mpsc::unbounded_channel();

    ctx.tasks.spawn(udp_listener(ctx.clone(), udp_tx));
    ctx.tasks.spawn(tcp_listener(ctx.clone(), tcp_tx));
    ctx.tasks.spawn(ping_timeout(ctx.clone(), pong_rx, timeout_tx));

    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            Some(packet) = udp_rx.recv() => {
                handle_udp_packet(&ctx, packet).await;
            }
            Some(conn) = tcp_rx.recv() => {
                handle_tcp_request(&ctx, conn).await;
            }
            Some(player) = start_ping_rx.recv() => {
                let _ = ctx.player_pong_tx.send(player.player_addr());
                spawn_keepalive(&ctx, &player);
            }
            Some(player_addr) = timeout_rx.recv() => {
                info!("Player timed out: {}", player_addr.addr);
                let mut state = ctx.state.write().await;
                state.player_delete(&player_addr);
                info!("\n{}", state.sprint_server_state("\n"));
            }
        }
    }

    info!("Stopped tracker");
}

/// Receive loop on the tracker's UDP socket.
async fn udp_listener(ctx: Arc<ServerContext>, udp_tx: UnboundedSender<UdpPacket>) {
    let socket = ctx.tracker_socket.clone();
    let mut buffer = [0u8; MAX_UDP_PACKET_SIZE];

    info!("Listening on UDP port {}", ctx.tracker_port);

    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            result = socket.recv_from(&mut buffer) => match result {
                Ok((len, addr)) => {
                    let packet = UdpPacket {
                        src_addr: addr,
                        dst_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
                        dst_port: ctx.tracker_port,
                        buffer: buffer[..len].to_vec(),
                    };
                    if udp_tx.send(packet).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    if !ctx.shutdown.is_cancelled() {
                        warn!("receive error on UDP port {}: {}", ctx.tracker_port, err);
                    }
                    break;
                }
            }
        }
    }

    info!("Stopped listening on UDP port {}", ctx.tracker_port);
}

/// Accept loop on the tracker's TCP port. Connections are handed to the
/// tracker loop, which renders and writes the text.
async fn tcp_listener(ctx: Arc<ServerContext>, tcp_tx: UnboundedSender<TcpStream>) {
    let listener = match TcpListener::bind(("0.0.0.0", ctx.tracker_port)).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind TCP port {}: {}", ctx.tracker_port, err);
            ctx.shutdown.cancel();
            return;
        }
    };

    info!("Listening on TCP port {}", ctx.tracker_port);

    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            result = listener.accept() => match result {
                Ok((conn, _)) => {
                    if tcp_tx.send(conn).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    if !ctx.shutdown.is_cancelled() {
                        warn!("accept error on TCP port {}: {}", ctx.tracker_port, err);
                    }
                    break;
                }
            }
        }
    }

    info!("Stopped listening on TCP port {}", ctx.tracker_port);
}

async fn handle_tcp_request(ctx: &ServerContext, mut conn: TcpStream) {
    let text = {
        let state = ctx.state.read().await;
        text::tracker_text(&state, &ctx.hostname)
    };
    if let Err(err) = conn.write_all(text.as_bytes()).await {
        debug!("failed to write tracker text: {}", err);
    }
    // Dropping the stream closes the connection.
}

async fn handle_udp_packet(ctx: &ServerContext, packet: UdpPacket) {
    // Any datagram from a live player counts as a pong.
    {
        let state = ctx.state.read().await;
        if let Ok(player) = state.player_get_by_addr(packet.src_addr) {
            let _ = ctx.player_pong_tx.send(player.player_addr());
        }
    }

    handle_game_info_packet(ctx, packet).await;
}

/// Ingests a datagram from the tracker port: probe replies confirm that
/// the source's NAT still maps the tracker port, game-info packets
/// create or refresh games and register their senders.
pub async fn handle_game_info_packet(ctx: &ServerContext, mut packet: UdpPacket) {
    if packet::validate_packet(&packet.buffer).is_err() {
        // Skip non-Bolo traffic.
        return;
    }

    let packet_type = packet::packet_type(&packet.buffer);

    if packet_type == PACKET_TYPE_NAT_PROBE_REPLY {
        let mut state = ctx.state.write().await;
        if let Ok(player) = state.player_get_by_addr(packet.src_addr) {
            if player.nat_port != ctx.tracker_port {
                state.player_set_nat_port(&player.player_addr(), ctx.tracker_port);
                debug!(
                    "player {} NAT mapping confirmed on tracker port",
                    player.addr
                );
            }
        }
        return;
    }

    if packet_type != PACKET_TYPE_GAME_INFO {
        // Everything except probe replies and game info is ignored here.
        return;
    }

    if let Err(err) = rewrite_packet_game_info(&mut packet.buffer, ctx.proxy_ip) {
        debug!("dropping game info from {}: {}", packet.src_addr, err);
        return;
    }
    let new_info = match parse_packet_game_info(&packet.buffer) {
        Ok(info) => info,
        Err(err) => {
            debug!("dropping game info from {}: {}", packet.src_addr, err);
            return;
        }
    };

    let mut state = ctx.state.write().await;

    let new_game = !state.games.contains_key(&new_info.game_id);
    let mut info = new_info;
    if let Some(existing) = state.games.get(&info.game_id) {
        // First observation wins; updates never reset the game's age.
        info.server_start_timestamp = existing.server_start_timestamp;
    } else {
        info!(
            "New game {} on map {:?} ({})",
            info.game_id,
            info.map_name,
            format_game_start(&info)
        );
    }
    state.games.insert(info.game_id, info.clone());

    match state.player_get_by_addr(packet.src_addr) {
        Ok(player) => {
            if player.game_id != info.game_id {
                state.player_join_game(player.proxy_port, info.game_id);
            }
            if player.nat_port != ctx.tracker_port {
                state.player_set_nat_port(&player.player_addr(), ctx.tracker_port);
            }
        }
        Err(_) => {
            let player = match state.player_new(ctx, packet.src_addr, info.game_id, ctx.tracker_port)
            {
                Ok(player) => player,
                Err(err) => {
                    warn!("cannot create player for {}: {}", packet.src_addr, err);
                    return;
                }
            };
            let _ = ctx.player_pong_tx.send(player.player_addr());
            spawn_keepalive(ctx, &player);
            if new_game {
                // The advertising player hosts the game; hosts own slot 0.
                state.player_set_id(&player.player_addr(), 0);
            }
            state.game_update_player_count(info.game_id);
            info!("\n{}", state.sprint_server_state("\n"));
        }
    }
}

fn format_game_start(info: &shared::GameInfo) -> String {
    let start = game_info::parse_bolo_timestamp(info.start_timestamp);
    match start.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(elapsed) => format!("started at unix {}", elapsed.as_secs()),
        Err(_) => "started before the epoch".to_string(),
    }
}

/// Starts the per-player keepalive: a type-D datagram from the tracker
/// socket every ping interval, until the player disconnects.
pub fn spawn_keepalive(ctx: &ServerContext, player: &Player) {
    spawn_keepalive_on(
        &ctx.tasks,
        ctx.tracker_socket.clone(),
        ctx.game_info_ping_interval,
        player,
    );
}

fn spawn_keepalive_on(
    tasks: &TaskTracker,
    socket: Arc<UdpSocket>,
    ping_interval: Duration,
    player: &Player,
) {
    let disconnect = player.disconnect.clone();
    let addr = player.addr;
    let proxy_port = player.proxy_port;

    tasks.spawn(async move {
        let start = tokio::time::Instant::now() + ping_interval;
        let mut ticker = interval_at(start, ping_interval);

        loop {
            tokio::select! {
                _ = disconnect.cancelled() => break,
                _ = ticker.tick() => {
                    let buffer = packet::marshal_keepalive();
                    if let Err(err) = socket.send_to(&buffer, addr).await {
                        warn!("keepalive to {} failed: {}", addr, err);
                    }
                }
            }
        }

        debug!("Stopped pinging player {}", proxy_port);
    });
}

/// The liveness monitor: records pongs, scans every quarter timeout, and
/// reports players whose last pong is older than the timeout.
async fn ping_timeout(
    ctx: Arc<ServerContext>,
    mut pong_rx: UnboundedReceiver<PlayerAddr>,
    timeout_tx: UnboundedSender<PlayerAddr>,
) {
    let timeout = ctx.player_timeout;
    let scan_interval = timeout / 4;
    let mut last_pong: HashMap<PlayerAddr, Instant> = HashMap::new();
    let start = tokio::time::Instant::now() + scan_interval;
    let mut ticker = interval_at(start, scan_interval);

    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            pong = pong_rx.recv() => match pong {
                Some(player_addr) => {
                    last_pong.insert(player_addr, Instant::now());
                }
                None => break,
            },
            _ = ticker.tick() => {
                let expired: Vec<PlayerAddr> = last_pong
                    .iter()
                    .filter(|(_, seen)| seen.elapsed() > timeout)
                    .map(|(player_addr, _)| *player_addr)
                    .collect();
                for player_addr in expired {
                    last_pong.remove(&player_addr);
                    if timeout_tx.send(player_addr).is_err() {
                        return;
                    }
                }
            }
        }
    }
}

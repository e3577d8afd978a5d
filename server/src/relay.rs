//! The relay dispatcher.
//!
//! Every datagram received on a proxy port lands here. The dispatcher
//! resolves the source and destination players, refreshes liveness,
//! drives the NAT-probe handshake that validates a forwarding path, and
//! finally rewrites and forwards the datagram — or holds it until the
//! path is proven.
//!
//! Steps that touch shared state run under a single write guard with no
//! await points; the rewrite and the egress push happen after the guard
//! is dropped. Processing stays sequential per dispatcher turn, which is
//! what preserves ordering between any one pair of players.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::UnboundedSender;

use shared::packet::{self, PACKET_TYPE_JOIN_GAME};
use shared::GameEvent;

use crate::route::UdpPacket;
use crate::state::{PlayerAddr, ServerContext, ServerState};
use crate::util;

/// How long a probe confirmation keeps a peer path valid.
pub const PEER_VALIDITY_WINDOW: Duration = Duration::from_secs(20);

/// A datagram cleared for forwarding: everything needed to rewrite it
/// and hand it to the sending player's egress after the lock is gone.
struct Forward {
    packet: UdpPacket,
    src_proxy_port: u16,
    src_player_addr: PlayerAddr,
    dst_addr: SocketAddr,
    egress: UnboundedSender<UdpPacket>,
}

/// Runs the dispatcher until shutdown. Packets from one source are
/// processed in arrival order; the ingress channel is the only way in.
pub async fn run(ctx: Arc<ServerContext>, mut ingress_rx: UnboundedReceiver<UdpPacket>) {
    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            packet = ingress_rx.recv() => match packet {
                Some(packet) => process_packet(&ctx, packet).await,
                None => break,
            }
        }
    }

    info!("Stopped relay dispatcher");
}

/// Handles one datagram received on a proxy port.
pub async fn process_packet(ctx: &ServerContext, packet: UdpPacket) {
    if let Err(err) = packet::validate_packet(&packet.buffer) {
        debug!("dropping datagram from {}: {}", packet.src_addr, err);
        return;
    }

    let forward = {
        let mut state = ctx.state.write().await;
        classify(ctx, &mut state, packet)
    };

    if let Some(forward) = forward {
        forward_packet(ctx, forward).await;
    }
}

/// Steps 2–8: state lookups, player creation, liveness, the probe
/// machine. Returns the forwarding decision; the caller performs the
/// rewrite and push once the lock is released.
fn classify(ctx: &ServerContext, state: &mut ServerState, packet: UdpPacket) -> Option<Forward> {
    // A datagram can only arrive on a port that is (or was) mapped; a
    // miss means the player was deleted a moment ago.
    let dst_player = match state.player_get_by_port(packet.dst_port) {
        Ok(player) => player,
        Err(err) => {
            debug!("dropping datagram from {}: {}", packet.src_addr, err);
            return None;
        }
    };

    let src_player = match state.player_get_by_addr(packet.src_addr) {
        Ok(player) => player,
        Err(_) => {
            // A never-seen source talking to a known proxy port joins the
            // destination's game; the port it used is the one its NAT
            // evidently maps.
            let player = match state.player_new(
                ctx,
                packet.src_addr,
                dst_player.game_id,
                dst_player.proxy_port,
            ) {
                Ok(player) => player,
                Err(err) => {
                    warn!("cannot create player for {}: {}", packet.src_addr, err);
                    return None;
                }
            };
            let _ = ctx.start_player_ping_tx.send(player.clone());
            info!(
                "New player {} routed via proxy port {}",
                player.addr, player.proxy_port
            );
            if ctx.debug {
                info!("\n{}", state.sprint_server_state("\n"));
            }
            player
        }
    };

    // Any received traffic refreshes liveness.
    let _ = ctx.player_pong_tx.send(src_player.player_addr());

    let packet_type = packet::packet_type(&packet.buffer);

    if packet_type == PACKET_TYPE_JOIN_GAME && src_player.game_id != dst_player.game_id {
        state.player_join_game(src_player.proxy_port, dst_player.game_id);
    }

    if packet::is_nat_probe_reply(&packet.buffer) {
        // The reply to a probe we sent while holding a datagram for this
        // pair: the path is proven, release the held datagram.
        return match state.peer_packet_take(src_player.proxy_port, dst_player.proxy_port) {
            Some(held) => {
                state.peer_refresh(src_player.proxy_port, dst_player.proxy_port);
                debug!(
                    "probe reply from {} validated path {} -> {}",
                    packet.src_addr, dst_player.proxy_port, src_player.proxy_port
                );
                Some(Forward {
                    packet: held,
                    src_proxy_port: dst_player.proxy_port,
                    src_player_addr: dst_player.player_addr(),
                    dst_addr: src_player.addr,
                    egress: dst_player.egress.clone(),
                })
            }
            None => {
                debug!(
                    "unmatched probe reply from {} on port {}",
                    packet.src_addr, packet.dst_port
                );
                None
            }
        };
    }

    // Re-check whether the source's NAT still maps the tracker port; the
    // reply will arrive there and reset NatPort.
    if src_player.nat_port != ctx.tracker_port {
        let probe = packet::marshal_nat_probe(ctx.proxy_ip, ctx.tracker_port);
        state.send_from_port(
            src_player.nat_port,
            UdpPacket::outgoing(src_player.addr, probe),
        );
    }

    let validated = state
        .peer_last_validated(src_player.proxy_port, dst_player.proxy_port)
        .map(|t| t.elapsed() <= PEER_VALIDITY_WINDOW)
        .unwrap_or(false);

    if !validated {
        // Unproven path: park the datagram on the destination, probe the
        // destination from its own proxy port, and wait for the reply to
        // release it.
        debug!(
            "path {} -> {} unproven, probing {}",
            src_player.proxy_port, dst_player.proxy_port, dst_player.addr
        );
        let probe = packet::marshal_nat_probe(ctx.proxy_ip, src_player.proxy_port);
        state.peer_packet_store(dst_player.proxy_port, src_player.proxy_port, packet);
        let _ = dst_player
            .egress
            .send(UdpPacket::outgoing(dst_player.addr, probe));
        return None;
    }

    state.peer_refresh(src_player.proxy_port, dst_player.proxy_port);

    Some(Forward {
        packet,
        src_proxy_port: src_player.proxy_port,
        src_player_addr: src_player.player_addr(),
        dst_addr: dst_player.addr,
        egress: src_player.egress.clone(),
    })
}

/// Step 9, off-lock: rewrite the datagram with the sender's proxy
/// endpoint, push it to the sender's egress, and apply whatever the
/// rewrite learned.
async fn forward_packet(ctx: &ServerContext, forward: Forward) {
    let mut packet = forward.packet;

    let events = match packet::rewrite_packet(&mut packet.buffer, ctx.proxy_ip, forward.src_proxy_port)
    {
        Ok(events) => events,
        Err(err) => {
            // A malformed datagram must never take the dispatcher down;
            // dump it and move on.
            warn!(
                "rewrite failed for datagram from {}: {}\n{}",
                packet.src_addr,
                err,
                util::hex_dump(&packet.buffer)
            );
            return;
        }
    };

    packet.dst_addr = forward.dst_addr;
    let _ = forward.egress.send(packet);

    if !events.is_empty() {
        apply_events(ctx, forward.src_player_addr, events).await;
    }
}

async fn apply_events(ctx: &ServerContext, src: PlayerAddr, events: Vec<GameEvent>) {
    let mut state = ctx.state.write().await;
    for event in events {
        match event {
            GameEvent::PlayerJoined { player_id } => {
                state.player_set_id(&src, i32::from(player_id));
            }
            GameEvent::PlayerNamed { player_id, name } => {
                state.player_set_name(&src, i32::from(player_id), &name);
            }
            GameEvent::PlayerLeftGame => {
                info!("Player {} left their game, disconnecting", src.addr);
                state.player_delete(&src);
                if ctx.debug {
                    info!("\n{}", state.sprint_server_state("\n"));
                }
            }
        }
    }
}

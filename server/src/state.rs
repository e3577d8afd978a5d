//! Authoritative relay state: the player roster, the live games, and
//! every mutation performed on them.
//!
//! All of it lives behind one `RwLock`; readers take shared guards,
//! mutators exclusive ones, and nested operations compose on the same
//! borrowed state so re-entrant locking cannot arise. `Player` values
//! handed back to callers are clones — mutating a copy never mutates the
//! roster. No operation here performs socket I/O while the lock is held;
//! pushing onto an unbounded channel never blocks.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::info;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use shared::{GameId, GameInfo};

use crate::ports::{PortAllocator, PortsExhausted};
use crate::route::{self, UdpPacket};
use crate::stats::StatsSender;

/// Placeholder until a player's in-game slot is observed.
pub const PLAYER_ID_UNKNOWN: i32 = -1;

/// Placeholder until a name opcode is seen for the player.
pub const PLAYER_NAME_UNKNOWN: &str = "<unknown>";

/// The identity triple a player is addressed by in events and targeted
/// updates: their external endpoint plus their proxy port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlayerAddr {
    pub addr: SocketAddr,
    pub proxy_port: u16,
}

/// One connected player and everything the relay knows about them.
#[derive(Debug, Clone)]
pub struct Player {
    /// External UDP endpoint as first observed.
    pub addr: SocketAddr,
    /// The public port other players reach this player through.
    pub proxy_port: u16,
    /// Outgoing datagrams, drained by this player's transmit loop.
    pub egress: UnboundedSender<UdpPacket>,
    /// Fires when the player is deleted; children of the global shutdown
    /// token, so shutdown disconnects everyone.
    pub disconnect: CancellationToken,
    pub game_id: GameId,
    pub player_id: i32,
    pub name: String,
    /// Proxy port → last time the forwarding path to it was validated.
    pub peers: HashMap<u16, Instant>,
    /// Proxy port → the one datagram held back awaiting a probe reply.
    pub peer_packets: HashMap<u16, UdpPacket>,
    /// The proxy port whose NAT mapping toward this player is currently
    /// confirmed; the tracker port until a probe says otherwise.
    pub nat_port: u16,
}

impl Player {
    pub fn player_addr(&self) -> PlayerAddr {
        PlayerAddr {
            addr: self.addr,
            proxy_port: self.proxy_port,
        }
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("player with socket {0} not found")]
    PlayerAddrNotFound(SocketAddr),
    #[error("player with proxy port {0} not found")]
    PlayerPortNotFound(u16),
    #[error(transparent)]
    PortsExhausted(#[from] PortsExhausted),
    #[error("failed to bind proxy port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

/// Long-lived handles every task needs: the state lock plus the shared
/// channels, sockets and lifecycle primitives.
pub struct ServerContext {
    pub state: RwLock<ServerState>,
    pub proxy_ip: Ipv4Addr,
    pub hostname: String,
    pub tracker_port: u16,
    /// The well-known socket: game-info intake, keepalives, and probes
    /// for players whose NAT mapping is the tracker port.
    pub tracker_socket: Arc<UdpSocket>,
    /// Shared ingress channel all proxy receive loops feed.
    pub ingress_tx: UnboundedSender<UdpPacket>,
    /// Liveness refreshes, consumed by the tracker's timeout monitor.
    pub player_pong_tx: UnboundedSender<PlayerAddr>,
    /// Newly created players, consumed by the tracker to start keepalives.
    pub start_player_ping_tx: UnboundedSender<Player>,
    pub shutdown: CancellationToken,
    pub tasks: TaskTracker,
    pub debug: bool,
    pub game_info_ping_interval: Duration,
    pub player_timeout: Duration,
}

/// The players list, the games map, and their bookkeeping.
pub struct ServerState {
    pub players: Vec<Player>,
    pub games: HashMap<GameId, GameInfo>,
    ports: PortAllocator,
    stats: StatsSender,
}

impl ServerState {
    pub fn new(ports: PortAllocator, stats: StatsSender) -> Self {
        Self {
            players: Vec::new(),
            games: HashMap::new(),
            ports,
            stats,
        }
    }

    pub fn player_get_by_addr(&self, addr: SocketAddr) -> Result<Player, StateError> {
        self.players
            .iter()
            .find(|p| p.addr == addr)
            .cloned()
            .ok_or(StateError::PlayerAddrNotFound(addr))
    }

    pub fn player_get_by_port(&self, proxy_port: u16) -> Result<Player, StateError> {
        self.players
            .iter()
            .find(|p| p.proxy_port == proxy_port)
            .cloned()
            .ok_or(StateError::PlayerPortNotFound(proxy_port))
    }

    /// Allocates a proxy port, binds the player's socket loops, and
    /// appends a fresh player record. Returns a copy of it.
    pub fn player_new(
        &mut self,
        ctx: &ServerContext,
        addr: SocketAddr,
        game_id: GameId,
        nat_port: u16,
    ) -> Result<Player, StateError> {
        let proxy_port = self.ports.next()?;
        let disconnect = ctx.shutdown.child_token();

        let egress = match route::add_player(
            &ctx.tasks,
            proxy_port,
            addr,
            ctx.ingress_tx.clone(),
            disconnect.clone(),
        ) {
            Ok(egress) => egress,
            Err(source) => {
                self.ports.release(proxy_port);
                return Err(StateError::Bind {
                    port: proxy_port,
                    source,
                });
            }
        };

        let player = Player {
            addr,
            proxy_port,
            egress,
            disconnect,
            game_id,
            player_id: PLAYER_ID_UNKNOWN,
            name: PLAYER_NAME_UNKNOWN.to_string(),
            peers: HashMap::new(),
            peer_packets: HashMap::new(),
            nat_port,
        };
        self.players.push(player.clone());
        self.stats.player_join(player.player_addr());

        Ok(player)
    }

    /// Moves the player on `player_port` into `new_game_id`, resetting
    /// their in-game id, and recounts both affected games.
    pub fn player_join_game(&mut self, player_port: u16, new_game_id: GameId) {
        let mut old_game_id = None;
        for player in self
            .players
            .iter_mut()
            .filter(|p| p.proxy_port == player_port)
        {
            old_game_id = Some(player.game_id);
            player.game_id = new_game_id;
            player.player_id = PLAYER_ID_UNKNOWN;
        }

        self.game_update_player_count(new_game_id);

        if let Some(old_game_id) = old_game_id {
            if old_game_id != new_game_id {
                self.game_update_player_count(old_game_id);
            }
        }
    }

    /// Removes a player: fires their disconnect token (releasing the
    /// socket loops and keepalive), frees the proxy port, drops the
    /// references other players hold to it, and recounts the former
    /// game's population. Unknown players are a no-op.
    pub fn player_delete(&mut self, player_addr: &PlayerAddr) {
        let idx = match self.players.iter().position(|p| {
            p.addr == player_addr.addr && p.proxy_port == player_addr.proxy_port
        }) {
            Some(idx) => idx,
            None => return,
        };

        let player = self.players.swap_remove(idx);
        player.disconnect.cancel();
        self.ports.release(player.proxy_port);

        for other in self.players.iter_mut() {
            other.peers.remove(&player.proxy_port);
            other.peer_packets.remove(&player.proxy_port);
        }

        info!("Deleted player {} (proxy port {})", player.addr, player.proxy_port);
        self.stats.player_leave(player.player_addr());
        self.game_update_player_count(player.game_id);
    }

    pub fn player_set_nat_port(&mut self, player_addr: &PlayerAddr, nat_port: u16) {
        if let Some(player) = self.player_find_mut(player_addr) {
            player.nat_port = nat_port;
        }
    }

    pub fn player_set_id(&mut self, player_addr: &PlayerAddr, player_id: i32) {
        if let Some(player) = self.player_find_mut(player_addr) {
            player.player_id = player_id;
        }
    }

    /// Names the player holding `player_id` in the same game as the
    /// player at `player_addr`. Name opcodes identify players by their
    /// in-game slot, not by their endpoint.
    pub fn player_set_name(&mut self, player_addr: &PlayerAddr, player_id: i32, name: &str) {
        let game_id = match self.player_find_mut(player_addr) {
            Some(player) => player.game_id,
            None => return,
        };

        if let Some(player) = self
            .players
            .iter_mut()
            .find(|p| p.game_id == game_id && p.player_id == player_id)
        {
            player.name = strip_machine_name_suffix(name);
        }
    }

    /// Recounts `game_id`'s population; a game with zero players is
    /// deleted on the spot.
    pub fn game_update_player_count(&mut self, game_id: GameId) {
        if game_id.is_none() {
            return;
        }

        let player_count = self.players.iter().filter(|p| p.game_id == game_id).count();
        if player_count == 0 {
            self.game_delete(game_id);
        } else if let Some(game) = self.games.get_mut(&game_id) {
            game.player_count = player_count as u16;
        }
    }

    pub fn game_delete(&mut self, game_id: GameId) {
        if self.games.remove(&game_id).is_some() {
            info!("Deleted game {}", game_id);
            self.stats.game_end(game_id);
        }
    }

    /// Last time the pair's forwarding path was validated, in either
    /// direction.
    pub fn peer_last_validated(&self, port_a: u16, port_b: u16) -> Option<Instant> {
        let a_to_b = self
            .players
            .iter()
            .find(|p| p.proxy_port == port_a)
            .and_then(|p| p.peers.get(&port_b).copied());
        let b_to_a = self
            .players
            .iter()
            .find(|p| p.proxy_port == port_b)
            .and_then(|p| p.peers.get(&port_a).copied());

        match (a_to_b, b_to_a) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// Marks the path from `player_port` toward `peer_port` as freshly
    /// validated.
    pub fn peer_refresh(&mut self, player_port: u16, peer_port: u16) {
        if let Some(player) = self.player_find_by_port_mut(player_port) {
            player.peers.insert(peer_port, Instant::now());
        }
    }

    /// Parks a datagram on `player_port` awaiting a probe reply from
    /// `peer_port`. Only the latest datagram needs to survive the probe
    /// round trip; a newer one replaces whatever was held.
    pub fn peer_packet_store(&mut self, player_port: u16, peer_port: u16, packet: UdpPacket) {
        if let Some(player) = self.player_find_by_port_mut(player_port) {
            player.peer_packets.insert(peer_port, packet);
        }
    }

    pub fn peer_packet_take(&mut self, player_port: u16, peer_port: u16) -> Option<UdpPacket> {
        self.player_find_by_port_mut(player_port)?
            .peer_packets
            .remove(&peer_port)
    }

    /// Pushes a datagram onto the egress channel of whichever player
    /// owns `proxy_port`. Dropped silently if that player is gone.
    pub fn send_from_port(&self, proxy_port: u16, packet: UdpPacket) {
        if let Some(player) = self.players.iter().find(|p| p.proxy_port == proxy_port) {
            let _ = player.egress.send(packet);
        }
    }

    /// Renders the player table with the caller's line terminator, so
    /// the same text serves the log and the CR-terminated tracker text.
    pub fn sprint_server_state(&self, newline: &str) -> String {
        let mut out = String::new();
        let _ = write!(out, "   Player                   Proxy Port    Game Id{newline}");
        for player in &self.players {
            let _ = write!(
                out,
                "   {:<21}    {:<10}    {}{}",
                player.addr.to_string(),
                player.proxy_port,
                player.game_id,
                newline
            );
        }
        out
    }

    pub fn game_player_ports(&self, game_id: GameId) -> Vec<u16> {
        self.players
            .iter()
            .filter(|p| p.game_id == game_id)
            .map(|p| p.proxy_port)
            .collect()
    }

    pub fn game_player_names(&self, game_id: GameId) -> Vec<String> {
        self.players
            .iter()
            .filter(|p| p.game_id == game_id)
            .map(|p| p.name.clone())
            .collect()
    }

    fn player_find_mut(&mut self, player_addr: &PlayerAddr) -> Option<&mut Player> {
        self.players
            .iter_mut()
            .find(|p| p.addr == player_addr.addr && p.proxy_port == player_addr.proxy_port)
    }

    fn player_find_by_port_mut(&mut self, proxy_port: u16) -> Option<&mut Player> {
        self.players.iter_mut().find(|p| p.proxy_port == proxy_port)
    }
}

/// Bolo fills in `@<machine>` when the host has no name configured;
/// the tracker shows just the player part.
fn strip_machine_name_suffix(name: &str) -> String {
    if name.ends_with("Unknown Machine Name") {
        let parts: Vec<&str> = name.split('@').collect();
        if parts.len() > 1 {
            return parts[..parts.len() - 1].concat();
        }
    }
    name.to_string()
}

//! Integration tests for the relay and tracker.
//!
//! These exercise the real plumbing: proxy sockets are bound, probes and
//! forwarded datagrams travel over loopback, and the tracker evicts
//! silent players. Every test uses its own proxy-port range so they can
//! run in parallel.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use server::ports::PortAllocator;
use server::route::UdpPacket;
use server::state::{Player, PlayerAddr, ServerContext, ServerState};
use server::{relay, stats, tracker};
use shared::game_info::{marshal_packet_game_info, GameId, GameInfo};
use shared::game_state::CRC_XMODEM;
use shared::packet;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

struct Harness {
    ctx: Arc<ServerContext>,
    // Held open so senders into these channels keep working even when no
    // task consumes them.
    _ingress_rx: UnboundedReceiver<UdpPacket>,
    start_ping_rx: UnboundedReceiver<Player>,
    pong_rx: UnboundedReceiver<PlayerAddr>,
}

async fn harness(first_player_port: u16) -> Harness {
    let tracker_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let tracker_port = tracker_socket.local_addr().unwrap().port();

    let (ingress_tx, ingress_rx) = mpsc::unbounded_channel();
    let (pong_tx, pong_rx) = mpsc::unbounded_channel();
    let (start_ping_tx, start_ping_rx) = mpsc::unbounded_channel();
    let (stats_tx, _stats_rx) = stats::channel();

    let ctx = Arc::new(ServerContext {
        state: RwLock::new(ServerState::new(
            PortAllocator::new(first_player_port, 8),
            stats_tx,
        )),
        proxy_ip: Ipv4Addr::LOCALHOST,
        hostname: "test.example.com".to_string(),
        tracker_port,
        tracker_socket,
        ingress_tx,
        player_pong_tx: pong_tx,
        start_player_ping_tx: start_ping_tx,
        shutdown: CancellationToken::new(),
        tasks: TaskTracker::new(),
        debug: false,
        game_info_ping_interval: Duration::from_millis(200),
        player_timeout: Duration::from_millis(400),
    });

    Harness {
        ctx,
        _ingress_rx: ingress_rx,
        start_ping_rx,
        pong_rx,
    }
}

fn sample_game_info(id: u8) -> GameInfo {
    GameInfo {
        game_id: GameId([id; 8]),
        server_start_timestamp: SystemTime::now(),
        map_name: format!("Map {id}"),
        start_timestamp: 3_000_000_000,
        game_type: 1,
        allow_hidden_mines: false,
        allow_computer: false,
        computer_advantage: false,
        start_delay: 0,
        time_limit: 0,
        player_count: 1,
        neutral_pillbox_count: 16,
        neutral_base_count: 12,
        has_password: false,
    }
}

fn header_packet(packet_type: u8) -> Vec<u8> {
    let mut buffer = Vec::new();
    buffer.extend_from_slice(packet::BOLO_SIGNATURE);
    buffer.extend_from_slice(&packet::BOLO_VERSION);
    buffer.push(packet_type);
    buffer
}

fn udp_packet(src_addr: SocketAddr, dst_port: u16, buffer: Vec<u8>) -> UdpPacket {
    UdpPacket {
        src_addr,
        dst_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
        dst_port,
        buffer,
    }
}

/// A type-2 packet whose single block carries a disconnect opcode with
/// the given embedded endpoint, checksummed correctly.
fn disconnect_packet(ip: [u8; 4], port: u16) -> Vec<u8> {
    let mut opcode = vec![0xff, 0xf0, 0x05];
    opcode.extend_from_slice(&[10, 0, 0, 1, 0xc3, 0x50]);
    opcode.extend_from_slice(&ip);
    opcode.extend_from_slice(&port.to_be_bytes());
    opcode.extend_from_slice(&[0x00, 0x00]);

    let mut block = vec![(4 + opcode.len()) as u8, 0x01, 0x03, 0x00];
    block.extend_from_slice(&opcode);
    let crc = CRC_XMODEM.checksum(&block);
    block.extend_from_slice(&crc.to_be_bytes());

    let mut buffer = header_packet(packet::PACKET_TYPE_GAME_STATE);
    buffer.push(0x01); // state sequence
    buffer.extend_from_slice(&block);
    buffer
}

async fn recv(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
    let mut buffer = [0u8; 1024];
    let (len, addr) = timeout(RECV_TIMEOUT, socket.recv_from(&mut buffer))
        .await
        .expect("timed out waiting for datagram")
        .expect("receive failed");
    (buffer[..len].to_vec(), addr)
}

mod tracker_tests {
    use super::*;

    /// A never-seen source advertising a game becomes a player with a
    /// fresh proxy port, the game is created, and keepalives start.
    #[tokio::test]
    async fn game_info_registers_player_and_game() {
        let h = harness(42110).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client.local_addr().unwrap();

        let info = sample_game_info(9);
        let buffer = marshal_packet_game_info(&info, Ipv4Addr::new(192, 168, 0, 80));
        tracker::handle_game_info_packet(&h.ctx, udp_packet(client_addr, h.ctx.tracker_port, buffer))
            .await;

        let first_seen = {
            let state = h.ctx.state.read().await;
            let player = state.player_get_by_addr(client_addr).unwrap();
            assert_eq!(player.proxy_port, 42110);
            assert_eq!(player.game_id, GameId([9; 8]));
            // The game's creator owns slot 0.
            assert_eq!(player.player_id, 0);
            assert_eq!(player.nat_port, h.ctx.tracker_port);

            let game = &state.games[&GameId([9; 8])];
            assert_eq!(game.player_count, 1);
            assert_eq!(game.map_name, "Map 9");
            game.server_start_timestamp
        };

        // The keepalive task pings the player from the tracker socket.
        let (keepalive, from) = recv(&client).await;
        assert_eq!(from.port(), h.ctx.tracker_port);
        assert_eq!(keepalive, packet::marshal_keepalive());

        // A second advertisement updates the game but keeps its age.
        let buffer = marshal_packet_game_info(&info, Ipv4Addr::new(192, 168, 0, 80));
        tracker::handle_game_info_packet(&h.ctx, udp_packet(client_addr, h.ctx.tracker_port, buffer))
            .await;

        let state = h.ctx.state.read().await;
        assert_eq!(state.players.len(), 1);
        assert_eq!(
            state.games[&GameId([9; 8])].server_start_timestamp,
            first_seen
        );
    }

    /// Going silent past the configured timeout evicts the player and
    /// deletes their now-empty game.
    #[tokio::test]
    async fn silent_player_times_out() {
        let mut h = harness(42120).await;
        let start_ping_rx = std::mem::replace(&mut h.start_ping_rx, mpsc::unbounded_channel().1);
        let pong_rx = std::mem::replace(&mut h.pong_rx, mpsc::unbounded_channel().1);
        h.ctx.tasks.spawn(tracker::run(h.ctx.clone(), start_ping_rx, pong_rx));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let tracker_addr = SocketAddr::from(([127, 0, 0, 1], h.ctx.tracker_port));
        let buffer = marshal_packet_game_info(&sample_game_info(3), Ipv4Addr::new(10, 0, 0, 9));
        client.send_to(&buffer, tracker_addr).await.unwrap();

        // Wait for registration.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if h.ctx.state.read().await.players.len() == 1 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "player never registered");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // Stay silent; the monitor scans every quarter timeout.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            let state = h.ctx.state.read().await;
            if state.players.is_empty() && state.games.is_empty() {
                break;
            }
            drop(state);
            assert!(tokio::time::Instant::now() < deadline, "player never timed out");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // Shutdown releases every task the harness spawned.
        h.ctx.shutdown.cancel();
        h.ctx.tasks.close();
        timeout(Duration::from_secs(2), h.ctx.tasks.wait())
            .await
            .expect("tasks did not stop on shutdown");
    }

    /// The TCP endpoint serves the banner, game blocks and state table.
    #[tokio::test]
    async fn tcp_endpoint_serves_tracker_text() {
        let mut h = harness(42130).await;
        let start_ping_rx = std::mem::replace(&mut h.start_ping_rx, mpsc::unbounded_channel().1);
        let pong_rx = std::mem::replace(&mut h.pong_rx, mpsc::unbounded_channel().1);
        h.ctx.tasks.spawn(tracker::run(h.ctx.clone(), start_ping_rx, pong_rx));

        let tracker_addr = SocketAddr::from(([127, 0, 0, 1], h.ctx.tracker_port));
        let client_x = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_y = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let buffer = marshal_packet_game_info(&sample_game_info(1), Ipv4Addr::new(10, 0, 0, 1));
        client_x.send_to(&buffer, tracker_addr).await.unwrap();
        let buffer = marshal_packet_game_info(&sample_game_info(2), Ipv4Addr::new(10, 0, 0, 2));
        client_y.send_to(&buffer, tracker_addr).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if h.ctx.state.read().await.games.len() == 2 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "games never registered");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let mut conn = TcpStream::connect(tracker_addr).await.unwrap();
        let mut text = String::new();
        timeout(RECV_TIMEOUT, conn.read_to_string(&mut text))
            .await
            .expect("timed out reading tracker text")
            .unwrap();

        assert!(text.starts_with("= ==="));
        assert!(text.contains("Astrospark Bolorama"));
        assert!(text.contains("Map 1"));
        assert!(text.contains("Map 2"));
        assert!(text.contains("   There are 2 games in progress.\r\r"));
        assert!(text.contains("Host: test.example.com"));
        assert!(text.contains("Proxy Port"));
        // CR-terminated, never CRLF.
        assert!(!text.contains('\n'));

        h.ctx.shutdown.cancel();
    }
}

mod relay_tests {
    use super::*;

    async fn two_players(
        ctx: &Arc<ServerContext>,
        game: GameId,
    ) -> ((UdpSocket, Player), (UdpSocket, Player)) {
        let client_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let mut state = ctx.state.write().await;
        state
            .games
            .insert(game, sample_game_info(game.as_bytes()[0]));
        let a = state
            .player_new(ctx, client_a.local_addr().unwrap(), game, ctx.tracker_port)
            .unwrap();
        let b = state
            .player_new(ctx, client_b.local_addr().unwrap(), game, ctx.tracker_port)
            .unwrap();
        state.game_update_player_count(game);
        drop(state);

        ((client_a, a), (client_b, b))
    }

    /// First forward between a pair is held back: the destination gets a
    /// probe carrying the source's proxy endpoint, not the datagram.
    #[tokio::test]
    async fn first_forward_requires_probe() {
        let h = harness(42140).await;
        let game = GameId([5; 8]);
        let ((_client_a, a), (client_b, b)) = two_players(&h.ctx, game).await;

        let join = header_packet(packet::PACKET_TYPE_JOIN_GAME);
        relay::process_packet(&h.ctx, udp_packet(a.addr, b.proxy_port, join)).await;

        // B is probed from its own proxy socket, told to contact A's
        // proxy endpoint.
        let (probe, from) = recv(&client_b).await;
        assert_eq!(from.port(), b.proxy_port);
        assert_eq!(
            probe,
            packet::marshal_nat_probe(Ipv4Addr::LOCALHOST, a.proxy_port)
        );

        // A's datagram is parked on B, not delivered.
        let state = h.ctx.state.read().await;
        let b_state = state.player_get_by_port(b.proxy_port).unwrap();
        assert!(b_state.peer_packets.contains_key(&a.proxy_port));
        drop(state);

        let mut buffer = [0u8; 64];
        let extra = timeout(
            Duration::from_millis(200),
            client_b.recv_from(&mut buffer),
        )
        .await;
        assert!(extra.is_err(), "held datagram was delivered early");
    }

    /// The probe reply releases the held datagram, rewritten and sent
    /// from the original sender's proxy socket.
    #[tokio::test]
    async fn probe_reply_releases_held_packet() {
        let h = harness(42150).await;
        let game = GameId([6; 8]);
        let ((_client_a, a), (client_b, b)) = two_players(&h.ctx, game).await;

        let join = header_packet(packet::PACKET_TYPE_JOIN_GAME);
        relay::process_packet(&h.ctx, udp_packet(a.addr, b.proxy_port, join)).await;
        let (_probe, _) = recv(&client_b).await;

        // B answers the probe; the reply lands on A's proxy port.
        let mut reply = packet::marshal_nat_probe(Ipv4Addr::LOCALHOST, a.proxy_port);
        reply[packet::PACKET_TYPE_OFFSET] = packet::PACKET_TYPE_NAT_PROBE_REPLY;
        relay::process_packet(&h.ctx, udp_packet(b.addr, a.proxy_port, reply)).await;

        // The held type-5 arrives at B, from A's proxy port.
        let (released, from) = recv(&client_b).await;
        assert_eq!(from.port(), a.proxy_port);
        assert_eq!(packet::packet_type(&released), packet::PACKET_TYPE_JOIN_GAME);

        let state = h.ctx.state.read().await;
        let b_state = state.player_get_by_port(b.proxy_port).unwrap();
        assert!(b_state.peer_packets.is_empty());
        assert!(b_state.peers.contains_key(&a.proxy_port));
    }

    /// A disconnect opcode naming a foreign endpoint is rewritten to the
    /// proxy endpoint and deletes the sending player.
    #[tokio::test]
    async fn disconnect_opcode_deletes_sender() {
        let h = harness(42160).await;
        let game = GameId([7; 8]);
        let ((_client_a, a), (client_b, b)) = two_players(&h.ctx, game).await;

        // The pair's path was validated moments ago.
        {
            let mut state = h.ctx.state.write().await;
            state.peer_refresh(a.proxy_port, b.proxy_port);
        }

        let buffer = disconnect_packet([192, 168, 0, 80], 50002);
        relay::process_packet(&h.ctx, udp_packet(a.addr, b.proxy_port, buffer)).await;

        // B receives the rewritten datagram with a fresh checksum.
        let (forwarded, from) = recv(&client_b).await;
        assert_eq!(from.port(), a.proxy_port);
        let endpoint = 9 + 4 + 2 + 7;
        assert_eq!(
            &forwarded[endpoint..endpoint + 4],
            &Ipv4Addr::LOCALHOST.octets()
        );
        assert_eq!(
            &forwarded[endpoint + 4..endpoint + 6],
            &a.proxy_port.to_be_bytes()
        );
        let block_length = (forwarded[9] & 0x7f) as usize;
        let crc = CRC_XMODEM.checksum(&forwarded[9..9 + block_length]);
        assert_eq!(
            &forwarded[9 + block_length..9 + block_length + 2],
            &crc.to_be_bytes()
        );

        // The sender is gone and the game recounted.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let state = h.ctx.state.read().await;
            if state.player_get_by_addr(a.addr).is_err() {
                assert_eq!(state.games[&game].player_count, 1);
                break;
            }
            drop(state);
            assert!(tokio::time::Instant::now() < deadline, "sender never deleted");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// An unknown source reaching a live proxy port is registered into
    /// the destination's game, with the destination's proxy port as its
    /// confirmed NAT mapping.
    #[tokio::test]
    async fn unknown_source_becomes_player() {
        let mut h = harness(42170).await;
        let game = GameId([8; 8]);
        let ((_client_a, _a), (client_b, b)) = two_players(&h.ctx, game).await;

        let newcomer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let newcomer_addr = newcomer.local_addr().unwrap();

        let join = header_packet(packet::PACKET_TYPE_JOIN_GAME);
        relay::process_packet(&h.ctx, udp_packet(newcomer_addr, b.proxy_port, join)).await;

        let state = h.ctx.state.read().await;
        let created = state.player_get_by_addr(newcomer_addr).unwrap();
        assert_eq!(created.game_id, game);
        assert_eq!(created.nat_port, b.proxy_port);
        drop(state);

        // The dispatcher hands the new player to the tracker to start
        // its keepalive.
        let started = timeout(RECV_TIMEOUT, h.start_ping_rx.recv())
            .await
            .expect("no keepalive registration")
            .unwrap();
        assert_eq!(started.addr, newcomer_addr);

        // B got probed for the new pair; the newcomer's datagram waits.
        let (probe, _) = recv(&client_b).await;
        assert_eq!(
            probe,
            packet::marshal_nat_probe(Ipv4Addr::LOCALHOST, created.proxy_port)
        );
    }

    /// Malformed datagrams are dropped without disturbing the dispatcher.
    #[tokio::test]
    async fn malformed_datagrams_are_dropped() {
        let h = harness(42180).await;
        let game = GameId([4; 8]);
        let ((_client_a, a), (_client_b, b)) = two_players(&h.ctx, game).await;

        // Wrong signature.
        relay::process_packet(&h.ctx, udp_packet(a.addr, b.proxy_port, vec![0u8; 12])).await;
        // Too short.
        relay::process_packet(&h.ctx, udp_packet(a.addr, b.proxy_port, vec![0x42])).await;

        let state = h.ctx.state.read().await;
        assert_eq!(state.players.len(), 2);
        let b_state = state.player_get_by_port(b.proxy_port).unwrap();
        assert!(b_state.peer_packets.is_empty());
    }
}

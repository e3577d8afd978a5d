//! Per-player proxy sockets.
//!
//! Every player gets one UDP socket bound on their allocated proxy port,
//! with a receive loop feeding the shared ingress channel and a transmit
//! loop draining the player's egress channel. Both loops exit when the
//! player's disconnect token fires; the tokens are children of the global
//! shutdown token, so shutdown tears every route down too.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use shared::MAX_UDP_PACKET_SIZE;

/// A datagram in flight between a player and the relay.
#[derive(Debug, Clone)]
pub struct UdpPacket {
    pub src_addr: SocketAddr,
    pub dst_addr: SocketAddr,
    /// The local port the datagram arrived on.
    pub dst_port: u16,
    pub buffer: Vec<u8>,
}

impl UdpPacket {
    /// A server-synthesized datagram headed for `dst_addr`.
    pub fn outgoing(dst_addr: SocketAddr, buffer: Vec<u8>) -> Self {
        Self {
            src_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            dst_addr,
            dst_port: 0,
            buffer,
        }
    }
}

/// Binds the proxy socket for a new player and spawns its socket loops.
/// Returns the egress channel outgoing datagrams are pushed onto.
pub fn add_player(
    tasks: &TaskTracker,
    proxy_port: u16,
    player_addr: SocketAddr,
    ingress: UnboundedSender<UdpPacket>,
    disconnect: CancellationToken,
) -> io::Result<UnboundedSender<UdpPacket>> {
    info!("Creating proxy: {} => {}", proxy_port, player_addr);

    // Bound synchronously so callers under the state lock never await.
    let std_socket = std::net::UdpSocket::bind(("0.0.0.0", proxy_port))?;
    std_socket.set_nonblocking(true)?;
    let socket = Arc::new(UdpSocket::from_std(std_socket)?);

    let (egress_tx, egress_rx) = mpsc::unbounded_channel();
    tasks.spawn(udp_listener(
        socket.clone(),
        proxy_port,
        ingress,
        disconnect.clone(),
    ));
    tasks.spawn(udp_transmitter(socket, proxy_port, egress_rx, disconnect));

    Ok(egress_tx)
}

async fn udp_listener(
    socket: Arc<UdpSocket>,
    proxy_port: u16,
    ingress: UnboundedSender<UdpPacket>,
    disconnect: CancellationToken,
) {
    let mut buffer = [0u8; MAX_UDP_PACKET_SIZE];

    loop {
        tokio::select! {
            _ = disconnect.cancelled() => break,
            result = socket.recv_from(&mut buffer) => match result {
                Ok((len, addr)) => {
                    let packet = UdpPacket {
                        src_addr: addr,
                        dst_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
                        dst_port: proxy_port,
                        buffer: buffer[..len].to_vec(),
                    };
                    if ingress.send(packet).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    if !disconnect.is_cancelled() {
                        warn!("receive error on UDP port {}: {}", proxy_port, err);
                    }
                    break;
                }
            }
        }
    }

    debug!("Stopped listening on UDP port {}", proxy_port);
}

async fn udp_transmitter(
    socket: Arc<UdpSocket>,
    proxy_port: u16,
    mut egress: UnboundedReceiver<UdpPacket>,
    disconnect: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = disconnect.cancelled() => break,
            packet = egress.recv() => match packet {
                Some(packet) => {
                    // Write failures are logged and do not tear the loop down.
                    if let Err(err) = socket.send_to(&packet.buffer, packet.dst_addr).await {
                        warn!(
                            "send error on UDP port {} to {}: {}",
                            proxy_port, packet.dst_addr, err
                        );
                    }
                }
                None => break,
            }
        }
    }

    debug!("Stopped transmitting on UDP port {}", proxy_port);
}

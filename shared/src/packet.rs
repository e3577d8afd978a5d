//! Bolo datagram framing: header validation, packet types, endpoint
//! rewrites at fixed offsets, and server-synthesized probe/keepalive
//! construction.

use std::net::Ipv4Addr;

use thiserror::Error;

use crate::game_state;

/// Every Bolo datagram starts with an 8-byte header: the ASCII signature,
/// three version bytes, and the packet type.
pub const PACKET_HEADER_SIZE: usize = 8;

pub const BOLO_SIGNATURE: &[u8; 4] = b"Bolo";
pub const BOLO_VERSION: [u8; 3] = [0x65, 0x99, 0x08];

pub const PACKET_TYPE_OFFSET: usize = 0x07;

pub const PACKET_TYPE_0: u8 = 0x00;
pub const PACKET_TYPE_1: u8 = 0x01;
pub const PACKET_TYPE_GAME_STATE: u8 = 0x02;
pub const PACKET_TYPE_GAME_STATE_ACK: u8 = 0x04;
pub const PACKET_TYPE_JOIN_GAME: u8 = 0x05;
pub const PACKET_TYPE_NAT_PROBE: u8 = 0x06;
pub const PACKET_TYPE_NAT_PROBE_REPLY: u8 = 0x07;
pub const PACKET_TYPE_8: u8 = 0x08;
pub const PACKET_TYPE_9: u8 = 0x09;
pub const PACKET_TYPE_KEEPALIVE: u8 = 0x0d;
pub const PACKET_TYPE_GAME_INFO: u8 = 0x0e;

/// Peer endpoint offsets. Types 0, 1 and 9 carry `(IPv4, port)` right
/// after the header; the two NAT-probe types carry it at offset 12.
pub const PACKET_TYPE_0_PEER_ADDR_OFFSET: usize = 8;
pub const PACKET_TYPE_1_PEER_ADDR_OFFSET: usize = 8;
pub const PACKET_TYPE_6_PEER_ADDR_OFFSET: usize = 12;
pub const PACKET_TYPE_7_PEER_ADDR_OFFSET: usize = 12;
pub const PACKET_TYPE_9_PEER_ADDR_OFFSET: usize = 8;

/// Marker bytes a NAT probe carries around its embedded endpoint. The
/// probe reply echoes them at the same offsets, which is how the relay
/// recognizes the reply without any per-probe bookkeeping.
pub const NAT_PROBE_MARKER: [u8; 2] = [0x01, 0x23];
pub const NAT_PROBE_TRAILER: [u8; 4] = [0x45, 0x67, 0x89, 0xab];

const NAT_PROBE_MARKER_OFFSET: usize = 10;
const NAT_PROBE_TRAILER_OFFSET: usize = 18;
const NAT_PROBE_LEN: usize = 22;

/// Errors produced while validating or rewriting a Bolo datagram.
///
/// The three validation variants carry the distinct diagnostics the relay
/// logs when dropping a datagram; `Truncated` covers any bounds fault hit
/// during a rewrite traversal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("datagram too short (smaller than bolo header) ({0})")]
    TooShort(usize),
    #[error("datagram failed bolo signature check ({0})")]
    BadSignature(String),
    #[error("unsupported bolo version ({0})")]
    BadVersion(String),
    #[error("datagram truncated in {context} at offset {offset} (length {len})")]
    Truncated {
        context: &'static str,
        offset: usize,
        len: usize,
    },
}

/// Checks the length, signature and version of a datagram. Each failure
/// mode produces its own diagnostic so dropped traffic can be told apart
/// in the logs.
pub fn validate_packet(buffer: &[u8]) -> Result<(), PacketError> {
    if buffer.len() < PACKET_HEADER_SIZE {
        return Err(PacketError::TooShort(buffer.len()));
    }

    if &buffer[0..4] != BOLO_SIGNATURE {
        return Err(PacketError::BadSignature(hex::encode(&buffer[0..4])));
    }

    if buffer[4..7] != BOLO_VERSION {
        return Err(PacketError::BadVersion(hex::encode(&buffer[4..7])));
    }

    Ok(())
}

/// Returns the packet type byte. The caller is expected to have run
/// [`validate_packet`] first.
pub fn packet_type(buffer: &[u8]) -> u8 {
    buffer[PACKET_TYPE_OFFSET]
}

/// Builds a type-6 NAT probe directing the receiver to contact
/// `(target_ip, target_port)`. Sent from the proxy socket whose NAT
/// mapping is being exercised.
pub fn marshal_nat_probe(target_ip: Ipv4Addr, target_port: u16) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(NAT_PROBE_LEN);
    buffer.extend_from_slice(BOLO_SIGNATURE);
    buffer.extend_from_slice(&BOLO_VERSION);
    buffer.push(PACKET_TYPE_NAT_PROBE);
    buffer.extend_from_slice(&[0xff, 0xff]);
    buffer.extend_from_slice(&NAT_PROBE_MARKER);
    buffer.extend_from_slice(&target_ip.octets());
    buffer.extend_from_slice(&target_port.to_be_bytes());
    buffer.extend_from_slice(&NAT_PROBE_TRAILER);
    buffer
}

/// Builds the type-D keepalive the tracker pings players with. It is a
/// bare header; the type byte carries all the meaning.
pub fn marshal_keepalive() -> Vec<u8> {
    let mut buffer = Vec::with_capacity(PACKET_HEADER_SIZE);
    buffer.extend_from_slice(BOLO_SIGNATURE);
    buffer.extend_from_slice(&BOLO_VERSION);
    buffer.push(PACKET_TYPE_KEEPALIVE);
    buffer
}

/// True if the datagram is a type-7 reply to one of our NAT probes: the
/// marker and trailer bytes must sit exactly where [`marshal_nat_probe`]
/// put them.
pub fn is_nat_probe_reply(buffer: &[u8]) -> bool {
    buffer.len() >= NAT_PROBE_LEN
        && packet_type(buffer) == PACKET_TYPE_NAT_PROBE_REPLY
        && buffer[NAT_PROBE_MARKER_OFFSET..NAT_PROBE_MARKER_OFFSET + 2] == NAT_PROBE_MARKER
        && buffer[NAT_PROBE_TRAILER_OFFSET..NAT_PROBE_TRAILER_OFFSET + 4] == NAT_PROBE_TRAILER
}

/// Overwrites the peer endpoint embedded at `offset` with the proxy's
/// endpoint, unless it already names the proxy IP. Touches exactly the six
/// bytes `[offset, offset + 6)` or none at all.
pub fn rewrite_packet_fixed_position(
    buffer: &mut [u8],
    proxy_ip: Ipv4Addr,
    proxy_port: u16,
    offset: usize,
) -> Result<(), PacketError> {
    if buffer.len() < offset + 6 {
        return Err(PacketError::Truncated {
            context: "peer endpoint",
            offset,
            len: buffer.len(),
        });
    }

    let ip = proxy_ip.octets();
    if buffer[offset..offset + 4] != ip {
        buffer[offset..offset + 4].copy_from_slice(&ip);
        buffer[offset + 4..offset + 6].copy_from_slice(&proxy_port.to_be_bytes());
    }

    Ok(())
}

/// Patches every peer endpoint a datagram carries so receivers learn the
/// proxy's endpoint instead of the sender's private one.
///
/// Only the player who started a game sends packets naming a foreign
/// address, and it is always their own; any embedded IP that is not ours
/// is replaced with the proxy IP and the sender's assigned proxy port.
/// Game-state packets additionally surface the events their opcodes imply.
/// Packet types without embedded endpoints pass through untouched.
pub fn rewrite_packet(
    buffer: &mut [u8],
    proxy_ip: Ipv4Addr,
    proxy_port: u16,
) -> Result<Vec<game_state::GameEvent>, PacketError> {
    match packet_type(buffer) {
        PACKET_TYPE_0 => {
            rewrite_packet_fixed_position(buffer, proxy_ip, proxy_port, PACKET_TYPE_0_PEER_ADDR_OFFSET)?;
        }
        PACKET_TYPE_1 => {
            rewrite_packet_fixed_position(buffer, proxy_ip, proxy_port, PACKET_TYPE_1_PEER_ADDR_OFFSET)?;
        }
        PACKET_TYPE_GAME_STATE => {
            return game_state::rewrite_packet_game_state(buffer, proxy_ip, proxy_port);
        }
        PACKET_TYPE_NAT_PROBE => {
            rewrite_packet_fixed_position(buffer, proxy_ip, proxy_port, PACKET_TYPE_6_PEER_ADDR_OFFSET)?;
        }
        PACKET_TYPE_NAT_PROBE_REPLY => {
            rewrite_packet_fixed_position(buffer, proxy_ip, proxy_port, PACKET_TYPE_7_PEER_ADDR_OFFSET)?;
        }
        PACKET_TYPE_9 => {
            rewrite_packet_fixed_position(buffer, proxy_ip, proxy_port, PACKET_TYPE_9_PEER_ADDR_OFFSET)?;
        }
        _ => {}
    }

    Ok(Vec::new())
}

//! Type-2 game-state packets: a sequence of length-prefixed, CRC-protected
//! blocks, each carrying a packed run of opcodes. The relay walks the
//! blocks, patches the endpoints hidden inside three of the opcodes, and
//! recomputes the checksum of any block it touched.
//!
//! Traversal is fully bounds-checked; any index that would land outside
//! the datagram surfaces as [`PacketError::Truncated`] so the caller can
//! dump and drop the packet instead of crashing the relay.

use std::net::Ipv4Addr;

use crc::{Crc, CRC_16_XMODEM};
use log::debug;

use crate::packet::{PacketError, PACKET_HEADER_SIZE};

pub const OPCODE_GAME_INFO: u8 = 0x11;
pub const OPCODE_MAP_DATA: u8 = 0x13;
pub const OPCODE_PLAYER_NAME: u8 = 0x18;
pub const OPCODE_SEND_MESSAGE: u8 = 0x1a;
pub const OPCODE_DISCONNECT: u8 = 0x30;

pub const OPCODE_GAME_INFO_SUBCODE_GAME: u8 = 0x01;
pub const OPCODE_GAME_INFO_SUBCODE_PILLBOX: u8 = 0x02;
pub const OPCODE_GAME_INFO_SUBCODE_BASE: u8 = 0x03;
pub const OPCODE_GAME_INFO_SUBCODE_START: u8 = 0x04;

/// Game-state blocks are protected by CRC-16/XMODEM, stored big-endian
/// right after the block body.
pub const CRC_XMODEM: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Opcode length (leading byte(s) included) for every opcode without a
/// dedicated rule, indexed by the derived opcode value.
const OPCODE_LENGTH_LOOKUP: [usize; 64] = [
    4, 6, 8, 10, 4, 1, 3, 3, //
    1, 1, 1, 1, 1, 1, 1, 1, //
    2, 0, 3, 0, 2, 3, 1, 1, //
    0, 2, 0, 4, 2, 1, 1, 3, //
    1, 1, 1, 1, 1, 3, 1, 1, //
    3, 1, 1, 1, 1, 1, 1, 1, //
    0, 1, 3, 3, 1, 1, 1, 1, //
    1, 1, 1, 1, 1, 1, 1, 1, //
];

/// What a game-state rewrite learned about the sender while walking the
/// opcodes. The dispatcher applies these to the authoritative state after
/// the buffer work is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameEvent {
    /// The sender's in-game player slot announced itself (player-name
    /// opcode in a fresh state exchange).
    PlayerJoined { player_id: u8 },
    /// A player-name opcode carried a name for the given slot.
    PlayerNamed { player_id: u8, name: String },
    /// The sender is telling its peers it is leaving the game.
    PlayerLeftGame,
}

fn byte_at(buffer: &[u8], pos: usize, context: &'static str) -> Result<u8, PacketError> {
    buffer.get(pos).copied().ok_or(PacketError::Truncated {
        context,
        offset: pos,
        len: buffer.len(),
    })
}

/// Decodes the opcode starting at `pos` and returns `(opcode, length)`,
/// the length counted from the first opcode byte.
///
/// An 0xff lead byte escapes into the high opcode page: the value is
/// derived from the following byte plus 0x20. Within a page, bytes below
/// 0xf0 keep their high nibble, bytes at or above 0xf0 their low five
/// bits.
pub fn parse_opcode(buffer: &[u8], pos: usize) -> Result<(u8, usize), PacketError> {
    let mut cursor = pos;
    let mut raw = byte_at(buffer, cursor, "opcode")?;
    cursor += 1;
    let mut offset = 0u8;

    if raw == 0xff {
        raw = byte_at(buffer, cursor, "opcode")?;
        cursor += 1;
        offset = 0x20;
    }

    let derived = if raw < 0xf0 { raw >> 4 } else { raw & 0x1f };
    let opcode = derived + offset;

    let length = match opcode {
        OPCODE_DISCONNECT => {
            let address_length = byte_at(buffer, cursor, "disconnect opcode")? as usize;
            address_length * 3 + 2
        }
        OPCODE_GAME_INFO => {
            let subcode = byte_at(buffer, cursor, "game info opcode")?;
            let count = byte_at(buffer, cursor + 1, "game info opcode")? as usize;
            match subcode {
                OPCODE_GAME_INFO_SUBCODE_GAME => 90,
                OPCODE_GAME_INFO_SUBCODE_PILLBOX => count * 5 + 3,
                OPCODE_GAME_INFO_SUBCODE_BASE => count * 6 + 3,
                OPCODE_GAME_INFO_SUBCODE_START => count * 3 + 3,
                _ => 42,
            }
        }
        OPCODE_MAP_DATA => byte_at(buffer, cursor + 2, "map data opcode")? as usize + 3,
        OPCODE_PLAYER_NAME => byte_at(buffer, cursor, "player name opcode")? as usize + 2,
        OPCODE_SEND_MESSAGE => byte_at(buffer, cursor + 2, "send message opcode")? as usize + 4,
        _ => OPCODE_LENGTH_LOOKUP[opcode as usize],
    };

    Ok((opcode, length))
}

/// Patches the host IP inside an 0x11/subcode-1 (game descriptor) opcode.
/// `pos` points just past the opcode and subcode bytes; the descriptor
/// starts with the 36-byte map-name field, then the host IP.
fn rewrite_opcode_game_info(
    buffer: &mut [u8],
    pos: usize,
    proxy_ip: Ipv4Addr,
) -> Result<(), PacketError> {
    let ip_pos = pos + 36;
    if buffer.len() < ip_pos + 4 {
        return Err(PacketError::Truncated {
            context: "game info opcode host ip",
            offset: ip_pos,
            len: buffer.len(),
        });
    }
    buffer[ip_pos..ip_pos + 4].copy_from_slice(&proxy_ip.octets());
    Ok(())
}

/// Patches the player endpoint inside an 0x30 (disconnect) opcode and
/// reports whether it named a foreign address. `pos` points just past the
/// two opcode bytes: an address-count byte and one 6-byte address precede
/// the endpoint being rewritten.
fn rewrite_opcode_player_info(
    buffer: &mut [u8],
    pos: usize,
    proxy_ip: Ipv4Addr,
    proxy_port: u16,
) -> Result<bool, PacketError> {
    let pos = pos + 7;
    if buffer.len() < pos + 6 {
        return Err(PacketError::Truncated {
            context: "disconnect opcode endpoint",
            offset: pos,
            len: buffer.len(),
        });
    }

    let nat_port = u16::from_be_bytes([buffer[pos + 4], buffer[pos + 5]]);
    debug!(
        "player disconnecting (NAT {}.{}.{}.{}:{})",
        buffer[pos], buffer[pos + 1], buffer[pos + 2], buffer[pos + 3], nat_port
    );

    let ip = proxy_ip.octets();
    let differs = buffer[pos..pos + 4] != ip;
    if differs {
        buffer[pos..pos + 4].copy_from_slice(&ip);
        buffer[pos + 4..pos + 6].copy_from_slice(&proxy_port.to_be_bytes());
    }

    Ok(differs)
}

/// Walks one block starting at `pos_start` and returns the position of
/// the next one. A zero length byte means the rest of the datagram is
/// unparseable; the cursor jumps to the end. Blocks shorter than four
/// bytes are stepped over untouched.
fn rewrite_game_state_block(
    packet_sequence: u8,
    pos_start: usize,
    buffer: &mut [u8],
    proxy_ip: Ipv4Addr,
    proxy_port: u16,
    events: &mut Vec<GameEvent>,
) -> Result<usize, PacketError> {
    // The length byte counts itself but not the trailing checksum; bit 7
    // is a flag and not part of the length.
    let block_length = (byte_at(buffer, pos_start, "block length")? & 0x7f) as usize;
    let pos_checksum = pos_start + block_length;
    let pos_next_block = pos_checksum + 2;

    if block_length < 4 {
        if block_length == 0 {
            return Ok(buffer.len());
        }
        return Ok(pos_next_block);
    }

    if pos_next_block > buffer.len() {
        return Err(PacketError::Truncated {
            context: "game state block",
            offset: pos_start,
            len: buffer.len(),
        });
    }

    let mut pos = pos_start + 2; // skip length and block sequence
    let sender_flags = buffer[pos] & 0xf0;
    let sender = buffer[pos] & 0x0f;
    pos += 1;
    let flags = buffer[pos];
    pos += 1;

    if flags & 0x80 > 0 {
        pos += 5;
    }

    if sender_flags & 0xe0 > 0 {
        pos += 3;
    }

    let mut rewrite_crc = false;

    while pos < pos_checksum {
        let (opcode, length) = parse_opcode(buffer, pos)?;
        if length == 0 {
            // The lookup table's zero slots are unreachable through normal
            // decoding; a zero advance would wedge the cursor.
            return Err(PacketError::Truncated {
                context: "zero length opcode",
                offset: pos,
                len: buffer.len(),
            });
        }

        match opcode {
            OPCODE_GAME_INFO => {
                let subcode = byte_at(buffer, pos + 1, "game info opcode")?;
                if subcode == OPCODE_GAME_INFO_SUBCODE_GAME {
                    rewrite_opcode_game_info(buffer, pos + 2, proxy_ip)?;
                    rewrite_crc = true;
                }
            }
            OPCODE_PLAYER_NAME => {
                if packet_sequence == 0x02 && buffer[pos_start] & 0x80 == 0 {
                    events.push(GameEvent::PlayerJoined { player_id: sender });
                }
                let name_length = byte_at(buffer, pos + 1, "player name opcode")? as usize;
                if buffer.len() < pos + 2 + name_length {
                    return Err(PacketError::Truncated {
                        context: "player name opcode",
                        offset: pos + 2,
                        len: buffer.len(),
                    });
                }
                let name =
                    String::from_utf8_lossy(&buffer[pos + 2..pos + 2 + name_length]).into_owned();
                events.push(GameEvent::PlayerNamed {
                    player_id: sender,
                    name,
                });
            }
            OPCODE_DISCONNECT => {
                if rewrite_opcode_player_info(buffer, pos + 2, proxy_ip, proxy_port)? {
                    events.push(GameEvent::PlayerLeftGame);
                }
                rewrite_crc = true;
            }
            _ => {}
        }

        pos += length;
    }

    if rewrite_crc {
        let crc = CRC_XMODEM.checksum(&buffer[pos_start..pos_checksum]);
        buffer[pos_checksum..pos_next_block].copy_from_slice(&crc.to_be_bytes());
    }

    Ok(pos_next_block)
}

/// Rewrites every block of a type-2 packet in place, collecting the
/// semantic events the opcodes imply. `proxy_port` is the sending
/// player's assigned proxy port.
pub fn rewrite_packet_game_state(
    buffer: &mut [u8],
    proxy_ip: Ipv4Addr,
    proxy_port: u16,
) -> Result<Vec<GameEvent>, PacketError> {
    let mut events = Vec::new();
    let mut pos = PACKET_HEADER_SIZE;
    let packet_sequence = byte_at(buffer, pos, "state sequence")?;
    pos += 1;

    while pos < buffer.len() {
        pos = rewrite_game_state_block(
            packet_sequence,
            pos,
            buffer,
            proxy_ip,
            proxy_port,
            &mut events,
        )?;
    }

    Ok(events)
}

//! The game-info advertisement (packet type 0x0e): the descriptor a Bolo
//! host broadcasts to trackers, and the identifier games are keyed by.

use std::fmt;
use std::net::Ipv4Addr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::packet::{
    PacketError, BOLO_SIGNATURE, BOLO_VERSION, PACKET_HEADER_SIZE, PACKET_TYPE_GAME_INFO,
};

/// Macs count time from midnight, 1st Jan 1904; Unix counts from 1970.
/// This adjusts for the 66 years and 17 leap days in between.
pub const SECONDS_1904_TO_UNIX_EPOCH: u32 = (((1970 - 1904) * 365 + 17) * 24 * 60 * 60) as u32;

const MINES_VISIBLE_BITMASK: u8 = 1 << 6;

/// The map-name field reserves 36 bytes: a length byte plus up to 35 of
/// text (hosts only ever use 32).
const MAP_NAME_FIELD_SIZE: usize = 36;

/// Total game-info payload, header excluded.
const GAME_INFO_PAYLOAD_SIZE: usize = 71;

/// Opaque 8-byte game identifier carried in game-info packets. Equality
/// is byte equality; the hex rendering is used everywhere a game needs a
/// printable name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GameId(pub [u8; 8]);

impl GameId {
    /// The id of a player who has not joined any game yet.
    pub const NONE: GameId = GameId([0; 8]);

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for GameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Everything a game-info packet says about a hosted game, plus the wall
/// clock at which this server first saw the game advertised.
#[derive(Debug, Clone, PartialEq)]
pub struct GameInfo {
    pub game_id: GameId,
    /// Set when the game is first observed and preserved across updates;
    /// the tracker sorts and ages games by it.
    pub server_start_timestamp: SystemTime,
    pub map_name: String,
    /// Raw 32-bit host clock, seconds since 1904-01-01 UTC.
    pub start_timestamp: u32,
    pub game_type: u8,
    pub allow_hidden_mines: bool,
    pub allow_computer: bool,
    pub computer_advantage: bool,
    pub start_delay: u32,
    pub time_limit: u32,
    pub player_count: u16,
    pub neutral_pillbox_count: u16,
    pub neutral_base_count: u16,
    pub has_password: bool,
}

/// Converts a Bolo host clock value to wall-clock UTC.
pub fn parse_bolo_timestamp(timestamp: u32) -> SystemTime {
    let seconds = i64::from(timestamp) - i64::from(SECONDS_1904_TO_UNIX_EPOCH);
    if seconds >= 0 {
        UNIX_EPOCH + Duration::from_secs(seconds as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(seconds.unsigned_abs())
    }
}

fn read_u16_le(buffer: &[u8], pos: usize) -> u16 {
    u16::from_le_bytes([buffer[pos], buffer[pos + 1]])
}

fn read_u32_le(buffer: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([buffer[pos], buffer[pos + 1], buffer[pos + 2], buffer[pos + 3]])
}

/// Parses a validated game-info packet (header included in `buffer`).
///
/// The embedded host IP is deliberately not retained: the relay replaces
/// it on the wire and it has no meaning server-side. `server_start_timestamp`
/// is stamped with the current wall clock; the tracker keeps the first
/// observation when updating a known game.
pub fn parse_packet_game_info(buffer: &[u8]) -> Result<GameInfo, PacketError> {
    if buffer.len() < PACKET_HEADER_SIZE + GAME_INFO_PAYLOAD_SIZE {
        return Err(PacketError::Truncated {
            context: "game info",
            offset: PACKET_HEADER_SIZE,
            len: buffer.len(),
        });
    }

    let mut pos = PACKET_HEADER_SIZE;

    let name_len = buffer[pos] as usize;
    if name_len >= MAP_NAME_FIELD_SIZE {
        return Err(PacketError::Truncated {
            context: "game info map name",
            offset: pos,
            len: buffer.len(),
        });
    }
    let map_name = String::from_utf8_lossy(&buffer[pos + 1..pos + 1 + name_len]).into_owned();
    pos += MAP_NAME_FIELD_SIZE;

    let mut game_id = [0u8; 8];
    game_id.copy_from_slice(&buffer[pos..pos + 8]);
    pos += 8;

    // Skip the host IP.
    pos += 4;

    let start_timestamp = u32::from_be_bytes([
        buffer[pos],
        buffer[pos + 1],
        buffer[pos + 2],
        buffer[pos + 3],
    ]);
    pos += 4;

    let game_type = buffer[pos];
    pos += 1;

    let allow_hidden_mines = buffer[pos] & MINES_VISIBLE_BITMASK != MINES_VISIBLE_BITMASK;
    pos += 1;

    let allow_computer = buffer[pos] > 0;
    pos += 1;

    let computer_advantage = buffer[pos] > 0;
    pos += 1;

    let start_delay = read_u32_le(buffer, pos);
    pos += 4;

    let time_limit = read_u32_le(buffer, pos);
    pos += 4;

    let player_count = read_u16_le(buffer, pos);
    pos += 2;

    let neutral_pillbox_count = read_u16_le(buffer, pos);
    pos += 2;

    let neutral_base_count = read_u16_le(buffer, pos);
    pos += 2;

    let has_password = buffer[pos] > 0;

    Ok(GameInfo {
        game_id: GameId(game_id),
        server_start_timestamp: SystemTime::now(),
        map_name,
        start_timestamp,
        game_type,
        allow_hidden_mines,
        allow_computer,
        computer_advantage,
        start_delay,
        time_limit,
        player_count,
        neutral_pillbox_count,
        neutral_base_count,
        has_password,
    })
}

/// Overwrites the host IP a game-info packet embeds with the proxy IP, so
/// downstream peers contact the relay rather than the host directly.
pub fn rewrite_packet_game_info(buffer: &mut [u8], proxy_ip: Ipv4Addr) -> Result<(), PacketError> {
    let pos = PACKET_HEADER_SIZE + MAP_NAME_FIELD_SIZE;
    if buffer.len() < pos + 4 {
        return Err(PacketError::Truncated {
            context: "game info host ip",
            offset: pos,
            len: buffer.len(),
        });
    }
    buffer[pos..pos + 4].copy_from_slice(&proxy_ip.octets());
    Ok(())
}

/// Builds a complete game-info packet for `info` as a Bolo host would
/// send it. The inverse of [`parse_packet_game_info`] for every retained
/// field; `host_ip` fills the slot the parse discards.
pub fn marshal_packet_game_info(info: &GameInfo, host_ip: Ipv4Addr) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(PACKET_HEADER_SIZE + GAME_INFO_PAYLOAD_SIZE);
    buffer.extend_from_slice(BOLO_SIGNATURE);
    buffer.extend_from_slice(&BOLO_VERSION);
    buffer.push(PACKET_TYPE_GAME_INFO);

    let name = info.map_name.as_bytes();
    let name_len = name.len().min(MAP_NAME_FIELD_SIZE - 1);
    buffer.push(name_len as u8);
    buffer.extend_from_slice(&name[..name_len]);
    buffer.resize(PACKET_HEADER_SIZE + MAP_NAME_FIELD_SIZE, 0);

    buffer.extend_from_slice(&info.game_id.0);
    buffer.extend_from_slice(&host_ip.octets());
    buffer.extend_from_slice(&info.start_timestamp.to_be_bytes());
    buffer.push(info.game_type);
    buffer.push(if info.allow_hidden_mines {
        0
    } else {
        MINES_VISIBLE_BITMASK
    });
    buffer.push(info.allow_computer as u8);
    buffer.push(info.computer_advantage as u8);
    buffer.extend_from_slice(&info.start_delay.to_le_bytes());
    buffer.extend_from_slice(&info.time_limit.to_le_bytes());
    buffer.extend_from_slice(&info.player_count.to_le_bytes());
    buffer.extend_from_slice(&info.neutral_pillbox_count.to_le_bytes());
    buffer.extend_from_slice(&info.neutral_base_count.to_le_bytes());
    buffer.push(info.has_password as u8);

    buffer
}

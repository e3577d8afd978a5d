//! # Bolo Protocol Library
//!
//! This crate contains everything the relay needs to know about the Bolo
//! wire format, shared between the server and its tests:
//!
//! - **Framing** (`packet`): the 8-byte header (signature, version, packet
//!   type), validation with distinct diagnostics, the fixed-offset peer
//!   endpoint rewrites, and construction of the server-synthesized NAT
//!   probe and keepalive datagrams.
//! - **Game info** (`game_info`): the game-info advertisement payload,
//!   its parse/marshal pair, and the 1904-epoch timestamp conversion.
//! - **Game state** (`game_state`): the block-structured type-2 payload,
//!   opcode decoding, targeted endpoint rewrites with CRC-16/XMODEM
//!   recomputation, and the semantic events the rewrite surfaces
//!   (player joined, player named, player leaving).
//!
//! The codec is deliberately free of I/O and async: it operates on byte
//! buffers in place and reports findings as return values, so the server
//! can exercise it under its state lock and the tests can exercise it
//! without a runtime. All traversal is bounds-checked; a malformed
//! datagram yields a [`PacketError`], never a panic.

pub mod game_info;
pub mod game_state;
pub mod packet;

pub use game_info::{parse_bolo_timestamp, GameId, GameInfo};
pub use game_state::GameEvent;
pub use packet::PacketError;

/// The largest safe UDP payload is 576 bytes for IPv4 ("safe" meaning
/// guaranteed reassemblable if fragmented); Bolo never comes close, so a
/// 1024-byte receive buffer leaves comfortable headroom.
pub const MAX_UDP_PACKET_SIZE: usize = 1024;

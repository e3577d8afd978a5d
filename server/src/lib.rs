//! # Bolorama Server Library
//!
//! A NAT-traversing UDP relay and tracker for the peer-to-peer game
//! Bolo. Players behind heterogeneous NATs cannot generally reach each
//! other directly, so the server presents itself as a single well-known
//! host: each player gets a stable proxy port on the public side, the
//! peer-discovery fields inside the game's own datagrams are rewritten
//! to name the proxy, and traffic is forwarded between the players of a
//! game — but only over forwarding paths a NAT-probe handshake has
//! proven within the last twenty seconds.
//!
//! ## Module Organization
//!
//! - `config` — the `key=value` configuration file, typed and validated
//!   at startup.
//! - `ports` — proxy port allocation from the fixed range.
//! - `route` — one UDP socket per player: receive loop onto the shared
//!   ingress channel, transmit loop off the player's egress channel.
//! - `state` — the authoritative players/games state under a single
//!   readers/writer lock, and the context handed to every task.
//! - `relay` — the dispatcher: classification, the NAT-probe state
//!   machine, rewrite-and-forward.
//! - `tracker` — game-info ingestion, keepalive pings, timeout-driven
//!   eviction, and the TCP text endpoint.
//! - `text` — the CR-terminated tracker text.
//! - `stats` — the optional SQLite statistics sink.
//! - `util` — outbound IP discovery and hex dumps.

pub mod config;
pub mod ports;
pub mod relay;
pub mod route;
pub mod state;
pub mod stats;
pub mod text;
pub mod tracker;
pub mod util;

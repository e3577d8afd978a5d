//! Small helpers with no better home.

use std::fmt::Write as _;
use std::io;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// Learns this machine's preferred outbound IPv4 address. Connecting a
/// UDP socket performs route selection without sending anything.
pub fn get_outbound_ip() -> io::Result<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("1.1.1.1:1")?;
    match socket.local_addr()?.ip() {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(ip) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("outbound interface is not IPv4 ({ip})"),
        )),
    }
}

/// Renders a buffer as offset-prefixed hex rows with an ASCII gutter,
/// for the diagnostics logged when a rewrite trips over a datagram.
pub fn hex_dump(buffer: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in buffer.chunks(16).enumerate() {
        let hex_row = chunk
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(" ");
        let ascii: String = chunk
            .iter()
            .map(|&b| if (0x20..0x7f).contains(&b) { b as char } else { '.' })
            .collect();
        let _ = writeln!(out, "{:08x}  {:<47}  |{}|", row * 16, hex_row, ascii);
    }
    out
}

//! The tracker's TCP text: a banner, one block per live game (newest
//! first), a count line, and the server-state table. Lines end with a
//! bare CR, which is what classic Bolo clients expect.

use std::fmt::Write as _;

use shared::GameInfo;

use crate::state::ServerState;

fn yes_no(value: bool) -> &'static str {
    if value {
        "Yes"
    } else {
        "No"
    }
}

fn mines_text(allow_hidden: bool) -> &'static str {
    if allow_hidden {
        "Hidden"
    } else {
        "Visible"
    }
}

fn game_type_name(game_type: u8) -> &'static str {
    match game_type {
        1 => "Open Game",
        2 => "Tournament",
        3 => "Strict Tournament",
        _ => "",
    }
}

fn game_duration_minutes(game: &GameInfo) -> u64 {
    game.server_start_timestamp
        .elapsed()
        .map(|elapsed| elapsed.as_secs() / 60)
        .unwrap_or(0)
}

/// Renders the full tracker text. The caller holds the state lock in
/// shared mode.
pub fn tracker_text(state: &ServerState, hostname: &str) -> String {
    let mut out = String::new();

    out.push_str("= =================================================================== =\r");
    out.push_str("=                         Astrospark Bolorama                         =\r");
    out.push_str("=                                                                     =\r");
    out.push_str("=                      http://bolo.astrospark.com                     =\r");
    out.push_str("= =================================================================== =\r");
    out.push_str("\r");

    let mut games: Vec<&GameInfo> = state.games.values().collect();
    games.sort_by(|a, b| b.server_start_timestamp.cmp(&a.server_start_timestamp));

    if games.is_empty() {
        out.push_str("   There are no games in progress.\r\r");
        return out;
    }

    for game in &games {
        let mut ports = state.game_player_ports(game.game_id);
        let players = state.game_player_names(game.game_id);
        ports.sort_unstable();
        let host_port = ports.first().copied().unwrap_or(0);
        out.push_str(&game_info_text(hostname, host_port, game, &players));
        out.push_str("\r");
    }

    if games.len() == 1 {
        out.push_str("   There is 1 game in progress.\r\r");
    } else {
        let _ = write!(out, "   There are {} games in progress.\r\r", games.len());
    }

    out.push_str(&state.sprint_server_state("\r"));

    out
}

fn game_info_text(hostname: &str, host_port: u16, game: &GameInfo, players: &[String]) -> String {
    let mut out = String::new();

    let _ = write!(out, "Host: {} {{{}}}", hostname, host_port);
    let _ = write!(out, "  Players: {}", game.player_count);
    let _ = write!(out, "  Bases: {}", game.neutral_base_count);
    let _ = write!(out, "  Pills: {}\r", game.neutral_pillbox_count);

    let _ = write!(out, "Map: {}", game.map_name);
    let _ = write!(out, "  Game: {}", game_type_name(game.game_type));
    let _ = write!(out, "  Mines: {}", mines_text(game.allow_hidden_mines));
    let _ = write!(out, "  Bots: {}", yes_no(game.allow_computer));
    let _ = write!(out, "  PW: {}\r", yes_no(game.has_password));

    out.push_str("Version: 0.99.8");
    let _ = write!(out, "  Tracked-For: {} minutes", game_duration_minutes(game));
    out.push_str("  Player-List:\r");

    // Wrap the name list so no line passes 80 columns.
    let mut start_idx = 0;
    let mut line_length = 0;
    for (i, player) in players.iter().enumerate() {
        let player_length = player.len();
        if line_length + player_length + 2 > 80 {
            let _ = write!(out, "   {}", players[start_idx..i].join(", "));
            if i < players.len() {
                out.push_str(", ");
            }
            out.push_str("\r");
            start_idx = i;
            line_length = 0;
        } else {
            line_length += player_length + 2;
        }
    }
    let _ = write!(out, "   {}\r", players[start_idx..].join(", "));

    out
}

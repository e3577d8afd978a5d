//! The statistics sink.
//!
//! Consumes three event channels (game end, player join, player leave)
//! and a 60-second tick during which it snapshots the live games and
//! players and upserts one row per game. Identifiers never reach the
//! database raw: games are keyed by the SHA-256 of their GameId, player
//! sessions by the SHA-256 of the player's external `(IPv4, port)`.
//!
//! When statistics are disabled the sink still runs, draining the
//! channels and discarding the events. Backend errors are logged and
//! never reach the data plane.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use log::{info, warn};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::interval_at;

use shared::GameId;

use crate::state::{PlayerAddr, ServerContext};

const LOG_INTERVAL: Duration = Duration::from_secs(60);
const ELAPSED_MINUTES_PER_LOG_INTERVAL: i64 = 1;
const SCHEMA_VERSION: i64 = 1;

/// The sending half of the sink, cloned into the state manager. Sends
/// never fail visibly; if the logger is gone the events just vanish.
#[derive(Clone)]
pub struct StatsSender {
    game_end: UnboundedSender<GameId>,
    player_join: UnboundedSender<PlayerAddr>,
    player_leave: UnboundedSender<PlayerAddr>,
}

impl StatsSender {
    pub fn game_end(&self, game_id: GameId) {
        let _ = self.game_end.send(game_id);
    }

    pub fn player_join(&self, player_addr: PlayerAddr) {
        let _ = self.player_join.send(player_addr);
    }

    pub fn player_leave(&self, player_addr: PlayerAddr) {
        let _ = self.player_leave.send(player_addr);
    }
}

pub struct StatsReceivers {
    pub game_end: UnboundedReceiver<GameId>,
    pub player_join: UnboundedReceiver<PlayerAddr>,
    pub player_leave: UnboundedReceiver<PlayerAddr>,
}

pub fn channel() -> (StatsSender, StatsReceivers) {
    let (game_end_tx, game_end_rx) = mpsc::unbounded_channel();
    let (player_join_tx, player_join_rx) = mpsc::unbounded_channel();
    let (player_leave_tx, player_leave_rx) = mpsc::unbounded_channel();
    (
        StatsSender {
            game_end: game_end_tx,
            player_join: player_join_tx,
            player_leave: player_leave_tx,
        },
        StatsReceivers {
            game_end: game_end_rx,
            player_join: player_join_rx,
            player_leave: player_leave_rx,
        },
    )
}

/// One row of the `game` table.
#[derive(Debug, Clone)]
struct DataGame {
    game_id: String,
    map_name: String,
    start_timestamp: i64,
    max_player_count: i64,
    elapsed_player_minutes: i64,
}

/// Opens (creating if missing) the statistics database and initializes
/// the schema on first use. A single connection is plenty for a
/// once-a-minute workload.
pub async fn init_database(filename: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(filename)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    let tables: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE name = 'config' AND type = 'table'",
    )
    .fetch_one(&pool)
    .await?;

    if tables == 0 {
        init_tables(&pool).await?;
    }

    Ok(pool)
}

async fn init_tables(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE game (
            id TEXT PRIMARY KEY,
            map_name TEXT NOT NULL,
            started_at TEXT NOT NULL,
            ended_at TEXT,
            max_player_count INTEGER NOT NULL,
            elapsed_player_minutes INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE player_session (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            player_id TEXT NOT NULL,
            joined_at TEXT NOT NULL,
            left_at TEXT
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE TABLE config (name TEXT PRIMARY KEY, value TEXT)")
        .execute(pool)
        .await?;

    sqlx::query("INSERT INTO config (name, value) VALUES (?1, ?2)")
        .bind("schema_version")
        .bind(SCHEMA_VERSION)
        .execute(pool)
        .await?;

    Ok(())
}

/// Runs the sink until shutdown, against SQLite when a pool is
/// configured, otherwise in drain-and-discard mode.
pub async fn logger(ctx: Arc<ServerContext>, receivers: StatsReceivers, pool: Option<SqlitePool>) {
    match pool {
        Some(pool) => logger_sql(ctx, receivers, pool).await,
        None => logger_none(ctx, receivers).await,
    }
    info!("Stopped statistics");
}

async fn logger_none(ctx: Arc<ServerContext>, mut receivers: StatsReceivers) {
    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => return,
            event = receivers.game_end.recv() => if event.is_none() { return },
            event = receivers.player_join.recv() => if event.is_none() { return },
            event = receivers.player_leave.recv() => if event.is_none() { return },
        }
    }
}

async fn logger_sql(ctx: Arc<ServerContext>, mut receivers: StatsReceivers, pool: SqlitePool) {
    let start = tokio::time::Instant::now() + LOG_INTERVAL;
    let mut ticker = interval_at(start, LOG_INTERVAL);

    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => return,
            _ = ticker.tick() => log_games(&ctx, &pool).await,
            event = receivers.game_end.recv() => match event {
                Some(game_id) => log_end_game(&pool, game_id).await,
                None => return,
            },
            event = receivers.player_join.recv() => match event {
                Some(player_addr) => log_player_join(&pool, &player_addr).await,
                None => return,
            },
            event = receivers.player_leave.recv() => match event {
                Some(player_addr) => log_player_leave(&pool, &player_addr).await,
                None => return,
            },
        }
    }
}

/// Snapshots the live games and players and upserts one row per game:
/// the max population ever seen and the accumulated player-minutes.
async fn log_games(ctx: &ServerContext, pool: &SqlitePool) {
    let mut games: HashMap<String, DataGame> = HashMap::new();
    {
        let state = ctx.state.read().await;
        for (game_id, game) in &state.games {
            let key = hash_game_id(game_id);
            let started = game
                .server_start_timestamp
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs() as i64)
                .unwrap_or(0);
            games.insert(
                key.clone(),
                DataGame {
                    game_id: key,
                    map_name: game.map_name.clone(),
                    start_timestamp: started,
                    max_player_count: 0,
                    elapsed_player_minutes: 0,
                },
            );
        }
        for player in &state.players {
            if let Some(game) = games.get_mut(&hash_game_id(&player.game_id)) {
                game.max_player_count += 1;
            }
        }
    }

    let game_ids: Vec<String> = games.keys().cloned().collect();
    let db_games = match select_games(pool, &game_ids).await {
        Ok(rows) => rows,
        Err(err) => {
            warn!("statistics select failed: {}", err);
            return;
        }
    };

    for (game_id, mut game) in games {
        let result = match db_games.iter().find(|db_game| db_game.game_id == game_id) {
            Some(db_game) => {
                // A lone idling player accrues no minutes until the game
                // has either history or company.
                if db_game.elapsed_player_minutes > 0 || game.max_player_count > 1 {
                    game.elapsed_player_minutes = db_game.elapsed_player_minutes
                        + game.max_player_count * ELAPSED_MINUTES_PER_LOG_INTERVAL;
                } else {
                    game.elapsed_player_minutes = db_game.elapsed_player_minutes;
                }
                game.max_player_count = game.max_player_count.max(db_game.max_player_count);
                update_game(pool, &game).await
            }
            None => insert_game(pool, &game).await,
        };

        if let Err(err) = result {
            warn!("statistics write failed: {}", err);
        }
    }
}

async fn select_games(pool: &SqlitePool, game_ids: &[String]) -> Result<Vec<DataGame>, sqlx::Error> {
    if game_ids.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = vec!["?"; game_ids.len()].join(",");
    let sql = format!(
        "SELECT id, map_name, max_player_count, elapsed_player_minutes \
         FROM game WHERE id IN ({placeholders})"
    );

    let mut query = sqlx::query(&sql);
    for game_id in game_ids {
        query = query.bind(game_id);
    }

    let rows = query.fetch_all(pool).await?;
    Ok(rows
        .into_iter()
        .map(|row| DataGame {
            game_id: row.get("id"),
            map_name: row.get("map_name"),
            start_timestamp: 0,
            max_player_count: row.get("max_player_count"),
            elapsed_player_minutes: row.get("elapsed_player_minutes"),
        })
        .collect())
}

async fn insert_game(pool: &SqlitePool, game: &DataGame) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO game (id, map_name, started_at, max_player_count, elapsed_player_minutes) \
         VALUES (?1, ?2, datetime(?3, 'unixepoch'), ?4, ?5)",
    )
    .bind(&game.game_id)
    .bind(&game.map_name)
    .bind(game.start_timestamp)
    .bind(game.max_player_count)
    .bind(game.elapsed_player_minutes)
    .execute(pool)
    .await?;
    Ok(())
}

async fn update_game(pool: &SqlitePool, game: &DataGame) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE game SET max_player_count = ?1, elapsed_player_minutes = ?2 WHERE id = ?3",
    )
    .bind(game.max_player_count)
    .bind(game.elapsed_player_minutes)
    .bind(&game.game_id)
    .execute(pool)
    .await?;
    Ok(())
}

async fn log_end_game(pool: &SqlitePool, game_id: GameId) {
    let result = sqlx::query("UPDATE game SET ended_at = datetime('now') WHERE id = ?1")
        .bind(hash_game_id(&game_id))
        .execute(pool)
        .await;
    if let Err(err) = result {
        warn!("statistics game end failed: {}", err);
    }
}

async fn log_player_join(pool: &SqlitePool, player_addr: &PlayerAddr) {
    let result = sqlx::query(
        "INSERT INTO player_session (player_id, joined_at) VALUES (?1, datetime('now'))",
    )
    .bind(hash_player_addr(player_addr))
    .execute(pool)
    .await;
    if let Err(err) = result {
        warn!("statistics player join failed: {}", err);
    }
}

async fn log_player_leave(pool: &SqlitePool, player_addr: &PlayerAddr) {
    let result = sqlx::query(
        "UPDATE player_session SET left_at = datetime('now') \
         WHERE id IN (SELECT max(id) FROM player_session WHERE player_id = ?1) \
         AND left_at IS NULL",
    )
    .bind(hash_player_addr(player_addr))
    .execute(pool)
    .await;
    if let Err(err) = result {
        warn!("statistics player leave failed: {}", err);
    }
}

fn hash_game_id(game_id: &GameId) -> String {
    hex::encode(Sha256::digest(game_id.as_bytes()))
}

/// Players are identified by the SHA-256 of their packed external
/// `(IPv4, port)` — six bytes, port big-endian.
fn hash_player_addr(player_addr: &PlayerAddr) -> String {
    let mut player_id = [0u8; 6];
    if let IpAddr::V4(ip) = player_addr.addr.ip() {
        player_id[..4].copy_from_slice(&ip.octets());
    }
    player_id[4..6].copy_from_slice(&player_addr.addr.port().to_be_bytes());
    hex::encode(Sha256::digest(player_id))
}

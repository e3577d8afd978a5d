//! Configuration file loading.
//!
//! The config is a flat file of `key=value` lines. Every key has a
//! default except `hostname`, which operators must set; unknown keys are
//! ignored so a config can be shared across server versions. All
//! problems here are fatal at startup — the server never runs with a
//! half-understood configuration.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

const VALID_KEYS: [&str; 8] = [
    "database_filename",
    "debug",
    "enable_statistics",
    "hostname",
    "game_info_ping_seconds",
    "player_timeout_seconds",
    "tracker_debug_port",
    "tracker_port",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to open config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config line: {0}")]
    MalformedLine(String),
    #[error("config property is not present: {0}")]
    MissingKey(&'static str),
    #[error("config property is not an integer: {0}")]
    NotAnInteger(&'static str),
    #[error("config property is not a boolean: {0}")]
    NotABoolean(&'static str),
}

/// Fully-typed server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Advertised host string in the tracker text.
    pub hostname: String,
    /// UDP + TCP bind port for game info and the tracker text endpoint.
    pub tracker_port: u16,
    /// Enables verbose diagnostics.
    pub debug: bool,
    /// Keepalive interval for per-player pings.
    pub game_info_ping_interval: Duration,
    /// How long a silent player survives before eviction.
    pub player_timeout: Duration,
    /// Statistics database location.
    pub database_filename: String,
    /// Turns the statistics sink on.
    pub enable_statistics: bool,
    /// Alternate diagnostic UDP port.
    pub tracker_debug_port: u16,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&contents)
    }

    fn parse(contents: &str) -> Result<Self, ConfigError> {
        let mut map: HashMap<&str, String> = HashMap::new();
        for (key, value) in defaults() {
            map.insert(key, value.to_string());
        }

        for line in contents.lines() {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| ConfigError::MalformedLine(line.to_string()))?;
            if let Some(valid) = VALID_KEYS.iter().find(|&&k| k == key) {
                map.insert(valid, value.to_string());
            }
        }

        Ok(Config {
            hostname: get_string(&map, "hostname")?,
            tracker_port: get_port(&map, "tracker_port")?,
            debug: get_bool(&map, "debug")?,
            game_info_ping_interval: Duration::from_secs(get_int(&map, "game_info_ping_seconds")?),
            player_timeout: Duration::from_secs(get_int(&map, "player_timeout_seconds")?),
            database_filename: get_string(&map, "database_filename")?,
            enable_statistics: get_bool(&map, "enable_statistics")?,
            tracker_debug_port: get_port(&map, "tracker_debug_port")?,
        })
    }
}

fn defaults() -> [(&'static str, &'static str); 7] {
    [
        ("database_filename", "db.sqlite"),
        ("debug", "false"),
        ("enable_statistics", "false"),
        ("game_info_ping_seconds", "20"),
        ("player_timeout_seconds", "60"),
        ("tracker_debug_port", "50001"),
        ("tracker_port", "50000"),
    ]
}

fn get_string(map: &HashMap<&str, String>, key: &'static str) -> Result<String, ConfigError> {
    map.get(key).cloned().ok_or(ConfigError::MissingKey(key))
}

fn get_int(map: &HashMap<&str, String>, key: &'static str) -> Result<u64, ConfigError> {
    get_string(map, key)?
        .parse()
        .map_err(|_| ConfigError::NotAnInteger(key))
}

fn get_port(map: &HashMap<&str, String>, key: &'static str) -> Result<u16, ConfigError> {
    get_string(map, key)?
        .parse()
        .map_err(|_| ConfigError::NotAnInteger(key))
}

fn get_bool(map: &HashMap<&str, String>, key: &'static str) -> Result<bool, ConfigError> {
    match get_string(map, key)?.to_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ConfigError::NotABoolean(key)),
    }
}

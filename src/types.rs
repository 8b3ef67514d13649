//! Core data model shared by the ingest, registry, and maintenance paths.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Port assumed when a beacon reports `port: 0`.
pub const DEFAULT_QUERY_PORT: u16 = 27016;

/// Report kind assumed when a beacon leaves `type` empty.
pub const GENERIC_KIND: &str = "generic";

/// A validated telemetry report from a game server.
///
/// The source IP is never taken from the report body; the HTTP layer
/// resolves it from the connection (or trusted proxy headers) and carries
/// it alongside the beacon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    /// Product identifier, e.g. "MetricZ".
    pub application: String,
    /// Query protocol hint ("steam", "a2s", ...); empty means generic.
    pub kind: String,
    /// Reporting mod version.
    pub version: String,
    /// Game port the server listens on.
    pub port: u16,
}

/// A tracked game-server endpoint, keyed by `(application, ip, port)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub application: String,
    pub ip: String,
    pub port: u16,
    pub version: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// ISO country code; empty when unknown.
    pub country_code: String,
    // Live-query snapshot. The registry merge moves these seven fields as
    // one group; a non-empty server_name marks the snapshot as valid.
    pub server_name: String,
    pub map_name: String,
    pub players: u8,
    pub max_players: u8,
    pub game_version: String,
    pub game_name: String,
    pub server_os: String,
    /// Total accepted observations for this endpoint.
    pub count: i64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Node {
    /// Build the initial record for one observation, with no enrichment data.
    pub fn from_beacon(beacon: &Beacon, ip: String, observed_at: DateTime<Utc>) -> Self {
        Self {
            application: beacon.application.clone(),
            ip,
            port: beacon.port,
            version: beacon.version.clone(),
            kind: beacon.kind.clone(),
            country_code: String::new(),
            server_name: String::new(),
            map_name: String::new(),
            players: 0,
            max_players: 0,
            game_version: String::new(),
            game_name: String::new(),
            server_os: String::new(),
            count: 1,
            first_seen: observed_at,
            last_seen: observed_at,
        }
    }

    /// Copy a successful live-query reply into the enrichment group.
    pub fn apply_server_info(&mut self, info: &ServerInfo) {
        self.server_name = info.name.clone();
        self.map_name = info.map.clone();
        self.players = info.players;
        self.max_players = info.max_players;
        self.game_version = info.version.clone();
        self.game_name = info.game.clone();
        self.server_os = info.environment.to_string();
    }

    /// Whether this endpoint ever answered a live query.
    pub fn is_enriched(&self) -> bool {
        !self.server_name.is_empty()
    }
}

/// Decoded reply from a live game-server info query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub map: String,
    pub game: String,
    pub version: String,
    pub players: u8,
    pub max_players: u8,
    pub environment: ServerOs,
}

/// Operating system a game server reports in its info reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerOs {
    Linux,
    Windows,
    Mac,
}

impl fmt::Display for ServerOs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerOs::Linux => "Linux",
            ServerOs::Windows => "Windows",
            ServerOs::Mac => "Mac",
        };
        write!(f, "{}", s)
    }
}

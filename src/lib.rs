//! nodebeat: telemetry ingestion and liveness tracking for game-server fleets.
//!
//! Game servers running a reporting mod POST small JSON beacons here.
//! The service decides which beacons are worth processing (a hard per-IP
//! rate limit plus a soft per-endpoint suppression window), enriches the
//! admitted ones off the request path (live A2S query, IP-to-country
//! lookup), and folds them into a SQLite registry keyed by
//! (application, ip, port). A bearer-protected admin API exposes the
//! registry; offline maintenance commands prune and re-verify it.

pub mod admission;
pub mod config;
pub mod daemon;
pub mod enrich;
pub mod ingest;
pub mod maintenance;
pub mod registry;
pub mod types;

pub use config::Config;
pub use types::*;

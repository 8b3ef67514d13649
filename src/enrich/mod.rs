//! Enrichment of tracked endpoints with live server data.
//!
//! Two collaborators hang off trait seams so the ingest workers and the
//! maintenance pool can be exercised without real servers: a
//! [`ServerProber`] that speaks the game-server query protocol over UDP,
//! and a [`CountryResolver`] that maps an IP to a country code.

mod a2s;
mod geo;

pub use a2s::A2sProber;
pub use geo::PrefixResolver;

use crate::types::ServerInfo;
use anyhow::Result;
use async_trait::async_trait;
use std::net::Ipv4Addr;

/// Live info query against a single game server.
#[async_trait]
pub trait ServerProber: Send + Sync {
    async fn probe(&self, ip: &str, port: u16) -> Result<ServerInfo>;
}

/// IP-to-country lookup. Misses are expected and yield `None`.
pub trait CountryResolver: Send + Sync {
    fn country_code(&self, ip: &str) -> Option<String>;
}

/// Rewrite the IPv6 loopback to its IPv4 form so local test beacons
/// still reach a probeable address.
pub fn normalize_probe_ip(ip: &str) -> &str {
    if ip == "::1" {
        "127.0.0.1"
    } else {
        ip
    }
}

/// Whether a beacon's declared kind and source address qualify for a
/// live query. Only Source-protocol kinds over IPv4 are probed.
pub fn is_queryable(kind: &str, ip: &str) -> bool {
    matches!(kind, "steam" | "a2s") && ip.parse::<Ipv4Addr>().is_ok()
}

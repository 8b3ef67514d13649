//! Country resolution from a configured CIDR prefix table.
//!
//! Deliberately small: operators hand us a table of IPv4 prefixes and ISO
//! codes, and lookups take the longest matching prefix. No database files,
//! no refresh machinery.

use super::CountryResolver;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use tracing::warn;

pub struct PrefixResolver {
    entries: Vec<PrefixEntry>,
}

struct PrefixEntry {
    network: u32,
    prefix_len: u8,
    country: String,
}

impl PrefixResolver {
    /// Build a resolver from `"prefix" -> "CC"` pairs. Entries that do not
    /// parse as IPv4 CIDR are skipped with a warning.
    pub fn from_table(table: &HashMap<String, String>) -> Self {
        let mut entries: Vec<PrefixEntry> = table
            .iter()
            .filter_map(|(cidr, country)| match parse_prefix(cidr) {
                Some((network, prefix_len)) => Some(PrefixEntry {
                    network,
                    prefix_len,
                    country: country.clone(),
                }),
                None => {
                    warn!(prefix = %cidr, "ignoring invalid country_table entry");
                    None
                }
            })
            .collect();
        // longest prefix first, so the first hit wins
        entries.sort_by(|a, b| b.prefix_len.cmp(&a.prefix_len));
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CountryResolver for PrefixResolver {
    fn country_code(&self, ip: &str) -> Option<String> {
        let addr: Ipv4Addr = ip.parse().ok()?;
        let bits = u32::from(addr);
        self.entries
            .iter()
            .find(|e| bits & mask(e.prefix_len) == e.network)
            .map(|e| e.country.clone())
    }
}

fn parse_prefix(s: &str) -> Option<(u32, u8)> {
    let (addr, len) = match s.split_once('/') {
        Some((addr, len)) => (addr, len.parse::<u8>().ok()?),
        None => (s, 32),
    };
    if len > 32 {
        return None;
    }
    let addr: Ipv4Addr = addr.parse().ok()?;
    Some((u32::from(addr) & mask(len), len))
}

fn mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len)
    }
}

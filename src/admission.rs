//! Dual-layer admission control for the telemetry endpoint.
//!
//! Layer one is a per-IP token bucket: it bounds how fast any single
//! address can hit the service at all, and trips with an explicit refusal.
//! Layer two is a per-endpoint suppression window: a server that beacons
//! again within the window is acknowledged but not counted, so flapping
//! mods and aggressive retry loops cannot inflate observation counts.
//!
//! The hard check always runs first, and a suppressed repeat does not get
//! its token back. Both layers grow with traffic and rely on periodic
//! sweeps to stay bounded.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Count it and enqueue it.
    Accept,
    /// Recently seen endpoint; acknowledge without counting.
    SoftReject,
    /// IP over its burst allowance; refuse outright.
    HardReject,
}

/// Gate tunables.
#[derive(Debug, Clone, Copy)]
pub struct GateLimits {
    /// Beacons one IP may burst before hard rejection.
    pub hard_count: u32,
    /// Window over which the burst allowance refills.
    pub hard_window: Duration,
    /// Window during which repeats of one endpoint are suppressed.
    pub soft_window: Duration,
}

impl Default for GateLimits {
    fn default() -> Self {
        Self {
            hard_count: 8,
            hard_window: Duration::from_secs(60),
            soft_window: Duration::from_secs(300),
        }
    }
}

/// Hard-limiter entries idle for this many windows are swept.
const IDLE_WINDOWS: u32 = 10;

/// Size snapshot of the gate's two layers.
#[derive(Debug, Clone, Copy)]
pub struct GateStats {
    pub tracked_ips: usize,
    pub suppressed_endpoints: usize,
}

pub struct AdmissionGate {
    limits: GateLimits,
    buckets: Mutex<HashMap<String, TokenBucket>>,
    seen: DashMap<String, Instant>,
}

impl AdmissionGate {
    pub fn new(limits: GateLimits) -> Self {
        Self {
            limits,
            buckets: Mutex::new(HashMap::new()),
            seen: DashMap::new(),
        }
    }

    /// Admit a beacon from `ip` for the endpoint key `"ip:port"`.
    pub fn admit(&self, ip: &str, endpoint: &str) -> Admission {
        self.admit_at(ip, endpoint, Instant::now())
    }

    /// Admission check with an explicit clock; tests drive time through here.
    pub fn admit_at(&self, ip: &str, endpoint: &str, now: Instant) -> Admission {
        let capacity = self.limits.hard_count as f64;
        let refill_per_sec = capacity / self.limits.hard_window.as_secs_f64();

        let allowed = {
            let mut buckets = self.buckets.lock();
            let bucket = buckets
                .entry(ip.to_string())
                .or_insert_with(|| TokenBucket::full(capacity, now));
            bucket.try_take(capacity, refill_per_sec, now)
        };
        if !allowed {
            return Admission::HardReject;
        }

        // No refunds: a suppressed repeat still spent its token.
        if let Some(last) = self.seen.get(endpoint) {
            if now.saturating_duration_since(*last) < self.limits.soft_window {
                return Admission::SoftReject;
            }
        }
        self.seen.insert(endpoint.to_string(), now);
        Admission::Accept
    }

    /// Drop suppression entries older than the soft window.
    pub fn sweep_soft(&self) {
        self.sweep_soft_at(Instant::now())
    }

    pub fn sweep_soft_at(&self, now: Instant) {
        let window = self.limits.soft_window;
        let before = self.seen.len();
        self.seen
            .retain(|_, seen_at| now.saturating_duration_since(*seen_at) < window);
        let removed = before.saturating_sub(self.seen.len());
        if removed > 0 {
            debug!(removed, "swept expired suppression entries");
        }
    }

    /// Drop hard-limiter state for IPs that have gone quiet.
    pub fn sweep_hard(&self) {
        self.sweep_hard_at(Instant::now())
    }

    pub fn sweep_hard_at(&self, now: Instant) {
        let idle_cutoff = self.limits.hard_window * IDLE_WINDOWS;
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, bucket| now.saturating_duration_since(bucket.last_seen) < idle_cutoff);
        let removed = before - buckets.len();
        if removed > 0 {
            debug!(removed, "swept idle rate-limiter entries");
        }
    }

    pub fn stats(&self) -> GateStats {
        GateStats {
            tracked_ips: self.buckets.lock().len(),
            suppressed_endpoints: self.seen.len(),
        }
    }
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

impl TokenBucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
            last_seen: now,
        }
    }

    fn try_take(&mut self, capacity: f64, refill_per_sec: f64, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(capacity);
        self.last_refill = now;
        self.last_seen = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

// Blockstash - Cached Chain Data Service
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Runtime counters and the stats snapshot served on `/stats`

use crate::store::StoreCounts;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

/// Monotonic event counter
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Records one event
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Events recorded so far
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Live counters of the resolution chain
#[derive(Debug, Default)]
pub struct ResolverMetrics {
    /// Tag lookups answered by the fast cache
    pub cache_hits: Counter,
    /// Tag lookups that fell through the fast cache
    pub cache_misses: Counter,
    /// Lookups answered by the persistent store
    pub store_hits: Counter,
    /// Lookups that fell through the persistent store
    pub store_misses: Counter,
    /// Upstream fetches attempted
    pub gateway_fetches: Counter,
    /// Upstream fetches that failed with something other than not-found
    pub gateway_failures: Counter,
    /// Best-effort cache or store writes that failed
    pub write_back_failures: Counter,
    /// Receipts returned without a resolved sender
    pub sender_recovery_failures: Counter,
}

impl ResolverMetrics {
    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> ResolverStats {
        ResolverStats {
            cache_hits: self.cache_hits.get(),
            cache_misses: self.cache_misses.get(),
            store_hits: self.store_hits.get(),
            store_misses: self.store_misses.get(),
            gateway_fetches: self.gateway_fetches.get(),
            gateway_failures: self.gateway_failures.get(),
            write_back_failures: self.write_back_failures.get(),
            sender_recovery_failures: self.sender_recovery_failures.get(),
        }
    }
}

/// Snapshot of [`ResolverMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverStats {
    /// Tag lookups answered by the fast cache
    pub cache_hits: u64,
    /// Tag lookups that fell through the fast cache
    pub cache_misses: u64,
    /// Lookups answered by the persistent store
    pub store_hits: u64,
    /// Lookups that fell through the persistent store
    pub store_misses: u64,
    /// Upstream fetches attempted
    pub gateway_fetches: u64,
    /// Upstream fetches that failed
    pub gateway_failures: u64,
    /// Failed best-effort writes
    pub write_back_failures: u64,
    /// Receipts returned without a sender
    pub sender_recovery_failures: u64,
}

impl ResolverStats {
    /// Share of lookups served without going upstream, as a percentage
    pub fn local_hit_rate(&self) -> f64 {
        let hits = self.cache_hits + self.store_hits;
        let total = hits + self.cache_misses + self.store_misses;
        if total == 0 {
            0.0
        } else {
            (hits as f64 / total as f64) * 100.0
        }
    }
}

/// Live counters of one tag poller
#[derive(Debug, Default)]
pub struct PollerMetrics {
    /// Ticks that refreshed the cache
    pub ticks_ok: Counter,
    /// Ticks that failed or panicked
    pub ticks_failed: Counter,
}

impl PollerMetrics {
    /// Point-in-time copy of both counters
    pub fn snapshot(&self) -> PollerStats {
        PollerStats { ticks_ok: self.ticks_ok.get(), ticks_failed: self.ticks_failed.get() }
    }
}

/// Snapshot of [`PollerMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollerStats {
    /// Successful ticks
    pub ticks_ok: u64,
    /// Failed ticks
    pub ticks_failed: u64,
}

/// Live counters of the admission controller
#[derive(Debug, Default)]
pub struct AdmissionMetrics {
    /// Requests let through
    pub admitted: Counter,
    /// Requests turned away
    pub rejected: Counter,
}

/// Snapshot of the admission controller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionStats {
    /// Requests let through
    pub admitted: u64,
    /// Requests turned away
    pub rejected: u64,
    /// Clients currently tracked
    pub visitors: u64,
}

/// Everything `/stats` reports
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    /// Seconds since the service was built
    pub uptime_seconds: u64,
    /// JSON-RPC requests sent upstream, when the gateway counts them
    pub upstream_requests: Option<u64>,
    /// Resolution chain counters
    pub resolver: ResolverStats,
    /// Per-tag poller counters
    pub pollers: BTreeMap<String, PollerStats>,
    /// Admission counters
    pub admission: AdmissionStats,
    /// Fast cache utilization, when the cache reports it
    pub cache: Option<serde_json::Value>,
    /// Store row counts, when the store reports them
    pub store: Option<StoreCounts>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolver_snapshot() {
        let metrics = ResolverMetrics::default();
        metrics.cache_hits.incr();
        metrics.cache_hits.incr();
        metrics.store_misses.incr();
        metrics.gateway_fetches.incr();

        let stats = metrics.snapshot();
        assert_eq!(stats.cache_hits, 2);
        assert_eq!(stats.store_misses, 1);
        assert_eq!(stats.gateway_fetches, 1);
        assert_eq!(stats.gateway_failures, 0);
        assert!((stats.local_hit_rate() - 200.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_hit_rate() {
        assert_eq!(ResolverStats::default().local_hit_rate(), 0.0);
    }

    #[test]
    fn test_poller_snapshot() {
        let metrics = PollerMetrics::default();
        metrics.ticks_ok.incr();
        metrics.ticks_failed.incr();
        metrics.ticks_ok.incr();
        assert_eq!(metrics.snapshot(), PollerStats { ticks_ok: 2, ticks_failed: 1 });
    }
}

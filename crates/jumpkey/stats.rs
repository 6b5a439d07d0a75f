use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters kept by a loaded image.
#[derive(Debug, Default)]
pub struct PatchStats {
    barriers: AtomicU64,
    barrier_timeouts: AtomicU64,
    sites_patched: AtomicU64,
    transitions: AtomicU64,
    trap_hits: AtomicU64,
    wild_fetches: AtomicU64,
}

/// A point-in-time copy of [`PatchStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Safe-point barriers that completed.
    pub barriers: u64,
    /// Barrier attempts that overran their bound.
    pub barrier_timeouts: u64,
    /// Site rewrites installed.
    pub sites_patched: u64,
    /// Physical key transitions (off to on or on to off) installed.
    pub transitions: u64,
    /// Fetches that landed on an `int3` and were answered by the handler.
    pub trap_hits: u64,
    /// Fetches that decoded to something a site can never hold. Always zero
    /// unless the text was corrupted.
    pub wild_fetches: u64,
}

impl PatchStats {
    pub(crate) fn record_barrier(&self) {
        self.barriers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_barrier_timeout(&self) {
        self.barrier_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_patched(&self, sites: usize, transitions: usize) {
        #[expect(clippy::as_conversions, reason = "usize counts fit in u64")]
        {
            self.sites_patched.fetch_add(sites as u64, Ordering::Relaxed);
            self.transitions
                .fetch_add(transitions as u64, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn record_trap_hit(&self) {
        self.trap_hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_wild_fetch(&self) {
        self.wild_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            barriers: self.barriers.load(Ordering::Relaxed),
            barrier_timeouts: self.barrier_timeouts.load(Ordering::Relaxed),
            sites_patched: self.sites_patched.load(Ordering::Relaxed),
            transitions: self.transitions.load(Ordering::Relaxed),
            trap_hits: self.trap_hits.load(Ordering::Relaxed),
            wild_fetches: self.wild_fetches.load(Ordering::Relaxed),
        }
    }
}

//! Safe points for execution contexts.
//!
//! Every execution context owns a slot with a sequence number that is odd
//! while the context is fetching a site and even otherwise. A barrier
//! snapshots the odd slots and waits for each of them to move on; once it
//! returns, no context is still working from bytes fetched before the
//! barrier started.
//!
//! The ordering argument is the usual store-then-load handshake: a context
//! bumps its sequence (`SeqCst`) before loading the site, and the patcher
//! stores `int3` (`SeqCst`) before reading the sequences. Either the context
//! sees the `int3`, or the patcher sees the context mid-fetch and waits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;
use tracing::warn;

use crate::config::PatchConfig;
use crate::errors::PatchError;
use crate::stats::PatchStats;

/// Forces every execution context through a safe point.
pub trait SyncCore: Send + Sync {
    /// Wait until every context that was mid-fetch when the call started has
    /// left that fetch. Returns `false` if that took longer than `bound`.
    fn sync_core(&self, bound: Duration) -> bool;
}

#[derive(Debug, Default)]
pub(crate) struct ContextSlot {
    seq: AtomicU64,
}

impl ContextSlot {
    #[inline]
    pub(crate) fn enter(&self) {
        self.seq.fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn exit(&self) {
        self.seq.fetch_add(1, Ordering::Release);
    }
}

/// The set of registered execution contexts.
#[derive(Debug, Default)]
pub struct ContextRegistry {
    slots: Mutex<Vec<Arc<ContextSlot>>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self) -> Arc<ContextSlot> {
        let slot = Arc::new(ContextSlot::default());
        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        self.slots.lock().unwrap().push(Arc::clone(&slot));
        slot
    }

    pub(crate) fn unregister(&self, slot: &Arc<ContextSlot>) {
        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        self.slots
            .lock()
            .unwrap()
            .retain(|s| !Arc::ptr_eq(s, slot));
    }

    /// Number of registered contexts.
    pub fn len(&self) -> usize {
        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        let slots = self.slots.lock().unwrap();
        slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SyncCore for ContextRegistry {
    fn sync_core(&self, bound: Duration) -> bool {
        let deadline = Instant::now() + bound;
        let busy: Vec<(Arc<ContextSlot>, u64)> = {
            #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
            let slots = self.slots.lock().unwrap();
            slots
                .iter()
                .filter_map(|slot| {
                    let seq = slot.seq.load(Ordering::SeqCst);
                    (seq % 2 == 1).then(|| (Arc::clone(slot), seq))
                })
                .collect()
        };

        for (slot, seq) in busy {
            let backoff = Backoff::new();
            while slot.seq.load(Ordering::Acquire) == seq {
                if Instant::now() >= deadline {
                    return false;
                }
                backoff.snooze();
            }
        }
        true
    }
}

/// Run one barrier, retrying with backoff while it overruns its bound.
///
/// Every overrun is counted and logged. Gives up with
/// [`PatchError::BarrierTimeout`] after `barrier_retries` retries.
pub(crate) fn quiesce(
    barrier: &dyn SyncCore,
    config: &PatchConfig,
    stats: &PatchStats,
) -> Result<(), PatchError> {
    let started = Instant::now();
    let attempts = config.barrier_retries.saturating_add(1);

    for attempt in 0..attempts {
        if barrier.sync_core(config.barrier_timeout()) {
            stats.record_barrier();
            return Ok(());
        }
        stats.record_barrier_timeout();
        warn!(
            attempt = attempt + 1,
            attempts,
            waited_ms = started.elapsed().as_millis(),
            "Execution contexts did not reach a safe point in time"
        );
        if attempt + 1 < attempts {
            std::thread::sleep(config.backoff(attempt));
        }
    }

    Err(PatchError::BarrierTimeout {
        attempts,
        waited: started.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_idle_contexts_do_not_block() {
        let registry = ContextRegistry::new();
        let _a = registry.register();
        let _b = registry.register();
        assert_eq!(registry.len(), 2);
        assert!(registry.sync_core(Duration::from_millis(10)));
    }

    #[test]
    fn test_waits_for_context_inside_fetch() {
        let registry = Arc::new(ContextRegistry::new());
        let slot = registry.register();
        slot.enter();

        // Stuck mid-fetch: the barrier has to give up.
        assert!(!registry.sync_core(Duration::from_millis(5)));

        let leaver = {
            let slot = Arc::clone(&slot);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                slot.exit();
            })
        };
        assert!(registry.sync_core(Duration::from_secs(5)));
        leaver.join().expect("leaver thread");
    }

    #[test]
    fn test_unregistered_context_is_ignored() {
        let registry = ContextRegistry::new();
        let slot = registry.register();
        slot.enter();
        registry.unregister(&slot);
        assert!(registry.is_empty());
        assert!(registry.sync_core(Duration::from_millis(5)));
    }

    struct Flaky {
        failures_left: AtomicU32,
    }

    impl SyncCore for Flaky {
        fn sync_core(&self, _bound: Duration) -> bool {
            self.failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
        }
    }

    #[test]
    fn test_quiesce_retries_then_succeeds() {
        let barrier = Flaky {
            failures_left: AtomicU32::new(2),
        };
        let stats = PatchStats::default();
        let config = PatchConfig {
            barrier_retries: 3,
            backoff_base_ms: 0,
            ..PatchConfig::default()
        };
        quiesce(&barrier, &config, &stats).expect("third attempt succeeds");
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.barriers, 1);
        assert_eq!(snapshot.barrier_timeouts, 2);
    }

    #[test]
    fn test_quiesce_gives_up() {
        let barrier = Flaky {
            failures_left: AtomicU32::new(u32::MAX),
        };
        let stats = PatchStats::default();
        let config = PatchConfig {
            barrier_retries: 2,
            backoff_base_ms: 0,
            ..PatchConfig::default()
        };
        let err = quiesce(&barrier, &config, &stats).expect_err("never quiesces");
        assert!(matches!(err, PatchError::BarrierTimeout { attempts: 3, .. }));
        assert_eq!(stats.snapshot().barrier_timeouts, 3);
        assert_eq!(stats.snapshot().barriers, 0);
    }
}

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

use crossbeam::utils::Backoff;

use crate::encoding::JumpType;
use crate::insn::{INT3, Insn};
use crate::labels::{Inner, Site};
use crate::sync::ContextSlot;

/// One thread of execution evaluating branch sites.
///
/// A context may move to another thread but is never shared: its safe-point
/// slot tracks a single fetch at a time. Dropping it unregisters it from the
/// barrier.
pub struct ExecutionContext {
    inner: Arc<Inner>,
    slot: Arc<ContextSlot>,
    _not_sync: PhantomData<Cell<()>>,
}

impl ExecutionContext {
    pub(crate) fn new(inner: Arc<Inner>) -> Self {
        let slot = inner.contexts.register();
        Self {
            inner,
            slot,
            _not_sync: PhantomData,
        }
    }

    /// Evaluate the branch at `site`: `true` when the guarded code runs.
    ///
    /// Equals the state of the site's key, whatever the site's polarity.
    #[inline]
    pub fn branch(&self, site: Site) -> bool {
        self.is_taken(site) ^ site.polarity().is_inverted()
    }

    /// Execute the instruction at `site` and report whether control reached
    /// the taken label.
    pub fn is_taken(&self, site: Site) -> bool {
        let backoff = Backoff::new();
        loop {
            self.slot.enter();
            let fetched = self.inner.image.fetch(site.code());
            self.slot.exit();

            let Some(bytes) = fetched else {
                self.inner.stats.record_wild_fetch();
                return false;
            };

            if bytes[0] == INT3 {
                self.inner.stats.record_trap_hit();
                if let Some(answer) = self.inner.traps.lookup(site.index()) {
                    return answer == JumpType::Jmp;
                }
                // The pass finished between our fetch and the lookup.
                if backoff.is_completed() {
                    self.inner.stats.record_wild_fetch();
                    return false;
                }
                backoff.snooze();
                continue;
            }

            return match Insn::decode(&bytes) {
                Some(insn) if insn.is_jmp() => {
                    if insn.destination(site.code()) == Some(site.target()) {
                        true
                    } else {
                        self.inner.stats.record_wild_fetch();
                        false
                    }
                }
                Some(_) => false,
                None => {
                    self.inner.stats.record_wild_fetch();
                    false
                }
            };
        }
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.inner.contexts.unregister(&self.slot);
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext").finish_non_exhaustive()
    }
}

//! A loaded image: its decoded jump table, its keys and the one patcher
//! allowed to rewrite its text.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::batch::Batch;
use crate::config::PatchConfig;
use crate::context::ExecutionContext;
use crate::encoding::{JumpType, Polarity, SiteEncoding};
use crate::entry::{JumpEntry, JumpTable, KeyRef};
use crate::errors::{CorruptReason, LoadError, PatchError};
use crate::image::{Image, TextPoker};
use crate::insn::{self, Insn, MAX_INSN_SIZE};
use crate::key::{KeyId, StaticKey};
use crate::patch;
use crate::poke::TrapTable;
use crate::stats::{PatchStats, StatsSnapshot};
use crate::sync::{ContextRegistry, SyncCore};

/// A patch site, as handed to execution contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Site {
    index: usize,
    code: usize,
    target: usize,
    key: KeyRef,
}

impl Site {
    fn new(index: usize, entry: &JumpEntry) -> Self {
        Self {
            index,
            code: entry.code,
            target: entry.target,
            key: entry.key,
        }
    }

    /// Position of the site's entry in the jump table.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Address of the site instruction.
    pub fn code(&self) -> usize {
        self.code
    }

    /// Address of the taken label.
    pub fn target(&self) -> usize {
        self.target
    }

    pub fn key(&self) -> KeyId {
        self.key.key
    }

    pub fn polarity(&self) -> Polarity {
        self.key.polarity
    }
}

pub(crate) struct Inner {
    pub(crate) image: Arc<Image>,
    pub(crate) table: JumpTable,
    pub(crate) traps: TrapTable,
    pub(crate) contexts: Arc<ContextRegistry>,
    pub(crate) barrier: Arc<dyn SyncCore>,
    pub(crate) poker: Mutex<TextPoker>,
    pub(crate) config: PatchConfig,
    pub(crate) stats: PatchStats,
}

impl Inner {
    pub(crate) fn key(&self, key: KeyId) -> Option<&StaticKey> {
        self.image.keys().get(key.index())
    }
}

/// Runtime handle over a loaded image.
///
/// Cheap to clone; every clone shares the same keys, patcher and counters.
#[derive(Clone)]
pub struct JumpLabels {
    pub(crate) inner: Arc<Inner>,
}

impl JumpLabels {
    /// Load a built image, using the registered execution contexts as the
    /// safe-point barrier.
    pub fn load(image: Image, config: PatchConfig) -> Result<Self, LoadError> {
        let contexts = Arc::new(ContextRegistry::new());
        let barrier: Arc<dyn SyncCore> = contexts.clone();
        Self::load_inner(image, config, contexts, barrier)
    }

    /// Load a built image with a custom barrier in place of the context registry.
    pub fn load_with_barrier(
        image: Image,
        config: PatchConfig,
        barrier: Arc<dyn SyncCore>,
    ) -> Result<Self, LoadError> {
        Self::load_inner(image, config, Arc::new(ContextRegistry::new()), barrier)
    }

    fn load_inner(
        image: Image,
        config: PatchConfig,
        contexts: Arc<ContextRegistry>,
        barrier: Arc<dyn SyncCore>,
    ) -> Result<Self, LoadError> {
        let image = Arc::new(image);
        let table = JumpTable::load(&image)?;
        let poker = TextPoker::acquire(&image)?;

        info!(
            entries = table.entries().len(),
            keys = table.num_keys(),
            encoding = ?image.encoding(),
            poke_mode = ?config.poke_mode,
            "Loaded jump table"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                traps: TrapTable::new(table.entries().len()),
                table,
                image,
                contexts,
                barrier,
                poker: Mutex::new(poker),
                config,
                stats: PatchStats::default(),
            }),
        })
    }

    /// Register the calling execution context. Each context evaluates
    /// branches on its own; it unregisters when dropped.
    pub fn register_context(&self) -> ExecutionContext {
        ExecutionContext::new(Arc::clone(&self.inner))
    }

    /// Number of execution contexts currently registered.
    pub fn contexts(&self) -> usize {
        self.inner.contexts.len()
    }

    /// Take a reference on `key`, patching its sites if it was disabled.
    pub fn enable(&self, key: KeyId) -> Result<(), PatchError> {
        let static_key = self.inner.key(key).ok_or(PatchError::UnknownKey(key))?;
        if static_key.inc_if_enabled() {
            return Ok(());
        }
        let mut batch = self.batch();
        batch.enable(key);
        batch.commit().into_result(key)
    }

    /// Drop a reference on `key`, patching its sites if it was the last one.
    pub fn disable(&self, key: KeyId) -> Result<(), PatchError> {
        let static_key = self.inner.key(key).ok_or(PatchError::UnknownKey(key))?;
        if static_key.dec_unless_last() {
            return Ok(());
        }
        let mut batch = self.batch();
        batch.disable(key);
        batch.commit().into_result(key)
    }

    /// Force `key` to a boolean state.
    ///
    /// Enabling an enabled key leaves its count alone. Disabling only acts
    /// when exactly one reference is held.
    pub fn set_enabled(&self, key: KeyId, enabled: bool) -> Result<(), PatchError> {
        let mut batch = self.batch();
        batch.set(key, enabled);
        batch.commit().into_result(key)
    }

    /// Group toggles of several keys so they share one safe-point barrier.
    pub fn batch(&self) -> Batch<'_> {
        Batch::new(self)
    }

    pub fn is_enabled(&self, key: KeyId) -> bool {
        self.inner.key(key).is_some_and(StaticKey::is_enabled)
    }

    /// Raw reference count of `key`; `-1` while its first enable is in flight.
    pub fn count(&self, key: KeyId) -> Option<i32> {
        self.inner.key(key).map(StaticKey::count)
    }

    pub fn num_keys(&self) -> usize {
        self.inner.table.num_keys()
    }

    pub fn site(&self, index: usize) -> Option<Site> {
        self.inner
            .table
            .get(index)
            .map(|entry| Site::new(index, entry))
    }

    /// The site whose instruction starts exactly at `addr`.
    pub fn site_at(&self, addr: usize) -> Option<Site> {
        self.inner.table.find(addr).and_then(|index| self.site(index))
    }

    /// All sites owned by `key`, in address order.
    pub fn sites(&self, key: KeyId) -> Vec<Site> {
        self.inner
            .table
            .sites_of(key)
            .unwrap_or_default()
            .iter()
            .filter_map(|&index| self.site(index))
            .collect()
    }

    /// Decoded jump entries, sorted by site address.
    pub fn entries(&self) -> &[JumpEntry] {
        self.inner.table.entries()
    }

    /// Length of the instruction installed at `site`.
    pub fn entry_size(&self, site: usize) -> Result<usize, PatchError> {
        insn::entry_size(&self.inner.image, site)
    }

    /// The instruction installed at `site`, if it is one a site may hold.
    pub fn installed(&self, site: Site) -> Option<Insn> {
        self.inner
            .image
            .fetch(site.code)
            .and_then(|bytes| Insn::decode(&bytes))
    }

    pub fn text_bytes(&self, addr: usize, len: usize) -> Option<Vec<u8>> {
        self.inner.image.read_text(addr, len)
    }

    /// Whether any site overlaps the text range `start..end`.
    ///
    /// Callers that rewrite text on their own use this to stay clear of
    /// patch sites.
    pub fn text_reserved(&self, start: usize, end: usize) -> bool {
        if start >= end {
            return false;
        }
        self.inner
            .table
            .starting_before(end)
            .iter()
            .rev()
            .take_while(|entry| entry.code.saturating_add(MAX_INSN_SIZE) > start)
            .any(|entry| {
                let size = insn::entry_size(&self.inner.image, entry.code).unwrap_or(MAX_INSN_SIZE);
                entry.code.saturating_add(size) > start
            })
    }

    /// Check every site against the state of its key.
    ///
    /// Returns one error per site that holds anything other than the
    /// instruction its key's state implies. Keys with a transition in flight
    /// are skipped.
    pub fn verify(&self) -> Vec<(usize, PatchError)> {
        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        let _poker = self.inner.poker.lock().unwrap();

        let mut problems = Vec::new();
        for (index, entry) in self.inner.table.entries().iter().enumerate() {
            let Some(count) = self.count(entry.key.key) else {
                continue;
            };
            if count < 0 {
                continue;
            }
            let desired = JumpType::for_state(count > 0, entry.key.polarity);
            let problem = match patch::stage_site(&self.inner.image, index, entry, desired) {
                Ok(None) => None,
                Ok(Some(request)) => Some(PatchError::CorruptEntry {
                    site: request.site,
                    found: request.old,
                    reason: CorruptReason::Unexpected {
                        expected: request.new,
                    },
                }),
                Err(err) => Some(err),
            };
            if let Some(err) = problem {
                error!(index, %err, "Jump entry does not match its key");
                problems.push((index, err));
            }
        }
        if problems.is_empty() {
            debug!(entries = self.inner.table.entries().len(), "Verified jump table");
        } else {
            warn!(problems = problems.len(), "Jump table verification failed");
        }
        problems
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn config(&self) -> &PatchConfig {
        &self.inner.config
    }

    pub fn encoding(&self) -> SiteEncoding {
        self.inner.image.encoding()
    }

    pub fn image(&self) -> &Image {
        &self.inner.image
    }
}

impl std::fmt::Debug for JumpLabels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JumpLabels")
            .field("image", &self.inner.image)
            .field("entries", &self.inner.table.entries().len())
            .field("keys", &self.inner.table.num_keys())
            .finish()
    }
}

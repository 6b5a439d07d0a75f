//! Toggling several keys under one safe-point barrier.
//!
//! A commit folds the queued operations of each key into its reference
//! count, stages the site rewrites of every key whose state flips, and
//! installs all of them in a single patch pass. Keys that fail to stage are
//! reported and left alone; the rest still go through.

use std::collections::BTreeMap;

use tracing::{debug, error, warn};

use crate::errors::PatchError;
use crate::key::{KeyId, StaticKey};
use crate::labels::JumpLabels;
use crate::patch;
use crate::poke::{self, PokeRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOp {
    Enable,
    Disable,
    Set(bool),
}

/// Queued key operations, applied together by [`Batch::commit`].
#[must_use = "a batch does nothing until committed"]
pub struct Batch<'a> {
    labels: &'a JumpLabels,
    ops: Vec<(KeyId, KeyOp)>,
}

/// Outcome of a [`Batch::commit`], per key.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Keys whose operations all took effect.
    pub applied: Vec<KeyId>,
    /// Keys left as they were, with the reason.
    pub failed: Vec<(KeyId, PatchError)>,
    /// Keys whose physical state changed.
    pub transitions: usize,
    /// Sites rewritten by the pass.
    pub sites_patched: usize,
}

impl BatchReport {
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn error_for(&self, key: KeyId) -> Option<&PatchError> {
        self.failed
            .iter()
            .find_map(|(failed, err)| (*failed == key).then_some(err))
    }

    pub(crate) fn into_result(self, key: KeyId) -> Result<(), PatchError> {
        match self.failed.into_iter().find(|(failed, _)| *failed == key) {
            Some((_, err)) => Err(err),
            None => Ok(()),
        }
    }
}

/// A key claimed for a physical transition. Its count holds `-1` until the
/// pass settles.
struct Claimed {
    key: KeyId,
    before: i32,
    after: i32,
}

enum Claim {
    /// The count changed without crossing zero; nothing to patch.
    Settled,
    Transition { before: i32, after: i32 },
}

impl<'a> Batch<'a> {
    pub(crate) fn new(labels: &'a JumpLabels) -> Self {
        Self {
            labels,
            ops: Vec::new(),
        }
    }

    pub fn enable(&mut self, key: KeyId) -> &mut Self {
        self.ops.push((key, KeyOp::Enable));
        self
    }

    pub fn disable(&mut self, key: KeyId) -> &mut Self {
        self.ops.push((key, KeyOp::Disable));
        self
    }

    pub fn set(&mut self, key: KeyId, enabled: bool) -> &mut Self {
        self.ops.push((key, KeyOp::Set(enabled)));
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn commit(self) -> BatchReport {
        let inner = &self.labels.inner;
        let mut report = BatchReport::default();

        let mut per_key: BTreeMap<KeyId, Vec<KeyOp>> = BTreeMap::new();
        for (key, op) in self.ops {
            per_key.entry(key).or_default().push(op);
        }

        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        let mut poker = inner.poker.lock().unwrap();

        let mut claimed: Vec<Claimed> = Vec::new();
        let mut requests: Vec<PokeRequest> = Vec::new();

        for (key, ops) in per_key {
            let Some(static_key) = inner.key(key) else {
                report.failed.push((key, PatchError::UnknownKey(key)));
                continue;
            };
            let (before, after) = match claim(static_key, key, &ops) {
                Ok(Claim::Settled) => {
                    report.applied.push(key);
                    continue;
                }
                Ok(Claim::Transition { before, after }) => (before, after),
                Err(err) => {
                    warn!(%key, %err, "Rejected key operation");
                    report.failed.push((key, err));
                    continue;
                }
            };
            match patch::stage_key(&inner.image, &inner.table, key, after > 0) {
                Ok(staged) => {
                    requests.extend(staged);
                    claimed.push(Claimed { key, before, after });
                }
                Err(err) => {
                    static_key.store(before);
                    error!(%key, %err, "Refusing to patch key");
                    report.failed.push((key, err));
                }
            }
        }

        let installed = poke::poke_batch(
            &mut poker,
            &inner.traps,
            inner.barrier.as_ref(),
            &inner.config,
            &inner.stats,
            &requests,
        );

        match installed {
            Ok(()) => {
                for c in &claimed {
                    if let Some(static_key) = inner.key(c.key) {
                        static_key.store(c.after);
                    }
                    debug!(key = %c.key, enabled = c.after > 0, "Key transitioned");
                    report.applied.push(c.key);
                }
                report.transitions = claimed.len();
                report.sites_patched = requests.len();
                inner.stats.record_patched(requests.len(), claimed.len());
            }
            Err(err) => {
                error!(%err, keys = claimed.len(), "Patch pass failed, keys left unchanged");
                for c in claimed {
                    if let Some(static_key) = inner.key(c.key) {
                        static_key.store(c.before);
                    }
                    report.failed.push((c.key, err.clone()));
                }
            }
        }

        report
    }
}

/// Fold `ops` into the count of `key` and claim it if its state flips.
///
/// Retries when a fast-path enable or disable races with the fold.
fn claim(key: &StaticKey, id: KeyId, ops: &[KeyOp]) -> Result<Claim, PatchError> {
    loop {
        let before = key.count();
        let after = fold(id, before, ops)?;
        if (before > 0) == (after > 0) {
            if before == after || key.compare_exchange(before, after).is_ok() {
                return Ok(Claim::Settled);
            }
        } else if key.compare_exchange(before, -1).is_ok() {
            return Ok(Claim::Transition { before, after });
        }
    }
}

fn fold(id: KeyId, mut count: i32, ops: &[KeyOp]) -> Result<i32, PatchError> {
    for op in ops {
        count = match op {
            KeyOp::Enable => count.checked_add(1).ok_or(PatchError::CountOverflow(id))?,
            KeyOp::Disable if count <= 0 => return Err(PatchError::UnbalancedDisable(id)),
            KeyOp::Disable => count - 1,
            KeyOp::Set(true) if count > 0 => {
                if count != 1 {
                    warn!(key = %id, count, "Key already enabled by several holders");
                }
                count
            }
            KeyOp::Set(true) => 1,
            KeyOp::Set(false) if count > 1 => {
                warn!(key = %id, count, "Not disabling key held by several holders");
                count
            }
            KeyOp::Set(false) => 0,
        };
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_counts_references() {
        let id = KeyId(0);
        let ops = [KeyOp::Enable, KeyOp::Enable, KeyOp::Disable];
        assert_eq!(fold(id, 0, &ops).expect("balanced"), 1);
        assert_eq!(fold(id, 3, &[KeyOp::Disable]).expect("balanced"), 2);
    }

    #[test]
    fn test_fold_rejects_unbalanced_disable() {
        let id = KeyId(4);
        assert!(matches!(
            fold(id, 0, &[KeyOp::Disable]),
            Err(PatchError::UnbalancedDisable(KeyId(4)))
        ));
        assert!(matches!(
            fold(id, 1, &[KeyOp::Disable, KeyOp::Disable]),
            Err(PatchError::UnbalancedDisable(_))
        ));
    }

    #[test]
    fn test_fold_rejects_count_overflow() {
        let id = KeyId(2);
        assert!(matches!(
            fold(id, i32::MAX, &[KeyOp::Enable]),
            Err(PatchError::CountOverflow(KeyId(2)))
        ));
        assert_eq!(fold(id, i32::MAX, &[KeyOp::Set(true)]).expect("set"), i32::MAX);
    }

    #[test]
    fn test_fold_set_is_boolean() {
        let id = KeyId(0);
        assert_eq!(fold(id, 0, &[KeyOp::Set(true)]).expect("set"), 1);
        assert_eq!(fold(id, 3, &[KeyOp::Set(true)]).expect("set"), 3);
        assert_eq!(fold(id, 1, &[KeyOp::Set(false)]).expect("set"), 0);
        assert_eq!(fold(id, 2, &[KeyOp::Set(false)]).expect("set"), 2);
        assert_eq!(fold(id, 0, &[KeyOp::Set(false)]).expect("set"), 0);
    }

    #[test]
    fn test_claim_marks_transition() {
        let key = StaticKey::default();
        let claim = claim(&key, KeyId(0), &[KeyOp::Enable]).expect("claim");
        assert!(matches!(claim, Claim::Transition { before: 0, after: 1 }));
        assert_eq!(key.count(), -1);
    }

    #[test]
    fn test_claim_settles_without_crossing_zero() {
        let key = StaticKey::default();
        key.init(true);
        let claim = claim(&key, KeyId(0), &[KeyOp::Enable, KeyOp::Enable]).expect("claim");
        assert!(matches!(claim, Claim::Settled));
        assert_eq!(key.count(), 3);
    }

    #[test]
    fn test_claim_leaves_saturated_count_alone() {
        let key = StaticKey::default();
        key.store(i32::MAX);
        assert!(!key.inc_if_enabled());
        assert!(matches!(
            claim(&key, KeyId(0), &[KeyOp::Enable]),
            Err(PatchError::CountOverflow(KeyId(0)))
        ));
        assert_eq!(key.count(), i32::MAX);
    }
}

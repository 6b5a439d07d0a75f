//! Installing validated site edits into live text.
//!
//! Sites that cannot be replaced with one atomic store go through the
//! breakpoint protocol, shared by every site in the pass:
//!
//! 1. arm a trap answer for each site, then write `int3` over its first byte;
//! 2. run one safe-point barrier, so no context is still decoding old bytes;
//! 3. write every byte after the first, then the first byte.
//!
//! A context that fetches `int3` in between asks the trap table what the
//! site held before the pass and carries on with that answer, so readers
//! only ever see the old result or the new one, in that order.

use std::sync::atomic::{AtomicU8, Ordering};

use tracing::trace;

use crate::config::{PatchConfig, PokeMode};
use crate::encoding::JumpType;
use crate::errors::PatchError;
use crate::image::{Image, TextPoker};
use crate::insn::{INT3, InsnBytes};
use crate::stats::PatchStats;
use crate::sync::{self, SyncCore};

const TRAP_DISARMED: u8 = 0;
const TRAP_NOP: u8 = 1;
const TRAP_JMP: u8 = 2;

/// One site rewrite, validated against the bytes currently installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PokeRequest {
    /// Index of the site's jump entry.
    pub entry: usize,
    pub site: usize,
    pub old: InsnBytes,
    pub new: InsnBytes,
    pub old_type: JumpType,
}

/// Answers for contexts that fetch `int3` at a site being rewritten, one slot per jump entry.
#[derive(Debug)]
pub(crate) struct TrapTable {
    slots: Box<[AtomicU8]>,
}

impl TrapTable {
    pub(crate) fn new(entries: usize) -> Self {
        Self {
            slots: (0..entries).map(|_| AtomicU8::new(TRAP_DISARMED)).collect(),
        }
    }

    fn arm(&self, entry: usize, answer: JumpType) {
        if let Some(slot) = self.slots.get(entry) {
            let value = match answer {
                JumpType::Nop => TRAP_NOP,
                JumpType::Jmp => TRAP_JMP,
            };
            slot.store(value, Ordering::SeqCst);
        }
    }

    fn disarm(&self, entry: usize) {
        if let Some(slot) = self.slots.get(entry) {
            slot.store(TRAP_DISARMED, Ordering::SeqCst);
        }
    }

    /// What a context trapping on `entry` should behave as, if a pass is in flight.
    #[inline]
    pub(crate) fn lookup(&self, entry: usize) -> Option<JumpType> {
        match self.slots.get(entry)?.load(Ordering::SeqCst) {
            TRAP_NOP => Some(JumpType::Nop),
            TRAP_JMP => Some(JumpType::Jmp),
            _ => None,
        }
    }
}

/// Install `requests` into the text owned by `poker`.
///
/// Runs at most one barrier for the whole slice. If the barrier cannot be
/// completed, the `int3` bytes are reverted and nothing else has been
/// written, so every site still holds its old instruction.
pub(crate) fn poke_batch(
    poker: &mut TextPoker,
    traps: &TrapTable,
    barrier: &dyn SyncCore,
    config: &PatchConfig,
    stats: &PatchStats,
    requests: &[PokeRequest],
) -> Result<(), PatchError> {
    if requests.is_empty() {
        return Ok(());
    }

    let (atomic, trapped): (Vec<&PokeRequest>, Vec<&PokeRequest>) =
        requests.iter().partition(|r| {
            config.poke_mode == PokeMode::Auto && Image::fits_in_word(r.site, r.new.len())
        });

    let text = poker.writable()?;

    if !trapped.is_empty() {
        for r in &trapped {
            traps.arm(r.entry, r.old_type);
        }
        for r in &trapped {
            text.write_byte(r.site, INT3)?;
        }

        if let Err(err) = sync::quiesce(barrier, config, stats) {
            for r in &trapped {
                text.write_byte(r.site, r.old[0])?;
                traps.disarm(r.entry);
            }
            return Err(err);
        }

        for r in &trapped {
            if let Some(tail) = r.new.get(1..) {
                text.write_bytes(r.site.wrapping_add(1), tail)?;
            }
        }
        for r in &trapped {
            text.write_byte(r.site, r.new[0])?;
            trace!(site = format_args!("{:#x}", r.site), old = %r.old, new = %r.new, "Patched site");
        }
        for r in &trapped {
            traps.disarm(r.entry);
        }
    }

    for r in &atomic {
        text.write_atomic(r.site, &r.new)?;
        trace!(site = format_args!("{:#x}", r.site), old = %r.old, new = %r.new, "Patched site atomically");
    }

    Ok(())
}

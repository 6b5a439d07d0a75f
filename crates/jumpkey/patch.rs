//! Deciding which bytes each site of a key should hold.
//!
//! Nothing here writes text. Every site of a key is checked against the
//! encoding its current state implies before any request is produced, so a
//! single bad site leaves the whole key untouched.

use tracing::trace;

use crate::encoding::JumpType;
use crate::entry::{JumpEntry, JumpTable};
use crate::errors::{CorruptReason, PatchError};
use crate::image::Image;
use crate::insn::{self, InsnBytes};
use crate::key::KeyId;
use crate::poke::PokeRequest;

/// Requests that move every site of `key` to the state `enabled`.
///
/// Sites that already hold the desired instruction are skipped.
pub(crate) fn stage_key(
    image: &Image,
    table: &JumpTable,
    key: KeyId,
    enabled: bool,
) -> Result<Vec<PokeRequest>, PatchError> {
    let sites = table.sites_of(key).ok_or(PatchError::UnknownKey(key))?;
    let mut requests = Vec::with_capacity(sites.len());
    for &index in sites {
        let Some(entry) = table.get(index) else {
            continue;
        };
        let desired = JumpType::for_state(enabled, entry.key.polarity);
        if let Some(request) = stage_site(image, index, entry, desired)? {
            requests.push(request);
        }
    }
    Ok(requests)
}

/// Check one site and produce the request that installs `desired` there.
///
/// The site must hold either the `desired` instruction (nothing to do) or
/// the opposite one of the same length. Anything else is reported as
/// [`PatchError::CorruptEntry`].
pub(crate) fn stage_site(
    image: &Image,
    index: usize,
    entry: &JumpEntry,
    desired: JumpType,
) -> Result<Option<PokeRequest>, PatchError> {
    let site = entry.code;
    let size = insn::entry_size(image, site)?;
    let current = image
        .read_text(site, size)
        .map(|bytes| InsnBytes::from_slice(&bytes))
        .ok_or(PatchError::CorruptEntry {
            site,
            found: InsnBytes::default(),
            reason: CorruptReason::OutsideText,
        })?;

    let corrupt = |reason| PatchError::CorruptEntry {
        site,
        found: current,
        reason,
    };
    let new = desired
        .insn(size, site, entry.target)
        .ok_or_else(|| corrupt(CorruptReason::Unreachable))?
        .encode();
    let old = desired
        .flip()
        .insn(size, site, entry.target)
        .ok_or_else(|| corrupt(CorruptReason::Unreachable))?
        .encode();

    if current == new {
        trace!(site = format_args!("{site:#x}"), insn = %current, "Site already installed");
        return Ok(None);
    }
    if current != old {
        return Err(corrupt(CorruptReason::Unexpected { expected: old }));
    }

    Ok(Some(PokeRequest {
        entry: index,
        site,
        old,
        new,
        old_type: desired.flip(),
    }))
}

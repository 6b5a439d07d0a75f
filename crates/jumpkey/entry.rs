//! Jump entries: the relocation-free side table describing every patch site.
//!
//! Each record is three pointer-width fields, each holding the distance from
//! the field's own address to the address it describes:
//!
//! ```text
//! +0   code    site address   - (entry + 0)
//! +8   target  taken label    - (entry + 8)
//! +16  key     static key     - (entry + 16), bit 0 = polarity
//! ```
//!
//! Keys are 8-byte aligned and so are the fields, so bit 0 of the key delta
//! is always free. Decoding turns it into an explicit [`KeyRef`] right away.

use std::mem::offset_of;

use serde::Serialize;

use crate::encoding::Polarity;
use crate::errors::TableError;
use crate::image::Image;
use crate::key::KeyId;

pub const JUMP_ENTRY_SIZE: usize = 24;

const CODE_FIELD: usize = offset_of!(RawJumpEntry, code);
const TARGET_FIELD: usize = offset_of!(RawJumpEntry, target);
const KEY_FIELD: usize = offset_of!(RawJumpEntry, key);
const POLARITY_BIT: i64 = 1;

/// A jump entry as stored in the table.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawJumpEntry {
    code: i64,
    target: i64,
    key: i64,
}

const _: () = assert!(std::mem::size_of::<RawJumpEntry>() == JUMP_ENTRY_SIZE);

#[expect(clippy::as_conversions, reason = "addresses and deltas are pointer-width")]
fn delta(field: usize, addr: usize) -> i64 {
    (addr as i64).wrapping_sub(field as i64)
}

#[expect(clippy::as_conversions, reason = "addresses and deltas are pointer-width")]
fn resolve(field: usize, delta: i64) -> usize {
    field.wrapping_add_signed(delta as isize)
}

impl RawJumpEntry {
    /// Encode an entry that will be stored at `entry_addr`.
    pub fn new(entry_addr: usize, code: usize, target: usize, key: usize, polarity: Polarity) -> Self {
        let key_delta = delta(entry_addr.wrapping_add(KEY_FIELD), key);
        debug_assert_eq!(key_delta & POLARITY_BIT, 0, "keys must be aligned");
        Self {
            code: delta(entry_addr.wrapping_add(CODE_FIELD), code),
            target: delta(entry_addr.wrapping_add(TARGET_FIELD), target),
            key: key_delta | i64::from(polarity.is_inverted()),
        }
    }

    pub fn code(&self, entry_addr: usize) -> usize {
        resolve(entry_addr.wrapping_add(CODE_FIELD), self.code)
    }

    pub fn target(&self, entry_addr: usize) -> usize {
        resolve(entry_addr.wrapping_add(TARGET_FIELD), self.target)
    }

    /// Key address and polarity, unpacked from the tagged key field.
    pub fn key(&self, entry_addr: usize) -> (usize, Polarity) {
        let addr = resolve(entry_addr.wrapping_add(KEY_FIELD), self.key & !POLARITY_BIT);
        (addr, Polarity::from_bit(self.key & POLARITY_BIT != 0))
    }
}

/// The owning key of a site together with the site's compiled sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct KeyRef {
    pub key: KeyId,
    pub polarity: Polarity,
}

/// A decoded jump entry with absolute addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JumpEntry {
    pub code: usize,
    pub target: usize,
    pub key: KeyRef,
}

/// The decoded table plus the per-key index over it.
#[derive(Debug)]
pub(crate) struct JumpTable {
    entries: Vec<JumpEntry>,
    by_key: Vec<Vec<usize>>,
}

impl JumpTable {
    /// Decode and validate the jump table of `image`.
    ///
    /// The table must already be sorted by site address with one entry per
    /// site; it is checked, never re-sorted.
    pub(crate) fn load(image: &Image) -> Result<Self, TableError> {
        let table_start = image.jump_table_range().start;
        let raw_entries = image.raw_entries();
        let mut entries: Vec<JumpEntry> = Vec::with_capacity(raw_entries.len());
        let mut by_key = vec![Vec::new(); image.layout().keys];

        for (index, raw) in raw_entries.iter().enumerate() {
            let entry_addr = table_start.wrapping_add(index.wrapping_mul(JUMP_ENTRY_SIZE));

            let code = raw.code(entry_addr);
            if !image.contains_text(code) {
                return Err(TableError::SiteOutsideText { index, addr: code });
            }
            let target = raw.target(entry_addr);
            if !image.contains_text(target) {
                return Err(TableError::SiteOutsideText {
                    index,
                    addr: target,
                });
            }
            let (key_addr, polarity) = raw.key(entry_addr);
            let key_index = image
                .key_index_at(key_addr)
                .ok_or(TableError::StaleKeyReference {
                    index,
                    addr: key_addr,
                })?;

            if let Some(prev) = entries.last() {
                if prev.code == code {
                    return Err(TableError::DuplicateSite {
                        first: index - 1,
                        second: index,
                        addr: code,
                    });
                }
                if prev.code > code {
                    return Err(TableError::Unsorted { index, addr: code });
                }
            }

            #[expect(clippy::as_conversions, reason = "key indices come from the u32 KeyId space")]
            let key = KeyId(key_index as u32);
            entries.push(JumpEntry {
                code,
                target,
                key: KeyRef { key, polarity },
            });
            if let Some(sites) = by_key.get_mut(key_index) {
                sites.push(index);
            }
        }

        Ok(Self { entries, by_key })
    }

    pub(crate) fn entries(&self) -> &[JumpEntry] {
        &self.entries
    }

    pub(crate) fn into_entries(self) -> Vec<JumpEntry> {
        self.entries
    }

    pub(crate) fn get(&self, index: usize) -> Option<&JumpEntry> {
        self.entries.get(index)
    }

    /// Indices of the entries owned by `key`, in site order.
    pub(crate) fn sites_of(&self, key: KeyId) -> Option<&[usize]> {
        self.by_key.get(key.index()).map(Vec::as_slice)
    }

    pub(crate) fn num_keys(&self) -> usize {
        self.by_key.len()
    }

    /// Index of the entry whose site is exactly `code`.
    pub(crate) fn find(&self, code: usize) -> Option<usize> {
        self.entries.binary_search_by_key(&code, |e| e.code).ok()
    }

    /// Entries whose site starts before `end`, in site order.
    pub(crate) fn starting_before(&self, end: usize) -> &[JumpEntry] {
        let upper = self.entries.partition_point(|e| e.code < end);
        &self.entries[..upper]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_are_self_relative() {
        let entry_addr = 0x7000_0000;
        let raw = RawJumpEntry::new(entry_addr, 0x1000, 0x1010, 0x9000_0008, Polarity::Inverted);

        assert_eq!(raw.code(entry_addr), 0x1000);
        assert_eq!(raw.target(entry_addr), 0x1010);
        assert_eq!(raw.key(entry_addr), (0x9000_0008, Polarity::Inverted));

        // Moving the entry and everything it points at by the same amount
        // keeps it valid without touching the stored deltas.
        let shift = 0x12_3000;
        let moved = entry_addr + shift;
        assert_eq!(raw.code(moved), 0x1000 + shift);
        assert_eq!(raw.target(moved), 0x1010 + shift);
        assert_eq!(raw.key(moved), (0x9000_0008 + shift, Polarity::Inverted));
    }

    #[test]
    fn test_polarity_bit_does_not_leak_into_address() {
        let entry_addr = 0x10_0000;
        for key_addr in [0x8, 0x10_0018, 0x20_0000] {
            for polarity in [Polarity::Direct, Polarity::Inverted] {
                let raw = RawJumpEntry::new(entry_addr, 0x40, 0x48, key_addr, polarity);
                assert_eq!(raw.key(entry_addr), (key_addr, polarity));
            }
        }
    }
}

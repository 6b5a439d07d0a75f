//! Lays out an image the way a compiler and linker would: emits each site
//! followed by its fallthrough code and taken label, collects the jump
//! entries into a sorted table, and for direct-transfer builds runs the
//! post-link pass that suppresses sites which start disabled.

use tracing::debug;

use crate::encoding::{JumpType, Polarity, SiteEncoding};
use crate::entry::{JUMP_ENTRY_SIZE, RawJumpEntry};
use crate::errors::BuildError;
use crate::image::{Image, ImageLayout};
use crate::insn::{Insn, JMP8_INSN_SIZE, JMP32_INSN_SIZE};
use crate::key::{KeyId, STATIC_KEY_SIZE};

/// Fallthrough bytes emitted after a site unless asked otherwise.
pub const DEFAULT_FALLTHROUGH: usize = 3;

/// Fills the fallthrough path between a site and its label.
const FILLER: u8 = 0x90;
/// Marks the taken label.
const LABEL: u8 = 0xc3;

#[derive(Debug, Clone, Copy)]
struct SiteSpec {
    key: KeyId,
    polarity: Polarity,
    fallthrough: usize,
}

/// Where one site ended up.
#[derive(Debug, Clone, Copy)]
struct Placed {
    spec: SiteSpec,
    site: usize,
    label: usize,
}

#[derive(Debug, Clone)]
pub struct ImageBuilder {
    encoding: SiteEncoding,
    keys: Vec<bool>,
    sites: Vec<SiteSpec>,
}

impl ImageBuilder {
    pub fn new(encoding: SiteEncoding) -> Self {
        Self {
            encoding,
            keys: Vec::new(),
            sites: Vec::new(),
        }
    }

    pub fn declare_key(&mut self, initially_enabled: bool) -> KeyId {
        #[expect(clippy::as_conversions, reason = "key sections never hold more than u32::MAX keys")]
        let id = KeyId(self.keys.len() as u32);
        self.keys.push(initially_enabled);
        id
    }

    /// Add a site guarded by `key`. Returns the site's index in the jump table.
    pub fn add_site(&mut self, key: KeyId, polarity: Polarity) -> usize {
        self.add_site_with_fallthrough(key, polarity, DEFAULT_FALLTHROUGH)
    }

    /// Add a site whose taken label lies `fallthrough` bytes past the end of the site.
    pub fn add_site_with_fallthrough(&mut self, key: KeyId, polarity: Polarity, fallthrough: usize) -> usize {
        self.sites.push(SiteSpec {
            key,
            polarity,
            fallthrough,
        });
        self.sites.len() - 1
    }

    pub fn build(self) -> Result<Image, BuildError> {
        for (site, spec) in self.sites.iter().enumerate() {
            if spec.key.index() >= self.keys.len() {
                return Err(BuildError::UndeclaredKey {
                    site,
                    key: spec.key,
                });
            }
        }

        // Offsets first: the compiled length of a site depends only on the
        // distance to its label.
        let mut offsets = Vec::with_capacity(self.sites.len());
        let mut cursor = 0usize;
        for (site, spec) in self.sites.iter().enumerate() {
            let len = self.compiled_len(spec.fallthrough);
            let label = cursor
                .checked_add(len)
                .and_then(|end| end.checked_add(spec.fallthrough))
                .ok_or(BuildError::TextTooLarge { site })?;
            offsets.push((cursor, label));
            cursor = label.checked_add(1).ok_or(BuildError::TextTooLarge { site })?;
        }

        let mut image = Image::allocate(
            ImageLayout {
                text_len: cursor,
                entries: self.sites.len(),
                keys: self.keys.len(),
            },
            self.encoding,
        )?;
        let text_start = image.text_range().start;

        let mut text = vec![FILLER; cursor];
        let mut placed = Vec::with_capacity(self.sites.len());
        for (spec, (site_offset, label_offset)) in self.sites.iter().zip(offsets) {
            let site = text_start + site_offset;
            let label = text_start + label_offset;
            let initial = self.initial_type(spec);
            let insn = self
                .encoding
                .compiled_insn(site, label, initial)
                .ok_or(BuildError::LabelOutOfRange { site, label })?;
            text[site_offset..site_offset + insn.len()].copy_from_slice(&insn.encode());
            text[label_offset] = LABEL;
            placed.push((
                Placed {
                    spec: *spec,
                    site,
                    label,
                },
                insn,
            ));
        }
        image.edit_text(text_start, &text)?;

        let suppressed = self.post_link(&mut image, &placed)?;

        let mut rows: Vec<Placed> = placed.into_iter().map(|(p, _)| p).collect();
        rows.sort_by_key(|p| p.site);
        debug_assert!(rows.windows(2).all(|pair| pair[0].site < pair[1].site));

        let keys_start = image.keys_range().start;
        image.rewrite_jump_table(|entries, table_addr| {
            for (i, (slot, p)) in entries.iter_mut().zip(&rows).enumerate() {
                let entry_addr = table_addr + i * JUMP_ENTRY_SIZE;
                let key_addr = keys_start + p.spec.key.index() * STATIC_KEY_SIZE;
                *slot = RawJumpEntry::new(entry_addr, p.site, p.label, key_addr, p.spec.polarity);
            }
        })?;

        for (key, &enabled) in image.keys().iter().zip(&self.keys) {
            key.init(enabled);
        }

        image.seal()?;
        debug!(
            sites = rows.len(),
            keys = self.keys.len(),
            suppressed,
            text_len = cursor,
            encoding = ?self.encoding,
            "Built image"
        );
        Ok(image)
    }

    fn compiled_len(&self, fallthrough: usize) -> usize {
        match self.encoding {
            SiteEncoding::Placeholder => JMP32_INSN_SIZE,
            SiteEncoding::DirectTransfer if fallthrough <= usize::from(i8::MAX.unsigned_abs()) => {
                JMP8_INSN_SIZE
            }
            SiteEncoding::DirectTransfer => JMP32_INSN_SIZE,
        }
    }

    fn initial_type(&self, spec: &SiteSpec) -> JumpType {
        let enabled = self.keys.get(spec.key.index()).copied().unwrap_or(false);
        JumpType::for_state(enabled, spec.polarity)
    }

    /// Turn compiled jumps into no-ops where the site starts disabled.
    fn post_link(&self, image: &mut Image, placed: &[(Placed, Insn)]) -> Result<usize, BuildError> {
        let mut suppressed = 0;
        for (p, compiled) in placed {
            let initial = self.initial_type(&p.spec);
            if let Some(nop) = self.encoding.post_link(*compiled, initial) {
                image.edit_text(p.site, &nop.encode())?;
                suppressed += 1;
            }
        }
        Ok(suppressed)
    }
}

//! x86 encodings installed at patch sites, and the entry-size oracle.
//!
//! Only four instructions are ever installed at a site:
//!
//! ```text
//! eb rel8           jmp rel8
//! e9 rel32          jmp rel32
//! 66 90             2-byte nop
//! 0f 1f 44 00 00    5-byte nop
//! ```
//!
//! `cc` (`int3`) also shows up at a site's first byte, but only while a patch
//! pass is rewriting it.

use std::fmt;
use std::ops::Deref;

use crate::errors::{CorruptReason, PatchError};
use crate::image::Image;

pub const INT3: u8 = 0xcc;
pub const JMP8_OPCODE: u8 = 0xeb;
pub const JMP32_OPCODE: u8 = 0xe9;

pub const NOP2: [u8; 2] = [0x66, 0x90];
pub const NOP5: [u8; 5] = [0x0f, 0x1f, 0x44, 0x00, 0x00];

pub const JMP8_INSN_SIZE: usize = 2;
pub const JMP32_INSN_SIZE: usize = 5;

/// Longest instruction a site can hold.
pub const MAX_INSN_SIZE: usize = 5;

/// An instruction that may be installed at a patch site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insn {
    Nop2,
    Nop5,
    /// `jmp rel8`, displacement relative to the end of the instruction.
    Jmp8(i8),
    /// `jmp rel32`, displacement relative to the end of the instruction.
    Jmp32(i32),
}

impl Insn {
    pub fn len(self) -> usize {
        match self {
            Insn::Nop2 | Insn::Jmp8(_) => JMP8_INSN_SIZE,
            Insn::Nop5 | Insn::Jmp32(_) => JMP32_INSN_SIZE,
        }
    }

    pub fn is_jmp(self) -> bool {
        matches!(self, Insn::Jmp8(_) | Insn::Jmp32(_))
    }

    /// The no-op of exactly `size` bytes.
    pub fn nop(size: usize) -> Option<Insn> {
        match size {
            JMP8_INSN_SIZE => Some(Insn::Nop2),
            JMP32_INSN_SIZE => Some(Insn::Nop5),
            _ => None,
        }
    }

    /// The jump of exactly `size` bytes placed at `site` and landing on `dest`.
    ///
    /// Returns `None` when the displacement does not fit the encoding.
    pub fn jmp(size: usize, site: usize, dest: usize) -> Option<Insn> {
        let next = site.checked_add(size)?;
        #[expect(clippy::as_conversions, reason = "text addresses fit in i64")]
        let rel = (dest as i64).checked_sub(next as i64)?;
        match size {
            JMP8_INSN_SIZE => i8::try_from(rel).ok().map(Insn::Jmp8),
            JMP32_INSN_SIZE => i32::try_from(rel).ok().map(Insn::Jmp32),
            _ => None,
        }
    }

    /// The shortest jump from `site` to `dest`, as an assembler would pick it.
    pub fn shortest_jmp(site: usize, dest: usize) -> Option<Insn> {
        Insn::jmp(JMP8_INSN_SIZE, site, dest).or_else(|| Insn::jmp(JMP32_INSN_SIZE, site, dest))
    }

    /// Where a jump placed at `site` lands. `None` for no-ops.
    pub fn destination(self, site: usize) -> Option<usize> {
        let next = site.checked_add(self.len())?;
        match self {
            Insn::Jmp8(rel) => next.checked_add_signed(isize::from(rel)),
            #[expect(clippy::as_conversions, reason = "rel32 always fits in isize")]
            Insn::Jmp32(rel) => next.checked_add_signed(rel as isize),
            Insn::Nop2 | Insn::Nop5 => None,
        }
    }

    /// Positively recognizes the instruction at the start of `bytes`.
    pub fn decode(bytes: &[u8]) -> Option<Insn> {
        match bytes {
            [JMP8_OPCODE, rel, ..] => Some(Insn::Jmp8(i8::from_le_bytes([*rel]))),
            [JMP32_OPCODE, a, b, c, d, ..] => Some(Insn::Jmp32(i32::from_le_bytes([*a, *b, *c, *d]))),
            [0x66, 0x90, ..] => Some(Insn::Nop2),
            [0x0f, 0x1f, 0x44, 0x00, 0x00, ..] => Some(Insn::Nop5),
            _ => None,
        }
    }

    pub fn encode(self) -> InsnBytes {
        match self {
            Insn::Nop2 => InsnBytes::from_slice(&NOP2),
            Insn::Nop5 => InsnBytes::from_slice(&NOP5),
            Insn::Jmp8(rel) => InsnBytes::from_slice(&[JMP8_OPCODE, rel.to_le_bytes()[0]]),
            Insn::Jmp32(rel) => {
                let [a, b, c, d] = rel.to_le_bytes();
                InsnBytes::from_slice(&[JMP32_OPCODE, a, b, c, d])
            }
        }
    }
}

/// Encoded bytes of one site instruction, held inline.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct InsnBytes {
    buf: [u8; MAX_INSN_SIZE],
    len: u8,
}

impl InsnBytes {
    /// Copies at most [`MAX_INSN_SIZE`] bytes from `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Self {
        let len = bytes.len().min(MAX_INSN_SIZE);
        let mut buf = [0u8; MAX_INSN_SIZE];
        buf[..len].copy_from_slice(&bytes[..len]);
        #[expect(clippy::as_conversions, reason = "len is at most MAX_INSN_SIZE")]
        Self {
            buf,
            len: len as u8,
        }
    }
}

impl Deref for InsnBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf[..usize::from(self.len)]
    }
}

impl fmt::Debug for InsnBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", hex::encode(&**self))
    }
}

impl fmt::Display for InsnBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&**self))
    }
}

/// Entry-size oracle: the length of the instruction currently installed at `site`.
///
/// Only the encodings a site may legitimately hold are accepted. Anything
/// else means the text no longer matches the jump table and is reported as
/// [`PatchError::CorruptEntry`].
pub fn entry_size(image: &Image, site: usize) -> Result<usize, PatchError> {
    let bytes = image.fetch(site).ok_or(PatchError::CorruptEntry {
        site,
        found: InsnBytes::default(),
        reason: CorruptReason::OutsideText,
    })?;
    Insn::decode(&bytes)
        .map(Insn::len)
        .ok_or(PatchError::CorruptEntry {
            site,
            found: InsnBytes::from_slice(&bytes),
            reason: CorruptReason::Unrecognized,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_recognizes_site_encodings() {
        assert_eq!(Insn::decode(&[0xeb, 0x10, 0, 0, 0]), Some(Insn::Jmp8(0x10)));
        assert_eq!(Insn::decode(&[0xeb, 0xfe]), Some(Insn::Jmp8(-2)));
        assert_eq!(
            Insn::decode(&[0xe9, 0x00, 0x01, 0x00, 0x00]),
            Some(Insn::Jmp32(0x100))
        );
        assert_eq!(Insn::decode(&NOP2), Some(Insn::Nop2));
        assert_eq!(Insn::decode(&NOP5), Some(Insn::Nop5));
    }

    #[test]
    fn test_decode_rejects_everything_else() {
        assert_eq!(Insn::decode(&[INT3, 0, 0, 0, 0]), None);
        assert_eq!(Insn::decode(&[0x90, 0x90]), None);
        // Truncated rel32.
        assert_eq!(Insn::decode(&[0xe9, 0x00, 0x00]), None);
        // 5-byte nop with a non-zero displacement is a different instruction.
        assert_eq!(Insn::decode(&[0x0f, 0x1f, 0x44, 0x00, 0x01]), None);
        assert_eq!(Insn::decode(&[]), None);
    }

    #[test]
    fn test_jmp_range() {
        let site = 0x1000;
        assert_eq!(Insn::jmp(2, site, site + 2 + 127), Some(Insn::Jmp8(127)));
        assert_eq!(Insn::jmp(2, site, site + 2 + 128), None);
        assert_eq!(Insn::jmp(2, site, site + 2 - 128), Some(Insn::Jmp8(-128)));
        assert_eq!(Insn::jmp(5, site, site + 5 + 128), Some(Insn::Jmp32(128)));
        assert_eq!(Insn::jmp(3, site, site), None);
        assert_eq!(
            Insn::shortest_jmp(site, site + 300).map(Insn::len),
            Some(JMP32_INSN_SIZE)
        );
        assert_eq!(Insn::shortest_jmp(site, site + 20).map(Insn::len), Some(JMP8_INSN_SIZE));
    }

    #[test]
    fn test_destination_matches_encoding() {
        let site = 0x2000;
        for dest in [site + 7, site + 200, site - 40] {
            let insn = Insn::shortest_jmp(site, dest).expect("reachable");
            assert_eq!(insn.destination(site), Some(dest));
            let decoded = Insn::decode(&insn.encode()).expect("decodes");
            assert_eq!(decoded, insn);
        }
        assert_eq!(Insn::Nop5.destination(site), None);
    }

    #[test]
    fn test_insn_bytes_display() {
        assert_eq!(Insn::Nop5.encode().to_string(), "0f1f440000");
        assert_eq!(format!("{:?}", Insn::Jmp8(4).encode()), "[eb04]");
    }
}

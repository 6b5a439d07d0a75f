//! The two shapes a branch site can be compiled into, and the rules for
//! which instruction a site should hold.

use serde::Serialize;

use crate::insn::{Insn, JMP32_INSN_SIZE};

/// How call sites are compiled. Fixed for an image when it is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SiteEncoding {
    /// Sites start as a 5-byte no-op sized for a `jmp rel32`; enabling
    /// overwrites the padding with the jump.
    Placeholder,
    /// Sites are compiled as a jump to the taken label; a post-link pass
    /// turns the ones that start disabled into same-length no-ops.
    DirectTransfer,
}

impl SiteEncoding {
    /// The encoding selected for this build.
    #[cfg(not(feature = "direct-transfer"))]
    pub const DEFAULT: SiteEncoding = SiteEncoding::Placeholder;
    #[cfg(feature = "direct-transfer")]
    pub const DEFAULT: SiteEncoding = SiteEncoding::DirectTransfer;

    pub fn as_str(self) -> &'static str {
        match self {
            SiteEncoding::Placeholder => "placeholder",
            SiteEncoding::DirectTransfer => "direct-transfer",
        }
    }

    /// What the compiler emits at `site` for a branch to `label`.
    ///
    /// For [`SiteEncoding::DirectTransfer`] this is always a jump, regardless
    /// of `initial`; [`SiteEncoding::post_link`] fixes it up afterwards.
    pub fn compiled_insn(self, site: usize, label: usize, initial: JumpType) -> Option<Insn> {
        match self {
            SiteEncoding::Placeholder => match initial {
                JumpType::Nop => Some(Insn::Nop5),
                JumpType::Jmp => Insn::jmp(JMP32_INSN_SIZE, site, label),
            },
            SiteEncoding::DirectTransfer => Insn::shortest_jmp(site, label),
        }
    }

    /// The post-link rewrite for a compiled site, if one is needed.
    pub fn post_link(self, compiled: Insn, initial: JumpType) -> Option<Insn> {
        match (self, initial) {
            (SiteEncoding::DirectTransfer, JumpType::Nop) => Insn::nop(compiled.len()),
            _ => None,
        }
    }
}

impl Default for SiteEncoding {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl std::str::FromStr for SiteEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "placeholder" => Ok(SiteEncoding::Placeholder),
            "direct-transfer" => Ok(SiteEncoding::DirectTransfer),
            other => Err(format!(
                "unknown site encoding `{other}`, expected `placeholder` or `direct-transfer`"
            )),
        }
    }
}

/// The compiled sense of a branch.
///
/// `Direct` sites jump to the taken label while the key is enabled
/// (an "unlikely" branch). `Inverted` sites jump while the key is disabled,
/// so the enabled path is the fallthrough (a "likely" branch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Polarity {
    Direct,
    Inverted,
}

impl Polarity {
    pub fn is_inverted(self) -> bool {
        self == Polarity::Inverted
    }

    pub(crate) fn from_bit(bit: bool) -> Self {
        if bit { Polarity::Inverted } else { Polarity::Direct }
    }
}

/// Which of the two encodings a site should hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JumpType {
    Nop,
    Jmp,
}

impl JumpType {
    /// A site jumps when the key state and the site's polarity disagree.
    pub fn for_state(enabled: bool, polarity: Polarity) -> JumpType {
        if enabled ^ polarity.is_inverted() {
            JumpType::Jmp
        } else {
            JumpType::Nop
        }
    }

    pub fn of(insn: Insn) -> JumpType {
        if insn.is_jmp() { JumpType::Jmp } else { JumpType::Nop }
    }

    /// The instruction of this type and `size` bytes for `site`.
    pub fn insn(self, size: usize, site: usize, label: usize) -> Option<Insn> {
        match self {
            JumpType::Nop => Insn::nop(size),
            JumpType::Jmp => Insn::jmp(size, site, label),
        }
    }

    pub fn flip(self) -> JumpType {
        match self {
            JumpType::Nop => JumpType::Jmp,
            JumpType::Jmp => JumpType::Nop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jump_type_truth_table() {
        assert_eq!(JumpType::for_state(false, Polarity::Direct), JumpType::Nop);
        assert_eq!(JumpType::for_state(true, Polarity::Direct), JumpType::Jmp);
        assert_eq!(JumpType::for_state(false, Polarity::Inverted), JumpType::Jmp);
        assert_eq!(JumpType::for_state(true, Polarity::Inverted), JumpType::Nop);
    }

    #[test]
    fn test_placeholder_is_always_five_bytes() {
        let site = 0x4000;
        let near = site + 10;
        for initial in [JumpType::Nop, JumpType::Jmp] {
            let insn = SiteEncoding::Placeholder
                .compiled_insn(site, near, initial)
                .expect("compiles");
            assert_eq!(insn.len(), JMP32_INSN_SIZE);
            assert_eq!(JumpType::of(insn), initial);
            assert_eq!(SiteEncoding::Placeholder.post_link(insn, initial), None);
        }
    }

    #[test]
    fn test_direct_transfer_compiles_jumps_then_suppresses() {
        let site = 0x4000;
        let near = site + 10;
        let far = site + 1000;

        let short = SiteEncoding::DirectTransfer
            .compiled_insn(site, near, JumpType::Nop)
            .expect("compiles");
        assert_eq!(short, Insn::Jmp8(8));
        assert_eq!(
            SiteEncoding::DirectTransfer.post_link(short, JumpType::Nop),
            Some(Insn::Nop2)
        );
        assert_eq!(SiteEncoding::DirectTransfer.post_link(short, JumpType::Jmp), None);

        let long = SiteEncoding::DirectTransfer
            .compiled_insn(site, far, JumpType::Nop)
            .expect("compiles");
        assert_eq!(long.len(), JMP32_INSN_SIZE);
        assert_eq!(
            SiteEncoding::DirectTransfer.post_link(long, JumpType::Nop),
            Some(Insn::Nop5)
        );
    }

    #[test]
    fn test_parse_encoding() {
        assert_eq!("placeholder".parse(), Ok(SiteEncoding::Placeholder));
        assert_eq!("direct-transfer".parse(), Ok(SiteEncoding::DirectTransfer));
        assert!("jit".parse::<SiteEncoding>().is_err());
    }
}

use std::fmt;
use std::time::Duration;

use crate::insn::InsnBytes;
use crate::key::KeyId;

/// Errors raised while mapping or protecting image memory.
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("Failed to map {size} bytes of image memory: {source}")]
    AllocationFailed { size: usize, source: std::io::Error },
    #[error("Failed to change protection of {len} bytes at {addr:#x}: {source}")]
    ProtectionFailed {
        addr: usize,
        len: usize,
        source: std::io::Error,
    },
    #[error("Address range {start:#x}..{end:#x} is outside the text section")]
    OutsideText { start: usize, end: usize },
    #[error("The text of this image is already owned by a patcher")]
    PokerTaken,
    #[error("Image memory is not supported on this platform")]
    Unsupported,
}

/// Errors found while loading a jump table. All of them mean the build or
/// link step produced an inconsistent image; none are recoverable at runtime.
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("Jump entry {index} references {addr:#x}, which is not a key in the key section")]
    StaleKeyReference { index: usize, addr: usize },
    #[error("Jump entry {index} points at {addr:#x}, outside the text section")]
    SiteOutsideText { index: usize, addr: usize },
    #[error("Jump entry {index} at {addr:#x} is out of order; the table must be sorted by site")]
    Unsorted { index: usize, addr: usize },
    #[error("Jump entries {first} and {second} describe the same site {addr:#x}")]
    DuplicateSite {
        first: usize,
        second: usize,
        addr: usize,
    },
}

/// Why the bytes at a site could not be patched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptReason {
    /// The site address is not inside the text section.
    OutsideText,
    /// The bytes are none of the encodings a site may hold.
    Unrecognized,
    /// A known encoding, but not the one the key's state implies.
    Unexpected { expected: InsnBytes },
    /// The installed length cannot encode a jump to the taken label.
    Unreachable,
}

impl fmt::Display for CorruptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorruptReason::OutsideText => f.write_str("site is outside the text section"),
            CorruptReason::Unrecognized => f.write_str("unrecognized instruction"),
            CorruptReason::Unexpected { expected } => write!(f, "expected {expected}"),
            CorruptReason::Unreachable => f.write_str("label out of range for installed length"),
        }
    }
}

/// Errors returned by toggle operations. The branch check never sees these.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PatchError {
    #[error("Corrupt jump entry at {site:#x}: {reason} (found {found})")]
    CorruptEntry {
        site: usize,
        found: InsnBytes,
        reason: CorruptReason,
    },
    #[error("Execution contexts did not reach a safe point after {attempts} attempts ({waited:?})")]
    BarrierTimeout { attempts: u32, waited: Duration },
    #[error("Key {0} disabled more times than it was enabled")]
    UnbalancedDisable(KeyId),
    #[error("Key {0} is not part of this image")]
    UnknownKey(KeyId),
    #[error("Key {0} enable count would overflow")]
    CountOverflow(KeyId),
    #[error("Text protection change failed: {0}")]
    Protection(String),
}

impl From<ImageError> for PatchError {
    fn from(value: ImageError) -> Self {
        PatchError::Protection(value.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Image error: {0}")]
    Image(#[from] ImageError),
    #[error("Site {site} references undeclared key {key}")]
    UndeclaredKey { site: usize, key: KeyId },
    #[error("Text section overflows the address space at site {site}")]
    TextTooLarge { site: usize },
    #[error("Site at {site:#x} cannot reach its label at {label:#x}")]
    LabelOutOfRange { site: usize, label: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Jump table error: {0}")]
    Table(#[from] TableError),
    #[error("Image error: {0}")]
    Image(#[from] ImageError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Error deserializing config from env: {err}. From config: {from:?}")]
    ConfigDeserializationError { err: envy::Error, from: String },
}

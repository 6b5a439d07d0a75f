//! Static keys and jump labels.
//!
//! A branch site is a patchable instruction in an [`Image`]'s text that is
//! either a no-op (fall through) or a jump to a taken label. Each site
//! belongs to a [`StaticKey`]; toggling the key rewrites every one of its
//! sites while [`ExecutionContext`]s keep evaluating them, so the branch
//! check itself never loads the key.
//!
//! Images are laid out by an [`ImageBuilder`] and handed to
//! [`JumpLabels::load`], which owns patching from then on.

pub mod batch;
pub mod builder;
pub mod config;
pub mod context;
pub mod encoding;
pub mod entry;
pub mod errors;
pub mod image;
pub mod insn;
pub mod key;
pub mod labels;
mod patch;
mod poke;
pub mod stats;
pub mod sync;

pub use batch::{Batch, BatchReport, KeyOp};
pub use builder::{DEFAULT_FALLTHROUGH, ImageBuilder};
pub use config::{PATCH_CONFIG_PREFIX, PatchConfig, PokeMode};
pub use context::ExecutionContext;
pub use encoding::{JumpType, Polarity, SiteEncoding};
pub use entry::{JumpEntry, KeyRef, RawJumpEntry};
pub use errors::{BuildError, ConfigError, CorruptReason, ImageError, LoadError, PatchError, TableError};
pub use image::{Image, ImageLayout, TextPoker, get_page_size};
pub use insn::{Insn, InsnBytes, entry_size};
pub use key::{KeyId, StaticKey};
pub use labels::{JumpLabels, Site};
pub use stats::{PatchStats, StatsSnapshot};
pub use sync::{ContextRegistry, SyncCore};

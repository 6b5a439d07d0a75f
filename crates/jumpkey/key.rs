use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};

use serde::Serialize;

/// Identity of a static key: its index in the image's key section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct KeyId(pub u32);

impl KeyId {
    pub fn index(self) -> usize {
        #[expect(clippy::as_conversions, reason = "u32 always fits in usize")]
        let index = self.0 as usize;
        index
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub const STATIC_KEY_SIZE: usize = 8;

/// A static key as stored in the key section.
///
/// `enabled` is a reference count: `0` while disabled, `n > 0` while `n`
/// holders have it enabled, and `-1` while the first enable is being patched
/// in. Only the patch path under the patch mutex moves it across `0`/`1`.
#[repr(C, align(8))]
#[derive(Default)]
pub struct StaticKey {
    enabled: AtomicI32,
    _reserved: u32,
}

const _: () = assert!(std::mem::size_of::<StaticKey>() == STATIC_KEY_SIZE);

impl StaticKey {
    pub fn count(&self) -> i32 {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_enabled(&self) -> bool {
        self.count() > 0
    }

    pub(crate) fn init(&self, enabled: bool) {
        self.enabled.store(i32::from(enabled), Ordering::Release);
    }

    /// Take another reference, but only if the key is already enabled.
    pub(crate) fn inc_if_enabled(&self) -> bool {
        self.enabled
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                if v > 0 { v.checked_add(1) } else { None }
            })
            .is_ok()
    }

    /// Drop a reference, but only if it is not the last one.
    pub(crate) fn dec_unless_last(&self) -> bool {
        self.enabled
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                (v > 1).then(|| v - 1)
            })
            .is_ok()
    }

    pub(crate) fn compare_exchange(&self, current: i32, new: i32) -> Result<i32, i32> {
        self.enabled
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }

    pub(crate) fn store(&self, value: i32) {
        self.enabled.store(value, Ordering::Release);
    }
}

impl fmt::Debug for StaticKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKey")
            .field("enabled", &self.count())
            .finish()
    }
}

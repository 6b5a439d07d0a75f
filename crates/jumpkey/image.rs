//! Image memory: the text, jump-table and key sections of one build.
//!
//! An image is a single anonymous mapping laid out like a linked binary:
//!
//! ```text
//! base
//! [ text ........ ][ __jump_table ][ keys ]
//!   read-only        read-only       read-write
//! ```
//!
//! Every section starts on a page boundary, so each one can be protected on
//! its own and the jump table's start and end are plain address ranges.
//! Because all three live in one mapping, the self-relative jump entries stay
//! valid wherever the mapping lands, including in a [`Image::duplicate`].
//!
//! Text is only ever accessed as naturally aligned `AtomicU64` words. Readers
//! go through [`Image::fetch`]; the only writer is the [`TextPoker`], of which
//! at most one exists per image.

use std::ops::Range;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::error;

use crate::encoding::SiteEncoding;
use crate::entry::{JUMP_ENTRY_SIZE, JumpEntry, JumpTable, RawJumpEntry};
use crate::errors::{ImageError, TableError};
use crate::insn::MAX_INSN_SIZE;
use crate::key::{STATIC_KEY_SIZE, StaticKey};

const WORD_SIZE: usize = std::mem::size_of::<u64>();

/// Get the system page size.
pub fn get_page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(query_page_size)
}

#[cfg(unix)]
fn query_page_size() -> usize {
    // SAFETY: sysconf is safe to call
    #[expect(unsafe_code, reason = "libc::sysconf call to get page size")]
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    // Fallback to common page size
    usize::try_from(size).ok().filter(|s| *s > 0).unwrap_or(4096)
}

#[cfg(not(unix))]
fn query_page_size() -> usize {
    4096
}

fn round_up(value: usize, align: usize) -> usize {
    value.max(1).div_ceil(align).saturating_mul(align)
}

/// Sizes of the three sections of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLayout {
    /// Bytes of text actually laid out.
    pub text_len: usize,
    /// Number of jump entries.
    pub entries: usize,
    /// Number of static keys.
    pub keys: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protection {
    ReadOnly,
    ReadWrite,
}

pub struct Image {
    base: NonNull<u8>,
    alloc_size: usize,
    layout: ImageLayout,
    /// Section offsets from `base`, page aligned.
    text: Range<usize>,
    table: Range<usize>,
    keys: Range<usize>,
    encoding: SiteEncoding,
    sealed: bool,
    poker_taken: AtomicBool,
}

// Text is only touched through atomics and the other sections are either
// immutable after sealing or hold atomics themselves.
#[expect(unsafe_code, reason = "Image can be safely moved between threads")]
unsafe impl Send for Image {}
#[expect(unsafe_code, reason = "Image is shared through atomics only")]
unsafe impl Sync for Image {}

impl Image {
    /// Map a zeroed, fully writable image with room for `layout`.
    pub(crate) fn allocate(layout: ImageLayout, encoding: SiteEncoding) -> Result<Self, ImageError> {
        let page = get_page_size();
        let text_size = round_up(layout.text_len, page);
        let table_size = round_up(layout.entries.saturating_mul(JUMP_ENTRY_SIZE), page);
        let keys_size = round_up(layout.keys.saturating_mul(STATIC_KEY_SIZE), page);
        let alloc_size = text_size
            .saturating_add(table_size)
            .saturating_add(keys_size)
            .max(page);

        let base = Self::map(alloc_size)?;
        let text = 0..text_size;
        let table = text.end..text.end.saturating_add(table_size);
        let keys = table.end..table.end.saturating_add(keys_size);

        Ok(Self {
            base,
            alloc_size,
            layout,
            text,
            table,
            keys,
            encoding,
            sealed: false,
            poker_taken: AtomicBool::new(false),
        })
    }

    pub fn layout(&self) -> ImageLayout {
        self.layout
    }

    pub fn encoding(&self) -> SiteEncoding {
        self.encoding
    }

    pub fn base(&self) -> usize {
        self.base.as_ptr().addr()
    }

    /// Absolute address range of the laid-out text.
    pub fn text_range(&self) -> Range<usize> {
        let start = self.base().saturating_add(self.text.start);
        start..start.saturating_add(self.layout.text_len)
    }

    /// Absolute address range of the jump table.
    pub fn jump_table_range(&self) -> Range<usize> {
        let start = self.base().saturating_add(self.table.start);
        start..start.saturating_add(self.layout.entries.saturating_mul(JUMP_ENTRY_SIZE))
    }

    /// Absolute address range of the key section.
    pub fn keys_range(&self) -> Range<usize> {
        let start = self.base().saturating_add(self.keys.start);
        start..start.saturating_add(self.layout.keys.saturating_mul(STATIC_KEY_SIZE))
    }

    pub fn contains_text(&self, addr: usize) -> bool {
        self.text_range().contains(&addr)
    }

    /// Make text and jump table read-only. Keys stay writable.
    pub(crate) fn seal(&mut self) -> Result<(), ImageError> {
        self.protect(self.text.clone(), Protection::ReadOnly)?;
        self.protect(self.table.clone(), Protection::ReadOnly)?;
        self.sealed = true;
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    fn text_words(&self) -> &[AtomicU64] {
        // SAFETY: the text section is page aligned, its size is a multiple of
        // the word size and the mapping lives as long as `self`.
        #[expect(unsafe_code, reason = "Atomic view over mapped text")]
        let words = unsafe {
            std::slice::from_raw_parts(
                self.base.as_ptr().add(self.text.start).cast::<AtomicU64>(),
                self.text.len() / WORD_SIZE,
            )
        };
        words
    }

    /// Fetch the instruction bytes at `addr` the way an execution context would.
    ///
    /// The word holding `addr` is loaded first with `SeqCst`; if the longest
    /// possible instruction runs into the next word, that word is loaded
    /// second. Bytes past the end of text read as zero. Returns `None` for
    /// addresses outside the text.
    pub fn fetch(&self, addr: usize) -> Option<[u8; MAX_INSN_SIZE]> {
        let offset = self.text_offset(addr)?;
        let words = self.text_words();
        let index = offset / WORD_SIZE;
        let shift = offset % WORD_SIZE;

        let mut raw = [0u8; 2 * WORD_SIZE];
        raw[..WORD_SIZE].copy_from_slice(&words.get(index)?.load(Ordering::SeqCst).to_le_bytes());
        if shift + MAX_INSN_SIZE > WORD_SIZE {
            if let Some(next) = words.get(index + 1) {
                raw[WORD_SIZE..].copy_from_slice(&next.load(Ordering::Acquire).to_le_bytes());
            }
        }

        let mut bytes = [0u8; MAX_INSN_SIZE];
        bytes.copy_from_slice(&raw[shift..shift + MAX_INSN_SIZE]);
        Some(bytes)
    }

    /// Copy `len` bytes of text starting at `addr`.
    pub fn read_text(&self, addr: usize, len: usize) -> Option<Vec<u8>> {
        let start = self.text_offset(addr)?;
        let end = start.checked_add(len)?;
        if end > self.layout.text_len {
            return None;
        }
        let words = self.text_words();
        let bytes = (start..end)
            .map(|offset| {
                let word = words[offset / WORD_SIZE].load(Ordering::Acquire);
                word.to_le_bytes()[offset % WORD_SIZE]
            })
            .collect();
        Some(bytes)
    }

    fn text_offset(&self, addr: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.base().saturating_add(self.text.start))?;
        (offset < self.layout.text_len).then_some(offset)
    }

    /// Overwrite text while nothing else can observe it.
    ///
    /// Taking `&mut self` means the image is not shared yet, so no execution
    /// context can be fetching from it. This is how the post-link pass and
    /// inspection tools edit a built image before it is loaded.
    pub fn edit_text(&mut self, addr: usize, bytes: &[u8]) -> Result<(), ImageError> {
        if self.sealed {
            self.protect(self.text.clone(), Protection::ReadWrite)?;
        }
        let written = self.store_text(addr, bytes);
        if self.sealed {
            self.protect(self.text.clone(), Protection::ReadOnly)?;
        }
        written
    }

    /// Splice `bytes` into text, one word-wide compare-exchange per word touched.
    fn store_text(&self, addr: usize, bytes: &[u8]) -> Result<(), ImageError> {
        let out_of_range = || ImageError::OutsideText {
            start: addr,
            end: addr.saturating_add(bytes.len()),
        };
        let start = self.text_offset(addr).ok_or_else(out_of_range)?;
        if start.saturating_add(bytes.len()) > self.layout.text_len {
            return Err(out_of_range());
        }

        let words = self.text_words();
        let mut offset = start;
        let mut rest = bytes;
        while !rest.is_empty() {
            let shift = offset % WORD_SIZE;
            let take = rest.len().min(WORD_SIZE - shift);
            let (chunk, tail) = rest.split_at(take);
            let _ = words[offset / WORD_SIZE].fetch_update(Ordering::SeqCst, Ordering::SeqCst, |old| {
                let mut word = old.to_le_bytes();
                word[shift..shift + take].copy_from_slice(chunk);
                Some(u64::from_le_bytes(word))
            });
            offset += take;
            rest = tail;
        }
        Ok(())
    }

    /// Whether `len` bytes at `addr` fall inside one aligned word.
    pub fn fits_in_word(addr: usize, len: usize) -> bool {
        len > 0 && addr % WORD_SIZE + len <= WORD_SIZE
    }

    pub(crate) fn raw_entries(&self) -> &[RawJumpEntry] {
        // SAFETY: the table section is page aligned, sized for `entries`
        // records and never written once the image is shared.
        #[expect(unsafe_code, reason = "Typed view over the mapped jump table")]
        let entries = unsafe {
            std::slice::from_raw_parts(
                self.base.as_ptr().add(self.table.start).cast::<RawJumpEntry>(),
                self.layout.entries,
            )
        };
        entries
    }

    /// Rewrite jump-table records in place. Only possible before the image is shared.
    pub(crate) fn rewrite_jump_table<F>(&mut self, f: F) -> Result<(), ImageError>
    where
        F: FnOnce(&mut [RawJumpEntry], usize),
    {
        if self.sealed {
            self.protect(self.table.clone(), Protection::ReadWrite)?;
        }
        let table_addr = self.jump_table_range().start;
        // SAFETY: as in `raw_entries`; `&mut self` rules out other views.
        #[expect(unsafe_code, reason = "Mutable view over the mapped jump table")]
        let entries = unsafe {
            std::slice::from_raw_parts_mut(
                self.base.as_ptr().add(self.table.start).cast::<RawJumpEntry>(),
                self.layout.entries,
            )
        };
        f(entries, table_addr);
        if self.sealed {
            self.protect(self.table.clone(), Protection::ReadOnly)?;
        }
        Ok(())
    }

    pub(crate) fn keys(&self) -> &[StaticKey] {
        // SAFETY: the key section is page aligned, sized for `keys` records
        // and only mutated through the atomics inside `StaticKey`.
        #[expect(unsafe_code, reason = "Typed view over the mapped key section")]
        let keys = unsafe {
            std::slice::from_raw_parts(
                self.base.as_ptr().add(self.keys.start).cast::<StaticKey>(),
                self.layout.keys,
            )
        };
        keys
    }

    /// Decode and validate the jump table without loading the image.
    pub fn jump_entries(&self) -> Result<Vec<JumpEntry>, TableError> {
        JumpTable::load(self).map(JumpTable::into_entries)
    }

    /// Index of the key stored at `addr`, if `addr` is exactly a key.
    pub(crate) fn key_index_at(&self, addr: usize) -> Option<usize> {
        let range = self.keys_range();
        if !range.contains(&addr) {
            return None;
        }
        let offset = addr - range.start;
        (offset % STATIC_KEY_SIZE == 0).then_some(offset / STATIC_KEY_SIZE)
    }

    /// Copy this image into a fresh mapping at a different base address.
    ///
    /// Fails with [`ImageError::PokerTaken`] while the image is loaded, since
    /// its text may be changing underneath the copy.
    pub fn duplicate(&self) -> Result<Image, ImageError> {
        if self.poker_taken.load(Ordering::Acquire) {
            return Err(ImageError::PokerTaken);
        }
        let mut copy = Image::allocate(self.layout, self.encoding)?;
        // SAFETY: both mappings are `alloc_size` bytes, readable, and distinct.
        #[expect(unsafe_code, reason = "Raw copy between two image mappings")]
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.as_ptr(), copy.base.as_ptr(), self.alloc_size);
        };
        if self.sealed {
            copy.seal()?;
        }
        Ok(copy)
    }

    fn protect(&self, section: Range<usize>, protection: Protection) -> Result<(), ImageError> {
        #[expect(unsafe_code, reason = "Pointer offset within the image mapping")]
        let ptr = unsafe { self.base.as_ptr().add(section.start) };
        Self::protect_raw(ptr, section.len(), protection)
    }

    // Platform-specific implementations

    #[cfg(unix)]
    fn map(size: usize) -> Result<NonNull<u8>, ImageError> {
        use libc::{MAP_ANON, MAP_PRIVATE, PROT_READ, PROT_WRITE};

        #[expect(unsafe_code, reason = "libc::mmap call for image memory")]
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANON,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(ImageError::AllocationFailed {
                size,
                source: std::io::Error::last_os_error(),
            });
        }

        NonNull::new(ptr.cast::<u8>()).ok_or(ImageError::AllocationFailed {
            size,
            source: std::io::Error::other("mmap returned null"),
        })
    }

    #[cfg(unix)]
    fn protect_raw(ptr: *mut u8, len: usize, protection: Protection) -> Result<(), ImageError> {
        let prot = match protection {
            Protection::ReadOnly => libc::PROT_READ,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        };

        #[expect(unsafe_code, reason = "libc::mprotect call on image memory")]
        let result = unsafe { libc::mprotect(ptr.cast::<libc::c_void>(), len, prot) };

        if result != 0 {
            return Err(ImageError::ProtectionFailed {
                addr: ptr.addr(),
                len,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    #[cfg(unix)]
    fn unmap(ptr: *mut u8, size: usize) {
        #[expect(unsafe_code, reason = "libc::munmap call to free image memory")]
        unsafe {
            libc::munmap(ptr.cast::<libc::c_void>(), size);
        };
    }

    #[cfg(not(unix))]
    fn map(_size: usize) -> Result<NonNull<u8>, ImageError> {
        Err(ImageError::Unsupported)
    }

    #[cfg(not(unix))]
    fn protect_raw(_ptr: *mut u8, _len: usize, _protection: Protection) -> Result<(), ImageError> {
        Err(ImageError::Unsupported)
    }

    #[cfg(not(unix))]
    fn unmap(_ptr: *mut u8, _size: usize) {}
}

impl Drop for Image {
    fn drop(&mut self) {
        Self::unmap(self.base.as_ptr(), self.alloc_size);
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("layout", &self.layout)
            .field("encoding", &self.encoding)
            .field("sealed", &self.sealed)
            .finish()
    }
}

/// Exclusive capability to write the text of one image.
///
/// Created once per image and kept behind the patch mutex; every other part
/// of the crate reads text through [`Image::fetch`].
pub struct TextPoker {
    image: Arc<Image>,
}

impl TextPoker {
    pub fn acquire(image: &Arc<Image>) -> Result<Self, ImageError> {
        if image.poker_taken.swap(true, Ordering::AcqRel) {
            return Err(ImageError::PokerTaken);
        }
        Ok(Self {
            image: Arc::clone(image),
        })
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    /// Open the text for writing. The text is read-only again when the
    /// returned window is dropped.
    pub fn writable(&mut self) -> Result<WritableText<'_>, ImageError> {
        self.image
            .protect(self.image.text.clone(), Protection::ReadWrite)?;
        Ok(WritableText { image: &self.image })
    }
}

impl Drop for TextPoker {
    fn drop(&mut self) {
        self.image.poker_taken.store(false, Ordering::Release);
    }
}

/// A scoped window during which the text is writable.
pub struct WritableText<'a> {
    image: &'a Image,
}

impl WritableText<'_> {
    pub fn write_byte(&self, addr: usize, byte: u8) -> Result<(), ImageError> {
        self.image.store_text(addr, &[byte])
    }

    /// Write `bytes` word by word. Not atomic as a whole once it spans words.
    pub fn write_bytes(&self, addr: usize, bytes: &[u8]) -> Result<(), ImageError> {
        self.image.store_text(addr, bytes)
    }

    /// Write `bytes` with a single store if they fit in one aligned word.
    ///
    /// Returns `false`, writing nothing, when they do not.
    pub fn write_atomic(&self, addr: usize, bytes: &[u8]) -> Result<bool, ImageError> {
        if !Image::fits_in_word(addr, bytes.len()) {
            return Ok(false);
        }
        self.image.store_text(addr, bytes)?;
        Ok(true)
    }
}

impl Drop for WritableText<'_> {
    fn drop(&mut self) {
        if let Err(err) = self
            .image
            .protect(self.image.text.clone(), Protection::ReadOnly)
        {
            error!(%err, "Failed to write-protect image text after patching");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_with_text(text: &[u8]) -> Image {
        let mut image = Image::allocate(
            ImageLayout {
                text_len: text.len(),
                entries: 0,
                keys: 0,
            },
            SiteEncoding::Placeholder,
        )
        .expect("allocate image");
        let start = image.text_range().start;
        image.edit_text(start, text).expect("write text");
        image.seal().expect("seal");
        image
    }

    #[test]
    fn test_sections_are_page_aligned() {
        let image = Image::allocate(
            ImageLayout {
                text_len: 100,
                entries: 3,
                keys: 2,
            },
            SiteEncoding::Placeholder,
        )
        .expect("allocate image");
        let page = get_page_size();
        assert_eq!(image.text_range().start % page, 0);
        assert_eq!(image.jump_table_range().start % page, 0);
        assert_eq!(image.keys_range().start % page, 0);
        assert_eq!(image.jump_table_range().len(), 3 * JUMP_ENTRY_SIZE);
        assert_eq!(image.keys_range().len(), 2 * STATIC_KEY_SIZE);
        assert!(image.jump_table_range().start >= image.text_range().end);
    }

    #[test]
    fn test_fetch_across_word_boundary() {
        let text: Vec<u8> = (0u8..32).collect();
        let image = image_with_text(&text);
        let start = image.text_range().start;

        assert_eq!(image.fetch(start), Some([0, 1, 2, 3, 4]));
        assert_eq!(image.fetch(start + 6), Some([6, 7, 8, 9, 10]));
        // Tail of the text reads as zero past the end.
        assert_eq!(image.fetch(start + 30), Some([30, 31, 0, 0, 0]));
        assert_eq!(image.fetch(start + 32), None);
        assert_eq!(image.fetch(start.wrapping_sub(1)), None);
    }

    #[test]
    fn test_edit_sealed_text() {
        let mut image = image_with_text(&[0x90; 16]);
        let start = image.text_range().start;
        image
            .edit_text(start + 6, &[1, 2, 3, 4])
            .expect("edit across words");
        assert_eq!(
            image.read_text(start + 4, 8),
            Some(vec![0x90, 0x90, 1, 2, 3, 4, 0x90, 0x90])
        );
        assert!(image.is_sealed());
        assert!(image.edit_text(start + 14, &[0; 4]).is_err());
    }

    #[test]
    fn test_single_poker_per_image() {
        let image = Arc::new(image_with_text(&[0x90; 8]));
        let poker = TextPoker::acquire(&image).expect("first poker");
        assert!(matches!(
            TextPoker::acquire(&image),
            Err(ImageError::PokerTaken)
        ));
        assert!(matches!(image.duplicate(), Err(ImageError::PokerTaken)));
        drop(poker);
        assert!(TextPoker::acquire(&image).is_ok());
    }

    #[test]
    fn test_write_atomic_only_within_a_word() {
        let image = Arc::new(image_with_text(&[0x90; 16]));
        let start = image.text_range().start;
        let mut poker = TextPoker::acquire(&image).expect("poker");
        {
            let text = poker.writable().expect("writable");
            assert!(text.write_atomic(start + 3, &[1, 2, 3, 4, 5]).expect("write"));
            assert!(!text.write_atomic(start + 5, &[9, 9, 9, 9, 9]).expect("write"));
        }
        assert_eq!(image.fetch(start + 3), Some([1, 2, 3, 4, 5]));
        assert_eq!(image.fetch(start + 8), Some([0x90; 5]));
    }

    #[test]
    fn test_duplicate_lands_elsewhere() {
        let image = image_with_text(&[0xaa; 24]);
        let copy = image.duplicate().expect("duplicate");
        assert_ne!(copy.base(), image.base());
        assert!(copy.is_sealed());
        assert_eq!(
            copy.read_text(copy.text_range().start, 24),
            Some(vec![0xaa; 24])
        );
    }
}

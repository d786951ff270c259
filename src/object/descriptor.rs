//! Reference descriptors.
//!
//! A descriptor tells the collector which word-sized slots of a memory range
//! hold references. The same representation serves registered root ranges
//! and object payloads (via the `reference_bitmap` runtime callback).

use crate::object::header::WORD_SIZE;

/// Marker callback supplied by the runtime for `User` descriptors. Invoked
/// with the range bounds and a relay that accepts each reference slot.
pub type UserMarkFn = fn(start: usize, end: usize, relay: &mut dyn FnMut(*mut usize));

/// Describes the reference slots of a memory range.
#[derive(Clone, Copy, Debug)]
pub enum Descriptor {
    /// Inline bitmap: bit `i` set means word `i` of the range is a
    /// reference. Covers ranges up to 64 words.
    Bitmap(u64),
    /// Address of an out-of-line bitmap block: one length word followed by
    /// that many bitmap words, each covering 64 consecutive slots.
    Complex(usize),
    /// Runtime-supplied marker function.
    User(UserMarkFn),
    /// Reserved encoding. Never produced by this crate; scanning one is a
    /// fatal invariant violation.
    RunLen { offset: u32, count: u32 },
}

impl Descriptor {
    /// Descriptor for a range with no references at all.
    pub const EMPTY: Descriptor = Descriptor::Bitmap(0);

    /// Build an inline bitmap from word indexes.
    ///
    /// # Panics
    /// Panics if an index is 64 or larger.
    pub fn bitmap_from_slots(slots: &[usize]) -> Descriptor {
        let mut bits = 0u64;
        for &slot in slots {
            assert!(slot < 64, "inline bitmaps cover at most 64 words");
            bits |= 1 << slot;
        }
        Descriptor::Bitmap(bits)
    }

    /// Whether scanning this descriptor can ever yield a slot.
    pub fn has_references(&self) -> bool {
        !matches!(self, Descriptor::Bitmap(0))
    }

    /// Invoke `f` with a pointer to every reference slot of
    /// `[start, end)` as selected by this descriptor.
    ///
    /// # Safety
    /// `[start, end)` must be a valid, word-aligned memory range matching
    /// the layout this descriptor was built for. A `Complex` descriptor's
    /// bitmap block must still be live.
    pub unsafe fn for_each_ref_slot(&self, start: usize, end: usize, f: &mut dyn FnMut(*mut usize)) {
        let n_words = (end - start) / WORD_SIZE;
        match *self {
            Descriptor::Bitmap(bits) => {
                let mut rest = bits;
                while rest != 0 {
                    let idx = rest.trailing_zeros() as usize;
                    rest &= rest - 1;
                    if idx < n_words {
                        f((start + idx * WORD_SIZE) as *mut usize);
                    }
                }
            }
            Descriptor::Complex(block) => {
                let block = block as *const usize;
                let len = *block;
                for word_idx in 0..len {
                    let mut bits = *block.add(1 + word_idx);
                    while bits != 0 {
                        let bit = bits.trailing_zeros() as usize;
                        bits &= bits - 1;
                        let idx = word_idx * usize::BITS as usize + bit;
                        if idx < n_words {
                            f((start + idx * WORD_SIZE) as *mut usize);
                        }
                    }
                }
            }
            Descriptor::User(func) => {
                func(start, end, f);
            }
            Descriptor::RunLen { .. } => {
                panic!(
                    "reserved run-length descriptor reached the scanner \
                     (range {:#x}-{:#x}); this is a collector or runtime bug",
                    start, end
                );
            }
        }
    }
}

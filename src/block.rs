use std::{fmt, mem};

/// Alignment every block size and payload address respects.
pub const DOUBLE_WORD: usize = 8;

/// Width of a block header, one tag word.
pub const HEADER_SIZE: usize = mem::size_of::<u32>();

/// Width of the footer a free block carries at its last word.
pub const FOOTER_SIZE: usize = mem::size_of::<u32>();

/// Smallest block able to carry both a header and a footer once freed.
pub const MIN_BLOCK_SIZE: usize = HEADER_SIZE + FOOTER_SIZE;

const ALLOCATED: u32 = 0b01;
const PREV_ALLOCATED: u32 = 0b10;
const STATUS_MASK: u32 = ALLOCATED | PREV_ALLOCATED;

/// Largest block size a tag word can express.
pub const MAX_BLOCK_SIZE: usize = (u32::MAX & !(DOUBLE_WORD as u32 - 1)) as usize;

/// The packed word found at the start of every block (and at the end of
/// free blocks).
///
/// ```text
///   31                                   3   2   1   0
///   ┌─────────────────────────────────────┬───┬───┬───┐
///   │           size (multiple of 8)      │ 0 │ P │ A │
///   └─────────────────────────────────────┴───┴───┴───┘
///                                               │   └── this block is allocated
///                                               └────── previous block is allocated
/// ```
///
/// Sizes are always multiples of 8, so the low bits are free to carry the
/// status flags. A footer is the same word with both flags cleared.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BlockTag(u32);

impl BlockTag {
  /// The zero-size, permanently allocated sentinel terminating the chain.
  pub const END: BlockTag = BlockTag(ALLOCATED);

  /// Builds a header tag.
  ///
  /// # Panics
  ///
  /// Panics if `size` is not a multiple of 8 in `MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE`.
  /// Sizes reaching this point come from `align!`, so a failure here is a
  /// bug in the heap itself.
  pub fn new(
    size: usize,
    allocated: bool,
    prev_allocated: bool,
  ) -> Self {
    assert!(
      size >= MIN_BLOCK_SIZE && size <= MAX_BLOCK_SIZE && size % DOUBLE_WORD == 0,
      "invalid block size {size}"
    );

    let mut word = size as u32;
    if allocated {
      word |= ALLOCATED;
    }
    if prev_allocated {
      word |= PREV_ALLOCATED;
    }

    Self(word)
  }

  /// Builds the footer word of a free block of `size` bytes.
  pub fn footer(size: usize) -> Self {
    Self::new(size, false, false)
  }

  pub const fn from_raw(word: u32) -> Self {
    Self(word)
  }

  pub const fn raw(self) -> u32 {
    self.0
  }

  /// Total bytes of the block, header (and footer) included.
  pub const fn size(self) -> usize {
    (self.0 & !STATUS_MASK) as usize
  }

  pub const fn is_allocated(self) -> bool {
    self.0 & ALLOCATED != 0
  }

  pub const fn prev_allocated(self) -> bool {
    self.0 & PREV_ALLOCATED != 0
  }

  /// Whether this is the end marker. The predecessor flag is ignored since
  /// the marker tracks its neighbour like any other block.
  pub const fn is_end(self) -> bool {
    self.size() == 0 && self.is_allocated()
  }

  pub const fn decode(self) -> (usize, bool, bool) {
    (self.size(), self.is_allocated(), self.prev_allocated())
  }

  /// Same tag with the predecessor flag replaced.
  pub const fn with_prev_allocated(
    self,
    prev_allocated: bool,
  ) -> Self {
    if prev_allocated {
      Self(self.0 | PREV_ALLOCATED)
    } else {
      Self(self.0 & !PREV_ALLOCATED)
    }
  }

  /// Same tag with the allocation flag replaced. Never valid on the end
  /// marker, which must stay allocated.
  pub fn with_allocated(
    self,
    allocated: bool,
  ) -> Self {
    debug_assert!(!self.is_end(), "end marker cannot change state");

    if allocated {
      Self(self.0 | ALLOCATED)
    } else {
      Self(self.0 & !ALLOCATED)
    }
  }
}

impl fmt::Debug for BlockTag {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    if self.is_end() {
      return f.debug_tuple("End").field(&self.prev_allocated()).finish();
    }

    f.debug_struct("BlockTag")
      .field("size", &self.size())
      .field("allocated", &self.is_allocated())
      .field("prev_allocated", &self.prev_allocated())
      .finish()
  }
}

/// Location of the header owning the payload at `payload`.
pub const fn header_of(payload: usize) -> usize {
  payload - HEADER_SIZE
}

/// Location of the payload following the header at `header`.
pub const fn payload_of(header: usize) -> usize {
  header + HEADER_SIZE
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_busy_block_words() {
    // 20 bytes of payload plus the header rounds to 24.
    assert_eq!(BlockTag::new(24, true, true).raw(), 27);
    assert_eq!(BlockTag::new(24, true, false).raw(), 25);
  }

  #[test]
  fn test_free_block_words() {
    assert_eq!(BlockTag::new(24, false, true).raw(), 26);
    assert_eq!(BlockTag::new(24, false, false).raw(), 24);
    assert_eq!(BlockTag::footer(24).raw(), 24);
  }

  #[test]
  fn test_decode() {
    for &(size, allocated, prev) in &[
      (8, false, false),
      (16, true, false),
      (4096, false, true),
      (MAX_BLOCK_SIZE, true, true),
    ] {
      let tag = BlockTag::new(size, allocated, prev);
      assert_eq!(tag.decode(), (size, allocated, prev));
      assert_eq!(BlockTag::from_raw(tag.raw()), tag);
    }
  }

  #[test]
  fn test_status_bits_never_leak_into_size() {
    let tag = BlockTag::from_raw(40 | 0b11);
    assert_eq!(tag.size(), 40);

    let flipped = tag.with_allocated(false).with_prev_allocated(false);
    assert_eq!(flipped.size(), 40);
    assert_eq!(flipped.raw(), 40);
  }

  #[test]
  fn test_end_marker() {
    assert!(BlockTag::END.is_end());
    assert!(BlockTag::END.with_prev_allocated(true).is_end());
    assert!(!BlockTag::END.with_prev_allocated(true).with_prev_allocated(false).prev_allocated());
    assert!(!BlockTag::new(8, true, true).is_end());
    assert!(!BlockTag::from_raw(0).is_end());
  }

  #[test]
  #[should_panic(expected = "invalid block size")]
  fn test_rejects_unaligned_size() {
    BlockTag::new(20, true, true);
  }

  #[test]
  #[should_panic(expected = "invalid block size")]
  fn test_rejects_empty_size() {
    BlockTag::new(0, true, false);
  }

  #[test]
  fn test_header_payload_mapping() {
    assert_eq!(payload_of(4), 8);
    assert_eq!(header_of(8), 4);
    assert_eq!(header_of(payload_of(0x1004)), 0x1004);
  }
}

use std::ptr::{self, NonNull};

use libc::{MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE, _SC_PAGESIZE, mmap, sysconf};

use crate::block::{BlockTag, DOUBLE_WORD, HEADER_SIZE};

const FALLBACK_PAGE_SIZE: usize = 4096;

/// Where a heap gets its backing memory from.
///
/// # Safety
///
/// A successful [`map`](RegionSource::map) must return a pointer to `len`
/// zero-filled, readable and writable bytes, aligned to at least 8, that
/// nothing else touches for as long as the heap lives. [`page_size`]
/// must return a non-zero power of two.
///
/// [`page_size`]: RegionSource::page_size
pub unsafe trait RegionSource {
  fn page_size(&self) -> usize;

  fn map(
    &mut self,
    len: usize,
  ) -> Option<NonNull<u8>>;
}

/// Private anonymous mappings obtained through `mmap(2)`.
///
/// The mapping is never returned to the OS: a heap keeps its region until the
/// process exits.
#[derive(Debug, Default, Clone, Copy)]
pub struct Mmap;

unsafe impl RegionSource for Mmap {
  fn page_size(&self) -> usize {
    let size = unsafe { sysconf(_SC_PAGESIZE) };

    if size > 0 && (size as usize).is_power_of_two() {
      size as usize
    } else {
      FALLBACK_PAGE_SIZE
    }
  }

  fn map(
    &mut self,
    len: usize,
  ) -> Option<NonNull<u8>> {
    let address = unsafe {
      mmap(
        ptr::null_mut(),
        len,
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_ANONYMOUS,
        -1,
        0,
      )
    };

    if address == MAP_FAILED {
      return None;
    }

    NonNull::new(address as *mut u8)
  }
}

/// The mapped memory a heap carves its blocks from, addressed by offset.
///
/// ```text
///   offset 0     4                                        len - 4   len
///   ┌───────────┬──────────────────────────────────────────┬─────────┐
///   │  padding  │  block │ block │ ...              │ block │   END   │
///   └───────────┴──────────────────────────────────────────┴─────────┘
///               ▲
///               first header: payloads start on multiples of 8
/// ```
pub(crate) struct Region {
  base: NonNull<u8>,
  len: usize,
}

impl Region {
  /// Offset of the first block header.
  pub const FIRST_BLOCK: usize = DOUBLE_WORD - HEADER_SIZE;

  /// Bytes not covered by any block: the leading padding and the end marker.
  pub const RESERVED: usize = Self::FIRST_BLOCK + HEADER_SIZE;

  pub fn new(
    base: NonNull<u8>,
    len: usize,
  ) -> Self {
    debug_assert!(base.as_ptr() as usize % DOUBLE_WORD == 0);
    debug_assert!(len % DOUBLE_WORD == 0 && len > Self::RESERVED);

    Self { base, len }
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn base_addr(&self) -> usize {
    self.base.as_ptr() as usize
  }

  /// Offset of the end marker.
  pub fn end(&self) -> usize {
    self.len - HEADER_SIZE
  }

  /// Pointer to the byte at `offset`.
  pub fn ptr_at(
    &self,
    offset: usize,
  ) -> NonNull<u8> {
    debug_assert!(offset < self.len);
    unsafe { self.base.add(offset) }
  }

  pub fn read(
    &self,
    offset: usize,
  ) -> BlockTag {
    assert!(offset % HEADER_SIZE == 0 && offset + HEADER_SIZE <= self.len, "tag offset {offset:#x} out of range");
    let word = unsafe { self.base.add(offset).cast::<u32>().read() };
    BlockTag::from_raw(word)
  }

  pub fn write(
    &mut self,
    offset: usize,
    tag: BlockTag,
  ) {
    assert!(offset % HEADER_SIZE == 0 && offset + HEADER_SIZE <= self.len, "tag offset {offset:#x} out of range");
    unsafe { self.base.add(offset).cast::<u32>().write(tag.raw()) }
  }

  pub fn blocks(&self) -> Blocks<'_> {
    Blocks {
      region: self,
      next: Self::FIRST_BLOCK,
      done: false,
      corrupt_at: None,
    }
  }
}

/// Walks the block chain in address order, yielding `(offset, tag)` for
/// every block before the end marker.
///
/// The walk ends early, without reading outside the region, on a tag that
/// cannot describe a block: a zero size, or a size running past the end
/// marker. [`corrupt_at`](Blocks::corrupt_at) then reports where.
pub struct Blocks<'a> {
  region: &'a Region,
  next: usize,
  done: bool,
  corrupt_at: Option<usize>,
}

impl Blocks<'_> {
  /// Offset of the tag that stopped the walk, if it did not end on the
  /// end marker.
  pub fn corrupt_at(&self) -> Option<usize> {
    self.corrupt_at
  }

  fn stop(
    &mut self,
    corrupt_at: Option<usize>,
  ) -> Option<(usize, BlockTag)> {
    self.done = true;
    self.corrupt_at = corrupt_at;
    None
  }
}

impl Iterator for Blocks<'_> {
  type Item = (usize, BlockTag);

  fn next(&mut self) -> Option<Self::Item> {
    if self.done {
      return None;
    }

    let offset = self.next;
    let end = self.region.end();
    let tag = self.region.read(offset);

    if tag.is_end() {
      return self.stop((offset != end).then_some(offset));
    }

    if tag.size() == 0 || tag.size() > end - offset {
      return self.stop(Some(offset));
    }

    self.next = offset + tag.size();
    Some((offset, tag))
  }
}

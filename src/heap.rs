use std::ptr::NonNull;

use log::{debug, error, trace};

use crate::{
  align, align_to,
  block::{BlockTag, DOUBLE_WORD, FOOTER_SIZE, HEADER_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, header_of, payload_of},
  error::{HeapError, Result},
  region::{Blocks, Mmap, Region, RegionSource},
};

/// A best-fit heap managing one fixed region with boundary tags.
///
/// The handle starts empty; [`initialize`](Heap::initialize) maps the region
/// once, after which [`allocate`](Heap::allocate) and [`free`](Heap::free)
/// split and merge blocks inside it. No separate free list exists: the
/// chain of headers is walked on every allocation.
///
/// A `Heap` is neither `Send` nor `Sync`; callers sharing one across threads
/// must wrap it in their own lock.
pub struct Heap<S: RegionSource = Mmap> {
  source: S,
  region: Option<Region>,
}

impl Heap<Mmap> {
  pub fn new() -> Self {
    Self::with_source(Mmap)
  }
}

impl Default for Heap<Mmap> {
  fn default() -> Self {
    Self::new()
  }
}

impl<S: RegionSource> Heap<S> {
  /// Creates an uninitialized heap whose region will come from `source`.
  pub fn with_source(source: S) -> Self {
    Self { source, region: None }
  }

  pub fn is_initialized(&self) -> bool {
    self.region.is_some()
  }

  /// Length of the mapped region after page rounding, 0 before
  /// initialization.
  pub fn region_len(&self) -> usize {
    self.region.as_ref().map_or(0, Region::len)
  }

  /// Bytes covered by blocks, i.e. the region minus padding and end marker.
  pub fn capacity(&self) -> usize {
    self.region.as_ref().map_or(0, |region| region.len() - Region::RESERVED)
  }

  /// Start of the mapped region.
  pub fn base(&self) -> Option<NonNull<u8>> {
    self.region.as_ref().map(|region| region.ptr_at(0))
  }

  /// Walks the block chain, yielding `(offset, tag)` pairs with offsets
  /// relative to [`base`](Heap::base).
  pub fn blocks(&self) -> Option<Blocks<'_>> {
    self.region.as_ref().map(Region::blocks)
  }

  pub(crate) fn region(&self) -> Option<&Region> {
    self.region.as_ref()
  }

  /// Maps a region of at least `requested` bytes and installs a single free
  /// block spanning it.
  ///
  /// ```text
  ///   ┌─────┬────────┬──────────────────────────────────┬────────┬─────┐
  ///   │ pad │ header │            free space            │ footer │ END │
  ///   └─────┴────────┴──────────────────────────────────┴────────┴─────┘
  ///          size = len - 8, free, previous busy                  size 0, busy
  /// ```
  ///
  /// A handle initializes once; later calls fail with
  /// [`HeapError::AlreadyInitialized`].
  pub fn initialize(
    &mut self,
    requested: usize,
  ) -> Result<()> {
    if self.region.is_some() {
      error!("heap has allocated space during a previous call");
      return Err(HeapError::AlreadyInitialized);
    }

    if requested == 0 {
      error!("requested region size is not positive");
      return Err(HeapError::InvalidSize);
    }

    let page = self.source.page_size();
    let len = match requested.checked_add(page - 1) {
      Some(_) => align_to!(requested, page),
      None => {
        error!("requested region size {requested} overflows page rounding");
        return Err(HeapError::InvalidSize);
      },
    };

    if len < Region::RESERVED + MIN_BLOCK_SIZE || len - Region::RESERVED > MAX_BLOCK_SIZE {
      error!("region of {len} bytes cannot be described by block tags");
      return Err(HeapError::InvalidSize);
    }

    let Some(base) = self.source.map(len) else {
      error!("cannot map a region of {len} bytes");
      return Err(HeapError::RegionUnavailable { len });
    };

    let mut region = Region::new(base, len);
    let size = len - Region::RESERVED;

    region.write(Region::FIRST_BLOCK, BlockTag::new(size, false, true));
    region.write(Region::FIRST_BLOCK + size - FOOTER_SIZE, BlockTag::footer(size));
    region.write(region.end(), BlockTag::END);

    debug!(
      "initialized heap: {} bytes requested, {} mapped at {:?}, {} free",
      requested, len, base, size
    );

    self.region = Some(region);
    Ok(())
  }

  /// Returns a pointer to at least `requested` usable bytes, aligned to 8.
  ///
  /// `None` means no allocation was made: the request is empty, the heap
  /// is not initialized, or no free block is large enough. In every case
  /// the chain is left untouched.
  pub fn allocate(
    &mut self,
    requested: usize,
  ) -> Option<NonNull<u8>> {
    if requested == 0 {
      return None;
    }

    let region = self.region.as_mut()?;

    let needed = requested
      .checked_add(HEADER_SIZE)
      .filter(|&size| size <= MAX_BLOCK_SIZE)
      .map(|size| align!(size))?;

    let Some((offset, tag)) = best_fit(region, needed) else {
      debug!("no free block fits {needed} bytes ({requested} requested)");
      return None;
    };

    let remainder = tag.size() - needed;

    if remainder < MIN_BLOCK_SIZE {
      // Too small to stand alone: hand out the whole block.
      region.write(offset, tag.with_allocated(true));

      let next = offset + tag.size();
      let next_tag = region.read(next);
      region.write(next, next_tag.with_prev_allocated(true));

      debug!("allocated whole block of {} bytes at {offset:#x}", tag.size());
    } else {
      //   before: │ free (size)                          │
      //   after:  │ busy (needed) │ free (size - needed) │
      let rest = offset + needed;

      region.write(offset, BlockTag::new(needed, true, tag.prev_allocated()));
      region.write(rest, BlockTag::new(remainder, false, true));
      region.write(rest + remainder - FOOTER_SIZE, BlockTag::footer(remainder));

      debug!(
        "split block of {} bytes at {offset:#x}: {needed} allocated, {remainder} left free at {rest:#x}",
        tag.size()
      );
    }

    Some(region.ptr_at(payload_of(offset)))
  }

  /// Releases the block whose payload starts at `ptr`, merging it with any
  /// free neighbour.
  ///
  /// Pointers that cannot belong to a live block are rejected, never
  /// ignored. On error the chain is left untouched.
  pub fn free(
    &mut self,
    ptr: *mut u8,
  ) -> Result<()> {
    if ptr.is_null() {
      return Err(HeapError::NullPointer);
    }

    let region = self.region.as_mut().ok_or(HeapError::Uninitialized)?;

    let addr = ptr as usize;
    let base = region.base_addr();

    if addr.wrapping_sub(base) % DOUBLE_WORD != 0 {
      return Err(HeapError::Misaligned { addr });
    }

    if addr < base + payload_of(Region::FIRST_BLOCK) || addr >= base + region.end() {
      return Err(HeapError::OutOfBounds { addr });
    }

    let header = header_of(addr - base);
    let tag = region.read(header);

    if !tag.is_allocated() {
      return Err(HeapError::DoubleFree { addr });
    }

    if !fits(tag.size(), region.end() - header) {
      return Err(HeapError::Corrupted {
        offset: header,
        reason: "block overruns the end marker",
      });
    }

    let (start, size, prev_allocated) = coalesced_span(region, header, tag)?;

    // Absorbed headers stay behind; marking this one free lets a repeated
    // free of the same pointer be caught after a backward merge.
    region.write(header, tag.with_allocated(false));
    region.write(start, BlockTag::new(size, false, prev_allocated));
    region.write(start + size - FOOTER_SIZE, BlockTag::footer(size));

    let next = start + size;
    let next_tag = region.read(next);
    region.write(next, next_tag.with_prev_allocated(false));

    debug!(
      "freed {} bytes at {header:#x}, now free block of {size} bytes at {start:#x}",
      tag.size()
    );

    Ok(())
  }
}

/// Whether a tag read back from memory describes a block within `room` bytes.
fn fits(
  size: usize,
  room: usize,
) -> bool {
  size >= MIN_BLOCK_SIZE && size % DOUBLE_WORD == 0 && size <= room
}

/// Smallest free block of at least `needed` bytes, earliest one on ties.
fn best_fit(
  region: &Region,
  needed: usize,
) -> Option<(usize, BlockTag)> {
  let mut best: Option<(usize, BlockTag)> = None;

  for (offset, tag) in region.blocks() {
    if tag.is_allocated() || tag.size() < needed {
      continue;
    }

    trace!("candidate of {} bytes at {offset:#x}", tag.size());

    if tag.size() == needed {
      return Some((offset, tag));
    }

    if best.is_none_or(|(_, current)| tag.size() < current.size()) {
      best = Some((offset, tag));
    }
  }

  best
}

/// Span `(start, size, prev_allocated)` of the free block that results from
/// releasing the block at `header`, absorbing free neighbours on both sides.
///
/// ```text
///   │ prev (free) │ block │ next (free) │  ──►  │ one free block          │
/// ```
fn coalesced_span(
  region: &Region,
  header: usize,
  tag: BlockTag,
) -> Result<(usize, usize, bool)> {
  let mut start = header;
  let mut size = tag.size();
  let mut prev_allocated = tag.prev_allocated();

  let next = header + size;
  let next_tag = region.read(next);

  if !next_tag.is_allocated() {
    if !fits(next_tag.size(), region.end() - next) {
      return Err(HeapError::Corrupted {
        offset: next,
        reason: "following free block overruns the end marker",
      });
    }

    trace!("merging with following free block of {} bytes at {next:#x}", next_tag.size());
    size += next_tag.size();
  }

  if !prev_allocated {
    let prev_size = region.read(header - FOOTER_SIZE).size();

    if !fits(prev_size, header - Region::FIRST_BLOCK) {
      return Err(HeapError::Corrupted {
        offset: header - FOOTER_SIZE,
        reason: "preceding footer points outside the region",
      });
    }

    start -= prev_size;
    size += prev_size;
    prev_allocated = region.read(start).prev_allocated();

    trace!("merging with preceding free block of {prev_size} bytes at {start:#x}");
  }

  Ok((start, size, prev_allocated))
}

#[cfg(test)]
mod tests {
  use super::*;

  /// Leaked, zero-filled memory with a configurable page size.
  struct TestSource {
    page: usize,
    fail: bool,
  }

  impl TestSource {
    fn pages(page: usize) -> Self {
      Self { page, fail: false }
    }
  }

  unsafe impl RegionSource for TestSource {
    fn page_size(&self) -> usize {
      self.page
    }

    fn map(
      &mut self,
      len: usize,
    ) -> Option<NonNull<u8>> {
      if self.fail {
        return None;
      }

      let words = vec![0u64; len / 8].into_boxed_slice();
      NonNull::new(Box::leak(words).as_mut_ptr().cast())
    }
  }

  fn heap(len: usize) -> Heap<TestSource> {
    let mut heap = Heap::with_source(TestSource::pages(len));
    heap.initialize(len).unwrap();
    heap
  }

  /// `(size, allocated)` for every block in address order.
  fn layout<S: RegionSource>(heap: &Heap<S>) -> Vec<(usize, bool)> {
    heap.blocks().unwrap().map(|(_, tag)| (tag.size(), tag.is_allocated())).collect()
  }

  fn offset_of<S: RegionSource>(
    heap: &Heap<S>,
    ptr: NonNull<u8>,
  ) -> usize {
    ptr.as_ptr() as usize - heap.base().unwrap().as_ptr() as usize
  }

  #[test]
  fn test_initialize_installs_single_free_block() {
    let heap = heap(4096);

    assert_eq!(heap.region_len(), 4096);
    assert_eq!(heap.capacity(), 4088);

    let blocks: Vec<_> = heap.blocks().unwrap().collect();
    assert_eq!(blocks, vec![(Region::FIRST_BLOCK, BlockTag::new(4088, false, true))]);

    let region = heap.region().unwrap();
    assert_eq!(region.read(4092 - FOOTER_SIZE), BlockTag::footer(4088));
    assert_eq!(region.read(region.end()), BlockTag::END);
  }

  #[test]
  fn test_initialize_rounds_to_page() {
    let mut heap = Heap::with_source(TestSource::pages(1024));
    heap.initialize(1500).unwrap();
    assert_eq!(heap.region_len(), 2048);
  }

  #[test]
  fn test_initialize_rejects_zero() {
    let mut heap = Heap::with_source(TestSource::pages(4096));
    assert_eq!(heap.initialize(0), Err(HeapError::InvalidSize));
    assert!(!heap.is_initialized());
  }

  #[test]
  fn test_initialize_rejects_oversized() {
    let mut heap = Heap::with_source(TestSource::pages(4096));
    assert_eq!(heap.initialize(usize::MAX), Err(HeapError::InvalidSize));
  }

  #[test]
  fn test_initialize_twice_fails() {
    let mut heap = heap(4096);
    assert_eq!(heap.initialize(4096), Err(HeapError::AlreadyInitialized));
    assert_eq!(heap.region_len(), 4096);
  }

  #[test]
  fn test_initialize_surfaces_mapping_failure() {
    let mut heap = Heap::with_source(TestSource { page: 4096, fail: true });
    assert_eq!(heap.initialize(10), Err(HeapError::RegionUnavailable { len: 4096 }));
    assert!(!heap.is_initialized());
  }

  #[test]
  fn test_allocate_before_initialize() {
    let mut heap = Heap::with_source(TestSource::pages(4096));
    assert!(heap.allocate(8).is_none());
    assert_eq!(heap.free(8 as *mut u8), Err(HeapError::Uninitialized));
  }

  #[test]
  fn test_allocate_zero_is_noop() {
    let mut heap = heap(4096);
    assert!(heap.allocate(0).is_none());
    assert_eq!(layout(&heap), vec![(4088, false)]);
  }

  #[test_log::test]
  fn test_allocate_splits() {
    let mut heap = heap(4096);

    let ptr = heap.allocate(20).unwrap();

    assert_eq!(offset_of(&heap, ptr), 8);
    assert_eq!(layout(&heap), vec![(24, true), (4064, false)]);

    let blocks: Vec<_> = heap.blocks().unwrap().collect();
    assert!(blocks[0].1.prev_allocated());
    assert!(blocks[1].1.prev_allocated());
    heap.check().unwrap();
  }

  #[test]
  fn test_allocate_from_64_byte_block() {
    let mut heap = heap(4096);

    let a = heap.allocate(60).unwrap();
    let _guard = heap.allocate(4).unwrap();
    heap.free(a.as_ptr()).unwrap();
    assert_eq!(layout(&heap), vec![(64, false), (8, true), (4016, false)]);

    let b = heap.allocate(16).unwrap();

    assert_eq!(b, a);
    assert_eq!(layout(&heap), vec![(24, true), (40, false), (8, true), (4016, false)]);
    heap.check().unwrap();
  }

  #[test]
  fn test_allocate_exact_fit_takes_whole_block() {
    let mut heap = heap(4096);

    let a = heap.allocate(20).unwrap();
    let _guard = heap.allocate(4).unwrap();
    heap.free(a.as_ptr()).unwrap();

    let blocks: Vec<_> = heap.blocks().unwrap().collect();
    assert!(!blocks[1].1.prev_allocated());

    // 17 + 4 rounds to 24, the size of the hole.
    assert_eq!(heap.allocate(17), Some(a));
    assert_eq!(layout(&heap), vec![(24, true), (8, true), (4056, false)]);

    let blocks: Vec<_> = heap.blocks().unwrap().collect();
    assert!(blocks[1].1.prev_allocated());
    heap.check().unwrap();
  }

  #[test]
  fn test_best_fit_prefers_smallest() {
    let mut heap = heap(4096);

    let a = heap.allocate(28).unwrap(); // 32
    let _g1 = heap.allocate(4).unwrap();
    let b = heap.allocate(60).unwrap(); // 64
    let _g2 = heap.allocate(4).unwrap();
    let c = heap.allocate(36).unwrap(); // 40
    let _g3 = heap.allocate(4).unwrap();

    for ptr in [a, b, c] {
      heap.free(ptr.as_ptr()).unwrap();
    }

    assert_eq!(heap.allocate(36), Some(c));
    assert_eq!(heap.allocate(28), Some(a));
    assert_eq!(heap.allocate(60), Some(b));
    heap.check().unwrap();
  }

  #[test]
  fn test_best_fit_breaks_ties_by_address() {
    let mut heap = heap(4096);

    let a = heap.allocate(36).unwrap();
    let _g1 = heap.allocate(4).unwrap();
    let b = heap.allocate(36).unwrap();
    let _g2 = heap.allocate(4).unwrap();

    heap.free(b.as_ptr()).unwrap();
    heap.free(a.as_ptr()).unwrap();

    // Both holes are 40 bytes and larger than needed: the first one wins.
    assert_eq!(heap.allocate(20), Some(a));
  }

  #[test]
  fn test_exhaustion_leaves_chain_untouched() {
    let mut heap = heap(128);
    let _a = heap.allocate(12).unwrap();

    let before: Vec<_> = heap.blocks().unwrap().collect();
    assert_eq!(layout(&heap), vec![(16, true), (104, false)]);

    assert!(heap.allocate(200).is_none());
    assert!(heap.allocate(101).is_none());
    assert!(heap.allocate(usize::MAX).is_none());

    let after: Vec<_> = heap.blocks().unwrap().collect();
    assert_eq!(before, after);

    // 100 + 4 fits exactly.
    assert!(heap.allocate(100).is_some());
    assert_eq!(layout(&heap), vec![(16, true), (104, true)]);
    heap.check().unwrap();
  }

  #[test]
  fn test_allocated_payloads_are_aligned_and_disjoint() {
    let mut heap = heap(4096);
    let mut spans = Vec::new();

    for requested in [1, 7, 8, 9, 15, 16, 33, 100, 3] {
      let ptr = heap.allocate(requested).unwrap();
      let offset = offset_of(&heap, ptr);

      assert_eq!(offset % 8, 0);
      unsafe { ptr.as_ptr().write_bytes(0xAB, requested) };
      spans.push((offset, offset + requested));
    }

    spans.sort();
    for pair in spans.windows(2) {
      assert!(pair[0].1 <= pair[1].0);
    }
    heap.check().unwrap();
  }

  #[test]
  fn test_free_rejects_null() {
    let mut heap = heap(4096);
    assert_eq!(heap.free(std::ptr::null_mut()), Err(HeapError::NullPointer));
  }

  #[test]
  fn test_free_rejects_misaligned() {
    let mut heap = heap(4096);
    let ptr = heap.allocate(16).unwrap();
    let inner = unsafe { ptr.as_ptr().add(4) };

    assert_eq!(heap.free(inner), Err(HeapError::Misaligned { addr: inner as usize }));
    assert_eq!(layout(&heap), vec![(24, true), (4064, false)]);
  }

  #[test]
  fn test_free_rejects_out_of_bounds() {
    let mut heap = heap(4096);
    let base = heap.base().unwrap().as_ptr();

    assert!(matches!(heap.free(base), Err(HeapError::OutOfBounds { .. })));
    assert!(matches!(heap.free(base.wrapping_add(4096)), Err(HeapError::OutOfBounds { .. })));
  }

  #[test]
  fn test_double_free() {
    let mut heap = heap(4096);
    let a = heap.allocate(20).unwrap();
    let _b = heap.allocate(20).unwrap();

    heap.free(a.as_ptr()).unwrap();
    let after_first = layout(&heap);

    assert_eq!(
      heap.free(a.as_ptr()),
      Err(HeapError::DoubleFree { addr: a.as_ptr() as usize })
    );
    assert_eq!(layout(&heap), after_first);
    heap.check().unwrap();
  }

  #[test]
  fn test_free_merges_with_following() {
    let mut heap = heap(4096);
    let a = heap.allocate(20).unwrap();
    let b = heap.allocate(20).unwrap();

    heap.free(b.as_ptr()).unwrap();
    assert_eq!(layout(&heap), vec![(24, true), (4064, false)]);

    heap.free(a.as_ptr()).unwrap();
    assert_eq!(layout(&heap), vec![(4088, false)]);
    heap.check().unwrap();
  }

  #[test]
  fn test_free_merges_with_preceding() {
    let mut heap = heap(4096);
    let a = heap.allocate(20).unwrap();
    let b = heap.allocate(20).unwrap();
    let _c = heap.allocate(20).unwrap();

    heap.free(a.as_ptr()).unwrap();
    assert_eq!(layout(&heap), vec![(24, false), (24, true), (24, true), (4016, false)]);

    let blocks: Vec<_> = heap.blocks().unwrap().collect();
    assert!(!blocks[1].1.prev_allocated());

    heap.free(b.as_ptr()).unwrap();
    assert_eq!(layout(&heap), vec![(48, false), (24, true), (4016, false)]);

    let blocks: Vec<_> = heap.blocks().unwrap().collect();
    assert!(blocks[0].1.prev_allocated());
    assert!(!blocks[1].1.prev_allocated());
    heap.check().unwrap();
  }

  #[test]
  fn test_free_merges_both_sides() {
    let mut heap = heap(4096);
    let a = heap.allocate(20).unwrap();
    let b = heap.allocate(20).unwrap();
    let c = heap.allocate(20).unwrap();
    let _d = heap.allocate(20).unwrap();

    heap.free(a.as_ptr()).unwrap();
    heap.free(c.as_ptr()).unwrap();
    assert_eq!(layout(&heap), vec![(24, false), (24, true), (24, false), (24, true), (3992, false)]);

    heap.free(b.as_ptr()).unwrap();
    assert_eq!(layout(&heap), vec![(72, false), (24, true), (3992, false)]);

    let region = heap.region().unwrap();
    assert_eq!(region.read(Region::FIRST_BLOCK + 72 - FOOTER_SIZE), BlockTag::footer(72));
    heap.check().unwrap();
  }

  #[test]
  fn test_free_last_block_updates_end_marker() {
    let mut heap = heap(128);
    let a = heap.allocate(116).unwrap();

    let region = heap.region().unwrap();
    assert!(region.read(region.end()).prev_allocated());

    heap.free(a.as_ptr()).unwrap();

    let region = heap.region().unwrap();
    assert!(!region.read(region.end()).prev_allocated());
    assert_eq!(layout(&heap), vec![(120, false)]);
    heap.check().unwrap();
  }

  #[test]
  fn test_free_rejects_corrupted_header() {
    let mut heap = heap(4096);
    let a = heap.allocate(20).unwrap();

    // Overwrite the header with a size running past the region.
    unsafe { a.as_ptr().sub(HEADER_SIZE).cast::<u32>().write(8192 | 0b11) };

    assert!(matches!(heap.free(a.as_ptr()), Err(HeapError::Corrupted { .. })));
  }
}

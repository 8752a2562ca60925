use std::fmt;

use crate::{
  block::{DOUBLE_WORD, FOOTER_SIZE, MIN_BLOCK_SIZE, payload_of},
  error::{HeapError, Result},
  heap::Heap,
  region::{Region, RegionSource},
};

const STARS: &str = "*********************************************************************************";
const DASHES: &str = "---------------------------------------------------------------------------------";

/// One row of a [`Report`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
  /// Position in the chain, starting at 1.
  pub index: usize,
  pub allocated: bool,
  pub prev_allocated: bool,
  /// Offset of the header from the region base.
  pub offset: usize,
  /// Address of the first byte of the block (its header).
  pub start: usize,
  /// Address of the last byte of the block.
  pub end: usize,
  /// Block size, header and footer included.
  pub size: usize,
}

/// Snapshot of the block chain produced by [`Heap::dump`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
  pub blocks: Vec<BlockInfo>,
  pub busy: usize,
  pub free: usize,
  /// Offset of a tag that stopped the walk before the end marker.
  pub truncated_at: Option<usize>,
}

impl Report {
  pub fn total(&self) -> usize {
    self.busy + self.free
  }
}

fn status(busy: bool) -> &'static str {
  if busy { "Busy" } else { "Free" }
}

impl fmt::Display for Report {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    writeln!(f, "************************************Block list***********************************")?;
    writeln!(f, "No.\tStatus\tPrev\tt_Begin\t\tt_End\t\tt_Size")?;
    writeln!(f, "{DASHES}")?;

    for block in &self.blocks {
      writeln!(
        f,
        "{}\t{}\t{}\t{:#010x}\t{:#010x}\t{}",
        block.index,
        status(block.allocated),
        status(block.prev_allocated),
        block.start,
        block.end,
        block.size
      )?;
    }

    if let Some(offset) = self.truncated_at {
      writeln!(f, "!! chain stops at unreadable tag, offset {offset:#x}")?;
    }

    writeln!(f, "{DASHES}")?;
    writeln!(f, "{STARS}")?;
    writeln!(f, "Total busy size = {}", self.busy)?;
    writeln!(f, "Total free size = {}", self.free)?;
    writeln!(f, "Total size = {}", self.total())?;
    write!(f, "{STARS}")
  }
}

impl<S: RegionSource> Heap<S> {
  /// Walks the chain and reports every block. Never modifies the heap, and
  /// stops cleanly on a corrupted tag instead of running off the region.
  ///
  /// An uninitialized heap yields an empty report.
  pub fn dump(&self) -> Report {
    let Some(region) = self.region() else {
      return Report::default();
    };

    let base = region.base_addr();
    let mut report = Report::default();
    let mut blocks = region.blocks();

    for (index, (offset, tag)) in blocks.by_ref().enumerate() {
      let start = base + offset;

      if tag.is_allocated() {
        report.busy += tag.size();
      } else {
        report.free += tag.size();
      }

      report.blocks.push(BlockInfo {
        index: index + 1,
        allocated: tag.is_allocated(),
        prev_allocated: tag.prev_allocated(),
        offset,
        start,
        end: start + tag.size() - 1,
        size: tag.size(),
      });
    }

    report.truncated_at = blocks.corrupt_at();
    report
  }

  /// Verifies the structural invariants of the whole chain:
  ///
  /// - every block is at least 8 bytes, a multiple of 8, with an 8-aligned payload;
  /// - every free block's footer repeats its size;
  /// - every predecessor flag, the end marker's included, matches its neighbour;
  /// - no two free blocks are adjacent;
  /// - the blocks cover the region exactly up to the end marker.
  pub fn check(&self) -> Result<()> {
    let region = self.region().ok_or(HeapError::Uninitialized)?;

    let corrupted = |offset, reason| HeapError::Corrupted { offset, reason };

    let mut blocks = region.blocks();
    let mut prev_allocated = true;
    let mut covered = 0;

    for (offset, tag) in blocks.by_ref() {
      if tag.size() < MIN_BLOCK_SIZE || tag.size() % DOUBLE_WORD != 0 {
        return Err(corrupted(offset, "block size is not a multiple of 8"));
      }

      if payload_of(offset) % DOUBLE_WORD != 0 {
        return Err(corrupted(offset, "payload is not 8-byte aligned"));
      }

      if tag.prev_allocated() != prev_allocated {
        return Err(corrupted(offset, "predecessor flag is stale"));
      }

      if !tag.is_allocated() {
        if !prev_allocated {
          return Err(corrupted(offset, "adjacent free blocks"));
        }

        let footer = region.read(offset + tag.size() - FOOTER_SIZE);
        if footer.size() != tag.size() {
          return Err(corrupted(offset, "footer disagrees with header"));
        }
      }

      prev_allocated = tag.is_allocated();
      covered += tag.size();
    }

    if let Some(offset) = blocks.corrupt_at() {
      return Err(corrupted(offset, "tag does not describe a block"));
    }

    if region.read(region.end()).prev_allocated() != prev_allocated {
      return Err(corrupted(region.end(), "predecessor flag is stale"));
    }

    if covered + Region::RESERVED != region.len() {
      return Err(corrupted(region.end(), "blocks do not cover the region"));
    }

    Ok(())
  }
}

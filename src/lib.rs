//! # tagalloc - A Boundary-Tag Best-Fit Allocator
//!
//! This crate manages one fixed-size memory region, mapped once with
//! `mmap(2)`, and hands out pieces of it with a **best-fit** policy. Block
//! metadata lives inside the region itself as **boundary tags**: there is no
//! separate free list and no extra memory beyond one word per block (two for
//! free blocks).
//!
//! ## Overview
//!
//! ```text
//!   Managed Region:
//!
//!   ┌───┬──────────────┬────────────────────┬──────────┬──────────────────┬─────┐
//!   │pad│  A1 (busy)   │     free block     │ A2 (busy)│    free block    │ END │
//!   └───┴──────────────┴────────────────────┴──────────┴──────────────────┴─────┘
//!       ▲                                                                  ▲
//!       │                                                                  │
//!   first header                                                      end marker
//!   (offset 4)                                                   (size 0, busy)
//!
//!   Blocks tile the region in address order, with no gaps and no overlaps.
//!   Two free blocks are never adjacent: freeing merges them immediately.
//! ```
//!
//! ## Crate Structure
//!
//! ```text
//!   tagalloc
//!   ├── align      - Alignment macros (align!, align_to!)
//!   ├── block      - Tag word codec, header/payload mapping
//!   ├── region     - RegionSource trait, mmap backing, block chain walker
//!   ├── heap       - Heap: initialize, allocate, free
//!   ├── dump       - Block list report and consistency check
//!   └── error      - HeapError
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use tagalloc::Heap;
//!
//! let mut heap = Heap::new();
//! heap.initialize(4096).unwrap();
//!
//! let ptr = heap.allocate(20).unwrap();
//! unsafe { ptr.cast::<u64>().write(42) };
//!
//! heap.free(ptr.as_ptr()).unwrap();
//! println!("{}", heap.dump());
//! ```
//!
//! ## How It Works
//!
//! Each block starts with a 4-byte header. Free blocks repeat their size
//! in a footer, so the block after them can find their header:
//!
//! ```text
//!   Allocated block:                      Free block:
//!   ┌────────┬────────────────────────┐   ┌────────┬──────────────┬────────┐
//!   │ header │   payload (user data)  │   │ header │   unused     │ footer │
//!   └────────┴────────────────────────┘   └────────┴──────────────┴────────┘
//!            ▲                                                      size only
//!            └── pointer returned to user (8-byte aligned)
//! ```
//!
//! - **allocate** scans every block once, picks the smallest free block that
//!   fits, and splits off the unused tail as a new free block.
//! - **free** clears the busy bit, writes a footer, and merges with the
//!   following block (found through its own size) and the preceding block
//!   (found through that block's footer, when the header says it is free).
//!
//! ## Limitations
//!
//! - **Single-threaded only**: `Heap` is neither `Send` nor `Sync`
//! - **Fixed size**: the region never grows, and is never returned to the OS
//! - **Fixed alignment**: payloads are aligned to 8 bytes, no more
//! - **Unix-only**: the default backing uses `libc::mmap`
//!
//! ## Safety
//!
//! `allocate` and `free` are safe to call: `free` validates the pointer and
//! the tags it reads before touching anything. Reading or writing through a
//! returned pointer is up to the caller, and must stay within the requested
//! size and stop once the pointer is freed.

pub mod align;
mod block;
mod dump;
mod error;
mod heap;
mod region;

pub use block::{BlockTag, DOUBLE_WORD, FOOTER_SIZE, HEADER_SIZE, MIN_BLOCK_SIZE, header_of, payload_of};
pub use dump::{BlockInfo, Report};
pub use error::{HeapError, Result};
pub use heap::Heap;
pub use region::{Blocks, Mmap, RegionSource};

use thiserror::Error;

/// Failures reported by [`Heap`](crate::Heap) operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapError {
  #[error("requested region size is not positive or too large for a block tag")]
  InvalidSize,

  #[error("heap has already been initialized")]
  AlreadyInitialized,

  #[error("could not map a region of {len} bytes")]
  RegionUnavailable { len: usize },

  #[error("heap has not been initialized")]
  Uninitialized,

  #[error("cannot free a null pointer")]
  NullPointer,

  #[error("pointer {addr:#x} is not 8-byte aligned to the region")]
  Misaligned { addr: usize },

  #[error("pointer {addr:#x} is outside the managed region")]
  OutOfBounds { addr: usize },

  #[error("block at {addr:#x} is already free")]
  DoubleFree { addr: usize },

  #[error("corrupted block chain at offset {offset:#x}: {reason}")]
  Corrupted { offset: usize, reason: &'static str },
}

pub type Result<T> = core::result::Result<T, HeapError>;

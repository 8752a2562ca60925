/// Rounds the given size up to the double word (8 bytes) boundary.
///
/// Every block size in the heap goes through this macro, which is what keeps
/// payload addresses 8-byte aligned.
///
/// # Examples
///
/// ```rust
/// use tagalloc::align;
///
/// assert_eq!(align!(13), 16);
/// assert_eq!(align!(24), 24);
/// ```
#[macro_export]
macro_rules! align {
  ($value:expr) => {
    $crate::align_to!($value, $crate::DOUBLE_WORD)
  };
}

/// Rounds `value` up to the next multiple of `alignment`, which must be a
/// power of two.
///
/// # Examples
///
/// ```rust
/// use tagalloc::align_to;
///
/// assert_eq!(align_to!(1, 4096), 4096);
/// assert_eq!(align_to!(4097, 4096), 8192);
/// ```
#[macro_export]
macro_rules! align_to {
  ($value:expr, $alignment:expr) => {
    ($value + $alignment - 1) & !($alignment - 1)
  };
}

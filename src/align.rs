/// Rounds `value` up to the next multiple of `to`, which must be a power of two.
///
/// # Examples
///
/// ```rust
/// use segheap::align;
///
/// assert_eq!(align!(13, 16), 16);
/// assert_eq!(align!(32, 16), 32);
/// assert_eq!(align!(0, 16), 0);
/// ```
#[macro_export]
macro_rules! align {
  ($value:expr, $to:expr) => {
    ($value + $to - 1) & !($to - 1)
  };
}

/// Number of whole units needed to hold `size` bytes.
///
/// Returns `None` when the rounding itself would overflow `usize`.
pub const fn size_to_units(
  size: usize,
  unit: usize,
) -> Option<usize> {
  match size.checked_add(unit - 1) {
    Some(padded) => Some(padded / unit),
    None => None,
  }
}

//! Sources of arena memory.
//!
//! A [`Grower`] is the single primitive the heap uses to obtain address
//! space: it extends one contiguous region and reports the region's new end.
//! Memory is never handed back.

use std::{
  alloc::{self, Layout},
  ptr::NonNull,
};

use libc::{c_void, intptr_t, sbrk};
use log::debug;
use snafu::OptionExt as _;

use crate::{
  align,
  chunk::UNIT,
  error::{ExhaustedSnafu, GrowError},
};

/// A contiguous, outward-only memory source.
///
/// # Safety
///
/// On success, the `bytes` bytes ending at the returned address must be
/// valid for reads and writes, exclusively owned by the caller, and remain
/// so for as long as the grower lives.
pub unsafe trait Grower {
  /// Extends the region by `bytes` and returns its new end.
  fn grow(
    &mut self,
    bytes: usize,
  ) -> Result<NonNull<u8>, GrowError>;
}

/// Grows the process data segment with `sbrk(2)`.
///
/// The first growth pads the program break up to [`UNIT`] alignment.
#[derive(Debug, Default)]
pub struct ProgramBreak {
  aligned: bool,
}

impl ProgramBreak {
  pub const fn new() -> Self {
    Self { aligned: false }
  }

  /// Current program break, as reported by `sbrk(0)`.
  pub fn current() -> *mut u8 {
    unsafe { sbrk(0) as *mut u8 }
  }

  unsafe fn bump(increment: usize) -> Option<*mut u8> {
    let delta = intptr_t::try_from(increment).ok()?;
    let previous = unsafe { sbrk(delta) };

    if previous == usize::MAX as *mut c_void {
      return None;
    }

    Some(previous as *mut u8)
  }
}

unsafe impl Grower for ProgramBreak {
  fn grow(
    &mut self,
    bytes: usize,
  ) -> Result<NonNull<u8>, GrowError> {
    unsafe {
      if !self.aligned {
        let current = Self::bump(0).context(ExhaustedSnafu { requested: bytes })? as usize;
        let pad = align!(current, UNIT) - current;

        if pad > 0 {
          Self::bump(pad).context(ExhaustedSnafu { requested: bytes })?;
          debug!("padded program break by {pad} bytes");
        }
        self.aligned = true;
      }

      let previous = Self::bump(bytes).context(ExhaustedSnafu { requested: bytes })?;

      NonNull::new(previous.wrapping_add(bytes)).context(ExhaustedSnafu { requested: bytes })
    }
  }
}

/// A fixed-capacity buffer handed out front to back.
///
/// Useful when several heaps must coexist, or when exhaustion has to be
/// reproducible.
#[derive(Debug)]
pub struct Region {
  base: NonNull<u8>,
  layout: Layout,
  used: usize,
}

impl Region {
  pub fn with_capacity(capacity: usize) -> Self {
    let size = align!(capacity.max(UNIT), UNIT);
    let layout = match Layout::from_size_align(size, UNIT) {
      Ok(layout) => layout,
      Err(_) => panic!("region capacity {capacity} is too large"),
    };

    let base = unsafe { alloc::alloc_zeroed(layout) };
    let Some(base) = NonNull::new(base) else {
      alloc::handle_alloc_error(layout);
    };

    Self {
      base,
      layout,
      used: 0,
    }
  }

  /// Lowest address of the buffer.
  pub fn base(&self) -> NonNull<u8> {
    self.base
  }

  pub fn capacity(&self) -> usize {
    self.layout.size()
  }

  pub fn used(&self) -> usize {
    self.used
  }
}

unsafe impl Grower for Region {
  fn grow(
    &mut self,
    bytes: usize,
  ) -> Result<NonNull<u8>, GrowError> {
    let end = self
      .used
      .checked_add(bytes)
      .filter(|end| *end <= self.capacity())
      .context(ExhaustedSnafu { requested: bytes })?;

    self.used = end;

    Ok(unsafe { self.base.add(end) })
  }
}

impl Drop for Region {
  fn drop(&mut self) {
    unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) }
  }
}

// The buffer is owned outright; nothing else aliases it.
unsafe impl Send for Region {}

/// A grower that never has memory to give.
#[derive(Debug, Default, Clone, Copy)]
pub struct Refusing;

unsafe impl Grower for Refusing {
  fn grow(
    &mut self,
    bytes: usize,
  ) -> Result<NonNull<u8>, GrowError> {
    Err(GrowError::Exhausted { requested: bytes })
  }
}

//! Chunk layout and the arena accessor layer.
//!
//! ```text
//!   One chunk of `units` data units:
//!
//!   c              c + 1                         c + units + 1
//!   ┌──────────────┬─────────────────────────────┬──────────────┐
//!   │ header tag   │        data region          │ footer tag   │
//!   │ link: next   │   `units` * UNIT bytes      │ link: prev   │
//!   │ units        │                             │ units        │
//!   │ status       │                             │              │
//!   └──────────────┴─────────────────────────────┴──────────────┘
//!                  ▲
//!                  └── pointer returned to the caller
//! ```
//!
//! Chunks are addressed by [`ChunkId`], the unit index of their header
//! inside the arena. Free-list links are stored as indices too, so every
//! navigation step goes through [`Arena`], which checks bounds before
//! touching memory.

use std::{fmt, ptr::NonNull};

use log::{debug, warn};
use snafu::{OptionExt as _, ensure};

use crate::{
  error::{
    BadStatusSnafu, DiscontiguousSnafu, ExhaustedSnafu, FooterMismatchSnafu, GrowError, MisalignedSnafu,
    OutOfBoundsSnafu, Violation, ZeroUnitsSnafu,
  },
  grow::Grower,
};

/// One header or footer slot. Its size is the allocator's unit.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy)]
struct Tag {
  link: usize,
  units: u32,
  status: u32,
}

/// Allocation granularity in bytes. Data pointers are aligned to it.
pub const UNIT: usize = size_of::<Tag>();
const _: () = assert!(UNIT == 16);

/// Largest arena, in units, so every chunk's unit count fits its tag.
pub(crate) const MAX_UNITS: usize = u32::MAX as usize;

const NIL: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
  Free = 0x4652,
  InUse = 0x5553,
}

impl Status {
  fn from_raw(raw: u32) -> Option<Self> {
    match raw {
      0x4652 => Some(Self::Free),
      0x5553 => Some(Self::InUse),
      _ => None,
    }
  }
}

/// Unit index of a chunk header inside the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(usize);

impl ChunkId {
  pub fn index(self) -> usize {
    self.0
  }
}

impl fmt::Display for ChunkId {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

fn encode(link: Option<ChunkId>) -> usize {
  link.map_or(NIL, ChunkId::index)
}

fn decode(raw: usize) -> Option<ChunkId> {
  (raw != NIL).then_some(ChunkId(raw))
}

/// The contiguous managed region, viewed as an array of unit slots.
pub(crate) struct Arena<G> {
  base: Option<NonNull<Tag>>,
  len: usize,
  grower: G,
}

// The arena exclusively owns the memory behind `base`.
unsafe impl<G: Send> Send for Arena<G> {}

impl<G> Arena<G> {
  pub const fn new(grower: G) -> Self {
    Self {
      base: None,
      len: 0,
      grower,
    }
  }

  /// Arena length in units.
  pub fn len(&self) -> usize {
    self.len
  }

  pub fn grower(&self) -> &G {
    &self.grower
  }

  /// The lowest chunk, if the arena is not empty.
  pub fn first(&self) -> Option<ChunkId> {
    (self.len > 0).then_some(ChunkId(0))
  }

  /// Address of the first byte, if the arena has ever grown.
  pub fn start(&self) -> Option<NonNull<u8>> {
    self.base.map(NonNull::cast)
  }

  fn slot(
    &self,
    at: usize,
  ) -> *mut Tag {
    match self.base {
      Some(base) if at < self.len => unsafe { base.as_ptr().add(at) },
      _ => panic!("slot {at} outside arena of {} units", self.len),
    }
  }

  fn read(
    &self,
    at: usize,
  ) -> Tag {
    unsafe { self.slot(at).read() }
  }

  fn update(
    &mut self,
    at: usize,
    f: impl FnOnce(&mut Tag),
  ) {
    let slot = self.slot(at);
    f(unsafe { &mut *slot })
  }

  pub fn status(
    &self,
    c: ChunkId,
  ) -> Option<Status> {
    Status::from_raw(self.read(c.0).status)
  }

  pub fn is_free(
    &self,
    c: ChunkId,
  ) -> bool {
    self.status(c) == Some(Status::Free)
  }

  pub fn set_status(
    &mut self,
    c: ChunkId,
    status: Status,
  ) {
    self.update(c.0, |tag| tag.status = status as u32);
  }

  pub fn units(
    &self,
    c: ChunkId,
  ) -> usize {
    self.read(c.0).units as usize
  }

  /// Writes `units` into both the header and the matching footer.
  pub fn set_units(
    &mut self,
    c: ChunkId,
    units: usize,
  ) {
    let Ok(units) = u32::try_from(units) else {
      panic!("chunk {c} cannot hold {units} units");
    };

    self.update(c.0, |tag| tag.units = units);
    let footer = self.footer_of(c);
    self.update(footer, |tag| tag.units = units);
  }

  pub fn next_free(
    &self,
    c: ChunkId,
  ) -> Option<ChunkId> {
    decode(self.read(c.0).link)
  }

  pub fn set_next_free(
    &mut self,
    c: ChunkId,
    next: Option<ChunkId>,
  ) {
    self.update(c.0, |tag| tag.link = encode(next));
  }

  /// Back link, kept in the footer.
  pub fn prev_free(
    &self,
    c: ChunkId,
  ) -> Option<ChunkId> {
    decode(self.read(self.footer_of(c)).link)
  }

  pub fn set_prev_free(
    &mut self,
    c: ChunkId,
    prev: Option<ChunkId>,
  ) {
    let footer = self.footer_of(c);
    self.update(footer, |tag| tag.link = encode(prev));
  }

  pub fn footer_of(
    &self,
    c: ChunkId,
  ) -> usize {
    c.0 + self.units(c) + 1
  }

  pub fn header_of(
    &self,
    footer: usize,
  ) -> ChunkId {
    let units = self.read(footer).units as usize;
    match footer.checked_sub(units + 1) {
      Some(header) => ChunkId(header),
      None => panic!("footer {footer} claims {units} units below the arena start"),
    }
  }

  /// The chunk starting right after `c`, if `c` is not the last one.
  pub fn next_adjacent(
    &self,
    c: ChunkId,
  ) -> Option<ChunkId> {
    let next = c.0 + self.units(c) + 2;
    (next < self.len).then_some(ChunkId(next))
  }

  /// The chunk ending right before `c`, if `c` is not the first one.
  pub fn prev_adjacent(
    &self,
    c: ChunkId,
  ) -> Option<ChunkId> {
    let footer = c.0.checked_sub(1)?;
    Some(self.header_of(footer))
  }

  /// Structural probe used by the heap validator.
  pub fn check(
    &self,
    c: ChunkId,
  ) -> Result<(), Violation> {
    ensure!(c.0 < self.len, OutOfBoundsSnafu { chunk: c });

    let header = self.read(c.0);
    ensure!(header.units != 0, ZeroUnitsSnafu { chunk: c });
    Status::from_raw(header.status).context(BadStatusSnafu {
      chunk: c,
      raw: header.status,
    })?;

    let footer = self.footer_of(c);
    ensure!(footer < self.len, OutOfBoundsSnafu { chunk: c });
    let footer = self.read(footer);
    ensure!(
      footer.units == header.units,
      FooterMismatchSnafu {
        chunk: c,
        header: header.units as usize,
        footer: footer.units as usize,
      }
    );

    Ok(())
  }

  /// Pointer to the first data byte of `c`.
  pub fn data(
    &self,
    c: ChunkId,
  ) -> NonNull<u8> {
    let header = self.slot(c.0);
    unsafe { NonNull::new_unchecked(header.add(1).cast()) }
  }

  /// Recovers the chunk whose data region starts at `ptr`.
  pub fn chunk_of(
    &self,
    ptr: NonNull<u8>,
  ) -> ChunkId {
    let start = self.start().map_or(0, |start| start.as_ptr() as usize);
    let offset = (ptr.as_ptr() as usize).wrapping_sub(start);

    assert!(
      offset % UNIT == 0 && offset / UNIT >= 1 && offset / UNIT < self.len,
      "pointer {ptr:p} was not handed out by this arena"
    );

    ChunkId(offset / UNIT - 1)
  }
}

impl<G: Grower> Arena<G> {
  /// Appends an in-use chunk of `units` data units at the arena end.
  ///
  /// On failure the arena is unchanged.
  pub fn grow(
    &mut self,
    units: usize,
  ) -> Result<ChunkId, GrowError> {
    let span = units.saturating_add(2);
    let bytes = self
      .len
      .checked_add(span)
      .filter(|len| *len <= MAX_UNITS)
      .and_then(|_| span.checked_mul(UNIT))
      .context(ExhaustedSnafu {
        requested: span.saturating_mul(UNIT),
      })?;

    let end = self.grower.grow(bytes)?;
    let start = end.as_ptr() as usize - bytes;

    match self.base {
      None => {
        ensure!(start % UNIT == 0, MisalignedSnafu { address: start });
        self.base = NonNull::new(end.as_ptr().wrapping_sub(bytes).cast::<Tag>());
      }
      Some(base) => {
        let expected = base.as_ptr() as usize + self.len * UNIT;
        if start != expected {
          warn!("arena growth landed at {start:#x}, expected {expected:#x}");
          return DiscontiguousSnafu {
            expected,
            actual: start,
          }
          .fail();
        }
      }
    }

    let c = ChunkId(self.len);
    self.len += span;
    self.set_units(c, units);
    self.set_status(c, Status::InUse);
    self.set_next_free(c, None);
    self.set_prev_free(c, None);

    debug!("arena grew by {bytes} bytes to {} units, new chunk {c}", self.len);

    Ok(c)
  }
}

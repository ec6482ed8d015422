use std::{iter, ptr::NonNull};

use log::{debug, trace};
use snafu::{OptionExt as _, ResultExt as _, ensure};

use crate::{
  align::size_to_units,
  chunk::{Arena, ChunkId, MAX_UNITS, Status, UNIT},
  config::{BIN_COUNT, Config},
  error::{
    AllocError, BrokenBackLinkSnafu, CycleSnafu, GrowError, MisfiledSnafu, NotFreeSnafu, OutOfMemorySnafu,
    TilingSnafu, TooLargeSnafu, UncoalescedSnafu, UnlistedSnafu, UnorderedSnafu, Violation, ZeroSizeSnafu,
  },
  grow::Grower,
};

/// Which free list a free chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum List {
  Bin(usize),
  Overflow,
}

/// Totals gathered by walking the arena.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
  pub arena_bytes: usize,
  pub chunks: usize,
  pub free_chunks: usize,
  pub free_units: usize,
  pub used_chunks: usize,
  pub used_units: usize,
}

impl HeapStats {
  /// Bytes covered by all chunks, tags included.
  pub fn covered_bytes(&self) -> usize {
    (self.free_units + self.used_units + 2 * self.chunks) * UNIT
  }
}

/// Segregated-bin heap over a single growable arena.
///
/// Free chunks up to the largest bin ceiling live in size-classed bins,
/// larger ones in an address-ordered overflow list. Adjacent free chunks
/// are always merged.
pub struct Heap<G> {
  arena: Arena<G>,
  config: Config,
  bins: [Option<ChunkId>; BIN_COUNT],
  overflow: Option<ChunkId>,
}

impl<G> Heap<G> {
  pub const fn new(grower: G) -> Self {
    Self::with_config(grower, Config::DEFAULT)
  }

  pub const fn with_config(
    grower: G,
    config: Config,
  ) -> Self {
    Self {
      arena: Arena::new(grower),
      config,
      bins: [None; BIN_COUNT],
      overflow: None,
    }
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn grower(&self) -> &G {
    self.arena.grower()
  }

  /// Bytes obtained from the grower so far.
  pub fn arena_bytes(&self) -> usize {
    self.arena.len() * UNIT
  }

  pub fn arena_start(&self) -> Option<NonNull<u8>> {
    self.arena.start()
  }

  /// Lengths of every bin, then of the overflow list.
  pub fn free_list_lengths(&self) -> ([usize; BIN_COUNT], usize) {
    let mut bins = [0; BIN_COUNT];
    for (len, head) in bins.iter_mut().zip(self.bins) {
      *len = self.walk(head).count();
    }

    (bins, self.walk(self.overflow).count())
  }

  /// Releases memory obtained from [`Heap::allocate`]. A null pointer is
  /// ignored.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a pointer returned by `allocate` on this heap
  /// that has not been released since.
  pub unsafe fn release(
    &mut self,
    ptr: *mut u8,
  ) {
    let Some(ptr) = NonNull::new(ptr) else {
      return;
    };

    let c = self.arena.chunk_of(ptr);
    debug_assert_eq!(
      self.arena.status(c),
      Some(Status::InUse),
      "release of {ptr:p} which is not in use"
    );

    let c = self.insert(c);
    trace!("released {ptr:p}, now part of free chunk {c}");

    self.debug_check();
  }

  /// Verifies every structural invariant of the heap.
  ///
  /// Walks the arena confirming the chunks tile it exactly and that no two
  /// neighbours are both free, then walks every free list confirming each
  /// entry is a free, well-formed chunk filed in the right list with a
  /// consistent back link. The overflow list must be address ordered and
  /// every free chunk must be listed exactly once.
  pub fn check(&self) -> Result<(), Violation> {
    let mut covered = 0;
    let mut free = 0usize;
    let mut lower_free = None;

    for c in self.chunks() {
      self.arena.check(c)?;

      if self.arena.is_free(c) {
        if let Some(lower) = lower_free {
          return UncoalescedSnafu { chunk: lower }.fail();
        }
        lower_free = Some(c);
        free += 1;
      } else {
        lower_free = None;
      }

      covered += self.arena.units(c) + 2;
    }

    let len = self.arena.len();
    ensure!(covered == len, TilingSnafu { covered, len });

    let mut listed = 0usize;
    for (list, head) in self.lists() {
      let mut prev = None;
      let mut cursor = head;

      while let Some(c) = cursor {
        self.arena.check(c)?;
        ensure!(self.arena.is_free(c), NotFreeSnafu { chunk: c });
        ensure!(listed < free, CycleSnafu { head: head.unwrap_or(c) });

        let units = self.arena.units(c);
        ensure!(self.list_of(units) == list, MisfiledSnafu { chunk: c, units });
        ensure!(self.arena.prev_free(c) == prev, BrokenBackLinkSnafu { chunk: c });

        if let Some(next) = self.arena.next_adjacent(c) {
          ensure!(!self.arena.is_free(next), UncoalescedSnafu { chunk: c });
        }
        if list == List::Overflow {
          ensure!(prev.is_none_or(|prev| prev < c), UnorderedSnafu { chunk: c });
        }

        listed += 1;
        prev = Some(c);
        cursor = self.arena.next_free(c);
      }
    }

    ensure!(listed == free, UnlistedSnafu { free, listed });

    Ok(())
  }

  pub fn validate_heap(&self) -> bool {
    self.check().is_ok()
  }

  pub fn stats(&self) -> HeapStats {
    let mut stats = HeapStats {
      arena_bytes: self.arena_bytes(),
      ..HeapStats::default()
    };

    for c in self.chunks() {
      let units = self.arena.units(c);
      stats.chunks += 1;

      if self.arena.is_free(c) {
        stats.free_chunks += 1;
        stats.free_units += units;
      } else {
        stats.used_chunks += 1;
        stats.used_units += units;
      }
    }

    stats
  }

  fn debug_check(&self) {
    if cfg!(debug_assertions) {
      if let Err(violation) = self.check() {
        panic!("heap corrupted: {violation}");
      }
    }
  }

  fn chunks(&self) -> impl Iterator<Item = ChunkId> + '_ {
    iter::successors(self.arena.first(), |&c| self.arena.next_adjacent(c))
  }

  fn walk(
    &self,
    head: Option<ChunkId>,
  ) -> impl Iterator<Item = ChunkId> + '_ {
    iter::successors(head, |&c| self.arena.next_free(c))
  }

  fn lists(&self) -> impl Iterator<Item = (List, Option<ChunkId>)> + '_ {
    let bins = self.bins.iter().enumerate().map(|(bin, &head)| (List::Bin(bin), head));
    bins.chain(iter::once((List::Overflow, self.overflow)))
  }

  fn list_of(
    &self,
    units: usize,
  ) -> List {
    self.config.bin_index(units).map_or(List::Overflow, List::Bin)
  }

  fn head(
    &self,
    list: List,
  ) -> Option<ChunkId> {
    match list {
      List::Bin(bin) => self.bins[bin],
      List::Overflow => self.overflow,
    }
  }

  fn set_head(
    &mut self,
    list: List,
    head: Option<ChunkId>,
  ) {
    match list {
      List::Bin(bin) => self.bins[bin] = head,
      List::Overflow => self.overflow = head,
    }
  }

  fn link_front(
    &mut self,
    c: ChunkId,
  ) {
    let list = self.list_of(self.arena.units(c));
    let head = self.head(list);

    self.arena.set_next_free(c, head);
    self.arena.set_prev_free(c, None);
    if let Some(head) = head {
      self.arena.set_prev_free(head, Some(c));
    }
    self.set_head(list, Some(c));
  }

  fn link_after(
    &mut self,
    pred: ChunkId,
    c: ChunkId,
  ) {
    debug_assert!(pred < c);
    let next = self.arena.next_free(pred);

    self.arena.set_next_free(c, next);
    self.arena.set_prev_free(c, Some(pred));
    if let Some(next) = next {
      self.arena.set_prev_free(next, Some(c));
    }
    self.arena.set_next_free(pred, Some(c));
  }

  fn unlink(
    &mut self,
    c: ChunkId,
  ) {
    debug_assert!(self.arena.is_free(c));
    let prev = self.arena.prev_free(c);
    let next = self.arena.next_free(c);

    match prev {
      Some(prev) => self.arena.set_next_free(prev, next),
      None => {
        let list = self.list_of(self.arena.units(c));
        debug_assert_eq!(self.head(list), Some(c));
        self.set_head(list, next);
      }
    }
    if let Some(next) = next {
      self.arena.set_prev_free(next, prev);
    }

    self.arena.set_next_free(c, None);
    self.arena.set_prev_free(c, None);
  }

  /// Nearest free overflow-class chunk below `c` in address order.
  ///
  /// The overflow head is the lowest overflow chunk, so the walk never goes
  /// below it. Worst case is still linear in the chunks between the two.
  fn overflow_predecessor(
    &self,
    c: ChunkId,
  ) -> Option<ChunkId> {
    let lowest = self.overflow?;

    iter::successors(self.arena.prev_adjacent(c), |&p| self.arena.prev_adjacent(p))
      .take_while(|&p| p >= lowest)
      .find(|&p| self.arena.is_free(p) && self.list_of(self.arena.units(p)) == List::Overflow)
  }

  /// Marks `c` free and links it into its list, without merging.
  ///
  /// Bins are LIFO. Overflow chunks are spliced after their nearest free
  /// overflow predecessor so the overflow list stays address ordered.
  fn file(
    &mut self,
    c: ChunkId,
  ) {
    self.arena.set_status(c, Status::Free);

    match self.list_of(self.arena.units(c)) {
      List::Bin(_) => self.link_front(c),
      List::Overflow => match self.overflow_predecessor(c) {
        Some(pred) => self.link_after(pred, c),
        None => self.link_front(c),
      },
    }
  }

  /// Frees `c` and merges it with whichever neighbours are free.
  fn insert(
    &mut self,
    c: ChunkId,
  ) -> ChunkId {
    self.file(c);
    self.coalesce(c)
  }

  fn coalesce(
    &mut self,
    mut c: ChunkId,
  ) -> ChunkId {
    if let Some(next) = self.arena.next_adjacent(c).filter(|&n| self.arena.is_free(n)) {
      c = self.merge(c, next);
    }
    if let Some(prev) = self.arena.prev_adjacent(c).filter(|&p| self.arena.is_free(p)) {
      c = self.merge(prev, c);
    }
    c
  }

  /// Absorbs `upper` into `lower`, its free lower neighbour.
  fn merge(
    &mut self,
    lower: ChunkId,
    upper: ChunkId,
  ) -> ChunkId {
    debug_assert_eq!(self.arena.next_adjacent(lower), Some(upper));
    debug_assert!(self.arena.is_free(lower) && self.arena.is_free(upper));

    let units = self.arena.units(lower) + self.arena.units(upper) + 2;
    self.unlink(lower);
    self.unlink(upper);

    self.arena.set_units(lower, units);
    self.file(lower);

    trace!("merged {lower} and {upper} into {units} units");
    lower
  }

  /// Carves an in-use chunk of `units` units off the top of free chunk `c`.
  ///
  /// The remainder keeps its list position unless its size class changed.
  fn split(
    &mut self,
    c: ChunkId,
    units: usize,
  ) -> ChunkId {
    let total = self.arena.units(c);
    debug_assert!(self.arena.is_free(c));
    debug_assert!(total > units + 2);

    let rest = total - units - 2;
    if self.list_of(rest) == self.list_of(total) {
      let prev = self.arena.prev_free(c);
      self.arena.set_units(c, rest);
      self.arena.set_prev_free(c, prev);
    } else {
      self.unlink(c);
      self.arena.set_units(c, rest);
      self.file(c);
    }

    let Some(carved) = self.arena.next_adjacent(c) else {
      unreachable!("split of {c} left no room above it");
    };
    self.arena.set_units(carved, units);
    self.arena.set_status(carved, Status::InUse);
    self.arena.set_next_free(carved, None);
    self.arena.set_prev_free(carved, None);

    trace!("split {c} into {rest} free and {units} used units at {carved}");
    carved
  }

  /// Hands out `c`, splitting it when it has more than two units of slack.
  fn take(
    &mut self,
    c: ChunkId,
    units: usize,
  ) -> ChunkId {
    if self.arena.units(c) > units + 2 {
      return self.split(c, units);
    }

    self.unlink(c);
    self.arena.set_status(c, Status::InUse);
    c
  }

  /// First chunk of at least `units` units, searching bins from the
  /// smallest admissible class upwards, then the overflow list.
  fn find(
    &self,
    units: usize,
  ) -> Option<ChunkId> {
    let first_bin = self.config.bin_index(units).unwrap_or(BIN_COUNT);

    self.bins[first_bin..]
      .iter()
      .chain(iter::once(&self.overflow))
      .find_map(|&head| self.walk(head).find(|&c| self.arena.units(c) >= units))
  }
}

impl<G: Grower> Heap<G> {
  /// Allocates `size` bytes, aligned to [`UNIT`].
  pub fn allocate(
    &mut self,
    size: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    ensure!(size != 0, ZeroSizeSnafu);

    let units = size_to_units(size, UNIT)
      .filter(|&units| units <= MAX_UNITS - 2)
      .context(TooLargeSnafu { size })?;

    let c = match self.find(units) {
      Some(c) => c,
      None => self
        .grow(units)
        .inspect_err(|e| debug!("allocation of {size} bytes failed: {e}"))
        .context(OutOfMemorySnafu)?,
    };

    let c = self.take(c, units);
    let data = self.arena.data(c);
    trace!("allocated {size} bytes at {data:p} from {c}");

    self.debug_check();
    Ok(data)
  }

  /// Extends the arena with a free chunk of at least `units` units, merged
  /// with the previous last chunk when that one is free.
  fn grow(
    &mut self,
    units: usize,
  ) -> Result<ChunkId, GrowError> {
    let units = units.max(self.config.min_growth_units);
    let c = self.arena.grow(units)?;

    Ok(self.insert(c))
  }
}

#[cfg(test)]
mod tests {
  use test_log::test;

  use super::*;
  use crate::grow::{Refusing, Region};

  fn heap() -> Heap<Region> {
    Heap::new(Region::with_capacity(1 << 20))
  }

  fn offset<G>(
    heap: &Heap<G>,
    ptr: NonNull<u8>,
  ) -> usize {
    let start = heap.arena_start().unwrap().as_ptr() as usize;
    (ptr.as_ptr() as usize - start) / UNIT
  }

  fn units_at<G>(
    heap: &Heap<G>,
    ptr: NonNull<u8>,
  ) -> usize {
    heap.arena.units(heap.arena.chunk_of(ptr))
  }

  fn assert_conserved<G>(heap: &Heap<G>) {
    let stats = heap.stats();
    assert_eq!(stats.covered_bytes(), stats.arena_bytes);
  }

  #[test]
  fn test_zero_size_rejected() {
    let mut heap = heap();

    assert_eq!(heap.allocate(0), Err(AllocError::ZeroSize));
    assert_eq!(heap.arena_bytes(), 0);
  }

  #[test]
  fn test_too_large_rejected() {
    let mut heap = heap();

    assert_eq!(heap.allocate(usize::MAX), Err(AllocError::TooLarge { size: usize::MAX }));
  }

  #[test]
  fn test_empty_heap_is_valid() {
    let heap = heap();

    assert!(heap.validate_heap());
    assert_eq!(heap.stats(), HeapStats::default());
  }

  #[test]
  fn test_first_allocation_grows_arena() {
    let mut heap = heap();

    let ptr = heap.allocate(40).unwrap();

    assert_eq!(heap.arena_bytes(), 1026 * UNIT);
    assert_eq!(offset(&heap, ptr), 1022);
    assert_eq!(units_at(&heap, ptr), 3);
    assert_eq!(ptr.as_ptr() as usize % UNIT, 0);

    let stats = heap.stats();
    assert_eq!(stats.chunks, 2);
    assert_eq!(stats.free_units, 1019);
    assert_eq!(stats.used_units, 3);
    assert_eq!(heap.free_list_lengths(), ([0; BIN_COUNT], 1));
    assert!(heap.validate_heap());
  }

  #[test]
  fn test_scenario_reuse_and_merge() {
    let mut heap = heap();

    let a = heap.allocate(40).unwrap();
    let b = heap.allocate(60).unwrap();
    let c = heap.allocate(20).unwrap();
    assert!(heap.validate_heap());
    assert_eq!((offset(&heap, c), offset(&heap, b), offset(&heap, a)), (1012, 1016, 1022));

    unsafe { heap.release(b.as_ptr()) };
    assert!(heap.validate_heap());
    assert_eq!(heap.free_list_lengths().0[0], 1);

    let d = heap.allocate(55).unwrap();
    assert_eq!(d, b);
    assert!(heap.validate_heap());
    assert_eq!(heap.free_list_lengths().0[0], 0);

    unsafe { heap.release(a.as_ptr()) };
    assert!(heap.validate_heap());

    unsafe { heap.release(c.as_ptr()) };
    assert!(heap.validate_heap());

    let stats = heap.stats();
    assert_eq!(stats.chunks, 3);
    assert_eq!(stats.free_chunks, 2);
    assert_eq!(stats.free_units, 1013 + 3);
    assert_eq!(stats.used_units, 4);
    assert_eq!(heap.arena.units(heap.overflow.unwrap()), 1013);
    assert_eq!(heap.bins[0], Some(heap.arena.chunk_of(a)));
    assert_conserved(&heap);
  }

  #[test]
  fn test_release_then_allocate_reuses_region() {
    let mut heap = heap();

    let p = heap.allocate(100).unwrap();
    unsafe { heap.release(p.as_ptr()) };
    assert_eq!(heap.stats().free_units, 1024);

    let q = heap.allocate(100).unwrap();
    assert_eq!(q, p);

    unsafe { heap.release(q.as_ptr()) };
    let r = heap.allocate(50).unwrap();

    let old = offset(&heap, p) - 1..offset(&heap, p) + 8;
    let new = offset(&heap, r) - 1..offset(&heap, r) + 5;
    assert!(old.start <= new.start && new.end <= old.end);
    assert!(heap.validate_heap());
  }

  #[test]
  fn test_split_keeps_units_and_classes() {
    let config = Config::new(Config::DEFAULT.bin_ceilings, 150).unwrap();
    let mut heap = Heap::with_config(Region::with_capacity(1 << 16), config);

    let a = heap.allocate(40 * UNIT).unwrap();
    assert_eq!(units_at(&heap, a), 40);
    assert_eq!(heap.stats().free_units, 108);
    assert_eq!(heap.free_list_lengths().0[1], 1);

    let b = heap.allocate(50 * UNIT).unwrap();
    assert_eq!(units_at(&heap, b), 50);
    assert_eq!(heap.stats().free_units, 56);

    let (bins, overflow) = heap.free_list_lengths();
    assert_eq!((bins[0], bins[1], overflow), (1, 0, 0));
    assert!(heap.validate_heap());
    assert_conserved(&heap);
  }

  #[test]
  fn test_small_slack_is_not_split() {
    let mut heap = heap();

    let a = heap.allocate(5 * UNIT).unwrap();
    let _guard = heap.allocate(UNIT).unwrap();
    unsafe { heap.release(a.as_ptr()) };

    let b = heap.allocate(3 * UNIT).unwrap();
    assert_eq!(b, a);
    assert_eq!(units_at(&heap, b), 5);
    assert!(heap.validate_heap());
  }

  #[test]
  fn test_merge_removes_both_inputs() {
    let mut heap = heap();

    let a = heap.allocate(10 * UNIT).unwrap();
    let b = heap.allocate(20 * UNIT).unwrap();
    let _guard = heap.allocate(UNIT).unwrap();

    unsafe { heap.release(a.as_ptr()) };
    assert_eq!(heap.free_list_lengths().0[0], 1);

    unsafe { heap.release(b.as_ptr()) };

    let merged = heap.arena.chunk_of(b);
    assert_eq!(heap.bins[0], Some(merged));
    assert_eq!(heap.arena.units(merged), 10 + 20 + 2);
    assert_eq!(heap.arena.next_free(merged), None);

    let (bins, overflow) = heap.free_list_lengths();
    assert_eq!((bins[0], bins[9], overflow), (1, 1, 0));
    assert!(heap.validate_heap());
  }

  #[test]
  fn test_merge_on_both_sides() {
    let mut heap = heap();

    let a = heap.allocate(8 * UNIT).unwrap();
    let b = heap.allocate(8 * UNIT).unwrap();
    let c = heap.allocate(8 * UNIT).unwrap();
    let _guard = heap.allocate(UNIT).unwrap();

    unsafe {
      heap.release(a.as_ptr());
      heap.release(c.as_ptr());
      heap.release(b.as_ptr());
    }

    let merged = heap.arena.chunk_of(c);
    assert_eq!(heap.arena.units(merged), 3 * 8 + 4);
    assert_eq!(heap.stats().free_chunks, 2);
    assert!(heap.validate_heap());
  }

  #[test]
  fn test_bins_searched_from_smallest_class() {
    let mut heap = heap();

    let a = heap.allocate(150 * UNIT).unwrap();
    let _s1 = heap.allocate(UNIT).unwrap();
    let b = heap.allocate(50 * UNIT).unwrap();
    let _s2 = heap.allocate(UNIT).unwrap();

    unsafe {
      heap.release(a.as_ptr());
      heap.release(b.as_ptr());
    }

    let small = heap.allocate(40 * UNIT).unwrap();
    assert!(offset(&heap, small) > offset(&heap, b));
    assert!(offset(&heap, small) < offset(&heap, b) + 50);
    assert_eq!(heap.arena.units(heap.bins[0].unwrap()), 8);

    let large = heap.allocate(120 * UNIT).unwrap();
    assert!(offset(&heap, large) > offset(&heap, a));
    assert!(offset(&heap, large) < offset(&heap, a) + 150);
    assert!(heap.validate_heap());
  }

  #[test]
  fn test_growth_merges_with_trailing_free_chunk() {
    let mut heap = heap();

    let a = heap.allocate(1000 * UNIT).unwrap();
    assert_eq!(heap.free_list_lengths().0[0], 1);

    unsafe { heap.release(a.as_ptr()) };
    assert_eq!(heap.free_list_lengths(), ([0; BIN_COUNT], 1));

    let big = heap.allocate(2000 * UNIT).unwrap();
    assert_eq!(heap.arena_bytes(), 3028 * UNIT);
    assert_eq!(offset(&heap, big), 1027);
    assert_eq!(heap.stats().free_units, 1024);
    assert!(heap.validate_heap());
    assert_conserved(&heap);
  }

  #[test]
  fn test_overflow_list_is_address_ordered() {
    let config = Config::new(Config::DEFAULT.bin_ceilings, 1).unwrap();
    let mut heap = Heap::with_config(Region::with_capacity(1 << 20), config);

    let mut kept = Vec::new();
    let mut released = Vec::new();
    for _ in 0..4 {
      released.push(heap.allocate(1500 * UNIT).unwrap());
      kept.push(heap.allocate(UNIT).unwrap());
    }
    assert_eq!(heap.stats().free_chunks, 0);

    for i in [2, 0, 3, 1] {
      unsafe { heap.release(released[i].as_ptr()) };
      assert!(heap.validate_heap());
    }

    let order: Vec<_> = heap.walk(heap.overflow).collect();
    let expected: Vec<_> = released.iter().map(|&ptr| heap.arena.chunk_of(ptr)).collect();
    assert_eq!(order, expected);
  }

  #[test]
  fn test_overflow_filing_below_every_overflow_chunk() {
    let config = Config::new(Config::DEFAULT.bin_ceilings, 1).unwrap();
    let mut heap = Heap::with_config(Region::with_capacity(1 << 20), config);

    let small = heap.allocate(20 * UNIT).unwrap();
    let _s = heap.allocate(UNIT).unwrap();
    let low = heap.allocate(1500 * UNIT).unwrap();
    let _l = heap.allocate(UNIT).unwrap();
    let high = heap.allocate(1500 * UNIT).unwrap();
    let _h = heap.allocate(UNIT).unwrap();

    unsafe { heap.release(small.as_ptr()) };
    assert_eq!(heap.overflow_predecessor(heap.arena.chunk_of(high)), None);

    unsafe { heap.release(high.as_ptr()) };
    assert_eq!(heap.overflow, Some(heap.arena.chunk_of(high)));

    unsafe { heap.release(low.as_ptr()) };
    let order: Vec<_> = heap.walk(heap.overflow).collect();
    assert_eq!(order, vec![heap.arena.chunk_of(low), heap.arena.chunk_of(high)]);
    assert_eq!(heap.free_list_lengths().0[0], 1);
    assert!(heap.validate_heap());
  }

  #[test]
  fn test_check_counts_free_chunks_in_every_list() {
    let config = Config::new(Config::DEFAULT.bin_ceilings, 1).unwrap();
    let mut heap = Heap::with_config(Region::with_capacity(1 << 20), config);

    let mut released = Vec::new();
    for units in [10, 150, 950, 1500, 3000] {
      released.push(heap.allocate(units * UNIT).unwrap());
      heap.allocate(UNIT).unwrap();
    }
    for ptr in released {
      unsafe { heap.release(ptr.as_ptr()) };
    }

    let (bins, overflow) = heap.free_list_lengths();
    assert_eq!((bins[0], bins[1], bins[9], overflow), (1, 1, 1, 2));
    assert_eq!(heap.stats().free_chunks, 5);
    assert_eq!(heap.check(), Ok(()));
  }

  #[test]
  fn test_release_null_is_noop() {
    let mut heap = heap();
    heap.allocate(8).unwrap();

    let before = heap.stats();
    unsafe { heap.release(std::ptr::null_mut()) };

    assert_eq!(heap.stats(), before);
  }

  #[test]
  fn test_exhaustion_returns_error() {
    let mut heap = Heap::new(Refusing);

    assert_eq!(
      heap.allocate(1),
      Err(AllocError::OutOfMemory {
        source: GrowError::Exhausted {
          requested: 1026 * UNIT
        }
      })
    );
    assert!(heap.validate_heap());
    assert_eq!(heap.arena_bytes(), 0);
  }

  #[test]
  fn test_growth_failure_leaves_heap_unchanged() {
    let mut heap = Heap::new(Region::with_capacity(1026 * UNIT));

    let _a = heap.allocate(1000 * UNIT).unwrap();
    let before = heap.stats();
    let lists = heap.free_list_lengths();

    assert!(matches!(heap.allocate(500 * UNIT), Err(AllocError::OutOfMemory { .. })));
    assert_eq!(heap.stats(), before);
    assert_eq!(heap.free_list_lengths(), lists);
    assert!(heap.validate_heap());
  }

  #[test]
  fn test_independent_heaps() {
    let mut first = heap();
    let mut second = heap();

    let a = first.allocate(64).unwrap();
    let b = second.allocate(64).unwrap();
    assert_ne!(a, b);

    unsafe { first.release(a.as_ptr()) };
    assert_eq!(first.stats().used_chunks, 0);
    assert_eq!(second.stats().used_chunks, 1);
  }

  #[test]
  fn test_check_detects_uncoalesced_neighbours() {
    let mut heap = heap();

    let a = heap.allocate(32).unwrap();
    let c = heap.arena.chunk_of(a);
    heap.arena.set_status(c, Status::Free);

    assert_eq!(
      heap.check(),
      Err(Violation::Uncoalesced {
        chunk: heap.arena.first().unwrap()
      })
    );
    assert!(!heap.validate_heap());
  }

  #[test]
  fn test_check_detects_non_free_listed_chunk() {
    let mut heap = heap();

    heap.allocate(32).unwrap();
    let front = heap.overflow.unwrap();
    heap.arena.set_status(front, Status::InUse);

    assert_eq!(heap.check(), Err(Violation::NotFree { chunk: front }));
  }

  #[test]
  fn test_check_detects_misfiled_chunk() {
    let mut heap = heap();

    heap.allocate(32).unwrap();
    let front = heap.overflow.take();
    heap.bins[3] = front;

    assert_eq!(
      heap.check(),
      Err(Violation::Misfiled {
        chunk: front.unwrap(),
        units: 1020,
      })
    );
  }

  #[test]
  fn test_check_detects_unlisted_free_chunk() {
    let mut heap = heap();

    heap.allocate(32).unwrap();
    heap.overflow = None;

    assert_eq!(heap.check(), Err(Violation::Unlisted { free: 1, listed: 0 }));
  }

  #[cfg(debug_assertions)]
  #[test]
  #[should_panic(expected = "heap corrupted")]
  fn test_corruption_is_fatal_in_debug_builds() {
    let mut heap = heap();

    heap.allocate(32).unwrap();
    heap.overflow = None;
    heap.allocate(32).unwrap();
  }

  /// xorshift64, enough to drive reproducible operation sequences.
  struct Rng(u64);

  impl Rng {
    fn next(&mut self) -> u64 {
      self.0 ^= self.0 << 13;
      self.0 ^= self.0 >> 7;
      self.0 ^= self.0 << 17;
      self.0
    }

    fn below(
      &mut self,
      n: u64,
    ) -> usize {
      (self.next() % n) as usize
    }
  }

  #[test]
  fn test_random_sequences_keep_invariants() {
    for seed in [0x9E37_79B9_7F4A_7C15, 0xDEAD_BEEF, 42] {
      let mut rng = Rng(seed);
      let mut heap = Heap::new(Region::with_capacity(64 << 20));
      let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

      for step in 0..1500 {
        if live.is_empty() || rng.below(10) < 6 {
          let size = match rng.below(10) {
            0 => 16_000 + rng.below(40_000),
            1..=3 => 1_600 + rng.below(14_400),
            _ => 1 + rng.below(1_600),
          };
          let fill = (step % 251) as u8;

          let ptr = heap.allocate(size).unwrap();
          unsafe { ptr.as_ptr().write_bytes(fill, size) };
          live.push((ptr, size, fill));
        } else {
          let (ptr, size, fill) = live.swap_remove(rng.below(live.len() as u64));

          let data = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
          assert!(data.iter().all(|&b| b == fill), "allocation at {ptr:p} was overwritten");

          unsafe { heap.release(ptr.as_ptr()) };
        }

        assert_eq!(heap.check(), Ok(()), "seed {seed:#x} step {step}");
        assert_conserved(&heap);
        assert_eq!(heap.stats().used_chunks, live.len());
      }

      for (ptr, _, _) in live.drain(..) {
        unsafe { heap.release(ptr.as_ptr()) };
      }
      assert_eq!(heap.stats().free_chunks, 1);
      assert!(heap.validate_heap());
    }
  }
}

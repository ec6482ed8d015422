use snafu::Snafu;

use crate::chunk::ChunkId;

/// Failure reported by a [`Grower`](crate::grow::Grower).
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum GrowError {
  #[snafu(display("cannot extend the arena by {requested} bytes"))]
  Exhausted { requested: usize },
  #[snafu(display("arena growth is not contiguous: expected {expected:#x}, got {actual:#x}"))]
  Discontiguous { expected: usize, actual: usize },
  #[snafu(display("arena start {address:#x} is not unit aligned"))]
  Misaligned { address: usize },
}

/// Failure reported by [`Heap::allocate`](crate::Heap::allocate).
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AllocError {
  #[snafu(display("zero-sized allocation requested"))]
  ZeroSize,
  #[snafu(display("allocation of {size} bytes exceeds the largest chunk"))]
  TooLarge { size: usize },
  #[snafu(display("out of memory"))]
  OutOfMemory { source: GrowError },
}

/// Rejected [`Config`](crate::Config).
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
  #[snafu(display("bin {index} has a zero ceiling"))]
  ZeroCeiling { index: usize },
  #[snafu(display("bin {index} ceiling {ceiling} does not exceed the previous bin"))]
  Descending { index: usize, ceiling: usize },
  #[snafu(display("minimum growth must be at least one unit"))]
  ZeroGrowth,
  #[snafu(display("unit count {units} does not fit a chunk"))]
  Oversized { units: usize },
}

/// The first structural inconsistency found by [`Heap::check`](crate::Heap::check).
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Violation {
  #[snafu(display("chunk {chunk} lies outside the arena"))]
  OutOfBounds { chunk: ChunkId },
  #[snafu(display("chunk {chunk} has zero units"))]
  ZeroUnits { chunk: ChunkId },
  #[snafu(display("chunk {chunk} header says {header} units, footer says {footer}"))]
  FooterMismatch {
    chunk: ChunkId,
    header: usize,
    footer: usize,
  },
  #[snafu(display("chunk {chunk} has unknown status word {raw:#x}"))]
  BadStatus { chunk: ChunkId, raw: u32 },
  #[snafu(display("chunk {chunk} and its successor are both free"))]
  Uncoalesced { chunk: ChunkId },
  #[snafu(display("chunk {chunk} is in a free list but not free"))]
  NotFree { chunk: ChunkId },
  #[snafu(display("chunk {chunk} with {units} units is filed in the wrong list"))]
  Misfiled { chunk: ChunkId, units: usize },
  #[snafu(display("chunk {chunk} has a broken back link"))]
  BrokenBackLink { chunk: ChunkId },
  #[snafu(display("overflow list is out of address order at chunk {chunk}"))]
  Unordered { chunk: ChunkId },
  #[snafu(display("free list starting at {head} does not terminate"))]
  Cycle { head: ChunkId },
  #[snafu(display("{free} free chunks in the arena but {listed} in the free lists"))]
  Unlisted { free: usize, listed: usize },
  #[snafu(display("chunks cover {covered} units of a {len} unit arena"))]
  Tiling { covered: usize, len: usize },
}

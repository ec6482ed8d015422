//! # segheap - A Segregated-Bin Heap Allocator
//!
//! This crate provides a user-space **boundary-tag heap** that services
//! arbitrary-size allocations from one contiguous arena, grown on demand
//! through `sbrk(2)` or any other [`Grower`].
//!
//! ## Overview
//!
//! ```text
//!   Arena:
//!
//!   start                                                               end
//!   ┌────────────┬──────────┬──────────────────┬──────────┬──────────────┐
//!   │ free (412) │ used (3) │   used (90)      │ free (7) │  used (500)  │
//!   └────────────┴──────────┴──────────────────┴──────────┴──────────────┘
//!        │                                         │
//!        │         ┌───────────────────────────────┘
//!        ▼         ▼
//!   bins[0..10]  ──►  size-classed, LIFO      (units <= 1000 by default)
//!   overflow     ──►  address ordered         (everything larger)
//!
//!   Chunks tile the arena. No two neighbours are ever both free.
//! ```
//!
//! ## Crate Structure
//!
//! ```text
//!   segheap
//!   ├── align      - align! macro and unit rounding
//!   ├── chunk      - boundary-tag layout and the bounds-checked arena view
//!   ├── config     - bin ceilings and growth policy
//!   ├── error      - AllocError, GrowError, ConfigError, Violation
//!   ├── grow       - Grower trait: ProgramBreak (sbrk), Region, Refusing
//!   ├── heap       - Heap: allocate, release, split, merge, validation
//!   └── global     - LockedHeap, a GlobalAlloc behind a spin lock
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use segheap::{Heap, ProgramBreak};
//!
//! fn main() {
//!     let mut heap = Heap::new(ProgramBreak::new());
//!
//!     let ptr = heap.allocate(40).expect("out of memory");
//!     unsafe {
//!         ptr.as_ptr().write_bytes(0xAB, 40);
//!         heap.release(ptr.as_ptr());
//!     }
//!
//!     assert!(heap.validate_heap());
//! }
//! ```
//!
//! ## How It Works
//!
//! Each chunk carries a header and a footer tag of one unit (16 bytes)
//! each. The footer mirrors the unit count so the chunk below can be found
//! from any header:
//!
//! ```text
//!   ┌──────────┬──────────────────────────────┬──────────┐
//!   │  header  │         data region          │  footer  │
//!   │ next     │                              │ prev     │
//!   │ units    │    units * 16 bytes          │ units    │
//!   │ status   │                              │          │
//!   └──────────┴──────────────────────────────┴──────────┘
//!              ▲
//!              └── pointer returned to the caller
//! ```
//!
//! - **Allocation** scans the bins from the smallest class that can hold the
//!   request, then the overflow list, taking the first chunk large enough.
//!   Chunks with more than two units of slack are split; the caller gets the
//!   upper part.
//! - **Growth** happens when nothing fits: at least 1024 units are requested
//!   and merged with the last chunk when it is free.
//! - **Release** files the chunk into its list and merges it with free
//!   neighbours on both sides.
//!
//! Free-list links are unit indices into the arena rather than raw
//! addresses, and all tag access goes through one bounds-checked layer.
//!
//! ## Limitations
//!
//! - **One arena per heap**: memory is never returned to the OS
//! - **Alignment**: data is aligned to 16 bytes, never more
//! - **Single-threaded core**: [`Heap`] needs `&mut`; wrap it in
//!   [`LockedHeap`] to share it
//! - **Unix-only `sbrk`**: [`ProgramBreak`] requires `libc`
//!
//! ## Safety
//!
//! [`Heap::release`] is `unsafe`: passing a pointer this heap did not hand
//! out, or releasing one twice, corrupts the heap. Debug builds validate the
//! whole structure after every operation and panic on the first violation.

pub mod align;
mod chunk;
mod config;
mod error;
mod global;
pub mod grow;
mod heap;

pub use chunk::{ChunkId, UNIT};
pub use config::{BIN_COUNT, Config};
pub use error::{AllocError, ConfigError, GrowError, Violation};
pub use global::LockedHeap;
pub use grow::{Grower, ProgramBreak, Refusing, Region};
pub use heap::{Heap, HeapStats};

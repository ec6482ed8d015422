use std::{
  alloc::{GlobalAlloc, Layout},
  ptr::{self, NonNull},
};

use spin::{Mutex, MutexGuard};

use crate::{chunk::UNIT, grow::Grower, heap::Heap};

/// A [`Heap`] behind one spin lock, usable as `#[global_allocator]`.
///
/// Every operation holds the lock for its whole duration. When installed
/// as the global allocator, do not install a logger that allocates while
/// `log` records are enabled for this crate: the logging call would
/// re-enter the locked heap.
///
/// ```rust,ignore
/// use segheap::{LockedHeap, ProgramBreak};
///
/// #[global_allocator]
/// static HEAP: LockedHeap<ProgramBreak> = LockedHeap::new(ProgramBreak::new());
/// ```
pub struct LockedHeap<G> {
  heap: Mutex<Heap<G>>,
}

impl<G> LockedHeap<G> {
  pub const fn new(grower: G) -> Self {
    Self {
      heap: Mutex::new(Heap::new(grower)),
    }
  }

  pub fn lock(&self) -> MutexGuard<'_, Heap<G>> {
    self.heap.lock()
  }
}

unsafe impl<G: Grower + Send> GlobalAlloc for LockedHeap<G> {
  unsafe fn alloc(
    &self,
    layout: Layout,
  ) -> *mut u8 {
    if layout.align() > UNIT {
      return ptr::null_mut();
    }

    self
      .heap
      .lock()
      .allocate(layout.size())
      .map_or(ptr::null_mut(), NonNull::as_ptr)
  }

  unsafe fn dealloc(
    &self,
    ptr: *mut u8,
    _layout: Layout,
  ) {
    unsafe { self.heap.lock().release(ptr) }
  }
}

#[cfg(test)]
mod tests {
  use std::{sync::Arc, thread};

  use test_log::test;

  use super::*;
  use crate::grow::Region;

  #[test]
  fn test_global_alloc_round_trip() {
    let heap = LockedHeap::new(Region::with_capacity(1 << 16));
    let layout = Layout::from_size_align(24, 8).unwrap();

    unsafe {
      let ptr = heap.alloc(layout);
      assert!(!ptr.is_null());
      ptr.write_bytes(0x5A, layout.size());

      heap.dealloc(ptr, layout);
      assert_eq!(heap.alloc(layout), ptr);
    }

    assert!(heap.lock().validate_heap());
  }

  #[test]
  fn test_over_aligned_layout_is_refused() {
    let heap = LockedHeap::new(Region::with_capacity(1 << 16));
    let layout = Layout::from_size_align(64, 64).unwrap();

    assert!(unsafe { heap.alloc(layout) }.is_null());
    assert_eq!(heap.lock().arena_bytes(), 0);
  }

  #[test]
  fn test_realloc_preserves_contents() {
    let heap = LockedHeap::new(Region::with_capacity(1 << 16));
    let layout = Layout::from_size_align(16, 16).unwrap();

    unsafe {
      let ptr = heap.alloc(layout);
      for i in 0..16 {
        ptr.add(i).write(i as u8);
      }

      let grown = heap.realloc(ptr, layout, 4096);
      assert!(!grown.is_null());
      for i in 0..16 {
        assert_eq!(grown.add(i).read(), i as u8);
      }

      heap.dealloc(grown, Layout::from_size_align(4096, 16).unwrap());
    }

    assert_eq!(heap.lock().stats().used_chunks, 0);
  }

  #[test]
  fn test_shared_between_threads() {
    let heap = Arc::new(LockedHeap::new(Region::with_capacity(4 << 20)));

    let workers: Vec<_> = (0..4)
      .map(|id| {
        let heap = Arc::clone(&heap);
        thread::spawn(move || {
          let layout = Layout::from_size_align(32 + id * 8, 8).unwrap();
          for _ in 0..200 {
            unsafe {
              let ptr = heap.alloc(layout);
              assert!(!ptr.is_null());
              ptr.write_bytes(id as u8, layout.size());
              assert!(std::slice::from_raw_parts(ptr, layout.size()).iter().all(|&b| b == id as u8));
              heap.dealloc(ptr, layout);
            }
          }
        })
      })
      .collect();

    for worker in workers {
      worker.join().unwrap();
    }

    let heap = heap.lock();
    assert!(heap.validate_heap());
    assert_eq!(heap.stats().used_chunks, 0);
  }
}

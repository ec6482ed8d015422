use std::ptr::NonNull;

use segheap::{Heap, ProgramBreak};

/// Prints the size, address and resulting program break of an allocation.
fn print_alloc(
  label: &str,
  size: usize,
  addr: NonNull<u8>,
) {
  println!(
    "[{label}] Allocated {size} bytes, address = {addr:p}, program break = {:?}",
    ProgramBreak::current()
  );
}

/// Prints chunk counts and free-list occupancy.
fn print_heap(
  label: &str,
  heap: &Heap<ProgramBreak>,
) {
  let stats = heap.stats();
  let (bins, overflow) = heap.free_list_lengths();

  println!(
    "[{label}] arena = {} bytes, chunks = {} ({} free / {} used), bins = {:?}, overflow = {}, valid = {}",
    stats.arena_bytes,
    stats.chunks,
    stats.free_chunks,
    stats.used_chunks,
    bins,
    overflow,
    heap.validate_heap(),
  );
}

fn main() {
  env_logger::init();

  let mut heap = Heap::new(ProgramBreak::new());

  println!("[start] PID = {}, program break = {:?}", std::process::id(), ProgramBreak::current());

  // --------------------------------------------------------------------
  // 1) Three small allocations. The first one grows the arena by the
  //    minimum of 1024 units; the rest are carved from the same chunk.
  // --------------------------------------------------------------------
  let a = heap.allocate(40).expect("out of memory");
  print_alloc("1a", 40, a);
  let b = heap.allocate(60).expect("out of memory");
  print_alloc("1b", 60, b);
  let c = heap.allocate(20).expect("out of memory");
  print_alloc("1c", 20, c);
  print_heap("1", &heap);

  unsafe {
    a.as_ptr().write_bytes(0xAA, 40);
    b.as_ptr().write_bytes(0xBB, 60);
    c.as_ptr().write_bytes(0xCC, 20);
  }

  // --------------------------------------------------------------------
  // 2) Release the middle block. It lands in the smallest bin and has no
  //    free neighbour to merge with.
  // --------------------------------------------------------------------
  unsafe { heap.release(b.as_ptr()) };
  print_heap("2", &heap);

  // --------------------------------------------------------------------
  // 3) A request of similar size reuses the freed block.
  // --------------------------------------------------------------------
  let d = heap.allocate(55).expect("out of memory");
  print_alloc("3", 55, d);
  println!(
    "[3] d == b? {}",
    if d == b {
      "Yes, it reused the freed block"
    } else {
      "No, it allocated somewhere else"
    }
  );

  // --------------------------------------------------------------------
  // 4) Release the outer blocks. `c` merges with the free space below it.
  // --------------------------------------------------------------------
  unsafe {
    heap.release(a.as_ptr());
    heap.release(c.as_ptr());
  }
  print_heap("4", &heap);

  // --------------------------------------------------------------------
  // 5) A large request no free chunk can satisfy grows the arena again.
  // --------------------------------------------------------------------
  let before = ProgramBreak::current();
  let big = heap.allocate(64 * 1024).expect("out of memory");
  print_alloc("5", 64 * 1024, big);
  println!("[5] program break moved by {} bytes", ProgramBreak::current() as usize - before as usize);
  print_heap("5", &heap);

  unsafe {
    heap.release(big.as_ptr());
    heap.release(d.as_ptr());
  }
  print_heap("end", &heap);

  println!("\n[end] The arena is never shrunk; the OS reclaims it at exit.");
}

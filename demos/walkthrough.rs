use std::{env, io::Read, ptr::NonNull};

use tagalloc::Heap;

/// Waits until the user presses ENTER.
/// Useful when you want to follow the block list between steps, or inspect
/// the mapping with tools like `pmap` or `gdb`.
fn block_until_enter_pressed() {
  println!("\n>>> Press ENTER to continue...");
  let _ = std::io::stdin().bytes().next();
}

fn print_alloc(
  requested: usize,
  ptr: Option<NonNull<u8>>,
) {
  match ptr {
    Some(ptr) => println!("Allocated {} bytes, address = {:?}", requested, ptr),
    None => println!("Could not allocate {} bytes", requested),
  }
}

fn main() {
  env_logger::init();

  // Region size from the first argument, one page by default.
  let size = env::args()
    .nth(1)
    .and_then(|arg| arg.parse().ok())
    .unwrap_or(4096);

  let mut heap = Heap::new();

  if let Err(err) = heap.initialize(size) {
    eprintln!("initialize({}) failed: {}", size, err);
    std::process::exit(1);
  }

  println!(
    "PID = {}, region of {} bytes at {:?}",
    std::process::id(),
    heap.region_len(),
    heap.base()
  );
  println!("{}", heap.dump());
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 1) Allocate 20 bytes. The single free block is split in two.
  // --------------------------------------------------------------------
  let first = heap.allocate(20);
  println!("\n[1] Allocate 20 bytes");
  print_alloc(20, first);

  if let Some(ptr) = first {
    let value = ptr.cast::<u32>();
    unsafe { value.write(0xDEADBEEF) };
    println!("[1] Value written = 0x{:X}", unsafe { value.read() });
  }

  println!("{}", heap.dump());
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 2) Allocate 30 bytes right after it.
  // --------------------------------------------------------------------
  let second = heap.allocate(30);
  println!("\n[2] Allocate 30 bytes");
  print_alloc(30, second);

  if let Some(ptr) = second {
    unsafe { ptr.as_ptr().write_bytes(0xAB, 30) };
    println!("[2] Initialized second block with 0xAB");
  }

  println!("{}", heap.dump());
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 3) Free the first block. Its neighbour is busy, so it stays a
  //    separate free block and the second block's "Prev" turns Free.
  // --------------------------------------------------------------------
  if let Some(ptr) = first {
    match heap.free(ptr.as_ptr()) {
      Ok(()) => println!("\n[3] Freed first block at {:?}", ptr),
      Err(err) => println!("\n[3] free failed: {}", err),
    }

    // A second free is rejected, not ignored.
    if let Err(err) = heap.free(ptr.as_ptr()) {
      println!("[3] Freeing it again: {}", err);
    }
  }

  println!("{}", heap.dump());
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 4) Allocate 20 bytes again: best fit picks the hole left by step 3
  //    over the large free tail.
  // --------------------------------------------------------------------
  let third = heap.allocate(20);
  println!("\n[4] Allocate 20 bytes (check reuse of freed block)");
  print_alloc(20, third);

  println!(
    "[4] third == first? {}",
    if third == first {
      "Yes, it reused the freed block"
    } else {
      "No, it allocated somewhere else"
    }
  );

  println!("{}", heap.dump());
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 5) Free everything. The blocks merge back into one free block.
  // --------------------------------------------------------------------
  for ptr in [second, third].into_iter().flatten() {
    if let Err(err) = heap.free(ptr.as_ptr()) {
      println!("free({:?}) failed: {}", ptr, err);
    }
  }

  println!("\n[5] Freed all blocks");
  println!("{}", heap.dump());

  match heap.check() {
    Ok(()) => println!("[5] Block chain is consistent"),
    Err(err) => println!("[5] Block chain is broken: {}", err),
  }

  println!("\n[6] End of example. Process will exit and the OS will reclaim the region.");
}

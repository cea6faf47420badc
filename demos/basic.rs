//! Walks through the life of a heap: a fresh region, reuse of a freed block,
//! a multi page request, and regions going back to the OS once empty.
//!
//! `RUST_LOG=trace cargo run --example basic` shows what the allocator does.

use tagalloc::Heap;

fn log_alloc(heap: &Heap, size: usize, addr: *mut u8) {
    println!("Requested {size} bytes of memory");
    println!("Received this address: {addr:?}");
    println!("{:?}\n", heap.stats());
}

fn main() {
    env_logger::init();

    let mut heap = Heap::new();
    heap.init().expect("init never fails");

    unsafe {
        let a = heap.alloc(100);
        log_alloc(&heap, 100, a);

        let b = heap.alloc(200);
        log_alloc(&heap, 200, b);

        heap.free(a);
        println!("Freed {a:?}\n");

        let c = heap.alloc(50);
        log_alloc(&heap, 50, c);

        if c == a {
            println!("Correctly reused at {c:?}\n");
        } else {
            println!("Not reused. A was at {a:?} and C is at {c:?}\n");
        }

        let big = heap.alloc(3 * 4096);
        log_alloc(&heap, 3 * 4096, big);

        heap.free(big);
        heap.free(b);
        heap.free(c);
    }

    heap.check().expect("heap metadata is consistent");
    println!("After freeing everything: {:?}", heap.stats());
}

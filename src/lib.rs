//! # tagalloc
//!
//! A user-space dynamic memory allocator built on top of a page granularity
//! region primitive (`mmap`/`munmap` on unix, `VirtualAlloc`/`VirtualFree`
//! on windows).
//!
//! ```text
//!                                      Free List
//!
//!                     Next free block                Next free block
//!                +---------------------+  +--------------------------------------+
//!                |                     |  |                                      |
//! +--------------|---------------------|--|----+      +--------------------------|-------------------+
//! |        | +---|--+    +------+    +-|--|-+  |      |        | +-------+    +--|---+    +-------+  |
//! | Region | | Free | -> | Used | -> | Free |  | ---> | Region | | Used  | -> | Free | -> | Used  |  |
//! |        | +------+    +------+    +------+  |      |        | +-------+    +------+    +-------+  |
//! +--------------------------------------------+      +----------------------------------------------+
//! ```
//!
//! * Every region starts with a small header linking it into the region list.
//! * Blocks tile the rest of the region. Each block carries a boundary tag at
//!   both ends, so its neighbours can be reached from either side.
//! * Free blocks are linked through their own payloads into a single free
//!   list that is searched first-fit.
//! * Freeing a block merges it with free neighbours. When a region ends up
//!   being a single free block, the region is given back to the OS.
//!
//! The allocator is single threaded. All state lives in a [`Heap`] value, so
//! sharing it between threads means wrapping the whole heap in a lock.
//!
//! ```rust
//! use tagalloc::Heap;
//!
//! let mut heap = Heap::new();
//! heap.init().unwrap();
//!
//! let ptr = heap.alloc(100);
//! assert!(!ptr.is_null());
//!
//! unsafe {
//!     ptr.write_bytes(0x2A, 100);
//!     heap.free(ptr);
//! }
//! ```

mod block;
mod check;
pub mod error;
mod freelist;
mod kernel;
mod list;
mod region;
mod utils;

#[cfg(test)]
mod testing;

use std::ptr::{self, NonNull};

use block::{BlockRef, TAG_SIZE, block_size_for};
use kernel::Kernel;

pub use check::HeapStats;
pub use error::{Corruption, HeapError, Result};
pub use kernel::{PlatformMemory, SystemMemory};

/// Every pointer handed out by the allocator is a multiple of this.
pub const ALIGNMENT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Uninitialized,
    Ready,
    /// Corrupted metadata was found. Every call fails until `init`.
    Poisoned,
}

/// The allocator. Owns every region it maps and lends payloads to callers
/// between [`Heap::alloc`] and [`Heap::free`].
pub struct Heap<P: PlatformMemory = SystemMemory> {
    kernel: Kernel<P>,
    state: State,
}

impl Heap<SystemMemory> {
    /// Creates a heap on top of the operating system. Call [`Heap::init`]
    /// before using it.
    pub fn new() -> Self {
        Self::with_platform(SystemMemory::new())
    }
}

impl Default for Heap<SystemMemory> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: PlatformMemory> Heap<P> {
    /// Creates a heap that gets its regions from `platform`.
    pub fn with_platform(platform: P) -> Self {
        Self {
            kernel: Kernel::new(platform),
            state: State::Uninitialized,
        }
    }

    /// Resets the heap to empty and makes it ready for use. Regions still
    /// mapped from an earlier session are returned first, so every pointer
    /// handed out before becomes invalid. Calling it twice in a row is the
    /// same as calling it once.
    pub fn init(&mut self) -> Result<()> {
        self.kernel.release_all();
        self.state = State::Ready;

        log::debug!("heap initialised");

        Ok(())
    }

    #[inline]
    fn ensure_ready(&self) -> Result<()> {
        match self.state {
            State::Ready => Ok(()),
            State::Uninitialized => Err(HeapError::Uninitialized),
            State::Poisoned => Err(HeapError::Poisoned),
        }
    }

    /// Poisons the heap if `result` reports corruption.
    fn poison_on_corruption<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(HeapError::Corrupted(corruption)) = &result {
            log::error!("heap poisoned: {}", corruption);
            self.state = State::Poisoned;
        }

        result
    }

    /// Allocates at least `size` bytes aligned to [`ALIGNMENT`].
    ///
    /// Returns `Ok(None)` for `size == 0` without touching the heap, and
    /// [`HeapError::OutOfMemory`] if a new region was needed and the region
    /// primitive refused it.
    pub fn try_alloc(&mut self, size: usize) -> Result<Option<NonNull<u8>>> {
        let result = self.alloc_block(size);

        self.poison_on_corruption(result)
    }

    fn alloc_block(&mut self, size: usize) -> Result<Option<NonNull<u8>>> {
        self.ensure_ready()?;

        if size == 0 {
            return Ok(None);
        }

        let needed = block_size_for(size).ok_or(HeapError::OutOfMemory { bytes: size })?;

        if let Some(block) = self.kernel.free_list.find_first_fit(needed) {
            self.kernel.free_list.remove(block);
            unsafe { self.kernel.split(block, needed) };

            log::trace!(
                "alloc({}) -> {:p} (reused {:#x})",
                size,
                block.payload(),
                block.addr()
            );

            return Ok(Some(block.payload()));
        }

        let block = self.kernel.carve(needed)?;

        log::trace!("alloc({}) -> {:p} (fresh region)", size, block.payload());

        Ok(Some(block.payload()))
    }

    /// Allocates at least `size` bytes aligned to [`ALIGNMENT`]. Returns null
    /// for `size == 0` or when the system is out of memory.
    ///
    /// # Panics
    ///
    /// If the heap is not initialised, poisoned, or its metadata is found corrupted.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        match self.try_alloc(size) {
            Ok(ptr) => ptr.map_or(ptr::null_mut(), NonNull::as_ptr),
            Err(HeapError::OutOfMemory { .. }) => ptr::null_mut(),
            Err(err) => panic!("alloc({size}): {err}"),
        }
    }

    /// Gives the block behind `ptr` back to the heap. Null is a no-op.
    ///
    /// Corrupted tags around the block, or a pointer outside every live
    /// region, are reported as [`HeapError::Corrupted`]. After that the heap
    /// is poisoned and every call returns [`HeapError::Poisoned`] until
    /// [`Heap::init`].
    ///
    /// # Safety
    ///
    /// `ptr` must be null or come from [`Heap::alloc`]/[`Heap::try_alloc`] on
    /// this heap, and must not have been freed since. Not everything that
    /// breaks this is detected.
    pub unsafe fn try_free(&mut self, ptr: *mut u8) -> Result<()> {
        let result = unsafe { self.free_block(ptr) };

        self.poison_on_corruption(result)
    }

    unsafe fn free_block(&mut self, ptr: *mut u8) -> Result<()> {
        if ptr.is_null() {
            return Ok(());
        }

        self.ensure_ready()?;

        let address = ptr as usize;
        let header = address.wrapping_sub(TAG_SIZE);
        let region = self
            .kernel
            .locate_region(header)
            .ok_or(Corruption::UnknownAddress { address })?;

        let block = BlockRef::new(region, header - region.as_ptr() as usize);
        let tag = block.read_tags()?;

        unsafe { block.write(tag.size, false) };

        log::trace!("free({:p}) block {:#x} ({} bytes)", ptr, block.addr(), tag.size);

        self.kernel.coalesce(block)?;

        Ok(())
    }

    /// Gives the block behind `ptr` back to the heap. Null is a no-op.
    ///
    /// # Safety
    ///
    /// Same contract as [`Heap::try_free`].
    ///
    /// # Panics
    ///
    /// If the heap is not initialised, poisoned, or its metadata is found corrupted.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if let Err(err) = unsafe { self.try_free(ptr) } {
            panic!("free({ptr:p}): {err}");
        }
    }

    /// Walks every region and the free list, validating all metadata.
    /// Does not poison the heap, it only reports.
    pub fn check(&self) -> Result<()> {
        self.kernel.check().map_err(HeapError::from)
    }

    /// Counts of live regions and blocks.
    pub fn stats(&self) -> HeapStats {
        self.kernel.stats()
    }

    /// The region primitive this heap maps memory from.
    pub fn platform(&self) -> &P {
        &self.kernel.platform
    }

    /// Mutable access to the region primitive, e.g. to reconfigure it.
    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.kernel.platform
    }
}

impl<P: PlatformMemory> Drop for Heap<P> {
    fn drop(&mut self) {
        self.kernel.release_all();
    }
}

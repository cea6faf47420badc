//! Region primitive used by the unit tests. Hands out page aligned memory from
//! the host allocator, counts map/unmap calls, checks every unmap matches a
//! map exactly and that nothing is left mapped, and can be told to start failing.

use std::{alloc::Layout, ptr::NonNull};

use crate::kernel::PlatformMemory;

pub(crate) struct MockMemory {
    page_size: usize,
    maps: usize,
    unmaps: usize,
    /// Mappings not returned yet, as `(address, len)`.
    live: Vec<(usize, usize)>,
    /// Number of successful maps before every request fails.
    fail_after: Option<usize>,
}

impl MockMemory {
    pub fn new() -> Self {
        Self::with_page_size(4096)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            page_size,
            maps: 0,
            unmaps: 0,
            live: Vec::new(),
            fail_after: None,
        }
    }

    pub fn fail_after(mut self, maps: usize) -> Self {
        self.fail_after = Some(maps);
        self
    }

    pub fn set_fail_after(&mut self, maps: Option<usize>) {
        self.fail_after = maps;
    }

    pub fn maps(&self) -> usize {
        self.maps
    }

    pub fn unmaps(&self) -> usize {
        self.unmaps
    }

    pub fn live(&self) -> usize {
        self.live.len()
    }

    pub fn live_bytes(&self) -> usize {
        self.live.iter().map(|&(_, len)| len).sum()
    }
}

impl PlatformMemory for MockMemory {
    fn request_memory(&mut self, len: usize) -> Option<NonNull<u8>> {
        assert_eq!(len % self.page_size, 0, "mapping of {len} bytes is not page sized");

        if self.fail_after.is_some_and(|limit| self.maps >= limit) {
            return None;
        }

        let layout = Layout::from_size_align(len, self.page_size).ok()?;
        let addr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })?;

        self.maps += 1;
        self.live.push((addr.as_ptr() as usize, len));

        Some(addr)
    }

    unsafe fn return_memory(&mut self, addr: NonNull<u8>, len: usize) {
        let index = self
            .live
            .iter()
            .position(|&mapping| mapping == (addr.as_ptr() as usize, len))
            .unwrap_or_else(|| panic!("unmap of {addr:p} ({len} bytes) matches no mapping"));

        self.live.swap_remove(index);
        self.unmaps += 1;

        unsafe {
            std::alloc::dealloc(
                addr.as_ptr(),
                Layout::from_size_align_unchecked(len, self.page_size),
            );
        }
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}

impl Drop for MockMemory {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            assert!(self.live.is_empty(), "{} mappings never unmapped", self.live.len());
        }

        for &(addr, len) in &self.live {
            unsafe {
                std::alloc::dealloc(
                    addr as *mut u8,
                    Layout::from_size_align_unchecked(len, self.page_size),
                );
            }
        }
    }
}

/// Sends allocator logs to the test output, `RUST_LOG=trace cargo test` to see them.
pub(crate) fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

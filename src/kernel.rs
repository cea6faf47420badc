use std::{ptr::NonNull, sync::atomic::AtomicUsize};

use crate::{freelist::FreeList, list::List, region::Region};

/// This trait provides an abstraction over the low level memory requests.
/// The allocator, our top level view of this, has nothing to do with the
/// concrete implementations / APIs offered by each kernel.
///
/// Every length handed to an implementation is a multiple of [`PlatformMemory::page_size`].
pub trait PlatformMemory {
    /// Request a memory region of size `len`. It returns a pointer to the
    /// given location or `None` if the underlying primitive fails. The memory
    /// must be readable, writable, and aligned at least to the page size.
    fn request_memory(&mut self, len: usize) -> Option<NonNull<u8>>;

    /// Returns the memory of size `len` starting from `addr` back to the kernel.
    ///
    /// # Safety
    ///
    /// `addr` and `len` must match exactly one earlier [`PlatformMemory::request_memory`]
    /// call and nothing may touch that memory afterwards.
    unsafe fn return_memory(&mut self, addr: NonNull<u8>, len: usize);

    /// Returns the virtual memory page size of the computer in bytes.
    fn page_size(&self) -> usize;
}

/// Virtual memory page size of the computer. This is usually 4096. It is
/// queried once from the OS and cached, since we can't know it at compile time.
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Region primitive backed by the operating system: `mmap`/`munmap` on unix,
/// `VirtualAlloc`/`VirtualFree` on windows.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemory;

impl SystemMemory {
    pub const fn new() -> Self {
        Self
    }
}

#[cfg(unix)]
mod unix {
    use super::{PAGE_SIZE, PlatformMemory, SystemMemory};

    use libc::{mmap, munmap, off_t, size_t};

    use std::{
        os::raw::{c_int, c_void},
        ptr::NonNull,
        sync::atomic::Ordering,
    };

    impl PlatformMemory for SystemMemory {
        fn request_memory(&mut self, len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                match mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET) {
                    libc::MAP_FAILED => None,
                    addr => NonNull::new(addr.cast::<u8>()),
                }
            }
        }

        unsafe fn return_memory(&mut self, addr: NonNull<u8>, len: usize) {
            let status = unsafe { munmap(addr.as_ptr().cast::<c_void>(), len as size_t) };

            if status != 0 {
                log::warn!("munmap({:p}, {}) failed", addr, len);
            }
        }

        fn page_size(&self) -> usize {
            match PAGE_SIZE.load(Ordering::Relaxed) {
                0 => {
                    let size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize };
                    PAGE_SIZE.store(size, Ordering::Relaxed);
                    size
                }
                size => size,
            }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{mem::MaybeUninit, os::raw::c_void, ptr::NonNull, sync::atomic::Ordering};

    use super::{PAGE_SIZE, PlatformMemory, SystemMemory};

    use windows::Win32::System::{Memory, SystemInformation};

    impl PlatformMemory for SystemMemory {
        fn request_memory(&mut self, len: usize) -> Option<NonNull<u8>> {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, protection);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn return_memory(&mut self, addr: NonNull<u8>, len: usize) {
            let released =
                unsafe { Memory::VirtualFree(addr.as_ptr().cast::<c_void>(), 0, Memory::MEM_RELEASE) };

            if released.is_err() {
                log::warn!("VirtualFree({:p}, {}) failed", addr, len);
            }
        }

        fn page_size(&self) -> usize {
            match PAGE_SIZE.load(Ordering::Relaxed) {
                0 => {
                    let size = unsafe {
                        let mut system_info = MaybeUninit::uninit();
                        SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                        system_info.assume_init().dwPageSize as usize
                    };
                    PAGE_SIZE.store(size, Ordering::Relaxed);
                    size
                }
                size => size,
            }
        }
    }
}

/// The internal state of the allocator. Here is where we keep the region
/// list, the free list and the primitive we get our memory from.
pub(crate) struct Kernel<P> {
    /// Linked list of live memory [`Region`], most recently mapped first.
    pub regions: List<Region>,
    /// Linked list of free blocks, most recently freed first.
    pub free_list: FreeList,
    /// Where whole regions come from and go back to.
    pub platform: P,
}

impl<P: PlatformMemory> Kernel<P> {
    /// Creates an empty `Kernel`: no regions mapped and nothing free.
    pub(crate) fn new(platform: P) -> Self {
        Self {
            regions: List::new(),
            free_list: FreeList::new(),
            platform,
        }
    }

    /// Returns every live region to the primitive and forgets all blocks.
    /// Any pointer previously handed out becomes dangling.
    pub(crate) fn release_all(&mut self) {
        let mut current = self.regions.first();

        self.free_list.clear();
        self.regions.clear();

        while let Some(node) = current {
            unsafe {
                current = node.as_ref().next;

                let size = node.as_ref().data.size;
                log::debug!("unmapping region {:p} ({} bytes) on reset", node, size);
                self.platform.return_memory(node.cast(), size);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_page_size_is_power_of_two() {
        let size = SystemMemory.page_size();

        assert!(size.is_power_of_two());
        assert_eq!(size, SystemMemory.page_size());
    }

    #[test]
    fn system_memory_roundtrip() {
        let mut memory = SystemMemory::new();
        let len = memory.page_size() * 2;

        let addr = memory.request_memory(len).expect("mmap failed");
        assert_eq!(addr.as_ptr() as usize % memory.page_size(), 0);

        unsafe {
            addr.as_ptr().write_bytes(0xAB, len);
            assert_eq!(*addr.as_ptr().add(len - 1), 0xAB);
            memory.return_memory(addr, len);
        }
    }
}

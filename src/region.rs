use std::{mem, ops::Range, ptr::NonNull};

use crate::{
    ALIGNMENT,
    error::{HeapError, Result},
    kernel::{Kernel, PlatformMemory},
    list::Node,
    utils::{align, checked_align},
};

/// This is the overhead introduced by the [`Region`] header in bytes, rounded
/// up so that the first block header after it stays aligned. The header is
/// represented as a [`Node`], see [`crate::list::List`] for more detail.
pub(crate) const REGION_HEADER_SIZE: usize = align(mem::size_of::<Node<Region>>(), ALIGNMENT);

/// Pointer to a region header, which is also the start of the mapped bytes.
pub(crate) type RegionPtr = NonNull<Node<Region>>;

/// Metadata of one chunk we got from the region primitive. It is stored at
/// the very start of the mapped bytes, blocks are laid out right after it.
///
/// The region primitive gives us memory aligned with the page size, but we
/// can't assume two regions are adjacent. Therefore we keep a list of regions
/// and never let a block traversal leave the region it started in.
///
/// ```text
/// +-----------------------------------------------+      +-----------------------------------------------+
/// |        | +-------+    +-------+    +-------+  |      |        | +-------+    +-------+    +-------+  |
/// | Region | | Block | -> | Block | -> | Block |  | ---> | Region | | Block | -> | Block | -> | Block |  |
/// |        | +-------+    +-------+    +-------+  |      |        | +-------+    +-------+    +-------+  |
/// +-----------------------------------------------+      +-----------------------------------------------+
/// ```
pub(crate) struct Region {
    /// Total length of the mapping, region header included.
    pub size: usize,
}

impl Region {
    /// Byte offsets, relative to the region start, that blocks may occupy.
    #[inline]
    pub fn payload(&self) -> Range<usize> {
        REGION_HEADER_SIZE..self.size
    }
}

/// Address range `[start, end)` of the whole mapping behind `region`.
#[inline]
pub(crate) fn bounds(region: RegionPtr) -> (usize, usize) {
    let start = region.as_ptr() as usize;
    let size = unsafe { region.as_ref().data.size };

    (start, start + size)
}

impl<P: PlatformMemory> Kernel<P> {
    /// Maps a new region able to hold at least `min_bytes` (region header
    /// included) and pushes it to the front of the region list.
    ///
    /// The length is rounded up to a whole number of pages. The only way this
    /// fails is the primitive refusing the mapping.
    pub(crate) fn acquire_region(&mut self, min_bytes: usize) -> Result<RegionPtr> {
        let page_size = self.platform.page_size();
        let size = checked_align(min_bytes, page_size)
            .ok_or(HeapError::OutOfMemory { bytes: min_bytes })?;

        let Some(addr) = self.platform.request_memory(size) else {
            log::warn!("region primitive refused to map {} bytes", size);
            return Err(HeapError::OutOfMemory { bytes: size });
        };

        let region = unsafe { self.regions.push_front(Region { size }, addr) };

        log::debug!(
            "mapped region {:p} ({} bytes, {} live)",
            region,
            size,
            self.regions.len()
        );

        Ok(region)
    }

    /// Finds the live region whose payload contains `address`.
    pub(crate) fn locate_region(&self, address: usize) -> Option<RegionPtr> {
        self.regions.iter().find(|&region| {
            let (start, end) = bounds(region);

            (start + REGION_HEADER_SIZE..end).contains(&address)
        })
    }

    /// Unlinks `region` and gives its bytes back to the primitive.
    ///
    /// **SAFETY**: `region` must be live and its whole payload must be a single
    /// free block that is no longer on the free list.
    pub(crate) unsafe fn release_region(&mut self, region: RegionPtr) {
        unsafe {
            let size = region.as_ref().data.size;

            self.regions.remove(region);
            self.platform.return_memory(region.cast(), size);

            log::debug!(
                "unmapped region {:p} ({} bytes, {} live)",
                region,
                size,
                self.regions.len()
            );
        }
    }
}

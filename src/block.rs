use std::{mem, ptr::NonNull};

use crate::{
    ALIGNMENT,
    error::{Corruption, HeapError, Result},
    kernel::{Kernel, PlatformMemory},
    list::Node,
    region::{REGION_HEADER_SIZE, RegionPtr, bounds},
    utils::{align, checked_align},
};

/// Written into every tag so that reading garbage instead of a tag gets noticed.
pub(crate) const TAG_MAGIC: u32 = 0xF00D_F00D;

/// Size of a boundary tag. Header and footer share the same layout.
pub(crate) const TAG_SIZE: usize = align(mem::size_of::<Tag>(), ALIGNMENT);

/// A free block keeps its free list [`Node`] in the payload, so no block can
/// have a smaller payload than that.
pub(crate) const MIN_PAYLOAD: usize = align(mem::size_of::<Node<BlockRef>>(), ALIGNMENT);

/// Smallest block we ever create, either when carving or when splitting.
pub(crate) const MIN_BLOCK_SIZE: usize = TAG_SIZE + MIN_PAYLOAD + TAG_SIZE;

/// Boundary tag. One sits at the start of every block (header) and an
/// identical copy sits at its end (footer):
///
/// ```text
/// +---------------------+ <------+
/// |        size         |        |
/// +---------------------+        | -> Header
/// |  allocated | magic  |        |
/// +---------------------+ <------+ <--- pointer handed to the user
/// |       Content       |        |
/// |         ...         |        | -> Payload (free list node while free)
/// |         ...         |        |
/// +---------------------+ <------+
/// |        size         |        |
/// +---------------------+        | -> Footer
/// |  allocated | magic  |        |
/// +---------------------+ <------+
/// ```
///
/// `size` always counts the whole block, both tags included. Since the
/// footer of a block sits right before the header of the next one, we can
/// walk to either neighbour without any extra index.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tag {
    pub size: usize,
    pub allocated: u32,
    pub magic: u32,
}

impl Tag {
    #[inline]
    pub fn new(size: usize, allocated: bool) -> Self {
        Self {
            size,
            allocated: allocated as u32,
            magic: TAG_MAGIC,
        }
    }

    #[inline]
    pub fn is_allocated(&self) -> bool {
        self.allocated != 0
    }
}

/// Handle to a block: the region it lives in plus the offset of its header
/// from the region start. Every bounds check is an offset comparison against
/// the owning region, so a traversal can't wander into another mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockRef {
    pub region: RegionPtr,
    pub offset: usize,
}

/// Total block size needed to hand out `size` usable bytes, or `None` if
/// that doesn't fit in the address space.
pub(crate) fn block_size_for(size: usize) -> Option<usize> {
    let payload = checked_align(size, ALIGNMENT)?.max(MIN_PAYLOAD);

    payload.checked_add(2 * TAG_SIZE)
}

impl BlockRef {
    #[inline]
    pub fn new(region: RegionPtr, offset: usize) -> Self {
        Self { region, offset }
    }

    /// Address of the block header.
    #[inline]
    pub fn addr(self) -> usize {
        self.region.as_ptr() as usize + self.offset
    }

    #[inline]
    fn at(self, offset: usize) -> *mut u8 {
        unsafe { self.region.as_ptr().cast::<u8>().add(offset) }
    }

    /// Pointer to the first usable byte, which is what the user gets.
    #[inline]
    pub fn payload(self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.at(self.offset + TAG_SIZE)) }
    }

    #[inline]
    fn region_size(self) -> usize {
        unsafe { self.region.as_ref().data.size }
    }

    fn bad_tag(self, offset: usize) -> Corruption {
        let (start, end) = bounds(self.region);

        Corruption::BadTag {
            address: start + offset,
            start,
            end,
        }
    }

    /// Reads the tag stored at `offset`, checking it is a tag at all.
    ///
    /// **SAFETY**: `offset + TAG_SIZE` must be inside the region.
    unsafe fn tag_at(self, offset: usize) -> std::result::Result<Tag, Corruption> {
        let tag = unsafe { self.at(offset).cast::<Tag>().read() };

        if tag.magic != TAG_MAGIC {
            return Err(self.bad_tag(offset));
        }

        Ok(tag)
    }

    /// Header of the block without any validation. Only for blocks our own
    /// bookkeeping points at, like free list entries.
    #[inline]
    pub unsafe fn header(self) -> Tag {
        unsafe { self.at(self.offset).cast::<Tag>().read() }
    }

    /// Reads and validates both tags of this block: magic words, a sane size
    /// that stays inside the region, and a footer that mirrors the header.
    pub fn read_tags(self) -> std::result::Result<Tag, Corruption> {
        let (start, end) = bounds(self.region);
        let payload = REGION_HEADER_SIZE..self.region_size();

        if !payload.contains(&self.offset)
            || self.offset % ALIGNMENT != 0
            || payload.end - self.offset < TAG_SIZE
        {
            return Err(self.bad_tag(self.offset));
        }

        let header = unsafe { self.tag_at(self.offset)? };

        if header.size < MIN_BLOCK_SIZE
            || header.size % ALIGNMENT != 0
            || header.size > payload.end - self.offset
        {
            return Err(Corruption::Overrun {
                address: self.addr(),
                size: header.size,
                start,
                end,
            });
        }

        let footer = unsafe { self.tag_at(self.offset + header.size - TAG_SIZE)? };

        if footer != header {
            return Err(Corruption::TagMismatch {
                address: self.addr(),
                header: header.size,
                footer: footer.size,
            });
        }

        Ok(header)
    }

    /// Writes header and footer for a block of `size` bytes starting here.
    ///
    /// **SAFETY**: `[offset, offset + size)` must be inside the region payload
    /// and not overlap a block someone else is using.
    pub unsafe fn write(self, size: usize, allocated: bool) {
        let tag = Tag::new(size, allocated);

        unsafe {
            self.at(self.offset).cast::<Tag>().write(tag);
            self.at(self.offset + size - TAG_SIZE).cast::<Tag>().write(tag);
        }
    }

    /// The block physically before this one in the same region, if any.
    ///
    /// Its footer sits right before our header. There is none when our header
    /// is the first thing in the region payload. Otherwise the footer size must
    /// lead back to a header that is still inside the payload and agrees with it.
    pub fn neighbor_before(self) -> std::result::Result<Option<(BlockRef, Tag)>, Corruption> {
        if self.offset < REGION_HEADER_SIZE + TAG_SIZE {
            return Ok(None);
        }

        let footer_offset = self.offset - TAG_SIZE;
        let footer = unsafe { self.tag_at(footer_offset)? };

        let prev_offset = self
            .offset
            .checked_sub(footer.size)
            .filter(|&offset| offset >= REGION_HEADER_SIZE)
            .ok_or_else(|| {
                let (start, end) = bounds(self.region);
                Corruption::Overrun {
                    address: start + footer_offset,
                    size: footer.size,
                    start,
                    end,
                }
            })?;

        let prev = BlockRef::new(self.region, prev_offset);
        let tag = prev.read_tags()?;

        if tag.size != footer.size {
            return Err(Corruption::TagMismatch {
                address: prev.addr(),
                header: tag.size,
                footer: footer.size,
            });
        }

        Ok(Some((prev, tag)))
    }

    /// The block physically after this one (of `size` bytes) in the same
    /// region, if any. There is none when we end exactly at the region end.
    pub fn neighbor_after(
        self,
        size: usize,
    ) -> std::result::Result<Option<(BlockRef, Tag)>, Corruption> {
        let end = self.region_size();
        let next_offset = self.offset + size;

        if next_offset > end {
            let (start, end) = bounds(self.region);
            return Err(Corruption::Overrun {
                address: self.addr(),
                size,
                start,
                end,
            });
        }

        if next_offset == end {
            return Ok(None);
        }

        let next = BlockRef::new(self.region, next_offset);
        let tag = next.read_tags()?;

        Ok(Some((next, tag)))
    }

    /// Whether this block of `size` bytes covers its region's whole payload.
    #[inline]
    pub fn spans_region(self, size: usize) -> bool {
        self.offset == REGION_HEADER_SIZE && self.offset + size == self.region_size()
    }
}

impl<P: PlatformMemory> Kernel<P> {
    /// Marks `block` (already off the free list) as allocated with room for
    /// `needed` bytes. If what is left after `needed` can still be a block on
    /// its own, it is cut off and goes back to the free list. Otherwise the
    /// whole block is handed out, so we never create unusable fragments.
    ///
    /// **SAFETY**: `block` must be a valid free block not on the free list,
    /// at least `needed` bytes long.
    pub(crate) unsafe fn split(&mut self, block: BlockRef, needed: usize) {
        let size = unsafe { block.header().size };
        let remaining = size - needed;

        unsafe {
            if remaining >= MIN_BLOCK_SIZE {
                block.write(needed, true);

                let rest = BlockRef::new(block.region, block.offset + needed);
                rest.write(remaining, false);
                self.free_list.insert(rest);

                log::trace!(
                    "split block {:#x}: {} allocated, {} free at {:#x}",
                    block.addr(),
                    needed,
                    remaining,
                    rest.addr()
                );
            } else {
                block.write(size, true);
            }
        }
    }

    /// Lays out a fresh region: an allocated block of `needed` bytes at the
    /// start of the payload, and a free block with whatever is left. If the
    /// leftover is too small to be a block the allocated one absorbs it, so
    /// blocks always tile the payload exactly.
    pub(crate) fn carve(&mut self, needed: usize) -> Result<BlockRef> {
        let min_bytes = needed
            .checked_add(REGION_HEADER_SIZE)
            .ok_or(HeapError::OutOfMemory { bytes: needed })?;

        let region = self.acquire_region(min_bytes)?;
        let payload = unsafe { region.as_ref().data.payload() };
        let block = BlockRef::new(region, payload.start);
        let remaining = payload.len() - needed;

        unsafe {
            if remaining >= MIN_BLOCK_SIZE {
                block.write(needed, true);

                let rest = BlockRef::new(region, payload.start + needed);
                rest.write(remaining, false);
                self.free_list.insert(rest);
            } else {
                block.write(payload.len(), true);
            }
        }

        log::trace!(
            "carved block {:#x} ({} bytes) from fresh region {:p}",
            block.addr(),
            needed,
            region
        );

        Ok(block)
    }

    /// Merges the freshly freed `block` (tags already say free, not on the
    /// free list yet) with whichever neighbours are free, then puts the result
    /// on the free list. If the result covers its whole region, the region is
    /// unmapped instead.
    pub(crate) fn coalesce(&mut self, block: BlockRef) -> std::result::Result<(), Corruption> {
        let size = block.read_tags()?.size;

        let before = block.neighbor_before()?.filter(|(_, tag)| !tag.is_allocated());
        let after = block.neighbor_after(size)?.filter(|(_, tag)| !tag.is_allocated());

        let mut merged = block;
        let mut merged_size = size;

        if let Some((prev, tag)) = before {
            self.free_list.remove(prev);
            merged = prev;
            merged_size += tag.size;
        }

        if let Some((next, tag)) = after {
            self.free_list.remove(next);
            merged_size += tag.size;
        }

        unsafe { merged.write(merged_size, false) };

        log::trace!(
            "coalesced {:#x} into free block {:#x} ({} bytes, prev merged: {}, next merged: {})",
            block.addr(),
            merged.addr(),
            merged_size,
            before.is_some(),
            after.is_some()
        );

        if merged.spans_region(merged_size) {
            unsafe { self.release_region(merged.region) };
        } else {
            self.free_list.insert(merged);
        }

        Ok(())
    }
}

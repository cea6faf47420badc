//! Heap consistency checker and live statistics.

use crate::{
    block::{BlockRef, Tag},
    error::Corruption,
    kernel::{Kernel, PlatformMemory},
    region::{REGION_HEADER_SIZE, RegionPtr},
};

/// Snapshot of what the allocator currently holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Regions currently mapped.
    pub regions: usize,
    /// Bytes currently mapped, region headers included.
    pub mapped_bytes: usize,
    /// Blocks currently lent to callers.
    pub allocated_blocks: usize,
    /// Blocks on the free list.
    pub free_blocks: usize,
    /// Bytes in free blocks, tags included.
    pub free_bytes: usize,
}

/// Walks the blocks of one region in address order, validating each one.
/// Stops after the first error.
pub(crate) struct Blocks {
    region: RegionPtr,
    offset: usize,
    end: usize,
}

impl Blocks {
    pub fn new(region: RegionPtr) -> Self {
        Self {
            region,
            offset: REGION_HEADER_SIZE,
            end: unsafe { region.as_ref().data.size },
        }
    }
}

impl Iterator for Blocks {
    type Item = Result<(BlockRef, Tag), Corruption>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.end {
            return None;
        }

        let block = BlockRef::new(self.region, self.offset);

        match block.read_tags() {
            Ok(tag) => {
                self.offset += tag.size;
                Some(Ok((block, tag)))
            }
            Err(err) => {
                self.offset = self.end;
                Some(Err(err))
            }
        }
    }
}

impl<P: PlatformMemory> Kernel<P> {
    /// Checks every invariant we can observe: all tags valid, blocks tiling
    /// each region payload exactly, no two free blocks next to each other,
    /// and the free list holding exactly the free blocks.
    pub(crate) fn check(&self) -> Result<(), Corruption> {
        let mut free_blocks = 0;

        for region in &self.regions {
            let mut prev_free: Option<BlockRef> = None;

            for entry in Blocks::new(region) {
                let (block, tag) = entry?;

                if tag.is_allocated() {
                    prev_free = None;
                    continue;
                }

                if let Some(prev) = prev_free {
                    return Err(Corruption::AdjacentFree {
                        first: prev.addr(),
                        second: block.addr(),
                    });
                }

                free_blocks += 1;
                prev_free = Some(block);
            }
        }

        let mut linked = 0;

        for block in self.free_list.iter() {
            let owner = self
                .locate_region(block.addr())
                .ok_or(Corruption::UnknownAddress { address: block.addr() })?;

            if owner != block.region || block.read_tags()?.is_allocated() {
                return Err(Corruption::FreeListMismatch {
                    expected: free_blocks,
                    found: self.free_list.len(),
                });
            }

            linked += 1;
        }

        if linked != free_blocks {
            return Err(Corruption::FreeListMismatch {
                expected: free_blocks,
                found: linked,
            });
        }

        Ok(())
    }

    /// Counts regions and blocks. Regions that fail validation are only
    /// counted up to the first bad block, see [`Kernel::check`] for the error.
    pub(crate) fn stats(&self) -> HeapStats {
        let mut stats = HeapStats::default();

        for region in &self.regions {
            stats.regions += 1;
            stats.mapped_bytes += unsafe { region.as_ref().data.size };

            for (_, tag) in Blocks::new(region).map_while(Result::ok) {
                if tag.is_allocated() {
                    stats.allocated_blocks += 1;
                } else {
                    stats.free_blocks += 1;
                    stats.free_bytes += tag.size;
                }
            }
        }

        stats
    }
}

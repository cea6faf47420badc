use std::ptr::NonNull;

use crate::{
    block::BlockRef,
    list::{List, Node},
};

/// Linked list to keep track of free blocks.
///
/// We use the payload of every free block as storage for its list node. As
/// the block is free, nobody else is looking at its payload, so the list
/// costs us no memory at all:
///
/// ```text
/// +------------------------+ <--------+
/// |          Tag           |          | -> Header
/// +------------------------+ <--------+
/// |   Node<BlockRef>:      |          |
/// |    - next free         |          |
/// |    - prev free         |          | -> Free payload
/// |    - this block        |          |
/// |          ...           |          |
/// +------------------------+ <--------+
/// |          Tag           |          | -> Footer
/// +------------------------+ <--------+
/// ```
///
/// Since the node of a block always sits at its payload address, removing a
/// block never needs a search. The node is only meaningful while the block
/// is free: the moment it is handed out the user overwrites it, which is why
/// a block must be taken off this list before its tags say "allocated".
///
/// New entries go to the front, so the most recently freed block is found first.
pub(crate) struct FreeList {
    items: List<BlockRef>,
}

impl FreeList {
    /// Creates a new empty list.
    pub const fn new() -> Self {
        Self { items: List::new() }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[inline]
    fn node_of(block: BlockRef) -> NonNull<Node<BlockRef>> {
        block.payload().cast()
    }

    /// Pushes `block` to the front of the list. O(1).
    pub fn insert(&mut self, block: BlockRef) {
        debug_assert!(!unsafe { block.header() }.is_allocated());

        unsafe {
            self.items.push_front(block, block.payload());
        }
    }

    /// Unlinks `block` using the links stored in its own payload. O(1).
    pub fn remove(&mut self, block: BlockRef) {
        let node = Self::node_of(block);
        debug_assert_eq!(unsafe { node.as_ref().data }, block);

        unsafe {
            self.items.remove(node);
        }
    }

    /// Returns the first block on the list that is at least `needed` bytes
    /// long, both tags included. First-fit: O(n) in the number of free blocks.
    pub fn find_first_fit(&self, needed: usize) -> Option<BlockRef> {
        if self.is_empty() {
            return None;
        }

        self.iter().find(|block| unsafe { block.header() }.size >= needed)
    }

    pub fn iter(&self) -> impl Iterator<Item = BlockRef> + '_ {
        self.items.iter().map(|node| unsafe { node.as_ref().data })
    }

    /// Forgets every entry.
    pub fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        block::{MIN_BLOCK_SIZE, TAG_SIZE},
        kernel::Kernel,
        region::REGION_HEADER_SIZE,
        testing::MockMemory,
    };

    /// Lays out free blocks of the given sizes back to back in a fresh region.
    /// They are not coalesced, which is fine for list-level tests.
    fn free_blocks(kernel: &mut Kernel<MockMemory>, sizes: &[usize]) -> Vec<BlockRef> {
        let region = kernel.acquire_region(4096).unwrap();
        let mut offset = REGION_HEADER_SIZE;

        sizes
            .iter()
            .map(|&size| {
                let block = BlockRef::new(region, offset);
                unsafe { block.write(size, false) };
                offset += size;
                block
            })
            .collect()
    }

    #[test]
    fn new_list_is_empty() {
        let list = FreeList::new();

        assert!(list.is_empty());
        assert_eq!(list.find_first_fit(MIN_BLOCK_SIZE), None);
    }

    #[test]
    fn node_lives_in_payload() {
        let mut kernel = Kernel::new(MockMemory::new());
        let blocks = free_blocks(&mut kernel, &[64]);
        let mut list = FreeList::new();

        list.insert(blocks[0]);

        let node = FreeList::node_of(blocks[0]);
        assert_eq!(node.as_ptr() as usize, blocks[0].addr() + TAG_SIZE);
        assert_eq!(unsafe { node.as_ref().data }, blocks[0]);

        list.clear();
        kernel.release_all();
    }

    #[test]
    fn most_recent_first_and_first_fit() {
        let mut kernel = Kernel::new(MockMemory::new());
        let blocks = free_blocks(&mut kernel, &[64, 256, 128, 256]);
        let mut list = FreeList::new();

        for &block in &blocks {
            list.insert(block);
        }

        assert_eq!(
            list.iter().collect::<Vec<_>>(),
            vec![blocks[3], blocks[2], blocks[1], blocks[0]]
        );
        // First fit, not best fit: the 256 byte block at the front wins over the 128 one.
        assert_eq!(list.find_first_fit(100), Some(blocks[3]));
        assert_eq!(list.find_first_fit(64), Some(blocks[3]));
        assert_eq!(list.find_first_fit(257), None);

        list.remove(blocks[3]);
        assert_eq!(list.find_first_fit(100), Some(blocks[2]));

        list.remove(blocks[1]);
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![blocks[2], blocks[0]]);
        assert_eq!(list.find_first_fit(129), None);

        list.remove(blocks[0]);
        list.remove(blocks[2]);
        assert!(list.is_empty());

        kernel.release_all();
    }
}

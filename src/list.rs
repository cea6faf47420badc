use std::{marker::PhantomData, ptr::NonNull};

/// Non-null pointer to `T`.
pub(crate) type Link<T> = Option<NonNull<T>>;

#[repr(C)]
pub(crate) struct Node<T> {
    /// Pointer to the next node of the list
    pub next: Link<Self>,
    /// Pointer to the previous node of the list
    pub prev: Link<Self>,
    /// Element of the node
    pub data: T,
}

/// Intrusive doubly linked list. The list never owns the memory of its nodes:
/// every node is written at an address the allocator hands in, which lives
/// inside memory we got from the region primitive.
pub(crate) struct List<T> {
    head: Link<Node<T>>,
    len: usize,
    marker: PhantomData<T>,
}

pub(crate) struct Iter<'a, T> {
    current: Link<Node<T>>,
    remaining: usize,
    marker: PhantomData<&'a T>,
}

impl<T> List<T> {
    pub const fn new() -> Self {
        Self {
            head: None,
            len: 0,
            marker: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn first(&self) -> Link<Node<T>> {
        self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pushes a new node to the front of the list.
    ///
    /// Because we are the actual memory allocator, this method can not make
    /// allocations itself. It receives the `addr` where the node has to be
    /// written, so the node ends up inside our own data structures.
    ///
    /// **SAFETY**: Caller must guarantee that `addr` is valid for writes of a
    /// `Node<T>`, suitably aligned, and not part of any other live node.
    pub unsafe fn push_front(&mut self, data: T, addr: NonNull<u8>) -> NonNull<Node<T>> {
        let node = addr.cast::<Node<T>>();

        unsafe {
            node.as_ptr().write(Node {
                next: self.head,
                prev: None,
                data,
            });

            if let Some(mut head) = self.head {
                head.as_mut().prev = Some(node);
            }
        }

        self.head = Some(node);
        self.len += 1;

        node
    }

    /// Unlinks `node` in O(1) using its own links.
    ///
    /// **SAFETY**: `node` must currently be linked into this list.
    pub unsafe fn remove(&mut self, node: NonNull<Node<T>>) {
        unsafe {
            let next = (*node.as_ptr()).next;
            let prev = (*node.as_ptr()).prev;

            match prev {
                Some(mut prev) => prev.as_mut().next = next,
                None => self.head = next,
            }

            if let Some(mut next) = next {
                next.as_mut().prev = prev;
            }

            (*node.as_ptr()).next = None;
            (*node.as_ptr()).prev = None;
        }

        self.len -= 1;
    }

    /// Forgets every node without touching their memory.
    pub fn clear(&mut self) {
        self.head = None;
        self.len = 0;
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            current: self.head,
            remaining: self.len,
            marker: PhantomData,
        }
    }
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = NonNull<Node<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.current?;

        unsafe {
            self.current = node.as_ref().next;
        }
        self.remaining -= 1;

        Some(node)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a, T> IntoIterator for &'a List<T> {
    type Item = NonNull<Node<T>>;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::MaybeUninit;

    fn slot(storage: &mut [MaybeUninit<Node<u32>>], index: usize) -> NonNull<u8> {
        NonNull::from(&mut storage[index]).cast()
    }

    fn values(list: &List<u32>) -> Vec<u32> {
        list.iter().map(|node| unsafe { node.as_ref().data }).collect()
    }

    #[test]
    fn new_list_is_empty() {
        let list: List<u8> = List::new();

        assert_eq!(list.len(), 0);
        assert!(list.is_empty());
        assert!(list.iter().next().is_none());
    }

    #[test]
    fn push_front_is_lifo() {
        let mut storage = [const { MaybeUninit::<Node<u32>>::uninit() }; 3];
        let mut list = List::new();

        unsafe {
            for i in 0..3 {
                list.push_front(i as u32, slot(&mut storage, i));
            }
        }

        assert_eq!(list.len(), 3);
        assert_eq!(values(&list), vec![2, 1, 0]);
    }

    #[test]
    fn remove_head_middle_and_tail() {
        let mut storage = [const { MaybeUninit::<Node<u32>>::uninit() }; 4];
        let mut list = List::new();
        let mut nodes = Vec::new();

        unsafe {
            for i in 0..4 {
                nodes.push(list.push_front(i as u32, slot(&mut storage, i)));
            }

            // head
            list.remove(nodes[3]);
            assert_eq!(values(&list), vec![2, 1, 0]);
            assert_eq!(list.first(), Some(nodes[2]));
            assert_eq!(nodes[2].as_ref().prev, None);

            // middle
            list.remove(nodes[1]);
            assert_eq!(values(&list), vec![2, 0]);
            assert_eq!(nodes[0].as_ref().prev, Some(nodes[2]));

            // tail
            list.remove(nodes[0]);
            assert_eq!(values(&list), vec![2]);

            list.remove(nodes[2]);
        }

        assert!(list.is_empty());
        assert!(list.first().is_none());
    }
}

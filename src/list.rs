//! Doubly linked free lists over an index-addressed link table.
//!
//! Every block in the region owns one [`FreeLink`] in a table supplied by the
//! caller. Lists store only the global indices of their head and tail; the
//! links themselves hold the indices of a block's neighbours. No block memory
//! is touched, so the managed region need not even be mapped.

use core::{fmt, mem};

/// Link value meaning "no neighbour".
pub const NIL: u32 = u32::MAX;

/// The forward and backward links of one block.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FreeLink {
    prev: u32,
    next: u32,
}

impl FreeLink {
    /// The state of a block that is not linked to any neighbour.
    pub const DETACHED: FreeLink = FreeLink {
        prev: NIL,
        next: NIL,
    };

    /// Returns `true` if neither link points anywhere.
    ///
    /// This holds for removed blocks and for the only member of a list.
    #[inline]
    pub fn is_detached(self) -> bool {
        self == FreeLink::DETACHED
    }
}

/// A table of `FreeLink`s, one per block, backed by caller-supplied memory.
pub struct LinkTable {
    len: usize,
    map: *mut FreeLink,
}

impl LinkTable {
    /// Constructs a table of `len` detached links, backed by `map`.
    ///
    /// # Safety
    ///
    /// Behavior is undefined if any of the following conditions are violated:
    /// - `map` must be valid for reads and writes for `len *
    ///   mem::size_of::<FreeLink>()` many bytes, and it must be properly
    ///   aligned.
    /// - No other reference to that memory may exist while the table does.
    pub unsafe fn new(len: usize, map: *mut FreeLink) -> LinkTable {
        assert!(!map.is_null());
        assert!(map.align_offset(mem::align_of::<FreeLink>()) == 0);

        for i in 0..len {
            unsafe { map.add(i).write(FreeLink::DETACHED) };
        }

        LinkTable { len, map }
    }

    #[inline]
    pub fn get(&self, node: u32) -> FreeLink {
        let i = node as usize;
        assert!(i < self.len);

        unsafe { self.map.add(i).read() }
    }

    #[inline]
    fn get_mut(&mut self, node: u32) -> &mut FreeLink {
        let i = node as usize;
        assert!(i < self.len);

        unsafe { &mut *self.map.add(i) }
    }

    #[inline]
    fn set_prev(&mut self, node: u32, prev: u32) {
        self.get_mut(node).prev = prev;
    }

    #[inline]
    fn set_next(&mut self, node: u32, next: u32) {
        self.get_mut(node).next = next;
    }
}

impl fmt::Debug for LinkTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkTable")
            .field("len", &self.len)
            .field("map", &self.map)
            .finish()
    }
}

/// A doubly linked list of blocks of one order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FreeList {
    head: u32,
    tail: u32,
    count: usize,
}

impl FreeList {
    pub const EMPTY: FreeList = FreeList {
        head: NIL,
        tail: NIL,
        count: 0,
    };

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn head(&self) -> Option<u32> {
        (self.head != NIL).then(|| self.head)
    }

    /// Links `node` in front of the current head.
    ///
    /// `node` must be detached.
    pub fn insert_head(&mut self, links: &mut LinkTable, node: u32) {
        debug_assert!(links.get(node).is_detached());

        match self.head() {
            Some(old_head) => {
                links.set_prev(old_head, node);
                links.set_next(node, old_head);
            }
            None => self.tail = node,
        }

        self.head = node;
        self.count += 1;
    }

    /// Links `node` behind the current tail.
    ///
    /// `node` must be detached.
    pub fn insert_tail(&mut self, links: &mut LinkTable, node: u32) {
        debug_assert!(links.get(node).is_detached());

        if self.tail == NIL {
            self.head = node;
        } else {
            links.set_next(self.tail, node);
            links.set_prev(node, self.tail);
        }

        self.tail = node;
        self.count += 1;
    }

    /// Links `node` directly behind `anchor`, which must be a member.
    ///
    /// `node` must be detached.
    pub fn insert_after(&mut self, links: &mut LinkTable, anchor: u32, node: u32) {
        debug_assert!(links.get(node).is_detached());
        debug_assert!(self.contains(links, anchor));

        let after = links.get(anchor).next;

        links.set_prev(node, anchor);
        links.set_next(node, after);
        links.set_next(anchor, node);

        if after == NIL {
            self.tail = node;
        } else {
            links.set_prev(after, node);
        }

        self.count += 1;
    }

    /// Unlinks `node`, which must be a member, and detaches it.
    pub fn remove(&mut self, links: &mut LinkTable, node: u32) {
        debug_assert!(self.contains(links, node));

        let FreeLink { prev, next } = links.get(node);

        if prev == NIL {
            self.head = next;
        } else {
            links.set_next(prev, next);
        }

        if next == NIL {
            self.tail = prev;
        } else {
            links.set_prev(next, prev);
        }

        *links.get_mut(node) = FreeLink::DETACHED;
        self.count -= 1;
    }

    /// Returns `true` if `node` is a member of this list.
    ///
    /// A node that is linked to a neighbour is a member of whichever list
    /// holds its neighbours, so this must only be asked of the list of the
    /// node's own order. A node with no neighbours is a member only if it is
    /// this list's sole element.
    pub fn contains(&self, links: &LinkTable, node: u32) -> bool {
        if !links.get(node).is_detached() {
            return true;
        }

        self.count == 1 && self.head == node && self.tail == node
    }

    /// Returns the `n`th member of the list, counting from the head.
    #[cfg(test)]
    pub fn nth(&self, links: &LinkTable, n: usize) -> Option<u32> {
        self.iter(links).nth(n)
    }

    /// Returns an iterator over the members of the list from head to tail.
    pub fn iter<'a>(&self, links: &'a LinkTable) -> Iter<'a> {
        Iter {
            links,
            cur: self.head,
        }
    }
}

/// An iterator over the members of a [`FreeList`].
pub struct Iter<'a> {
    links: &'a LinkTable,
    cur: u32,
}

impl Iterator for Iter<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.cur == NIL {
            return None;
        }

        let node = self.cur;
        self.cur = self.links.get(node).next;
        Some(node)
    }
}

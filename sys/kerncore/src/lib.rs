// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Allow std-y things to be used in test. Note that this attribute is a bit of a
// trap for the programmer, because rust-analyzer by default seems to build
// things with test set. This means it's easy to introduce code incompatible
// with no_std without your editor hassling you about it. Beware.
#![cfg_attr(not(test), no_std)]

//! Portable kernel queue structures.
//!
//! The kernel's ready queues, blocked list, and per-receiver sender queues
//! are all intrusive doubly-linked lists in spirit. Here they are modeled
//! without pointers: the task table is the arena, task slot indices are the
//! handles, and each queue domain keeps one [`Link`] per slot in a parallel
//! array. A [`Queue`] is just a head/tail pair of indices into that array.
//!
//! This keeps every operation O(1), keeps the borrow checker out of the
//! picture, and makes the whole thing testable on the host.

/// Sentinel index meaning "no slot."
const NIL: usize = usize::MAX;

/// Per-slot linkage for one queue domain.
///
/// A slot may be in at most one queue of a given domain at a time; whether
/// it currently is can be read back with [`Link::is_linked`]. Unlinked
/// links are restored to the detached state so that membership checks stay
/// truthful.
#[derive(Copy, Clone, Debug)]
pub struct Link {
    next: usize,
    prev: usize,
    /// Membership flag. The sole member of a queue has `next == prev ==
    /// NIL`, same as a detached link, so membership can't be inferred
    /// from the neighbor indices alone.
    in_queue: bool,
}

impl Link {
    /// A link belonging to no queue.
    pub const DETACHED: Link = Link {
        next: NIL,
        prev: NIL,
        in_queue: false,
    };

    /// Checks whether this slot is currently threaded into a queue.
    pub fn is_linked(&self) -> bool {
        self.in_queue
    }
}

impl Default for Link {
    fn default() -> Self {
        Self::DETACHED
    }
}

/// FIFO queue over a [`Link`] arena.
#[derive(Copy, Clone, Debug)]
pub struct Queue {
    head: usize,
    tail: usize,
}

impl Queue {
    pub const fn new() -> Self {
        Queue {
            head: NIL,
            tail: NIL,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head == NIL
    }

    /// Returns the oldest slot without dequeuing it.
    pub fn head(&self) -> Option<usize> {
        if self.head == NIL {
            None
        } else {
            Some(self.head)
        }
    }

    /// Returns the slot after `i` in queue order, for hand-rolled walks.
    /// Callers that unlink during a walk must fetch the successor before
    /// unlinking, the way the kernel's blocked-list sweeps do.
    pub fn next_after(links: &[Link], i: usize) -> Option<usize> {
        let n = links[i].next;
        if n == NIL {
            None
        } else {
            Some(n)
        }
    }

    /// Appends slot `i` at the tail.
    ///
    /// # Panics
    ///
    /// If `i` is already linked into a queue of this domain. Double
    /// insertion is a kernel invariant violation, not a recoverable
    /// condition; idempotent enqueue is layered above this by checking
    /// `is_linked` first.
    pub fn push_back(&mut self, links: &mut [Link], i: usize) {
        assert!(!links[i].is_linked(), "double-linked queue slot {i}");
        links[i].in_queue = true;
        links[i].next = NIL;
        links[i].prev = self.tail;
        if self.tail != NIL {
            links[self.tail].next = i;
        } else {
            self.head = i;
        }
        self.tail = i;
    }

    /// Removes and returns the oldest slot.
    pub fn pop_front(&mut self, links: &mut [Link]) -> Option<usize> {
        if self.head == NIL {
            return None;
        }
        let i = self.head;
        self.remove(links, i);
        Some(i)
    }

    /// Unlinks slot `i` from anywhere in the queue.
    ///
    /// # Panics
    ///
    /// If `i` is not actually linked.
    pub fn remove(&mut self, links: &mut [Link], i: usize) {
        assert!(links[i].is_linked(), "unlinking detached queue slot {i}");
        let Link { next, prev, .. } = links[i];
        if prev != NIL {
            links[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            links[next].prev = prev;
        } else {
            self.tail = prev;
        }
        links[i] = Link::DETACHED;
    }

    /// Counts queue members by walking. Only used for diagnostics and
    /// invariant checks, so the O(n) cost is fine.
    pub fn len(&self, links: &[Link]) -> usize {
        let mut n = 0;
        let mut cur = self.head;
        while cur != NIL {
            n += 1;
            cur = links[cur].next;
        }
        n
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

/// Bitmap over priority levels.
///
/// Bit `p` is set iff ready queue `p` is non-empty, so the scheduler can
/// find the most important non-empty level with one find-first-set per
/// word, independent of how many levels exist.
#[derive(Copy, Clone, Debug)]
pub struct PriorityMask<const WORDS: usize> {
    words: [u32; WORDS],
}

impl<const WORDS: usize> PriorityMask<WORDS> {
    pub const fn new() -> Self {
        PriorityMask { words: [0; WORDS] }
    }

    pub fn set(&mut self, bit: usize) {
        self.words[bit / 32] |= 1 << (bit % 32);
    }

    pub fn clear(&mut self, bit: usize) {
        self.words[bit / 32] &= !(1 << (bit % 32));
    }

    pub fn is_set(&self, bit: usize) -> bool {
        self.words[bit / 32] & (1 << (bit % 32)) != 0
    }

    /// Returns the lowest set bit, which for the scheduler is the highest
    /// non-empty priority.
    pub fn first_set(&self) -> Option<usize> {
        for (w, &word) in self.words.iter().enumerate() {
            if word != 0 {
                return Some(w * 32 + word.trailing_zeros() as usize);
            }
        }
        None
    }
}

impl<const WORDS: usize> Default for PriorityMask<WORDS> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena(n: usize) -> Vec<Link> {
        vec![Link::DETACHED; n]
    }

    #[test]
    fn queue_is_fifo() {
        let mut links = arena(8);
        let mut q = Queue::new();
        for i in [3, 1, 5] {
            q.push_back(&mut links, i);
        }
        assert_eq!(q.pop_front(&mut links), Some(3));
        assert_eq!(q.pop_front(&mut links), Some(1));
        assert_eq!(q.pop_front(&mut links), Some(5));
        assert_eq!(q.pop_front(&mut links), None);
        assert!(q.is_empty());
    }

    #[test]
    fn pop_detaches_links() {
        let mut links = arena(4);
        let mut q = Queue::new();
        q.push_back(&mut links, 2);
        assert!(links[2].is_linked());
        q.pop_front(&mut links);
        assert!(!links[2].is_linked());
        // Slot is reusable immediately.
        q.push_back(&mut links, 2);
        assert_eq!(q.head(), Some(2));
    }

    #[test]
    fn remove_from_middle_preserves_order() {
        let mut links = arena(8);
        let mut q = Queue::new();
        for i in 0..5 {
            q.push_back(&mut links, i);
        }
        q.remove(&mut links, 2);
        q.remove(&mut links, 0); // head
        q.remove(&mut links, 4); // tail
        assert_eq!(q.pop_front(&mut links), Some(1));
        assert_eq!(q.pop_front(&mut links), Some(3));
        assert!(q.is_empty());
    }

    #[test]
    fn len_walks_the_queue() {
        let mut links = arena(8);
        let mut q = Queue::new();
        assert_eq!(q.len(&links), 0);
        for i in 0..6 {
            q.push_back(&mut links, i);
        }
        assert_eq!(q.len(&links), 6);
        q.remove(&mut links, 3);
        assert_eq!(q.len(&links), 5);
    }

    #[test]
    fn walk_with_next_after() {
        let mut links = arena(8);
        let mut q = Queue::new();
        for i in [7, 0, 4] {
            q.push_back(&mut links, i);
        }
        let mut seen = vec![];
        let mut cur = q.head();
        while let Some(i) = cur {
            cur = Queue::next_after(&links, i);
            seen.push(i);
        }
        assert_eq!(seen, vec![7, 0, 4]);
    }

    #[test]
    #[should_panic(expected = "double-linked")]
    fn double_insert_is_a_bug() {
        let mut links = arena(4);
        let mut q = Queue::new();
        q.push_back(&mut links, 1);
        q.push_back(&mut links, 1);
    }

    #[test]
    #[should_panic(expected = "detached")]
    fn removing_unlinked_slot_is_a_bug() {
        let mut links = arena(4);
        let mut q = Queue::new();
        q.remove(&mut links, 1);
    }

    #[test]
    fn mask_finds_lowest_bit_across_words() {
        let mut m: PriorityMask<2> = PriorityMask::new();
        assert_eq!(m.first_set(), None);
        m.set(40);
        assert_eq!(m.first_set(), Some(40));
        m.set(7);
        assert_eq!(m.first_set(), Some(7));
        m.clear(7);
        assert_eq!(m.first_set(), Some(40));
        m.clear(40);
        assert_eq!(m.first_set(), None);
    }

    #[test]
    fn mask_set_clear_is_per_bit() {
        let mut m: PriorityMask<1> = PriorityMask::new();
        m.set(3);
        m.set(4);
        m.clear(3);
        assert!(!m.is_set(3));
        assert!(m.is_set(4));
    }
}

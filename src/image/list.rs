//! An ordered, arena-backed entry list with O(1) unlink and move-to-head.
//!
//! An ordered `Vec` can't satisfy the image's LRU promotion in O(1) (every
//! promotion would shift the vector), and a pointer-based intrusive list
//! would need `unsafe`. This is the third option named in the spec's own
//! design notes: a `Vec<Option<Slot>>` arena with a reusable free list and
//! explicit `prev`/`next` indices, giving O(1) unlink/push and full forward
//! iteration in safe Rust.
use crate::msec::MappedSection;

/// One entry in an image: a mapped section plus this image's residency bit.
#[derive(Clone, Debug)]
pub(crate) struct Entry {
    pub msec: MappedSection,
    pub mapped: bool,
}

struct Slot {
    entry: Entry,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Default)]
pub(crate) struct EntryList {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl EntryList {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn head(&self) -> Option<usize> {
        self.head
    }

    #[inline]
    pub fn next(&self, idx: usize) -> Option<usize> {
        self.slots[idx].as_ref().expect("dangling index").next
    }

    #[inline]
    pub fn get(&self, idx: usize) -> &Entry {
        &self.slots[idx].as_ref().expect("dangling index").entry
    }

    #[inline]
    pub fn get_mut(&mut self, idx: usize) -> &mut Entry {
        &mut self.slots[idx].as_mut().expect("dangling index").entry
    }

    /// All live indices, head to tail.
    pub fn indices(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.len);
        let mut cur = self.head;
        while let Some(idx) = cur {
            out.push(idx);
            cur = self.slots[idx].as_ref().unwrap().next;
        }
        out
    }

    /// Allocates a slot for `entry`, linked at the tail (the cold end).
    pub fn push_back(&mut self, entry: Entry) -> usize {
        let idx = self.alloc(entry);
        self.link_at_tail(idx);
        idx
    }

    fn alloc(&mut self, entry: Entry) -> usize {
        let slot = Slot { entry, prev: None, next: None };
        if let Some(idx) = self.free.pop() {
            self.slots[idx] = Some(slot);
            idx
        } else {
            self.slots.push(Some(slot));
            self.slots.len() - 1
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let slot = self.slots[idx].as_ref().expect("dangling index");
            (slot.prev, slot.next)
        };
        match prev {
            Some(p) => self.slots[p].as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }
        let slot = self.slots[idx].as_mut().expect("dangling index");
        slot.prev = None;
        slot.next = None;
        self.len -= 1;
    }

    fn link_at_tail(&mut self, idx: usize) {
        match self.tail {
            Some(t) => {
                self.slots[t].as_mut().unwrap().next = Some(idx);
                self.slots[idx].as_mut().unwrap().prev = Some(t);
            }
            None => {
                self.head = Some(idx);
            }
        }
        self.tail = Some(idx);
        self.len += 1;
    }

    fn link_at_head(&mut self, idx: usize) {
        match self.head {
            Some(h) => {
                self.slots[h].as_mut().unwrap().prev = Some(idx);
                self.slots[idx].as_mut().unwrap().next = Some(h);
            }
            None => {
                self.tail = Some(idx);
            }
        }
        self.head = Some(idx);
        self.len += 1;
    }

    /// Moves `idx` to the head of the list (LRU promotion). A no-op if it's
    /// already there.
    pub fn move_to_front(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.link_at_head(idx);
    }

    /// Detaches and returns the entry at `idx`, freeing its slot for reuse.
    pub fn remove(&mut self, idx: usize) -> Entry {
        self.unlink(idx);
        let slot = self.slots[idx].take().expect("dangling index");
        self.free.push(idx);
        slot.entry
    }
}
